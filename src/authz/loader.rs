use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;

use crate::authz::engine::PolicyEngine;
use crate::authz::errors::AuthzError;
use crate::authz::hierarchy::HierarchyDefinition;
use crate::authz::policy::{parse_kdl_document, ParsedPolicy};
use crate::authz::rules::Rule;

/// Validated policy configuration ready to install into an engine.
#[derive(Debug, Default, Clone)]
pub struct PolicyBundle {
    /// Replaces the default hierarchy when present.
    pub default_hierarchy: Option<HierarchyDefinition>,
    pub hierarchies: HashMap<String, HierarchyDefinition>,
    pub rules: Vec<Rule>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReloadSummary {
    pub tenants: usize,
    pub rules: usize,
    pub replaced_default_hierarchy: bool,
}

impl From<&PolicyBundle> for ReloadSummary {
    fn from(bundle: &PolicyBundle) -> Self {
        Self {
            tenants: bundle.hierarchies.len(),
            rules: bundle.rules.len(),
            replaced_default_hierarchy: bundle.default_hierarchy.is_some(),
        }
    }
}

/// Load all `.kdl` policy files from the given directory, in file name
/// order, and compile them into one bundle.
pub fn load_policies(dir: &Path, default_tenant: &str) -> Result<PolicyBundle, AuthzError> {
    if !dir.is_dir() {
        return Err(AuthzError::InvalidPolicy(format!(
            "policies directory `{}` does not exist or is not a directory",
            dir.display()
        )));
    }

    let mut all_parsed = Vec::new();

    let mut entries: Vec<_> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.path()
                .extension()
                .map(|ext| ext == "kdl")
                .unwrap_or(false)
        })
        .collect();
    entries.sort_by_key(|e| e.path());

    for entry in &entries {
        let path = entry.path();
        let contents =
            std::fs::read_to_string(&path).map_err(|source| AuthzError::PolicyLoadError {
                path: path.display().to_string(),
                source,
            })?;
        let parsed = parse_kdl_document(&contents).map_err(|e| match e {
            AuthzError::KdlParse(msg) => AuthzError::KdlParse(format!("{}: {msg}", path.display())),
            other => other,
        })?;
        all_parsed.push(parsed);
    }

    let bundle = compile_policies(all_parsed, default_tenant)?;

    tracing::info!(
        files = entries.len(),
        tenants = bundle.hierarchies.len(),
        default_hierarchy = bundle.default_hierarchy.is_some(),
        rules = bundle.rules.len(),
        "Loaded authorization policies"
    );

    Ok(bundle)
}

/// Merge parsed documents. Later documents override earlier role entries of
/// the same tenant; rule ids must be unique across all documents.
pub fn compile_policies(
    parsed: Vec<ParsedPolicy>,
    default_tenant: &str,
) -> Result<PolicyBundle, AuthzError> {
    let mut hierarchies: HashMap<String, HierarchyDefinition> = HashMap::new();
    let mut rules: Vec<Rule> = Vec::new();

    for p in parsed {
        for (tenant, definition) in p.hierarchies {
            let merged = hierarchies.entry(tenant).or_default();
            for role in definition.roles() {
                merged.insert(role.clone(), definition.inherits_of(role).to_vec());
            }
        }
        rules.extend(p.rules);
    }

    validate_rules(&rules)?;

    for (tenant, definition) in &hierarchies {
        if let Some((from, to)) = definition.find_cycle() {
            tracing::warn!(
                tenant = %tenant,
                %from,
                %to,
                "cyclic role inheritance; roles on the cycle grant each other"
            );
        }
    }

    let known_roles: HashSet<&String> = hierarchies
        .values()
        .flat_map(|d| d.roles().chain(d.roles().flat_map(|r| d.inherits_of(r))))
        .collect();
    for rule in &rules {
        for role in rule.roles.iter().filter(|r| !known_roles.contains(r)) {
            tracing::debug!(rule = %rule.id, role = %role, "rule names a role no loaded hierarchy declares");
        }
    }

    let default_hierarchy = hierarchies.remove(default_tenant);
    Ok(PolicyBundle {
        default_hierarchy,
        hierarchies,
        rules,
    })
}

fn validate_rules(rules: &[Rule]) -> Result<(), AuthzError> {
    let mut seen = HashSet::new();
    for rule in rules {
        if rule.id.trim().is_empty() {
            return Err(AuthzError::InvalidPolicy("rule id is empty".into()));
        }
        if !seen.insert(rule.id.as_str()) {
            return Err(AuthzError::InvalidPolicy(format!(
                "duplicate rule id `{}`",
                rule.id
            )));
        }
        if rule.resources.is_empty() {
            return Err(AuthzError::InvalidPolicy(format!(
                "rule `{}` lists no resources",
                rule.id
            )));
        }
        if rule.actions.is_empty() {
            return Err(AuthzError::InvalidPolicy(format!(
                "rule `{}` lists no actions",
                rule.id
            )));
        }
    }
    Ok(())
}

/// [`load_policies`] on the blocking pool, bounded by `timeout`.
pub async fn load_policies_with_timeout(
    dir: PathBuf,
    default_tenant: String,
    timeout: Duration,
) -> Result<PolicyBundle, AuthzError> {
    let task = tokio::task::spawn_blocking(move || load_policies(&dir, &default_tenant));
    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join)) => Err(AuthzError::InvalidPolicy(format!(
            "policy loading task failed: {join}"
        ))),
        Err(_) => Err(AuthzError::LoadTimeout(timeout)),
    }
}

/// Load the directory and install it into `engine`. On failure the engine
/// keeps its current configuration.
pub async fn reload(
    engine: &PolicyEngine,
    dir: &Path,
    timeout: Duration,
) -> Result<ReloadSummary, AuthzError> {
    let default_tenant = engine.default_tenant();
    let bundle = match load_policies_with_timeout(dir.to_path_buf(), default_tenant, timeout).await
    {
        Ok(bundle) => bundle,
        Err(e) => {
            engine.metrics().record_error(e.kind());
            tracing::error!(error = %e, dir = %dir.display(), "policy reload failed; keeping current policies");
            return Err(e);
        }
    };
    let summary = ReloadSummary::from(&bundle);
    engine.apply_bundle(bundle);
    Ok(summary)
}
