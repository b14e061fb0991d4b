//! Per-tenant role inheritance.
//!
//! A [`HierarchyDefinition`] maps a role to the roles it inherits from.
//! [`RoleHierarchy`] holds one definition per tenant plus a default. It is a
//! plain value; the engine publishes it together with the rule set as one
//! snapshot.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

/// role -> roles it inherits from
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HierarchyDefinition(BTreeMap<String, Vec<String>>);

impl HierarchyDefinition {
    pub fn new() -> Self {
        Self::default()
    }

    /// `role` inherits every permission of `inherits`.
    pub fn with(mut self, role: impl Into<String>, inherits: &[&str]) -> Self {
        self.insert(role, inherits.iter().map(|s| s.to_string()).collect());
        self
    }

    pub fn insert(&mut self, role: impl Into<String>, inherits: Vec<String>) {
        self.0.insert(role.into(), inherits);
    }

    pub fn inherits_of(&self, role: &str) -> &[String] {
        self.0.get(role).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn roles(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The linear chain used when no tenant hierarchy is configured.
    pub fn builtin_default() -> Self {
        Self::new()
            .with("SUPER_ADMIN", &["ADMIN"])
            .with("ADMIN", &["OWNER"])
            .with("OWNER", &["MANAGER"])
            .with("MANAGER", &["USER"])
            .with("USER", &["VIEWER"])
    }

    /// Returns one inheritance edge that closes a cycle, if any.
    pub fn find_cycle(&self) -> Option<(String, String)> {
        let mut visited = HashSet::new();
        let mut in_stack = HashSet::new();
        for name in self.0.keys() {
            if !visited.contains(name.as_str()) {
                if let Some(edge) = self.dfs_cycle(name, &mut visited, &mut in_stack) {
                    return Some(edge);
                }
            }
        }
        None
    }

    fn dfs_cycle<'a>(
        &'a self,
        name: &'a str,
        visited: &mut HashSet<&'a str>,
        in_stack: &mut HashSet<&'a str>,
    ) -> Option<(String, String)> {
        visited.insert(name);
        in_stack.insert(name);
        for parent in self.inherits_of(name) {
            if in_stack.contains(parent.as_str()) {
                return Some((name.to_string(), parent.clone()));
            }
            if !visited.contains(parent.as_str()) {
                if let Some(edge) = self.dfs_cycle(parent, visited, in_stack) {
                    return Some(edge);
                }
            }
        }
        in_stack.remove(name);
        None
    }

    /// Depth-first closure over inherits edges. A role already in the
    /// result is never expanded twice, which also terminates cycles.
    pub fn flatten<'a, I>(&self, roles: I) -> BTreeSet<String>
    where
        I: IntoIterator<Item = &'a String>,
    {
        let mut result = BTreeSet::new();
        let mut stack: Vec<&str> = Vec::new();
        for role in roles {
            stack.push(role.as_str());
            while let Some(current) = stack.pop() {
                if !result.insert(current.to_string()) {
                    continue;
                }
                for parent in self.inherits_of(current).iter().rev() {
                    if !result.contains(parent) {
                        stack.push(parent.as_str());
                    }
                }
            }
        }
        result
    }
}

/// What to do for a tenant that has no hierarchy of its own.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnknownTenant {
    /// Use the default hierarchy.
    #[default]
    Fallback,
    /// Expand nothing: only the declared roles count.
    Strict,
}

/// One definition per tenant plus the default. Cloning is cheap: each
/// definition sits behind an `Arc`.
#[derive(Debug, Clone)]
pub struct RoleHierarchy {
    default: Arc<HierarchyDefinition>,
    tenants: HashMap<String, Arc<HierarchyDefinition>>,
    default_tenant: String,
    unknown_tenant: UnknownTenant,
}

impl Default for RoleHierarchy {
    fn default() -> Self {
        Self::new("default", UnknownTenant::Fallback)
    }
}

impl RoleHierarchy {
    pub fn new(default_tenant: impl Into<String>, unknown_tenant: UnknownTenant) -> Self {
        Self {
            default: Arc::new(HierarchyDefinition::builtin_default()),
            tenants: HashMap::new(),
            default_tenant: default_tenant.into(),
            unknown_tenant,
        }
    }

    pub fn default_tenant(&self) -> &str {
        &self.default_tenant
    }

    pub fn unknown_tenant(&self) -> UnknownTenant {
        self.unknown_tenant
    }

    /// Replace a tenant's hierarchy. Setting it for the default tenant id
    /// replaces the default hierarchy.
    pub fn set_hierarchy(&mut self, tenant_id: &str, definition: HierarchyDefinition) {
        if let Some((from, to)) = definition.find_cycle() {
            tracing::warn!(
                tenant = tenant_id,
                %from,
                %to,
                "role hierarchy contains a cycle; flattening will stop at revisited roles"
            );
        }
        let definition = Arc::new(definition);
        if tenant_id == self.default_tenant {
            self.default = definition;
        } else {
            self.tenants.insert(tenant_id.to_string(), definition);
        }
        tracing::debug!(tenant = tenant_id, "role hierarchy replaced");
    }

    pub fn set_default_hierarchy(&mut self, definition: HierarchyDefinition) {
        let tenant = self.default_tenant.clone();
        self.set_hierarchy(&tenant, definition);
    }

    /// Replace every hierarchy at once. Tenants absent from `tenants` are
    /// dropped and a missing `default` restores the built-in chain.
    pub fn replace_all(
        &mut self,
        default: Option<HierarchyDefinition>,
        tenants: HashMap<String, HierarchyDefinition>,
    ) {
        self.default = Arc::new(default.unwrap_or_else(HierarchyDefinition::builtin_default));
        self.tenants = tenants
            .into_iter()
            .map(|(k, v)| (k, Arc::new(v)))
            .collect();
    }

    pub fn get_hierarchy(&self, tenant_id: &str) -> Arc<HierarchyDefinition> {
        if tenant_id == self.default_tenant {
            return self.default.clone();
        }
        if let Some(def) = self.tenants.get(tenant_id) {
            return def.clone();
        }
        match self.unknown_tenant {
            UnknownTenant::Fallback => self.default.clone(),
            UnknownTenant::Strict => Arc::new(HierarchyDefinition::new()),
        }
    }

    pub fn is_configured(&self, tenant_id: &str) -> bool {
        tenant_id == self.default_tenant || self.tenants.contains_key(tenant_id)
    }

    pub fn flatten<'a, I>(&self, roles: I, tenant_id: &str) -> BTreeSet<String>
    where
        I: IntoIterator<Item = &'a String>,
    {
        if !self.is_configured(tenant_id) {
            tracing::debug!(
                tenant = tenant_id,
                policy = ?self.unknown_tenant,
                "no hierarchy configured for tenant"
            );
        }
        self.get_hierarchy(tenant_id).flatten(roles)
    }

    pub fn inherits(&self, role: &str, from_role: &str, tenant_id: &str) -> bool {
        let role = role.to_string();
        self.flatten([&role], tenant_id).contains(from_role)
    }

    /// Every role that lists `role` directly or transitively in its inherits.
    pub fn descendants(&self, role: &str, tenant_id: &str) -> BTreeSet<String> {
        let def = self.get_hierarchy(tenant_id);
        let mut children: HashMap<&str, Vec<&str>> = HashMap::new();
        for name in def.roles() {
            for parent in def.inherits_of(name) {
                children.entry(parent.as_str()).or_default().push(name.as_str());
            }
        }

        let mut result = BTreeSet::new();
        let mut stack = vec![role];
        while let Some(current) = stack.pop() {
            for child in children.get(current).into_iter().flatten() {
                if *child != role && result.insert(child.to_string()) {
                    stack.push(*child);
                }
            }
        }
        result
    }
}
