use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use serde_json::Value;
use uuid::Uuid;

use crate::authz::audit::{AuditEntry, AuditLogger};
use crate::authz::errors::AuthzError;
use crate::authz::hierarchy::{HierarchyDefinition, RoleHierarchy};
use crate::authz::loader::PolicyBundle;
use crate::authz::metrics::MetricsCollector;
use crate::authz::rules::Rule;
use crate::authz::types::{
    condition_context, validate_input, Decision, Effect, Principal, Resource,
};

pub const DEFAULT_TENANT_ATTRIBUTE: &str = "tenantId";

/// Hierarchies and rules published together. Every decision reads one
/// snapshot, so a reload is never observed half applied.
#[derive(Debug, Clone)]
pub struct PolicyConfig {
    pub hierarchy: RoleHierarchy,
    pub rules: Arc<Vec<Rule>>,
}

/// Decides whether a principal may perform an action on a resource.
///
/// Deny overrides allow: any matching deny rule produces DENY, otherwise any
/// matching allow rule produces ALLOW, otherwise the default is DENY. Every
/// completed decision is audited and counted; rejected input is counted only.
#[derive(Debug)]
pub struct PolicyEngine {
    config: RwLock<Arc<PolicyConfig>>,
    audit: Arc<AuditLogger>,
    metrics: Arc<MetricsCollector>,
    tenant_attribute: String,
}

impl PolicyEngine {
    pub fn new(
        hierarchy: RoleHierarchy,
        audit: Arc<AuditLogger>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            config: RwLock::new(Arc::new(PolicyConfig {
                hierarchy,
                rules: Arc::new(Vec::new()),
            })),
            audit,
            metrics,
            tenant_attribute: DEFAULT_TENANT_ATTRIBUTE.to_string(),
        }
    }

    pub fn with_rules(self, rules: Vec<Rule>) -> Self {
        self.replace_rules(rules);
        self
    }

    /// Principal attribute that names the tenant.
    pub fn with_tenant_attribute(mut self, attribute: impl Into<String>) -> Self {
        self.tenant_attribute = attribute.into();
        self
    }

    /// Snapshot of the active hierarchies and rules.
    pub fn config(&self) -> Arc<PolicyConfig> {
        self.config.read().clone()
    }

    pub fn default_tenant(&self) -> String {
        self.config.read().hierarchy.default_tenant().to_string()
    }

    pub fn audit(&self) -> &Arc<AuditLogger> {
        &self.audit
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn rules(&self) -> Arc<Vec<Rule>> {
        self.config().rules.clone()
    }

    pub fn replace_rules(&self, rules: Vec<Rule>) {
        let count = rules.len();
        let mut config = self.config.write();
        let next = PolicyConfig {
            hierarchy: config.hierarchy.clone(),
            rules: Arc::new(rules),
        };
        *config = Arc::new(next);
        tracing::debug!(rules = count, "rule set replaced");
    }

    /// Replace one tenant's hierarchy, keeping the rule set.
    pub fn set_hierarchy(&self, tenant_id: &str, definition: HierarchyDefinition) {
        let mut config = self.config.write();
        let mut next = PolicyConfig::clone(&config);
        next.hierarchy.set_hierarchy(tenant_id, definition);
        *config = Arc::new(next);
    }

    /// Install hierarchies and rules from a loaded bundle in a single swap.
    /// The bundle replaces everything: a bundle without a default hierarchy
    /// restores the built-in one.
    pub fn apply_bundle(&self, bundle: PolicyBundle) {
        let tenants = bundle.hierarchies.len();
        let rules = bundle.rules.len();
        let mut config = self.config.write();
        let mut hierarchy = RoleHierarchy::new(
            config.hierarchy.default_tenant(),
            config.hierarchy.unknown_tenant(),
        );
        hierarchy.replace_all(bundle.default_hierarchy, bundle.hierarchies);
        *config = Arc::new(PolicyConfig {
            hierarchy,
            rules: Arc::new(bundle.rules),
        });
        drop(config);
        tracing::info!(tenants, rules, "policy bundle applied");
    }

    /// Tenant named by the principal's tenant attribute, or the default tenant.
    pub fn tenant_of(&self, principal: &Principal) -> Result<String, AuthzError> {
        if !principal.attributes.contains_key(&self.tenant_attribute) {
            return Ok(self.default_tenant());
        }
        let tenant = principal.attributes.get_str(&self.tenant_attribute)?;
        if tenant.is_empty() {
            return Ok(self.default_tenant());
        }
        Ok(tenant.to_string())
    }

    pub fn evaluate(
        &self,
        principal: &Principal,
        resource: &Resource,
        action: &str,
    ) -> Result<Decision, AuthzError> {
        self.evaluate_with_context(principal, resource, action, &Value::Null)
    }

    /// `request` is exposed to conditions as `request.*`.
    pub fn evaluate_with_context(
        &self,
        principal: &Principal,
        resource: &Resource,
        action: &str,
        request: &Value,
    ) -> Result<Decision, AuthzError> {
        let started = Instant::now();
        let tenant = self.admit(principal, &resource.kind, action)?;

        let config = self.config();
        let derived_roles = config.hierarchy.flatten(&principal.roles, &tenant);
        let context =
            condition_context(principal, &derived_roles, &resource.kind, Some(resource), request);

        let mut allows = Vec::new();
        let mut denies = Vec::new();
        for rule in config
            .rules
            .iter()
            .filter(|r| r.applies_to(&resource.kind, action, &derived_roles))
        {
            if !rule.condition.matches(principal, resource, &context) {
                continue;
            }
            match rule.effect {
                Effect::Allow => allows.push(rule.id.clone()),
                Effect::Deny => denies.push(rule.id.clone()),
            }
        }

        let (effect, reason, matched_rules) = if !denies.is_empty() {
            (Effect::Deny, format!("denied by rule {}", quote_ids(&denies)), denies)
        } else if !allows.is_empty() {
            (Effect::Allow, format!("allowed by rule {}", quote_ids(&allows)), allows)
        } else {
            (
                Effect::Deny,
                format!(
                    "no matching allow rule for action `{action}` on `{}`",
                    resource.kind
                ),
                Vec::new(),
            )
        };
        let latency = started.elapsed();

        let decision = Decision {
            effect,
            reason,
            matched_rules,
            derived_roles,
            correlation_id: Uuid::new_v4().to_string(),
            latency_ms: latency.as_secs_f64() * 1000.0,
        };

        let (_, failed_sinks) = self.audit.log_with_failures(AuditEntry {
            correlation_id: decision.correlation_id.clone(),
            tenant_id: tenant,
            principal_id: principal.id.clone(),
            principal_roles: principal.roles.clone(),
            resource_kind: resource.kind.clone(),
            resource_id: resource.id.clone(),
            action: action.to_string(),
            effect,
            reason: decision.reason.clone(),
            matched_rules: decision.matched_rules.clone(),
        });
        for _ in 0..failed_sinks {
            self.metrics.record_error("audit_sink");
        }
        self.metrics.record_decision(effect, latency);

        tracing::debug!(
            correlation_id = %decision.correlation_id,
            principal = %principal.id,
            kind = %resource.kind,
            action,
            %effect,
            "decision"
        );
        Ok(decision)
    }

    /// One decision per action, in the order given; duplicates collapse.
    /// All inputs are validated before any action is evaluated.
    pub fn evaluate_multiple<S: AsRef<str>>(
        &self,
        principal: &Principal,
        resource: &Resource,
        actions: &[S],
    ) -> Result<BTreeMap<String, bool>, AuthzError> {
        for action in actions {
            self.admit(principal, &resource.kind, action.as_ref())?;
        }
        let mut results = BTreeMap::new();
        for action in actions {
            let action = action.as_ref();
            if results.contains_key(action) {
                continue;
            }
            let decision = self.evaluate(principal, resource, action)?;
            results.insert(action.to_string(), decision.allowed());
        }
        Ok(results)
    }

    /// Validate input and resolve the tenant, counting rejections.
    fn admit(
        &self,
        principal: &Principal,
        resource_kind: &str,
        action: &str,
    ) -> Result<String, AuthzError> {
        validate_input(principal, resource_kind, action)
            .and_then(|_| self.tenant_of(principal))
            .map_err(|e| {
                self.metrics.record_error(e.kind());
                tracing::debug!(error = %e, principal = %principal.id, "rejected authorization input");
                e
            })
    }
}

fn quote_ids(ids: &[String]) -> String {
    ids.iter()
        .map(|id| format!("`{id}`"))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::audit::{AuditRecord, AuditSink};
    use crate::authz::condition::Condition;
    use crate::authz::hierarchy::UnknownTenant;
    use crate::authz::rules::RuleCondition;
    use serde_json::json;

    fn make_engine(rules: Vec<Rule>) -> PolicyEngine {
        PolicyEngine::new(
            RoleHierarchy::default(),
            Arc::new(AuditLogger::new()),
            Arc::new(MetricsCollector::new().unwrap()),
        )
        .with_rules(rules)
    }

    fn crm_rules() -> Vec<Rule> {
        vec![
            Rule::allow("admin-all").roles(&["ADMIN"]),
            Rule::allow("lead-owner")
                .on(&["lead"])
                .actions(&["read", "update"])
                .roles(&["USER"])
                .when(RuleCondition::owner("ownerId")),
            Rule::allow("lead-view")
                .on(&["lead"])
                .actions(&["read"])
                .roles(&["VIEWER"])
                .when(RuleCondition::matches_principal("tenantId", "tenantId")),
            Rule::deny("archived-readonly")
                .on(&["lead"])
                .actions(&["update", "delete"])
                .when(RuleCondition::equals("archived", true)),
        ]
    }

    #[test]
    fn test_owner_allowed_and_stranger_denied() {
        let engine = make_engine(crm_rules());
        let owner = Principal::new("u1").with_role("USER");
        let lead = Resource::new("lead").with_id("l1").with_attr("ownerId", "u1");

        let d = engine.evaluate(&owner, &lead, "update").unwrap();
        assert!(d.allowed());
        assert_eq!(d.matched_rules, vec!["lead-owner"]);
        assert_eq!(d.reason, "allowed by rule `lead-owner`");
        assert!(d.derived_roles.contains("VIEWER"));

        let stranger = Principal::new("u2").with_role("USER");
        let d = engine.evaluate(&stranger, &lead, "update").unwrap();
        assert!(!d.allowed());
        assert!(d.matched_rules.is_empty());
        assert_eq!(d.reason, "no matching allow rule for action `update` on `lead`");
    }

    #[test]
    fn test_deny_overrides_allow() {
        let engine = make_engine(crm_rules());
        let admin = Principal::new("a1").with_role("ADMIN");
        let archived = Resource::new("lead").with_id("l9").with_attr("archived", true);

        assert!(engine.evaluate(&admin, &archived, "read").unwrap().allowed());
        let d = engine.evaluate(&admin, &archived, "delete").unwrap();
        assert_eq!(d.effect, Effect::Deny);
        assert_eq!(d.matched_rules, vec!["archived-readonly"]);
        assert_eq!(d.reason, "denied by rule `archived-readonly`");
    }

    #[test]
    fn test_inherited_role_reaches_rule() {
        let engine = make_engine(crm_rules());
        let super_admin = Principal::new("root").with_role("SUPER_ADMIN");
        let pipeline = Resource::new("pipeline").with_id("p1");
        assert!(engine.evaluate(&super_admin, &pipeline, "delete").unwrap().allowed());
    }

    #[test]
    fn test_every_decision_is_audited_and_counted() {
        let engine = make_engine(crm_rules());
        let p = Principal::new("u1").with_role("USER");
        let r = Resource::new("lead").with_id("l1").with_attr("ownerId", "u1");

        let allowed = engine.evaluate(&p, &r, "read").unwrap();
        let denied = engine.evaluate(&p, &r, "delete").unwrap();
        assert_ne!(allowed.correlation_id, denied.correlation_id);

        let records = engine.audit().for_principal("u1", 10);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].correlation_id, denied.correlation_id);
        assert_eq!(records[0].effect, Effect::Deny);
        assert_eq!(records[1].matched_rules, vec!["lead-owner"]);
        assert_eq!(records[1].tenant_id, "default");

        let snap = engine.metrics().snapshot();
        assert_eq!(snap.allowed, 1);
        assert_eq!(snap.denied, 1);
        assert_eq!(snap.latency.count, 2);
    }

    #[test]
    fn test_invalid_input_is_counted_not_audited() {
        let engine = make_engine(crm_rules());
        let r = Resource::new("lead");
        let err = engine.evaluate(&Principal::new(""), &r, "read").unwrap_err();
        assert!(matches!(err, AuthzError::InvalidInput(_)));
        assert!(engine.evaluate(&Principal::new("u1"), &r, " ").is_err());
        assert!(engine
            .evaluate(&Principal::new("u1"), &Resource::new(""), "read")
            .is_err());

        assert!(engine.audit().is_empty());
        let snap = engine.metrics().snapshot();
        assert_eq!(snap.decisions_total, 0);
        assert_eq!(snap.errors["invalid_input"], 3);
    }

    #[test]
    fn test_non_string_tenant_is_rejected() {
        let engine = make_engine(crm_rules());
        let p = Principal::new("u1").with_attr("tenantId", 42);
        assert!(matches!(
            engine.evaluate(&p, &Resource::new("lead"), "read"),
            Err(AuthzError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_tenant_hierarchy_is_used() {
        let mut hierarchy = RoleHierarchy::new("default", UnknownTenant::Strict);
        hierarchy.set_hierarchy("acme", HierarchyDefinition::new().with("LEAD", &["ADMIN"]));
        let engine = PolicyEngine::new(
            hierarchy,
            Arc::new(AuditLogger::new()),
            Arc::new(MetricsCollector::new().unwrap()),
        )
        .with_rules(crm_rules());

        let lead = Principal::new("u1").with_role("LEAD").with_attr("tenantId", "acme");
        let pipeline = Resource::new("pipeline");
        assert!(engine.evaluate(&lead, &pipeline, "read").unwrap().allowed());

        // unknown tenant under the strict policy expands nothing
        let manager = Principal::new("u2").with_role("SUPER_ADMIN").with_attr("tenantId", "globex");
        assert!(!engine.evaluate(&manager, &pipeline, "read").unwrap().allowed());
        assert_eq!(engine.audit().recent(1)[0].tenant_id, "globex");
    }

    #[test]
    fn test_request_context_reaches_conditions() {
        let engine = make_engine(vec![Rule::allow("office-hours")
            .on(&["report"])
            .when(RuleCondition::Expression(
                Condition::parse("request.hour >= 9 && request.hour < 17").unwrap(),
            ))]);
        let p = Principal::new("u1");
        let r = Resource::new("report");
        assert!(engine
            .evaluate_with_context(&p, &r, "read", &json!({ "hour": 10 }))
            .unwrap()
            .allowed());
        assert!(!engine
            .evaluate_with_context(&p, &r, "read", &json!({ "hour": 20 }))
            .unwrap()
            .allowed());
        assert!(!engine.evaluate(&p, &r, "read").unwrap().allowed());
    }

    #[test]
    fn test_evaluate_multiple() {
        let engine = make_engine(crm_rules());
        let p = Principal::new("u1").with_role("USER");
        let r = Resource::new("lead").with_attr("ownerId", "u1");
        let results = engine
            .evaluate_multiple(&p, &r, &["read", "update", "delete", "read"])
            .unwrap();
        assert_eq!(results.len(), 3);
        assert!(results["read"]);
        assert!(results["update"]);
        assert!(!results["delete"]);
        assert_eq!(engine.audit().len(), 3);

        assert!(engine.evaluate_multiple(&p, &r, &["read", ""]).is_err());
        assert_eq!(engine.audit().len(), 3);
    }

    #[test]
    fn test_replace_rules_takes_effect() {
        let engine = make_engine(vec![]);
        let p = Principal::new("u1");
        let r = Resource::new("lead");
        assert!(!engine.evaluate(&p, &r, "read").unwrap().allowed());
        engine.replace_rules(vec![Rule::allow("open")]);
        assert!(engine.evaluate(&p, &r, "read").unwrap().allowed());
        assert_eq!(engine.rules().len(), 1);
    }

    struct BrokenSink;

    impl AuditSink for BrokenSink {
        fn write(&self, _record: &AuditRecord) -> Result<(), AuthzError> {
            Err(AuthzError::AuditSink("unreachable".into()))
        }
    }

    #[test]
    fn test_audit_sink_failure_does_not_fail_decision() {
        let engine = PolicyEngine::new(
            RoleHierarchy::default(),
            Arc::new(AuditLogger::new().with_sink(Arc::new(BrokenSink))),
            Arc::new(MetricsCollector::new().unwrap()),
        )
        .with_rules(vec![Rule::allow("open")]);
        let d = engine
            .evaluate(&Principal::new("u1"), &Resource::new("lead"), "read")
            .unwrap();
        assert!(d.allowed());
        assert_eq!(engine.metrics().snapshot().errors["audit_sink"], 1);
        assert_eq!(engine.audit().len(), 1);
    }

    fn bundle(default: HierarchyDefinition, rules: Vec<Rule>) -> PolicyBundle {
        PolicyBundle {
            default_hierarchy: Some(default),
            hierarchies: Default::default(),
            rules,
        }
    }

    #[test]
    fn test_bundle_swap_is_never_observed_half_applied() {
        // Each bundle alone denies QA on a report; the hierarchy of the
        // second combined with the rules of the first would allow it.
        let old = bundle(
            HierarchyDefinition::new().with("QA", &[]),
            vec![Rule::allow("reviewers-read").on(&["report"]).roles(&["REVIEWER"])],
        );
        let new = bundle(
            HierarchyDefinition::new().with("QA", &["REVIEWER"]),
            vec![Rule::allow("auditors-read").on(&["report"]).roles(&["AUDITOR"])],
        );
        let engine = Arc::new(make_engine(vec![]));
        engine.apply_bundle(old.clone());

        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let engine = engine.clone();
                let stop = stop.clone();
                std::thread::spawn(move || {
                    let qa = Principal::new("q1").with_role("QA");
                    let report = Resource::new("report");
                    while !stop.load(std::sync::atomic::Ordering::Relaxed) {
                        assert!(!engine.evaluate(&qa, &report, "read").unwrap().allowed());
                    }
                })
            })
            .collect();

        for i in 0..500 {
            engine.apply_bundle(if i % 2 == 0 { new.clone() } else { old.clone() });
        }
        stop.store(true, std::sync::atomic::Ordering::Relaxed);
        for reader in readers {
            reader.join().unwrap();
        }
    }

    #[test]
    fn test_set_hierarchy_keeps_rules() {
        let engine = make_engine(crm_rules());
        let before = engine.config();
        engine.set_hierarchy("acme", HierarchyDefinition::new().with("LEAD", &["ADMIN"]));

        let lead = Principal::new("u1").with_role("LEAD").with_attr("tenantId", "acme");
        assert!(engine.evaluate(&lead, &Resource::new("pipeline"), "read").unwrap().allowed());
        assert_eq!(engine.rules().len(), before.rules.len());
        // earlier snapshots are unaffected
        assert!(!before.hierarchy.is_configured("acme"));
    }
}
