use std::sync::Arc;

use warden::authz::loader::compile_policies;
use warden::authz::policy::parse_kdl_document;
use warden::authz::{
    AuditLogger, MetricsCollector, PlannerMode, PolicyEngine, QueryPlanner, RoleHierarchy,
    UnknownTenant,
};

/// CRM-style policy used across the integration tests. The default tenant
/// keeps the built-in hierarchy.
pub const CRM_POLICY: &str = r#"
hierarchy "acme" {
    role "LEAD_REP" {
        - "USER"
    }
    role "USER" {
        - "VIEWER"
    }
}

rule "document-owner-full" {
    resources {
        - "document"
    }
    roles {
        - "OWNER"
    }
}

rule "lead-owner" {
    resources {
        - "lead"
    }
    actions {
        - "read"
        - "update"
    }
    roles {
        - "USER"
    }
    owner "ownerId"
}

rule "lead-tenant-read" {
    resources {
        - "lead"
    }
    actions {
        - "read"
    }
    roles {
        - "VIEWER"
    }
    match resource="tenantId" principal="tenantId"
}

rule "lead-small-deals" {
    resources {
        - "lead"
    }
    actions {
        - "read"
    }
    roles {
        - "MANAGER"
    }
    condition "resource.attr.amount < 10000 && resource.attr.status in [\"open\", \"won\"]"
}

rule "archived-locked" effect="deny" {
    resources {
        - "lead"
    }
    actions {
        - "update"
        - "delete"
    }
    attribute "archived" equals=#true
}

rule "report-office-hours" {
    resources {
        - "report"
    }
    actions {
        - "read"
    }
    condition "request.hour >= 9 && request.hour < 17"
}
"#;

/// Lead policy built from composite conditions, principal-derived
/// comparisons and id references. `export` and `archive` carry rules that
/// depend on request data.
pub const PIPELINE_POLICY: &str = r#"
rule "open-or-mine" {
    resources {
        - "lead"
    }
    actions {
        - "read"
    }
    any {
        owner
        attribute "status" equals="open"
    }
}

rule "not-lost-for-seniors" {
    resources {
        - "lead"
    }
    actions {
        - "read"
        - "update"
    }
    condition "resource.attr.status != \"lost\" && principal.attr.level >= 3"
}

rule "pinned-leads" {
    resources {
        - "lead"
    }
    actions {
        - "read"
    }
    condition "resource.id == \"l7\" || resource.id in [\"l42\", \"l99\"]"
}

rule "unarchived-updates" {
    resources {
        - "lead"
    }
    actions {
        - "update"
    }
    roles {
        - "USER"
    }
    condition "!resource.attr.archived"
}

rule "big-deal-guard" effect="deny" {
    resources {
        - "lead"
    }
    actions {
        - "update"
        - "delete"
    }
    not {
        any {
            condition "resource.attr.amount <= 10000"
            match resource="tenantId" principal="tenantId"
        }
    }
}

rule "managers-delete-unwon" {
    resources {
        - "lead"
    }
    actions {
        - "delete"
    }
    roles {
        - "MANAGER"
    }
    all {
        owner
        not {
            attribute "status" equals="won"
        }
    }
}

rule "export-office-hours" {
    resources {
        - "lead"
    }
    actions {
        - "export"
    }
    condition "request.hour >= 9 && resource.attr.status == \"open\""
}

rule "tenant-export-archive" {
    resources {
        - "lead"
    }
    actions {
        - "export"
        - "archive"
    }
    match resource="tenantId" principal="tenantId"
}

rule "archive-embargo" effect="deny" {
    resources {
        - "lead"
    }
    actions {
        - "archive"
    }
    condition "request.embargo == true"
}
"#;

pub struct TestEngine {
    pub engine: Arc<PolicyEngine>,
}

impl TestEngine {
    pub fn new() -> Self {
        Self::from_kdl(CRM_POLICY, UnknownTenant::Fallback)
    }

    pub fn from_kdl(source: &str, unknown_tenant: UnknownTenant) -> Self {
        let parsed = parse_kdl_document(source).expect("Failed to parse test policy");
        let bundle = compile_policies(vec![parsed], "default").expect("Failed to compile test policy");
        let engine = PolicyEngine::new(
            RoleHierarchy::new("default", unknown_tenant),
            Arc::new(AuditLogger::new()),
            Arc::new(MetricsCollector::new().expect("Failed to create metrics")),
        );
        engine.apply_bundle(bundle);
        Self {
            engine: Arc::new(engine),
        }
    }

    pub fn planner(&self, mode: PlannerMode) -> QueryPlanner {
        QueryPlanner::new(self.engine.clone(), mode)
    }
}
