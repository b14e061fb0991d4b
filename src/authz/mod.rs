pub mod audit;
pub mod condition;
pub mod engine;
pub mod errors;
pub mod hierarchy;
pub mod loader;
pub mod metrics;
pub mod planner;
pub mod policy;
pub mod rules;
pub mod types;
pub mod web;

pub use audit::{AuditLogger, AuditRecord, AuditSink};
pub use engine::{PolicyConfig, PolicyEngine};
pub use errors::AuthzError;
pub use hierarchy::{HierarchyDefinition, RoleHierarchy, UnknownTenant};
pub use metrics::{MetricsCollector, MetricsSnapshot};
pub use planner::{to_orm_filter, to_sql_where, Field, Filter, PlannerMode, QueryPlanner, SqlFragment};
pub use rules::{Rule, RuleCondition};
pub use types::{Attributes, Decision, Effect, Principal, Resource};
