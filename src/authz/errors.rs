use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use miette::Diagnostic;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum AuthzError {
    #[error("Invalid input: {0}")]
    #[diagnostic(
        code(warden::authz::invalid_input),
        help("A check needs a non-empty principal id, resource kind and action")
    )]
    InvalidInput(String),

    #[error("Rule `{rule}` cannot be planned: {reason}")]
    #[diagnostic(
        code(warden::authz::unplannable),
        help("Fall back to per-row evaluation, or switch the planner to `narrow` mode")
    )]
    Unplannable { rule: String, reason: String },

    #[error("Failed to load policy file `{path}`")]
    #[diagnostic(
        code(warden::authz::policy_load),
        help("Check that the file exists and contains valid KDL syntax")
    )]
    PolicyLoadError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid policy: {0}")]
    #[diagnostic(
        code(warden::authz::invalid_policy),
        help("Each policy file must contain valid `hierarchy` or `rule` KDL nodes")
    )]
    InvalidPolicy(String),

    #[error("Invalid condition expression: {0}")]
    #[diagnostic(
        code(warden::authz::invalid_condition),
        help("Supported operators: ==, !=, >, <, >=, <=, &&, ||, !, in. Paths use dot notation (e.g. resource.attr.ownerId)")
    )]
    InvalidCondition(String),

    #[error("KDL parse error: {0}")]
    #[diagnostic(
        code(warden::authz::kdl_parse),
        help("Check your KDL file syntax against https://kdl.dev")
    )]
    KdlParse(String),

    #[error("Loading policies timed out after {0:?}")]
    #[diagnostic(
        code(warden::authz::load_timeout),
        help("The previously loaded configuration is still active")
    )]
    LoadTimeout(std::time::Duration),

    #[error("Metrics registry error: {0}")]
    #[diagnostic(code(warden::authz::metrics))]
    Metrics(String),

    #[error("Audit sink error: {0}")]
    #[diagnostic(code(warden::authz::audit_sink))]
    AuditSink(String),

    #[error("I/O error: {0}")]
    #[diagnostic(code(warden::authz::io))]
    Io(#[from] std::io::Error),
}

impl From<prometheus::Error> for AuthzError {
    fn from(value: prometheus::Error) -> Self {
        AuthzError::Metrics(value.to_string())
    }
}

impl AuthzError {
    /// Label used for the `warden_errors_total` counter.
    pub fn kind(&self) -> &'static str {
        match self {
            AuthzError::InvalidInput(_) => "invalid_input",
            AuthzError::Unplannable { .. } => "unplannable",
            AuthzError::AuditSink(_) => "audit_sink",
            AuthzError::LoadTimeout(_)
            | AuthzError::PolicyLoadError { .. }
            | AuthzError::InvalidPolicy(_)
            | AuthzError::InvalidCondition(_)
            | AuthzError::KdlParse(_)
            | AuthzError::Io(_) => "policy_load",
            AuthzError::Metrics(_) => "metrics",
        }
    }
}

impl IntoResponse for AuthzError {
    fn into_response(self) -> Response {
        let status = match &self {
            AuthzError::InvalidInput(_)
            | AuthzError::InvalidPolicy(_)
            | AuthzError::InvalidCondition(_)
            | AuthzError::KdlParse(_) => StatusCode::BAD_REQUEST,
            AuthzError::Unplannable { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            AuthzError::LoadTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = json!({ "error": self.to_string(), "kind": self.kind() });
        (status, Json(body)).into_response()
    }
}
