use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;

use crate::authz::engine::PolicyEngine;
use crate::authz::errors::AuthzError;
use crate::authz::hierarchy::HierarchyDefinition;
use crate::authz::loader;
use crate::authz::planner::{to_orm_filter, to_sql_where, QueryPlanner};
use crate::authz::types::{
    BatchCheckRequest, BatchCheckResponse, CheckRequest, CheckResponse, Effect, PlanRequest,
    PlanResponse,
};

const DEFAULT_AUDIT_LIMIT: usize = 100;

/// Shared state behind every handler.
#[derive(Debug)]
pub struct AuthzApi {
    pub engine: Arc<PolicyEngine>,
    pub planner: QueryPlanner,
    /// Directory re-read by `POST /v1/reload`; reload is refused when unset.
    pub policies_dir: Option<PathBuf>,
    pub load_timeout: Duration,
}

pub fn router(state: Arc<AuthzApi>) -> Router {
    Router::new()
        .route("/v1/check", post(handle_check))
        .route("/v1/check/batch", post(handle_batch_check))
        .route("/v1/plan", post(handle_plan))
        .route("/v1/audit", get(handle_audit))
        .route("/v1/metrics", get(handle_metrics_snapshot))
        .route("/metrics", get(handle_metrics_text))
        .route(
            "/v1/hierarchies/{tenant}",
            get(handle_get_hierarchy).put(handle_put_hierarchy),
        )
        .route("/v1/reload", post(handle_reload))
        .route("/healthz", get(health))
        .with_state(state)
}

/// Unwrap a JSON body, turning a malformed or incomplete one into counted
/// invalid input.
fn json_body<T>(state: &AuthzApi, body: Result<Json<T>, JsonRejection>) -> Result<T, AuthzError> {
    body.map(|Json(value)| value).map_err(|rejection| {
        let err = AuthzError::InvalidInput(rejection.body_text());
        state.engine.metrics().record_error(err.kind());
        tracing::debug!(error = %err, "rejected request body");
        err
    })
}

async fn handle_check(
    State(state): State<Arc<AuthzApi>>,
    body: Result<Json<CheckRequest>, JsonRejection>,
) -> impl IntoResponse {
    let req = match json_body(&state, body) {
        Ok(req) => req,
        Err(e) => return e.into_response(),
    };
    match state
        .engine
        .evaluate_with_context(&req.principal, &req.resource, &req.action, &req.context)
    {
        Ok(decision) => Json(CheckResponse::from(decision)).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn handle_batch_check(
    State(state): State<Arc<AuthzApi>>,
    body: Result<Json<BatchCheckRequest>, JsonRejection>,
) -> impl IntoResponse {
    let req = match json_body(&state, body) {
        Ok(req) => req,
        Err(e) => return e.into_response(),
    };
    match state
        .engine
        .evaluate_multiple(&req.principal, &req.resource, &req.actions)
    {
        Ok(results) => Json(BatchCheckResponse { results }).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn handle_plan(
    State(state): State<Arc<AuthzApi>>,
    body: Result<Json<PlanRequest>, JsonRejection>,
) -> impl IntoResponse {
    let req = match json_body(&state, body) {
        Ok(req) => req,
        Err(e) => return e.into_response(),
    };
    match state
        .planner
        .plan_query(&req.principal, &req.resource_kind, &req.action)
    {
        Ok(filter) => {
            let sql = to_sql_where(&filter);
            Json(PlanResponse {
                filter: serde_json::to_value(&filter).unwrap_or_default(),
                orm: to_orm_filter(&filter),
                sql: sql.clause,
                params: sql.params,
            })
            .into_response()
        }
        Err(e) => e.into_response(),
    }
}

#[derive(Debug, Default, Deserialize)]
struct AuditQuery {
    principal: Option<String>,
    kind: Option<String>,
    id: Option<String>,
    effect: Option<String>,
    limit: Option<usize>,
}

async fn handle_audit(
    State(state): State<Arc<AuthzApi>>,
    Query(q): Query<AuditQuery>,
) -> impl IntoResponse {
    let audit = state.engine.audit();
    let limit = q.limit.unwrap_or(DEFAULT_AUDIT_LIMIT);
    let records = if let Some(principal) = &q.principal {
        audit.for_principal(principal, limit)
    } else if let Some(kind) = &q.kind {
        audit.for_resource(kind, q.id.as_deref(), limit)
    } else if let Some(effect) = &q.effect {
        match Effect::parse(effect) {
            Some(effect) => audit.by_effect(effect, limit),
            None => {
                return AuthzError::InvalidInput(format!(
                    "unknown effect `{effect}` (expected ALLOW or DENY)"
                ))
                .into_response()
            }
        }
    } else {
        audit.recent(limit)
    };
    Json(records).into_response()
}

async fn handle_metrics_snapshot(State(state): State<Arc<AuthzApi>>) -> impl IntoResponse {
    Json(state.engine.metrics().snapshot())
}

async fn handle_metrics_text(State(state): State<Arc<AuthzApi>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.engine.metrics().render(),
    )
}

async fn handle_get_hierarchy(
    State(state): State<Arc<AuthzApi>>,
    Path(tenant): Path<String>,
) -> impl IntoResponse {
    let definition = state.engine.config().hierarchy.get_hierarchy(&tenant);
    Json(HierarchyDefinition::clone(&definition))
}

async fn handle_put_hierarchy(
    State(state): State<Arc<AuthzApi>>,
    Path(tenant): Path<String>,
    body: Result<Json<HierarchyDefinition>, JsonRejection>,
) -> impl IntoResponse {
    let definition = match json_body(&state, body) {
        Ok(definition) => definition,
        Err(e) => return e.into_response(),
    };
    if tenant.trim().is_empty() {
        return AuthzError::InvalidInput("tenant id is empty".into()).into_response();
    }
    state.engine.set_hierarchy(&tenant, definition);
    tracing::info!(tenant = %tenant, "role hierarchy updated via API");
    StatusCode::NO_CONTENT.into_response()
}

async fn handle_reload(State(state): State<Arc<AuthzApi>>) -> impl IntoResponse {
    let Some(dir) = &state.policies_dir else {
        return AuthzError::InvalidInput("no policies directory configured".into())
            .into_response();
    };
    match loader::reload(&state.engine, dir, state.load_timeout).await {
        Ok(summary) => Json(summary).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}
