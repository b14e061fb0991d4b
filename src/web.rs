//! Process wiring: build the engine from settings and serve the HTTP API.
use crate::authz::audit::{AuditLogger, TracingSink};
use crate::authz::engine::PolicyEngine;
use crate::authz::hierarchy::RoleHierarchy;
use crate::authz::loader;
use crate::authz::metrics::MetricsCollector;
use crate::authz::planner::QueryPlanner;
use crate::authz::web::{router, AuthzApi};
use crate::errors::WardenError;
use crate::settings::Settings;
use axum::body::Body;
use axum::http::{HeaderName, HeaderValue, Request};
use axum::middleware::{self, Next};
use axum::response::IntoResponse;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

async fn security_headers(request: Request<Body>, next: Next) -> impl IntoResponse {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();

    headers.insert(
        HeaderName::from_static("x-content-type-options"),
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(
        HeaderName::from_static("cache-control"),
        HeaderValue::from_static("no-store"),
    );

    response
}

/// Engine, planner and API state from settings. Policies are loaded from
/// `settings.policies.dir` when it exists; otherwise the engine starts with
/// the built-in hierarchy and no rules.
pub async fn build_api(settings: &Settings) -> Result<AuthzApi, WardenError> {
    let hierarchy = RoleHierarchy::new(
        settings.tenancy.default_tenant.clone(),
        settings.tenancy.unknown_tenant,
    );
    let mut audit = AuditLogger::new();
    if settings.audit.trace_records {
        audit = audit.with_sink(Arc::new(TracingSink));
    }
    let metrics = Arc::new(MetricsCollector::new()?);
    let engine = Arc::new(
        PolicyEngine::new(hierarchy, Arc::new(audit), metrics)
            .with_tenant_attribute(settings.tenancy.tenant_attribute.clone()),
    );

    let dir = &settings.policies.dir;
    let policies_dir = if dir.is_dir() {
        let bundle = loader::load_policies_with_timeout(
            dir.clone(),
            settings.tenancy.default_tenant.clone(),
            settings.policies.load_timeout(),
        )
        .await?;
        engine.apply_bundle(bundle);
        Some(dir.clone())
    } else {
        tracing::warn!(
            dir = %dir.display(),
            "policies directory not found; starting with no rules"
        );
        None
    };

    Ok(AuthzApi {
        planner: QueryPlanner::new(engine.clone(), settings.planner.mode),
        engine,
        policies_dir,
        load_timeout: settings.policies.load_timeout(),
    })
}

pub fn app(api: AuthzApi) -> Router {
    router(Arc::new(api))
        .layer(middleware::from_fn(security_headers))
        .layer(TraceLayer::new_for_http())
}

pub async fn serve(settings: Settings) -> Result<(), WardenError> {
    let api = build_api(&settings).await?;

    let addr_str = settings.listen_addr();
    let addr: SocketAddr = addr_str.parse().map_err(|e: std::net::AddrParseError| {
        WardenError::ListenAddr {
            addr: addr_str.clone(),
            reason: e.to_string(),
        }
    })?;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, mode = ?settings.planner.mode, "Authorization API listening");
    axum::serve(listener, app(api))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
