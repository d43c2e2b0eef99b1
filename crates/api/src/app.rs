use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use persistence::ExportStore;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::config::Config;
use crate::middleware::{
    metrics_handler, metrics_middleware, require_identity, require_psk, trace_id,
};
use crate::routes::{exports, health, internal};
use crate::services::LifecycleController;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ExportStore>,
    pub controller: LifecycleController,
    pub config: Arc<Config>,
}

/// Routes served to users on the public port.
pub fn public_router(state: AppState) -> Router {
    let export_routes = Router::new()
        .route(
            "/exports",
            post(exports::create_export).get(exports::list_exports),
        )
        .route(
            "/exports/:id",
            get(exports::get_export).delete(exports::delete_export),
        )
        .route("/exports/:id/status", get(exports::get_export_status))
        .route_layer(middleware::from_fn(require_identity));

    let health_routes = Router::new()
        .route("/healthz", get(health::live))
        .route("/readyz", get(health::ready));

    let timeout = Duration::from_secs(state.config.server.request_timeout_secs);
    let base_path = state.config.server.public_base_path.clone();

    mount(&base_path, export_routes)
        .merge(health_routes)
        // Global middleware (order matters: bottom layers run first)
        .layer(TimeoutLayer::new(timeout))
        .layer(middleware::from_fn(metrics_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(trace_id))
        .with_state(state)
}

/// Callback routes for upstream applications on the private port.
pub fn internal_router(state: AppState) -> Router {
    let callback_routes = Router::new()
        .route(
            "/:request_id/:application/:resource_id/upload",
            post(internal::upload_source),
        )
        .route(
            "/:request_id/:application/:resource_id/error",
            post(internal::source_error),
        )
        .route_layer(middleware::from_fn_with_state(state.clone(), require_psk));

    let base_path = state.config.server.private_base_path.clone();

    mount(&base_path, callback_routes)
        .layer(middleware::from_fn(metrics_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(trace_id))
        .with_state(state)
}

/// Nests `routes` under `base_path`; a root base path merges instead.
fn mount(base_path: &str, routes: Router<AppState>) -> Router<AppState> {
    let base_path = base_path.trim_end_matches('/');
    if base_path.is_empty() {
        Router::new().merge(routes)
    } else {
        Router::new().nest(base_path, routes)
    }
}

/// Prometheus exposition on the metrics port.
pub fn metrics_router() -> Router {
    Router::new().route("/metrics", get(metrics_handler))
}
