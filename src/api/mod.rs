//! API layer - HTTP handlers and routing
//!
//! Exposes the taskoo core over HTTP:
//! - Task endpoints backed by guest exports
//! - Host status endpoint

pub mod middleware;
pub mod status;
pub mod tasks;

use axum::{
    http::{header, HeaderValue, Method},
    middleware as axum_middleware,
    routing::{get, post},
    Router,
};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::ConfigError;

pub use middleware::{ApiError, AppState, RequestStats};

/// Build the task routes
pub fn build_api_router() -> Router<AppState> {
    Router::new()
        .route("/today", get(tasks::today))
        .route("/list", post(tasks::list))
        .route("/agenda", post(tasks::agenda))
        .route("/add", post(tasks::add))
        .route("/delete", post(tasks::delete))
        .route("/state_change", post(tasks::state_change))
        .route("/run", post(tasks::run_command))
        .route("/status", get(status::get_status))
}

/// CORS layer for `cors_origin`; `*` allows any origin
pub fn cors_layer(cors_origin: &str) -> Result<CorsLayer, ConfigError> {
    let origin = if cors_origin.trim() == "*" {
        AllowOrigin::any()
    } else {
        let value = cors_origin.parse::<HeaderValue>().map_err(|e| {
            ConfigError::ValidationError(format!("invalid cors_origin '{}': {}", cors_origin, e))
        })?;
        AllowOrigin::exact(value)
    };

    Ok(CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE]))
}

/// Build the complete router with middleware
pub fn build_router(state: AppState, cors_origin: &str) -> Result<Router, ConfigError> {
    let cors = cors_layer(cors_origin)?;

    Ok(build_api_router()
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        // Request stats middleware (outermost layer, runs for all requests)
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::request_stats_middleware,
        ))
        .with_state(state))
}
