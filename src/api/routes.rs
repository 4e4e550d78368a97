use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::api::handlers::{query, rules, AppState};

/// Create the admin router over a running kernel
pub fn create_router_with_state(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/rules", get(rules::get_rules).put(rules::put_rules))
        .route("/api/preview", post(query::preview_query))
        .route("/api/query", post(query::execute_query))
        .route("/api/stats", get(query::get_stats))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> &'static str {
    "OK"
}
