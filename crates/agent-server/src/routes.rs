//! Router

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::handlers::{compare_runs, create_run, get_run, health_check, list_agent_runs, list_agents};
use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health & catalog
        .route("/health", get(health_check))
        .route("/api/agents", get(list_agents))
        .route("/api/agents/{id}/runs", get(list_agent_runs))
        // Execution
        .route("/api/runs", post(create_run))
        .route("/api/runs/compare", post(compare_runs))
        .route("/api/runs/{id}", get(get_run))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
