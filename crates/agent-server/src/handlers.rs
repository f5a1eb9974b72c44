//! HTTP Handlers
//!
//! A failed run is still a run: provider and loop errors come back as
//! `200` with `status: "failed"`. Non-2xx codes are reserved for requests
//! the engine never started.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use agent_core::{AgentDefinition, Message, ModelEndpoint, Run, RunContext};

use crate::state::AppState;

/// Cap on `GET /api/agents/{id}/runs`
const MAX_RUN_LIST: usize = 100;

// ============================================================================
// Request / Response Types
// ============================================================================

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub agents: usize,
    pub models: usize,
    pub tools: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct AgentSummary {
    pub id: String,
    pub name: String,
    pub version: u32,
    pub primary_model: String,
    pub fallback_model: Option<String>,
    pub enabled_tools: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct RunRequest {
    pub agent_id: String,
    pub message: String,
    #[serde(default)]
    pub history: Vec<Message>,
    /// Pin the turn to one endpoint; disables fallback
    #[serde(default)]
    pub model_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CompareRequest {
    pub agent_id: String,
    pub model_ids: Vec<String>,
    pub message: String,
    #[serde(default)]
    pub history: Vec<Message>,
}

#[derive(Debug, Serialize)]
pub struct CompareResponse {
    pub runs: Vec<Run>,
}

#[derive(Debug, Deserialize)]
pub struct ListRunsQuery {
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, code: &str, error: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
            code: code.into(),
        }),
    )
}

// ============================================================================
// Lookups
// ============================================================================

fn find_agent<'a>(state: &'a AppState, id: &str) -> Result<&'a AgentDefinition, ApiError> {
    state
        .catalog
        .agent(id)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "AGENT_NOT_FOUND", format!("Unknown agent '{id}'")))
}

fn find_model<'a>(state: &'a AppState, id: &str) -> Result<&'a ModelEndpoint, ApiError> {
    state
        .catalog
        .model(id)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "MODEL_NOT_FOUND", format!("Unknown model '{id}'")))
}

fn require_message(message: &str) -> Result<(), ApiError> {
    if message.trim().is_empty() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "EMPTY_MESSAGE",
            "Message must not be empty",
        ));
    }
    Ok(())
}

// ============================================================================
// Handlers
// ============================================================================

pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        agents: state.catalog.agents.len(),
        models: state.catalog.models.len(),
        tools: state
            .coordinator
            .tools()
            .names()
            .into_iter()
            .map(str::to_string)
            .collect(),
    })
}

pub async fn list_agents(State(state): State<AppState>) -> Json<Vec<AgentSummary>> {
    let agents = state
        .catalog
        .agents
        .iter()
        .map(|a| AgentSummary {
            id: a.id.clone(),
            name: a.name.clone(),
            version: a.version,
            primary_model: a.primary_model.clone(),
            fallback_model: a.fallback_model.clone(),
            enabled_tools: a.enabled_tools.clone(),
        })
        .collect();
    Json(agents)
}

/// Execute one turn. Without `model_id` the agent's fallback model takes
/// over when the primary is unavailable.
pub async fn create_run(
    State(state): State<AppState>,
    Json(req): Json<RunRequest>,
) -> Result<Json<Run>, ApiError> {
    require_message(&req.message)?;
    let agent = find_agent(&state, &req.agent_id)?;

    let (primary, fallback) = match req.model_id.as_deref() {
        Some(id) => (find_model(&state, id)?, None),
        None => {
            let fallback = match agent.fallback_model.as_deref() {
                Some(id) => Some(find_model(&state, id)?),
                None => None,
            };
            (find_model(&state, &agent.primary_model)?, fallback)
        }
    };

    // dropping this future (client disconnect) cancels the run
    let run = state
        .coordinator
        .execute_with_fallback(
            agent,
            primary,
            fallback,
            &req.history,
            Message::user(req.message),
            RunContext::new(),
        )
        .await;

    tracing::info!(
        run_id = %run.id(),
        status = %run.status(),
        model = %run.model(),
        "Run finished"
    );
    Ok(Json(run))
}

/// Execute the same turn against several models concurrently.
pub async fn compare_runs(
    State(state): State<AppState>,
    Json(req): Json<CompareRequest>,
) -> Result<Json<CompareResponse>, ApiError> {
    require_message(&req.message)?;
    if req.model_ids.is_empty() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "NO_MODELS",
            "At least one model id is required",
        ));
    }
    let agent = find_agent(&state, &req.agent_id)?;
    let endpoints = req
        .model_ids
        .iter()
        .map(|id| find_model(&state, id).cloned())
        .collect::<Result<Vec<_>, _>>()?;

    let runs = state
        .dispatcher
        .execute_many(agent, &endpoints, &req.history, Message::user(req.message))
        .await;
    Ok(Json(CompareResponse { runs }))
}

pub async fn get_run(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Run>, ApiError> {
    match state.store.load(id) {
        Ok(Some(run)) => Ok(Json(run)),
        Ok(None) => Err(api_error(StatusCode::NOT_FOUND, "RUN_NOT_FOUND", format!("Unknown run {id}"))),
        Err(e) => {
            tracing::error!(run_id = %id, error = %e, "Run store read failed");
            Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, "STORE_ERROR", e.to_string()))
        }
    }
}

/// Most recent runs for one agent, newest first.
pub async fn list_agent_runs(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    Query(query): Query<ListRunsQuery>,
) -> Result<Json<Vec<Run>>, ApiError> {
    find_agent(&state, &agent_id)?;
    let limit = query.limit.unwrap_or(20).clamp(1, MAX_RUN_LIST);
    state
        .store
        .list_for_agent(&agent_id, limit)
        .map(Json)
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, "STORE_ERROR", e.to_string()))
}
