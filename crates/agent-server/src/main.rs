//! agent-engine HTTP Server
//!
//! Axum host for the execution engine: single-turn runs with model
//! fallback, multi-model comparison, and run lookup.

mod catalog;
mod handlers;
mod routes;
mod state;

use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use agent_core::{EngineSettings, MemoryRunStore, RunCoordinator, ToolRegistry};
use agent_runtime::{HttpAdapterFactory, HttpTool};

use crate::catalog::{Catalog, ServerConfig};
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    let config = ServerConfig::from_env();
    let settings = EngineSettings::from_env();

    let catalog = match &config.catalog_path {
        Some(path) => {
            let catalog = Catalog::load(path)?;
            tracing::info!(path = %path.display(), "✓ Loaded catalog");
            catalog
        }
        None => {
            tracing::warn!("⚠ CATALOG_PATH not set - using a single local model");
            Catalog::local_default()
        }
    };
    for model in &catalog.models {
        tracing::info!("  Model: {} ({} {})", model.id, model.kind, model.model);
    }
    for agent in &catalog.agents {
        tracing::info!("  Agent: {} -> {}", agent.id, agent.primary_model);
    }

    let factory = HttpAdapterFactory::with_default_client()?;

    // Initialize tools
    let mut tools = ToolRegistry::with_builtins();
    for config in catalog.tools.clone() {
        tools.register(HttpTool::new(factory.client().clone(), config)?);
    }

    tracing::info!("Registered {} tools:", tools.len());
    for name in tools.names() {
        tracing::info!("  • {}", name);
    }

    let store = Arc::new(MemoryRunStore::new());
    let coordinator = RunCoordinator::new(Arc::new(factory), Arc::new(tools), settings);
    let state = AppState::new(catalog, coordinator, store);
    let app = routes::router(state);

    // Start server
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;

    tracing::info!("══════════════════════════════════════════════════");
    tracing::info!("🚀 agent-engine server running on http://{}", config.bind_addr);
    tracing::info!("══════════════════════════════════════════════════");
    tracing::info!("");
    tracing::info!("Endpoints:");
    tracing::info!("  GET  /health                - Health check");
    tracing::info!("  GET  /api/agents            - List agents");
    tracing::info!("  GET  /api/agents/{{id}}/runs  - Recent runs for an agent");
    tracing::info!("  POST /api/runs              - Execute one turn");
    tracing::info!("  POST /api/runs/compare      - Same turn on several models");
    tracing::info!("  GET  /api/runs/{{id}}         - Fetch a run");
    tracing::info!("");

    axum::serve(listener, app).await?;

    Ok(())
}
