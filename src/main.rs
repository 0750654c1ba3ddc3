//! conductor server
//!
//! Serves the conversation manager over HTTP, backed by SQLite, the
//! configured LLM providers and MCP tool servers.

use conductor::api::{create_router, AppState};
use conductor::catalog::{load_server_entries, ToolProviderRegistry};
use conductor::db::Database;
use conductor::llm::{LlmConfig, ModelRegistry};
use conductor::reasoner::LlmCompleter;
use conductor::runtime::ManagerConfig;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "conductor=info,tower_http=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    // Configuration
    let db_path = std::env::var("CONDUCTOR_DB_PATH").unwrap_or_else(|_| {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        format!("{home}/.conductor/conductor.db")
    });

    let port: u16 = std::env::var("CONDUCTOR_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8000);

    // Ensure database directory exists
    if let Some(parent) = PathBuf::from(&db_path).parent() {
        std::fs::create_dir_all(parent)?;
    }

    tracing::info!(path = %db_path, "Opening database");
    let db = Database::open(&db_path)?;

    let pending = db.collecting_conversations()?;
    if !pending.is_empty() {
        tracing::info!(count = pending.len(), "Conversations waiting for parameters");
    }

    // Initialize LLM registry
    let llm_config = LlmConfig::from_env();
    let llm_registry = Arc::new(ModelRegistry::new(&llm_config));

    if llm_registry.has_models() {
        tracing::info!(
            models = ?llm_registry.available_models(),
            default = %llm_registry.default_model_id(),
            "LLM registry initialized"
        );
    } else {
        tracing::warn!(
            "No LLM API keys configured. Set ANTHROPIC_API_KEY, OPENAI_API_KEY or LLM_GATEWAY."
        );
    }

    // Connect tool servers
    let tools = Arc::new(ToolProviderRegistry::new());
    if let Ok(path) = std::env::var("CONDUCTOR_TOOL_SERVERS") {
        let entries = load_server_entries(PathBuf::from(&path).as_path())?;
        let connected = tools.connect_servers(&entries).await;
        tracing::info!(path = %path, configured = entries.len(), connected, "Tool servers ready");
    } else {
        tracing::info!("CONDUCTOR_TOOL_SERVERS not set, running without tools");
    }

    let manager_config = ManagerConfig::from_env();
    tracing::info!(config = ?manager_config, "Manager configuration");

    let completer = Arc::new(LlmCompleter::new(
        llm_registry.clone(),
        llm_registry.default_model_id().to_string(),
    ));
    let state = AppState::new(db, tools, completer, llm_registry, manager_config);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("conductor listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
