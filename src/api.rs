//! HTTP API for conductor

mod handlers;
mod types;

pub use handlers::create_router;
pub use types::*;

use crate::catalog::ToolProviderRegistry;
use crate::db::Database;
use crate::llm::ModelRegistry;
use crate::reasoner::TextCompleter;
use crate::runtime::{ConversationManager, DatabaseStorage, ManagerConfig, ProductionManager};
use std::sync::Arc;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<ProductionManager>,
    pub storage: DatabaseStorage,
    pub llm_registry: Arc<ModelRegistry>,
}

impl AppState {
    pub fn new(
        db: Database,
        tools: Arc<ToolProviderRegistry>,
        completer: Arc<dyn TextCompleter>,
        llm_registry: Arc<ModelRegistry>,
        config: ManagerConfig,
    ) -> Self {
        let storage = DatabaseStorage::new(db);
        Self {
            manager: Arc::new(ConversationManager::new(
                storage.clone(),
                tools,
                completer,
                config,
            )),
            storage,
            llm_registry,
        }
    }
}
