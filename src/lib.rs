//! conductor - tool-augmented conversation orchestration
//!
//! A per-conversation state machine that decides when a user turn needs
//! external tools, collects missing tool parameters across turns, runs tool
//! chains with partial-failure tolerance and turns the results into an answer.

pub mod api;
pub mod catalog;
pub mod db;
pub mod llm;
pub mod orchestrator;
pub mod reasoner;
pub mod runtime;
pub mod state_machine;

pub use catalog::{ToolCatalog, ToolDescriptor, ToolProvider, ToolProviderRegistry};
pub use runtime::{ConversationManager, ManagerConfig, Outcome, TurnOptions};
