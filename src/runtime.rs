//! Runtime for driving conversations
//!
//! One actor task per conversation id owns that conversation's turns; the
//! manager only routes requests to it.

mod executor;
pub mod traits;

#[cfg(test)]
pub mod testing;

pub use executor::{ConversationRuntime, RuntimeLimits};
pub use traits::*;

use crate::catalog::{ToolCatalog, ToolProviderRegistry};
use crate::orchestrator::{OrchestratorConfig, ToolOrchestrator};
use crate::reasoner::{Reasoner, TextCompleter};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Type alias for the production manager
pub type ProductionManager = ConversationManager<DatabaseStorage>;

pub(crate) const EMPTY_UTTERANCE_MESSAGE: &str = "Please enter a message.";
pub(crate) const UNAVAILABLE_MESSAGE: &str =
    "Something went wrong while handling your message. Please try again.";

/// Per-turn caller controls
#[derive(Debug, Clone, Default)]
pub struct TurnOptions {
    pub cancel: CancellationToken,
    pub deadline: Option<Instant>,
}

impl TurnOptions {
    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// `limit`, shortened to whatever is left before the deadline
    pub fn bounded(&self, limit: Duration) -> Duration {
        match self.deadline {
            Some(deadline) => limit.min(deadline.saturating_duration_since(Instant::now())),
            None => limit,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Same deadline, with a token the runtime may cancel without touching
    /// the caller's
    pub(crate) fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            deadline: self.deadline,
        }
    }
}

/// Result of one conversation turn
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "text", rename_all = "snake_case")]
pub enum Outcome {
    Clarification(String),
    FinalAnswer(String),
    Cancelled(String),
    Error(String),
}

impl Outcome {
    pub fn text(&self) -> &str {
        match self {
            Outcome::Clarification(text)
            | Outcome::FinalAnswer(text)
            | Outcome::Cancelled(text)
            | Outcome::Error(text) => text,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub reasoner_timeout: Duration,
    pub tool_timeout: Duration,
    pub phrase_clarifications: bool,
    /// Refuse to touch a conversation whose stored state is broken
    pub strict_invariants: bool,
    /// How long a conversation actor waits for work before exiting
    pub idle_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            reasoner_timeout: Duration::from_secs(60),
            tool_timeout: Duration::from_secs(120),
            phrase_clarifications: true,
            strict_invariants: cfg!(debug_assertions),
            idle_timeout: Duration::from_secs(600),
        }
    }
}

impl ManagerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            reasoner_timeout: env_secs("CONDUCTOR_REASONER_TIMEOUT_SECS")
                .unwrap_or(defaults.reasoner_timeout),
            tool_timeout: env_secs("CONDUCTOR_TOOL_TIMEOUT_SECS").unwrap_or(defaults.tool_timeout),
            phrase_clarifications: env_flag("CONDUCTOR_PHRASE_CLARIFICATIONS")
                .unwrap_or(defaults.phrase_clarifications),
            strict_invariants: env_flag("CONDUCTOR_STRICT_INVARIANTS")
                .unwrap_or(defaults.strict_invariants),
            idle_timeout: env_secs("CONDUCTOR_IDLE_TIMEOUT_SECS").unwrap_or(defaults.idle_timeout),
        }
    }
}

fn env_secs(key: &str) -> Option<Duration> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse::<u64>() {
        Ok(secs) => Some(Duration::from_secs(secs)),
        Err(_) => {
            tracing::warn!(key = %key, value = %raw, "Ignoring non-numeric timeout");
            None
        }
    }
}

fn env_flag(key: &str) -> Option<bool> {
    let raw = std::env::var(key).ok()?;
    parse_flag(&raw)
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Work routed to a conversation actor
#[derive(Debug)]
pub(crate) enum TurnRequest {
    Message {
        utterance: String,
        opts: TurnOptions,
        reply: oneshot::Sender<Outcome>,
    },
    Reset {
        reply: oneshot::Sender<Result<(), StoreError>>,
    },
}

/// Handle to a running conversation actor
#[derive(Clone)]
pub struct ConversationHandle {
    tx: mpsc::Sender<TurnRequest>,
}

/// Manager for all conversation actors
pub struct ConversationManager<S: StateStore + Clone + 'static> {
    store: S,
    registry: Arc<ToolProviderRegistry>,
    orchestrator: Arc<ToolOrchestrator>,
    config: ManagerConfig,
    handles: RwLock<HashMap<String, ConversationHandle>>,
}

impl<S: StateStore + Clone + 'static> ConversationManager<S> {
    pub fn new(
        store: S,
        registry: Arc<ToolProviderRegistry>,
        completer: Arc<dyn TextCompleter>,
        config: ManagerConfig,
    ) -> Self {
        let reasoner = Reasoner::new(completer, config.reasoner_timeout);
        let orchestrator = ToolOrchestrator::new(
            reasoner,
            OrchestratorConfig {
                tool_timeout: config.tool_timeout,
                phrase_clarifications: config.phrase_clarifications,
            },
        );
        Self {
            store,
            registry,
            orchestrator: Arc::new(orchestrator),
            config,
            handles: RwLock::new(HashMap::new()),
        }
    }

    /// Handle one user turn
    pub async fn process_message(&self, conversation_id: &str, utterance: &str) -> Outcome {
        self.process_message_with(conversation_id, utterance, TurnOptions::default())
            .await
    }

    /// Handle one user turn with caller-supplied cancellation and deadline.
    ///
    /// Dropping the returned future cancels the turn: tools already running
    /// finish, nothing further runs and the stored state is left as it was.
    pub async fn process_message_with(
        &self,
        conversation_id: &str,
        utterance: &str,
        opts: TurnOptions,
    ) -> Outcome {
        if utterance.trim().is_empty() {
            return Outcome::Error(EMPTY_UTTERANCE_MESSAGE.to_string());
        }

        let (reply, rx) = oneshot::channel();
        let request = TurnRequest::Message {
            utterance: utterance.to_string(),
            opts,
            reply,
        };
        if let Err(e) = self.dispatch(conversation_id, request).await {
            tracing::error!(conv_id = %conversation_id, error = %e, "Failed to dispatch turn");
            return Outcome::Error(UNAVAILABLE_MESSAGE.to_string());
        }

        rx.await.unwrap_or_else(|_| {
            tracing::error!(conv_id = %conversation_id, "Conversation runtime dropped the turn");
            Outcome::Error(UNAVAILABLE_MESSAGE.to_string())
        })
    }

    /// Drop any in-progress orchestration for a conversation
    pub async fn reset_conversation(&self, conversation_id: &str) -> Result<(), StoreError> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(conversation_id, TurnRequest::Reset { reply })
            .await?;
        rx.await
            .map_err(|_| StoreError("conversation runtime stopped".to_string()))?
    }

    /// Tool catalog currently visible to a conversation
    pub async fn catalog_for(&self, conversation_id: &str) -> ToolCatalog {
        self.registry
            .catalog_for(conversation_id, &TurnOptions::default(), self.config.tool_timeout)
            .await
    }

    /// Number of conversation actors currently running
    pub async fn active_conversations(&self) -> usize {
        self.handles
            .read()
            .await
            .values()
            .filter(|h| !h.tx.is_closed())
            .count()
    }

    pub fn registry(&self) -> &Arc<ToolProviderRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    async fn dispatch(&self, conversation_id: &str, request: TurnRequest) -> Result<(), StoreError> {
        let handle = self.get_or_create(conversation_id).await;
        match handle.tx.send(request).await {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendError(request)) => {
                // Actor is gone; start a fresh one and retry once
                self.handles.write().await.remove(conversation_id);
                let handle = self.get_or_create(conversation_id).await;
                handle
                    .tx
                    .send(request)
                    .await
                    .map_err(|e| StoreError(format!("Failed to send turn: {e}")))
            }
        }
    }

    /// Get or create the actor for a conversation
    async fn get_or_create(&self, conversation_id: &str) -> ConversationHandle {
        {
            let handles = self.handles.read().await;
            if let Some(handle) = handles.get(conversation_id) {
                return handle.clone();
            }
        }

        let mut handles = self.handles.write().await;
        // Another caller may have won the race for the write lock
        if let Some(handle) = handles.get(conversation_id) {
            return handle.clone();
        }

        // Drop handles of actors that exited while idle
        handles.retain(|_, h| !h.tx.is_closed());

        let (tx, rx) = mpsc::channel(32);
        let runtime = ConversationRuntime::new(
            conversation_id.to_string(),
            self.store.clone(),
            self.registry.clone(),
            self.orchestrator.clone(),
            RuntimeLimits {
                strict_invariants: self.config.strict_invariants,
                idle_timeout: self.config.idle_timeout,
            },
            rx,
        );

        let conv_id = conversation_id.to_string();
        tokio::spawn(async move {
            runtime.run().await;
            tracing::info!(conv_id = %conv_id, "Conversation runtime finished");
        });

        let handle = ConversationHandle { tx };
        handles.insert(conversation_id.to_string(), handle.clone());
        handle
    }
}
