//! Reasoner: single-shot text completion used by the orchestrator
//!
//! Every call is bounded by the configured timeout, the caller's deadline and
//! the turn's cancellation token.

pub mod prompts;

use crate::catalog::ToolDescriptor;
use crate::llm::{LlmError, LlmRequest, ModelRegistry};
use crate::runtime::TurnOptions;
use crate::state_machine::ToolCallResult;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Opaque text completion
#[async_trait]
pub trait TextCompleter: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String, LlmError>;
}

#[async_trait]
impl<T: TextCompleter + ?Sized> TextCompleter for Arc<T> {
    async fn complete(&self, prompt: &str) -> Result<String, LlmError> {
        (**self).complete(prompt).await
    }
}

/// Adapter to use a `ModelRegistry` model as `TextCompleter`
pub struct LlmCompleter {
    registry: Arc<ModelRegistry>,
    model_id: String,
}

impl LlmCompleter {
    pub fn new(registry: Arc<ModelRegistry>, model_id: String) -> Self {
        Self { registry, model_id }
    }
}

#[async_trait]
impl TextCompleter for LlmCompleter {
    async fn complete(&self, prompt: &str) -> Result<String, LlmError> {
        let llm = self
            .registry
            .get(&self.model_id)
            .or_else(|| self.registry.default_model())
            .ok_or_else(|| {
                LlmError::new(crate::llm::LlmErrorKind::Unavailable, "No LLM available")
            })?;
        let response = llm.complete(&LlmRequest::prompt(prompt)).await?;
        Ok(response.text)
    }
}

#[derive(Debug, Error)]
pub enum ReasonerError {
    #[error("Reasoner timed out after {}ms", .0.as_millis())]
    Timeout(Duration),
    #[error("Reasoner call cancelled")]
    Cancelled,
    #[error(transparent)]
    Llm(#[from] LlmError),
}

#[derive(Clone)]
pub struct Reasoner {
    completer: Arc<dyn TextCompleter>,
    timeout: Duration,
}

impl Reasoner {
    pub fn new(completer: Arc<dyn TextCompleter>, timeout: Duration) -> Self {
        Self { completer, timeout }
    }

    pub async fn complete(&self, prompt: &str, opts: &TurnOptions) -> Result<String, ReasonerError> {
        let limit = opts.bounded(self.timeout);

        tokio::select! {
            biased;
            () = opts.cancel.cancelled() => Err(ReasonerError::Cancelled),
            result = tokio::time::timeout(limit, self.completer.complete(prompt)) => match result {
                Ok(Ok(text)) => Ok(text),
                Ok(Err(e)) => Err(ReasonerError::Llm(e)),
                Err(_) => Err(ReasonerError::Timeout(limit)),
            },
        }
    }

    pub async fn select_tools(
        &self,
        utterance: &str,
        tools: &[ToolDescriptor],
        opts: &TurnOptions,
    ) -> Result<String, ReasonerError> {
        self.complete(&prompts::tool_detection(utterance, tools), opts)
            .await
    }

    pub async fn classify_intent(
        &self,
        question: &str,
        reply: &str,
        opts: &TurnOptions,
    ) -> Result<String, ReasonerError> {
        self.complete(&prompts::intent_classification(question, reply), opts)
            .await
    }

    pub async fn phrase_clarification(
        &self,
        tool: &ToolDescriptor,
        description: &str,
        original_message: &str,
        opts: &TurnOptions,
    ) -> Result<String, ReasonerError> {
        self.complete(
            &prompts::clarification(tool, description, original_message),
            opts,
        )
        .await
    }

    pub async fn synthesize(
        &self,
        original_message: &str,
        results: &[ToolCallResult],
        discovery_hint: bool,
        opts: &TurnOptions,
    ) -> Result<String, ReasonerError> {
        self.complete(
            &prompts::synthesis(original_message, results, discovery_hint),
            opts,
        )
        .await
    }

    pub async fn answer(&self, utterance: &str, opts: &TurnOptions) -> Result<String, ReasonerError> {
        self.complete(&prompts::plain_answer(utterance), opts).await
    }
}
