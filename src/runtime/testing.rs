//! Mock implementations for testing
//!
//! These mocks enable end-to-end testing of the manager without real I/O.

use super::traits::*;
use super::{ConversationManager, ManagerConfig};
use crate::catalog::{ToolDescriptor, ToolError, ToolOutput, ToolProvider, ToolProviderRegistry};
use crate::db::{Message, MessageRole};
use crate::llm::LlmError;
use crate::reasoner::TextCompleter;
use crate::state_machine::ConversationState;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ============================================================================
// Mock Completer
// ============================================================================

enum Scripted {
    Text(String),
    Fail,
}

/// Completer answering by prompt content.
///
/// Rules are checked in insertion order; the first rule whose markers all
/// appear in the prompt decides the reply. Unmatched prompts fail.
pub struct MockCompleter {
    rules: Vec<(Vec<String>, Scripted)>,
    delay: Duration,
    prompts: Mutex<Vec<String>>,
}

#[allow(dead_code)]
impl MockCompleter {
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            delay: Duration::ZERO,
            prompts: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn respond(self, marker: &str, text: &str) -> Self {
        self.respond_when(&[marker], text)
    }

    #[must_use]
    pub fn respond_when(mut self, markers: &[&str], text: &str) -> Self {
        self.rules.push((
            markers.iter().map(|m| (*m).to_string()).collect(),
            Scripted::Text(text.to_string()),
        ));
        self
    }

    #[must_use]
    pub fn fail_on(mut self, marker: &str) -> Self {
        self.rules.push((vec![marker.to_string()], Scripted::Fail));
        self
    }

    /// Sleep before every reply
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Every prompt received, in order
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    pub fn prompts_containing(&self, marker: &str) -> usize {
        self.prompts().iter().filter(|p| p.contains(marker)).count()
    }
}

impl Default for MockCompleter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TextCompleter for MockCompleter {
    async fn complete(&self, prompt: &str) -> Result<String, LlmError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let rule = self
            .rules
            .iter()
            .find(|(markers, _)| markers.iter().all(|m| prompt.contains(m.as_str())));
        match rule {
            Some((_, Scripted::Text(text))) => Ok(text.clone()),
            Some((_, Scripted::Fail)) => Err(LlmError::server_error("scripted failure")),
            None => Err(LlmError::network("No mock response scripted")),
        }
    }
}

// ============================================================================
// Mock Tool Provider
// ============================================================================

#[derive(Clone)]
enum ToolBehavior {
    Content(String),
    Failing(String),
    Broken(String),
    Slow(Duration, String),
}

/// Tool provider with scripted tools
pub struct MockToolProvider {
    name: String,
    tools: Vec<(ToolDescriptor, ToolBehavior)>,
    reachable: bool,
    listing_delay: Option<Duration>,
    invocations: Arc<Mutex<Vec<(String, Value)>>>,
}

#[allow(dead_code)]
impl MockToolProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tools: Vec::new(),
            reachable: true,
            listing_delay: None,
            invocations: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn with(mut self, tool: ToolDescriptor, behavior: ToolBehavior) -> Self {
        self.tools.push((tool, behavior));
        self
    }

    /// Tool that succeeds with `content`
    #[must_use]
    pub fn with_tool(self, tool: ToolDescriptor, content: &str) -> Self {
        self.with(tool, ToolBehavior::Content(content.to_string()))
    }

    /// Tool that reports an error payload
    #[must_use]
    pub fn with_failing_tool(self, tool: ToolDescriptor, error: &str) -> Self {
        self.with(tool, ToolBehavior::Failing(error.to_string()))
    }

    /// Tool whose transport breaks
    #[must_use]
    pub fn with_broken_tool(self, tool: ToolDescriptor, message: &str) -> Self {
        self.with(tool, ToolBehavior::Broken(message.to_string()))
    }

    /// Tool that sleeps before succeeding
    #[must_use]
    pub fn with_slow_tool(self, tool: ToolDescriptor, delay: Duration, content: &str) -> Self {
        self.with(tool, ToolBehavior::Slow(delay, content.to_string()))
    }

    /// Provider whose tool listing fails
    #[must_use]
    pub fn unreachable(mut self) -> Self {
        self.reachable = false;
        self
    }

    /// Provider whose tool listing takes `delay` to answer
    #[must_use]
    pub fn with_stalled_listing(mut self, delay: Duration) -> Self {
        self.listing_delay = Some(delay);
        self
    }

    /// Shared record of `(tool, arguments)` for every invocation
    pub fn invocations(&self) -> Arc<Mutex<Vec<(String, Value)>>> {
        self.invocations.clone()
    }
}

#[async_trait]
impl ToolProvider for MockToolProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, ToolError> {
        if let Some(delay) = self.listing_delay {
            tokio::time::sleep(delay).await;
        }
        if !self.reachable {
            return Err(ToolError::Transport("connection refused".to_string()));
        }
        Ok(self.tools.iter().map(|(t, _)| t.clone()).collect())
    }

    async fn invoke(&self, tool: &str, parameters: &Value) -> Result<ToolOutput, ToolError> {
        self.invocations
            .lock()
            .unwrap()
            .push((tool.to_string(), parameters.clone()));

        let behavior = self
            .tools
            .iter()
            .find(|(t, _)| t.name == tool)
            .map(|(_, b)| b.clone())
            .ok_or_else(|| ToolError::NotFound(tool.to_string()))?;

        match behavior {
            ToolBehavior::Content(content) => Ok(ToolOutput::Content(content)),
            ToolBehavior::Failing(error) => Ok(ToolOutput::Error(error)),
            ToolBehavior::Broken(message) => Err(ToolError::Transport(message)),
            ToolBehavior::Slow(delay, content) => {
                tokio::time::sleep(delay).await;
                Ok(ToolOutput::Content(content))
            }
        }
    }
}

// ============================================================================
// In-Memory Storage
// ============================================================================

/// In-memory storage for testing
#[derive(Clone, Default)]
pub struct InMemoryStorage {
    states: Arc<Mutex<HashMap<String, ConversationState>>>,
    messages: Arc<Mutex<HashMap<String, Vec<Message>>>>,
    fail_saves: Arc<AtomicBool>,
    saves: Arc<AtomicUsize>,
}

#[allow(dead_code)]
impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, conv_id: &str) -> Option<ConversationState> {
        self.states.lock().unwrap().get(conv_id).cloned()
    }

    /// Seed a state without going through the manager
    pub fn set_state(&self, conv_id: &str, state: ConversationState) {
        self.states
            .lock()
            .unwrap()
            .insert(conv_id.to_string(), state);
    }

    pub fn fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    /// Number of successful saves
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StateStore for InMemoryStorage {
    async fn load(&self, conv_id: &str) -> Result<ConversationState, StoreError> {
        Ok(self.state(conv_id).unwrap_or_default())
    }

    async fn save(&self, conv_id: &str, state: &ConversationState) -> Result<(), StoreError> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(StoreError("disk I/O error".to_string()));
        }
        self.set_state(conv_id, state.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn clear(&self, conv_id: &str) -> Result<(), StoreError> {
        self.states.lock().unwrap().remove(conv_id);
        Ok(())
    }
}

#[async_trait]
impl MessageStore for InMemoryStorage {
    async fn append_message(
        &self,
        conv_id: &str,
        role: MessageRole,
        content: &str,
    ) -> Result<Message, StoreError> {
        let mut messages = self.messages.lock().unwrap();
        let conv_messages = messages.entry(conv_id.to_string()).or_default();
        let message = Message {
            message_id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conv_id.to_string(),
            sequence_id: i64::try_from(conv_messages.len()).unwrap() + 1,
            role,
            content: content.to_string(),
            created_at: Utc::now(),
        };
        conv_messages.push(message.clone());
        Ok(message)
    }

    async fn list_messages(&self, conv_id: &str) -> Result<Vec<Message>, StoreError> {
        Ok(self
            .messages
            .lock()
            .unwrap()
            .get(conv_id)
            .cloned()
            .unwrap_or_default())
    }
}

// ============================================================================
// Instrumented Storage (for concurrency testing)
// ============================================================================

/// Storage that detects overlapping load..save windows.
///
/// A turn is "open" between its load and its save. Two open turns for the
/// same id mean the read-modify-write was interleaved.
#[derive(Clone, Default)]
pub struct InstrumentedStore {
    inner: InMemoryStorage,
    load_delay: Duration,
    open: Arc<Mutex<HashMap<String, usize>>>,
    open_total: Arc<AtomicUsize>,
    max_open_total: Arc<AtomicUsize>,
    interleavings: Arc<AtomicUsize>,
}

#[allow(dead_code)]
impl InstrumentedStore {
    pub fn new(load_delay: Duration) -> Self {
        Self {
            load_delay,
            ..Default::default()
        }
    }

    /// Same-id turns that overlapped
    pub fn interleavings(&self) -> usize {
        self.interleavings.load(Ordering::SeqCst)
    }

    /// Most turns open at once across all ids
    pub fn max_concurrent(&self) -> usize {
        self.max_open_total.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &InMemoryStorage {
        &self.inner
    }
}

#[async_trait]
impl StateStore for InstrumentedStore {
    async fn load(&self, conv_id: &str) -> Result<ConversationState, StoreError> {
        {
            let mut open = self.open.lock().unwrap();
            let count = open.entry(conv_id.to_string()).or_default();
            *count += 1;
            if *count > 1 {
                self.interleavings.fetch_add(1, Ordering::SeqCst);
            }
        }
        let total = self.open_total.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_open_total.fetch_max(total, Ordering::SeqCst);

        tokio::time::sleep(self.load_delay).await;
        self.inner.load(conv_id).await
    }

    async fn save(&self, conv_id: &str, state: &ConversationState) -> Result<(), StoreError> {
        let result = self.inner.save(conv_id, state).await;
        if let Some(count) = self.open.lock().unwrap().get_mut(conv_id) {
            *count = count.saturating_sub(1);
        }
        self.open_total.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn clear(&self, conv_id: &str) -> Result<(), StoreError> {
        self.inner.clear(conv_id).await
    }
}

// ============================================================================
// Test Manager Builder
// ============================================================================

/// Builder for managers wired to mocks
pub struct TestManager {
    completer: MockCompleter,
    providers: Vec<MockToolProvider>,
    config: ManagerConfig,
}

#[allow(dead_code)]
impl TestManager {
    pub fn new() -> Self {
        Self {
            completer: MockCompleter::new(),
            providers: Vec::new(),
            config: ManagerConfig {
                reasoner_timeout: Duration::from_secs(5),
                tool_timeout: Duration::from_secs(5),
                phrase_clarifications: true,
                strict_invariants: true,
                idle_timeout: Duration::from_secs(60),
            },
        }
    }

    #[must_use]
    pub fn with_completer(mut self, completer: MockCompleter) -> Self {
        self.completer = completer;
        self
    }

    #[must_use]
    pub fn with_provider(mut self, provider: MockToolProvider) -> Self {
        self.providers.push(provider);
        self
    }

    #[must_use]
    pub fn with_config(mut self, f: impl FnOnce(&mut ManagerConfig)) -> Self {
        f(&mut self.config);
        self
    }

    pub async fn build_with<S: StateStore + Clone + 'static>(
        self,
        store: S,
    ) -> (ConversationManager<S>, Arc<MockCompleter>) {
        let registry = Arc::new(ToolProviderRegistry::new());
        for provider in self.providers {
            registry.add_global(Arc::new(provider)).await;
        }
        let completer = Arc::new(self.completer);
        let manager = ConversationManager::new(store, registry, completer.clone(), self.config);
        (manager, completer)
    }

    pub async fn build(
        self,
    ) -> (
        ConversationManager<InMemoryStorage>,
        InMemoryStorage,
        Arc<MockCompleter>,
    ) {
        let store = InMemoryStorage::new();
        let (manager, completer) = self.build_with(store.clone()).await;
        (manager, store, completer)
    }
}

impl Default for TestManager {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::ALL_FAILED_MESSAGE;
    use crate::reasoner::prompts::{
        ANSWER_INSTRUCTION, CLARIFY_INSTRUCTION, DETECT_INSTRUCTION, INTENT_INSTRUCTION,
        SYNTHESIZE_INSTRUCTION,
    };
    use crate::runtime::{Outcome, TurnOptions, EMPTY_UTTERANCE_MESSAGE, UNAVAILABLE_MESSAGE};
    use crate::state_machine::{MissingParam, PendingTool, Phase};
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    fn weather() -> ToolDescriptor {
        ToolDescriptor::new("weather", "Current weather for a place")
            .with_required("location", "location to check")
    }

    fn flights() -> ToolDescriptor {
        ToolDescriptor::new("book_flight", "Book a flight")
            .with_required("origin", "departure city")
            .with_required("destination", "arrival city")
    }

    fn invoked(invocations: &Arc<Mutex<Vec<(String, Value)>>>) -> Vec<(String, Value)> {
        invocations.lock().unwrap().clone()
    }

    // ------------------------------------------------------------------------
    // Mocks
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_mock_completer_rules() {
        let completer = MockCompleter::new()
            .respond_when(&["detect", "weather"], "first")
            .respond("detect", "second")
            .fail_on("broken");

        assert_eq!(completer.complete("detect the weather").await.unwrap(), "first");
        assert_eq!(completer.complete("detect clocks").await.unwrap(), "second");
        assert!(completer.complete("broken").await.is_err());
        assert!(completer.complete("unscripted").await.is_err());
        assert_eq!(completer.prompts().len(), 4);
    }

    #[tokio::test]
    async fn test_in_memory_storage() {
        let storage = InMemoryStorage::new();
        assert!(storage.load("conv-1").await.unwrap().is_initial());

        storage
            .append_message("conv-1", MessageRole::User, "hello")
            .await
            .unwrap();
        let reply = storage
            .append_message("conv-1", MessageRole::Assistant, "hi")
            .await
            .unwrap();
        assert_eq!(reply.sequence_id, 2);
        assert_eq!(storage.list_messages("conv-1").await.unwrap().len(), 2);

        storage.fail_saves(true);
        assert!(storage
            .save("conv-1", &ConversationState::default())
            .await
            .is_err());
        assert_eq!(storage.save_count(), 0);
    }

    // ------------------------------------------------------------------------
    // Scenarios
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_greeting_with_unrelated_tool_answers_directly() {
        let provider = MockToolProvider::new("mcp").with_tool(weather(), "12C");
        let invocations = provider.invocations();
        let (manager, store, _) = TestManager::new()
            .with_provider(provider)
            .with_completer(
                MockCompleter::new()
                    .respond(DETECT_INSTRUCTION, "[]")
                    .respond(ANSWER_INSTRUCTION, "Hi! How can I help?"),
            )
            .build()
            .await;

        let outcome = manager.process_message("conv-1", "hello").await;

        assert_eq!(outcome, Outcome::FinalAnswer("Hi! How can I help?".to_string()));
        assert!(store.state("conv-1").unwrap().is_initial());
        assert!(invoked(&invocations).is_empty());
    }

    #[tokio::test]
    async fn test_clarification_then_execution() {
        let provider = MockToolProvider::new("mcp").with_tool(weather(), "12C and raining");
        let invocations = provider.invocations();
        let (manager, store, completer) = TestManager::new()
            .with_provider(provider)
            .with_completer(
                MockCompleter::new()
                    .respond(DETECT_INSTRUCTION, r#"["weather"]"#)
                    .respond(CLARIFY_INSTRUCTION, "Which location should I check?")
                    .respond(INTENT_INSTRUCTION, "provide_param")
                    .respond(SYNTHESIZE_INSTRUCTION, "It's 12C and raining, bring a coat."),
            )
            .build()
            .await;

        let outcome = manager.process_message("conv-1", "what should I wear").await;
        assert!(matches!(&outcome, Outcome::Clarification(text) if text.contains("location")));

        let state = store.state("conv-1").unwrap();
        assert_eq!(state.phase, Phase::CollectingParams);
        assert_eq!(state.pending_tools, vec![PendingTool::new("weather")]);
        assert_eq!(
            state.missing_params,
            vec![MissingParam::new("weather", "location", "location to check")]
        );
        assert!(invoked(&invocations).is_empty());

        let outcome = manager.process_message("conv-1", "Boston").await;
        assert_eq!(
            outcome,
            Outcome::FinalAnswer("It's 12C and raining, bring a coat.".to_string())
        );
        assert_eq!(
            invoked(&invocations),
            vec![("weather".to_string(), json!({"location": "Boston"}))]
        );
        assert!(store.state("conv-1").unwrap().is_initial());

        // The original request is replayed into synthesis
        let synthesis = completer
            .prompts()
            .into_iter()
            .find(|p| p.contains(SYNTHESIZE_INSTRUCTION))
            .unwrap();
        assert!(synthesis.contains("what should I wear"));
        assert!(synthesis.contains("12C and raining"));
    }

    #[tokio::test]
    async fn test_two_missing_parameters_ask_twice() {
        let provider = MockToolProvider::new("mcp").with_tool(flights(), "Booked BOS-DEN");
        let invocations = provider.invocations();
        let (manager, store, _) = TestManager::new()
            .with_provider(provider)
            .with_completer(
                MockCompleter::new()
                    .respond(DETECT_INSTRUCTION, r#"["book_flight"]"#)
                    .respond(SYNTHESIZE_INSTRUCTION, "Your flight is booked."),
            )
            .build()
            .await;

        // No phrasing or intent scripted: template questions and heuristic intent
        let first = manager.process_message("conv-1", "book me a flight").await;
        assert_eq!(
            first,
            Outcome::Clarification(
                "I need the departure city for the book_flight tool. Could you provide it?"
                    .to_string()
            )
        );

        let second = manager.process_message("conv-1", "Boston").await;
        assert_eq!(
            second,
            Outcome::Clarification(
                "I need the arrival city for the book_flight tool. Could you provide it?"
                    .to_string()
            )
        );
        assert_eq!(store.state("conv-1").unwrap().collected_params["origin"], "Boston");

        let third = manager.process_message("conv-1", "Denver").await;
        assert_eq!(third, Outcome::FinalAnswer("Your flight is booked.".to_string()));
        assert_eq!(
            invoked(&invocations),
            vec![(
                "book_flight".to_string(),
                json!({"origin": "Boston", "destination": "Denver"})
            )]
        );
        assert!(store.state("conv-1").unwrap().is_initial());
    }

    #[tokio::test]
    async fn test_partial_failure_still_answers() {
        let provider = MockToolProvider::new("mcp")
            .with_tool(ToolDescriptor::new("t1", "first"), "one")
            .with_failing_tool(ToolDescriptor::new("t2", "second"), "quota exceeded");
        let (manager, store, _) = TestManager::new()
            .with_provider(provider)
            .with_completer(
                MockCompleter::new()
                    .respond(DETECT_INSTRUCTION, r#"["t1", "t2"]"#)
                    .respond(SYNTHESIZE_INSTRUCTION, "Here is the first result: one."),
            )
            .build()
            .await;

        let outcome = manager.process_message("conv-1", "do both things").await;

        let Outcome::FinalAnswer(text) = outcome else {
            panic!("expected a final answer, got {outcome:?}");
        };
        assert!(text.starts_with("Here is the first result: one."));
        assert!(text.contains("t2 (quota exceeded)"));
        assert!(store.state("conv-1").unwrap().is_initial());
    }

    #[tokio::test]
    async fn test_all_tools_failing_is_an_error_without_synthesis() {
        let provider = MockToolProvider::new("mcp")
            .with_failing_tool(ToolDescriptor::new("t1", "first"), "boom")
            .with_broken_tool(ToolDescriptor::new("t2", "second"), "connection reset");
        let (manager, store, completer) = TestManager::new()
            .with_provider(provider)
            .with_completer(
                MockCompleter::new()
                    .respond(DETECT_INSTRUCTION, r#"["t1", "t2"]"#)
                    .respond(SYNTHESIZE_INSTRUCTION, "should not be used"),
            )
            .build()
            .await;

        let outcome = manager.process_message("conv-1", "do both things").await;

        assert_eq!(outcome, Outcome::Error(ALL_FAILED_MESSAGE.to_string()));
        assert_eq!(completer.prompts_containing(SYNTHESIZE_INSTRUCTION), 0);
        assert!(store.state("conv-1").unwrap().is_initial());
    }

    #[tokio::test]
    async fn test_cancel_during_collection() {
        let provider = MockToolProvider::new("mcp").with_tool(weather(), "12C");
        let invocations = provider.invocations();
        let (manager, store, _) = TestManager::new()
            .with_provider(provider)
            .with_completer(
                MockCompleter::new()
                    .respond(DETECT_INSTRUCTION, r#"["weather"]"#)
                    .respond(INTENT_INSTRUCTION, "cancel"),
            )
            .build()
            .await;

        manager.process_message("conv-1", "what should I wear").await;
        let outcome = manager.process_message("conv-1", "never mind").await;

        assert_eq!(outcome, Outcome::Cancelled("Okay, cancelled.".to_string()));
        assert!(store.state("conv-1").unwrap().is_initial());
        assert!(invoked(&invocations).is_empty());
    }

    #[tokio::test]
    async fn test_new_topic_reruns_detection() {
        let provider = MockToolProvider::new("mcp").with_tool(weather(), "12C");
        let invocations = provider.invocations();
        let (manager, store, completer) = TestManager::new()
            .with_provider(provider)
            .with_completer(
                MockCompleter::new()
                    .respond_when(&[DETECT_INSTRUCTION, "tell me a joke"], "[]")
                    .respond(DETECT_INSTRUCTION, r#"["weather"]"#)
                    .respond(INTENT_INSTRUCTION, "new_topic")
                    .respond(ANSWER_INSTRUCTION, "Why did the tool cross the road?"),
            )
            .build()
            .await;

        manager.process_message("conv-1", "what should I wear").await;
        let outcome = manager
            .process_message("conv-1", "actually, tell me a joke")
            .await;

        assert_eq!(
            outcome,
            Outcome::FinalAnswer("Why did the tool cross the road?".to_string())
        );
        assert!(store.state("conv-1").unwrap().is_initial());
        assert!(invoked(&invocations).is_empty());
        assert_eq!(completer.prompts_containing(DETECT_INSTRUCTION), 2);
    }

    #[tokio::test]
    async fn test_reasoner_down_falls_back_to_heuristics() {
        let provider = MockToolProvider::new("mcp").with_tool(weather(), "12C");
        let (manager, store, _) = TestManager::new()
            .with_provider(provider)
            .with_completer(MockCompleter::new().respond(DETECT_INSTRUCTION, r#"["weather"]"#))
            .build()
            .await;

        manager.process_message("conv-1", "what should I wear").await;
        let outcome = manager.process_message("conv-1", "forget it").await;
        assert!(matches!(outcome, Outcome::Cancelled(_)));
        assert!(store.state("conv-1").unwrap().is_initial());
    }

    // ------------------------------------------------------------------------
    // Reset, validation and storage failures
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_reset_normal_conversation_is_noop() {
        let (manager, store, _) = TestManager::new().build().await;

        manager.reset_conversation("conv-1").await.unwrap();

        assert_eq!(store.save_count(), 0);
        assert!(store.state("conv-1").is_none());
    }

    #[tokio::test]
    async fn test_reset_drops_pending_collection() {
        let provider = MockToolProvider::new("mcp").with_tool(weather(), "12C");
        let (manager, store, completer) = TestManager::new()
            .with_provider(provider)
            .with_completer(
                MockCompleter::new()
                    .respond(DETECT_INSTRUCTION, r#"["weather"]"#)
                    .respond(CLARIFY_INSTRUCTION, "Which location?"),
            )
            .build()
            .await;

        manager.process_message("conv-1", "what should I wear").await;
        manager.reset_conversation("conv-1").await.unwrap();
        assert!(store.state("conv-1").unwrap().is_initial());

        // The next utterance is a fresh request, not a parameter value
        let outcome = manager.process_message("conv-1", "Boston").await;
        assert!(matches!(outcome, Outcome::Clarification(_)));
        assert_eq!(completer.prompts_containing(INTENT_INSTRUCTION), 0);
        assert_eq!(completer.prompts_containing(DETECT_INSTRUCTION), 2);
    }

    #[tokio::test]
    async fn test_empty_utterance_is_rejected() {
        let (manager, store, completer) = TestManager::new().build().await;

        let outcome = manager.process_message("conv-1", "   ").await;

        assert_eq!(outcome, Outcome::Error(EMPTY_UTTERANCE_MESSAGE.to_string()));
        assert!(completer.prompts().is_empty());
        assert!(store.state("conv-1").is_none());
    }

    #[tokio::test]
    async fn test_save_failure_leaves_state_untouched() {
        let provider = MockToolProvider::new("mcp").with_tool(weather(), "12C");
        let (manager, store, _) = TestManager::new()
            .with_provider(provider)
            .with_completer(MockCompleter::new().respond(DETECT_INSTRUCTION, r#"["weather"]"#))
            .build()
            .await;

        manager.process_message("conv-1", "what should I wear").await;
        let before = store.state("conv-1").unwrap();

        store.fail_saves(true);
        let outcome = manager.process_message("conv-1", "Boston").await;

        assert_eq!(outcome, Outcome::Error(UNAVAILABLE_MESSAGE.to_string()));
        assert_eq!(store.state("conv-1").unwrap(), before);
    }

    fn broken_state() -> ConversationState {
        ConversationState {
            phase: Phase::Normal,
            missing_params: vec![MissingParam::new("weather", "location", "city")],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_strict_mode_refuses_broken_state() {
        let (manager, store, completer) = TestManager::new().build().await;
        store.set_state("conv-1", broken_state());

        let outcome = manager.process_message("conv-1", "hello").await;

        let Outcome::Error(text) = outcome else {
            panic!("expected an error, got {outcome:?}");
        };
        assert!(text.contains("missing while phase is normal"));
        assert_eq!(store.state("conv-1").unwrap(), broken_state());
        assert!(completer.prompts().is_empty());
    }

    #[tokio::test]
    async fn test_lenient_mode_resets_broken_state() {
        let (manager, store, _) = TestManager::new()
            .with_completer(MockCompleter::new().respond(ANSWER_INSTRUCTION, "Hello!"))
            .with_config(|c| c.strict_invariants = false)
            .build()
            .await;
        store.set_state("conv-1", broken_state());

        let outcome = manager.process_message("conv-1", "hello").await;

        assert_eq!(outcome, Outcome::FinalAnswer("Hello!".to_string()));
        assert!(store.state("conv-1").unwrap().is_initial());
    }

    #[tokio::test]
    async fn test_unreachable_provider_tools_are_absent() {
        let down = MockToolProvider::new("down").with_tool(weather(), "12C").unreachable();
        let (manager, _, completer) = TestManager::new()
            .with_provider(down)
            .with_completer(MockCompleter::new().respond(ANSWER_INSTRUCTION, "Hi"))
            .build()
            .await;

        assert!(manager.catalog_for("conv-1").await.is_empty());
        let outcome = manager.process_message("conv-1", "what should I wear").await;
        assert_eq!(outcome, Outcome::FinalAnswer("Hi".to_string()));
        // Empty catalog: detection never reaches the reasoner
        assert_eq!(completer.prompts_containing(DETECT_INSTRUCTION), 0);
    }

    #[tokio::test]
    async fn test_chained_pending_tools_feed_output_forward() {
        let provider = MockToolProvider::new("mcp")
            .with_tool(
                ToolDescriptor::new("find", "Find a file").with_required("pattern", "file pattern"),
                "/srv/report.txt",
            )
            .with_tool(ToolDescriptor::new("read", "Read a file"), "quarterly numbers");
        let invocations = provider.invocations();
        let (manager, store, _) = TestManager::new()
            .with_provider(provider)
            .with_completer(
                MockCompleter::new()
                    .respond(INTENT_INSTRUCTION, "provide_param")
                    .respond(SYNTHESIZE_INSTRUCTION, "The report has the quarterly numbers."),
            )
            .build()
            .await;
        store.set_state(
            "conv-1",
            ConversationState {
                phase: Phase::CollectingParams,
                pending_tools: vec![
                    PendingTool::new("find"),
                    PendingTool::new("read").chained_into("path"),
                ],
                missing_params: vec![MissingParam::new("find", "pattern", "file pattern")],
                original_message: Some("read the report".to_string()),
                ..Default::default()
            },
        );

        let outcome = manager.process_message("conv-1", "*.txt").await;

        assert_eq!(
            outcome,
            Outcome::FinalAnswer("The report has the quarterly numbers.".to_string())
        );
        let calls = invoked(&invocations);
        assert_eq!(calls[0].0, "find");
        assert_eq!(calls[0].1["pattern"], "*.txt");
        assert_eq!(calls[1].0, "read");
        assert_eq!(calls[1].1["path"], "/srv/report.txt");
        assert!(store.state("conv-1").unwrap().is_initial());
    }

    #[tokio::test]
    async fn test_stalled_provider_is_skipped_after_tool_timeout() {
        let stalled = MockToolProvider::new("stalled")
            .with_tool(ToolDescriptor::new("clock", "Current time"), "noon")
            .with_stalled_listing(Duration::from_secs(3600));
        let up = MockToolProvider::new("up").with_tool(weather(), "12C and raining");
        let (manager, store, completer) = TestManager::new()
            .with_provider(stalled)
            .with_provider(up)
            .with_completer(
                MockCompleter::new()
                    .respond(DETECT_INSTRUCTION, r#"["weather"]"#)
                    .respond(CLARIFY_INSTRUCTION, "Which location should I check?"),
            )
            .with_config(|c| c.tool_timeout = Duration::from_millis(100))
            .build()
            .await;

        let outcome = tokio::time::timeout(
            Duration::from_secs(2),
            manager.process_message("conv-1", "what should I wear"),
        )
        .await
        .expect("turn should not wait on the stalled provider");

        assert!(matches!(outcome, Outcome::Clarification(_)));
        assert_eq!(store.state("conv-1").unwrap().phase, Phase::CollectingParams);
        let detect = completer
            .prompts()
            .into_iter()
            .find(|p| p.contains(DETECT_INSTRUCTION))
            .unwrap();
        assert!(detect.contains("weather"));
        assert!(!detect.contains("clock"));
    }

    #[tokio::test]
    async fn test_deadline_bounds_tool_listing() {
        let stalled = MockToolProvider::new("stalled")
            .with_tool(weather(), "12C")
            .with_stalled_listing(Duration::from_secs(3600));
        let (manager, store, _) = TestManager::new()
            .with_provider(stalled)
            .with_completer(MockCompleter::new().respond(ANSWER_INSTRUCTION, "Hi"))
            .build()
            .await;

        let opts = TurnOptions::default()
            .with_deadline(tokio::time::Instant::now() + Duration::from_millis(100));
        tokio::time::timeout(
            Duration::from_secs(2),
            manager.process_message_with("conv-1", "hello", opts),
        )
        .await
        .expect("deadline should end the turn");

        assert!(store.state("conv-1").map_or(true, |s| s.is_initial()));
    }

    #[tokio::test]
    async fn test_cancel_during_tool_listing_frees_conversation() {
        let stalled = MockToolProvider::new("stalled")
            .with_tool(weather(), "12C")
            .with_stalled_listing(Duration::from_secs(3600));
        let (manager, store, _) = TestManager::new()
            .with_provider(stalled)
            .with_completer(MockCompleter::new().respond(ANSWER_INSTRUCTION, "Hi"))
            .build()
            .await;

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let opts = TurnOptions::default().with_cancel(cancel);
        let outcome = tokio::time::timeout(
            Duration::from_secs(2),
            manager.process_message_with("conv-1", "hello", opts),
        )
        .await
        .expect("cancellation should end the turn");

        assert!(matches!(outcome, Outcome::Error(_)));
        assert_eq!(store.save_count(), 0);
    }

    // ------------------------------------------------------------------------
    // Concurrency and cancellation
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_same_conversation_turns_are_serialized() {
        let store = InstrumentedStore::new(Duration::from_millis(20));
        let (manager, _) = TestManager::new()
            .with_completer(MockCompleter::new().respond(ANSWER_INSTRUCTION, "ok"))
            .build_with(store.clone())
            .await;
        let manager = Arc::new(manager);

        let handles: Vec<_> = (0..5)
            .map(|i| {
                let manager = manager.clone();
                tokio::spawn(async move {
                    manager
                        .process_message("conv-1", &format!("message {i}"))
                        .await
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.await.unwrap(), Outcome::FinalAnswer("ok".to_string()));
        }
        assert_eq!(store.interleavings(), 0);
        assert_eq!(store.max_concurrent(), 1);
    }

    #[tokio::test]
    async fn test_different_conversations_run_in_parallel() {
        let store = InstrumentedStore::new(Duration::from_millis(100));
        let (manager, _) = TestManager::new()
            .with_completer(MockCompleter::new().respond(ANSWER_INSTRUCTION, "ok"))
            .build_with(store.clone())
            .await;
        let manager = Arc::new(manager);

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let manager = manager.clone();
                tokio::spawn(async move {
                    manager
                        .process_message(&format!("conv-{i}"), "hello")
                        .await
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.await.unwrap(), Outcome::FinalAnswer("ok".to_string()));
        }

        assert_eq!(store.interleavings(), 0);
        assert!(store.max_concurrent() > 1);
    }

    #[tokio::test]
    async fn test_slow_conversation_does_not_block_others() {
        let provider = MockToolProvider::new("mcp").with_slow_tool(
            ToolDescriptor::new("slow", "takes a while"),
            Duration::from_millis(500),
            "done",
        );
        let (manager, _, _) = TestManager::new()
            .with_provider(provider)
            .with_completer(
                MockCompleter::new()
                    .respond_when(&[DETECT_INSTRUCTION, "run the slow job"], r#"["slow"]"#)
                    .respond(DETECT_INSTRUCTION, "[]")
                    .respond(SYNTHESIZE_INSTRUCTION, "The job is done.")
                    .respond(ANSWER_INSTRUCTION, "Hi!"),
            )
            .build()
            .await;
        let manager = Arc::new(manager);

        let slow = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.process_message("conv-a", "run the slow job").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let fast = tokio::time::timeout(
            Duration::from_millis(300),
            manager.process_message("conv-b", "hello"),
        )
        .await
        .expect("other conversation was blocked");
        assert_eq!(fast, Outcome::FinalAnswer("Hi!".to_string()));
        assert!(!slow.is_finished());

        assert_eq!(
            slow.await.unwrap(),
            Outcome::FinalAnswer("The job is done.".to_string())
        );
    }

    fn chain_provider() -> MockToolProvider {
        MockToolProvider::new("mcp")
            .with_slow_tool(
                ToolDescriptor::new("slow", "takes a while"),
                Duration::from_millis(200),
                "done",
            )
            .with_tool(ToolDescriptor::new("after", "runs second"), "after")
    }

    fn chain_completer() -> MockCompleter {
        MockCompleter::new()
            .respond(DETECT_INSTRUCTION, r#"["slow", "after"]"#)
            .respond(SYNTHESIZE_INSTRUCTION, "All done.")
    }

    #[tokio::test]
    async fn test_cancelled_turn_skips_rest_of_chain() {
        let provider = chain_provider();
        let invocations = provider.invocations();
        let (manager, store, _) = TestManager::new()
            .with_provider(provider)
            .with_completer(chain_completer())
            .build()
            .await;

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let outcome = manager
            .process_message_with(
                "conv-1",
                "run the jobs",
                TurnOptions::default().with_cancel(cancel),
            )
            .await;

        assert!(matches!(outcome, Outcome::Error(_)));
        let names: Vec<String> = invoked(&invocations).into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["slow"]);
        assert_eq!(store.save_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_caller_cancels_turn() {
        let provider = chain_provider();
        let invocations = provider.invocations();
        let (manager, store, _) = TestManager::new()
            .with_provider(provider)
            .with_completer(chain_completer())
            .build()
            .await;
        let manager = Arc::new(manager);

        let turn = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.process_message("conv-1", "run the jobs").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        turn.abort();

        // Let the in-flight tool finish
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(invoked(&invocations).len(), 1);
        assert_eq!(store.save_count(), 0);

        // The conversation still works afterwards
        let outcome = manager.process_message("conv-1", "run the jobs").await;
        assert!(matches!(outcome, Outcome::FinalAnswer(text) if text.starts_with("All done.")));
        assert_eq!(store.save_count(), 1);
    }

    #[tokio::test]
    async fn test_deadline_bounds_tool_calls() {
        let provider = MockToolProvider::new("mcp").with_slow_tool(
            ToolDescriptor::new("slow", "takes a while"),
            Duration::from_secs(5),
            "done",
        );
        let (manager, store, _) = TestManager::new()
            .with_provider(provider)
            .with_completer(MockCompleter::new().respond(DETECT_INSTRUCTION, r#"["slow"]"#))
            .build()
            .await;

        let started = std::time::Instant::now();
        let opts = TurnOptions::default()
            .with_deadline(tokio::time::Instant::now() + Duration::from_millis(100));
        let outcome = manager
            .process_message_with("conv-1", "run the slow job", opts)
            .await;

        assert_eq!(outcome, Outcome::Error(ALL_FAILED_MESSAGE.to_string()));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(store.state("conv-1").unwrap().is_initial());
    }

    #[tokio::test]
    async fn test_idle_conversation_actor_exits_and_restarts() {
        let (manager, store, _) = TestManager::new()
            .with_provider(MockToolProvider::new("mcp").with_tool(weather(), "12C and raining"))
            .with_completer(
                MockCompleter::new()
                    .respond(DETECT_INSTRUCTION, r#"["weather"]"#)
                    .respond(CLARIFY_INSTRUCTION, "Which location should I check?")
                    .respond(INTENT_INSTRUCTION, "provide_param")
                    .respond(SYNTHESIZE_INSTRUCTION, "It's 12C and raining."),
            )
            .with_config(|c| c.idle_timeout = Duration::from_millis(50))
            .build()
            .await;

        let outcome = manager.process_message("conv-1", "what should I wear").await;
        assert!(matches!(outcome, Outcome::Clarification(_)));
        assert_eq!(manager.active_conversations().await, 1);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(manager.active_conversations().await, 0);

        // Stored state carries the collection over to the new actor
        let outcome = manager.process_message("conv-1", "Boston").await;
        assert_eq!(outcome, Outcome::FinalAnswer("It's 12C and raining.".to_string()));
        assert!(store.state("conv-1").unwrap().is_initial());
        assert_eq!(manager.active_conversations().await, 1);
    }
}
