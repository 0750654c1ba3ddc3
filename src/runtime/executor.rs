//! Conversation runtime executor
//!
//! Owns every turn for one conversation id. Requests arrive over an mpsc
//! queue and are handled one at a time, so a conversation's state is only ever
//! read-modify-written by a single turn.

use super::traits::{StateStore, StoreError};
use super::{Outcome, TurnOptions, TurnRequest, UNAVAILABLE_MESSAGE};
use crate::catalog::{ToolCatalog, ToolProviderRegistry};
use crate::orchestrator::{fallback_clarification, ToolOrchestrator};
use crate::reasoner::ReasonerError;
use crate::state_machine::{transition, ConversationState, Effect, Event, Phase};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

const CANCELLED_MESSAGE: &str = "Okay, cancelled.";
const TURN_CANCELLED_MESSAGE: &str = "The request was cancelled before it finished.";
const NO_ANSWER_MESSAGE: &str =
    "I couldn't come up with an answer right now. Please try again.";
const RECOVERED_MESSAGE: &str =
    "Something went wrong and this conversation was reset. Please try again.";

/// Per-actor behaviour knobs
#[derive(Debug, Clone, Copy)]
pub struct RuntimeLimits {
    pub strict_invariants: bool,
    pub idle_timeout: Duration,
}

/// What performing an effect produced
enum Performed {
    Events(Vec<Event>),
    Finished(Outcome),
}

pub struct ConversationRuntime<S: StateStore + 'static> {
    conversation_id: String,
    store: S,
    registry: Arc<ToolProviderRegistry>,
    orchestrator: Arc<ToolOrchestrator>,
    limits: RuntimeLimits,
    request_rx: mpsc::Receiver<TurnRequest>,
}

impl<S: StateStore + 'static> ConversationRuntime<S> {
    pub(crate) fn new(
        conversation_id: String,
        store: S,
        registry: Arc<ToolProviderRegistry>,
        orchestrator: Arc<ToolOrchestrator>,
        limits: RuntimeLimits,
        request_rx: mpsc::Receiver<TurnRequest>,
    ) -> Self {
        Self {
            conversation_id,
            store,
            registry,
            orchestrator,
            limits,
            request_rx,
        }
    }

    pub async fn run(mut self) {
        tracing::info!(conv_id = %self.conversation_id, "Starting conversation runtime");

        loop {
            let request =
                match tokio::time::timeout(self.limits.idle_timeout, self.request_rx.recv()).await {
                    Ok(Some(request)) => request,
                    Ok(None) => break,
                    Err(_) => {
                        tracing::info!(conv_id = %self.conversation_id, "Conversation idle, shutting down runtime");
                        // New work goes to a fresh actor; finish what is already queued
                        self.request_rx.close();
                        while let Some(request) = self.request_rx.recv().await {
                            self.handle(request).await;
                        }
                        break;
                    }
                };
            self.handle(request).await;
        }

        tracing::info!(conv_id = %self.conversation_id, "Conversation runtime stopped");
    }

    async fn handle(&self, request: TurnRequest) {
        match request {
            TurnRequest::Message {
                utterance,
                opts,
                reply,
            } => self.handle_message(&utterance, &opts, reply).await,
            TurnRequest::Reset { reply } => {
                let result = self.reset().await;
                let _ = reply.send(result);
            }
        }
    }

    async fn handle_message(
        &self,
        utterance: &str,
        opts: &TurnOptions,
        mut reply: oneshot::Sender<Outcome>,
    ) {
        let turn_opts = opts.child();
        let turn = self.run_turn(utterance, &turn_opts);
        tokio::pin!(turn);

        let outcome = tokio::select! {
            outcome = &mut turn => outcome,
            () = reply.closed() => {
                tracing::info!(conv_id = %self.conversation_id, "Caller went away, cancelling turn");
                turn_opts.cancel.cancel();
                turn.await
            }
        };

        if reply.send(outcome).is_err() {
            tracing::debug!(conv_id = %self.conversation_id, "Turn finished after caller left");
        }
    }

    async fn reset(&self) -> Result<(), StoreError> {
        let state = match self.store.load(&self.conversation_id).await {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!(conv_id = %self.conversation_id, error = %e, "Unreadable state on reset, clearing");
                return self.store.clear(&self.conversation_id).await;
            }
        };
        if state.is_initial() {
            return Ok(());
        }

        let result = transition(&state, Event::Reset)
            .map_err(|e| StoreError(e.to_string()))?;
        tracing::info!(conv_id = %self.conversation_id, phase = %state.phase.as_str(), "Conversation reset");
        self.store
            .save(&self.conversation_id, &result.new_state)
            .await
    }

    /// Run one turn to its outcome. The state is saved only when the turn
    /// completes without being cancelled.
    async fn run_turn(&self, utterance: &str, opts: &TurnOptions) -> Outcome {
        let conv_id = self.conversation_id.as_str();

        let mut state = match self.store.load(conv_id).await {
            Ok(state) => state,
            Err(e) => {
                tracing::error!(conv_id = %conv_id, error = %e, "Failed to load conversation state");
                return Outcome::Error(UNAVAILABLE_MESSAGE.to_string());
            }
        };

        if let Err(violation) = state.check_persisted() {
            if self.limits.strict_invariants {
                tracing::error!(conv_id = %conv_id, violation = %violation, "Stored state violates invariants");
                return Outcome::Error(format!(
                    "This conversation is in an inconsistent state ({violation}). Reset it to continue."
                ));
            }
            tracing::warn!(conv_id = %conv_id, violation = %violation, "Stored state violates invariants, resetting");
            state = ConversationState::default();
        }

        let catalog = self
            .registry
            .catalog_for(conv_id, opts, self.orchestrator.tool_timeout())
            .await;
        if opts.is_cancelled() {
            return self.abandon();
        }
        let first = self.initial_event(&state, utterance, &catalog, opts).await;

        let mut queue = VecDeque::from([first]);
        let mut outcome: Option<Outcome> = None;

        while let Some(event) = queue.pop_front() {
            if opts.is_cancelled() {
                return self.abandon();
            }

            let result = match transition(&state, event) {
                Ok(result) => result,
                Err(e) => {
                    tracing::error!(conv_id = %conv_id, error = %e, "Transition failed");
                    return Outcome::Error(UNAVAILABLE_MESSAGE.to_string());
                }
            };
            state = result.new_state;

            if let Err(violation) = state.check_invariants() {
                tracing::error!(conv_id = %conv_id, violation = %violation, "Transition produced an invalid state");
                if self.limits.strict_invariants {
                    return Outcome::Error(UNAVAILABLE_MESSAGE.to_string());
                }
                return self.recover().await;
            }

            for effect in result.effects {
                if effect.is_terminal() && outcome.is_some() {
                    tracing::warn!(conv_id = %conv_id, effect = ?effect, "Second terminal effect in one turn");
                }
                match self.perform(effect, &state, &catalog, opts).await {
                    Performed::Events(events) => queue.extend(events),
                    Performed::Finished(o) => outcome = Some(o),
                }
            }
        }

        if opts.is_cancelled() {
            return self.abandon();
        }

        if let Err(e) = self.store.save(conv_id, &state).await {
            tracing::error!(conv_id = %conv_id, error = %e, "Failed to save conversation state");
            return Outcome::Error(UNAVAILABLE_MESSAGE.to_string());
        }

        let outcome = outcome.unwrap_or_else(|| {
            tracing::error!(conv_id = %conv_id, "Turn ended without an outcome");
            Outcome::Error(UNAVAILABLE_MESSAGE.to_string())
        });
        tracing::info!(conv_id = %conv_id, phase = %state.phase.as_str(), outcome = ?outcome, "Turn complete");
        outcome
    }

    /// Replace a broken state with a fresh one and drop the rest of the turn
    async fn recover(&self) -> Outcome {
        let conv_id = self.conversation_id.as_str();
        if let Err(e) = self.store.save(conv_id, &ConversationState::default()).await {
            tracing::error!(conv_id = %conv_id, error = %e, "Failed to reset conversation state");
            return Outcome::Error(UNAVAILABLE_MESSAGE.to_string());
        }
        tracing::warn!(conv_id = %conv_id, "Conversation reset after invalid transition");
        Outcome::Error(RECOVERED_MESSAGE.to_string())
    }

    fn abandon(&self) -> Outcome {
        tracing::info!(conv_id = %self.conversation_id, "Turn cancelled, state left unchanged");
        Outcome::Error(TURN_CANCELLED_MESSAGE.to_string())
    }

    async fn initial_event(
        &self,
        state: &ConversationState,
        utterance: &str,
        catalog: &ToolCatalog,
        opts: &TurnOptions,
    ) -> Event {
        match (state.phase, state.next_missing()) {
            (Phase::CollectingParams, Some(param)) => {
                let question = fallback_clarification(param);
                let intent = self
                    .orchestrator
                    .classify_intent(&question, utterance, opts)
                    .await;
                tracing::debug!(conv_id = %self.conversation_id, intent = %intent.as_str(), "Classified reply");
                Event::UserReply {
                    utterance: utterance.to_string(),
                    intent,
                }
            }
            _ => Event::ToolsDetected {
                utterance: utterance.to_string(),
                tools: self
                    .orchestrator
                    .detect_required_tools(utterance, catalog, opts)
                    .await,
            },
        }
    }

    async fn perform(
        &self,
        effect: Effect,
        state: &ConversationState,
        catalog: &ToolCatalog,
        opts: &TurnOptions,
    ) -> Performed {
        match effect {
            Effect::DetectTools { utterance } => {
                let tools = self
                    .orchestrator
                    .detect_required_tools(&utterance, catalog, opts)
                    .await;
                Performed::Events(vec![Event::ToolsDetected { utterance, tools }])
            }

            Effect::AskClarification { param } => {
                let original = state.original_message.as_deref().unwrap_or_default();
                let question = self
                    .orchestrator
                    .clarification_question(&param, catalog, original, opts)
                    .await;
                Performed::Finished(Outcome::Clarification(question))
            }

            Effect::ExecuteChain { calls, collected } => {
                let results = self
                    .orchestrator
                    .execute_tool_chain(&calls, &collected, catalog, opts)
                    .await;
                let mut events: Vec<Event> = results
                    .into_iter()
                    .map(|result| Event::ToolFinished { result })
                    .collect();
                events.push(Event::ChainCompleted);
                Performed::Events(events)
            }

            Effect::Synthesize {
                original_message,
                results,
            } => {
                let synthesis = self
                    .orchestrator
                    .generate_response(&original_message, &results, opts)
                    .await;
                if synthesis.all_failed() {
                    Performed::Finished(Outcome::Error(synthesis.text))
                } else {
                    Performed::Finished(Outcome::FinalAnswer(synthesis.text))
                }
            }

            Effect::PlainAnswer { utterance } => {
                match self.orchestrator.plain_answer(&utterance, opts).await {
                    Ok(text) if !text.is_empty() => Performed::Finished(Outcome::FinalAnswer(text)),
                    Ok(_) | Err(ReasonerError::Cancelled) => {
                        Performed::Finished(Outcome::Error(NO_ANSWER_MESSAGE.to_string()))
                    }
                    Err(e) => {
                        tracing::warn!(conv_id = %self.conversation_id, error = %e, "Plain answer failed");
                        Performed::Finished(Outcome::Error(NO_ANSWER_MESSAGE.to_string()))
                    }
                }
            }

            Effect::NotifyCancelled => {
                Performed::Finished(Outcome::Cancelled(CANCELLED_MESSAGE.to_string()))
            }
        }
    }
}
