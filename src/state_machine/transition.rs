//! Pure state transition function
//!
//! Given the same state and event this always produces the same result; all
//! I/O is described by the returned effects and performed by the runtime.

use super::event::Intent;
use super::state::{ConversationState, PendingTool, Phase, RecordedToolResult};
use super::{Effect, Event};
use crate::catalog::ToolDescriptor;
use crate::orchestrator::{check_missing_parameters, ToolCall};
use thiserror::Error;

/// Result of a state transition
#[derive(Debug)]
pub struct TransitionResult {
    pub new_state: ConversationState,
    pub effects: Vec<Effect>,
}

impl TransitionResult {
    pub fn new(state: ConversationState) -> Self {
        Self {
            new_state: state,
            effects: vec![],
        }
    }

    pub fn with_effect(mut self, effect: Effect) -> Self {
        self.effects.push(effect);
        self
    }
}

/// Errors that can occur during transition
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("Invalid transition: {event} while {phase}")]
    InvalidTransition {
        phase: &'static str,
        event: &'static str,
    },
}

fn event_name(event: &Event) -> &'static str {
    match event {
        Event::ToolsDetected { .. } => "tools_detected",
        Event::UserReply { .. } => "user_reply",
        Event::ToolFinished { .. } => "tool_finished",
        Event::ChainCompleted => "chain_completed",
        Event::Reset => "reset",
    }
}

/// Pure transition function
pub fn transition(
    state: &ConversationState,
    event: Event,
) -> Result<TransitionResult, TransitionError> {
    match (state.phase, event) {
        // ============================================================
        // Reset is accepted everywhere and always lands on the initial state
        // ============================================================
        (_, Event::Reset) => Ok(TransitionResult::new(ConversationState::default())),

        // ============================================================
        // Normal phase: a fresh utterance has been run through detection
        // ============================================================
        (Phase::Normal, Event::ToolsDetected { utterance, tools }) => {
            if tools.is_empty() {
                return Ok(TransitionResult::new(ConversationState::default())
                    .with_effect(Effect::PlainAnswer { utterance }));
            }
            Ok(begin_cycle(state, utterance, &tools))
        }

        // ============================================================
        // Parameter collection
        // ============================================================
        (
            Phase::CollectingParams,
            Event::UserReply {
                utterance,
                intent: Intent::ProvideParam,
            },
        ) => {
            let mut next = state.clone();
            next.fill_parameter(&utterance);

            match next.next_missing().cloned() {
                Some(param) => Ok(TransitionResult::new(next)
                    .with_effect(Effect::AskClarification { param })),
                None => Ok(start_execution(next)),
            }
        }

        (
            Phase::CollectingParams,
            Event::UserReply {
                intent: Intent::Cancel,
                ..
            },
        ) => Ok(TransitionResult::new(ConversationState::default())
            .with_effect(Effect::NotifyCancelled)),

        (
            Phase::CollectingParams,
            Event::UserReply {
                utterance,
                intent: Intent::NewTopic,
            },
        ) => Ok(TransitionResult::new(ConversationState::default())
            .with_effect(Effect::DetectTools { utterance })),

        // ============================================================
        // Tool execution
        // ============================================================
        (Phase::ExecutingTools, Event::ToolFinished { result }) => {
            let mut next = state.clone();
            next.tool_results.push(RecordedToolResult::now(result));
            Ok(TransitionResult::new(next))
        }

        (Phase::ExecutingTools, Event::ChainCompleted) => {
            let original_message = state.original_message.clone().unwrap_or_default();
            Ok(TransitionResult::new(ConversationState::default())
                .with_effect(Effect::Synthesize {
                    original_message,
                    results: state.results(),
                }))
        }

        // ============================================================
        // Everything else is a programming error in the driver
        // ============================================================
        (phase, event) => Err(TransitionError::InvalidTransition {
            phase: phase.as_str(),
            event: event_name(&event),
        }),
    }
}

/// Record a newly detected tool set and either ask for parameters or run it.
fn begin_cycle(
    state: &ConversationState,
    utterance: String,
    tools: &[ToolDescriptor],
) -> TransitionResult {
    let missing = check_missing_parameters(tools, &state.collected_params);

    let next = ConversationState {
        phase: Phase::CollectingParams,
        pending_tools: tools.iter().map(|t| PendingTool::new(&t.name)).collect(),
        missing_params: missing,
        collected_params: state.collected_params.clone(),
        original_message: Some(utterance),
        tool_results: vec![],
    };

    match next.next_missing().cloned() {
        Some(param) => TransitionResult::new(next).with_effect(Effect::AskClarification { param }),
        None => start_execution(next),
    }
}

fn start_execution(mut state: ConversationState) -> TransitionResult {
    state.phase = Phase::ExecutingTools;
    state.tool_results.clear();

    let calls = state.pending_tools.iter().map(ToolCall::from).collect();
    let collected = state.collected_params.clone();
    TransitionResult::new(state).with_effect(Effect::ExecuteChain { calls, collected })
}
