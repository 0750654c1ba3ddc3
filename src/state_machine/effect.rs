//! Effects produced by state transitions

use crate::orchestrator::ToolCall;
use crate::state_machine::state::{MissingParam, ToolCallResult};
use std::collections::BTreeMap;

/// Work to be performed by the runtime after a state transition
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Run tool detection for an utterance (feeds back `ToolsDetected`)
    DetectTools { utterance: String },

    /// Ask the user for a missing parameter (ends the turn)
    AskClarification { param: MissingParam },

    /// Run the tool chain (feeds back `ToolFinished`* then `ChainCompleted`)
    ExecuteChain {
        calls: Vec<ToolCall>,
        collected: BTreeMap<String, String>,
    },

    /// Synthesize the final answer from tool results (ends the turn)
    Synthesize {
        original_message: String,
        results: Vec<ToolCallResult>,
    },

    /// Answer without tools (ends the turn)
    PlainAnswer { utterance: String },

    /// Tell the user the pending request was dropped (ends the turn)
    NotifyCancelled,
}

impl Effect {
    /// Check if this effect produces the turn's outcome
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Effect::AskClarification { .. }
                | Effect::Synthesize { .. }
                | Effect::PlainAnswer { .. }
                | Effect::NotifyCancelled
        )
    }
}
