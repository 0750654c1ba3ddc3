//! Events that drive the conversation state machine

use crate::catalog::ToolDescriptor;
use crate::state_machine::state::ToolCallResult;
use serde::{Deserialize, Serialize};

/// How a reply during parameter collection should be treated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    /// The utterance is the value for the pending parameter
    ProvideParam,
    /// The user wants to abandon the pending tool call
    Cancel,
    /// The user moved on to something unrelated
    NewTopic,
}

impl Intent {
    pub fn as_str(self) -> &'static str {
        match self {
            Intent::ProvideParam => "provide_param",
            Intent::Cancel => "cancel",
            Intent::NewTopic => "new_topic",
        }
    }
}

/// Events that trigger state transitions
#[derive(Debug, Clone)]
pub enum Event {
    /// Tool detection finished for an utterance handled in the normal phase
    ToolsDetected {
        utterance: String,
        tools: Vec<ToolDescriptor>,
    },

    /// A reply arrived while parameters were being collected
    UserReply { utterance: String, intent: Intent },

    /// One tool of the running chain finished
    ToolFinished { result: ToolCallResult },

    /// Every tool of the running chain has reported
    ChainCompleted,

    /// Explicit reset requested by the caller
    Reset,
}
