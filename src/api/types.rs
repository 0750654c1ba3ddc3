//! API request and response types

use crate::catalog::ToolDescriptor;
use crate::db::Message;
use crate::runtime::Outcome;
use crate::state_machine::ConversationState;
use serde::{Deserialize, Serialize};

/// Request to send a chat message
#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub text: String,
}

/// Response for a handled turn
#[derive(Debug, Serialize)]
pub struct SendMessageResponse {
    pub outcome: Outcome,
    /// The reply as persisted in the message history
    pub message: Message,
}

/// Response with orchestration state and history
#[derive(Debug, Serialize)]
pub struct ConversationResponse {
    pub conversation_id: String,
    pub state: ConversationState,
    pub messages: Vec<Message>,
}

/// Response with the tools a conversation can use
#[derive(Debug, Serialize)]
pub struct ToolsResponse {
    pub tools: Vec<ToolDescriptor>,
}

/// Response for model list
#[derive(Debug, Serialize)]
pub struct ModelsResponse {
    pub models: Vec<String>,
    pub default: String,
}

/// Response for lifecycle actions
#[derive(Debug, Serialize)]
pub struct SuccessResponse {
    pub success: bool,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
        }
    }
}
