//! Conversation state types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

// ============================================================================
// Phase
// ============================================================================

/// Discrete phase of the orchestration state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// No orchestration cycle in progress
    #[default]
    Normal,

    /// Waiting for the user to supply missing tool parameters
    CollectingParams,

    /// Running the tool chain (only ever observed within a single turn)
    ExecutingTools,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Normal => "normal",
            Phase::CollectingParams => "collecting_params",
            Phase::ExecutingTools => "executing_tools",
        }
    }
}

// ============================================================================
// State Records
// ============================================================================

/// A tool awaiting parameter completion or execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingTool {
    pub name: String,
    /// Call-specific parameters; these win over collected parameters
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    /// Parameter that receives the previous tool's successful output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_input: Option<String>,
}

impl PendingTool {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parameters: BTreeMap::new(),
            chain_input: None,
        }
    }

    /// Feed the previous tool's output into `parameter` when the chain runs.
    ///
    /// Detection only yields unchained tools; chains are set up by callers
    /// that seed the pending list.
    #[must_use]
    pub fn chained_into(mut self, parameter: impl Into<String>) -> Self {
        self.chain_input = Some(parameter.into());
        self
    }
}

/// A required parameter the user has not supplied yet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingParam {
    pub tool: String,
    pub parameter: String,
    pub description: String,
}

impl MissingParam {
    pub fn new(
        tool: impl Into<String>,
        parameter: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            tool: tool.into(),
            parameter: parameter.into(),
            description: description.into(),
        }
    }
}

/// Outcome of a single tool invocation. Exactly one of `content`/`error` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallResult {
    pub tool: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolCallResult {
    pub fn success(tool: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            content: Some(content.into()),
            error: None,
        }
    }

    pub fn failure(tool: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            content: None,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// A tool result as recorded in conversation state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedToolResult {
    #[serde(flatten)]
    pub result: ToolCallResult,
    pub timestamp: DateTime<Utc>,
}

impl RecordedToolResult {
    pub fn now(result: ToolCallResult) -> Self {
        Self {
            result,
            timestamp: Utc::now(),
        }
    }
}

// ============================================================================
// Conversation State
// ============================================================================

/// Durable per-conversation orchestration record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ConversationState {
    #[serde(default)]
    pub phase: Phase,
    #[serde(default)]
    pub pending_tools: Vec<PendingTool>,
    #[serde(default)]
    pub missing_params: Vec<MissingParam>,
    #[serde(default)]
    pub collected_params: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_message: Option<String>,
    #[serde(default)]
    pub tool_results: Vec<RecordedToolResult>,
}

/// Broken structural invariant in a loaded or computed state
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvariantViolation {
    #[error("phase is collecting_params but no parameters are missing")]
    CollectingWithoutMissing,
    #[error("{0} parameter(s) missing while phase is {1}")]
    MissingOutsideCollecting(usize, &'static str),
    #[error("normal phase still holds orchestration data")]
    NormalNotClean,
    #[error("pending tools recorded without an original message")]
    PendingWithoutOriginal,
    #[error("phase {0} has no pending tools")]
    NoPendingTools(&'static str),
    #[error("executing_tools observed outside of a turn")]
    DanglingExecution,
}

impl ConversationState {
    /// Check if this state is the initial, empty state
    pub fn is_initial(&self) -> bool {
        *self == Self::default()
    }

    /// Check structural invariants
    pub fn check_invariants(&self) -> Result<(), InvariantViolation> {
        match self.phase {
            Phase::Normal => {
                if !self.missing_params.is_empty() {
                    return Err(InvariantViolation::MissingOutsideCollecting(
                        self.missing_params.len(),
                        self.phase.as_str(),
                    ));
                }
                if !self.pending_tools.is_empty()
                    || !self.collected_params.is_empty()
                    || !self.tool_results.is_empty()
                    || self.original_message.is_some()
                {
                    return Err(InvariantViolation::NormalNotClean);
                }
            }
            Phase::CollectingParams => {
                if self.missing_params.is_empty() {
                    return Err(InvariantViolation::CollectingWithoutMissing);
                }
                if self.pending_tools.is_empty() {
                    return Err(InvariantViolation::NoPendingTools(self.phase.as_str()));
                }
            }
            Phase::ExecutingTools => {
                if !self.missing_params.is_empty() {
                    return Err(InvariantViolation::MissingOutsideCollecting(
                        self.missing_params.len(),
                        self.phase.as_str(),
                    ));
                }
                if self.pending_tools.is_empty() {
                    return Err(InvariantViolation::NoPendingTools(self.phase.as_str()));
                }
            }
        }

        if !self.pending_tools.is_empty() && self.original_message.is_none() {
            return Err(InvariantViolation::PendingWithoutOriginal);
        }
        Ok(())
    }

    /// Check invariants for a state read back from storage.
    ///
    /// `ExecutingTools` never survives a turn, so a persisted one is dangling.
    pub fn check_persisted(&self) -> Result<(), InvariantViolation> {
        if self.phase == Phase::ExecutingTools {
            return Err(InvariantViolation::DanglingExecution);
        }
        self.check_invariants()
    }

    /// Record a user-supplied value for the first missing parameter.
    ///
    /// The value is stored verbatim. Every other missing entry asking for the
    /// same parameter name is satisfied too, since collected parameters are
    /// keyed by name. Returns the filled parameter name.
    pub fn fill_parameter(&mut self, value: &str) -> Option<String> {
        let first = self.missing_params.first()?;
        let name = first.parameter.clone();
        self.collected_params.insert(name.clone(), value.to_string());
        self.missing_params.retain(|p| p.parameter != name);
        Some(name)
    }

    pub fn all_parameters_filled(&self) -> bool {
        self.missing_params.is_empty()
    }

    /// The parameter that will be asked about next
    pub fn next_missing(&self) -> Option<&MissingParam> {
        self.missing_params.first()
    }

    /// Results accumulated during execution
    pub fn results(&self) -> Vec<ToolCallResult> {
        self.tool_results.iter().map(|r| r.result.clone()).collect()
    }
}
