//! Tool orchestrator
//!
//! Detects which tools a request needs, works out which parameters are still
//! missing, runs tool chains and turns their results into an answer.

pub mod parsing;

use crate::catalog::{ToolCatalog, ToolDescriptor, ToolError, ToolOutput};
use crate::reasoner::Reasoner;
use crate::runtime::TurnOptions;
use crate::state_machine::{Intent, MissingParam, PendingTool, ToolCallResult};
use parsing::{heuristic_intent, is_access_error, parse_intent, parse_tool_selection};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Write;
use std::time::Duration;

/// Reply used when no tool in a chain succeeded
pub const ALL_FAILED_MESSAGE: &str = "I encountered some issues while trying to help you. \
     Please try again or let me know if you need assistance with something else.";

/// One planned tool invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    /// Call-specific parameters; these win over collected ones
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    /// Parameter that receives the previous call's successful output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_input: Option<String>,
}

impl ToolCall {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parameters: BTreeMap::new(),
            chain_input: None,
        }
    }

    #[must_use]
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    /// Feed the previous call's output into `parameter`.
    ///
    /// Calls built from pending tools inherit [`PendingTool::chain_input`].
    #[must_use]
    pub fn chained_into(mut self, parameter: impl Into<String>) -> Self {
        self.chain_input = Some(parameter.into());
        self
    }
}

impl From<&PendingTool> for ToolCall {
    fn from(pending: &PendingTool) -> Self {
        Self {
            name: pending.name.clone(),
            parameters: pending.parameters.clone(),
            chain_input: pending.chain_input.clone(),
        }
    }
}

/// Required parameters not yet present in `collected`, in tool order and
/// then declared order.
pub fn check_missing_parameters(
    tools: &[ToolDescriptor],
    collected: &BTreeMap<String, String>,
) -> Vec<MissingParam> {
    tools
        .iter()
        .flat_map(|tool| {
            tool.required_parameters
                .iter()
                .filter(|p| !collected.contains_key(*p))
                .map(move |p| MissingParam::new(&tool.name, p, tool.parameter_description(p)))
        })
        .collect()
}

/// Deterministic clarification question for a missing parameter
pub fn fallback_clarification(param: &MissingParam) -> String {
    format!(
        "I need the {} for the {} tool. Could you provide it?",
        param.description, param.tool
    )
}

/// Final answer built from tool results
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Synthesis {
    pub text: String,
    pub succeeded: usize,
    pub failed: usize,
}

impl Synthesis {
    pub fn all_failed(&self) -> bool {
        self.succeeded == 0
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub tool_timeout: Duration,
    /// Let the reasoner phrase clarification questions
    pub phrase_clarifications: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            tool_timeout: Duration::from_secs(120),
            phrase_clarifications: true,
        }
    }
}

pub struct ToolOrchestrator {
    reasoner: Reasoner,
    config: OrchestratorConfig,
}

impl ToolOrchestrator {
    pub fn new(reasoner: Reasoner, config: OrchestratorConfig) -> Self {
        Self { reasoner, config }
    }

    /// Per-call limit for tool providers
    pub fn tool_timeout(&self) -> Duration {
        self.config.tool_timeout
    }

    /// Ask the reasoner which catalog tools the utterance needs.
    ///
    /// Any reasoner failure yields no tools.
    pub async fn detect_required_tools(
        &self,
        utterance: &str,
        catalog: &ToolCatalog,
        opts: &TurnOptions,
    ) -> Vec<ToolDescriptor> {
        if catalog.is_empty() {
            return vec![];
        }

        let tools = catalog.descriptors();
        let response = match self.reasoner.select_tools(utterance, &tools, opts).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(error = %e, "Tool detection failed, answering without tools");
                return vec![];
            }
        };

        let known: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
        let selected: Vec<ToolDescriptor> = parse_tool_selection(&response, &known)
            .iter()
            .filter_map(|name| catalog.get(name).cloned())
            .collect();

        tracing::info!(
            tools = ?selected.iter().map(|t| t.name.as_str()).collect::<Vec<_>>(),
            "Detected tools"
        );
        selected
    }

    /// Question asking for one missing parameter
    pub async fn clarification_question(
        &self,
        param: &MissingParam,
        catalog: &ToolCatalog,
        original_message: &str,
        opts: &TurnOptions,
    ) -> String {
        let fallback = fallback_clarification(param);
        if !self.config.phrase_clarifications {
            return fallback;
        }
        let Some(tool) = catalog.get(&param.tool) else {
            return fallback;
        };

        match self
            .reasoner
            .phrase_clarification(tool, &param.description, original_message, opts)
            .await
        {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(_) => fallback,
            Err(e) => {
                tracing::debug!(error = %e, "Clarification phrasing failed, using template");
                fallback
            }
        }
    }

    /// Classify a reply given while parameters are being collected
    pub async fn classify_intent(&self, question: &str, reply: &str, opts: &TurnOptions) -> Intent {
        match self.reasoner.classify_intent(question, reply, opts).await {
            Ok(response) => parse_intent(&response).unwrap_or_else(|| {
                tracing::debug!(response = %response, "Unrecognised intent label");
                heuristic_intent(reply)
            }),
            Err(e) => {
                tracing::warn!(error = %e, "Intent classification failed, using heuristic");
                heuristic_intent(reply)
            }
        }
    }

    /// Run calls sequentially. A failing call never stops the chain; a
    /// cancelled turn stops before the next call starts.
    pub async fn execute_tool_chain(
        &self,
        calls: &[ToolCall],
        collected: &BTreeMap<String, String>,
        catalog: &ToolCatalog,
        opts: &TurnOptions,
    ) -> Vec<ToolCallResult> {
        let mut results: Vec<ToolCallResult> = Vec::with_capacity(calls.len());

        for call in calls {
            if opts.cancel.is_cancelled() {
                tracing::info!(
                    skipped = calls.len() - results.len(),
                    "Turn cancelled, skipping remaining tools"
                );
                break;
            }

            let mut parameters = collected.clone();
            parameters.extend(call.parameters.clone());
            if let (Some(target), Some(previous)) = (&call.chain_input, results.last()) {
                if let Some(content) = &previous.content {
                    parameters.insert(target.clone(), content.clone());
                }
            }

            results.push(self.invoke(&call.name, &parameters, catalog, opts).await);
        }

        results
    }

    async fn invoke(
        &self,
        tool: &str,
        parameters: &BTreeMap<String, String>,
        catalog: &ToolCatalog,
        opts: &TurnOptions,
    ) -> ToolCallResult {
        let args = Value::Object(
            parameters
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect(),
        );
        let limit = opts.bounded(self.config.tool_timeout);
        let start = std::time::Instant::now();

        let result = match tokio::time::timeout(limit, catalog.invoke(tool, &args)).await {
            Ok(Ok(ToolOutput::Content(content))) => ToolCallResult::success(tool, content),
            Ok(Ok(ToolOutput::Error(error))) => ToolCallResult::failure(tool, error),
            Ok(Err(e)) => ToolCallResult::failure(tool, e.to_string()),
            Err(_) => ToolCallResult::failure(tool, ToolError::Timeout(limit).to_string()),
        };

        if let Some(error) = &result.error {
            tracing::warn!(tool = %tool, duration_ms = %start.elapsed().as_millis(), error = %error, "Tool failed");
        } else {
            tracing::info!(tool = %tool, duration_ms = %start.elapsed().as_millis(), "Tool succeeded");
        }
        result
    }

    /// Turn tool results into the answer for the user.
    ///
    /// With no successes the fixed apology is returned without calling the
    /// reasoner. Failures are always listed after the answer.
    pub async fn generate_response(
        &self,
        original_message: &str,
        results: &[ToolCallResult],
        opts: &TurnOptions,
    ) -> Synthesis {
        let succeeded = results.iter().filter(|r| r.is_success()).count();
        let failed = results.len() - succeeded;

        if succeeded == 0 {
            return Synthesis {
                text: ALL_FAILED_MESSAGE.to_string(),
                succeeded,
                failed,
            };
        }

        let access_hint = results
            .iter()
            .filter_map(|r| r.error.as_deref())
            .any(is_access_error);

        let body = match self
            .reasoner
            .synthesize(original_message, results, access_hint, opts)
            .await
        {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(_) => templated_answer(results),
            Err(e) => {
                tracing::warn!(error = %e, "Synthesis failed, using templated answer");
                templated_answer(results)
            }
        };

        let text = if failed > 0 {
            format!("{body}\n\n{}", failure_note(results, access_hint))
        } else {
            body
        };

        Synthesis {
            text,
            succeeded,
            failed,
        }
    }

    /// Answer an utterance that needs no tools
    pub async fn plain_answer(
        &self,
        utterance: &str,
        opts: &TurnOptions,
    ) -> Result<String, crate::reasoner::ReasonerError> {
        let text = self.reasoner.answer(utterance, opts).await?;
        Ok(text.trim().to_string())
    }
}

fn templated_answer(results: &[ToolCallResult]) -> String {
    let successes: Vec<&ToolCallResult> = results.iter().filter(|r| r.is_success()).collect();
    if let [only] = successes.as_slice() {
        return only.content.clone().unwrap_or_default();
    }

    let mut text = String::from("Here is what I found:");
    for result in successes {
        let _ = write!(
            text,
            "\n\n{}:\n{}",
            result.tool,
            result.content.as_deref().unwrap_or_default()
        );
    }
    text
}

fn failure_note(results: &[ToolCallResult], access_hint: bool) -> String {
    let failures: Vec<String> = results
        .iter()
        .filter_map(|r| r.error.as_ref().map(|e| format!("{} ({e})", r.tool)))
        .collect();

    let mut note = format!(
        "Note: some services encountered issues: {}. I continued with the available information.",
        failures.join(", ")
    );
    if access_hint {
        note.push_str(
            " Some of these look like access restrictions; asking which locations the tools are allowed to reach may help.",
        );
    }
    note
}
