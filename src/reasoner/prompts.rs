//! Prompt templates for the reasoner
//!
//! Each prompt opens with a fixed instruction line so test doubles can tell
//! the request kinds apart.

use crate::catalog::ToolDescriptor;
use crate::state_machine::ToolCallResult;
use std::fmt::Write;

pub const DETECT_INSTRUCTION: &str = "Return a JSON array of tool names";
pub const INTENT_INSTRUCTION: &str = "Classify the user's reply";
pub const CLARIFY_INSTRUCTION: &str = "Ask the user for one missing value";
pub const SYNTHESIZE_INSTRUCTION: &str = "Answer the user's request using these tool results";
pub const ANSWER_INSTRUCTION: &str = "Reply to the user";

pub fn tool_detection(utterance: &str, tools: &[ToolDescriptor]) -> String {
    let mut prompt = format!(
        "{DETECT_INSTRUCTION} that are needed to fulfil the user's request. \
         Return [] if none of the tools are relevant. Respond with only the JSON array.\n\n\
         Available tools:\n"
    );
    for tool in tools {
        let _ = writeln!(prompt, "- {}: {}", tool.name, tool.description);
    }
    let _ = write!(prompt, "\nUser request: {utterance}");
    prompt
}

pub fn intent_classification(question: &str, reply: &str) -> String {
    format!(
        "{INTENT_INSTRUCTION} to a question the assistant asked.\n\
         Answer with exactly one word:\n\
         - provide_param: the reply supplies the requested value\n\
         - cancel: the user wants to stop or abandon the request\n\
         - new_topic: the user changed the subject\n\n\
         Assistant question: {question}\n\
         User reply: {reply}"
    )
}

pub fn clarification(tool: &ToolDescriptor, description: &str, original_message: &str) -> String {
    format!(
        "{CLARIFY_INSTRUCTION}. Write one short, friendly question and nothing else.\n\n\
         User request: {original_message}\n\
         Tool: {} ({})\n\
         Missing value: {description}",
        tool.name, tool.description
    )
}

pub fn synthesis(original_message: &str, results: &[ToolCallResult], discovery_hint: bool) -> String {
    let mut prompt = format!("{SYNTHESIZE_INSTRUCTION}.\n\nUser request: {original_message}\n");

    let (ok, failed): (Vec<_>, Vec<_>) = results.iter().partition(|r| r.is_success());

    prompt.push_str("\nSuccessful results:\n");
    for result in ok {
        let _ = writeln!(
            prompt,
            "[{}]\n{}",
            result.tool,
            result.content.as_deref().unwrap_or_default()
        );
    }

    if !failed.is_empty() {
        prompt.push_str("\nFailed tools:\n");
        for result in failed {
            let _ = writeln!(
                prompt,
                "- {}: {}",
                result.tool,
                result.error.as_deref().unwrap_or_default()
            );
        }
        prompt.push_str("\nMention briefly that these tools failed.\n");
    }

    if discovery_hint {
        prompt.push_str(
            "\nSome failures look like access restrictions. Suggest that the user check \
             which locations or resources the tools are allowed to reach, for example by \
             asking to list the allowed directories.\n",
        );
    }

    prompt
}

pub fn plain_answer(utterance: &str) -> String {
    format!("{ANSWER_INSTRUCTION} directly and helpfully.\n\nUser: {utterance}")
}
