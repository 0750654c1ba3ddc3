//! Parsers for free-form reasoner output and user replies

use crate::state_machine::Intent;
use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

static FENCED_BLOCK: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?s)```[A-Za-z0-9_-]*[ \t]*\r?\n?(.*?)```").ok());

static BARE_TOOL_NAME: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_.-]*$").ok());

static CANCEL_PHRASE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(?:cancel|never\s*mind|stop|abort|forget\s+(?:it|about\s+it)|no\s+thanks)\b")
        .ok()
});

static INTENT_LABEL: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:provide_param|cancel|new_topic)\b").ok());

static ACCESS_ERROR: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r"(?i)permission|denied|not\s+allowed|forbidden|unauthori[sz]ed|access|outside\s+(?:of\s+)?(?:the\s+)?allowed",
    )
    .ok()
});

fn matches(re: &LazyLock<Option<Regex>>, text: &str) -> bool {
    re.as_ref().is_some_and(|re| re.is_match(text))
}

fn json_string_array(text: &str) -> Option<Vec<String>> {
    let values: Vec<Value> = serde_json::from_str(text).ok()?;
    Some(
        values
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
    )
}

/// Extract the tool names a reasoner selected.
///
/// Tried in order: a bare JSON array, a JSON array inside a fenced code
/// block, a single tool-name token, then any known tool name mentioned in the
/// text. Names not in `known` are dropped; order of first mention is kept.
pub fn parse_tool_selection(response: &str, known: &[&str]) -> Vec<String> {
    let content = response.trim();

    let candidates = json_string_array(content)
        .or_else(|| {
            let re = FENCED_BLOCK.as_ref()?;
            let inner = re.captures(content)?.get(1)?.as_str().trim();
            json_string_array(inner)
        })
        .or_else(|| matches(&BARE_TOOL_NAME, content).then(|| vec![content.to_string()]));

    let Some(candidates) = candidates else {
        let lowered = content.to_lowercase();
        let mut mentioned: Vec<(usize, &str)> = known
            .iter()
            .filter_map(|name| lowered.find(&name.to_lowercase()).map(|pos| (pos, *name)))
            .collect();
        mentioned.sort_by_key(|(pos, _)| *pos);
        return mentioned.into_iter().map(|(_, n)| n.to_string()).collect();
    };

    let mut selected: Vec<String> = Vec::new();
    for name in candidates {
        if !known.contains(&name.as_str()) {
            tracing::debug!(tool = %name, "Dropping unknown tool from selection");
            continue;
        }
        if !selected.contains(&name) {
            selected.push(name);
        }
    }
    selected
}

/// Read an intent label out of a classification response.
///
/// A reply that is just a label (or `{"intent": ...}`) is taken as is.
/// Otherwise every whole-word label in the text must agree; a response
/// naming different labels is ambiguous and yields `None`.
pub fn parse_intent(response: &str) -> Option<Intent> {
    let content = response.trim();

    if let Ok(value) = serde_json::from_str::<Value>(content) {
        if let Some(label) = value.get("intent").and_then(Value::as_str) {
            return intent_from_label(label);
        }
    }

    let bare = content.trim_matches(|c: char| matches!(c, '"' | '\'' | '`' | '.' | '*'));
    if let Some(intent) = intent_from_label(bare) {
        return Some(intent);
    }

    let re = INTENT_LABEL.as_ref()?;
    let mut labels = re
        .find_iter(content)
        .filter_map(|m| intent_from_label(m.as_str()));
    let first = labels.next()?;
    if labels.all(|intent| intent == first) {
        Some(first)
    } else {
        tracing::debug!(response = %content, "Conflicting intent labels");
        None
    }
}

fn intent_from_label(label: &str) -> Option<Intent> {
    match label.trim().to_lowercase().as_str() {
        "provide_param" => Some(Intent::ProvideParam),
        "cancel" => Some(Intent::Cancel),
        "new_topic" => Some(Intent::NewTopic),
        _ => None,
    }
}

/// Whether a reply looks like a bare value rather than a sentence
pub fn looks_like_parameter_value(reply: &str) -> bool {
    let text = reply.trim();
    if text.is_empty() {
        return false;
    }
    if text.starts_with('/')
        || text.starts_with('~')
        || text.contains("://")
        || text.contains('\\')
        || text.parse::<f64>().is_ok()
    {
        return true;
    }
    text.split_whitespace().count() <= 6 && !text.contains('?')
}

/// Intent used when the reasoner cannot classify a reply.
///
/// Only explicit cancel phrases and long questions leave parameter
/// collection; everything else is taken as the requested value.
pub fn heuristic_intent(reply: &str) -> Intent {
    if matches(&CANCEL_PHRASE, reply) {
        return Intent::Cancel;
    }
    if looks_like_parameter_value(reply) {
        return Intent::ProvideParam;
    }
    if reply.contains('?') && reply.split_whitespace().count() > 8 {
        return Intent::NewTopic;
    }
    Intent::ProvideParam
}

/// Whether a tool error reads like an access or permission restriction
pub fn is_access_error(error: &str) -> bool {
    matches(&ACCESS_ERROR, error)
}
