//! Text extraction from loosely shaped agent JSON.
//!
//! Agents nest the text we want under different keys depending on version
//! and transport. Each shape is an independent strategy; strategies are tried
//! in order and the first hit wins.

use serde_json::Value;

/// Event/message type carrying a final agent reply.
pub const AGENT_MESSAGE: &str = "agent_message";

/// A single extraction strategy.
pub type Strategy = fn(&Value) -> Option<String>;

/// Shapes of an agent message in a session log line, in priority order.
pub const LOG_MESSAGE_STRATEGIES: &[(&str, Strategy)] = &[
    ("msg.message", nested_msg),
    ("top-level message", top_level_message),
    ("messages[]", last_in_messages_array),
];

/// Shapes of the reply text in a `tools/call` result, in priority order.
pub const RESULT_TEXT_STRATEGIES: &[(&str, Strategy)] = &[
    ("message", |v| string_field(v, "message")),
    ("content string", |v| string_field(v, "content")),
    ("messages[] entry", last_messages_entry_text),
    ("content[] text part", last_content_text_part),
    ("result.*", |v| v.get("result").and_then(result_text)),
    ("data.*", |v| v.get("data").and_then(result_text)),
];

/// Run `strategies` over `value` and return the first hit.
#[must_use]
pub fn first_match(strategies: &[(&str, Strategy)], value: &Value) -> Option<String> {
    strategies.iter().find_map(|(_, strategy)| strategy(value))
}

/// Extract an agent message from one raw session-log line.
///
/// Blank or non-JSON lines yield `None`.
#[must_use]
pub fn log_line_message(line: &str) -> Option<String> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    let value: Value = serde_json::from_str(trimmed).ok()?;
    first_match(LOG_MESSAGE_STRATEGIES, &value)
}

/// Best single reply text in a tool result.
#[must_use]
pub fn result_text(value: &Value) -> Option<String> {
    if !value.is_object() {
        return None;
    }
    first_match(RESULT_TEXT_STRATEGIES, value)
}

/// One string per `agent_message` entry in a tool result.
///
/// Looks under `result` and `data` before the top level.
#[must_use]
pub fn agent_messages(value: &Value) -> Vec<String> {
    for key in ["result", "data"] {
        if let Some(inner) = value.get(key).filter(|v| v.is_object()) {
            let found = agent_messages(inner);
            if !found.is_empty() {
                return found;
            }
        }
    }

    let Some(entries) = value.get("messages").and_then(Value::as_array) else {
        return Vec::new();
    };
    entries
        .iter()
        .filter(|entry| is_agent_message(entry))
        .filter_map(entry_text)
        .collect()
}

/// Continuation token carried by a `codex` tool result.
#[must_use]
pub fn conversation_id(value: &Value) -> Option<String> {
    [
        value.get("conversationId"),
        value
            .get("structuredContent")
            .and_then(|v| v.get("conversationId")),
    ]
    .into_iter()
    .flatten()
    .find_map(|v| v.as_str().map(str::trim).filter(|s| !s.is_empty()))
    .map(str::to_owned)
}

// ── Strategies ───────────────────────────────────────────────────────────────

fn nested_msg(value: &Value) -> Option<String> {
    value.get("msg").filter(|m| is_agent_message(m)).and_then(|m| string_field(m, "message"))
}

fn top_level_message(value: &Value) -> Option<String> {
    Some(value)
        .filter(|v| is_agent_message(v))
        .and_then(|v| string_field(v, "message"))
}

fn last_in_messages_array(value: &Value) -> Option<String> {
    value
        .get("messages")?
        .as_array()?
        .iter()
        .rev()
        .filter(|entry| is_agent_message(entry))
        .find_map(|entry| string_field(entry, "message"))
}

fn last_messages_entry_text(value: &Value) -> Option<String> {
    value
        .get("messages")?
        .as_array()?
        .iter()
        .rev()
        .find(|entry| entry.is_object())
        .and_then(|entry| string_field(entry, "message").or_else(|| string_field(entry, "content")))
}

fn last_content_text_part(value: &Value) -> Option<String> {
    value
        .get("content")?
        .as_array()?
        .iter()
        .rev()
        .find_map(|part| part.get("text").and_then(Value::as_str))
        .map(|s| s.trim().to_owned())
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn is_agent_message(value: &Value) -> bool {
    value.get("type").and_then(Value::as_str) == Some(AGENT_MESSAGE)
}

/// Trimmed non-empty string at `key`.
fn string_field(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)?
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
}

/// Text of one `messages[]` entry: `message`, `content` string, or the
/// concatenated text parts of a `content` array.
fn entry_text(entry: &Value) -> Option<String> {
    string_field(entry, "message")
        .or_else(|| string_field(entry, "content"))
        .or_else(|| {
            let joined: String = entry
                .get("content")?
                .as_array()?
                .iter()
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect();
            let joined = joined.trim();
            (!joined.is_empty()).then(|| joined.to_owned())
        })
}
