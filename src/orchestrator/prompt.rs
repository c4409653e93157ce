// System-prompt extraction and structuring for the orchestrator.

use serde_json::Value;

use crate::providers::types::{ChatMessage, Role};

const STRUCTURED_TAG: &str = "<system_instructions>";

/// Extract the effective system prompt.
///
/// Precedence: a leading `role:"system"` entry in the message list, then
/// the request body's `systemPrompt`/`system_prompt`, then the persisted
/// conversation metadata. Returns the prompt (if any) and the message list
/// with the leading system entry removed.
pub fn extract_system_prompt(
    messages: &[ChatMessage],
    body: &Value,
    metadata: Option<&Value>,
) -> (Option<String>, Vec<ChatMessage>) {
    let mut remaining = messages.to_vec();

    if let Some(first) = remaining.first() {
        if first.role == Role::System {
            let prompt = first.content_text();
            remaining.remove(0);
            return (Some(prompt), remaining);
        }
    }

    let body_prompt = body
        .get("systemPrompt")
        .or_else(|| body.get("system_prompt"))
        .and_then(Value::as_str)
        .map(String::from);
    if let Some(prompt) = body_prompt {
        return (Some(prompt), remaining);
    }

    let metadata_prompt = metadata
        .and_then(|m| m.get("system_prompt"))
        .and_then(Value::as_str)
        .map(String::from);
    (metadata_prompt, remaining)
}

/// Wrap a prompt into the structured form unless it already is structured.
/// With no prompt at all, a minimal prompt carrying only today's date is
/// synthesized.
pub fn build_structured_prompt(custom: Option<&str>) -> String {
    let date_line = format!("Today's date is {}.", chrono::Utc::now().format("%Y-%m-%d"));

    match custom {
        Some(prompt) if prompt.contains(STRUCTURED_TAG) => prompt.to_string(),
        Some(prompt) => format!(
            "{}\n{}\n{}\n\n<user_instructions>\n{}\n</user_instructions>",
            STRUCTURED_TAG, date_line, "</system_instructions>", prompt
        ),
        None => date_line,
    }
}
