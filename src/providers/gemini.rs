// Gemini generateContent wire adapter. Gemini renames the assistant role
// to "model", carries tool traffic as functionCall/functionResponse parts,
// and has no call ids of its own, so ids are synthesized on the way out
// and resolved back by name on the way in.

use serde_json::{json, Map, Value};

use crate::error::GatewayError;
use crate::providers::adapter::{
    Adapter, StreamContext, StreamFrame, StreamTranslator, TranslatedRequest,
};
use crate::providers::types::{uniform_toolset, ChatRequest, Role};

pub struct GeminiAdapter;

impl Adapter for GeminiAdapter {
    fn translate_request(&self, request: &ChatRequest) -> Result<TranslatedRequest, GatewayError> {
        if request.messages.is_empty() {
            return Err(GatewayError::validation(
                "missing_messages",
                "messages must be a non-empty array",
                None,
                None,
            ));
        }

        let mut contents = Vec::new();
        let mut system_instruction: Option<Value> = None;

        for msg in &request.messages {
            match msg.role {
                Role::System => {
                    if system_instruction.is_none() {
                        system_instruction =
                            Some(json!({ "parts": [{ "text": msg.content_text() }] }));
                    }
                }
                Role::User => contents.push(json!({
                    "role": "user",
                    "parts": [{ "text": msg.content_text() }],
                })),
                Role::Assistant => {
                    let mut parts = Vec::new();
                    let text = msg.content_text();
                    if !text.is_empty() {
                        parts.push(json!({ "text": text }));
                    }
                    if let Some(calls) = &msg.tool_calls {
                        for call in calls {
                            parts.push(json!({
                                "functionCall": {
                                    "name": call.function.name,
                                    "args": parse_arguments(&call.function.arguments),
                                },
                            }));
                        }
                    }
                    if !parts.is_empty() {
                        contents.push(json!({ "role": "model", "parts": parts }));
                    }
                }
                Role::Tool => {
                    let Some(call_id) = &msg.tool_call_id else {
                        continue;
                    };
                    let name = function_name_for_call(&request.messages, call_id)
                        .unwrap_or_else(|| "tool".to_string());
                    let response = parse_tool_response(&msg.content_text());
                    contents.push(json!({
                        "role": "user",
                        "parts": [{
                            "functionResponse": { "name": name, "response": response },
                        }],
                    }));
                }
            }
        }

        let mut body = Map::new();
        body.insert("contents".to_string(), json!(contents));
        if let Some(system) = system_instruction {
            body.insert("systemInstruction".to_string(), system);
        }

        let mut generation_config = Map::new();
        if let Some(temperature) = request.temperature {
            generation_config.insert("temperature".to_string(), json!(temperature));
        }
        if let Some(max_tokens) = request.max_tokens {
            generation_config.insert("maxOutputTokens".to_string(), json!(max_tokens));
        }
        if !generation_config.is_empty() {
            body.insert(
                "generationConfig".to_string(),
                Value::Object(generation_config),
            );
        }

        if let Some(tools) = &request.tools {
            let declarations: Vec<Value> = uniform_toolset(tools)
                .into_iter()
                .map(|tool| {
                    json!({
                        "name": tool["function"]["name"],
                        "description": tool["function"]["description"],
                        "parameters": tool["function"]["parameters"],
                    })
                })
                .collect();
            if !declarations.is_empty() {
                body.insert(
                    "tools".to_string(),
                    json!([{ "functionDeclarations": declarations }]),
                );
            }
        }

        let model = request.model.clone().unwrap_or_default();
        let path = if request.stream.unwrap_or(false) {
            format!("/v1beta/models/{}:streamGenerateContent?alt=sse", model)
        } else {
            format!("/v1beta/models/{}:generateContent", model)
        };

        Ok(TranslatedRequest {
            path,
            body: Value::Object(body),
        })
    }

    fn translate_response(&self, raw: Value) -> Result<Value, GatewayError> {
        let mut content = String::new();
        let mut tool_calls = Vec::new();

        let candidate = raw
            .get("candidates")
            .and_then(Value::as_array)
            .and_then(|c| c.first());

        if let Some(parts) = candidate
            .and_then(|c| c.pointer("/content/parts"))
            .and_then(Value::as_array)
        {
            for part in parts {
                if let Some(text) = part.get("text").and_then(Value::as_str) {
                    content.push_str(text);
                }
                if let Some(call) = part.get("functionCall") {
                    let index = tool_calls.len();
                    tool_calls.push(json!({
                        "id": format!("gemini_call_{}", index + 1),
                        "type": "function",
                        "function": {
                            "name": call.get("name").cloned().unwrap_or(json!("")),
                            "arguments": call
                                .get("args")
                                .map(|a| a.to_string())
                                .unwrap_or_else(|| "{}".to_string()),
                        },
                    }));
                }
            }
        }

        let finish_reason = candidate
            .and_then(|c| c.get("finishReason"))
            .and_then(Value::as_str);
        let mut message = json!({ "role": "assistant", "content": content });
        if !tool_calls.is_empty() {
            message["tool_calls"] = json!(tool_calls);
        }

        let usage = raw.get("usageMetadata");
        let input = usage
            .and_then(|u| u.get("promptTokenCount"))
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let output = usage
            .and_then(|u| u.get("candidatesTokenCount"))
            .and_then(Value::as_u64)
            .unwrap_or(0);

        Ok(json!({
            "id": format!("gemini-{}", uuid::Uuid::new_v4()),
            "object": "chat.completion",
            "created": chrono::Utc::now().timestamp(),
            "model": raw.get("modelVersion").cloned().unwrap_or(Value::Null),
            "choices": [{
                "index": 0,
                "message": message,
                "finish_reason": map_finish_reason(finish_reason, !tool_calls.is_empty()),
            }],
            "usage": {
                "prompt_tokens": input,
                "completion_tokens": output,
                "total_tokens": input + output,
            },
        }))
    }

    fn needs_stream_translation(&self) -> bool {
        true
    }

    fn stream_translator(&self, context: StreamContext) -> Box<dyn StreamTranslator> {
        Box::new(GeminiStreamTranslator {
            context,
            role_sent: false,
            finished: false,
            next_tool_index: 0,
        })
    }
}

fn parse_arguments(arguments: &str) -> Value {
    if arguments.trim().is_empty() {
        return json!({});
    }
    serde_json::from_str(arguments).unwrap_or_else(|_| json!({}))
}

/// Tool outputs that are JSON pass through; bare strings are wrapped.
fn parse_tool_response(payload: &str) -> Value {
    serde_json::from_str(payload).unwrap_or_else(|_| json!({ "result": payload }))
}

/// Resolve a tool call id back to the function name declared by the
/// assistant message that issued it.
fn function_name_for_call(
    messages: &[crate::providers::types::ChatMessage],
    call_id: &str,
) -> Option<String> {
    messages.iter().find_map(|msg| {
        msg.tool_calls.as_ref()?.iter().find_map(|call| {
            (call.reference_id() == call_id || call.id == call_id)
                .then(|| call.function.name.clone())
        })
    })
}

fn map_finish_reason(reason: Option<&str>, has_tool_calls: bool) -> Value {
    if has_tool_calls {
        return json!("tool_calls");
    }
    match reason {
        Some("STOP") => json!("stop"),
        Some("MAX_TOKENS") => json!("length"),
        Some(other) => json!(other.to_ascii_lowercase()),
        None => Value::Null,
    }
}

struct GeminiStreamTranslator {
    context: StreamContext,
    role_sent: bool,
    finished: bool,
    next_tool_index: usize,
}

impl StreamTranslator for GeminiStreamTranslator {
    fn on_event(&mut self, event: &Value) -> Vec<StreamFrame> {
        if self.finished {
            return Vec::new();
        }

        let mut frames = Vec::new();
        let candidate = event
            .get("candidates")
            .and_then(Value::as_array)
            .and_then(|c| c.first());

        if let Some(parts) = candidate
            .and_then(|c| c.pointer("/content/parts"))
            .and_then(Value::as_array)
        {
            for part in parts {
                if !self.role_sent {
                    self.role_sent = true;
                    frames.push(StreamFrame::Chunk(
                        self.context.chunk(json!({ "role": "assistant" }), None),
                    ));
                }
                if let Some(text) = part.get("text").and_then(Value::as_str) {
                    frames.push(StreamFrame::Chunk(
                        self.context.chunk(json!({ "content": text }), None),
                    ));
                }
                if let Some(call) = part.get("functionCall") {
                    let index = self.next_tool_index;
                    self.next_tool_index += 1;
                    frames.push(StreamFrame::Chunk(self.context.chunk(
                        json!({
                            "tool_calls": [{
                                "index": index,
                                "id": format!("gemini_call_{}", index + 1),
                                "type": "function",
                                "function": {
                                    "name": call.get("name").cloned().unwrap_or(json!("")),
                                    "arguments": call
                                        .get("args")
                                        .map(|a| a.to_string())
                                        .unwrap_or_else(|| "{}".to_string()),
                                },
                            }],
                        }),
                        None,
                    )));
                }
            }
        }

        let finish_reason = candidate
            .and_then(|c| c.get("finishReason"))
            .and_then(Value::as_str);
        if let Some(reason) = finish_reason {
            let finish = map_finish_reason(Some(reason), self.next_tool_index > 0);
            let mut chunk = self.context.chunk(json!({}), finish.as_str());
            if let Some(usage) = event.get("usageMetadata") {
                let input = usage
                    .get("promptTokenCount")
                    .and_then(Value::as_u64)
                    .unwrap_or(0);
                let output = usage
                    .get("candidatesTokenCount")
                    .and_then(Value::as_u64)
                    .unwrap_or(0);
                chunk["usage"] = json!({
                    "prompt_tokens": input,
                    "completion_tokens": output,
                    "total_tokens": input + output,
                });
            }
            frames.push(StreamFrame::Chunk(chunk));
        }

        frames
    }

    fn on_done(&mut self) -> Vec<StreamFrame> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;
        vec![StreamFrame::Done]
    }
}
