// Responses API wire adapter: maps the internal chat shape onto the
// `input` item array and translates the event-typed stream back into
// `chat.completion.chunk` frames.

use serde_json::{json, Map, Value};

use crate::error::GatewayError;
use crate::providers::adapter::{
    Adapter, StreamContext, StreamFrame, StreamTranslator, TranslatedRequest,
};
use crate::providers::types::{uniform_toolset, ChatRequest, MessageContent, Role};

pub struct ResponsesAdapter;

pub const RESPONSES_PATH: &str = "/v1/responses";

impl Adapter for ResponsesAdapter {
    fn translate_request(&self, request: &ChatRequest) -> Result<TranslatedRequest, GatewayError> {
        if request.messages.is_empty() {
            return Err(GatewayError::validation(
                "missing_messages",
                "messages must be a non-empty array",
                None,
                None,
            ));
        }

        let mut input = Vec::new();
        for msg in &request.messages {
            match msg.role {
                Role::System => input.push(json!({
                    "role": "system",
                    "content": [{ "type": "input_text", "text": msg.content_text() }],
                })),
                Role::User => {
                    let content = match &msg.content {
                        Some(MessageContent::Parts(parts)) => parts
                            .iter()
                            .map(|part| {
                                // Text parts become input_text; other
                                // modalities are preserved as-is.
                                match part.get("type").and_then(Value::as_str) {
                                    Some("text") => json!({
                                        "type": "input_text",
                                        "text": part.get("text").cloned().unwrap_or(json!("")),
                                    }),
                                    _ => part.clone(),
                                }
                            })
                            .collect::<Vec<_>>(),
                        _ => vec![json!({ "type": "input_text", "text": msg.content_text() })],
                    };
                    input.push(json!({ "role": "user", "content": content }));
                }
                Role::Assistant => {
                    if let Some(calls) = &msg.tool_calls {
                        for call in calls {
                            input.push(json!({
                                "type": "function_call",
                                "call_id": call.reference_id(),
                                "name": call.function.name,
                                "arguments": stringify_arguments(&call.function.arguments),
                            }));
                        }
                    }
                    let text = msg.content_text();
                    if !text.is_empty() {
                        input.push(json!({
                            "role": "assistant",
                            "content": [{ "type": "output_text", "text": text }],
                        }));
                    }
                }
                Role::Tool => input.push(json!({
                    "type": "function_call_output",
                    "call_id": msg.tool_call_id.clone().unwrap_or_default(),
                    "output": msg.content_text(),
                })),
            }
        }

        let mut body = Map::new();
        if let Some(model) = &request.model {
            body.insert("model".to_string(), json!(model));
        }
        body.insert("input".to_string(), json!(input));

        if let Some(tools) = &request.tools {
            let tools: Vec<Value> = uniform_toolset(tools)
                .into_iter()
                .map(|tool| {
                    // Responses tools are flat, not nested under `function`.
                    json!({
                        "type": "function",
                        "name": tool["function"]["name"],
                        "description": tool["function"]["description"],
                        "parameters": tool["function"]["parameters"],
                    })
                })
                .collect();
            if !tools.is_empty() {
                body.insert("tools".to_string(), json!(tools));
            }
        }

        if let Some(temperature) = request.temperature {
            body.insert("temperature".to_string(), json!(temperature));
        }
        if let Some(max_tokens) = request.max_tokens {
            body.insert("max_output_tokens".to_string(), json!(max_tokens));
        }
        if let Some(previous) = &request.previous_response_id {
            body.insert("previous_response_id".to_string(), json!(previous));
        }
        if let Some(stream) = request.stream {
            body.insert("stream".to_string(), json!(stream));
        }
        if let Some(effort) = &request.reasoning_effort {
            body.insert("reasoning".to_string(), json!({ "effort": effort }));
        }
        if let Some(verbosity) = &request.verbosity {
            body.insert("text".to_string(), json!({ "verbosity": verbosity }));
        }

        Ok(TranslatedRequest {
            path: RESPONSES_PATH.to_string(),
            body: Value::Object(body),
        })
    }

    fn translate_response(&self, raw: Value) -> Result<Value, GatewayError> {
        let mut content = String::new();
        let mut tool_calls = Vec::new();

        if let Some(output) = raw.get("output").and_then(Value::as_array) {
            for item in output {
                match item.get("type").and_then(Value::as_str) {
                    Some("message") | None => {
                        if let Some(parts) = item.get("content").and_then(Value::as_array) {
                            for part in parts {
                                if part.get("type").and_then(Value::as_str) == Some("output_text") {
                                    if let Some(text) = part.get("text").and_then(Value::as_str) {
                                        content.push_str(text);
                                    }
                                }
                            }
                        }
                    }
                    Some("function_call") => {
                        let call_id = item
                            .get("call_id")
                            .or_else(|| item.get("id"))
                            .and_then(Value::as_str)
                            .unwrap_or_default();
                        tool_calls.push(json!({
                            "id": call_id,
                            "type": "function",
                            "function": {
                                "name": item.get("name").cloned().unwrap_or(json!("")),
                                "arguments": item
                                    .get("arguments")
                                    .cloned()
                                    .unwrap_or(json!("{}")),
                            },
                        }));
                    }
                    _ => {}
                }
            }
        }

        let finish_reason = if !tool_calls.is_empty() {
            json!("tool_calls")
        } else if raw.get("status").and_then(Value::as_str) == Some("completed") {
            json!("stop")
        } else {
            Value::Null
        };

        let mut message = json!({ "role": "assistant", "content": content });
        if !tool_calls.is_empty() {
            message["tool_calls"] = json!(tool_calls);
        }

        Ok(json!({
            "id": raw.get("id").cloned().unwrap_or(json!("")),
            "object": "chat.completion",
            "created": chrono::Utc::now().timestamp(),
            "model": raw.get("model").cloned().unwrap_or(Value::Null),
            "choices": [{
                "index": 0,
                "message": message,
                "finish_reason": finish_reason,
            }],
            "usage": normalize_usage(raw.get("usage")),
            "response_id": raw.get("id").cloned().unwrap_or(Value::Null),
        }))
    }

    fn needs_stream_translation(&self) -> bool {
        true
    }

    fn stream_translator(&self, context: StreamContext) -> Box<dyn StreamTranslator> {
        Box::new(ResponsesStreamTranslator {
            context,
            role_sent: false,
            finished: false,
            next_tool_index: 0,
            call_indices: std::collections::HashMap::new(),
        })
    }
}

fn stringify_arguments(arguments: &str) -> String {
    if arguments.is_empty() {
        "{}".to_string()
    } else {
        arguments.to_string()
    }
}

fn normalize_usage(usage: Option<&Value>) -> Value {
    let input = usage
        .and_then(|u| u.get("input_tokens"))
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let output = usage
        .and_then(|u| u.get("output_tokens"))
        .and_then(Value::as_u64)
        .unwrap_or(0);
    json!({
        "prompt_tokens": input,
        "completion_tokens": output,
        "total_tokens": input + output,
    })
}

struct ResponsesStreamTranslator {
    context: StreamContext,
    role_sent: bool,
    finished: bool,
    next_tool_index: usize,
    /// Upstream item id -> index within the chunked `tool_calls` array.
    call_indices: std::collections::HashMap<String, usize>,
}

impl ResponsesStreamTranslator {
    fn role_frame(&mut self) -> Option<StreamFrame> {
        if self.role_sent {
            return None;
        }
        self.role_sent = true;
        Some(StreamFrame::Chunk(
            self.context.chunk(json!({ "role": "assistant" }), None),
        ))
    }
}

impl StreamTranslator for ResponsesStreamTranslator {
    fn on_event(&mut self, event: &Value) -> Vec<StreamFrame> {
        if self.finished {
            return Vec::new();
        }

        let mut frames = Vec::new();
        match event.get("type").and_then(Value::as_str) {
            Some("response.output_text.delta") => {
                if let Some(frame) = self.role_frame() {
                    frames.push(frame);
                }
                let delta = event.get("delta").and_then(Value::as_str).unwrap_or("");
                frames.push(StreamFrame::Chunk(
                    self.context.chunk(json!({ "content": delta }), None),
                ));
            }
            Some("response.output_item.added") => {
                let item = event.get("item").cloned().unwrap_or(Value::Null);
                if item.get("type").and_then(Value::as_str) == Some("function_call") {
                    if let Some(frame) = self.role_frame() {
                        frames.push(frame);
                    }
                    let item_id = item
                        .get("id")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    let index = self.next_tool_index;
                    self.next_tool_index += 1;
                    self.call_indices.insert(item_id, index);

                    frames.push(StreamFrame::Chunk(self.context.chunk(
                        json!({
                            "tool_calls": [{
                                "index": index,
                                "id": item.get("call_id").cloned().unwrap_or(json!("")),
                                "type": "function",
                                "function": {
                                    "name": item.get("name").cloned().unwrap_or(json!("")),
                                    "arguments": "",
                                },
                            }],
                        }),
                        None,
                    )));
                }
            }
            Some("response.function_call_arguments.delta") => {
                let item_id = event
                    .get("item_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                if let Some(&index) = self.call_indices.get(item_id) {
                    let delta = event.get("delta").and_then(Value::as_str).unwrap_or("");
                    frames.push(StreamFrame::Chunk(self.context.chunk(
                        json!({
                            "tool_calls": [{
                                "index": index,
                                "function": { "arguments": delta },
                            }],
                        }),
                        None,
                    )));
                }
            }
            Some("response.completed") => {
                self.finished = true;
                let usage = event
                    .get("response")
                    .and_then(|r| r.get("usage"))
                    .cloned();
                let finish = if self.next_tool_index > 0 {
                    "tool_calls"
                } else {
                    "stop"
                };
                let mut chunk = self.context.chunk(json!({}), Some(finish));
                chunk["usage"] = normalize_usage(usage.as_ref());
                frames.push(StreamFrame::Chunk(chunk));
                frames.push(StreamFrame::Done);
            }
            _ => {}
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
