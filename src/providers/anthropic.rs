// Anthropic Messages wire adapter. The Messages API lifts the system
// prompt out of the message list, nests tool traffic in content blocks,
// and streams event-typed frames; all of that is folded back into the
// Chat Completions shape here.

use serde_json::{json, Map, Value};

use crate::error::GatewayError;
use crate::providers::adapter::{
    Adapter, StreamContext, StreamFrame, StreamTranslator, TranslatedRequest,
};
use crate::providers::types::{uniform_toolset, ChatRequest, Role};

pub struct AnthropicAdapter;

pub const MESSAGES_PATH: &str = "/v1/messages";
pub const ANTHROPIC_VERSION: &str = "2023-06-01";

const DEFAULT_MAX_TOKENS: u32 = 4096;

impl Adapter for AnthropicAdapter {
    fn translate_request(&self, request: &ChatRequest) -> Result<TranslatedRequest, GatewayError> {
        if request.messages.is_empty() {
            return Err(GatewayError::validation(
                "missing_messages",
                "messages must be a non-empty array",
                None,
                None,
            ));
        }

        let mut system: Option<String> = None;
        let mut messages = Vec::new();

        for msg in &request.messages {
            match msg.role {
                Role::System => {
                    if system.is_none() {
                        system = Some(msg.content_text());
                    }
                }
                Role::User => {
                    messages.push(json!({
                        "role": "user",
                        "content": msg.content_text(),
                    }));
                }
                Role::Assistant => {
                    let mut blocks = Vec::new();
                    let text = msg.content_text();
                    if !text.is_empty() {
                        blocks.push(json!({ "type": "text", "text": text }));
                    }
                    if let Some(calls) = &msg.tool_calls {
                        for call in calls {
                            blocks.push(json!({
                                "type": "tool_use",
                                "id": call.reference_id(),
                                "name": call.function.name,
                                "input": parse_arguments(&call.function.arguments),
                            }));
                        }
                    }
                    if !blocks.is_empty() {
                        messages.push(json!({ "role": "assistant", "content": blocks }));
                    }
                }
                Role::Tool => {
                    // Tool results travel as user messages with tool_result
                    // blocks.
                    if let Some(call_id) = &msg.tool_call_id {
                        messages.push(json!({
                            "role": "user",
                            "content": [{
                                "type": "tool_result",
                                "tool_use_id": call_id,
                                "content": msg.content_text(),
                            }],
                        }));
                    }
                }
            }
        }

        let mut body = Map::new();
        if let Some(model) = &request.model {
            body.insert("model".to_string(), json!(model));
        }
        body.insert(
            "max_tokens".to_string(),
            json!(request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS)),
        );
        body.insert("messages".to_string(), json!(messages));
        if let Some(system) = system {
            body.insert("system".to_string(), json!(system));
        }
        if let Some(temperature) = request.temperature {
            body.insert("temperature".to_string(), json!(temperature));
        }
        if let Some(stream) = request.stream {
            body.insert("stream".to_string(), json!(stream));
        }

        if let Some(tools) = &request.tools {
            let tools: Vec<Value> = uniform_toolset(tools)
                .into_iter()
                .map(|tool| {
                    json!({
                        "name": tool["function"]["name"],
                        "description": tool["function"]["description"],
                        "input_schema": tool["function"]["parameters"],
                    })
                })
                .collect();
            if !tools.is_empty() {
                body.insert("tools".to_string(), json!(tools));
            }
        }
        if let Some(choice) = &request.tool_choice {
            let normalized = match choice {
                Value::String(kind) => json!({ "type": kind }),
                other => other.clone(),
            };
            body.insert("tool_choice".to_string(), normalized);
        }

        Ok(TranslatedRequest {
            path: MESSAGES_PATH.to_string(),
            body: Value::Object(body),
        })
    }

    fn translate_response(&self, raw: Value) -> Result<Value, GatewayError> {
        let mut content = String::new();
        let mut tool_calls = Vec::new();

        if let Some(blocks) = raw.get("content").and_then(Value::as_array) {
            for block in blocks {
                match block.get("type").and_then(Value::as_str) {
                    Some("text") => {
                        if let Some(text) = block.get("text").and_then(Value::as_str) {
                            content.push_str(text);
                        }
                    }
                    Some("tool_use") => {
                        let arguments = block
                            .get("input")
                            .map(|input| input.to_string())
                            .unwrap_or_else(|| "{}".to_string());
                        tool_calls.push(json!({
                            "id": block.get("id").cloned().unwrap_or(json!("")),
                            "type": "function",
                            "function": {
                                "name": block.get("name").cloned().unwrap_or(json!("")),
                                "arguments": arguments,
                            },
                        }));
                    }
                    _ => {}
                }
            }
        }

        let stop_reason = raw.get("stop_reason").and_then(Value::as_str);
        let mut message = json!({ "role": "assistant", "content": content });
        if !tool_calls.is_empty() {
            message["tool_calls"] = json!(tool_calls);
        }

        let input = raw
            .get("usage")
            .and_then(|u| u.get("input_tokens"))
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let output = raw
            .get("usage")
            .and_then(|u| u.get("output_tokens"))
            .and_then(Value::as_u64)
            .unwrap_or(0);

        Ok(json!({
            "id": raw.get("id").cloned().unwrap_or(json!("")),
            "object": "chat.completion",
            "created": chrono::Utc::now().timestamp(),
            "model": raw.get("model").cloned().unwrap_or(Value::Null),
            "choices": [{
                "index": 0,
                "message": message,
                "finish_reason": map_stop_reason(stop_reason),
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
        Box::new(AnthropicStreamTranslator {
            context,
            finished: false,
            input_tokens: 0,
            output_tokens: 0,
            next_tool_index: 0,
            block_tool_indices: std::collections::HashMap::new(),
        })
    }
}

fn parse_arguments(arguments: &str) -> Value {
    if arguments.trim().is_empty() {
        return json!({});
    }
    serde_json::from_str(arguments).unwrap_or_else(|_| json!({}))
}

fn map_stop_reason(reason: Option<&str>) -> Value {
    match reason {
        Some("end_turn") | Some("stop_sequence") => json!("stop"),
        Some("max_tokens") => json!("length"),
        Some("tool_use") => json!("tool_calls"),
        Some(other) => json!(other),
        None => Value::Null,
    }
}

struct AnthropicStreamTranslator {
    context: StreamContext,
    finished: bool,
    input_tokens: u64,
    output_tokens: u64,
    next_tool_index: usize,
    /// Anthropic content-block index -> position in the chunked
    /// `tool_calls` array.
    block_tool_indices: std::collections::HashMap<u64, usize>,
}

impl StreamTranslator for AnthropicStreamTranslator {
    fn on_event(&mut self, event: &Value) -> Vec<StreamFrame> {
        if self.finished {
            return Vec::new();
        }

        let mut frames = Vec::new();
        match event.get("type").and_then(Value::as_str) {
            Some("message_start") => {
                self.input_tokens = event
                    .pointer("/message/usage/input_tokens")
                    .and_then(Value::as_u64)
                    .unwrap_or(0);
                frames.push(StreamFrame::Chunk(
                    self.context.chunk(json!({ "role": "assistant" }), None),
                ));
            }
            Some("content_block_start") => {
                let block = event.get("content_block").cloned().unwrap_or(Value::Null);
                if block.get("type").and_then(Value::as_str) == Some("tool_use") {
                    let block_index = event.get("index").and_then(Value::as_u64).unwrap_or(0);
                    let index = self.next_tool_index;
                    self.next_tool_index += 1;
                    self.block_tool_indices.insert(block_index, index);

                    frames.push(StreamFrame::Chunk(self.context.chunk(
                        json!({
                            "tool_calls": [{
                                "index": index,
                                "id": block.get("id").cloned().unwrap_or(json!("")),
                                "type": "function",
                                "function": {
                                    "name": block.get("name").cloned().unwrap_or(json!("")),
                                    "arguments": "",
                                },
                            }],
                        }),
                        None,
                    )));
                }
            }
            Some("content_block_delta") => match event.pointer("/delta/type").and_then(Value::as_str)
            {
                Some("text_delta") => {
                    let text = event
                        .pointer("/delta/text")
                        .and_then(Value::as_str)
                        .unwrap_or("");
                    frames.push(StreamFrame::Chunk(
                        self.context.chunk(json!({ "content": text }), None),
                    ));
                }
                Some("input_json_delta") => {
                    let block_index = event.get("index").and_then(Value::as_u64).unwrap_or(0);
                    if let Some(&index) = self.block_tool_indices.get(&block_index) {
                        let partial = event
                            .pointer("/delta/partial_json")
                            .and_then(Value::as_str)
                            .unwrap_or("");
                        frames.push(StreamFrame::Chunk(self.context.chunk(
                            json!({
                                "tool_calls": [{
                                    "index": index,
                                    "function": { "arguments": partial },
                                }],
                            }),
                            None,
                        )));
                    }
                }
                _ => {}
            },
            Some("message_delta") => {
                if let Some(output) = event
                    .pointer("/usage/output_tokens")
                    .and_then(Value::as_u64)
                {
                    self.output_tokens = output;
                }
                let stop_reason = event
                    .pointer("/delta/stop_reason")
                    .and_then(Value::as_str);
                if let Some(reason) = stop_reason {
                    let finish = map_stop_reason(Some(reason));
                    let mut chunk = self
                        .context
                        .chunk(json!({}), finish.as_str());
                    chunk["usage"] = json!({
                        "prompt_tokens": self.input_tokens,
                        "completion_tokens": self.output_tokens,
                        "total_tokens": self.input_tokens + self.output_tokens,
                    });
                    frames.push(StreamFrame::Chunk(chunk));
                }
            }
            Some("message_stop") => {
                self.finished = true;
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::types::{ChatMessage, MessageContent, ToolCallPayload};

    fn request_with(messages: Vec<ChatMessage>) -> ChatRequest {
        ChatRequest {
            model: Some("claude-sonnet-4-20250514".to_string()),
            messages,
            ..Default::default()
        }
    }

    #[test]
    fn test_system_lifted_to_top_level() {
        let translated = AnthropicAdapter
            .translate_request(&request_with(vec![
                ChatMessage::text(Role::System, "be brief"),
                ChatMessage::text(Role::User, "hi"),
            ]))
            .unwrap();

        assert_eq!(translated.body["system"], "be brief");
        let messages = translated.body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["role"], "user");
        assert_eq!(translated.path, MESSAGES_PATH);
        assert_eq!(translated.body["max_tokens"], DEFAULT_MAX_TOKENS);
    }

    #[test]
    fn test_tool_traffic_becomes_content_blocks() {
        let messages = vec![
            ChatMessage::text(Role::User, "time?"),
            ChatMessage {
                role: Role::Assistant,
                content: Some(MessageContent::text("checking")),
                tool_call_id: None,
                tool_calls: Some(vec![ToolCallPayload::new(
                    "toolu_1",
                    "get_time",
                    "{\"tz\":\"UTC\"}",
                )]),
            },
            ChatMessage::tool_result("toolu_1", "12:00"),
        ];

        let translated = AnthropicAdapter
            .translate_request(&request_with(messages))
            .unwrap();
        let wire = translated.body["messages"].as_array().unwrap();

        let blocks = wire[1]["content"].as_array().unwrap();
        assert_eq!(blocks[0]["type"], "text");
        assert_eq!(blocks[1]["type"], "tool_use");
        assert_eq!(blocks[1]["id"], "toolu_1");
        assert_eq!(blocks[1]["input"]["tz"], "UTC");

        assert_eq!(wire[2]["role"], "user");
        assert_eq!(wire[2]["content"][0]["type"], "tool_result");
        assert_eq!(wire[2]["content"][0]["tool_use_id"], "toolu_1");
    }

    #[test]
    fn test_tools_flattened_and_tool_choice_normalized() {
        let mut request = request_with(vec![ChatMessage::text(Role::User, "hi")]);
        request.tools = Some(vec![json!({
            "type": "function",
            "function": { "name": "f", "description": "d", "parameters": { "type": "object" } },
        })]);
        request.tool_choice = Some(json!("auto"));

        let translated = AnthropicAdapter.translate_request(&request).unwrap();
        assert_eq!(translated.body["tools"][0]["name"], "f");
        assert_eq!(
            translated.body["tools"][0]["input_schema"]["type"],
            "object"
        );
        assert!(translated.body["tools"][0].get("parameters").is_none());
        assert_eq!(translated.body["tool_choice"]["type"], "auto");
    }

    #[test]
    fn test_response_translation_text_and_tool_use() {
        let raw = json!({
            "id": "msg_1",
            "model": "claude-sonnet-4-20250514",
            "content": [
                { "type": "text", "text": "Using a tool." },
                { "type": "tool_use", "id": "toolu_1", "name": "get_time", "input": { "tz": "UTC" } },
            ],
            "stop_reason": "tool_use",
            "usage": { "input_tokens": 7, "output_tokens": 3 },
        });

        let translated = AnthropicAdapter.translate_response(raw).unwrap();
        let message = &translated["choices"][0]["message"];
        assert_eq!(message["content"], "Using a tool.");
        assert_eq!(message["tool_calls"][0]["id"], "toolu_1");
        assert_eq!(
            message["tool_calls"][0]["function"]["arguments"],
            "{\"tz\":\"UTC\"}"
        );
        assert_eq!(translated["choices"][0]["finish_reason"], "tool_calls");
        assert_eq!(translated["usage"]["total_tokens"], 10);
    }

    #[test]
    fn test_stop_reason_mapping() {
        assert_eq!(map_stop_reason(Some("end_turn")), json!("stop"));
        assert_eq!(map_stop_reason(Some("stop_sequence")), json!("stop"));
        assert_eq!(map_stop_reason(Some("max_tokens")), json!("length"));
        assert_eq!(map_stop_reason(Some("tool_use")), json!("tool_calls"));
        assert_eq!(map_stop_reason(None), Value::Null);
    }

    fn translator() -> Box<dyn StreamTranslator> {
        AnthropicAdapter.stream_translator(StreamContext {
            id: "chatcmpl-1".to_string(),
            model: "claude-sonnet-4-20250514".to_string(),
        })
    }

    #[test]
    fn test_stream_lifecycle() {
        let mut t = translator();

        let frames = t.on_event(&json!({
            "type": "message_start",
            "message": { "id": "msg_1", "usage": { "input_tokens": 12, "output_tokens": 1 } },
        }));
        let StreamFrame::Chunk(role) = &frames[0] else {
            panic!()
        };
        assert_eq!(role["choices"][0]["delta"]["role"], "assistant");

        let frames = t.on_event(&json!({
            "type": "content_block_delta",
            "index": 0,
            "delta": { "type": "text_delta", "text": "Hel" },
        }));
        let StreamFrame::Chunk(content) = &frames[0] else {
            panic!()
        };
        assert_eq!(content["choices"][0]["delta"]["content"], "Hel");

        let frames = t.on_event(&json!({
            "type": "message_delta",
            "delta": { "stop_reason": "end_turn" },
            "usage": { "output_tokens": 5 },
        }));
        let StreamFrame::Chunk(finish) = &frames[0] else {
            panic!()
        };
        assert_eq!(finish["choices"][0]["finish_reason"], "stop");
        assert_eq!(finish["usage"]["prompt_tokens"], 12);
        assert_eq!(finish["usage"]["completion_tokens"], 5);

        assert_eq!(t.on_event(&json!({ "type": "message_stop" })), vec![StreamFrame::Done]);
        assert!(t.on_done().is_empty());
    }

    #[test]
    fn test_stream_tool_use_blocks() {
        let mut t = translator();
        t.on_event(&json!({ "type": "message_start", "message": { "usage": {} } }));

        let frames = t.on_event(&json!({
            "type": "content_block_start",
            "index": 1,
            "content_block": { "type": "tool_use", "id": "toolu_1", "name": "get_time" },
        }));
        let StreamFrame::Chunk(start) = &frames[0] else {
            panic!()
        };
        let call = &start["choices"][0]["delta"]["tool_calls"][0];
        assert_eq!(call["index"], 0);
        assert_eq!(call["id"], "toolu_1");
        assert_eq!(call["function"]["name"], "get_time");

        let frames = t.on_event(&json!({
            "type": "content_block_delta",
            "index": 1,
            "delta": { "type": "input_json_delta", "partial_json": "{\"tz\"" },
        }));
        let StreamFrame::Chunk(args) = &frames[0] else {
            panic!()
        };
        assert_eq!(
            args["choices"][0]["delta"]["tool_calls"][0]["function"]["arguments"],
            "{\"tz\""
        );
    }

    #[test]
    fn test_stream_done_without_message_stop() {
        let mut t = translator();
        assert_eq!(t.on_done(), vec![StreamFrame::Done]);
        assert!(t.on_done().is_empty());
    }
}
