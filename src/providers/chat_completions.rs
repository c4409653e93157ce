// Chat Completions wire adapter. This is the pass-through family: the
// internal format already is Chat-Completions-shaped, so translation is
// normalization rather than restructuring.

use serde_json::{json, Map, Value};

use crate::error::GatewayError;
use crate::providers::adapter::{
    Adapter, StreamContext, StreamFrame, StreamTranslator, TranslatedRequest,
};
use crate::providers::types::{uniform_toolset, ChatRequest, MessageContent, Role};

pub struct ChatCompletionsAdapter;

pub const CHAT_COMPLETIONS_PATH: &str = "/v1/chat/completions";

impl Adapter for ChatCompletionsAdapter {
    fn translate_request(&self, request: &ChatRequest) -> Result<TranslatedRequest, GatewayError> {
        if request.messages.is_empty() {
            return Err(GatewayError::validation(
                "missing_messages",
                "messages must be a non-empty array",
                None,
                None,
            ));
        }

        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|msg| {
                let mut out = Map::new();
                out.insert("role".to_string(), json!(msg.role.as_str()));

                // Non-assistant roles are normalized to plain-string content;
                // assistant content keeps whatever shape it arrived in.
                match (&msg.content, msg.role) {
                    (Some(MessageContent::Parts(_)), Role::Assistant) => {
                        out.insert(
                            "content".to_string(),
                            serde_json::to_value(msg.content.as_ref().unwrap()).unwrap_or(Value::Null),
                        );
                    }
                    (Some(content), Role::Assistant) if !content.is_empty() => {
                        out.insert("content".to_string(), json!(content.as_text()));
                    }
                    (_, Role::Assistant) => {
                        if msg.tool_calls.is_none() {
                            out.insert("content".to_string(), json!(""));
                        }
                    }
                    (Some(content), _) => {
                        out.insert("content".to_string(), json!(content.as_text()));
                    }
                    (None, _) => {
                        out.insert("content".to_string(), json!(""));
                    }
                }

                if let Some(id) = &msg.tool_call_id {
                    out.insert("tool_call_id".to_string(), json!(id));
                }
                if let Some(calls) = &msg.tool_calls {
                    out.insert(
                        "tool_calls".to_string(),
                        serde_json::to_value(calls).unwrap_or(Value::Null),
                    );
                }
                Value::Object(out)
            })
            .collect();

        let mut body = Map::new();
        if let Some(model) = &request.model {
            body.insert("model".to_string(), json!(model));
        }
        body.insert("messages".to_string(), json!(messages));
        if let Some(tools) = &request.tools {
            let tools = uniform_toolset(tools);
            if !tools.is_empty() {
                body.insert("tools".to_string(), json!(tools));
            }
        }
        if let Some(choice) = &request.tool_choice {
            body.insert("tool_choice".to_string(), choice.clone());
        }
        if let Some(temperature) = request.temperature {
            body.insert("temperature".to_string(), json!(temperature));
        }
        if let Some(max_tokens) = request.max_tokens {
            body.insert("max_tokens".to_string(), json!(max_tokens));
        }
        if let Some(stream) = request.stream {
            body.insert("stream".to_string(), json!(stream));
        }
        if let Some(effort) = &request.reasoning_effort {
            body.insert("reasoning_effort".to_string(), json!(effort));
        }
        if let Some(verbosity) = &request.verbosity {
            body.insert("verbosity".to_string(), json!(verbosity));
        }
        for (key, value) in &request.extra {
            body.entry(key.clone()).or_insert_with(|| value.clone());
        }

        Ok(TranslatedRequest {
            path: CHAT_COMPLETIONS_PATH.to_string(),
            body: Value::Object(body),
        })
    }

    fn translate_response(&self, raw: Value) -> Result<Value, GatewayError> {
        // Some compatible servers return the JSON double-encoded as a string.
        if let Value::String(text) = &raw {
            return serde_json::from_str(text).map_err(|err| GatewayError::Provider {
                message: format!("unparsable upstream response: {}", err),
                status: None,
            });
        }
        Ok(raw)
    }

    fn needs_stream_translation(&self) -> bool {
        false
    }

    fn stream_translator(&self, _context: StreamContext) -> Box<dyn StreamTranslator> {
        Box::new(PassThroughTranslator)
    }
}

/// Upstream chunks are already `chat.completion.chunk` objects.
struct PassThroughTranslator;

impl StreamTranslator for PassThroughTranslator {
    fn on_event(&mut self, event: &Value) -> Vec<StreamFrame> {
        vec![StreamFrame::Chunk(event.clone())]
    }

    fn on_done(&mut self) -> Vec<StreamFrame> {
        vec![StreamFrame::Done]
    }
}
