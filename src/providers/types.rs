// Internal request/message model. Everything entering the gateway is
// normalized into this Chat-Completions shape; adapters translate it into
// the provider wire formats and never leak wire types back out.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Message role in a conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "system" => Some(Role::System),
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "tool" => Some(Role::Tool),
            _ => None,
        }
    }
}

/// Message content: a plain string or a multimodal part array (text parts
/// and image-url parts). Parts stay permissive; providers that cannot carry
/// them flatten to text.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<Value>),
}

impl Default for MessageContent {
    fn default() -> Self {
        MessageContent::Text(String::new())
    }
}

impl MessageContent {
    pub fn text(value: impl Into<String>) -> Self {
        MessageContent::Text(value.into())
    }

    pub fn is_empty(&self) -> bool {
        match self {
            MessageContent::Text(text) => text.is_empty(),
            MessageContent::Parts(parts) => parts.is_empty(),
        }
    }

    /// Flatten to a plain string: text parts are concatenated, non-text
    /// parts are dropped.
    pub fn as_text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|part| {
                    part.get("text")
                        .and_then(Value::as_str)
                        .map(|s| s.to_string())
                })
                .collect::<Vec<_>>()
                .join(""),
        }
    }
}

/// A function call emitted by the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded arguments, exactly as the upstream produced them.
    #[serde(default)]
    pub arguments: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCallPayload {
    pub id: String,
    /// Responses-API-style id; when both are present it takes precedence
    /// over `id` for cross-referencing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    #[serde(rename = "type", default = "function_type")]
    pub call_type: String,
    pub function: FunctionCall,
}

fn function_type() -> String {
    "function".to_string()
}

impl ToolCallPayload {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            call_id: None,
            call_type: function_type(),
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }

    /// The id used for cross-referencing outputs: `call_id` wins over `id`.
    pub fn reference_id(&self) -> &str {
        self.call_id.as_deref().unwrap_or(&self.id)
    }
}

/// One message in the internal conversation shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<MessageContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallPayload>>,
}

impl ChatMessage {
    pub fn text(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(MessageContent::text(content)),
            tool_call_id: None,
            tool_calls: None,
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: Some(MessageContent::text(content)),
            tool_call_id: Some(tool_call_id.into()),
            tool_calls: None,
        }
    }

    pub fn content_text(&self) -> String {
        self.content.as_ref().map(|c| c.as_text()).unwrap_or_default()
    }
}

/// The internal request shape shared by all providers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verbosity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_response_id: Option<String>,
    /// Anything else the client sent; forwarded only where a wire format
    /// understands it.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Fields reserved for gateway routing; they never reach an upstream.
pub const RESERVED_FIELDS: &[&str] = &[
    "conversation_id",
    "provider_id",
    "client_operation",
    "client_request_id",
    "custom_request_params_id",
    "streamingEnabled",
    "toolsEnabled",
    "researchMode",
    "qualityLevel",
    "provider_stream",
    "providerStream",
    "intent",
    "system_prompt",
    "session_id",
];

/// Strip every reserved field from a raw request body, in place.
pub fn sanitize_body(body: &mut Map<String, Value>) {
    for field in RESERVED_FIELDS {
        body.remove(*field);
    }
}

/// Normalize a tool list into the uniform internal shape:
/// `{type:"function", function:{name, description, parameters}}`.
///
/// Accepts bare name strings, flat `{name, …}` objects, and already-nested
/// function tools. Entries that fit none of those are dropped.
pub fn uniform_toolset(tools: &[Value]) -> Vec<Value> {
    tools
        .iter()
        .filter_map(|tool| {
            if let Some(name) = tool.as_str() {
                return Some(json!({
                    "type": "function",
                    "function": {
                        "name": name,
                        "description": "",
                        "parameters": { "type": "object", "properties": {} },
                    },
                }));
            }

            let obj = tool.as_object()?;
            if let Some(function) = obj.get("function").and_then(Value::as_object) {
                function.get("name")?.as_str()?;
                return Some(json!({
                    "type": "function",
                    "function": {
                        "name": function.get("name").cloned().unwrap_or_default(),
                        "description": function
                            .get("description")
                            .cloned()
                            .unwrap_or_else(|| json!("")),
                        "parameters": function.get("parameters").cloned().unwrap_or_else(
                            || json!({ "type": "object", "properties": {} }),
                        ),
                    },
                }));
            }

            let name = obj.get("name")?.as_str()?;
            Some(json!({
                "type": "function",
                "function": {
                    "name": name,
                    "description": obj.get("description").cloned().unwrap_or_else(|| json!("")),
                    "parameters": obj.get("parameters").cloned().unwrap_or_else(
                        || json!({ "type": "object", "properties": {} }),
                    ),
                },
            }))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_round_trip() {
        for role in [Role::System, Role::User, Role::Assistant, Role::Tool] {
            assert_eq!(Role::parse(role.as_str()), Some(role));
        }
        assert_eq!(Role::parse("narrator"), None);
    }

    #[test]
    fn test_content_deserializes_both_shapes() {
        let text: MessageContent = serde_json::from_value(json!("hello")).unwrap();
        assert_eq!(text.as_text(), "hello");

        let parts: MessageContent = serde_json::from_value(json!([
            { "type": "text", "text": "a" },
            { "type": "image_url", "image_url": { "url": "http://x/y.png" } },
            { "type": "text", "text": "b" },
        ]))
        .unwrap();
        assert_eq!(parts.as_text(), "ab");
    }

    #[test]
    fn test_sanitize_strips_reserved_fields() {
        let mut body = serde_json::from_value::<Map<String, Value>>(json!({
            "model": "gpt-4o",
            "conversation_id": "c1",
            "provider_id": "openai",
            "streamingEnabled": true,
            "providerStream": false,
            "intent": { "type": "append_message" },
            "messages": [],
        }))
        .unwrap();

        sanitize_body(&mut body);
        assert!(body.contains_key("model"));
        assert!(body.contains_key("messages"));
        for field in RESERVED_FIELDS {
            assert!(!body.contains_key(*field), "{} survived", field);
        }
    }

    #[test]
    fn test_uniform_toolset_expands_strings() {
        let tools = uniform_toolset(&[json!("get_time")]);
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0]["type"], "function");
        assert_eq!(tools[0]["function"]["name"], "get_time");
        assert_eq!(tools[0]["function"]["description"], "");
        assert_eq!(tools[0]["function"]["parameters"]["type"], "object");
    }

    #[test]
    fn test_uniform_toolset_lifts_flat_objects() {
        let tools = uniform_toolset(&[json!({
            "name": "search",
            "description": "find things",
            "parameters": { "type": "object", "properties": { "q": { "type": "string" } } },
        })]);
        assert_eq!(tools[0]["function"]["name"], "search");
        assert_eq!(tools[0]["function"]["description"], "find things");
        assert_eq!(
            tools[0]["function"]["parameters"]["properties"]["q"]["type"],
            "string"
        );
    }

    #[test]
    fn test_uniform_toolset_passes_nested_through() {
        let nested = json!({
            "type": "function",
            "function": { "name": "f", "description": "d", "parameters": { "type": "object" } },
        });
        let tools = uniform_toolset(std::slice::from_ref(&nested));
        assert_eq!(tools[0], nested);
    }

    #[test]
    fn test_uniform_toolset_drops_unusable_entries() {
        let tools = uniform_toolset(&[json!(42), json!({ "description": "no name" })]);
        assert!(tools.is_empty());
    }

    #[test]
    fn test_chat_request_preserves_unknown_fields() {
        let request: ChatRequest = serde_json::from_value(json!({
            "model": "m",
            "messages": [{ "role": "user", "content": "hi" }],
            "top_p": 0.5,
        }))
        .unwrap();
        assert_eq!(request.extra["top_p"], json!(0.5));
        assert_eq!(request.messages[0].content_text(), "hi");
    }
}
