// Provider abstraction: one internal Chat-Completions-shaped format, four
// wire translators, and a facade that owns credentials and the HTTP call.

pub mod adapter;
pub mod anthropic;
pub mod chat_completions;
pub mod facade;
pub mod gemini;
pub mod responses;
pub mod types;

pub use adapter::{Adapter, StreamContext, StreamFrame, StreamTranslator};
pub use facade::{ModelInfo, Provider, ProviderKind};
pub use types::{
    sanitize_body, uniform_toolset, ChatMessage, ChatRequest, FunctionCall, MessageContent, Role,
    ToolCallPayload, RESERVED_FIELDS,
};
