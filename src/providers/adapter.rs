// The adapter seam: per-wire-format request/response translation plus a
// stateful stream translator for providers whose streams are not already
// `chat.completion.chunk` shaped.

use serde_json::Value;

use crate::error::GatewayError;
use crate::providers::types::ChatRequest;
use crate::sse::chunk_envelope;

/// A wire request ready to send: the JSON body plus the endpoint path it
/// must be posted to (relative to the provider base URL).
#[derive(Debug, Clone)]
pub struct TranslatedRequest {
    pub path: String,
    pub body: Value,
}

/// One frame toward the client.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamFrame {
    /// A full `chat.completion.chunk` object.
    Chunk(Value),
    /// Terminal `[DONE]`.
    Done,
}

/// Identity of the response being streamed; used to stamp envelopes.
#[derive(Debug, Clone)]
pub struct StreamContext {
    pub id: String,
    pub model: String,
}

impl StreamContext {
    pub fn chunk(&self, delta: Value, finish_reason: Option<&str>) -> Value {
        chunk_envelope(&self.id, &self.model, delta, finish_reason)
    }
}

/// Incremental upstream-to-client stream translation. One translator is
/// created per request and owns all cross-event state.
pub trait StreamTranslator: Send {
    /// Consume one parsed upstream event.
    fn on_event(&mut self, event: &Value) -> Vec<StreamFrame>;

    /// Upstream signalled end-of-stream (explicit `[DONE]` or socket close).
    fn on_done(&mut self) -> Vec<StreamFrame>;
}

/// Per-wire-format translator. Implementations are stateless; streaming
/// state lives in the [`StreamTranslator`] they hand out.
pub trait Adapter: Send + Sync {
    fn translate_request(&self, request: &ChatRequest) -> Result<TranslatedRequest, GatewayError>;

    /// Translate a non-streaming wire response into a `chat.completion`
    /// object.
    fn translate_response(&self, raw: Value) -> Result<Value, GatewayError>;

    /// Whether the upstream stream must be translated before reaching the
    /// client.
    fn needs_stream_translation(&self) -> bool;

    fn stream_translator(&self, context: StreamContext) -> Box<dyn StreamTranslator>;
}
