// Client-facing SSE framing: `chat.completion.chunk` envelopes and the
// response wrapper that sets the event-stream headers.

use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::Response;
use serde_json::{json, Value};

pub const CHUNK_OBJECT: &str = "chat.completion.chunk";

/// Build one `chat.completion.chunk` envelope around a free-form delta.
///
/// The delta carries whichever keys the producer needs: `role`, `content`,
/// `tool_calls` fragments, or the orchestrator's `tool_call`/`tool_output`
/// keys.
pub fn chunk_envelope(id: &str, model: &str, delta: Value, finish_reason: Option<&str>) -> Value {
    json!({
        "id": id,
        "object": CHUNK_OBJECT,
        "created": chrono::Utc::now().timestamp(),
        "model": model,
        "choices": [{
            "index": 0,
            "delta": delta,
            "finish_reason": finish_reason,
        }],
    })
}

/// Render one SSE frame: `data: <json>\n\n`.
pub fn sse_frame(payload: &Value) -> String {
    format!("data: {}\n\n", payload)
}

/// The terminal frame.
pub fn sse_done() -> String {
    "data: [DONE]\n\n".to_string()
}

/// Wrap a body in a 200 response with event-stream headers.
pub fn sse_response(body: Body) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(body)
        .expect("static header set is valid")
}
