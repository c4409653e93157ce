// Server-Sent Events plumbing: sans-I/O parsing of upstream streams,
// chunk-envelope framing toward clients, and the tee-with-preview adapter.

pub mod frame;
pub mod parser;
pub mod tee;

pub use frame::{chunk_envelope, sse_done, sse_frame, sse_response, CHUNK_OBJECT};
pub use parser::SseParser;
pub use tee::{tee_with_preview, PreviewReceiver, DEFAULT_PREVIEW_BYTES};
