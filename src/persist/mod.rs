// Conversation persistence: embedded schema, the row store, and the
// draft/checkpoint/final lifecycle for streamed assistant messages.

pub mod draft;
pub mod schema;
pub mod store;

pub use draft::DraftWriter;
pub use store::{
    ConversationRow, MessageRow, NewToolCall, NewToolOutput, Store, ToolCallRow, ToolOutputRow,
};
