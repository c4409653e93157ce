// Draft lifecycle for one streamed assistant message: insert the draft row
// up front, checkpoint the buffer by size/time thresholds while deltas
// arrive, then finalize or mark error. Partial content survives
// disconnects at the last checkpoint.

use std::time::Instant;

use crate::config::CheckpointConfig;
use crate::error::GatewayError;
use crate::persist::store::{NewToolCall, Store};
use crate::providers::types::Role;

pub struct DraftWriter {
    store: Store,
    conversation_id: String,
    /// None when the draft insert failed; finalize falls back to a single
    /// final insert.
    message_id: Option<String>,
    seq: Option<i64>,
    buffer: String,
    checkpointed_len: usize,
    last_checkpoint: Instant,
    config: CheckpointConfig,
    terminal: bool,
}

impl DraftWriter {
    /// Allocate the next seq and insert an empty draft row.
    pub async fn begin(store: Store, conversation_id: &str, config: CheckpointConfig) -> Self {
        let (message_id, seq) = match store
            .insert_message(conversation_id, Role::Assistant, "", None, "draft", None, None)
            .await
        {
            Ok(row) => (Some(row.id), Some(row.seq)),
            Err(err) => {
                log::warn!(
                    "draft insert failed for conversation {}: {}",
                    conversation_id,
                    err
                );
                (None, None)
            }
        };

        Self {
            store,
            conversation_id: conversation_id.to_string(),
            message_id,
            seq,
            buffer: String::new(),
            checkpointed_len: 0,
            last_checkpoint: Instant::now(),
            config,
            terminal: false,
        }
    }

    pub fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    pub fn seq(&self) -> Option<i64> {
        self.seq
    }

    pub fn content(&self) -> &str {
        &self.buffer
    }

    /// Append a content delta, checkpointing when either threshold trips.
    pub async fn append(&mut self, delta: &str) {
        if self.terminal {
            return;
        }
        self.buffer.push_str(delta);

        if !self.config.enabled {
            return;
        }

        let grown = self.buffer.len() - self.checkpointed_len;
        let elapsed_ms = self.last_checkpoint.elapsed().as_millis() as u64;
        if grown >= self.config.min_characters || elapsed_ms >= self.config.interval_ms {
            self.checkpoint().await;
        }
    }

    async fn checkpoint(&mut self) {
        let Some(message_id) = self.message_id.clone() else {
            return;
        };
        if let Err(err) = self.store.checkpoint_content(&message_id, &self.buffer).await {
            log::warn!("checkpoint failed for message {}: {}", message_id, err);
            return;
        }
        self.checkpointed_len = self.buffer.len();
        self.last_checkpoint = Instant::now();
    }

    /// Finalize the draft: terminal status, finish reason, tokens, and the
    /// accumulated tool calls. Falls back to a plain final insert when the
    /// draft row never existed.
    pub async fn finalize(
        &mut self,
        finish_reason: Option<&str>,
        tokens_in: Option<i64>,
        tokens_out: Option<i64>,
        response_id: Option<&str>,
        tool_calls: &[NewToolCall],
    ) -> Result<Option<String>, GatewayError> {
        if self.terminal {
            return Ok(self.message_id.clone());
        }
        self.terminal = true;

        match self.message_id.clone() {
            Some(message_id) => {
                self.store
                    .finalize_message(
                        &message_id,
                        &self.buffer,
                        finish_reason,
                        tokens_in,
                        tokens_out,
                        response_id,
                        tool_calls,
                    )
                    .await?;
                Ok(Some(message_id))
            }
            None => {
                let row = self
                    .store
                    .insert_message(
                        &self.conversation_id,
                        Role::Assistant,
                        &self.buffer,
                        None,
                        "final",
                        None,
                        finish_reason,
                    )
                    .await?;
                self.store
                    .finalize_message(
                        &row.id,
                        &self.buffer,
                        finish_reason,
                        tokens_in,
                        tokens_out,
                        response_id,
                        tool_calls,
                    )
                    .await?;
                Ok(Some(row.id))
            }
        }
    }

    /// Terminal error: the row keeps whatever content the last checkpoint
    /// wrote; the unflushed tail is dropped with the connection.
    pub async fn mark_error(&mut self) {
        if self.terminal {
            return;
        }
        self.terminal = true;

        if let Some(message_id) = self.message_id.clone() {
            if let Err(err) = self.store.mark_error(&message_id).await {
                log::warn!("mark_error failed for message {}: {}", message_id, err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    async fn test_store() -> (Store, String) {
        let pool = crate::persist::schema::connect("file::memory:").await.unwrap();
        crate::persist::schema::ensure_schema(&pool).await.unwrap();
        let store = Store::new(pool, 1000);
        let conv = store
            .create_conversation(None, None, None, None, None, None)
            .await
            .unwrap();
        (store, conv.id)
    }

    fn config(min_characters: usize, interval_ms: u64) -> CheckpointConfig {
        CheckpointConfig {
            enabled: true,
            min_characters,
            interval_ms,
        }
    }

    #[tokio::test]
    async fn test_draft_row_created_empty() {
        let (store, conv) = test_store().await;
        let writer = DraftWriter::begin(store.clone(), &conv, config(512, 60_000)).await;

        let row = store
            .get_message(writer.message_id().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, "draft");
        assert_eq!(row.content, "");
        assert_eq!(row.seq, 1);
    }

    #[tokio::test]
    async fn test_size_threshold_triggers_checkpoint() {
        let (store, conv) = test_store().await;
        let mut writer = DraftWriter::begin(store.clone(), &conv, config(10, 60_000)).await;
        let id = writer.message_id().unwrap().to_string();

        writer.append("short").await;
        assert_eq!(store.get_message(&id).await.unwrap().unwrap().content, "");

        writer.append(" and now long enough").await;
        assert_eq!(
            store.get_message(&id).await.unwrap().unwrap().content,
            "short and now long enough"
        );
    }

    #[tokio::test]
    async fn test_interval_threshold_triggers_checkpoint() {
        let (store, conv) = test_store().await;
        let mut writer = DraftWriter::begin(store.clone(), &conv, config(1_000_000, 0)).await;
        let id = writer.message_id().unwrap().to_string();

        writer.append("x").await;
        assert_eq!(store.get_message(&id).await.unwrap().unwrap().content, "x");
    }

    #[tokio::test]
    async fn test_disabled_checkpointing_never_writes() {
        let (store, conv) = test_store().await;
        let mut writer = DraftWriter::begin(
            store.clone(),
            &conv,
            CheckpointConfig {
                enabled: false,
                min_characters: 1,
                interval_ms: 0,
            },
        )
        .await;
        let id = writer.message_id().unwrap().to_string();

        writer.append("plenty of content here").await;
        assert_eq!(store.get_message(&id).await.unwrap().unwrap().content, "");

        // Finalize still writes the full buffer.
        writer.finalize(Some("stop"), None, None, None, &[]).await.unwrap();
        let row = store.get_message(&id).await.unwrap().unwrap();
        assert_eq!(row.content, "plenty of content here");
        assert_eq!(row.status, "final");
    }

    #[tokio::test]
    async fn test_error_keeps_last_checkpoint() {
        let (store, conv) = test_store().await;
        let mut writer = DraftWriter::begin(store.clone(), &conv, config(5, 60_000)).await;
        let id = writer.message_id().unwrap().to_string();

        writer.append("partial answer").await; // past min_characters: checkpointed
        writer.append("x").await; // below threshold: buffered only
        writer.mark_error().await;

        let row = store.get_message(&id).await.unwrap().unwrap();
        assert_eq!(row.status, "error");
        assert_eq!(row.finish_reason.as_deref(), Some("error"));
        assert_eq!(row.content, "partial answer");
    }

    #[tokio::test]
    async fn test_abort_before_any_content() {
        let (store, conv) = test_store().await;
        let mut writer = DraftWriter::begin(store.clone(), &conv, config(512, 60_000)).await;
        let id = writer.message_id().unwrap().to_string();

        writer.mark_error().await;
        let row = store.get_message(&id).await.unwrap().unwrap();
        assert_eq!(row.status, "error");
        assert_eq!(row.content, "");
    }

    #[tokio::test]
    async fn test_finalize_is_idempotent() {
        let (store, conv) = test_store().await;
        let mut writer = DraftWriter::begin(store.clone(), &conv, config(512, 60_000)).await;
        writer.append("answer").await;

        let first = writer.finalize(Some("stop"), Some(3), Some(2), None, &[]).await.unwrap();
        let second = writer.finalize(Some("stop"), None, None, None, &[]).await.unwrap();
        assert_eq!(first, second);

        let row = store.get_message(&first.unwrap()).await.unwrap().unwrap();
        assert_eq!(row.tokens_total, Some(5));
    }
}
