// Row store for conversations, messages, and their tool-call/tool-output
// children. This is the only module that mutates rows; everything else
// consumes snapshots. Seq allocation is serialized per conversation.

use serde_json::Value;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::diff::{DiffMessage, DiffToolCall, DiffToolOutput};
use crate::error::GatewayError;
use crate::providers::types::{ChatMessage, MessageContent, Role, ToolCallPayload};

pub const MIN_TOOL_ITERATIONS: u32 = 1;
pub const MAX_TOOL_ITERATIONS: u32 = 50;

#[derive(Debug, Clone, serde::Serialize)]
pub struct ConversationRow {
    pub id: String,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub title: Option<String>,
    pub model: Option<String>,
    pub provider_id: Option<String>,
    pub metadata: Option<Value>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ToolCallRow {
    pub id: String,
    pub message_id: String,
    pub call_index: i64,
    pub tool_name: String,
    pub arguments: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text_offset: Option<i64>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ToolOutputRow {
    pub id: String,
    pub tool_call_id: String,
    pub message_id: String,
    pub output: String,
    pub status: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MessageRow {
    pub id: String,
    pub conversation_id: String,
    pub seq: i64,
    pub role: String,
    pub content: String,
    /// Structured multimodal content, when the message carried part arrays.
    /// Server-internal: never serialized into API responses.
    #[serde(skip)]
    pub content_json: Option<Value>,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_in: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_out: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_total: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_id: Option<String>,
    pub created_at: i64,
    pub tool_calls: Vec<ToolCallRow>,
    pub tool_outputs: Vec<ToolOutputRow>,
}

/// A tool call to persist under an assistant message.
#[derive(Debug, Clone)]
pub struct NewToolCall {
    pub id: String,
    pub tool_name: String,
    pub arguments: String,
    pub text_offset: Option<i64>,
}

/// A tool output to persist under a tool message.
#[derive(Debug, Clone)]
pub struct NewToolOutput {
    pub tool_call_id: String,
    pub output: String,
    pub status: String,
}

/// Result of an edit-as-fork, reported against the original conversation.
#[derive(Debug, Clone, serde::Serialize)]
pub struct EditOutcome {
    pub fork_conversation_id: String,
    pub updated: Vec<String>,
    pub deleted: Vec<String>,
}

type SeqLocks = Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>;

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    seq_locks: SeqLocks,
    max_messages: usize,
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

impl Store {
    pub fn new(pool: SqlitePool, max_messages: usize) -> Self {
        Self {
            pool,
            seq_locks: Arc::new(Mutex::new(HashMap::new())),
            max_messages,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn seq_lock(&self, conversation_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = match self.seq_locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks
            .entry(conversation_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    // ---- conversations ----

    pub async fn create_conversation(
        &self,
        user_id: Option<&str>,
        session_id: Option<&str>,
        title: Option<&str>,
        model: Option<&str>,
        provider_id: Option<&str>,
        metadata: Option<&Value>,
    ) -> Result<ConversationRow, GatewayError> {
        let id = new_id();
        let ts = now();
        sqlx::query(
            "INSERT INTO conversations \
             (id, user_id, session_id, title, model, provider_id, metadata, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8)",
        )
        .bind(&id)
        .bind(user_id)
        .bind(session_id)
        .bind(title)
        .bind(model)
        .bind(provider_id)
        .bind(metadata.map(|m| m.to_string()))
        .bind(ts)
        .execute(&self.pool)
        .await?;

        Ok(ConversationRow {
            id,
            user_id: user_id.map(String::from),
            session_id: session_id.map(String::from),
            title: title.map(String::from),
            model: model.map(String::from),
            provider_id: provider_id.map(String::from),
            metadata: metadata.cloned(),
            created_at: ts,
            updated_at: ts,
        })
    }

    pub async fn get_conversation(&self, id: &str) -> Result<Option<ConversationRow>, GatewayError> {
        let row: Option<(
            String,
            Option<String>,
            Option<String>,
            Option<String>,
            Option<String>,
            Option<String>,
            Option<String>,
            i64,
            i64,
        )> = sqlx::query_as(
            "SELECT id, user_id, session_id, title, model, provider_id, metadata, \
                    created_at, updated_at \
             FROM conversations WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(
            |(id, user_id, session_id, title, model, provider_id, metadata, created_at, updated_at)| {
                ConversationRow {
                    id,
                    user_id,
                    session_id,
                    title,
                    model,
                    provider_id,
                    metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
                    created_at,
                    updated_at,
                }
            },
        ))
    }

    pub async fn list_conversations(
        &self,
        user_id: Option<&str>,
    ) -> Result<Vec<ConversationRow>, GatewayError> {
        let rows: Vec<(
            String,
            Option<String>,
            Option<String>,
            Option<String>,
            Option<String>,
            Option<String>,
            Option<String>,
            i64,
            i64,
        )> = match user_id {
            Some(user_id) => {
                sqlx::query_as(
                    "SELECT id, user_id, session_id, title, model, provider_id, metadata, \
                            created_at, updated_at \
                     FROM conversations \
                     WHERE deleted_at IS NULL AND user_id = $1 \
                     ORDER BY updated_at DESC",
                )
                .bind(user_id)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(
                    "SELECT id, user_id, session_id, title, model, provider_id, metadata, \
                            created_at, updated_at \
                     FROM conversations WHERE deleted_at IS NULL \
                     ORDER BY updated_at DESC",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };

        Ok(rows
            .into_iter()
            .map(
                |(id, user_id, session_id, title, model, provider_id, metadata, created_at, updated_at)| {
                    ConversationRow {
                        id,
                        user_id,
                        session_id,
                        title,
                        model,
                        provider_id,
                        metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
                        created_at,
                        updated_at,
                    }
                },
            )
            .collect())
    }

    pub async fn soft_delete_conversation(&self, id: &str) -> Result<bool, GatewayError> {
        let result = sqlx::query(
            "UPDATE conversations SET deleted_at = $1 WHERE id = $2 AND deleted_at IS NULL",
        )
        .bind(now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn touch_conversation(&self, id: &str) -> Result<(), GatewayError> {
        sqlx::query("UPDATE conversations SET updated_at = $1 WHERE id = $2")
            .bind(now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Highest seq ever issued in the conversation. Soft-deleted rows keep
    /// their slot; seq values are never reused, so this is the allocation
    /// watermark, not the visible tail.
    pub async fn tail_seq(&self, conversation_id: &str) -> Result<i64, GatewayError> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COALESCE(MAX(seq), 0) FROM messages WHERE conversation_id = $1",
        )
        .bind(conversation_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    /// Seq of the last visible message, for optimistic-lock checks.
    pub async fn visible_tail_seq(&self, conversation_id: &str) -> Result<i64, GatewayError> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COALESCE(MAX(seq), 0) FROM messages \
             WHERE conversation_id = $1 AND deleted_at IS NULL",
        )
        .bind(conversation_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    pub async fn message_count(&self, conversation_id: &str) -> Result<i64, GatewayError> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM messages WHERE conversation_id = $1 AND deleted_at IS NULL",
        )
        .bind(conversation_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    // ---- messages ----

    /// Insert a message, allocating the next seq under the per-conversation
    /// lock.
    #[allow(clippy::too_many_arguments)]
    pub async fn insert_message(
        &self,
        conversation_id: &str,
        role: Role,
        content: &str,
        content_json: Option<&Value>,
        status: &str,
        tool_call_id: Option<&str>,
        finish_reason: Option<&str>,
    ) -> Result<MessageRow, GatewayError> {
        let lock = self.seq_lock(conversation_id);
        let _guard = lock.lock().await;

        if self.message_count(conversation_id).await? as usize >= self.max_messages {
            return Err(GatewayError::LimitExceeded {
                limit: self.max_messages,
            });
        }

        let seq = self.tail_seq(conversation_id).await? + 1;
        let id = new_id();
        let ts = now();

        sqlx::query(
            "INSERT INTO messages \
             (id, conversation_id, seq, role, content, content_json, status, tool_call_id, \
              finish_reason, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $10)",
        )
        .bind(&id)
        .bind(conversation_id)
        .bind(seq)
        .bind(role.as_str())
        .bind(content)
        .bind(content_json.map(|c| c.to_string()))
        .bind(status)
        .bind(tool_call_id)
        .bind(finish_reason)
        .bind(ts)
        .execute(&self.pool)
        .await?;

        self.touch_conversation(conversation_id).await?;

        Ok(MessageRow {
            id,
            conversation_id: conversation_id.to_string(),
            seq,
            role: role.as_str().to_string(),
            content: content.to_string(),
            content_json: content_json.cloned(),
            status: status.to_string(),
            finish_reason: finish_reason.map(String::from),
            tool_call_id: tool_call_id.map(String::from),
            tokens_in: None,
            tokens_out: None,
            tokens_total: None,
            response_id: None,
            created_at: ts,
            tool_calls: Vec::new(),
            tool_outputs: Vec::new(),
        })
    }

    /// Checkpoint a draft's current content. Only draft rows accept writes.
    pub async fn checkpoint_content(
        &self,
        message_id: &str,
        content: &str,
    ) -> Result<(), GatewayError> {
        sqlx::query(
            "UPDATE messages SET content = $1, updated_at = $2 \
             WHERE id = $3 AND status = 'draft'",
        )
        .bind(content)
        .bind(now())
        .bind(message_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Transactionally finalize a draft: terminal status, finish reason,
    /// token counts, and the accumulated tool-call child rows.
    #[allow(clippy::too_many_arguments)]
    pub async fn finalize_message(
        &self,
        message_id: &str,
        content: &str,
        finish_reason: Option<&str>,
        tokens_in: Option<i64>,
        tokens_out: Option<i64>,
        response_id: Option<&str>,
        tool_calls: &[NewToolCall],
    ) -> Result<(), GatewayError> {
        let tokens_total = match (tokens_in, tokens_out) {
            (None, None) => None,
            (a, b) => Some(a.unwrap_or(0) + b.unwrap_or(0)),
        };

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "UPDATE messages SET content = $1, status = 'final', finish_reason = $2, \
             tokens_in = $3, tokens_out = $4, tokens_total = $5, response_id = $6, \
             updated_at = $7 \
             WHERE id = $8",
        )
        .bind(content)
        .bind(finish_reason)
        .bind(tokens_in)
        .bind(tokens_out)
        .bind(tokens_total)
        .bind(response_id)
        .bind(now())
        .bind(message_id)
        .execute(&mut *tx)
        .await?;

        for (index, call) in tool_calls.iter().enumerate() {
            sqlx::query(
                "INSERT INTO tool_calls (id, message_id, call_index, tool_name, arguments, text_offset) \
                 VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(&call.id)
            .bind(message_id)
            .bind(index as i64)
            .bind(&call.tool_name)
            .bind(&call.arguments)
            .bind(call.text_offset)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Reconcile-path content update. Terminal rows are otherwise immutable;
    /// this is the deliberate mutation applied from a computed message diff.
    pub async fn update_message_content(
        &self,
        message_id: &str,
        content: &str,
    ) -> Result<(), GatewayError> {
        sqlx::query("UPDATE messages SET content = $1, updated_at = $2 WHERE id = $3")
            .bind(content)
            .bind(now())
            .bind(message_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn soft_delete_message(&self, message_id: &str) -> Result<(), GatewayError> {
        sqlx::query(
            "UPDATE messages SET deleted_at = $1 WHERE id = $2 AND deleted_at IS NULL",
        )
        .bind(now())
        .bind(message_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_tool_call_arguments(
        &self,
        message_id: &str,
        call_id: &str,
        arguments: &str,
    ) -> Result<(), GatewayError> {
        sqlx::query("UPDATE tool_calls SET arguments = $1 WHERE message_id = $2 AND id = $3")
            .bind(arguments)
            .bind(message_id)
            .bind(call_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_tool_output(
        &self,
        message_id: &str,
        tool_call_id: &str,
        output: &str,
        status: &str,
    ) -> Result<(), GatewayError> {
        sqlx::query(
            "UPDATE tool_outputs SET output = $1, status = $2 \
             WHERE message_id = $3 AND tool_call_id = $4",
        )
        .bind(output)
        .bind(status)
        .bind(message_id)
        .bind(tool_call_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Flip a draft to the terminal error state, preserving the last
    /// checkpointed content.
    pub async fn mark_error(&self, message_id: &str) -> Result<(), GatewayError> {
        sqlx::query(
            "UPDATE messages SET status = 'error', finish_reason = 'error', updated_at = $1 \
             WHERE id = $2",
        )
        .bind(now())
        .bind(message_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn attach_tool_output(
        &self,
        message_id: &str,
        output: &NewToolOutput,
    ) -> Result<(), GatewayError> {
        sqlx::query(
            "INSERT INTO tool_outputs (id, tool_call_id, message_id, output, status) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(new_id())
        .bind(&output.tool_call_id)
        .bind(message_id)
        .bind(&output.output)
        .bind(&output.status)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn attach_children(&self, messages: &mut [MessageRow]) -> Result<(), GatewayError> {
        for message in messages.iter_mut() {
            let calls: Vec<(String, String, i64, String, String, Option<i64>)> = sqlx::query_as(
                "SELECT id, message_id, call_index, tool_name, arguments, text_offset \
                 FROM tool_calls WHERE message_id = $1 ORDER BY call_index",
            )
            .bind(&message.id)
            .fetch_all(&self.pool)
            .await?;
            message.tool_calls = calls
                .into_iter()
                .map(
                    |(id, message_id, call_index, tool_name, arguments, text_offset)| ToolCallRow {
                        id,
                        message_id,
                        call_index,
                        tool_name,
                        arguments,
                        text_offset,
                    },
                )
                .collect();

            let outputs: Vec<(String, String, String, String, String)> = sqlx::query_as(
                "SELECT id, tool_call_id, message_id, output, status \
                 FROM tool_outputs WHERE message_id = $1 ORDER BY rowid",
            )
            .bind(&message.id)
            .fetch_all(&self.pool)
            .await?;
            message.tool_outputs = outputs
                .into_iter()
                .map(|(id, tool_call_id, message_id, output, status)| ToolOutputRow {
                    id,
                    tool_call_id,
                    message_id,
                    output,
                    status,
                })
                .collect();
        }
        Ok(())
    }

    #[allow(clippy::type_complexity)]
    fn map_message_rows(
        rows: Vec<(
            String,
            String,
            i64,
            String,
            String,
            Option<String>,
            String,
            Option<String>,
            Option<String>,
            Option<i64>,
            Option<i64>,
            Option<i64>,
            Option<String>,
            i64,
        )>,
    ) -> Vec<MessageRow> {
        rows.into_iter()
            .map(
                |(
                    id,
                    conversation_id,
                    seq,
                    role,
                    content,
                    content_json,
                    status,
                    finish_reason,
                    tool_call_id,
                    tokens_in,
                    tokens_out,
                    tokens_total,
                    response_id,
                    created_at,
                )| MessageRow {
                    id,
                    conversation_id,
                    seq,
                    role,
                    content,
                    content_json: content_json.and_then(|c| serde_json::from_str(&c).ok()),
                    status,
                    finish_reason,
                    tool_call_id,
                    tokens_in,
                    tokens_out,
                    tokens_total,
                    response_id,
                    created_at,
                    tool_calls: Vec::new(),
                    tool_outputs: Vec::new(),
                },
            )
            .collect()
    }

    const MESSAGE_COLUMNS: &'static str = "id, conversation_id, seq, role, content, content_json, \
         status, finish_reason, tool_call_id, tokens_in, tokens_out, tokens_total, response_id, \
         created_at";

    /// Messages in ascending seq order with tool children attached.
    /// `before_seq` pages backward through history.
    pub async fn get_messages_page(
        &self,
        conversation_id: &str,
        limit: i64,
        before_seq: Option<i64>,
    ) -> Result<Vec<MessageRow>, GatewayError> {
        let query = format!(
            "SELECT {} FROM messages \
             WHERE conversation_id = $1 AND deleted_at IS NULL AND seq < $2 \
             ORDER BY seq DESC LIMIT $3",
            Self::MESSAGE_COLUMNS
        );
        let rows = sqlx::query_as(&query)
            .bind(conversation_id)
            .bind(before_seq.unwrap_or(i64::MAX))
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        let mut messages = Self::map_message_rows(rows);
        messages.reverse();
        self.attach_children(&mut messages).await?;
        Ok(messages)
    }

    pub async fn get_last_message(
        &self,
        conversation_id: &str,
    ) -> Result<Option<MessageRow>, GatewayError> {
        let mut messages = self.get_messages_page(conversation_id, 1, None).await?;
        Ok(messages.pop())
    }

    pub async fn get_message(&self, message_id: &str) -> Result<Option<MessageRow>, GatewayError> {
        let query = format!(
            "SELECT {} FROM messages WHERE id = $1 AND deleted_at IS NULL",
            Self::MESSAGE_COLUMNS
        );
        let rows = sqlx::query_as(&query)
            .bind(message_id)
            .fetch_all(&self.pool)
            .await?;
        let mut messages = Self::map_message_rows(rows);
        self.attach_children(&mut messages).await?;
        Ok(messages.pop())
    }

    /// Stored content in wire form: structured part arrays come back as
    /// parts, everything else as the flattened text.
    fn row_content(row: &MessageRow) -> MessageContent {
        match &row.content_json {
            Some(Value::Array(parts)) => MessageContent::Parts(parts.clone()),
            _ => MessageContent::text(row.content.clone()),
        }
    }

    /// Reconstruct the wire-ready message list for a model re-invocation.
    /// Assistant rows keep their content verbatim (including any
    /// `<thinking>` prefix) and carry their tool calls; tool rows become
    /// `role:"tool"` messages pointing at the referenced call.
    pub async fn wire_messages(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<ChatMessage>, GatewayError> {
        let rows = self
            .get_messages_page(conversation_id, i64::MAX, None)
            .await?;

        let mut messages = Vec::new();
        for row in rows {
            match row.role.as_str() {
                "system" => {
                    let content = Self::row_content(&row);
                    messages.push(ChatMessage {
                        role: Role::System,
                        content: Some(content),
                        tool_call_id: None,
                        tool_calls: None,
                    });
                }
                "user" => {
                    let content = Self::row_content(&row);
                    messages.push(ChatMessage {
                        role: Role::User,
                        content: Some(content),
                        tool_call_id: None,
                        tool_calls: None,
                    });
                }
                "assistant" => {
                    let tool_calls: Vec<ToolCallPayload> = row
                        .tool_calls
                        .iter()
                        .map(|call| ToolCallPayload::new(&call.id, &call.tool_name, &call.arguments))
                        .collect();
                    let content = Self::row_content(&row);
                    messages.push(ChatMessage {
                        role: Role::Assistant,
                        content: Some(content),
                        tool_call_id: None,
                        tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                    });
                }
                "tool" => {
                    let call_id = row
                        .tool_call_id
                        .clone()
                        .or_else(|| row.tool_outputs.first().map(|o| o.tool_call_id.clone()));
                    if let Some(call_id) = call_id {
                        messages.push(ChatMessage::tool_result(call_id, row.content));
                    }
                }
                _ => {}
            }
        }
        Ok(messages)
    }

    /// Snapshot for the diff engine.
    pub async fn diff_messages(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<(MessageRow, DiffMessage)>, GatewayError> {
        let rows = self
            .get_messages_page(conversation_id, i64::MAX, None)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| {
                let diff = DiffMessage {
                    role: row.role.clone(),
                    content: match &row.content_json {
                        Some(Value::Array(parts)) => Value::Array(parts.clone()),
                        _ => Value::String(row.content.clone()),
                    },
                    tool_calls: row
                        .tool_calls
                        .iter()
                        .map(|call| DiffToolCall {
                            id: call.id.clone(),
                            name: call.tool_name.clone(),
                            arguments: call.arguments.clone(),
                        })
                        .collect(),
                    tool_outputs: row
                        .tool_outputs
                        .iter()
                        .map(|output| DiffToolOutput {
                            tool_call_id: output.tool_call_id.clone(),
                            output: output.output.clone(),
                            status: output.status.clone(),
                        })
                        .collect(),
                };
                (row, diff)
            })
            .collect())
    }

    // ---- edit as fork ----

    /// Edit a user message by forking: the original conversation is
    /// untouched; a new conversation carries the history up to and
    /// including the edited message, with the edit applied.
    pub async fn fork_for_edit(
        &self,
        conversation_id: &str,
        message_id: &str,
        expected_seq: i64,
        new_content: &str,
        client_operation: Option<String>,
    ) -> Result<EditOutcome, GatewayError> {
        let conversation = self.get_conversation(conversation_id).await?.ok_or_else(|| {
            GatewayError::validation(
                "conversation_not_found",
                format!("conversation {} not found", conversation_id),
                client_operation.clone(),
                None,
            )
        })?;

        let target = self.get_message(message_id).await?.ok_or_else(|| {
            GatewayError::validation(
                "missing_required_field",
                format!("message {} not found", message_id),
                client_operation.clone(),
                None,
            )
        })?;

        if target.conversation_id != conversation_id {
            return Err(GatewayError::validation(
                "missing_required_field",
                "message does not belong to conversation",
                client_operation.clone(),
                None,
            ));
        }

        if target.role != "user" {
            return Err(GatewayError::validation(
                "edit_not_allowed",
                "only user messages can be edited",
                client_operation.clone(),
                None,
            ));
        }

        if target.seq != expected_seq {
            return Err(GatewayError::validation(
                "seq_mismatch",
                "expected_seq does not match the message",
                client_operation,
                Some(serde_json::json!({
                    "field": "expected_seq",
                    "expected": target.seq,
                    "actual": expected_seq,
                })),
            ));
        }

        let history = self
            .get_messages_page(conversation_id, i64::MAX, None)
            .await?;

        let fork = self
            .create_conversation(
                conversation.user_id.as_deref(),
                conversation.session_id.as_deref(),
                conversation.title.as_deref(),
                conversation.model.as_deref(),
                conversation.provider_id.as_deref(),
                conversation.metadata.as_ref(),
            )
            .await?;

        let mut deleted = Vec::new();
        for row in &history {
            if row.seq > target.seq {
                deleted.push(row.id.clone());
                continue;
            }

            let (content, content_json) = if row.id == target.id {
                (new_content, None)
            } else {
                (row.content.as_str(), row.content_json.as_ref())
            };
            let role = Role::parse(&row.role).unwrap_or(Role::User);

            let copied = self
                .insert_message(
                    &fork.id,
                    role,
                    content,
                    content_json,
                    &row.status,
                    row.tool_call_id.as_deref(),
                    row.finish_reason.as_deref(),
                )
                .await?;

            for call in &row.tool_calls {
                sqlx::query(
                    "INSERT INTO tool_calls \
                     (id, message_id, call_index, tool_name, arguments, text_offset) \
                     VALUES ($1, $2, $3, $4, $5, $6)",
                )
                .bind(&call.id)
                .bind(&copied.id)
                .bind(call.call_index)
                .bind(&call.tool_name)
                .bind(&call.arguments)
                .bind(call.text_offset)
                .execute(&self.pool)
                .await?;
            }
            for output in &row.tool_outputs {
                self.attach_tool_output(
                    &copied.id,
                    &NewToolOutput {
                        tool_call_id: output.tool_call_id.clone(),
                        output: output.output.clone(),
                        status: output.status.clone(),
                    },
                )
                .await?;
            }
        }

        Ok(EditOutcome {
            fork_conversation_id: fork.id,
            updated: vec![target.id],
            deleted,
        })
    }

    // ---- sessions, settings, users, providers ----

    /// Resolve a session id to its bound user. The session lifecycle is
    /// owned by the auth collaborator; this is read-only.
    pub async fn resolve_session_user(
        &self,
        session_id: &str,
    ) -> Result<Option<String>, GatewayError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT user_id FROM sessions WHERE session_id = $1")
                .bind(session_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(user_id,)| user_id))
    }

    pub async fn user_max_tool_iterations(
        &self,
        user_id: &str,
    ) -> Result<Option<u32>, GatewayError> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT value FROM user_settings WHERE user_id = $1 AND key = 'max_tool_iterations'",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.and_then(|(value,)| value.parse().ok()))
    }

    /// Clamp to [1, 50], flooring non-integer input, then persist.
    pub async fn update_user_max_tool_iterations(
        &self,
        user_id: &str,
        requested: f64,
    ) -> Result<u32, GatewayError> {
        let clamped = (requested.floor() as i64)
            .clamp(MIN_TOOL_ITERATIONS as i64, MAX_TOOL_ITERATIONS as i64) as u32;
        sqlx::query(
            "INSERT INTO user_settings (user_id, key, value) \
             VALUES ($1, 'max_tool_iterations', $2) \
             ON CONFLICT (user_id, key) DO UPDATE SET value = $2",
        )
        .bind(user_id)
        .bind(clamped.to_string())
        .execute(&self.pool)
        .await?;
        Ok(clamped)
    }

    /// Case-sensitive availability check; soft-deleted users release their
    /// email.
    pub async fn email_available(&self, email: &str) -> Result<bool, GatewayError> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM users WHERE email = $1 AND deleted_at IS NULL",
        )
        .bind(email)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0 == 0)
    }

    pub async fn get_provider_row(
        &self,
        id: &str,
    ) -> Result<Option<(String, String, Option<String>, Option<String>)>, GatewayError> {
        Ok(sqlx::query_as(
            "SELECT id, kind, base_url, model_default FROM providers \
             WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?)
    }

    pub async fn upsert_provider_row(
        &self,
        id: &str,
        kind: &str,
        base_url: Option<&str>,
        model_default: Option<&str>,
    ) -> Result<(), GatewayError> {
        sqlx::query(
            "INSERT INTO providers (id, kind, base_url, model_default, created_at) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (id) DO UPDATE SET kind = $2, base_url = $3, model_default = $4",
        )
        .bind(id)
        .bind(kind)
        .bind(base_url)
        .bind(model_default)
        .bind(now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> Store {
        let pool = crate::persist::schema::connect("file::memory:").await.unwrap();
        crate::persist::schema::ensure_schema(&pool).await.unwrap();
        Store::new(pool, 1000)
    }

    async fn conversation(store: &Store) -> ConversationRow {
        store
            .create_conversation(Some("u1"), None, Some("t"), Some("m"), Some("openai"), None)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_seq_is_contiguous_from_one() {
        let store = test_store().await;
        let conv = conversation(&store).await;

        for expected in 1..=5 {
            let row = store
                .insert_message(&conv.id, Role::User, "x", None, "final", None, None)
                .await
                .unwrap();
            assert_eq!(row.seq, expected);
        }
        assert_eq!(store.tail_seq(&conv.id).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_concurrent_inserts_never_collide_on_seq() {
        let store = test_store().await;
        let conv = conversation(&store).await;

        let mut handles = Vec::new();
        for _ in 0..10 {
            let store = store.clone();
            let id = conv.id.clone();
            handles.push(tokio::spawn(async move {
                store
                    .insert_message(&id, Role::User, "x", None, "final", None, None)
                    .await
                    .unwrap()
                    .seq
            }));
        }

        let mut seqs: Vec<i64> = Vec::new();
        for handle in handles {
            seqs.push(handle.await.unwrap());
        }
        seqs.sort_unstable();
        assert_eq!(seqs, (1..=10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_seq_not_reused_after_soft_delete() {
        let store = test_store().await;
        let conv = conversation(&store).await;

        for content in ["a", "b", "c"] {
            store
                .insert_message(&conv.id, Role::User, content, None, "final", None, None)
                .await
                .unwrap();
        }
        let tail = store.get_last_message(&conv.id).await.unwrap().unwrap();
        assert_eq!(tail.seq, 3);

        // Truncating history releases the visible tail but not the slot.
        store.soft_delete_message(&tail.id).await.unwrap();
        assert_eq!(store.visible_tail_seq(&conv.id).await.unwrap(), 2);
        assert_eq!(store.tail_seq(&conv.id).await.unwrap(), 3);

        let next = store
            .insert_message(&conv.id, Role::Assistant, "d", None, "final", None, None)
            .await
            .unwrap();
        assert_eq!(next.seq, 4);

        let visible = store.get_messages_page(&conv.id, i64::MAX, None).await.unwrap();
        let seqs: Vec<i64> = visible.iter().map(|m| m.seq).collect();
        assert_eq!(seqs, vec![1, 2, 4]);
    }

    #[tokio::test]
    async fn test_multimodal_content_round_trips() {
        let store = test_store().await;
        let conv = conversation(&store).await;

        let parts = serde_json::json!([
            { "type": "text", "text": "see this" },
            { "type": "image_url", "image_url": { "url": "http://x/y.png" } },
        ]);
        store
            .insert_message(&conv.id, Role::User, "see this", Some(&parts), "final", None, None)
            .await
            .unwrap();

        // Reconstruction restores the part array, not the flattened text.
        let wire = store.wire_messages(&conv.id).await.unwrap();
        match wire[0].content.as_ref().unwrap() {
            MessageContent::Parts(wire_parts) => {
                assert_eq!(wire_parts.len(), 2);
                assert_eq!(wire_parts[1]["image_url"]["url"], "http://x/y.png");
            }
            other => panic!("expected parts, got {other:?}"),
        }

        // The diff snapshot compares the structured form too.
        let pairs = store.diff_messages(&conv.id).await.unwrap();
        assert_eq!(pairs[0].1.content, parts);
        assert_eq!(pairs[0].0.content, "see this");
    }

    #[tokio::test]
    async fn test_message_cap_enforced() {
        let pool = crate::persist::schema::connect("file::memory:").await.unwrap();
        crate::persist::schema::ensure_schema(&pool).await.unwrap();
        let store = Store::new(pool, 2);
        let conv = conversation(&store).await;

        store
            .insert_message(&conv.id, Role::User, "1", None, "final", None, None)
            .await
            .unwrap();
        store
            .insert_message(&conv.id, Role::User, "2", None, "final", None, None)
            .await
            .unwrap();
        let err = store
            .insert_message(&conv.id, Role::User, "3", None, "final", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::LimitExceeded { limit: 2 }));
    }

    #[tokio::test]
    async fn test_draft_checkpoint_finalize_lifecycle() {
        let store = test_store().await;
        let conv = conversation(&store).await;

        let draft = store
            .insert_message(&conv.id, Role::Assistant, "", None, "draft", None, None)
            .await
            .unwrap();

        store.checkpoint_content(&draft.id, "partial").await.unwrap();
        let row = store.get_message(&draft.id).await.unwrap().unwrap();
        assert_eq!(row.content, "partial");
        assert_eq!(row.status, "draft");

        store
            .finalize_message(
                &draft.id,
                "full answer",
                Some("stop"),
                Some(10),
                Some(5),
                Some("resp_1"),
                &[NewToolCall {
                    id: "call_1".to_string(),
                    tool_name: "get_time".to_string(),
                    arguments: "{}".to_string(),
                    text_offset: None,
                }],
            )
            .await
            .unwrap();

        let row = store.get_message(&draft.id).await.unwrap().unwrap();
        assert_eq!(row.status, "final");
        assert_eq!(row.content, "full answer");
        assert_eq!(row.finish_reason.as_deref(), Some("stop"));
        assert_eq!(row.tokens_total, Some(15));
        assert_eq!(row.tool_calls.len(), 1);
        assert_eq!(row.tool_calls[0].id, "call_1");
    }

    #[tokio::test]
    async fn test_checkpoint_ignores_terminal_rows() {
        let store = test_store().await;
        let conv = conversation(&store).await;
        let msg = store
            .insert_message(&conv.id, Role::Assistant, "done", None, "final", None, None)
            .await
            .unwrap();

        store.checkpoint_content(&msg.id, "overwrite").await.unwrap();
        let row = store.get_message(&msg.id).await.unwrap().unwrap();
        assert_eq!(row.content, "done");
    }

    #[tokio::test]
    async fn test_mark_error_preserves_content() {
        let store = test_store().await;
        let conv = conversation(&store).await;
        let draft = store
            .insert_message(&conv.id, Role::Assistant, "", None, "draft", None, None)
            .await
            .unwrap();
        store.checkpoint_content(&draft.id, "partial out").await.unwrap();

        store.mark_error(&draft.id).await.unwrap();
        let row = store.get_message(&draft.id).await.unwrap().unwrap();
        assert_eq!(row.status, "error");
        assert_eq!(row.finish_reason.as_deref(), Some("error"));
        assert_eq!(row.content, "partial out");
    }

    #[tokio::test]
    async fn test_wire_messages_reconstruction() {
        let store = test_store().await;
        let conv = conversation(&store).await;

        store
            .insert_message(&conv.id, Role::User, "time?", None, "final", None, None)
            .await
            .unwrap();
        let assistant = store
            .insert_message(&conv.id, Role::Assistant, "", None, "draft", None, None)
            .await
            .unwrap();
        store
            .finalize_message(
                &assistant.id,
                "<thinking>check clock</thinking>checking",
                Some("tool_calls"),
                None,
                None,
                None,
                &[NewToolCall {
                    id: "call_time".to_string(),
                    tool_name: "get_time".to_string(),
                    arguments: "{}".to_string(),
                    text_offset: None,
                }],
            )
            .await
            .unwrap();

        let tool_msg = store
            .insert_message(
                &conv.id,
                Role::Tool,
                "12:00",
                None,
                "final",
                Some("call_time"),
                None,
            )
            .await
            .unwrap();
        store
            .attach_tool_output(
                &tool_msg.id,
                &NewToolOutput {
                    tool_call_id: "call_time".to_string(),
                    output: "12:00".to_string(),
                    status: "success".to_string(),
                },
            )
            .await
            .unwrap();

        let wire = store.wire_messages(&conv.id).await.unwrap();
        assert_eq!(wire.len(), 3);
        assert_eq!(wire[0].role, Role::User);
        assert_eq!(wire[1].role, Role::Assistant);
        // Thinking prefix preserved verbatim.
        assert!(wire[1].content_text().starts_with("<thinking>"));
        assert_eq!(wire[1].tool_calls.as_ref().unwrap()[0].id, "call_time");
        assert_eq!(wire[2].role, Role::Tool);
        assert_eq!(wire[2].tool_call_id.as_deref(), Some("call_time"));
        assert_eq!(wire[2].content_text(), "12:00");
    }

    #[tokio::test]
    async fn test_fork_for_edit() {
        let store = test_store().await;
        let conv = conversation(&store).await;

        let first = store
            .insert_message(&conv.id, Role::User, "original", None, "final", None, None)
            .await
            .unwrap();
        store
            .insert_message(&conv.id, Role::Assistant, "a1", None, "final", None, None)
            .await
            .unwrap();
        store
            .insert_message(&conv.id, Role::User, "u2", None, "final", None, None)
            .await
            .unwrap();
        store
            .insert_message(&conv.id, Role::Assistant, "a2", None, "final", None, None)
            .await
            .unwrap();

        let outcome = store
            .fork_for_edit(&conv.id, &first.id, 1, "edited", None)
            .await
            .unwrap();

        assert_ne!(outcome.fork_conversation_id, conv.id);
        assert_eq!(outcome.updated, vec![first.id.clone()]);
        assert_eq!(outcome.deleted.len(), 3);

        // Original untouched.
        let original = store.get_messages_page(&conv.id, i64::MAX, None).await.unwrap();
        assert_eq!(original.len(), 4);
        assert_eq!(original[0].content, "original");

        // Fork carries the edit, history stops at the edited message.
        let fork = store
            .get_messages_page(&outcome.fork_conversation_id, i64::MAX, None)
            .await
            .unwrap();
        assert_eq!(fork.len(), 1);
        assert_eq!(fork[0].content, "edited");
        assert_eq!(fork[0].seq, 1);
    }

    #[tokio::test]
    async fn test_fork_rejects_non_user_messages() {
        let store = test_store().await;
        let conv = conversation(&store).await;
        store
            .insert_message(&conv.id, Role::User, "u", None, "final", None, None)
            .await
            .unwrap();
        let assistant = store
            .insert_message(&conv.id, Role::Assistant, "a", None, "final", None, None)
            .await
            .unwrap();

        let err = store
            .fork_for_edit(&conv.id, &assistant.id, 2, "nope", None)
            .await
            .unwrap_err();
        match err {
            GatewayError::Validation { error_code, .. } => {
                assert_eq!(error_code, "edit_not_allowed")
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fork_seq_mismatch() {
        let store = test_store().await;
        let conv = conversation(&store).await;
        let msg = store
            .insert_message(&conv.id, Role::User, "u", None, "final", None, None)
            .await
            .unwrap();

        let err = store
            .fork_for_edit(&conv.id, &msg.id, 9, "x", None)
            .await
            .unwrap_err();
        match err {
            GatewayError::Validation { error_code, details, .. } => {
                assert_eq!(error_code, "seq_mismatch");
                let details = details.unwrap();
                assert_eq!(details["expected"], 1);
                assert_eq!(details["actual"], 9);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_max_tool_iterations_clamped_and_floored() {
        let store = test_store().await;
        assert_eq!(
            store.update_user_max_tool_iterations("u1", 7.9).await.unwrap(),
            7
        );
        assert_eq!(store.user_max_tool_iterations("u1").await.unwrap(), Some(7));
        assert_eq!(
            store.update_user_max_tool_iterations("u1", 0.0).await.unwrap(),
            1
        );
        assert_eq!(
            store.update_user_max_tool_iterations("u1", 99.0).await.unwrap(),
            50
        );
        assert_eq!(
            store.update_user_max_tool_iterations("u1", -3.5).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_email_availability_case_sensitive_and_soft_delete() {
        let store = test_store().await;
        sqlx::query("INSERT INTO users (id, email, created_at) VALUES ('u1', 'Al@x.io', 0)")
            .execute(store.pool())
            .await
            .unwrap();

        assert!(!store.email_available("Al@x.io").await.unwrap());
        // SQLite default comparison is case-sensitive.
        assert!(store.email_available("al@x.io").await.unwrap());

        sqlx::query("UPDATE users SET deleted_at = 1 WHERE id = 'u1'")
            .execute(store.pool())
            .await
            .unwrap();
        assert!(store.email_available("Al@x.io").await.unwrap());
    }

    #[tokio::test]
    async fn test_soft_deleted_conversation_invisible() {
        let store = test_store().await;
        let conv = conversation(&store).await;
        assert!(store.soft_delete_conversation(&conv.id).await.unwrap());
        assert!(store.get_conversation(&conv.id).await.unwrap().is_none());
        assert!(!store.soft_delete_conversation(&conv.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_session_resolution() {
        let store = test_store().await;
        sqlx::query("INSERT INTO sessions (session_id, user_id, created_at) VALUES ('s1', 'u9', 0)")
            .execute(store.pool())
            .await
            .unwrap();
        assert_eq!(
            store.resolve_session_user("s1").await.unwrap(),
            Some("u9".to_string())
        );
        assert_eq!(store.resolve_session_user("nope").await.unwrap(), None);
    }
}
