// Conversation and message endpoints: listing, paging with attached tool
// artifacts, soft delete, and edit-as-fork.

use axum::extract::{Path, Query, State};
use axum::response::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::GatewayError;
use crate::server::intent;
use crate::server::AppState;

#[derive(Debug, Deserialize)]
pub struct MessagesQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
    pub before_seq: Option<i64>,
}

fn default_limit() -> i64 {
    100
}

/// GET /v1/conversations
pub async fn list_conversations(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
) -> Result<Json<Value>, GatewayError> {
    let user_id = state.resolve_user(&headers).await?;
    let conversations = state.store.list_conversations(user_id.as_deref()).await?;
    Ok(Json(json!({ "conversations": conversations })))
}

/// GET /v1/conversations/:id
pub async fn get_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, GatewayError> {
    let conversation = state.store.get_conversation(&id).await?.ok_or_else(|| {
        GatewayError::validation(
            "conversation_not_found",
            format!("conversation {} not found", id),
            None,
            None,
        )
    })?;
    Ok(Json(json!({ "conversation": conversation })))
}

/// DELETE /v1/conversations/:id (soft delete)
pub async fn delete_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, GatewayError> {
    let deleted = state.store.soft_delete_conversation(&id).await?;
    if !deleted {
        return Err(GatewayError::validation(
            "conversation_not_found",
            format!("conversation {} not found", id),
            None,
            None,
        ));
    }
    Ok(Json(json!({ "success": true })))
}

/// GET /v1/conversations/:id/messages — ascending page with `tool_calls[]`
/// and `tool_outputs[]` attached to their owning messages.
pub async fn get_messages(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<MessagesQuery>,
) -> Result<Json<Value>, GatewayError> {
    if state.store.get_conversation(&id).await?.is_none() {
        return Err(GatewayError::validation(
            "conversation_not_found",
            format!("conversation {} not found", id),
            None,
            None,
        ));
    }

    let messages = state
        .store
        .get_messages_page(&id, query.limit.clamp(1, 1000), query.before_seq)
        .await?;
    Ok(Json(json!({
        "conversation_id": id,
        "messages": messages,
    })))
}

/// PUT /v1/conversations/:id/messages/:mid/edit — always forks.
pub async fn edit_message(
    State(state): State<AppState>,
    Path((conversation_id, message_id)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, GatewayError> {
    let intent_value = body.get("intent").cloned().ok_or_else(|| {
        GatewayError::validation("invalid_intent", "intent envelope is required", None, None)
    })?;
    if intent_value.get("type").and_then(Value::as_str) != Some("edit_message") {
        return Err(GatewayError::validation(
            "invalid_intent",
            "intent type must be \"edit_message\"",
            None,
            None,
        ));
    }

    let edit = intent::validate_edit(&intent_value)?;
    if edit.message_id != message_id {
        return Err(GatewayError::validation(
            "invalid_intent",
            "intent message_id does not match the path",
            Some(edit.client_operation),
            None,
        ));
    }

    let outcome = state
        .store
        .fork_for_edit(
            &conversation_id,
            &edit.message_id,
            edit.expected_seq,
            &edit.content,
            Some(edit.client_operation.clone()),
        )
        .await?;

    Ok(Json(json!({
        "success": true,
        "client_operation": edit.client_operation,
        "fork_conversation_id": outcome.fork_conversation_id,
        "operations": {
            "updated": outcome.updated.iter().map(|id| json!({ "id": id })).collect::<Vec<_>>(),
            "deleted": outcome.deleted.iter().map(|id| json!({ "id": id })).collect::<Vec<_>>(),
        },
    })))
}
