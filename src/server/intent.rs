// Intent envelope parsing and validation. The envelope is an optional
// wrapper on chat/edit bodies; its absence preserves legacy behavior.

use serde_json::Value;

use crate::error::GatewayError;

/// A validated `append_message` intent. The `after_seq` optimistic lock is
/// checked against the store by the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct AppendIntent {
    pub client_operation: String,
    pub conversation_id: Option<String>,
    pub after_message_id: Option<String>,
    pub after_seq: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EditIntent {
    pub client_operation: String,
    pub message_id: String,
    pub expected_seq: i64,
    pub content: String,
}

fn missing(field: &str, client_operation: Option<String>) -> GatewayError {
    GatewayError::validation(
        "missing_required_field",
        format!("intent field {} is required", field),
        client_operation,
        Some(serde_json::json!({ "field": field })),
    )
}

fn operation_of(intent: &Value) -> Option<String> {
    intent
        .get("client_operation")
        .and_then(Value::as_str)
        .map(String::from)
}

/// Validate an `append_message` intent against the request body's message
/// list.
pub fn validate_append(intent: &Value, messages: &[Value]) -> Result<AppendIntent, GatewayError> {
    let client_operation = operation_of(intent).ok_or_else(|| missing("client_operation", None))?;

    let conversation_id = intent
        .get("conversation_id")
        .and_then(Value::as_str)
        .map(String::from);
    let after_message_id = intent
        .get("after_message_id")
        .and_then(Value::as_str)
        .map(String::from);
    let after_seq = intent.get("after_seq").and_then(Value::as_i64);

    if conversation_id.is_some() {
        if after_message_id.is_none() {
            return Err(missing("after_message_id", Some(client_operation)));
        }
        if after_seq.is_none() {
            return Err(missing("after_seq", Some(client_operation)));
        }
    }

    if messages.is_empty() {
        return Err(GatewayError::validation(
            "missing_required_field",
            "messages must be non-empty",
            Some(client_operation),
            Some(serde_json::json!({ "field": "messages" })),
        ));
    }
    let first_role = messages[0].get("role").and_then(Value::as_str);
    if first_role != Some("user") {
        return Err(GatewayError::validation(
            "invalid_intent",
            "first message must have role \"user\"",
            Some(client_operation),
            None,
        ));
    }

    Ok(AppendIntent {
        client_operation,
        conversation_id,
        after_message_id,
        after_seq,
    })
}

pub fn validate_edit(intent: &Value) -> Result<EditIntent, GatewayError> {
    let client_operation = operation_of(intent).ok_or_else(|| missing("client_operation", None))?;

    let message_id = intent
        .get("message_id")
        .and_then(Value::as_str)
        .map(String::from)
        .ok_or_else(|| missing("message_id", Some(client_operation.clone())))?;

    let expected_seq = intent
        .get("expected_seq")
        .and_then(Value::as_i64)
        .filter(|seq| *seq > 0)
        .ok_or_else(|| missing("expected_seq", Some(client_operation.clone())))?;

    let content = intent
        .get("content")
        .and_then(Value::as_str)
        .map(String::from)
        .ok_or_else(|| missing("content", Some(client_operation.clone())))?;

    Ok(EditIntent {
        client_operation,
        message_id,
        expected_seq,
        content,
    })
}

/// Dispatch on the envelope's `type`.
#[derive(Debug)]
pub enum IntentAction {
    Append(AppendIntent),
    Edit(EditIntent),
}

pub fn validate_chat_intent(
    intent: &Value,
    messages: &[Value],
) -> Result<IntentAction, GatewayError> {
    match intent.get("type").and_then(Value::as_str) {
        Some("append_message") => Ok(IntentAction::Append(validate_append(intent, messages)?)),
        Some("edit_message") => Ok(IntentAction::Edit(validate_edit(intent)?)),
        other => Err(GatewayError::validation(
            "invalid_intent",
            format!("unknown intent type {:?}", other.unwrap_or("")),
            operation_of(intent),
            None,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn user_messages() -> Vec<Value> {
        vec![json!({ "role": "user", "content": "hi" })]
    }

    fn expect_code(err: GatewayError, code: &str) {
        match err {
            GatewayError::Validation { error_code, .. } => assert_eq!(error_code, code),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_append_requires_client_operation() {
        let err = validate_append(&json!({ "type": "append_message" }), &user_messages())
            .unwrap_err();
        expect_code(err, "missing_required_field");
    }

    #[test]
    fn test_append_with_conversation_requires_anchor() {
        let intent = json!({
            "type": "append_message",
            "client_operation": "op-1",
            "conversation_id": "c1",
        });
        let err = validate_append(&intent, &user_messages()).unwrap_err();
        expect_code(err, "missing_required_field");

        let intent = json!({
            "type": "append_message",
            "client_operation": "op-1",
            "conversation_id": "c1",
            "after_message_id": "m1",
            "after_seq": 3,
        });
        let parsed = validate_append(&intent, &user_messages()).unwrap();
        assert_eq!(parsed.after_seq, Some(3));
        assert_eq!(parsed.client_operation, "op-1");
    }

    #[test]
    fn test_append_requires_user_first() {
        let intent = json!({ "type": "append_message", "client_operation": "op" });
        let err = validate_append(&intent, &[]).unwrap_err();
        expect_code(err, "missing_required_field");

        let err = validate_append(
            &intent,
            &[json!({ "role": "assistant", "content": "x" })],
        )
        .unwrap_err();
        expect_code(err, "invalid_intent");
    }

    #[test]
    fn test_edit_requires_all_fields() {
        let base = json!({ "type": "edit_message", "client_operation": "op" });
        expect_code(validate_edit(&base).unwrap_err(), "missing_required_field");

        let no_seq = json!({
            "type": "edit_message",
            "client_operation": "op",
            "message_id": "m1",
            "expected_seq": 0,
            "content": "x",
        });
        expect_code(validate_edit(&no_seq).unwrap_err(), "missing_required_field");

        let full = json!({
            "type": "edit_message",
            "client_operation": "op",
            "message_id": "m1",
            "expected_seq": 2,
            "content": "new text",
        });
        let parsed = validate_edit(&full).unwrap();
        assert_eq!(parsed.expected_seq, 2);
        assert_eq!(parsed.content, "new text");
    }

    #[test]
    fn test_unknown_intent_type() {
        let err = validate_chat_intent(&json!({ "type": "mystery" }), &user_messages())
            .unwrap_err();
        expect_code(err, "invalid_intent");
    }
}
