// Proxy entry for POST /v1/chat/completions: sanitize the body, resolve
// provider and conversation, reconcile client history, then dispatch to
// the tool orchestrator or the facade pass-through in JSON or SSE mode.
// Also hosts POST /v1/chat/abort.

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue};
use axum::response::{IntoResponse, Json, Response};
use bytes::Bytes;
use futures::StreamExt;
use serde_json::{json, Map, Value};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::abort::{AbortHandle, CancelFlag};
use crate::diff::{compute_message_diff, DiffMessage, DiffToolCall};
use crate::error::GatewayError;
use crate::orchestrator::{
    Orchestrator, OrchestratorEvent, PersistTarget, RunOptions, StreamAssembler,
};
use crate::persist::store::ConversationRow;
use crate::persist::{DraftWriter, Store};
use crate::providers::types::{sanitize_body, ChatRequest, MessageContent, Role};
use crate::providers::Provider;
use crate::ratelimit::RateDecision;
use crate::server::{intent, AppState};
use crate::sse::{chunk_envelope, sse_done, sse_frame, sse_response, tee_with_preview, SseParser, DEFAULT_PREVIEW_BYTES};

const VALID_REASONING_EFFORT: &[&str] = &["minimal", "low", "medium", "high"];
const VALID_VERBOSITY: &[&str] = &["low", "medium", "high"];

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(String::from)
}

fn rate_headers(response: &mut Response, decision: &RateDecision) {
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&decision.limit.to_string()) {
        headers.insert("X-RateLimit-Limit", value);
    }
    if let Ok(value) = HeaderValue::from_str(&decision.remaining.to_string()) {
        headers.insert("X-RateLimit-Remaining", value);
    }
}

/// POST /v1/chat/abort — body `{request_id}`. Authorization happens inside
/// the registry: unowned entries are abortable by anyone.
pub async fn abort_stream(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Json<Value>, GatewayError> {
    let request_id = body
        .get("request_id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| {
            GatewayError::validation(
                "missing_required_field",
                "request_id is required",
                None,
                Some(json!({ "field": "request_id" })),
            )
        })?;

    let user_id = state.resolve_user(&headers).await?;
    let aborted = state.aborts.abort(request_id, user_id.as_deref());
    Ok(Json(json!({ "aborted": aborted })))
}

pub async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Response, GatewayError> {
    let user_id = state.resolve_user(&headers).await?;
    let session_id = header_str(&headers, "x-session-id");

    let rate_key = user_id
        .clone()
        .or_else(|| session_id.clone())
        .unwrap_or_else(|| "anonymous".to_string());
    let decision = state.limiter.check(&rate_key);
    if !decision.allowed {
        let mut response = GatewayError::RateLimitExceeded {
            retry_after_secs: decision.retry_after_secs,
        }
        .into_response();
        rate_headers(&mut response, &decision);
        return Ok(response);
    }

    let Some(mut body_map) = body.as_object().cloned() else {
        return Err(GatewayError::InvalidRequest {
            message: "request body must be a JSON object".to_string(),
        });
    };

    // Capture routing fields before sanitization strips them.
    let client_request_id = header_str(&headers, "x-client-request-id").or_else(|| {
        body_map
            .get("client_request_id")
            .and_then(Value::as_str)
            .map(String::from)
    });
    let provider_id = header_str(&headers, "x-provider-id").or_else(|| {
        body_map
            .get("provider_id")
            .and_then(Value::as_str)
            .map(String::from)
    });
    let body_conversation_id = body_map
        .get("conversation_id")
        .and_then(Value::as_str)
        .map(String::from);
    let header_conversation_id = header_str(&headers, "x-conversation-id");
    let system_prompt_top = body_map
        .get("system_prompt")
        .and_then(Value::as_str)
        .map(String::from);
    let provider_stream = body_map
        .get("provider_stream")
        .or_else(|| body_map.get("providerStream"))
        .and_then(Value::as_bool);
    let intent_value = body_map.get("intent").cloned();
    let raw_messages: Vec<Value> = body_map
        .get("messages")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    // Intent envelope. Edits go through the dedicated endpoint.
    let append_intent = match &intent_value {
        None => None,
        Some(intent) => match intent::validate_chat_intent(intent, &raw_messages)? {
            intent::IntentAction::Append(append) => Some(append),
            intent::IntentAction::Edit(edit) => {
                return Err(GatewayError::validation(
                    "invalid_intent",
                    "edit_message is not accepted here, use the edit endpoint",
                    Some(edit.client_operation),
                    None,
                ))
            }
        },
    };

    let conversation_id = append_intent
        .as_ref()
        .and_then(|intent| intent.conversation_id.clone())
        .or(header_conversation_id)
        .or(body_conversation_id);

    sanitize_body(&mut body_map);
    let mut request: ChatRequest = serde_json::from_value(Value::Object(body_map.clone()))
        .map_err(|err| GatewayError::InvalidRequest {
            message: format!("malformed chat request: {}", err),
        })?;

    // System-prompt injection: a top-level prompt replaces any leading
    // system message.
    if let Some(prompt) = &system_prompt_top {
        if request
            .messages
            .first()
            .map(|m| m.role == Role::System)
            .unwrap_or(false)
        {
            request.messages.remove(0);
        }
        request
            .messages
            .insert(0, crate::providers::types::ChatMessage::text(Role::System, prompt));
    }

    let provider = state.provider_for(provider_id.as_deref()).await?;
    let model = request
        .model
        .clone()
        .unwrap_or_else(|| provider.default_model.clone());
    request.model = Some(model.clone());

    validate_reasoning_controls(&request)?;
    if !provider.supports_reasoning_controls(&model) {
        request.reasoning_effort = None;
        request.verbosity = None;
    }

    // Conversation resolution; persistence is skipped entirely when
    // transcripts are off.
    let conversation = if state.config.persist_transcripts {
        Some(
            resolve_conversation(
                &state,
                conversation_id.as_deref(),
                user_id.as_deref(),
                session_id.as_deref(),
                &provider,
                &model,
                &request,
            )
            .await?,
        )
    } else {
        None
    };

    // Optimistic lock for append intents targeting an existing conversation.
    // The anchor is the client-visible tail, not the allocation watermark.
    if let (Some(intent), Some(conversation)) = (&append_intent, &conversation) {
        if let Some(after_seq) = intent.after_seq {
            let tail = state.store.visible_tail_seq(&conversation.id).await?;
            if after_seq != tail {
                return Err(GatewayError::validation(
                    "seq_mismatch",
                    "after_seq does not match the conversation tail",
                    Some(intent.client_operation.clone()),
                    Some(json!({
                        "field": "after_seq",
                        "expected": tail,
                        "actual": after_seq,
                    })),
                ));
            }
        }
    }

    if let Some(conversation) = &conversation {
        reconcile_history(&state.store, &conversation.id, &request).await?;
    }

    let stream_to_client = request.stream.unwrap_or(true);
    let upstream_stream = provider_stream.unwrap_or(stream_to_client);

    // Abort wiring under the client request id.
    let cancel = CancelFlag::new();
    let abort = AbortHandle::new();
    let request_id = client_request_id
        .clone()
        .unwrap_or_else(|| format!("chatcmpl-{}", Uuid::new_v4()));
    if let Some(rid) = &client_request_id {
        state
            .aborts
            .register(rid, cancel.clone(), abort.clone(), user_id.clone());
    }

    let persist = conversation.as_ref().map(|conversation| PersistTarget {
        store: state.store.clone(),
        conversation_id: conversation.id.clone(),
        checkpoint: state.config.checkpoint.clone(),
    });

    let tools_enabled = request
        .tools
        .as_ref()
        .map(|tools| !tools.is_empty())
        .unwrap_or(false);

    let mut response = if tools_enabled {
        run_orchestrated(
            &state,
            provider,
            request,
            conversation.as_ref(),
            persist,
            request_id,
            client_request_id.clone(),
            user_id.clone(),
            stream_to_client,
            upstream_stream,
            cancel,
            abort,
        )
        .await?
    } else {
        run_passthrough(
            &state,
            provider,
            request,
            persist,
            request_id,
            client_request_id.clone(),
            stream_to_client,
            upstream_stream,
            cancel,
            abort,
        )
        .await?
    };

    rate_headers(&mut response, &decision);
    Ok(response)
}

fn validate_reasoning_controls(request: &ChatRequest) -> Result<(), GatewayError> {
    if let Some(effort) = &request.reasoning_effort {
        if !VALID_REASONING_EFFORT.contains(&effort.as_str()) {
            return Err(GatewayError::InvalidRequest {
                message: format!("invalid reasoning_effort {:?}", effort),
            });
        }
    }
    if let Some(verbosity) = &request.verbosity {
        if !VALID_VERBOSITY.contains(&verbosity.as_str()) {
            return Err(GatewayError::InvalidRequest {
                message: format!("invalid verbosity {:?}", verbosity),
            });
        }
    }
    Ok(())
}

async fn resolve_conversation(
    state: &AppState,
    conversation_id: Option<&str>,
    user_id: Option<&str>,
    session_id: Option<&str>,
    provider: &Provider,
    model: &str,
    request: &ChatRequest,
) -> Result<ConversationRow, GatewayError> {
    match conversation_id {
        Some(id) => state.store.get_conversation(id).await?.ok_or_else(|| {
            GatewayError::validation(
                "conversation_not_found",
                format!("conversation {} not found", id),
                None,
                None,
            )
        }),
        None => {
            let title = request
                .messages
                .iter()
                .find(|m| m.role == Role::User)
                .map(|m| {
                    let text = m.content_text();
                    text.chars().take(80).collect::<String>()
                });
            state
                .store
                .create_conversation(
                    user_id,
                    session_id,
                    title.as_deref(),
                    Some(model),
                    Some(&provider.id),
                    None,
                )
                .await
        }
    }
}

/// Reconcile the client-supplied message list against stored history via
/// the diff engine. On a fallback, stored history is wholesale replaced.
async fn reconcile_history(
    store: &Store,
    conversation_id: &str,
    request: &ChatRequest,
) -> Result<(), GatewayError> {
    // System messages are injected per request and never persisted.
    let incoming_messages: Vec<&crate::providers::types::ChatMessage> = request
        .messages
        .iter()
        .filter(|m| m.role != Role::System)
        .collect();

    let incoming: Vec<DiffMessage> = incoming_messages
        .iter()
        .map(|m| DiffMessage {
            role: m.role.as_str().to_string(),
            content: match &m.content {
                Some(MessageContent::Parts(parts)) => Value::Array(parts.clone()),
                _ => Value::String(m.content_text()),
            },
            tool_calls: m
                .tool_calls
                .as_ref()
                .map(|calls| {
                    calls
                        .iter()
                        .map(|call| DiffToolCall {
                            id: call.id.clone(),
                            name: call.function.name.clone(),
                            arguments: call.function.arguments.clone(),
                        })
                        .collect()
                })
                .unwrap_or_default(),
            tool_outputs: Vec::new(),
        })
        .collect();

    let stored_pairs = store.diff_messages(conversation_id).await?;
    let stored: Vec<DiffMessage> = stored_pairs.iter().map(|(_, diff)| diff.clone()).collect();
    let rows: Vec<&crate::persist::MessageRow> = stored_pairs.iter().map(|(row, _)| row).collect();

    let diff = compute_message_diff(&stored, &incoming);

    if !diff.valid {
        log::warn!(
            "message diff fallback for {}: {}",
            conversation_id,
            diff.reason.as_deref().unwrap_or("unknown")
        );
        for row in &rows {
            store.soft_delete_message(&row.id).await?;
        }
        for message in &incoming_messages {
            persist_incoming(store, conversation_id, message).await?;
        }
        return Ok(());
    }

    for update in &diff.updates {
        let row = rows[update.stored_index];
        let message = incoming_messages[update.incoming_index];
        if update.content_changed {
            store
                .update_message_content(&row.id, &message.content_text())
                .await?;
        }
        if let Some(calls) = &message.tool_calls {
            for &call_index in &update.tool_calls_to_update {
                if let Some(call) = calls.get(call_index) {
                    store
                        .update_tool_call_arguments(&row.id, &call.id, &call.function.arguments)
                        .await?;
                }
            }
        }
    }

    for &index in &diff.deletes {
        store.soft_delete_message(&rows[index].id).await?;
    }

    for &index in &diff.inserts {
        persist_incoming(store, conversation_id, incoming_messages[index]).await?;
    }

    Ok(())
}

async fn persist_incoming(
    store: &Store,
    conversation_id: &str,
    message: &crate::providers::types::ChatMessage,
) -> Result<(), GatewayError> {
    let content_json = match &message.content {
        Some(MessageContent::Parts(parts)) => Some(Value::Array(parts.clone())),
        _ => None,
    };
    store
        .insert_message(
            conversation_id,
            message.role,
            &message.content_text(),
            content_json.as_ref(),
            "final",
            message.tool_call_id.as_deref(),
            None,
        )
        .await?;
    Ok(())
}

// ---- orchestrated path ----

#[allow(clippy::too_many_arguments)]
async fn run_orchestrated(
    state: &AppState,
    provider: Arc<Provider>,
    request: ChatRequest,
    conversation: Option<&ConversationRow>,
    persist: Option<PersistTarget>,
    request_id: String,
    client_request_id: Option<String>,
    user_id: Option<String>,
    stream_to_client: bool,
    upstream_stream: bool,
    cancel: CancelFlag,
    abort: AbortHandle,
) -> Result<Response, GatewayError> {
    use crate::orchestrator::prompt::{build_structured_prompt, extract_system_prompt};

    let metadata = conversation.and_then(|c| c.metadata.clone());
    let (prompt, rest) = extract_system_prompt(
        &request.messages,
        &Value::Object(Map::new()),
        metadata.as_ref(),
    );
    let structured = build_structured_prompt(prompt.as_deref());

    let mut messages = Vec::with_capacity(rest.len() + 1);
    messages.push(crate::providers::types::ChatMessage::text(
        Role::System,
        structured,
    ));
    messages.extend(rest);

    let tools = provider.toolset_spec(request.tools.as_deref().unwrap_or_default());

    let max_iterations = match &user_id {
        Some(user) => state
            .store
            .user_max_tool_iterations(user)
            .await?
            .unwrap_or(state.config.max_tool_iterations),
        None => state.config.max_tool_iterations,
    };

    let mut base = request.clone();
    base.messages = messages;
    base.tools = None;

    let options = RunOptions {
        request_id: request_id.clone(),
        base,
        registry: state.registry.clone(),
        tools,
        concurrency: state.config.tool_concurrency,
        max_iterations,
        stream_upstream: upstream_stream,
        cancel,
        abort,
        persist,
        on_tool_complete: None,
    };

    let orchestrator = Orchestrator::new(provider);
    let model = request.model.clone().unwrap_or_default();

    if !stream_to_client {
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let summary = orchestrator.run(options, events_tx).await;
        if let Some(rid) = &client_request_id {
            state.aborts.unregister(rid);
        }
        let summary = summary?;

        return Ok(Json(json!({
            "id": request_id,
            "object": "chat.completion",
            "created": chrono::Utc::now().timestamp(),
            "model": model,
            "choices": [{
                "index": 0,
                "message": { "role": "assistant", "content": summary.content },
                "finish_reason": summary.finish_reason,
            }],
            "usage": {
                "prompt_tokens": summary.prompt_tokens,
                "completion_tokens": summary.completion_tokens,
                "total_tokens": summary.prompt_tokens + summary.completion_tokens,
            },
        }))
        .into_response());
    }

    // SSE mode: orchestrate on a task, frame events as chunks.
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let (frames_tx, frames_rx) = mpsc::channel::<Bytes>(64);

    let aborts = state.aborts.clone();
    tokio::spawn(async move {
        let result = orchestrator.run(options, events_tx).await;
        if let Some(rid) = &client_request_id {
            aborts.unregister(rid);
        }
        if let Err(err) = result {
            log::error!("orchestrator failed: {}", err);
        }
    });

    let frame_request_id = request_id.clone();
    let frame_model = model.clone();
    tokio::spawn(async move {
        let mut sent_done = false;
        while let Some(event) = events_rx.recv().await {
            let frames = frame_event(&frame_request_id, &frame_model, event, &mut sent_done);
            for frame in frames {
                if frames_tx.send(frame).await.is_err() {
                    return;
                }
            }
        }
        // Channel closed without Done: the run errored out; close cleanly
        // with an error frame.
        if !sent_done {
            let error = json!({
                "error": "tool_orchestration_error",
                "message": "stream terminated unexpectedly",
            });
            let _ = frames_tx.send(Bytes::from(sse_frame(&error))).await;
            let _ = frames_tx.send(Bytes::from(sse_done())).await;
        }
    });

    let body_stream = tokio_stream::wrappers::ReceiverStream::new(frames_rx)
        .map(Ok::<Bytes, Infallible>);
    Ok(sse_response(Body::from_stream(body_stream)))
}

/// Map one orchestrator event onto SSE frames.
fn frame_event(
    request_id: &str,
    model: &str,
    event: OrchestratorEvent,
    sent_done: &mut bool,
) -> Vec<Bytes> {
    let chunk = |delta: Value, finish: Option<&str>| {
        Bytes::from(sse_frame(&chunk_envelope(request_id, model, delta, finish)))
    };

    match event {
        OrchestratorEvent::Role => vec![chunk(json!({ "role": "assistant" }), None)],
        OrchestratorEvent::Content(text) => vec![chunk(json!({ "content": text }), None)],
        OrchestratorEvent::ToolCallDelta(delta) => {
            vec![chunk(json!({ "tool_calls": delta }), None)]
        }
        OrchestratorEvent::ToolCall(call) => vec![chunk(json!({ "tool_call": call }), None)],
        OrchestratorEvent::ToolOutput(output) => {
            vec![chunk(json!({ "tool_output": output }), None)]
        }
        OrchestratorEvent::Finish {
            finish_reason,
            usage,
        } => {
            let mut envelope = chunk_envelope(request_id, model, json!({}), Some(&finish_reason));
            envelope["usage"] = usage;
            vec![Bytes::from(sse_frame(&envelope))]
        }
        OrchestratorEvent::Done => {
            *sent_done = true;
            vec![Bytes::from(sse_done())]
        }
    }
}

// ---- pass-through path (no tools) ----

#[allow(clippy::too_many_arguments)]
async fn run_passthrough(
    state: &AppState,
    provider: Arc<Provider>,
    request: ChatRequest,
    persist: Option<PersistTarget>,
    request_id: String,
    client_request_id: Option<String>,
    stream_to_client: bool,
    upstream_stream: bool,
    cancel: CancelFlag,
    abort: AbortHandle,
) -> Result<Response, GatewayError> {
    let model = request.model.clone().unwrap_or_default();

    if !stream_to_client || !upstream_stream {
        // Unary upstream call, shared by the JSON path and the
        // synthesized-SSE path. The draft row exists before the call so a
        // failure leaves an error marker behind.
        let mut unary = request.clone();
        unary.stream = Some(false);

        let mut draft = match &persist {
            Some(target) => Some(
                DraftWriter::begin(
                    target.store.clone(),
                    &target.conversation_id,
                    target.checkpoint.clone(),
                )
                .await,
            ),
            None => None,
        };

        let result = tokio::select! {
            result = provider.send_request(&unary) => result,
            _ = abort.aborted() => Err(GatewayError::Upstream("aborted by client".to_string())),
        };

        let response = match result {
            Ok(response) => response,
            Err(err) => {
                if let Some(draft) = draft.as_mut() {
                    draft.mark_error().await;
                }
                if let Some(rid) = &client_request_id {
                    state.aborts.unregister(rid);
                }
                return Err(err);
            }
        };

        let content = response
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let finish_reason = response
            .pointer("/choices/0/finish_reason")
            .and_then(Value::as_str)
            .unwrap_or("stop")
            .to_string();
        let prompt_tokens = response
            .pointer("/usage/prompt_tokens")
            .and_then(Value::as_i64);
        let completion_tokens = response
            .pointer("/usage/completion_tokens")
            .and_then(Value::as_i64);

        if let Some(draft) = draft.as_mut() {
            draft.append(&content).await;
            draft
                .finalize(
                    Some(&finish_reason),
                    prompt_tokens,
                    completion_tokens,
                    response.get("id").and_then(Value::as_str),
                    &[],
                )
                .await?;
        }

        if let Some(rid) = &client_request_id {
            state.aborts.unregister(rid);
        }

        if !stream_to_client {
            return Ok(Json(response).into_response());
        }

        // Client wants SSE from a non-streaming upstream: synthesize.
        let frames = vec![
            sse_frame(&chunk_envelope(&request_id, &model, json!({ "role": "assistant" }), None)),
            sse_frame(&chunk_envelope(&request_id, &model, json!({ "content": content }), None)),
            {
                let mut finish = chunk_envelope(&request_id, &model, json!({}), Some(&finish_reason));
                if let Some(usage) = response.get("usage") {
                    finish["usage"] = usage.clone();
                }
                sse_frame(&finish)
            },
            sse_done(),
        ];
        let body_stream = futures::stream::iter(
            frames
                .into_iter()
                .map(|frame| Ok::<Bytes, Infallible>(Bytes::from(frame))),
        );
        return Ok(sse_response(Body::from_stream(body_stream)));
    }

    // Streaming upstream → streaming client. Draft first, so an abort or
    // connect failure before the first byte still leaves an error row.
    let mut streaming = request.clone();
    streaming.stream = Some(true);

    let mut draft = match &persist {
        Some(target) => Some(
            DraftWriter::begin(
                target.store.clone(),
                &target.conversation_id,
                target.checkpoint.clone(),
            )
            .await,
        ),
        None => None,
    };

    let upstream = tokio::select! {
        result = provider.stream_request(&streaming) => result,
        _ = abort.aborted() => Err(GatewayError::Upstream("aborted by client".to_string())),
    };
    let upstream = match upstream {
        Ok(upstream) => upstream,
        Err(err) => {
            if let Some(draft) = draft.as_mut() {
                draft.mark_error().await;
            }
            if let Some(rid) = &client_request_id {
                state.aborts.unregister(rid);
            }
            return Err(err);
        }
    };

    let (tee_stream, preview) = tee_with_preview(upstream.bytes_stream(), DEFAULT_PREVIEW_BYTES);
    tokio::spawn(async move {
        if let Ok(Some(head)) = preview.await {
            log::debug!("upstream stream preview: {}", head);
        }
    });

    let needs_translation = provider.needs_streaming_translation();
    let mut translator =
        needs_translation.then(|| provider.stream_translator(&request_id, &model));
    let aborts = state.aborts.clone();

    let out = async_stream::stream! {
        let mut parser = SseParser::new();
        let mut assembler = StreamAssembler::default();
        let mut saw_done = false;
        let mut failed = false;
        futures::pin_mut!(tee_stream);

        enum Step {
            Item(Option<Result<Bytes, reqwest::Error>>),
            Aborted,
        }

        'stream: loop {
            let step = tokio::select! {
                item = tee_stream.next() => Step::Item(item),
                _ = abort.aborted() => Step::Aborted,
            };

            let item = match step {
                Step::Item(item) => item,
                Step::Aborted => {
                    if let Some(draft) = draft.as_mut() {
                        draft.mark_error().await;
                    }
                    yield Ok::<Bytes, Infallible>(Bytes::from(sse_done()));
                    saw_done = true;
                    failed = true;
                    break 'stream;
                }
            };

            let (bytes, open) = match item {
                Some(Ok(bytes)) => (bytes, true),
                Some(Err(err)) => {
                    log::warn!("upstream stream error: {}", err);
                    if let Some(draft) = draft.as_mut() {
                        draft.mark_error().await;
                    }
                    let error = json!({ "error": "provider_error", "message": err.to_string() });
                    yield Ok(Bytes::from(sse_frame(&error)));
                    yield Ok(Bytes::from(sse_done()));
                    saw_done = true;
                    failed = true;
                    break 'stream;
                }
                None => (Bytes::new(), false),
            };

            let mut parsed = Vec::new();
            let mut upstream_done = false;
            if open {
                parser.push(&bytes, |v| parsed.push(v), || upstream_done = true, |line| {
                    log::debug!("upstream sse: {}", line)
                });
            } else {
                parser.finish(|v| parsed.push(v), || upstream_done = true, |line| {
                    log::debug!("upstream sse: {}", line)
                });
            }

            match translator.as_mut() {
                None => {
                    // Raw pass-through: forward the bytes untouched, absorb
                    // a copy for persistence.
                    for event in &parsed {
                        let (text, _) = assembler.absorb(event);
                        if let (Some(text), Some(draft)) = (text, draft.as_mut()) {
                            draft.append(&text).await;
                        }
                    }
                    if open && !bytes.is_empty() {
                        yield Ok(bytes.clone());
                    }
                    if upstream_done {
                        saw_done = true;
                        break 'stream;
                    }
                }
                Some(translator) => {
                    let mut frames = Vec::new();
                    for event in &parsed {
                        frames.extend(translator.on_event(event));
                    }
                    if upstream_done || !open {
                        frames.extend(translator.on_done());
                    }
                    for frame in frames {
                        match frame {
                            crate::providers::adapter::StreamFrame::Chunk(chunk) => {
                                let (text, _) = assembler.absorb(&chunk);
                                if let (Some(text), Some(draft)) = (text, draft.as_mut()) {
                                    draft.append(&text).await;
                                }
                                yield Ok(Bytes::from(sse_frame(&chunk)));
                            }
                            crate::providers::adapter::StreamFrame::Done => {
                                yield Ok(Bytes::from(sse_done()));
                                saw_done = true;
                                break 'stream;
                            }
                        }
                    }
                }
            }

            if !open {
                break 'stream;
            }
        }

        if !failed {
            if let Some(draft) = draft.as_mut() {
                let finish = assembler.finish_reason.clone();
                let _ = draft
                    .finalize(
                        finish.as_deref().or(Some("stop")),
                        Some(assembler.prompt_tokens),
                        Some(assembler.completion_tokens),
                        None,
                        &[],
                    )
                    .await;
            }
            if !saw_done {
                yield Ok(Bytes::from(sse_done()));
            }
        }

        if let Some(rid) = &client_request_id {
            aborts.unregister(rid);
        }
        let _ = cancel; // lifetime: keep the flag alive for the stream
    };

    Ok(sse_response(Body::from_stream(out)))
}
