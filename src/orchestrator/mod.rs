// Tool orchestration: the bounded model→tools→model loop. Each iteration
// invokes the provider, streams text deltas out (checkpointing drafts as
// they grow), executes any requested tool calls in parallel, feeds the
// results back, and re-invokes until a non-tool completion or the
// iteration cap.

pub mod exec;
pub mod prompt;

use futures::StreamExt;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::abort::{AbortHandle, CancelFlag};
use crate::config::CheckpointConfig;
use crate::error::GatewayError;
use crate::persist::store::{NewToolCall, NewToolOutput, Store};
use crate::persist::DraftWriter;
use crate::providers::adapter::StreamFrame;
use crate::providers::types::{ChatMessage, ChatRequest, MessageContent, Role, ToolCallPayload};
use crate::providers::Provider;
use crate::sse::SseParser;
use crate::tools::ToolRegistry;

pub use exec::{execute_tool_calls, ToolCompleteCallback, ToolResult, ToolStatus};

pub const DEFAULT_MAX_ITERATIONS: u32 = 10;
pub const MAX_ITERATIONS_MARKER: &str = "\n\n[Maximum iterations reached]";

/// Unified event stream toward the client.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    /// First assistant delta of the run.
    Role,
    Content(String),
    /// Raw streaming `tool_calls` delta fragment.
    ToolCallDelta(Value),
    /// A completed tool call, in original call order.
    ToolCall(Value),
    /// The matching tool output, immediately after its call.
    ToolOutput(Value),
    Finish {
        finish_reason: String,
        usage: Value,
    },
    Done,
}

/// Where to persist the run, when transcript persistence is on.
#[derive(Clone)]
pub struct PersistTarget {
    pub store: Store,
    pub conversation_id: String,
    pub checkpoint: CheckpointConfig,
}

pub struct RunOptions {
    pub request_id: String,
    /// Base request; `messages` already carries the structured system
    /// prompt and the conversation history.
    pub base: ChatRequest,
    pub registry: Arc<ToolRegistry>,
    /// Uniform tool specs sent upstream.
    pub tools: Vec<Value>,
    pub concurrency: usize,
    pub max_iterations: u32,
    pub stream_upstream: bool,
    pub cancel: CancelFlag,
    pub abort: AbortHandle,
    pub persist: Option<PersistTarget>,
    pub on_tool_complete: Option<ToolCompleteCallback>,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub content: String,
    pub finish_reason: String,
    pub iterations: u32,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub aborted: bool,
}

struct IterationOutcome {
    content: String,
    tool_calls: Vec<ToolCallPayload>,
    finish_reason: Option<String>,
    prompt_tokens: i64,
    completion_tokens: i64,
    aborted: bool,
}

/// Accumulates one streamed model turn out of `chat.completion.chunk`
/// frames: text, tool-call fragments keyed by index, finish reason, usage.
#[derive(Default)]
pub(crate) struct StreamAssembler {
    pub(crate) content: String,
    pub(crate) finish_reason: Option<String>,
    pub(crate) prompt_tokens: i64,
    pub(crate) completion_tokens: i64,
    index_ids: HashMap<u64, String>,
    order: Vec<String>,
    names: HashMap<String, String>,
    arguments: HashMap<String, String>,
}

impl StreamAssembler {
    /// Absorb one chunk; returns the text delta it carried, if any.
    pub(crate) fn absorb(&mut self, chunk: &Value) -> (Option<String>, Option<Value>) {
        if let Some(usage) = chunk.get("usage") {
            if let Some(prompt) = usage.get("prompt_tokens").and_then(Value::as_i64) {
                self.prompt_tokens = prompt;
            }
            if let Some(completion) = usage.get("completion_tokens").and_then(Value::as_i64) {
                self.completion_tokens = completion;
            }
        }

        let Some(choice) = chunk.pointer("/choices/0") else {
            return (None, None);
        };

        if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
            self.finish_reason = Some(reason.to_string());
        }

        let delta = choice.get("delta").cloned().unwrap_or(Value::Null);
        let text = delta.get("content").and_then(Value::as_str).map(|t| {
            self.content.push_str(t);
            t.to_string()
        });

        let tool_delta = delta.get("tool_calls").cloned();
        if let Some(fragments) = tool_delta.as_ref().and_then(Value::as_array) {
            for fragment in fragments {
                let index = fragment.get("index").and_then(Value::as_u64).unwrap_or(0);
                if let Some(id) = fragment.get("id").and_then(Value::as_str) {
                    if !id.is_empty() {
                        self.index_ids.insert(index, id.to_string());
                        if !self.order.contains(&id.to_string()) {
                            self.order.push(id.to_string());
                        }
                    }
                }
                let Some(id) = self.index_ids.get(&index).cloned() else {
                    continue;
                };
                if let Some(name) = fragment.pointer("/function/name").and_then(Value::as_str) {
                    self.names.insert(id.clone(), name.to_string());
                }
                if let Some(args) = fragment
                    .pointer("/function/arguments")
                    .and_then(Value::as_str)
                {
                    self.arguments.entry(id).or_default().push_str(args);
                }
            }
        }

        (text, tool_delta)
    }

    pub(crate) fn into_tool_calls(self) -> Vec<ToolCallPayload> {
        self.order
            .iter()
            .map(|id| {
                ToolCallPayload::new(
                    id,
                    self.names.get(id).cloned().unwrap_or_default(),
                    self.arguments.get(id).cloned().unwrap_or_default(),
                )
            })
            .collect()
    }
}

pub struct Orchestrator {
    provider: Arc<Provider>,
}

impl Orchestrator {
    pub fn new(provider: Arc<Provider>) -> Self {
        Self { provider }
    }

    /// Run the loop to completion, emitting the unified event stream.
    pub async fn run(
        &self,
        options: RunOptions,
        events: mpsc::UnboundedSender<OrchestratorEvent>,
    ) -> Result<RunSummary, GatewayError> {
        let max_iterations = options.max_iterations.clamp(1, 50);
        let model = options
            .base
            .model
            .clone()
            .unwrap_or_else(|| self.provider.default_model.clone());

        let mut messages = options.base.messages.clone();
        let mut full_content = String::new();
        let mut prompt_tokens = 0i64;
        let mut completion_tokens = 0i64;
        let mut role_sent = false;
        let mut iteration = 0u32;

        while iteration < max_iterations {
            iteration += 1;

            if options.cancel.is_cancelled() {
                return self.abort_run(&options, None, &events, full_content, iteration).await;
            }

            let mut draft = match &options.persist {
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

            let request = ChatRequest {
                model: Some(model.clone()),
                messages: messages.clone(),
                tools: (!options.tools.is_empty()).then(|| options.tools.clone()),
                stream: Some(options.stream_upstream),
                ..options.base.clone()
            };

            let outcome = if options.stream_upstream {
                self.invoke_streaming(&options, &request, &events, &mut role_sent, &mut draft)
                    .await
            } else {
                self.invoke_unary(&options, &request, &events, &mut role_sent, &mut draft)
                    .await
            };

            let outcome = match outcome {
                Ok(outcome) => outcome,
                Err(err) => {
                    if let Some(draft) = draft.as_mut() {
                        draft.mark_error().await;
                    }
                    return Err(err);
                }
            };

            prompt_tokens += outcome.prompt_tokens;
            completion_tokens += outcome.completion_tokens;
            full_content.push_str(&outcome.content);

            if outcome.aborted {
                return self
                    .abort_run(&options, draft.as_mut(), &events, full_content, iteration)
                    .await;
            }

            if outcome.tool_calls.is_empty() {
                let finish = outcome.finish_reason.unwrap_or_else(|| "stop".to_string());
                if let Some(draft) = draft.as_mut() {
                    draft
                        .finalize(
                            Some(&finish),
                            Some(outcome.prompt_tokens),
                            Some(outcome.completion_tokens),
                            None,
                            &[],
                        )
                        .await?;
                }
                let usage = usage_value(prompt_tokens, completion_tokens);
                let _ = events.send(OrchestratorEvent::Finish {
                    finish_reason: finish.clone(),
                    usage,
                });
                let _ = events.send(OrchestratorEvent::Done);
                return Ok(RunSummary {
                    content: full_content,
                    finish_reason: finish,
                    iterations: iteration,
                    prompt_tokens,
                    completion_tokens,
                    aborted: false,
                });
            }

            // Tool calls requested: persist the assistant turn with its
            // calls, then fan out.
            let new_calls: Vec<NewToolCall> = outcome
                .tool_calls
                .iter()
                .map(|call| NewToolCall {
                    id: call.id.clone(),
                    tool_name: call.function.name.clone(),
                    arguments: call.function.arguments.clone(),
                    text_offset: None,
                })
                .collect();
            if let Some(draft) = draft.as_mut() {
                draft
                    .finalize(
                        Some("tool_calls"),
                        Some(outcome.prompt_tokens),
                        Some(outcome.completion_tokens),
                        None,
                        &new_calls,
                    )
                    .await?;
            }

            messages.push(ChatMessage {
                role: Role::Assistant,
                content: Some(MessageContent::text(outcome.content.clone())),
                tool_call_id: None,
                tool_calls: Some(outcome.tool_calls.clone()),
            });

            if options.cancel.is_cancelled() {
                return self.abort_run(&options, None, &events, full_content, iteration).await;
            }

            let results = execute_tool_calls(
                &outcome.tool_calls,
                &options.registry,
                options.concurrency,
                options.on_tool_complete.clone(),
            )
            .await;

            for (call, result) in outcome.tool_calls.iter().zip(results.iter()) {
                let _ = events.send(OrchestratorEvent::ToolCall(json!({
                    "id": call.id,
                    "name": call.function.name,
                    "arguments": call.function.arguments,
                })));
                let _ = events.send(OrchestratorEvent::ToolOutput(json!({
                    "tool_call_id": result.tool_call_id,
                    "name": result.name,
                    "output": result.output,
                    "status": result.status.as_str(),
                    "duration_ms": result.duration_ms,
                })));

                let output_text = result.output_text();
                if let Some(target) = &options.persist {
                    let row = target
                        .store
                        .insert_message(
                            &target.conversation_id,
                            Role::Tool,
                            &output_text,
                            None,
                            "final",
                            Some(&result.tool_call_id),
                            None,
                        )
                        .await?;
                    target
                        .store
                        .attach_tool_output(
                            &row.id,
                            &NewToolOutput {
                                tool_call_id: result.tool_call_id.clone(),
                                output: output_text.clone(),
                                status: result.status.as_str().to_string(),
                            },
                        )
                        .await?;
                }

                messages.push(ChatMessage::tool_result(&result.tool_call_id, output_text));
            }
        }

        // Iteration cap reached.
        let _ = events.send(OrchestratorEvent::Content(MAX_ITERATIONS_MARKER.to_string()));
        full_content.push_str(MAX_ITERATIONS_MARKER);

        if let Some(target) = &options.persist {
            let mut marker = DraftWriter::begin(
                target.store.clone(),
                &target.conversation_id,
                target.checkpoint.clone(),
            )
            .await;
            marker.append(MAX_ITERATIONS_MARKER).await;
            marker.finalize(Some("stop"), None, None, None, &[]).await?;
        }

        let _ = events.send(OrchestratorEvent::Finish {
            finish_reason: "stop".to_string(),
            usage: usage_value(prompt_tokens, completion_tokens),
        });
        let _ = events.send(OrchestratorEvent::Done);

        Ok(RunSummary {
            content: full_content,
            finish_reason: "stop".to_string(),
            iterations: iteration,
            prompt_tokens,
            completion_tokens,
            aborted: false,
        })
    }

    /// Abort path: no new requests, persistence flips to error, the client
    /// gets a clean `[DONE]`.
    async fn abort_run(
        &self,
        options: &RunOptions,
        draft: Option<&mut DraftWriter>,
        events: &mpsc::UnboundedSender<OrchestratorEvent>,
        content: String,
        iterations: u32,
    ) -> Result<RunSummary, GatewayError> {
        if let Some(draft) = draft {
            draft.mark_error().await;
        }
        let _ = events.send(OrchestratorEvent::Done);
        log::info!(
            "orchestrator aborted after {} iteration(s): {}",
            iterations,
            options.abort.reason().unwrap_or_default()
        );
        Ok(RunSummary {
            content,
            finish_reason: "error".to_string(),
            iterations,
            prompt_tokens: 0,
            completion_tokens: 0,
            aborted: true,
        })
    }

    async fn invoke_streaming(
        &self,
        options: &RunOptions,
        request: &ChatRequest,
        events: &mpsc::UnboundedSender<OrchestratorEvent>,
        role_sent: &mut bool,
        draft: &mut Option<DraftWriter>,
    ) -> Result<IterationOutcome, GatewayError> {
        let abort = options.abort.clone();

        let response = tokio::select! {
            response = self.provider.stream_request(request) => response?,
            _ = abort.aborted() => {
                return Ok(aborted_outcome());
            }
        };

        let byte_stream = response.bytes_stream();
        futures::pin_mut!(byte_stream);
        let mut parser = SseParser::new();
        let mut translator = self
            .provider
            .needs_streaming_translation()
            .then(|| {
                self.provider.stream_translator(
                    &options.request_id,
                    request.model.as_deref().unwrap_or_default(),
                )
            });

        let mut assembler = StreamAssembler::default();
        let mut upstream_open = true;

        'stream: while upstream_open {
            let chunk = tokio::select! {
                chunk = byte_stream.next() => chunk,
                _ = abort.aborted() => {
                    return Ok(aborted_outcome());
                }
            };

            let bytes = match chunk {
                Some(Ok(bytes)) => bytes,
                Some(Err(err)) => return Err(GatewayError::Upstream(err.to_string())),
                None => {
                    upstream_open = false;
                    bytes::Bytes::new()
                }
            };

            let mut parsed_events = Vec::new();
            let mut saw_done = false;
            let collect = |value: Value| parsed_events.push(value);
            let mark_done = || saw_done = true;
            if upstream_open {
                parser.push(&bytes, collect, mark_done, |line| {
                    log::debug!("upstream sse: {}", line)
                });
            } else {
                parser.finish(collect, mark_done, |line| {
                    log::debug!("upstream sse: {}", line)
                });
            }

            let mut frames = Vec::new();
            for event in &parsed_events {
                match translator.as_mut() {
                    Some(translator) => frames.extend(translator.on_event(event)),
                    None => frames.push(StreamFrame::Chunk(event.clone())),
                }
            }
            if saw_done || !upstream_open {
                match translator.as_mut() {
                    Some(translator) => frames.extend(translator.on_done()),
                    None if saw_done => frames.push(StreamFrame::Done),
                    None => {}
                }
            }

            for frame in frames {
                match frame {
                    StreamFrame::Chunk(chunk) => {
                        let (text, tool_delta) = assembler.absorb(&chunk);
                        if text.is_some() || tool_delta.is_some() {
                            if !*role_sent {
                                *role_sent = true;
                                let _ = events.send(OrchestratorEvent::Role);
                            }
                        }
                        if let Some(text) = text {
                            let _ = events.send(OrchestratorEvent::Content(text.clone()));
                            if let Some(draft) = draft.as_mut() {
                                draft.append(&text).await;
                            }
                        }
                        if let Some(tool_delta) = tool_delta {
                            let _ = events.send(OrchestratorEvent::ToolCallDelta(tool_delta));
                        }
                    }
                    StreamFrame::Done => break 'stream,
                }
            }
        }

        let finish_reason = assembler.finish_reason.clone();
        let prompt_tokens = assembler.prompt_tokens;
        let completion_tokens = assembler.completion_tokens;
        let content = assembler.content.clone();
        let tool_calls = assembler.into_tool_calls();

        Ok(IterationOutcome {
            content,
            tool_calls,
            finish_reason,
            prompt_tokens,
            completion_tokens,
            aborted: false,
        })
    }

    async fn invoke_unary(
        &self,
        options: &RunOptions,
        request: &ChatRequest,
        events: &mpsc::UnboundedSender<OrchestratorEvent>,
        role_sent: &mut bool,
        draft: &mut Option<DraftWriter>,
    ) -> Result<IterationOutcome, GatewayError> {
        let abort = options.abort.clone();
        let mut request = request.clone();
        request.stream = Some(false);

        let response = tokio::select! {
            response = self.provider.send_request(&request) => response?,
            _ = abort.aborted() => {
                return Ok(aborted_outcome());
            }
        };

        let message = response.pointer("/choices/0/message").cloned().unwrap_or(Value::Null);
        let content = message
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let finish_reason = response
            .pointer("/choices/0/finish_reason")
            .and_then(Value::as_str)
            .map(String::from);
        let prompt_tokens = response
            .pointer("/usage/prompt_tokens")
            .and_then(Value::as_i64)
            .unwrap_or(0);
        let completion_tokens = response
            .pointer("/usage/completion_tokens")
            .and_then(Value::as_i64)
            .unwrap_or(0);

        let tool_calls: Vec<ToolCallPayload> = message
            .get("tool_calls")
            .and_then(Value::as_array)
            .map(|calls| {
                calls
                    .iter()
                    .filter_map(|call| {
                        let id = call.get("id").and_then(Value::as_str)?;
                        let name = call.pointer("/function/name").and_then(Value::as_str)?;
                        let arguments = match call.pointer("/function/arguments") {
                            Some(Value::String(raw)) => raw.clone(),
                            Some(other) => other.to_string(),
                            None => String::new(),
                        };
                        Some(ToolCallPayload::new(id, name, arguments))
                    })
                    .collect()
            })
            .unwrap_or_default();

        if !content.is_empty() || !tool_calls.is_empty() {
            if !*role_sent {
                *role_sent = true;
                let _ = events.send(OrchestratorEvent::Role);
            }
        }
        if !content.is_empty() {
            let _ = events.send(OrchestratorEvent::Content(content.clone()));
            if let Some(draft) = draft.as_mut() {
                draft.append(&content).await;
            }
        }
        if !tool_calls.is_empty() {
            let _ = events.send(OrchestratorEvent::ToolCallDelta(
                message.get("tool_calls").cloned().unwrap_or(Value::Null),
            ));
        }

        Ok(IterationOutcome {
            content,
            tool_calls,
            finish_reason,
            prompt_tokens,
            completion_tokens,
            aborted: false,
        })
    }
}

fn aborted_outcome() -> IterationOutcome {
    IterationOutcome {
        content: String::new(),
        tool_calls: Vec::new(),
        finish_reason: None,
        prompt_tokens: 0,
        completion_tokens: 0,
        aborted: true,
    }
}

fn usage_value(prompt_tokens: i64, completion_tokens: i64) -> Value {
    json!({
        "prompt_tokens": prompt_tokens,
        "completion_tokens": completion_tokens,
        "total_tokens": prompt_tokens + completion_tokens,
    })
}
