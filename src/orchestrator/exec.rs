// Parallel tool-call execution with a concurrency cap. Completion
// callbacks fire as calls finish; results come back in the original input
// order.

use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;

use crate::providers::types::ToolCallPayload;
use crate::tools::ToolRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolStatus {
    Success,
    Error,
}

impl ToolStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolStatus::Success => "success",
            ToolStatus::Error => "error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub name: String,
    /// Structured output; stringified at the persistence boundary.
    pub output: Value,
    pub status: ToolStatus,
    pub duration_ms: u64,
    pub index: usize,
}

impl ToolResult {
    /// The persistence-boundary form of the output.
    pub fn output_text(&self) -> String {
        match &self.output {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        }
    }
}

pub type ToolCompleteCallback = Arc<dyn Fn(&ToolResult) + Send + Sync>;

/// Execute `calls` with at most `concurrency` running at once.
///
/// `on_complete` fires per call in completion order; the returned vector is
/// in the original input order, one result per call. Argument parse
/// failures, unknown tools, and handler failures become error results; the
/// batch always completes.
pub async fn execute_tool_calls(
    calls: &[ToolCallPayload],
    registry: &ToolRegistry,
    concurrency: usize,
    on_complete: Option<ToolCompleteCallback>,
) -> Vec<ToolResult> {
    if calls.is_empty() {
        return Vec::new();
    }

    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut handles = Vec::with_capacity(calls.len());

    for (index, call) in calls.iter().enumerate() {
        let semaphore = semaphore.clone();
        let registry = registry.clone();
        let on_complete = on_complete.clone();
        let call = call.clone();

        handles.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            let result = run_one(&registry, &call, index).await;
            if let Some(callback) = on_complete {
                // Callback failures never poison the batch.
                let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    callback(&result)
                }));
            }
            result
        }));
    }

    let mut results = Vec::with_capacity(calls.len());
    for (index, handle) in handles.into_iter().enumerate() {
        match handle.await {
            Ok(result) => results.push(result),
            Err(join_err) => {
                let call = &calls[index];
                results.push(ToolResult {
                    tool_call_id: call.id.clone(),
                    name: call.function.name.clone(),
                    output: Value::String(format!(
                        "Tool {} failed: {}",
                        call.function.name, join_err
                    )),
                    status: ToolStatus::Error,
                    duration_ms: 0,
                    index,
                });
            }
        }
    }
    results
}

fn failure_result(call: &ToolCallPayload, index: usize, started: Instant, output: String) -> ToolResult {
    ToolResult {
        tool_call_id: call.id.clone(),
        name: call.function.name.clone(),
        output: Value::String(output),
        status: ToolStatus::Error,
        duration_ms: started.elapsed().as_millis() as u64,
        index,
    }
}

async fn run_one(registry: &ToolRegistry, call: &ToolCallPayload, index: usize) -> ToolResult {
    let started = Instant::now();
    let name = &call.function.name;

    // Empty argument strings mean "no arguments".
    let raw = call.function.arguments.trim();
    let arguments: Value = if raw.is_empty() {
        Value::Object(Default::default())
    } else {
        match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(err) => {
                return failure_result(
                    call,
                    index,
                    started,
                    format!("Error: Invalid JSON arguments: {}", err),
                )
            }
        }
    };

    let Some(handler) = registry.get(name) else {
        return failure_result(call, index, started, format!("Error: Unknown tool: {}", name));
    };

    match handler.execute(arguments).await {
        Ok(output) => ToolResult {
            tool_call_id: call.id.clone(),
            name: name.clone(),
            output,
            status: ToolStatus::Success,
            duration_ms: started.elapsed().as_millis() as u64,
            index,
        },
        Err(message) => failure_result(
            call,
            index,
            started,
            format!("Tool {} failed: {}", name, message),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::test_tools::{Failing, GetTime};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn registry() -> ToolRegistry {
        ToolRegistry::new().register(GetTime).register(Failing)
    }

    fn call(id: &str, name: &str, arguments: &str) -> ToolCallPayload {
        ToolCallPayload::new(id, name, arguments)
    }

    #[tokio::test]
    async fn test_empty_batch_returns_immediately() {
        let results = execute_tool_calls(&[], &registry(), 4, None).await;
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_results_keep_input_order() {
        struct Sleepy;

        #[async_trait]
        impl crate::tools::ToolHandler for Sleepy {
            fn name(&self) -> &str {
                "sleepy"
            }
            async fn execute(&self, arguments: Value) -> Result<Value, String> {
                let ms = arguments["ms"].as_u64().unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(json!(ms))
            }
        }

        let registry = ToolRegistry::new().register(Sleepy);
        let calls = vec![
            call("c1", "sleepy", "{\"ms\": 40}"),
            call("c2", "sleepy", "{\"ms\": 1}"),
            call("c3", "sleepy", "{\"ms\": 20}"),
        ];

        let results = execute_tool_calls(&calls, &registry, 3, None).await;
        assert_eq!(results.len(), 3);
        for (i, result) in results.iter().enumerate() {
            assert_eq!(result.tool_call_id, calls[i].id);
            assert_eq!(result.index, i);
        }
    }

    #[tokio::test]
    async fn test_concurrency_cap_respected() {
        struct Tracking(Arc<AtomicUsize>, Arc<AtomicUsize>);

        #[async_trait]
        impl crate::tools::ToolHandler for Tracking {
            fn name(&self) -> &str {
                "tracking"
            }
            async fn execute(&self, _arguments: Value) -> Result<Value, String> {
                let current = self.0.fetch_add(1, Ordering::SeqCst) + 1;
                self.1.fetch_max(current, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                self.0.fetch_sub(1, Ordering::SeqCst);
                Ok(json!("done"))
            }
        }

        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let registry = ToolRegistry::new().register(Tracking(active.clone(), peak.clone()));

        let calls: Vec<_> = (0..6)
            .map(|i| call(&format!("c{}", i), "tracking", "{}"))
            .collect();
        let results = execute_tool_calls(&calls, &registry, 2, None).await;

        assert_eq!(results.len(), 6);
        assert!(peak.load(Ordering::SeqCst) <= 2, "cap exceeded");
    }

    #[tokio::test]
    async fn test_invalid_arguments_become_error_output() {
        let results = execute_tool_calls(
            &[call("c1", "get_time", "{not json")],
            &registry(),
            1,
            None,
        )
        .await;
        assert_eq!(results[0].status, ToolStatus::Error);
        assert!(results[0]
            .output_text()
            .starts_with("Error: Invalid JSON arguments:"));
    }

    #[tokio::test]
    async fn test_empty_arguments_treated_as_empty_object() {
        let results =
            execute_tool_calls(&[call("c1", "get_time", "")], &registry(), 1, None).await;
        assert_eq!(results[0].status, ToolStatus::Success);
        assert_eq!(results[0].output, json!("12:00"));
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let results = execute_tool_calls(&[call("c1", "ghost", "{}")], &registry(), 1, None).await;
        assert_eq!(results[0].status, ToolStatus::Error);
        assert_eq!(results[0].output_text(), "Error: Unknown tool: ghost");
    }

    #[tokio::test]
    async fn test_handler_failure_is_local() {
        let results = execute_tool_calls(
            &[call("c1", "failing", "{}"), call("c2", "get_time", "{}")],
            &registry(),
            2,
            None,
        )
        .await;
        assert_eq!(results[0].status, ToolStatus::Error);
        assert_eq!(results[0].output_text(), "Tool failing failed: no luck");
        assert_eq!(results[1].status, ToolStatus::Success);
    }

    #[tokio::test]
    async fn test_completion_callback_fires_per_call() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let callback: ToolCompleteCallback = Arc::new(move |_result| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let calls = vec![call("c1", "get_time", "{}"), call("c2", "failing", "{}")];
        execute_tool_calls(&calls, &registry(), 2, Some(callback)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_callback_panic_swallowed() {
        let callback: ToolCompleteCallback = Arc::new(|_result| panic!("callback bug"));
        let results =
            execute_tool_calls(&[call("c1", "get_time", "{}")], &registry(), 1, Some(callback))
                .await;
        assert_eq!(results[0].status, ToolStatus::Success);
    }

    #[tokio::test]
    async fn test_output_text_stringifies_structured_output() {
        let result = ToolResult {
            tool_call_id: "c".to_string(),
            name: "n".to_string(),
            output: json!({ "a": 1 }),
            status: ToolStatus::Success,
            duration_ms: 0,
            index: 0,
        };
        assert_eq!(result.output_text(), "{\"a\":1}");

        let result = ToolResult {
            output: json!("plain"),
            ..result
        };
        assert_eq!(result.output_text(), "plain");
    }
}
