use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::{is_turn_break_tool, Tool, ToolResult};
use crate::session::PendingTool;

/// Outcome of a single tool call within a batch.
#[derive(Debug, Clone)]
pub struct ToolExecResult {
    pub tool_call_id: String,
    pub name: String,
    pub result: ToolResult,
    pub duration: Duration,
}

/// Outcome of one `execute_batch` call.
#[derive(Debug, Clone, Default)]
pub struct BatchResult {
    pub results: Vec<ToolExecResult>,
    /// `true` if any tool in the batch was a declared turn-break tool.
    pub turn_break: bool,
    /// `true` if the batch was cancelled mid-flight — completed results are
    /// still returned, but nothing from after the cancel point is included.
    pub cancelled: bool,
}

/// Optional callbacks the orchestrator wires in to thread tool progress
/// back into the primary display.
#[derive(Default)]
pub struct ExecutorCallbacks<'a> {
    /// Invoked as soon as a tool result carries file bytes, so the
    /// orchestrator can commit in-flight draft text before the file
    /// ships (keeps delivery order stable in the UI).
    pub on_file_ready: Option<Box<dyn Fn(&ToolExecResult) + Send + Sync + 'a>>,
    /// Invoked with progress chunks from tools that run a streaming
    /// sub-agent (e.g. a critique tool).
    pub on_subagent_tool: Option<Box<dyn Fn(&str, &str) + Send + Sync + 'a>>,
    /// Invoked with incremental reasoning text from tools that expose their
    /// own extended-thinking stream.
    pub on_thinking_chunk: Option<Box<dyn Fn(&str, &str) + Send + Sync + 'a>>,
}

/// Dispatches a batch of pending tool calls concurrently, normalizing
/// panics and tool-reported failures into `ToolResult`s the orchestrator
/// can always append to the conversation.
pub struct ToolExecutor<'a> {
    tools: &'a [Box<dyn Tool>],
}

impl<'a> ToolExecutor<'a> {
    pub fn new(tools: &'a [Box<dyn Tool>]) -> Self {
        Self { tools }
    }

    fn find(&self, name: &str) -> Option<&dyn Tool> {
        self.tools
            .iter()
            .find(|t| t.name() == name)
            .map(|t| t.as_ref())
    }

    /// Launch every pending tool concurrently. Tasks already in flight when
    /// `cancel` fires are allowed to finish, but their results are dropped —
    /// no `on_file_ready` fires after cancellation.
    pub async fn execute_batch(
        &self,
        pending_tools: &HashMap<String, PendingTool>,
        cancel: &CancellationToken,
        callbacks: &ExecutorCallbacks<'_>,
    ) -> BatchResult {
        if pending_tools.is_empty() {
            return BatchResult::default();
        }

        let futures = pending_tools.iter().map(|(id, pending)| {
            self.run_one(id.clone(), pending.clone())
        });

        let joined = futures_util::future::join_all(futures).await;

        if cancel.is_cancelled() {
            return BatchResult {
                results: Vec::new(),
                turn_break: false,
                cancelled: true,
            };
        }

        let mut turn_break = false;
        for r in &joined {
            if r.result.file.is_some() {
                if let Some(cb) = &callbacks.on_file_ready {
                    cb(r);
                }
            }
            if is_turn_break_tool(&r.name) {
                turn_break = true;
            }
        }

        BatchResult {
            results: joined,
            turn_break,
            cancelled: false,
        }
    }

    async fn run_one(&self, id: String, pending: PendingTool) -> ToolExecResult {
        use futures_util::FutureExt;

        let start = Instant::now();

        // A single misbehaving tool must not take the rest of the batch
        // down with it — panics are caught and normalized into an error
        // result the same way a reported tool failure is.
        let result = match self.find(&pending.name) {
            Some(tool) => {
                let fut = std::panic::AssertUnwindSafe(tool.execute(pending.input.clone()));
                match fut.catch_unwind().await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!(tool = %pending.name, "tool execution panicked");
                        ToolResult::error(format!(
                            "tool '{}' panicked during execution",
                            pending.name
                        ))
                    }
                }
            }
            None => ToolResult::error(format!("unknown tool: {}", pending.name)),
        };

        ToolExecResult {
            tool_call_id: id,
            name: pending.name,
            result,
            duration: start.elapsed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "echoes input"
        }
        fn input_schema(&self) -> serde_json::Value {
            serde_json::json!({})
        }
        async fn execute(&self, input: serde_json::Value) -> ToolResult {
            ToolResult::success(input.to_string())
        }
    }

    struct PanicTool;

    #[async_trait]
    impl Tool for PanicTool {
        fn name(&self) -> &str {
            "boom"
        }
        fn description(&self) -> &str {
            "always panics"
        }
        fn input_schema(&self) -> serde_json::Value {
            serde_json::json!({})
        }
        async fn execute(&self, _input: serde_json::Value) -> ToolResult {
            panic!("kaboom")
        }
    }

    struct FileTool;

    #[async_trait]
    impl Tool for FileTool {
        fn name(&self) -> &str {
            "deliver_file"
        }
        fn description(&self) -> &str {
            "produces a file"
        }
        fn input_schema(&self) -> serde_json::Value {
            serde_json::json!({})
        }
        async fn execute(&self, _input: serde_json::Value) -> ToolResult {
            ToolResult::with_file(
                "delivered",
                super::super::ToolFileOutput {
                    filename: "out.txt".into(),
                    mime_type: "text/plain".into(),
                    bytes: b"hello".to_vec(),
                },
            )
        }
    }

    fn pending(name: &str) -> PendingTool {
        PendingTool {
            name: name.to_string(),
            input: serde_json::json!({"x": 1}),
            is_server_tool: false,
        }
    }

    #[tokio::test]
    async fn runs_pending_tools_concurrently_and_normalizes_unknown() {
        let tools: Vec<Box<dyn Tool>> = vec![Box::new(EchoTool)];
        let executor = ToolExecutor::new(&tools);
        let mut batch = HashMap::new();
        batch.insert("t1".to_string(), pending("echo"));
        batch.insert("t2".to_string(), pending("missing"));

        let cancel = CancellationToken::new();
        let callbacks = ExecutorCallbacks::default();
        let result = executor.execute_batch(&batch, &cancel, &callbacks).await;

        assert_eq!(result.results.len(), 2);
        assert!(!result.cancelled);
        let missing = result.results.iter().find(|r| r.tool_call_id == "t2").unwrap();
        assert!(missing.result.is_error);
    }

    #[tokio::test]
    async fn panicking_tool_becomes_error_result_not_crash() {
        let tools: Vec<Box<dyn Tool>> = vec![Box::new(PanicTool)];
        let executor = ToolExecutor::new(&tools);
        let mut batch = HashMap::new();
        batch.insert("t1".to_string(), pending("boom"));

        let cancel = CancellationToken::new();
        let callbacks = ExecutorCallbacks::default();
        let result = executor.execute_batch(&batch, &cancel, &callbacks).await;

        assert_eq!(result.results.len(), 1);
        assert!(result.results[0].result.is_error);
    }

    #[tokio::test]
    async fn file_result_triggers_on_file_ready_and_turn_break() {
        let tools: Vec<Box<dyn Tool>> = vec![Box::new(FileTool)];
        let executor = ToolExecutor::new(&tools);
        let mut batch = HashMap::new();
        batch.insert("t1".to_string(), pending("deliver_file"));

        let fired = std::sync::atomic::AtomicBool::new(false);
        let callbacks = ExecutorCallbacks {
            on_file_ready: Some(Box::new(|_r| {
                fired.store(true, std::sync::atomic::Ordering::SeqCst);
            })),
            ..Default::default()
        };

        let cancel = CancellationToken::new();
        let result = executor.execute_batch(&batch, &cancel, &callbacks).await;

        assert!(fired.load(std::sync::atomic::Ordering::SeqCst));
        assert!(result.turn_break);
    }

    #[tokio::test]
    async fn cancelled_before_poll_drops_all_results() {
        let tools: Vec<Box<dyn Tool>> = vec![Box::new(EchoTool)];
        let executor = ToolExecutor::new(&tools);
        let mut batch = HashMap::new();
        batch.insert("t1".to_string(), pending("echo"));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let callbacks = ExecutorCallbacks::default();
        let result = executor.execute_batch(&batch, &cancel, &callbacks).await;

        assert!(result.cancelled);
        assert!(result.results.is_empty());
    }
}
