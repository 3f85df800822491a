//! Tool executor: runs a batch of tool calls from one LLM turn,
//! gating each through the Tool Guard and Approval Manager first.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use conductor_core::AccessLevel;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::approval::{ApprovalManager, SendUserMsg, Verdict};
use crate::guard::{GuardDecision, ToolGuard};
use crate::provider::ToolCall;
use crate::tools::{Tool, ToolResult};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const LONG_TIMEOUT: Duration = Duration::from_secs(300);
const DEFAULT_MAX_PARALLEL: usize = 5;

const LONG_RUNNING_TOOLS: &[&str] = &["shell_exec", "ssh", "scp", "exec"];

/// Substrings that mark a tool error as recoverable (the model should
/// retry silently rather than treat it as a hard failure).
const RECOVERABLE_SUBSTRINGS: &[&str] =
    &["required", "not found", "invalid", "timed out", "permission denied"];

pub fn is_recoverable(error: &str) -> bool {
    let lower = error.to_lowercase();
    RECOVERABLE_SUBSTRINGS.iter().any(|s| lower.contains(s))
}

/// Hook invoked when a tool result carries a binary artifact (e.g. a
/// generated image path) that should be delivered out-of-band and then
/// cleaned up. Concrete delivery is an external collaborator (channels).
#[async_trait::async_trait]
pub trait AutoSendHook: Send + Sync {
    async fn send_artifact(&self, session_id: &str, path: &str);
}

pub struct NoopAutoSendHook;
#[async_trait::async_trait]
impl AutoSendHook for NoopAutoSendHook {
    async fn send_artifact(&self, _session_id: &str, _path: &str) {}
}

pub struct ExecutorConfig {
    pub parallel: bool,
    pub max_parallel: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self { parallel: true, max_parallel: DEFAULT_MAX_PARALLEL }
    }
}

pub struct ToolExecutor {
    tools: Vec<Box<dyn Tool>>,
    guard: Arc<ToolGuard>,
    approvals: Arc<ApprovalManager>,
    auto_send: Arc<dyn AutoSendHook>,
    config: ExecutorConfig,
    /// One-shot abort signal, replaced by `reset_abort` between runs. Behind
    /// a mutex so the executor can stay shared (`Arc`) across runs.
    abort: std::sync::Mutex<CancellationToken>,
}

impl ToolExecutor {
    pub fn new(tools: Vec<Box<dyn Tool>>, guard: Arc<ToolGuard>, approvals: Arc<ApprovalManager>) -> Self {
        Self {
            tools,
            guard,
            approvals,
            auto_send: Arc::new(NoopAutoSendHook),
            config: ExecutorConfig::default(),
            abort: std::sync::Mutex::new(CancellationToken::new()),
        }
    }

    pub fn with_auto_send(mut self, hook: Arc<dyn AutoSendHook>) -> Self {
        self.auto_send = hook;
        self
    }

    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    /// Signal abort for all in-flight tool contexts in this run. The caller
    /// resets the token via `reset_abort` before the next run.
    pub fn abort(&self) {
        self.abort.lock().unwrap().cancel();
    }

    pub fn reset_abort(&self) {
        *self.abort.lock().unwrap() = CancellationToken::new();
    }

    fn abort_token(&self) -> CancellationToken {
        self.abort.lock().unwrap().clone()
    }

    fn timeout_for(&self, tool_name: &str) -> Duration {
        if LONG_RUNNING_TOOLS.iter().any(|t| tool_name.contains(t)) {
            LONG_TIMEOUT
        } else {
            DEFAULT_TIMEOUT
        }
    }

    fn find_tool(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.iter().find(|t| t.name() == name).map(|t| t.as_ref())
    }

    /// Execute a batch of tool calls, returning results in the same order
    /// as `calls`.
    #[allow(clippy::too_many_arguments)]
    pub async fn execute_batch(
        &self,
        session_id: &str,
        caller_id: &str,
        caller_level: AccessLevel,
        calls: &[ToolCall],
        session_trust: &HashMap<String, bool>,
        confirmation_required: &[String],
        send_user_msg: SendUserMsg,
    ) -> Vec<ToolResult> {
        if !self.config.parallel {
            let mut results = Vec::with_capacity(calls.len());
            for call in calls {
                results.push(
                    self.execute_one(session_id, caller_id, caller_level, call, session_trust, confirmation_required, send_user_msg.clone())
                        .await,
                );
            }
            return results;
        }

        // No `tokio::spawn` needed: all the futures below borrow `self` and
        // run concurrently within this single `join_all`, bounded by the
        // semaphore permit each one acquires before dispatching its tool.
        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel));

        let futures = calls.iter().map(|call| {
            let sem = semaphore.clone();
            let send_user_msg = send_user_msg.clone();
            async move {
                let _permit = sem.acquire().await.expect("semaphore not closed");
                self.execute_one(session_id, caller_id, caller_level, call, session_trust, confirmation_required, send_user_msg)
                    .await
            }
        });

        futures_util::future::join_all(futures).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_one(
        &self,
        session_id: &str,
        caller_id: &str,
        caller_level: AccessLevel,
        call: &ToolCall,
        session_trust: &HashMap<String, bool>,
        confirmation_required: &[String],
        send_user_msg: SendUserMsg,
    ) -> ToolResult {
        let decision = self.guard.check(caller_id, caller_level, &call.name, &call.input, session_trust);

        match decision {
            GuardDecision::Deny(reason) => {
                return ToolResult::error(format!("denied: {reason}"));
            }
            GuardDecision::RequireConfirmation(_) if confirmation_required.iter().any(|t| t == &call.name) => {
                let verdict = self
                    .approvals
                    .request(session_id, caller_id, &call.name, &call.input, send_user_msg)
                    .await;
                if let Verdict::Denied(reason) = verdict {
                    return ToolResult::error(format!("denied: {reason}"));
                }
            }
            GuardDecision::RequireConfirmation(reason) => {
                return ToolResult::error(format!("denied: {reason}"));
            }
            GuardDecision::Allow => {}
        }

        let Some(tool) = self.find_tool(&call.name) else {
            return ToolResult::error(format!("unknown tool: {}", call.name));
        };

        let timeout = self.timeout_for(&call.name);
        let abort = self.abort_token();

        let result = tokio::select! {
            result = tokio::time::timeout(timeout, tool.execute(call.input.clone())) => {
                match result {
                    Ok(r) => r,
                    Err(_) => ToolResult::error(format!("timed out after {}s", timeout.as_secs())),
                }
            }
            _ = abort.cancelled() => ToolResult::error("aborted by user"),
        };

        if result.is_error && is_recoverable(&result.content) {
            debug!(tool = %call.name, error = %result.content, "recoverable tool error");
        }

        if !result.is_error {
            if let Some(path) = artifact_path(&result.content) {
                self.auto_send.send_artifact(session_id, &path).await;
            }
        }

        result
    }
}

/// Pull a binary-artifact path out of a JSON tool result. One artifact per
/// result; a tool producing several files returns several results.
fn artifact_path(content: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(content).ok()?;
    for key in ["image_path", "artifact_path", "file_path"] {
        if let Some(path) = value.get(key).and_then(|v| v.as_str()) {
            return Some(path.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::{ArgRules, NullAuditSink, ToolProfile};
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

    struct SlowTool;
    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }
        fn description(&self) -> &str {
            "sleeps"
        }
        fn input_schema(&self) -> serde_json::Value {
            serde_json::json!({})
        }
        async fn execute(&self, _input: serde_json::Value) -> ToolResult {
            tokio::time::sleep(Duration::from_secs(60)).await;
            ToolResult::success("done")
        }
    }

    fn executor(tools: Vec<Box<dyn Tool>>) -> ToolExecutor {
        let guard = Arc::new(ToolGuard::new(
            ToolProfile::permissive("default"),
            ArgRules::default(),
            Vec::new(),
            Arc::new(NullAuditSink),
        ));
        ToolExecutor::new(tools, guard, Arc::new(ApprovalManager::new()))
    }

    #[tokio::test]
    async fn executes_allowed_tool() {
        let exec = executor(vec![Box::new(EchoTool)]);
        let calls = vec![ToolCall { id: "1".to_string(), name: "echo".to_string(), input: serde_json::json!({"a": 1}) }];
        let results = exec
            .execute_batch("s1", "u1", AccessLevel::Owner, &calls, &HashMap::new(), &[], Arc::new(|_, _| {}))
            .await;
        assert_eq!(results.len(), 1);
        assert!(!results[0].is_error);
    }

    #[tokio::test]
    async fn unknown_tool_errors() {
        let exec = executor(vec![]);
        let calls = vec![ToolCall { id: "1".to_string(), name: "ghost".to_string(), input: serde_json::json!({}) }];
        let results = exec
            .execute_batch("s1", "u1", AccessLevel::Owner, &calls, &HashMap::new(), &[], Arc::new(|_, _| {}))
            .await;
        assert!(results[0].is_error);
        assert!(results[0].content.contains("unknown tool"));
    }

    #[tokio::test]
    async fn denied_tool_is_not_dispatched() {
        let guard = Arc::new(ToolGuard::new(
            ToolProfile { name: "restricted".to_string(), allow: vec![], deny: vec!["echo".to_string()] },
            ArgRules::default(),
            Vec::new(),
            Arc::new(NullAuditSink),
        ));
        let exec = ToolExecutor::new(vec![Box::new(EchoTool)], guard, Arc::new(ApprovalManager::new()));
        let calls = vec![ToolCall { id: "1".to_string(), name: "echo".to_string(), input: serde_json::json!({}) }];
        let results = exec
            .execute_batch("s1", "u1", AccessLevel::Owner, &calls, &HashMap::new(), &[], Arc::new(|_, _| {}))
            .await;
        assert!(results[0].is_error);
        assert!(results[0].content.starts_with("denied:"));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_produces_error_result() {
        let exec = executor(vec![Box::new(SlowTool)]);
        let calls = vec![ToolCall { id: "1".to_string(), name: "slow".to_string(), input: serde_json::json!({}) }];
        let handle = tokio::spawn(async move {
            exec.execute_batch("s1", "u1", AccessLevel::Owner, &calls, &HashMap::new(), &[], Arc::new(|_, _| {})).await
        });
        tokio::time::advance(Duration::from_secs(31)).await;
        let results = handle.await.unwrap();
        assert!(results[0].is_error);
        assert!(results[0].content.contains("timed out"));
    }

    #[tokio::test]
    async fn artifact_result_fires_auto_send() {
        struct ImageTool;
        #[async_trait]
        impl Tool for ImageTool {
            fn name(&self) -> &str {
                "make_image"
            }
            fn description(&self) -> &str {
                "renders an image"
            }
            fn input_schema(&self) -> serde_json::Value {
                serde_json::json!({})
            }
            async fn execute(&self, _input: serde_json::Value) -> ToolResult {
                ToolResult::success(r#"{"image_path": "/tmp/out.png"}"#)
            }
        }

        struct RecordingHook {
            sent: std::sync::Mutex<Vec<String>>,
        }
        #[async_trait]
        impl AutoSendHook for RecordingHook {
            async fn send_artifact(&self, _session_id: &str, path: &str) {
                self.sent.lock().unwrap().push(path.to_string());
            }
        }

        let hook = Arc::new(RecordingHook { sent: std::sync::Mutex::new(Vec::new()) });
        let exec = executor(vec![Box::new(ImageTool)]).with_auto_send(hook.clone());
        let calls = vec![ToolCall { id: "1".to_string(), name: "make_image".to_string(), input: serde_json::json!({}) }];
        exec.execute_batch("s1", "u1", AccessLevel::Owner, &calls, &HashMap::new(), &[], Arc::new(|_, _| {}))
            .await;
        assert_eq!(hook.sent.lock().unwrap().as_slice(), ["/tmp/out.png"]);
    }

    #[test]
    fn recoverable_classification() {
        assert!(is_recoverable("missing required parameter: path"));
        assert!(is_recoverable("file NOT FOUND"));
        assert!(!is_recoverable("unexpected internal error"));
    }
}
