//! Tool: shell_exec — one-shot shell command execution, safety-checked and
//! time-bounded. The Tool Guard's access-level and path/host rules gate
//! whether this tool runs at all; this layer only blocks footgun patterns
//! within an already-authorized call.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::safety;

use super::{Tool, ToolResult};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct ShellExecTool {
    timeout: Duration,
}

impl ShellExecTool {
    pub fn new() -> Self {
        Self { timeout: DEFAULT_TIMEOUT }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for ShellExecTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for ShellExecTool {
    fn name(&self) -> &str {
        "shell_exec"
    }

    fn description(&self) -> &str {
        "Execute a shell command and return its stdout and stderr. Commands are \
         safety-checked (dangerous commands like rm -rf, sudo, etc. are blocked). \
         Default timeout is 30 seconds."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": { "type": "string", "description": "The shell command to execute via sh -c." }
            },
            "required": ["command"]
        })
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let command = match input.get("command").and_then(|v| v.as_str()) {
            Some(c) => c,
            None => return ToolResult::error("missing required parameter: command"),
        };

        if let Err(reason) = safety::check_command(command) {
            return ToolResult::error(format!("denied: {reason}"));
        }

        let mut child = match Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(c) => c,
            Err(e) => return ToolResult::error(format!("failed to spawn command: {e}")),
        };

        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();

        let run = async {
            let mut stdout = String::new();
            let mut stderr = String::new();
            if let Some(mut p) = stdout_pipe.take() {
                let _ = p.read_to_string(&mut stdout).await;
            }
            if let Some(mut p) = stderr_pipe.take() {
                let _ = p.read_to_string(&mut stderr).await;
            }
            let status = child.wait().await;
            (stdout, stderr, status)
        };

        match tokio::time::timeout(self.timeout, run).await {
            Ok((stdout, stderr, status)) => {
                let exit_code = status.ok().and_then(|s| s.code()).unwrap_or(-1);

                let mut output = String::new();
                if !stdout.is_empty() {
                    output.push_str(&stdout);
                }
                if !stderr.is_empty() {
                    if !output.is_empty() {
                        output.push('\n');
                    }
                    output.push_str("[stderr]\n");
                    output.push_str(&stderr);
                }
                if exit_code != 0 {
                    output.push_str(&format!("\n[exit code: {exit_code}]"));
                }
                if output.is_empty() {
                    output = "(no output)".to_string();
                }

                ToolResult::success(output)
            }
            Err(_) => ToolResult::error(format!("timed out after {}s", self.timeout.as_secs())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn runs_safe_command() {
        let tool = ShellExecTool::new();
        let result = tool.execute(serde_json::json!({"command": "echo hello"})).await;
        assert!(!result.is_error);
        assert!(result.content.contains("hello"));
    }

    #[tokio::test]
    async fn denies_unsafe_command() {
        let tool = ShellExecTool::new();
        let result = tool.execute(serde_json::json!({"command": "sudo rm -rf /"})).await;
        assert!(result.is_error);
        assert!(result.content.starts_with("denied:"));
    }

    #[tokio::test]
    async fn times_out_long_running_command() {
        let tool = ShellExecTool::with_timeout(Duration::from_millis(100));
        let result = tool.execute(serde_json::json!({"command": "sleep 2"})).await;
        assert!(result.is_error);
        assert!(result.content.contains("timed out"));
    }
}
