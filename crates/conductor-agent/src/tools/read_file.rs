//! Tool: read_file — bring a file's contents into the conversation, with a
//! character budget so one large file can't crowd out the rest of the
//! context window.

use async_trait::async_trait;

use super::{Tool, ToolResult};

const DEFAULT_BUDGET_CHARS: usize = 24_000;
const MAX_BUDGET_CHARS: usize = 60_000;

pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a text file. Output starts with a `path (lines, bytes)` header. \
         Large files are cut at a line boundary within the character budget; \
         set `tail` to true to read the end of the file instead of the start."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Absolute or relative path to the file."
                },
                "tail": {
                    "type": "boolean",
                    "description": "Read the end of the file instead of the start (optional, default false)."
                },
                "max_chars": {
                    "type": "integer",
                    "description": "Character budget for the returned content (optional, default 24000)."
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let Some(path) = input.get("path").and_then(|v| v.as_str()) else {
            return ToolResult::error("missing required parameter: path");
        };
        let tail = input.get("tail").and_then(|v| v.as_bool()).unwrap_or(false);
        let budget = input
            .get("max_chars")
            .and_then(|v| v.as_u64())
            .map(|v| (v as usize).min(MAX_BUDGET_CHARS))
            .unwrap_or(DEFAULT_BUDGET_CHARS);

        let content = match tokio::fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) => return ToolResult::error(format!("could not read {path}: {e}")),
        };

        let total_lines = content.lines().count();
        let total_bytes = content.len();
        let header = format!("{path} ({total_lines} lines, {total_bytes} bytes)");

        let body = if content.len() <= budget {
            content
        } else if tail {
            let window = window_at_line_boundary_from_end(&content, budget);
            format!(
                "[first {} of {} bytes omitted]\n{}",
                total_bytes - window.len(),
                total_bytes,
                window
            )
        } else {
            let window = window_at_line_boundary(&content, budget);
            format!(
                "{}\n[last {} of {} bytes omitted; re-run with tail=true for the end]",
                window,
                total_bytes - window.len(),
                total_bytes
            )
        };

        ToolResult::success(format!("{header}\n{body}"))
    }
}

/// Largest prefix within `budget` that ends on a line boundary. Falls back
/// to a char boundary if the file has one huge line.
fn window_at_line_boundary(content: &str, budget: usize) -> &str {
    let mut end = budget.min(content.len());
    while end > 0 && !content.is_char_boundary(end) {
        end -= 1;
    }
    match content[..end].rfind('\n') {
        Some(pos) if pos > 0 => &content[..pos],
        _ => &content[..end],
    }
}

/// Largest suffix within `budget` that starts on a line boundary.
fn window_at_line_boundary_from_end(content: &str, budget: usize) -> &str {
    let mut start = content.len().saturating_sub(budget);
    while start < content.len() && !content.is_char_boundary(start) {
        start += 1;
    }
    match content[start..].find('\n') {
        Some(pos) => &content[start + pos + 1..],
        None => &content[start..],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn run(input: serde_json::Value) -> ToolResult {
        ReadFileTool.execute(input).await
    }

    #[tokio::test]
    async fn reads_whole_file_with_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, "alpha\nbeta\n").unwrap();

        let result = run(serde_json::json!({"path": path.to_str().unwrap()})).await;
        assert!(!result.is_error);
        assert!(result.content.contains("(2 lines, 11 bytes)"));
        assert!(result.content.contains("alpha\nbeta"));
    }

    #[tokio::test]
    async fn missing_path_parameter_errors() {
        let result = run(serde_json::json!({})).await;
        assert!(result.is_error);
        assert!(result.content.contains("path"));
    }

    #[tokio::test]
    async fn nonexistent_file_errors() {
        let result = run(serde_json::json!({"path": "/no/such/file.txt"})).await;
        assert!(result.is_error);
        assert!(result.content.contains("could not read"));
    }

    #[tokio::test]
    async fn oversized_file_is_cut_at_line_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.txt");
        let content: String = (0..200).map(|i| format!("line number {i}\n")).collect();
        std::fs::write(&path, &content).unwrap();

        let result = run(serde_json::json!({
            "path": path.to_str().unwrap(),
            "max_chars": 300
        }))
        .await;
        assert!(!result.is_error);
        assert!(result.content.contains("omitted"));
        // No line comes back half-cut.
        for line in result.content.lines().skip(1) {
            assert!(
                line.starts_with("line number ") || line.starts_with('['),
                "unexpected partial line: {line}"
            );
        }
    }

    #[tokio::test]
    async fn tail_returns_end_of_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.txt");
        let content: String = (0..200).map(|i| format!("entry {i}\n")).collect();
        std::fs::write(&path, &content).unwrap();

        let result = run(serde_json::json!({
            "path": path.to_str().unwrap(),
            "tail": true,
            "max_chars": 200
        }))
        .await;
        assert!(!result.is_error);
        assert!(result.content.contains("entry 199"));
        assert!(!result.content.contains("entry 0\n"));
        assert!(result.content.contains("omitted"));
    }
}
