//! Tool: write_file — create, overwrite, or append to a text file. The
//! default mode refuses to clobber an existing file, so the model has to
//! ask for `overwrite` explicitly.

use async_trait::async_trait;

use super::{Tool, ToolResult};

pub struct WriteFileTool;

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write text to a file. `mode` is one of `create` (default; fails if the \
         file already exists), `overwrite`, or `append`. Parent directories are \
         created as needed."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Absolute or relative path to write to."
                },
                "content": {
                    "type": "string",
                    "description": "Text content to write."
                },
                "mode": {
                    "type": "string",
                    "enum": ["create", "overwrite", "append"],
                    "description": "Write mode (optional, default `create`)."
                }
            },
            "required": ["path", "content"]
        })
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let Some(path) = input.get("path").and_then(|v| v.as_str()) else {
            return ToolResult::error("missing required parameter: path");
        };
        let Some(content) = input.get("content").and_then(|v| v.as_str()) else {
            return ToolResult::error("missing required parameter: content");
        };
        let mode = input.get("mode").and_then(|v| v.as_str()).unwrap_or("create");

        let exists = tokio::fs::try_exists(path).await.unwrap_or(false);
        match mode {
            "create" if exists => {
                return ToolResult::error(format!(
                    "{path} already exists; use mode \"overwrite\" to replace it or \"append\" to add to it"
                ));
            }
            "create" | "overwrite" | "append" => {}
            other => {
                return ToolResult::error(format!(
                    "invalid mode \"{other}\" (expected create, overwrite, or append)"
                ));
            }
        }

        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                if let Err(e) = tokio::fs::create_dir_all(parent).await {
                    return ToolResult::error(format!(
                        "could not create parent directories for {path}: {e}"
                    ));
                }
            }
        }

        let bytes = content.len();
        let outcome = if mode == "append" {
            use tokio::io::AsyncWriteExt;
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await;
            match file {
                Ok(mut f) => match f.write_all(content.as_bytes()).await {
                    Ok(()) => f.flush().await,
                    Err(e) => Err(e),
                },
                Err(e) => Err(e),
            }
        } else {
            tokio::fs::write(path, content).await
        };

        match outcome {
            Ok(()) => {
                let verb = match mode {
                    "append" => "appended",
                    _ if exists => "replaced",
                    _ => "created",
                };
                ToolResult::success(format!("{verb} {path} ({bytes} bytes)"))
            }
            Err(e) => ToolResult::error(format!("could not write {path}: {e}")),
        }
    }
}
