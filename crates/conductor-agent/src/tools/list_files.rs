//! Tool: list_files — directory listing shaped for a chat transcript:
//! directories first, human-readable sizes, optional extension filter, and
//! a hard cap with an "and N more" trailer instead of a silent cut.

use async_trait::async_trait;

use super::{Tool, ToolResult};

const MAX_LISTED: usize = 200;

pub struct ListFilesTool;

#[async_trait]
impl Tool for ListFilesTool {
    fn name(&self) -> &str {
        "list_files"
    }

    fn description(&self) -> &str {
        "List a directory: subdirectories first (marked with a trailing `/`), \
         then files with human-readable sizes. Pass `extension` (e.g. \"rs\") \
         to list only matching files. Shows at most 200 entries."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Absolute or relative path to the directory."
                },
                "extension": {
                    "type": "string",
                    "description": "Only list files with this extension, without the dot (optional)."
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let Some(path) = input.get("path").and_then(|v| v.as_str()) else {
            return ToolResult::error("missing required parameter: path");
        };
        let extension = input
            .get("extension")
            .and_then(|v| v.as_str())
            .map(|e| e.trim_start_matches('.').to_ascii_lowercase());

        let mut read_dir = match tokio::fs::read_dir(path).await {
            Ok(rd) => rd,
            Err(e) => return ToolResult::error(format!("could not list {path}: {e}")),
        };

        let mut dirs: Vec<String> = Vec::new();
        let mut files: Vec<(String, u64)> = Vec::new();

        while let Ok(Some(entry)) = read_dir.next_entry().await {
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            let name = entry.file_name().to_string_lossy().to_string();

            if metadata.is_dir() {
                if extension.is_none() {
                    dirs.push(name);
                }
                continue;
            }

            if let Some(ext) = &extension {
                let matches = std::path::Path::new(&name)
                    .extension()
                    .is_some_and(|e| e.to_string_lossy().to_ascii_lowercase() == *ext);
                if !matches {
                    continue;
                }
            }
            files.push((name, metadata.len()));
        }

        dirs.sort_by_key(|n| n.to_lowercase());
        files.sort_by_key(|(n, _)| n.to_lowercase());

        let total = dirs.len() + files.len();
        if total == 0 {
            let what = match &extension {
                Some(ext) => format!("no .{ext} files in {path}"),
                None => format!("{path} is empty"),
            };
            return ToolResult::success(what);
        }

        let mut lines = Vec::with_capacity(total.min(MAX_LISTED) + 1);
        lines.push(format!("{path}: {total} entries"));
        for name in dirs.iter().take(MAX_LISTED) {
            lines.push(format!("  {name}/"));
        }
        for (name, size) in files.iter().take(MAX_LISTED.saturating_sub(dirs.len())) {
            lines.push(format!("  {name}  {}", human_size(*size)));
        }

        let shown = lines.len() - 1;
        if shown < total {
            lines.push(format!("  ... and {} more", total - shown));
        }

        ToolResult::success(lines.join("\n"))
    }
}

fn human_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    if bytes < KB {
        format!("{bytes} B")
    } else if bytes < MB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else if bytes < GB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    }
}
