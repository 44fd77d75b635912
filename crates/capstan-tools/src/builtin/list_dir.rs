//! List directory entries

use super::resolve;
use crate::tool::{ParamKind, Tool, ToolCategory, ToolContext, ToolParam};
use capstan_core::{ToolErrorCode, ToolInvocationResult};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

pub struct ListDirTool {
    workspace_root: PathBuf,
}

impl ListDirTool {
    pub fn new(workspace_root: impl AsRef<Path>) -> Self {
        Self {
            workspace_root: workspace_root.as_ref().to_path_buf(),
        }
    }
}

#[async_trait::async_trait]
impl Tool for ListDirTool {
    fn name(&self) -> &str {
        "list_dir"
    }

    fn description(&self) -> &str {
        "List the entries of a directory (name, kind, size)."
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::ReadOnly
    }

    fn parameters(&self) -> Vec<ToolParam> {
        vec![ToolParam::new("path", ParamKind::String, "Directory to list")
            .with_default(json!("."))
            .path()]
    }

    async fn execute(&self, input: Value, _ctx: &ToolContext) -> ToolInvocationResult {
        let raw = input["path"].as_str().unwrap_or(".");
        let path = resolve(&self.workspace_root, raw);

        let mut dir = match tokio::fs::read_dir(&path).await {
            Ok(d) => d,
            Err(e) => {
                return ToolInvocationResult::fail(
                    ToolErrorCode::Execution,
                    format!("cannot list {}: {}", path.display(), e),
                )
            }
        };

        let mut entries = Vec::new();
        while let Ok(Some(entry)) = dir.next_entry().await {
            let name = entry.file_name().to_string_lossy().to_string();
            let meta = entry.metadata().await.ok();
            let is_dir = meta.as_ref().map(|m| m.is_dir()).unwrap_or(false);
            entries.push(json!({
                "name": name,
                "kind": if is_dir { "dir" } else { "file" },
                "size": meta.map(|m| m.len()).unwrap_or(0),
            }));
        }
        entries.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));
        ToolInvocationResult::ok(json!(entries))
    }
}
