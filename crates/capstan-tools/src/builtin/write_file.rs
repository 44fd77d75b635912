//! Write a file in the workspace

use super::resolve;
use crate::tool::{ParamKind, Tool, ToolCategory, ToolContext, ToolParam};
use capstan_core::{ToolErrorCode, ToolInvocationResult};
use serde_json::Value;
use std::path::{Path, PathBuf};

pub struct WriteFileTool {
    workspace_root: PathBuf,
}

impl WriteFileTool {
    pub fn new(workspace_root: impl AsRef<Path>) -> Self {
        Self {
            workspace_root: workspace_root.as_ref().to_path_buf(),
        }
    }
}

#[async_trait::async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write content to a file, creating parent directories as needed. \
         Overwrites existing files."
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::FileWrite
    }

    // Writes to shared paths must not overlap with other mutations.
    fn parallelizable(&self) -> bool {
        false
    }

    fn parameters(&self) -> Vec<ToolParam> {
        vec![
            ToolParam::new("path", ParamKind::String, "File path to write")
                .required()
                .path(),
            ToolParam::new("content", ParamKind::String, "Content to write").required(),
        ]
    }

    async fn execute(&self, input: Value, _ctx: &ToolContext) -> ToolInvocationResult {
        let Some(raw) = input["path"].as_str() else {
            return ToolInvocationResult::fail(ToolErrorCode::MissingParameter, "path");
        };
        let Some(content) = input["content"].as_str() else {
            return ToolInvocationResult::fail(ToolErrorCode::MissingParameter, "content");
        };
        let path = resolve(&self.workspace_root, raw);

        if let Some(parent) = path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return ToolInvocationResult::fail(
                    ToolErrorCode::Execution,
                    format!("cannot create {}: {}", parent.display(), e),
                );
            }
        }
        match tokio::fs::write(&path, content).await {
            Ok(()) => ToolInvocationResult::text(format!(
                "wrote {} bytes to {}",
                content.len(),
                path.display()
            )),
            Err(e) => ToolInvocationResult::fail(
                ToolErrorCode::Execution,
                format!("cannot write {}: {}", path.display(), e),
            ),
        }
    }
}
