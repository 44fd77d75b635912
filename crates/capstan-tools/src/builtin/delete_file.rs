//! Delete a file in the workspace

use super::resolve;
use crate::tool::{ParamKind, Tool, ToolCategory, ToolContext, ToolParam};
use capstan_core::{ToolErrorCode, ToolInvocationResult};
use serde_json::Value;
use std::path::{Path, PathBuf};

pub struct DeleteFileTool {
    workspace_root: PathBuf,
}

impl DeleteFileTool {
    pub fn new(workspace_root: impl AsRef<Path>) -> Self {
        Self {
            workspace_root: workspace_root.as_ref().to_path_buf(),
        }
    }
}

#[async_trait::async_trait]
impl Tool for DeleteFileTool {
    fn name(&self) -> &str {
        "delete_file"
    }

    fn description(&self) -> &str {
        "Delete a single file. Directories are refused."
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::FileDelete
    }

    fn parallelizable(&self) -> bool {
        false
    }

    fn parameters(&self) -> Vec<ToolParam> {
        vec![ToolParam::new("path", ParamKind::String, "File to delete")
            .required()
            .path()]
    }

    async fn execute(&self, input: Value, _ctx: &ToolContext) -> ToolInvocationResult {
        let Some(raw) = input["path"].as_str() else {
            return ToolInvocationResult::fail(ToolErrorCode::MissingParameter, "path");
        };
        let path = resolve(&self.workspace_root, raw);

        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_dir() => {
                return ToolInvocationResult::fail(
                    ToolErrorCode::InvalidParameter,
                    format!("{} is a directory", path.display()),
                )
            }
            Err(e) => {
                return ToolInvocationResult::fail(
                    ToolErrorCode::Execution,
                    format!("cannot stat {}: {}", path.display(), e),
                )
            }
            Ok(_) => {}
        }

        match tokio::fs::remove_file(&path).await {
            Ok(()) => ToolInvocationResult::text(format!("deleted {}", path.display())),
            Err(e) => ToolInvocationResult::fail(
                ToolErrorCode::Execution,
                format!("cannot delete {}: {}", path.display(), e),
            ),
        }
    }
}
