//! Read a file from the workspace

use super::{resolve, truncate_output};
use crate::tool::{ParamKind, Tool, ToolCategory, ToolContext, ToolParam};
use capstan_core::{ToolErrorCode, ToolInvocationResult};
use serde_json::Value;
use std::path::{Path, PathBuf};

const MAX_OUTPUT: usize = 30_000;

pub struct ReadFileTool {
    workspace_root: PathBuf,
}

impl ReadFileTool {
    pub fn new(workspace_root: impl AsRef<Path>) -> Self {
        Self {
            workspace_root: workspace_root.as_ref().to_path_buf(),
        }
    }
}

#[async_trait::async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a text file and return its contents. Large files are truncated."
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::ReadOnly
    }

    fn parameters(&self) -> Vec<ToolParam> {
        vec![ToolParam::new("path", ParamKind::String, "File path to read")
            .required()
            .path()]
    }

    async fn execute(&self, input: Value, _ctx: &ToolContext) -> ToolInvocationResult {
        let Some(raw) = input["path"].as_str() else {
            return ToolInvocationResult::fail(ToolErrorCode::MissingParameter, "path");
        };
        let path = resolve(&self.workspace_root, raw);
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => ToolInvocationResult::text(truncate_output(contents, MAX_OUTPUT)),
            Err(e) => ToolInvocationResult::fail(
                ToolErrorCode::Execution,
                format!("cannot read {}: {}", path.display(), e),
            ),
        }
    }
}
