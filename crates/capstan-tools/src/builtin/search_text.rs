//! Regex search across workspace files

use super::{resolve, truncate_output};
use crate::tool::{ParamKind, Tool, ToolCategory, ToolContext, ToolParam};
use capstan_core::{ToolErrorCode, ToolInvocationResult};
use regex::Regex;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

const MAX_MATCHES: usize = 200;
const MAX_OUTPUT: usize = 30_000;
const MAX_FILE_BYTES: u64 = 1_000_000;

pub struct SearchTextTool {
    workspace_root: PathBuf,
}

impl SearchTextTool {
    pub fn new(workspace_root: impl AsRef<Path>) -> Self {
        Self {
            workspace_root: workspace_root.as_ref().to_path_buf(),
        }
    }
}

#[async_trait::async_trait]
impl Tool for SearchTextTool {
    fn name(&self) -> &str {
        "search_text"
    }

    fn description(&self) -> &str {
        "Search files for a regex pattern. Returns path:line matches."
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::ReadOnly
    }

    fn parameters(&self) -> Vec<ToolParam> {
        vec![
            ToolParam::new("pattern", ParamKind::String, "Regex pattern").required(),
            ToolParam::new("path", ParamKind::String, "Directory to search")
                .with_default(json!("."))
                .path(),
        ]
    }

    async fn execute(&self, input: Value, _ctx: &ToolContext) -> ToolInvocationResult {
        let Some(pattern) = input["pattern"].as_str() else {
            return ToolInvocationResult::fail(ToolErrorCode::MissingParameter, "pattern");
        };
        let re = match Regex::new(pattern) {
            Ok(re) => re,
            Err(e) => {
                return ToolInvocationResult::fail(
                    ToolErrorCode::InvalidParameter,
                    format!("bad pattern: {}", e),
                )
            }
        };
        let root = resolve(&self.workspace_root, input["path"].as_str().unwrap_or("."));

        // Directory walking is blocking work; hand it to the blocking pool.
        let result = tokio::task::spawn_blocking(move || search(&root, &re)).await;
        match result {
            Ok(output) => ToolInvocationResult::text(truncate_output(output, MAX_OUTPUT)),
            Err(e) => ToolInvocationResult::fail(ToolErrorCode::Execution, e.to_string()),
        }
    }
}

fn search(root: &Path, re: &Regex) -> String {
    let mut out = String::new();
    let mut matches = 0usize;
    for entry in WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
    {
        if entry.metadata().map(|m| m.len() > MAX_FILE_BYTES).unwrap_or(true) {
            continue;
        }
        let Ok(contents) = std::fs::read_to_string(entry.path()) else {
            continue;
        };
        for (lineno, line) in contents.lines().enumerate() {
            if re.is_match(line) {
                out.push_str(&format!(
                    "{}:{}: {}\n",
                    entry.path().display(),
                    lineno + 1,
                    line.trim_end()
                ));
                matches += 1;
                if matches >= MAX_MATCHES {
                    out.push_str("... [match cap reached]\n");
                    return out;
                }
            }
        }
    }
    if out.is_empty() {
        "(no matches)".into()
    } else {
        out
    }
}
