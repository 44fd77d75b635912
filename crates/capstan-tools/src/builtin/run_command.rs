//! Shell command execution with timeout and cancellation

use super::truncate_output;
use crate::tool::{ParamKind, Tool, ToolCategory, ToolContext, ToolParam};
use capstan_core::{ToolErrorCode, ToolInvocationResult};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::debug;

const MAX_OUTPUT: usize = 30_000;
const DEFAULT_TIMEOUT_SECS: u64 = 120;
const MAX_TIMEOUT_SECS: u64 = 600;

pub struct RunCommandTool {
    workspace_root: PathBuf,
}

impl RunCommandTool {
    pub fn new(workspace_root: impl AsRef<Path>) -> Self {
        Self {
            workspace_root: workspace_root.as_ref().to_path_buf(),
        }
    }
}

#[async_trait::async_trait]
impl Tool for RunCommandTool {
    fn name(&self) -> &str {
        "run_command"
    }

    fn description(&self) -> &str {
        "Execute a shell command in the workspace. Captures stdout and \
         stderr. Set timeout in seconds (default 120, max 600)."
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::SystemCommand
    }

    // Shell commands mutate shared state; keep them ordered.
    fn parallelizable(&self) -> bool {
        false
    }

    fn parameters(&self) -> Vec<ToolParam> {
        vec![
            ToolParam::new("command", ParamKind::String, "The command to execute").required(),
            ToolParam::new("timeout", ParamKind::Integer, "Timeout in seconds")
                .with_default(json!(DEFAULT_TIMEOUT_SECS)),
        ]
    }

    async fn execute(&self, input: Value, ctx: &ToolContext) -> ToolInvocationResult {
        // execute_cancellable is the real entry point; keep the plain path
        // for direct callers.
        self.execute_cancellable(input, ctx).await
    }

    /// Spawns with kill_on_drop and races completion against the timeout
    /// and the cancellation token; either loser kills the child. Both
    /// pipes drain concurrently with the wait so a chatty child can't
    /// fill the pipe buffer and stall.
    async fn execute_cancellable(&self, input: Value, ctx: &ToolContext) -> ToolInvocationResult {
        let Some(command) = input["command"].as_str() else {
            return ToolInvocationResult::fail(ToolErrorCode::MissingParameter, "command");
        };
        let timeout_secs = input["timeout"]
            .as_u64()
            .unwrap_or(DEFAULT_TIMEOUT_SECS)
            .min(MAX_TIMEOUT_SECS);
        debug!("run_command: {}", &command[..command.len().min(80)]);

        let mut child = match Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.workspace_root)
            .kill_on_drop(true)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                return ToolInvocationResult::fail(
                    ToolErrorCode::Execution,
                    format!("failed to spawn: {}", e),
                )
            }
        };

        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();

        let timeout = std::time::Duration::from_secs(timeout_secs);
        tokio::select! {
            finished = tokio::time::timeout(timeout, async {
                tokio::join!(
                    child.wait(),
                    async {
                        let mut buf = Vec::new();
                        if let Some(pipe) = stdout_pipe.as_mut() {
                            let _ = pipe.read_to_end(&mut buf).await;
                        }
                        String::from_utf8_lossy(&buf).into_owned()
                    },
                    async {
                        let mut buf = Vec::new();
                        if let Some(pipe) = stderr_pipe.as_mut() {
                            let _ = pipe.read_to_end(&mut buf).await;
                        }
                        String::from_utf8_lossy(&buf).into_owned()
                    },
                )
            }) => {
                match finished {
                    Ok((Ok(status), stdout, stderr)) => format_output(status, stdout, stderr),
                    Ok((Err(e), _, _)) => ToolInvocationResult::fail(
                        ToolErrorCode::Execution,
                        format!("failed to wait: {}", e),
                    ),
                    Err(_) => {
                        let _ = child.kill().await;
                        ToolInvocationResult::fail(
                            ToolErrorCode::Timeout,
                            format!("command timed out after {}s", timeout_secs),
                        )
                    }
                }
            }
            _ = ctx.cancel.cancelled() => {
                let _ = child.kill().await;
                ToolInvocationResult::fail(ToolErrorCode::Cancelled, "process killed by cancellation")
            }
        }
    }
}

fn format_output(
    status: std::process::ExitStatus,
    stdout: String,
    stderr: String,
) -> ToolInvocationResult {
    let combined = if status.success() {
        if stderr.is_empty() {
            stdout.trim().to_string()
        } else {
            format!("{}\n{}", stdout.trim(), stderr.trim())
        }
    } else {
        format!(
            "Exit code: {}\n{}\n{}",
            status.code().unwrap_or(-1),
            stdout.trim(),
            stderr.trim()
        )
    };

    if !status.success() {
        return ToolInvocationResult::fail(
            ToolErrorCode::Execution,
            truncate_output(combined, MAX_OUTPUT),
        );
    }
    if combined.is_empty() {
        ToolInvocationResult::text("(no output)")
    } else {
        ToolInvocationResult::text(truncate_output(combined, MAX_OUTPUT))
    }
}
