//! Capstan Tools - tool catalog, safety gate, lanes, and the scheduler
//!
//! A tool call travels: classification -> before hooks -> approval ->
//! parameter validation -> timeout-wrapped execution -> after hooks ->
//! events. The scheduler partitions each batch into parallelizable and
//! serial subsets and returns results in batch order.

pub mod approval;
pub mod builtin;
pub mod classify;
pub mod hooks;
pub mod lane;
pub mod registry;
pub mod scheduler;
pub mod tool;
pub mod validate;

pub use approval::{ApprovalManager, ApprovalRecord, ApprovalRequest, ApprovalResponse};
pub use classify::{classify, Classification};
pub use hooks::{
    AfterContext, AfterHook, AfterOutcome, BeforeContext, BeforeHook, BeforeOutcome, ToolHooks,
};
pub use lane::{Lane, LaneConfig, LaneManager, Task, TaskReceipt, PARALLEL_LANE};
pub use registry::{RegisteredTool, RegistryStats, ToolRegistry, ToolSource};
pub use scheduler::{SchedulerBuilder, ToolScheduler};
pub use tool::{ParamKind, Tool, ToolCategory, ToolContext, ToolParam};
pub use validate::validate_input;

use std::path::Path;
use std::sync::Arc;

/// Create the default registry with all builtin tools rooted at the
/// workspace. Edit this to add or remove builtins.
pub fn create_default_registry(workspace_root: impl AsRef<Path>) -> Arc<ToolRegistry> {
    let registry = ToolRegistry::new();
    let root = workspace_root.as_ref();

    // Read-only tools (parallelizable)
    registry.register(builtin::read_file::ReadFileTool::new(root), ToolSource::Builtin);
    registry.register(builtin::list_dir::ListDirTool::new(root), ToolSource::Builtin);
    registry.register(
        builtin::search_text::SearchTextTool::new(root),
        ToolSource::Builtin,
    );

    // Mutating tools (serial)
    registry.register(
        builtin::write_file::WriteFileTool::new(root),
        ToolSource::Builtin,
    );
    registry.register(
        builtin::delete_file::DeleteFileTool::new(root),
        ToolSource::Builtin,
    );
    registry.register(
        builtin::run_command::RunCommandTool::new(root),
        ToolSource::Builtin,
    );

    Arc::new(registry)
}
