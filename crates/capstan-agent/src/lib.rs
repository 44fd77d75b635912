//! Capstan Agent - session trees, streaming assembly, and the turn loop

pub mod context;
pub mod delta;
pub mod heartbeat;
pub mod runtime;
pub mod session;
pub mod storage;
pub mod stream;

pub use context::ContextManager;
pub use delta::{DeltaBuffer, SplitBlocks, ThinkingExtract, DEFAULT_BLOCK_SIZE};
pub use heartbeat::{HeartbeatEngine, HeartbeatTask, Suggestion};
pub use runtime::{AgentConfig, AgentRuntime, AgentState};
pub use session::{to_llm_messages, Session, SessionRegistry, TurnGuard};
pub use storage::{FileSessionStore, MemorySessionStore, SessionSnapshot, SessionStore};
pub use stream::{StreamOutcome, StreamingHandler};

use capstan_core::{CapstanConfig, ConfigError, EventBus};
use capstan_tools::{ApprovalManager, ToolScheduler};
use std::sync::Arc;
use std::time::Duration;

/// Wire a full runtime from validated configuration: provider adapter,
/// builtin tool registry, approval gate, scheduler, file-backed sessions.
/// Fails fast on configuration errors, before any loop starts.
pub fn build_runtime(
    config: &CapstanConfig,
    workspace_root: impl AsRef<std::path::Path>,
) -> Result<(AgentRuntime, EventBus, Arc<ApprovalManager>), ConfigError> {
    config.validate()?;

    let bus = EventBus::new();
    let provider = capstan_llm::provider_for_config(&config.model)?;

    let registry = capstan_tools::create_default_registry(&workspace_root);
    let approvals = Arc::new(ApprovalManager::new(
        config.safety.trust_mode,
        Duration::from_secs(config.safety.approval_timeout_secs),
        bus.clone(),
    ));
    let scheduler = ToolScheduler::builder(registry, approvals.clone(), bus.clone())
        .workspace_root(workspace_root.as_ref().to_path_buf())
        .build();

    let store = Arc::new(FileSessionStore::new(&config.storage.session_dir));
    let sessions = Arc::new(SessionRegistry::with_store(store, config.agent.auto_save));

    let runtime = AgentRuntime::new(
        provider,
        scheduler,
        sessions,
        bus.clone(),
        AgentConfig::from_config(config),
    );
    Ok((runtime, bus, approvals))
}
