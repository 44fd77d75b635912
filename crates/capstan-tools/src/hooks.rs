//! Before/after tool interception pipeline
//!
//! Hooks run priority-sorted (higher first). A failing hook is logged and
//! skipped; the chain never aborts because one hook misbehaved.

use capstan_core::{SessionId, ToolInvocationResult};
use serde_json::Value;
use std::sync::RwLock;
use std::time::Duration;
use tracing::warn;

/// Context handed to before-hooks.
#[derive(Clone, Debug)]
pub struct BeforeContext {
    pub tool_name: String,
    pub tool_id: String,
    pub args: Value,
    pub session_id: SessionId,
}

/// Context handed to after-hooks.
#[derive(Clone, Debug)]
pub struct AfterContext {
    pub tool_name: String,
    pub tool_id: String,
    pub args: Value,
    pub session_id: SessionId,
    pub result: ToolInvocationResult,
    pub is_error: bool,
    pub duration: Duration,
}

/// What a before-hook decided.
#[derive(Clone, Debug, Default)]
pub struct BeforeOutcome {
    /// False blocks the call; `block_reason` explains why.
    pub proceed: bool,
    pub modified_args: Option<Value>,
    pub block_reason: Option<String>,
    /// Skip execution entirely and use this result instead.
    pub override_result: Option<ToolInvocationResult>,
}

impl BeforeOutcome {
    pub fn proceed() -> Self {
        Self {
            proceed: true,
            ..Default::default()
        }
    }

    pub fn proceed_with(args: Value) -> Self {
        Self {
            proceed: true,
            modified_args: Some(args),
            ..Default::default()
        }
    }

    pub fn block(reason: impl Into<String>) -> Self {
        Self {
            proceed: false,
            block_reason: Some(reason.into()),
            ..Default::default()
        }
    }

    pub fn replace(result: ToolInvocationResult) -> Self {
        Self {
            proceed: true,
            override_result: Some(result),
            ..Default::default()
        }
    }
}

/// What an after-hook decided.
#[derive(Clone, Debug, Default)]
pub struct AfterOutcome {
    pub modified_result: Option<ToolInvocationResult>,
    pub metadata: serde_json::Map<String, Value>,
}

#[async_trait::async_trait]
pub trait BeforeHook: Send + Sync {
    fn name(&self) -> &str;
    fn priority(&self) -> i32 {
        0
    }
    async fn run(&self, ctx: &BeforeContext) -> anyhow::Result<BeforeOutcome>;
}

#[async_trait::async_trait]
pub trait AfterHook: Send + Sync {
    fn name(&self) -> &str;
    fn priority(&self) -> i32 {
        0
    }
    async fn run(&self, ctx: &AfterContext) -> anyhow::Result<AfterOutcome>;
}

/// Aggregated decision after the before-chain ran.
#[derive(Clone, Debug)]
pub struct BeforeDecision {
    pub proceed: bool,
    pub args: Value,
    pub block_reason: Option<String>,
    pub override_result: Option<ToolInvocationResult>,
}

/// Aggregated decision after the after-chain ran.
#[derive(Clone, Debug)]
pub struct AfterDecision {
    pub result: ToolInvocationResult,
    pub metadata: serde_json::Map<String, Value>,
}

#[derive(Default)]
pub struct ToolHooks {
    before: RwLock<Vec<std::sync::Arc<dyn BeforeHook>>>,
    after: RwLock<Vec<std::sync::Arc<dyn AfterHook>>>,
}

impl ToolHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_before(&self, hook: impl BeforeHook + 'static) {
        let mut chain = self.before.write().unwrap_or_else(|e| e.into_inner());
        chain.push(std::sync::Arc::new(hook));
        chain.sort_by_key(|h| std::cmp::Reverse(h.priority()));
    }

    pub fn add_after(&self, hook: impl AfterHook + 'static) {
        let mut chain = self.after.write().unwrap_or_else(|e| e.into_inner());
        chain.push(std::sync::Arc::new(hook));
        chain.sort_by_key(|h| std::cmp::Reverse(h.priority()));
    }

    pub fn before_count(&self) -> usize {
        self.before.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn after_count(&self) -> usize {
        self.after.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Run the before-chain. Later hooks see earlier hooks' modified args;
    /// the first hook that blocks or overrides short-circuits.
    pub async fn execute_before(&self, ctx: BeforeContext) -> BeforeDecision {
        let chain: Vec<_> = self
            .before
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        let mut current = ctx;
        for hook in chain {
            match hook.run(&current).await {
                Ok(outcome) => {
                    if !outcome.proceed {
                        return BeforeDecision {
                            proceed: false,
                            args: current.args,
                            block_reason: outcome
                                .block_reason
                                .or_else(|| Some(format!("blocked by hook '{}'", hook.name()))),
                            override_result: None,
                        };
                    }
                    if let Some(result) = outcome.override_result {
                        return BeforeDecision {
                            proceed: true,
                            args: current.args,
                            block_reason: None,
                            override_result: Some(result),
                        };
                    }
                    if let Some(args) = outcome.modified_args {
                        current.args = args;
                    }
                }
                Err(e) => {
                    warn!("before-hook '{}' failed, skipping: {}", hook.name(), e);
                }
            }
        }

        BeforeDecision {
            proceed: true,
            args: current.args,
            block_reason: None,
            override_result: None,
        }
    }

    /// Run the after-chain, composing result modifications and merging
    /// metadata from every hook.
    pub async fn execute_after(&self, ctx: AfterContext) -> AfterDecision {
        let chain: Vec<_> = self
            .after
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        let mut current = ctx;
        let mut metadata = serde_json::Map::new();
        for hook in chain {
            match hook.run(&current).await {
                Ok(outcome) => {
                    for (k, v) in outcome.metadata {
                        metadata.insert(k, v);
                    }
                    if let Some(result) = outcome.modified_result {
                        current.is_error = result.is_error();
                        current.result = result;
                    }
                }
                Err(e) => {
                    warn!("after-hook '{}' failed, skipping: {}", hook.name(), e);
                }
            }
        }

        AfterDecision {
            result: current.result,
            metadata,
        }
    }
}
