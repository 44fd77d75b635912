//! Tool scheduler - parallelizable-aware dispatch with ordered results
//!
//! A batch is partitioned into the parallelizable subset (runs
//! concurrently on the shared parallel lane) and the serial rest (runs in
//! original order, after the parallel subset completes). Results come back
//! in the original batch order regardless of completion order.
//!
//! Tools that mutate external ordered state need happens-before ordering
//! relative to each other; read-only or independent tools can overlap.

use crate::approval::ApprovalManager;
use crate::classify::classify;
use crate::hooks::{AfterContext, BeforeContext, ToolHooks};
use crate::lane::{LaneManager, PARALLEL_LANE};
use crate::registry::ToolRegistry;
use crate::tool::ToolContext;
use crate::validate::validate_input;
use capstan_core::{
    AgentEvent, ApprovalError, EventBus, LaneError, ToolCall, ToolErrorCode,
    ToolInvocationResult,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Tool results fed back to the model are capped at this many chars.
const RESULT_CHAR_CAP: usize = 50_000;

pub struct SchedulerBuilder {
    registry: Arc<ToolRegistry>,
    hooks: Arc<ToolHooks>,
    approvals: Arc<ApprovalManager>,
    lanes: Arc<LaneManager>,
    bus: EventBus,
    default_timeout: Duration,
    workspace_root: Option<PathBuf>,
}

impl SchedulerBuilder {
    pub fn new(
        registry: Arc<ToolRegistry>,
        approvals: Arc<ApprovalManager>,
        bus: EventBus,
    ) -> Self {
        Self {
            registry,
            hooks: Arc::new(ToolHooks::new()),
            approvals,
            lanes: Arc::new(LaneManager::new(Some(bus.clone()))),
            bus,
            default_timeout: Duration::from_secs(120),
            workspace_root: None,
        }
    }

    pub fn hooks(mut self, hooks: Arc<ToolHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn lanes(mut self, lanes: Arc<LaneManager>) -> Self {
        self.lanes = lanes;
        self
    }

    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn workspace_root(mut self, root: PathBuf) -> Self {
        self.workspace_root = Some(root);
        self
    }

    pub fn build(self) -> ToolScheduler {
        ToolScheduler {
            inner: Arc::new(SchedulerInner {
                registry: self.registry,
                hooks: self.hooks,
                approvals: self.approvals,
                lanes: self.lanes,
                bus: self.bus,
                default_timeout: self.default_timeout,
                workspace_root: self.workspace_root,
            }),
        }
    }
}

struct SchedulerInner {
    registry: Arc<ToolRegistry>,
    hooks: Arc<ToolHooks>,
    approvals: Arc<ApprovalManager>,
    lanes: Arc<LaneManager>,
    bus: EventBus,
    default_timeout: Duration,
    workspace_root: Option<PathBuf>,
}

#[derive(Clone)]
pub struct ToolScheduler {
    inner: Arc<SchedulerInner>,
}

impl ToolScheduler {
    pub fn builder(
        registry: Arc<ToolRegistry>,
        approvals: Arc<ApprovalManager>,
        bus: EventBus,
    ) -> SchedulerBuilder {
        SchedulerBuilder::new(registry, approvals, bus)
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.inner.registry
    }

    pub fn lanes(&self) -> &Arc<LaneManager> {
        &self.inner.lanes
    }

    /// Execute a batch of approved-for-dispatch tool calls. Results are in
    /// the input batch order.
    pub async fn execute_batch(
        &self,
        calls: Vec<ToolCall>,
        ctx: &ToolContext,
    ) -> Vec<ToolInvocationResult> {
        let total = calls.len();
        let mut slots: Vec<Option<ToolInvocationResult>> = Vec::with_capacity(total);
        slots.resize_with(total, || None);

        let mut parallel = Vec::new();
        let mut serial = Vec::new();
        for (index, call) in calls.into_iter().enumerate() {
            let parallelizable = self
                .inner
                .registry
                .get(&call.name)
                .map(|t| t.parallelizable())
                .unwrap_or(true);
            if parallelizable {
                parallel.push((index, call));
            } else {
                serial.push((index, call));
            }
        }
        debug!(
            "tool batch: {} parallel, {} serial",
            parallel.len(),
            serial.len()
        );

        // Phase 1: the parallelizable subset, concurrently.
        let mut receipts = Vec::new();
        for (index, call) in parallel {
            let inner = self.inner.clone();
            let ctx = ctx.clone();
            let name = call.name.clone();
            match self.inner.lanes.parallel_lane().submit(&name, move || {
                let inner = inner.clone();
                let call = call.clone();
                let ctx = ctx.clone();
                async move { Ok::<_, String>(run_call(inner, call, ctx).await) }
            }) {
                Ok(receipt) => receipts.push((index, receipt)),
                Err(e) => slots[index] = Some(lane_failure(&name, e)),
            }
        }
        for (index, receipt) in receipts {
            let result = receipt
                .wait(PARALLEL_LANE)
                .await
                .unwrap_or_else(|e| lane_failure("parallel task", e));
            slots[index] = Some(result);
        }

        // Phase 2: the serial rest, strictly in original order. A tool may
        // nominate a named lane for ordering that spans turns and sessions.
        for (index, call) in serial {
            let lane_hint = self
                .inner
                .registry
                .get(&call.name)
                .and_then(|t| t.lane_hint().map(String::from));
            let result = match lane_hint {
                Some(lane_id) => {
                    let inner = self.inner.clone();
                    let ctx = ctx.clone();
                    let name = call.name.clone();
                    let submitted = self.inner.lanes.lane(&lane_id).submit(&name, move || {
                        let inner = inner.clone();
                        let call = call.clone();
                        let ctx = ctx.clone();
                        async move { Ok::<_, String>(run_call(inner, call, ctx).await) }
                    });
                    match submitted {
                        Ok(receipt) => receipt
                            .wait(&lane_id)
                            .await
                            .unwrap_or_else(|e| lane_failure(&lane_id, e)),
                        Err(e) => lane_failure(&name, e),
                    }
                }
                None => run_call(self.inner.clone(), call, ctx.clone()).await,
            };
            slots[index] = Some(result);
        }

        slots
            .into_iter()
            .map(|slot| {
                slot.unwrap_or_else(|| {
                    ToolInvocationResult::fail(ToolErrorCode::Execution, "result slot unfilled")
                })
            })
            .collect()
    }
}

fn lane_failure(context: &str, err: LaneError) -> ToolInvocationResult {
    let code = match err {
        LaneError::QueueFull { .. } => ToolErrorCode::Execution,
        LaneError::Timeout { .. } => ToolErrorCode::Timeout,
        _ => ToolErrorCode::Execution,
    };
    warn!("lane dispatch failed for {}: {}", context, err);
    ToolInvocationResult::fail(code, err.to_string())
}

/// The per-call pipeline: classify, before-hooks, approval, validation,
/// timeout-wrapped execution, after-hooks, events.
async fn run_call(
    inner: Arc<SchedulerInner>,
    call: ToolCall,
    ctx: ToolContext,
) -> ToolInvocationResult {
    let started = Instant::now();
    let tool = inner.registry.get(&call.name);

    // Classification always runs, for the audit trail, even when the trust
    // mode bypasses the gate.
    let classification = classify(tool.as_ref(), &call.name, &call.input);
    debug!(
        tool = %call.name,
        risk = %classification.risk_level,
        approval = classification.requires_approval,
        "classified tool call"
    );

    let Some(tool) = tool else {
        return ToolInvocationResult::fail(
            ToolErrorCode::NotFound,
            format!("tool not found: {}", call.name),
        )
        .with_meta(&call.name, started.elapsed().as_millis() as u64);
    };

    if ctx.cancel.is_cancelled() {
        return ToolInvocationResult::fail(ToolErrorCode::Cancelled, "cancelled")
            .with_meta(&call.name, 0);
    }

    // Before-hooks may rewrite args, block, or answer outright.
    let decision = inner
        .hooks
        .execute_before(BeforeContext {
            tool_name: call.name.clone(),
            tool_id: call.id.clone(),
            args: call.input.clone(),
            session_id: ctx.session_id.clone(),
        })
        .await;
    if !decision.proceed {
        let reason = decision
            .block_reason
            .unwrap_or_else(|| "blocked by hook".into());
        return ToolInvocationResult::fail(ToolErrorCode::PermissionDenied, reason)
            .with_meta(&call.name, started.elapsed().as_millis() as u64);
    }
    if let Some(result) = decision.override_result {
        return result.with_meta(&call.name, started.elapsed().as_millis() as u64);
    }
    let args = decision.args;

    // The approval gate. Denied or timed out means the tool is never
    // executed; the model sees a synthetic failure it can react to.
    match inner
        .approvals
        .request_approval(&call.name, &args, &classification, &ctx.session_id)
        .await
    {
        Ok(()) => {}
        Err(ApprovalError::Denied { reason }) => {
            return ToolInvocationResult::fail(ToolErrorCode::ApprovalDenied, reason)
                .with_meta(&call.name, started.elapsed().as_millis() as u64);
        }
        Err(ApprovalError::Timeout) => {
            return ToolInvocationResult::fail(ToolErrorCode::ApprovalTimeout, "approval_timeout")
                .with_meta(&call.name, started.elapsed().as_millis() as u64);
        }
    }

    let args = match validate_input(&tool, args, inner.workspace_root.as_deref()) {
        Ok(args) => args,
        Err(e) => {
            return ToolInvocationResult::fail(e.code(), e.to_string())
                .with_meta(&call.name, started.elapsed().as_millis() as u64);
        }
    };

    inner.bus.emit_with_run(
        ctx.run_id.clone(),
        AgentEvent::ToolBefore {
            tool_id: call.id.clone(),
            name: call.name.clone(),
        },
    );
    inner.bus.emit_with_run(
        ctx.run_id.clone(),
        AgentEvent::ToolExecutionStart {
            tool_id: call.id.clone(),
            name: call.name.clone(),
        },
    );

    let timeout = ctx.timeout.unwrap_or(inner.default_timeout);
    let child_cancel = ctx.cancel.child_token();
    let exec_ctx = ToolContext {
        session_id: ctx.session_id.clone(),
        run_id: ctx.run_id.clone(),
        cancel: child_cancel.clone(),
        timeout: Some(timeout),
    };

    let result = match tokio::time::timeout(
        timeout,
        tool.execute_cancellable(args.clone(), &exec_ctx),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => {
            child_cancel.cancel();
            ToolInvocationResult::fail(
                ToolErrorCode::Timeout,
                format!("tool timed out after {}ms", timeout.as_millis()),
            )
        }
    };
    let duration = started.elapsed();

    let decision = inner
        .hooks
        .execute_after(AfterContext {
            tool_name: call.name.clone(),
            tool_id: call.id.clone(),
            args,
            session_id: ctx.session_id.clone(),
            is_error: result.is_error(),
            result,
            duration,
        })
        .await;

    let result = truncate_result(decision.result)
        .with_meta(&call.name, duration.as_millis() as u64);

    if result.is_error() {
        inner.bus.emit_with_run(
            ctx.run_id.clone(),
            AgentEvent::ToolErrored {
                tool_id: call.id.clone(),
                name: call.name.clone(),
                message: result
                    .error
                    .as_ref()
                    .map(|e| e.message.clone())
                    .unwrap_or_default(),
            },
        );
    } else {
        inner.bus.emit_with_run(
            ctx.run_id.clone(),
            AgentEvent::ToolAfter {
                tool_id: call.id.clone(),
                name: call.name.clone(),
                duration_ms: duration.as_millis() as u64,
            },
        );
    }
    inner.bus.emit_with_run(
        ctx.run_id.clone(),
        AgentEvent::ToolExecutionEnd {
            tool_id: call.id,
            name: call.name,
            success: result.success,
            duration_ms: duration.as_millis() as u64,
        },
    );

    result
}

fn truncate_result(mut result: ToolInvocationResult) -> ToolInvocationResult {
    if let serde_json::Value::String(ref s) = result.output {
        if s.len() > RESULT_CHAR_CAP {
            let mut cut = RESULT_CHAR_CAP;
            while !s.is_char_boundary(cut) {
                cut -= 1;
            }
            let truncated = format!("{}...\n[truncated, {} total chars]", &s[..cut], s.len());
            result.output = serde_json::Value::String(truncated);
        }
    }
    result
}
