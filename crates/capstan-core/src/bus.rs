//! Typed publish/subscribe hub for lifecycle and streaming events
//!
//! Handlers run synchronously in registration order. A panicking handler is
//! logged and the remaining handlers still run. Handlers needing async work
//! schedule it themselves (e.g. `tokio::spawn`); emit never awaits.

use crate::types::{MessageId, RiskLevel, RunId, SessionId, StopReason, Usage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{error, warn};

pub const DEFAULT_MAX_LISTENERS: usize = 50;

/// Why a compaction pass ran.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CompactionReason {
    ContextOverflow,
    ThresholdReached,
    Manual,
}

/// Every event the core emits.
#[derive(Clone, Debug)]
pub enum AgentEvent {
    // Streaming lifecycle
    AgentStart {
        session_id: SessionId,
    },
    AgentEnd {
        session_id: SessionId,
        stop_reason: StopReason,
    },
    MessageStart {
        message_id: MessageId,
    },
    MessageUpdate {
        message_id: MessageId,
        delta: String,
        accumulated: String,
    },
    MessageEnd {
        message_id: MessageId,
        content: String,
        stop_reason: StopReason,
        usage: Option<Usage>,
    },
    ToolExecutionStart {
        tool_id: String,
        name: String,
    },
    ToolExecutionUpdate {
        tool_id: String,
        progress: String,
    },
    ToolExecutionEnd {
        tool_id: String,
        name: String,
        success: bool,
        duration_ms: u64,
    },
    AutoCompactionStart {
        reason: CompactionReason,
        used_tokens: usize,
        max_tokens: usize,
    },
    AutoCompactionEnd {
        reason: CompactionReason,
        used_tokens: usize,
        max_tokens: usize,
    },
    Error {
        message: String,
        recoverable: bool,
    },

    // Coarser domain events
    ToolBefore {
        tool_id: String,
        name: String,
    },
    ToolAfter {
        tool_id: String,
        name: String,
        duration_ms: u64,
    },
    ToolErrored {
        tool_id: String,
        name: String,
        message: String,
    },
    SessionStart {
        session_id: SessionId,
    },
    SessionEnd {
        session_id: SessionId,
    },
    SessionCompress {
        session_id: SessionId,
    },
    UserMessage {
        session_id: SessionId,
        message_id: MessageId,
    },
    AssistantMessage {
        session_id: SessionId,
        message_id: MessageId,
    },
    MemorySaved {
        session_id: SessionId,
    },
    AgentIdle {
        session_id: SessionId,
    },
    ApprovalRequested {
        request_id: String,
        tool_name: String,
        risk: RiskLevel,
    },
    ApprovalResolved {
        request_id: String,
        approved: bool,
        reason: Option<String>,
    },
    Suggestion {
        task_id: String,
        text: String,
    },
    LaneTaskError {
        lane: String,
        task_name: String,
        message: String,
    },
}

impl AgentEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            AgentEvent::AgentStart { .. } => EventKind::AgentStart,
            AgentEvent::AgentEnd { .. } => EventKind::AgentEnd,
            AgentEvent::MessageStart { .. } => EventKind::MessageStart,
            AgentEvent::MessageUpdate { .. } => EventKind::MessageUpdate,
            AgentEvent::MessageEnd { .. } => EventKind::MessageEnd,
            AgentEvent::ToolExecutionStart { .. } => EventKind::ToolExecutionStart,
            AgentEvent::ToolExecutionUpdate { .. } => EventKind::ToolExecutionUpdate,
            AgentEvent::ToolExecutionEnd { .. } => EventKind::ToolExecutionEnd,
            AgentEvent::AutoCompactionStart { .. } => EventKind::AutoCompactionStart,
            AgentEvent::AutoCompactionEnd { .. } => EventKind::AutoCompactionEnd,
            AgentEvent::Error { .. } => EventKind::Error,
            AgentEvent::ToolBefore { .. } => EventKind::ToolBefore,
            AgentEvent::ToolAfter { .. } => EventKind::ToolAfter,
            AgentEvent::ToolErrored { .. } => EventKind::ToolErrored,
            AgentEvent::SessionStart { .. } => EventKind::SessionStart,
            AgentEvent::SessionEnd { .. } => EventKind::SessionEnd,
            AgentEvent::SessionCompress { .. } => EventKind::SessionCompress,
            AgentEvent::UserMessage { .. } => EventKind::UserMessage,
            AgentEvent::AssistantMessage { .. } => EventKind::AssistantMessage,
            AgentEvent::MemorySaved { .. } => EventKind::MemorySaved,
            AgentEvent::AgentIdle { .. } => EventKind::AgentIdle,
            AgentEvent::ApprovalRequested { .. } => EventKind::ApprovalRequested,
            AgentEvent::ApprovalResolved { .. } => EventKind::ApprovalResolved,
            AgentEvent::Suggestion { .. } => EventKind::Suggestion,
            AgentEvent::LaneTaskError { .. } => EventKind::LaneTaskError,
        }
    }
}

/// Event discriminant used as the subscription key.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum EventKind {
    AgentStart,
    AgentEnd,
    MessageStart,
    MessageUpdate,
    MessageEnd,
    ToolExecutionStart,
    ToolExecutionUpdate,
    ToolExecutionEnd,
    AutoCompactionStart,
    AutoCompactionEnd,
    Error,
    ToolBefore,
    ToolAfter,
    ToolErrored,
    SessionStart,
    SessionEnd,
    SessionCompress,
    UserMessage,
    AssistantMessage,
    MemorySaved,
    AgentIdle,
    ApprovalRequested,
    ApprovalResolved,
    Suggestion,
    LaneTaskError,
    /// Wildcard: receives every emission.
    Any,
}

/// An emitted event with its envelope.
#[derive(Clone, Debug)]
pub struct EventEnvelope {
    pub timestamp: DateTime<Utc>,
    pub run_id: Option<RunId>,
    pub event: AgentEvent,
}

type Handler = Arc<dyn Fn(&EventEnvelope) + Send + Sync>;

struct BusInner {
    handlers: RwLock<HashMap<EventKind, Vec<(u64, Handler)>>>,
    next_id: AtomicU64,
    max_listeners: usize,
}

/// Process-wide event bus. Clone is cheap; clones share the handler table.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_max_listeners(DEFAULT_MAX_LISTENERS)
    }

    pub fn with_max_listeners(max_listeners: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                handlers: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                max_listeners,
            }),
        }
    }

    /// Register a handler for one event kind (or `EventKind::Any` for all).
    /// The returned subscription is the disposer.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&EventEnvelope) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let mut handlers = self.inner.handlers.write().unwrap_or_else(|e| e.into_inner());
        let list = handlers.entry(kind).or_default();
        list.push((id, Arc::new(handler)));
        let total: usize = handlers.values().map(Vec::len).sum();
        if total > self.inner.max_listeners {
            warn!(
                "event bus has {} listeners (max {}): possible leak",
                total, self.inner.max_listeners
            );
        }
        drop(handlers);
        Subscription {
            bus: Arc::downgrade(&self.inner),
            kind,
            id,
        }
    }

    /// Emit to the kind's handlers, then wildcard handlers, in registration
    /// order. Handler panics are isolated and logged.
    pub fn emit(&self, event: AgentEvent) {
        self.emit_enveloped(None, event);
    }

    pub fn emit_with_run(&self, run_id: RunId, event: AgentEvent) {
        self.emit_enveloped(Some(run_id), event);
    }

    fn emit_enveloped(&self, run_id: Option<RunId>, event: AgentEvent) {
        let envelope = EventEnvelope {
            timestamp: Utc::now(),
            run_id,
            event,
        };
        let kind = envelope.event.kind();
        let selected: Vec<Handler> = {
            let handlers = self.inner.handlers.read().unwrap_or_else(|e| e.into_inner());
            let mut out = Vec::new();
            if let Some(list) = handlers.get(&kind) {
                out.extend(list.iter().map(|(_, h)| h.clone()));
            }
            if kind != EventKind::Any {
                if let Some(list) = handlers.get(&EventKind::Any) {
                    out.extend(list.iter().map(|(_, h)| h.clone()));
                }
            }
            out
        };
        for handler in selected {
            if catch_unwind(AssertUnwindSafe(|| handler(&envelope))).is_err() {
                error!("event handler panicked on {:?}", kind);
            }
        }
    }

    /// Number of registered handlers across all kinds.
    pub fn listener_count(&self) -> usize {
        self.inner
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(Vec::len)
            .sum()
    }
}

/// Disposer for a subscription. Call `cancel()` to unsubscribe; dropping
/// without cancelling leaves the handler registered.
pub struct Subscription {
    bus: std::sync::Weak<BusInner>,
    kind: EventKind,
    id: u64,
}

impl Subscription {
    pub fn cancel(self) {
        if let Some(inner) = self.bus.upgrade() {
            let mut handlers = inner.handlers.write().unwrap_or_else(|e| e.into_inner());
            if let Some(list) = handlers.get_mut(&self.kind) {
                list.retain(|(id, _)| *id != self.id);
            }
        }
    }
}
