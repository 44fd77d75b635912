//! Heartbeat engine - scheduled periodic checks and suggestion heuristics
//!
//! Each registered task runs on its own interval loop until the engine
//! shuts down or the task is removed. Handler failures go to the task's
//! error callback; quiet hours suppress firing. Suggestion analysis is
//! pure heuristics - no network.

use capstan_core::{AgentEvent, EventBus, ProactiveSection};
use chrono::Timelike;
use dashmap::DashMap;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub type HeartbeatHandler =
    Arc<dyn Fn() -> BoxFuture<'static, Result<String, String>> + Send + Sync>;
pub type HeartbeatErrorCallback = Arc<dyn Fn(&str) + Send + Sync>;

pub struct HeartbeatTask {
    pub id: String,
    pub interval: Duration,
    pub enabled: bool,
    pub handler: HeartbeatHandler,
    pub on_error: Option<HeartbeatErrorCallback>,
}

impl HeartbeatTask {
    pub fn new<F, Fut>(id: impl Into<String>, interval: Duration, handler: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
    {
        Self {
            id: id.into(),
            interval,
            enabled: true,
            handler: Arc::new(move || Box::pin(handler())),
            on_error: None,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn on_error(mut self, callback: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(callback));
        self
    }
}

/// A proactive suggestion surfaced to subscribers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Suggestion {
    pub source: String,
    pub text: String,
}

struct RunningTask {
    cancel: CancellationToken,
}

pub struct HeartbeatEngine {
    tasks: DashMap<String, RunningTask>,
    bus: EventBus,
    config: ProactiveSection,
    completions: DashMap<String, u32>,
    shutdown: CancellationToken,
}

impl HeartbeatEngine {
    pub fn new(bus: EventBus, config: ProactiveSection) -> Self {
        Self {
            tasks: DashMap::new(),
            bus,
            config,
            completions: DashMap::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Register and start a periodic task.
    pub fn register(&self, task: HeartbeatTask) {
        let cancel = self.shutdown.child_token();
        let id = task.id.clone();
        if self
            .tasks
            .insert(id.clone(), RunningTask { cancel: cancel.clone() })
            .is_some()
        {
            warn!("heartbeat task '{}' replaced", id);
        }
        if !task.enabled {
            debug!("heartbeat task '{}' registered disabled", id);
            return;
        }

        let quiet = (self.config.quiet_hours_start, self.config.quiet_hours_end);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(task.interval);
            // The immediate first tick would fire at registration time.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let hour = chrono::Local::now().hour() as u8;
                if in_quiet_hours(quiet.0, quiet.1, hour) {
                    debug!("heartbeat '{}' suppressed by quiet hours", task.id);
                    continue;
                }
                match (task.handler)().await {
                    Ok(summary) => {
                        debug!("heartbeat '{}' ok: {}", task.id, summary);
                    }
                    Err(e) => {
                        warn!("heartbeat '{}' failed: {}", task.id, e);
                        if let Some(ref on_error) = task.on_error {
                            on_error(&e);
                        }
                    }
                }
            }
        });
    }

    pub fn unregister(&self, id: &str) -> bool {
        match self.tasks.remove(id) {
            Some((_, running)) => {
                running.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn task_ids(&self) -> Vec<String> {
        self.tasks.iter().map(|e| e.key().clone()).collect()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Heuristic follow-up analysis for a completed piece of work. Emits
    /// each suggestion as an event and returns them.
    pub fn analyze_task_completion(&self, description: &str, result: &str) -> Vec<Suggestion> {
        let mut suggestions = Vec::new();
        let lower_result = result.to_lowercase();
        let lower_desc = description.to_lowercase();

        if lower_result.contains("error") || lower_result.contains("failed") {
            suggestions.push(Suggestion {
                source: description.to_string(),
                text: "The last attempt reported a failure; consider retrying or \
                       investigating the error output."
                    .to_string(),
            });
        }
        if lower_result.contains("truncated") || lower_result.contains("partial") {
            suggestions.push(Suggestion {
                source: description.to_string(),
                text: "The result looks incomplete; a follow-up pass may be needed.".to_string(),
            });
        }
        if lower_desc.contains("todo") || lower_result.contains("todo") {
            suggestions.push(Suggestion {
                source: description.to_string(),
                text: "Open TODO items were mentioned; schedule them before they go stale."
                    .to_string(),
            });
        }

        // Repeated identical work suggests automation.
        let count = {
            let mut entry = self.completions.entry(lower_desc.clone()).or_insert(0);
            *entry += 1;
            *entry
        };
        if count >= self.config.repeat_threshold {
            suggestions.push(Suggestion {
                source: description.to_string(),
                text: format!(
                    "This task has run {} times; it may be worth automating on a schedule.",
                    count
                ),
            });
        }

        for suggestion in &suggestions {
            self.bus.emit(AgentEvent::Suggestion {
                task_id: suggestion.source.clone(),
                text: suggestion.text.clone(),
            });
        }
        suggestions
    }
}

/// Quiet window [start, end) in local hours, possibly wrapping midnight.
/// start == end means no quiet window.
pub fn in_quiet_hours(start: u8, end: u8, hour: u8) -> bool {
    if start == end {
        return false;
    }
    if start < end {
        hour >= start && hour < end
    } else {
        hour >= start || hour < end
    }
}
