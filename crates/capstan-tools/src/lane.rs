//! Named task lanes - FIFO queues with bounded concurrency
//!
//! A lane with concurrency 1 gives strict happens-before ordering: each
//! task runs to completion (or terminal failure) before the next starts.
//! Failed tasks with retry budget left are re-queued at the head. The
//! manager keeps one shared parallel lane for independent work.

use capstan_core::{AgentEvent, EventBus, LaneError};
use dashmap::DashMap;
use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, Notify, Semaphore};
use tracing::{debug, warn};

pub const PARALLEL_LANE: &str = "parallel";
pub const PARALLEL_LANE_CONCURRENCY: usize = 16;

#[derive(Clone, Debug)]
pub struct LaneConfig {
    /// 1 = strict serial.
    pub concurrency: usize,
    pub max_queue: usize,
    pub default_timeout: Duration,
}

impl Default for LaneConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            max_queue: 100,
            default_timeout: Duration::from_secs(120),
        }
    }
}

type TaskFuture = BoxFuture<'static, Result<(), String>>;

/// A queued unit of work. Built through [`Lane::submit`]; the factory may
/// run more than once when retries are configured.
pub struct Task {
    pub id: String,
    pub name: String,
    pub timeout: Option<Duration>,
    pub retries: u32,
    run: Box<dyn FnMut() -> TaskFuture + Send>,
    fail: Option<Box<dyn FnOnce(LaneError) + Send>>,
}

impl Task {
    /// Build a task from a future factory. Returns the task plus the
    /// receiver resolved exactly once with the task's outcome.
    pub fn new<T, F, Fut>(name: impl Into<String>, factory: F) -> (Self, TaskReceipt<T>)
    where
        T: Send + 'static,
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, String>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel::<Result<T, LaneError>>();
        let slot = Arc::new(Mutex::new(Some(tx)));
        let success_slot = slot.clone();

        let run = Box::new(move || {
            let fut = factory();
            let slot = success_slot.clone();
            Box::pin(async move {
                match fut.await {
                    Ok(value) => {
                        if let Some(tx) = slot.lock().unwrap_or_else(|e| e.into_inner()).take() {
                            let _ = tx.send(Ok(value));
                        }
                        Ok(())
                    }
                    Err(message) => Err(message),
                }
            }) as TaskFuture
        });

        let fail = Box::new(move |err: LaneError| {
            if let Some(tx) = slot.lock().unwrap_or_else(|e| e.into_inner()).take() {
                let _ = tx.send(Err(err));
            }
        });

        (
            Self {
                id: uuid::Uuid::new_v4().to_string(),
                name: name.into(),
                timeout: None,
                retries: 0,
                run,
                fail: Some(fail),
            },
            TaskReceipt { rx },
        )
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }
}

/// Future side of an enqueued task.
pub struct TaskReceipt<T> {
    rx: oneshot::Receiver<Result<T, LaneError>>,
}

impl<T> TaskReceipt<T> {
    /// Wait for the task to finish. A dropped lane resolves as Closed.
    pub async fn wait(self, lane: &str) -> Result<T, LaneError> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(LaneError::Closed(lane.to_string())),
        }
    }
}

struct LaneInner {
    name: String,
    config: LaneConfig,
    queue: Mutex<VecDeque<Task>>,
    running: AtomicUsize,
    closed: AtomicBool,
    notify: Notify,
    bus: Option<EventBus>,
}

#[derive(Clone)]
pub struct Lane {
    inner: Arc<LaneInner>,
}

impl Lane {
    pub fn new(name: impl Into<String>, config: LaneConfig, bus: Option<EventBus>) -> Self {
        let inner = Arc::new(LaneInner {
            name: name.into(),
            config,
            queue: Mutex::new(VecDeque::new()),
            running: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            notify: Notify::new(),
            bus,
        });
        tokio::spawn(Self::worker(inner.clone()));
        Self { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Enqueue a prepared task. Rejects immediately when the queue is at
    /// capacity, leaving the queue untouched.
    pub fn enqueue(&self, task: Task) -> Result<(), LaneError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(LaneError::Closed(self.inner.name.clone()));
        }
        {
            let mut queue = self.inner.queue.lock().unwrap_or_else(|e| e.into_inner());
            if queue.len() >= self.inner.config.max_queue {
                return Err(LaneError::QueueFull {
                    lane: self.inner.name.clone(),
                    max_queue: self.inner.config.max_queue,
                });
            }
            queue.push_back(task);
        }
        self.inner.notify.notify_one();
        Ok(())
    }

    /// Convenience: build, enqueue, and return the receipt in one call.
    pub fn submit<T, F, Fut>(&self, name: &str, factory: F) -> Result<TaskReceipt<T>, LaneError>
    where
        T: Send + 'static,
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, String>> + Send + 'static,
    {
        let (task, receipt) = Task::new(name, factory);
        self.enqueue(task)?;
        Ok(receipt)
    }

    pub fn queue_len(&self) -> usize {
        self.inner
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn running_count(&self) -> usize {
        self.inner.running.load(Ordering::Acquire)
    }

    pub fn is_idle(&self) -> bool {
        self.queue_len() == 0 && self.running_count() == 0
    }

    /// Stop the worker once the queue drains. Pending receipts for tasks
    /// never started resolve as Closed when their senders drop.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    async fn worker(inner: Arc<LaneInner>) {
        let semaphore = Arc::new(Semaphore::new(inner.config.concurrency.max(1)));
        loop {
            let task = {
                let mut queue = inner.queue.lock().unwrap_or_else(|e| e.into_inner());
                queue.pop_front()
            };

            let Some(task) = task else {
                if inner.closed.load(Ordering::Acquire) {
                    debug!("lane '{}' closed, worker exiting", inner.name);
                    break;
                }
                inner.notify.notified().await;
                continue;
            };

            // A closed semaphore is impossible here; permits are only
            // returned, never revoked.
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            inner.running.fetch_add(1, Ordering::AcqRel);

            if inner.config.concurrency <= 1 {
                Self::run_task(&inner, task).await;
                inner.running.fetch_sub(1, Ordering::AcqRel);
                drop(permit);
            } else {
                let inner_clone = inner.clone();
                tokio::spawn(async move {
                    Self::run_task(&inner_clone, task).await;
                    inner_clone.running.fetch_sub(1, Ordering::AcqRel);
                    drop(permit);
                });
            }
        }
    }

    async fn run_task(inner: &Arc<LaneInner>, mut task: Task) {
        let timeout = task.timeout.unwrap_or(inner.config.default_timeout);
        let outcome = tokio::time::timeout(timeout, (task.run)()).await;

        let failure = match outcome {
            Ok(Ok(())) => {
                debug!("lane '{}': task '{}' completed", inner.name, task.name);
                return;
            }
            Ok(Err(message)) => LaneError::Failed {
                task: task.name.clone(),
                message,
            },
            Err(_) => LaneError::Timeout {
                task: task.name.clone(),
                timeout_ms: timeout.as_millis() as u64,
            },
        };

        if task.retries > 0 {
            task.retries -= 1;
            debug!(
                "lane '{}': task '{}' failed ({}), retrying ({} left)",
                inner.name, task.name, failure, task.retries
            );
            let mut queue = inner.queue.lock().unwrap_or_else(|e| e.into_inner());
            queue.push_front(task);
            drop(queue);
            inner.notify.notify_one();
            return;
        }

        warn!(
            "lane '{}': task '{}' failed terminally: {}",
            inner.name, task.name, failure
        );
        if let Some(bus) = &inner.bus {
            bus.emit(AgentEvent::LaneTaskError {
                lane: inner.name.clone(),
                task_name: task.name.clone(),
                message: failure.to_string(),
            });
        }
        if let Some(fail) = task.fail.take() {
            fail(failure);
        }
    }
}

/// Lazily creates named lanes (serial by default) and owns the shared
/// parallel lane.
pub struct LaneManager {
    lanes: DashMap<String, Lane>,
    bus: Option<EventBus>,
    default_config: LaneConfig,
}

impl LaneManager {
    pub fn new(bus: Option<EventBus>) -> Self {
        let manager = Self {
            lanes: DashMap::new(),
            bus,
            default_config: LaneConfig::default(),
        };
        manager.lanes.insert(
            PARALLEL_LANE.to_string(),
            Lane::new(
                PARALLEL_LANE,
                LaneConfig {
                    concurrency: PARALLEL_LANE_CONCURRENCY,
                    ..LaneConfig::default()
                },
                manager.bus.clone(),
            ),
        );
        manager
    }

    /// Get or lazily create a lane (serial default config).
    pub fn lane(&self, name: &str) -> Lane {
        self.lanes
            .entry(name.to_string())
            .or_insert_with(|| Lane::new(name, self.default_config.clone(), self.bus.clone()))
            .clone()
    }

    pub fn parallel_lane(&self) -> Lane {
        self.lane(PARALLEL_LANE)
    }

    /// Enqueue into a named lane, creating it if absent.
    pub fn enqueue(&self, lane_id: &str, task: Task) -> Result<(), LaneError> {
        self.lane(lane_id).enqueue(task)
    }

    pub fn lane_names(&self) -> Vec<String> {
        self.lanes.iter().map(|e| e.key().clone()).collect()
    }

    /// Drop lanes with nothing queued and nothing running. The shared
    /// parallel lane is kept. Safe to call periodically.
    pub fn cleanup_idle_lanes(&self) -> usize {
        let mut removed = 0;
        let idle: Vec<String> = self
            .lanes
            .iter()
            .filter(|e| e.key() != PARALLEL_LANE && e.value().is_idle())
            .map(|e| e.key().clone())
            .collect();
        for name in idle {
            if let Some((_, lane)) = self.lanes.remove_if(&name, |_, lane| lane.is_idle()) {
                lane.close();
                removed += 1;
            }
        }
        removed
    }
}
