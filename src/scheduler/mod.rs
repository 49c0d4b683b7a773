// src/scheduler/mod.rs

//! Submission, dispatch and cancellation.
//!
//! The [`Dispatcher`] owns a fixed pool of worker tasks and a bounded FIFO of
//! pending task ids. Submissions never wait for execution: they validate,
//! create the record, enqueue and return. Workers claim the oldest entry with
//! a `pending -> running` compare-and-swap, so a task that was cancelled
//! while queued is simply skipped.
//!
//! Lock order is always queue, then registry.
//!
//! - [`queue`] holds the bounded FIFO.
//! - [`worker`] contains the worker loop.
//! - [`policy`] decides which submissions may run at all.

pub mod policy;
pub mod queue;
mod worker;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::{ServiceError, ServiceResult};
use crate::exec::TaskExecutor;
use crate::registry::{TaskRegistry, TransitionFields};
use crate::store::ResultStore;
use crate::task::TaskParameters;
use crate::types::{TaskId, TaskKind, TaskStatus};

pub use policy::{ExecutionPolicy, allowlist_regex};
pub use queue::DispatchQueue;

/// Per-kind wall-clock limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KindTimeouts {
    pub url_download: Duration,
    pub bulk_scrape: Duration,
    pub shell_command: Duration,
}

impl KindTimeouts {
    pub fn for_kind(&self, kind: TaskKind) -> Duration {
        match kind {
            TaskKind::UrlDownload => self.url_download,
            TaskKind::BulkScrape => self.bulk_scrape,
            TaskKind::ShellCommand => self.shell_command,
        }
    }
}

impl Default for KindTimeouts {
    fn default() -> Self {
        Self {
            url_download: Duration::from_secs(30 * 60),
            bulk_scrape: Duration::from_secs(2 * 60 * 60),
            shell_command: Duration::from_secs(10 * 60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatchOptions {
    pub max_concurrency: usize,
    pub backlog_limit: usize,
    /// Hint returned with `Overloaded`.
    pub retry_after: Duration,
    /// Time between the polite and the forced stop of a cancelled run.
    pub grace_period: Duration,
    pub timeouts: KindTimeouts,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            backlog_limit: 64,
            retry_after: Duration::from_secs(2),
            grace_period: Duration::from_secs(5),
            timeouts: KindTimeouts::default(),
        }
    }
}

/// Result of a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The task was still pending and is now `cancelled`.
    Cancelled,
    /// The task is running; its worker will stop it and record `cancelled`.
    CancelRequested,
}

/// Snapshot of pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub running: usize,
    pub peak_running: usize,
    pub queued: usize,
    pub max_concurrency: usize,
    pub backlog_limit: usize,
    pub accepting: bool,
}

/// State shared between the dispatcher handle and its workers.
pub(crate) struct Shared {
    pub(crate) registry: Arc<TaskRegistry>,
    pub(crate) store: ResultStore,
    pub(crate) executor: Arc<dyn TaskExecutor>,
    pub(crate) policy: ExecutionPolicy,
    pub(crate) options: DispatchOptions,
    pub(crate) queue: Mutex<DispatchQueue>,
    /// Cancellation handles of claimed runs.
    pub(crate) active: Mutex<HashMap<TaskId, CancellationToken>>,
    pub(crate) wakeup: Notify,
    pub(crate) running: AtomicUsize,
    pub(crate) peak_running: AtomicUsize,
    pub(crate) accepting: AtomicBool,
    pub(crate) shutdown: CancellationToken,
}

impl Shared {
    pub(crate) fn queue(&self) -> MutexGuard<'_, DispatchQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn active(&self) -> MutexGuard<'_, HashMap<TaskId, CancellationToken>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn overloaded(&self, queued: usize) -> ServiceError {
        ServiceError::Overloaded {
            queued,
            retry_after: self.options.retry_after,
        }
    }
}

/// Handle to the worker pool.
pub struct Dispatcher {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Spawn `max_concurrency` workers. Must be called inside a Tokio runtime.
    pub fn start(
        registry: Arc<TaskRegistry>,
        store: ResultStore,
        executor: Arc<dyn TaskExecutor>,
        policy: ExecutionPolicy,
        options: DispatchOptions,
    ) -> Self {
        let pool_size = options.max_concurrency.max(1);
        let shared = Arc::new(Shared {
            registry,
            store,
            executor,
            policy,
            queue: Mutex::new(DispatchQueue::new(options.backlog_limit)),
            options: DispatchOptions {
                max_concurrency: pool_size,
                ..options
            },
            active: Mutex::new(HashMap::new()),
            wakeup: Notify::new(),
            running: AtomicUsize::new(0),
            peak_running: AtomicUsize::new(0),
            accepting: AtomicBool::new(true),
            shutdown: CancellationToken::new(),
        });

        let workers = (0..pool_size)
            .map(|index| tokio::spawn(worker::worker_loop(Arc::clone(&shared), index)))
            .collect();

        info!(
            max_concurrency = pool_size,
            backlog_limit = shared.options.backlog_limit,
            "dispatcher started"
        );

        Self {
            shared,
            workers: Mutex::new(workers),
        }
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.shared.registry
    }

    pub fn store(&self) -> &ResultStore {
        &self.shared.store
    }

    /// Accept a submission and return its id without waiting for execution.
    pub fn submit(&self, parameters: TaskParameters) -> ServiceResult<TaskId> {
        let shared = &self.shared;
        parameters.validate(&shared.registry.options().limits)?;
        shared.policy.check(&parameters)?;

        let mut queue = shared.queue();
        if !shared.accepting.load(Ordering::SeqCst) || queue.is_full() {
            let queued = queue.len();
            warn!(queued, "rejecting submission: backlog full or shutting down");
            return Err(shared.overloaded(queued));
        }

        let task = shared.registry.create(parameters)?;
        if queue.try_push(task.id).is_err() {
            // Unreachable while the queue lock is held; keep the record
            // consistent anyway.
            let _ = shared.registry.transition(
                &task.id,
                TaskStatus::Pending,
                TaskStatus::Cancelled,
                TransitionFields::none(),
            );
            return Err(shared.overloaded(queue.len()));
        }
        drop(queue);

        shared.wakeup.notify_one();
        info!(task_id = %task.id, kind = %task.kind(), summary = %task.parameters.summary(), "task submitted");
        Ok(task.id)
    }

    /// Cancel a pending or running task.
    pub fn cancel(&self, id: &TaskId) -> ServiceResult<CancelOutcome> {
        let shared = &self.shared;

        for attempt in 0..2 {
            let status = shared.registry.status(id)?;
            match status {
                TaskStatus::Pending => {
                    let mut queue = shared.queue();
                    match shared.registry.transition(
                        id,
                        TaskStatus::Pending,
                        TaskStatus::Cancelled,
                        TransitionFields::none(),
                    ) {
                        Ok(_) => {
                            queue.remove(id);
                            info!(task_id = %id, "pending task cancelled");
                            return Ok(CancelOutcome::Cancelled);
                        }
                        Err(ServiceError::StaleTransition { actual, .. }) if attempt == 0 => {
                            debug!(task_id = %id, %actual, "cancel raced with a claim; retrying");
                            continue;
                        }
                        Err(e) => return Err(e),
                    }
                }
                TaskStatus::Running => {
                    let token = shared.active().get(id).cloned();
                    match token {
                        Some(token) => {
                            token.cancel();
                            info!(task_id = %id, "cancellation requested for running task");
                            return Ok(CancelOutcome::CancelRequested);
                        }
                        None if attempt == 0 => continue,
                        None => {
                            // No token to signal: report where the task really is.
                            let status = shared.registry.status(id)?;
                            debug!(task_id = %id, %status, "no active run to signal");
                            return Err(ServiceError::InvalidState {
                                id: *id,
                                status,
                                reason: if status.is_terminal() {
                                    "task has already finished".to_string()
                                } else {
                                    "task is not held by a worker and cannot be cancelled".to_string()
                                },
                            });
                        }
                    }
                }
                terminal => {
                    return Err(ServiceError::InvalidState {
                        id: *id,
                        status: terminal,
                        reason: "task has already finished".to_string(),
                    });
                }
            }
        }

        let status = shared.registry.status(id)?;
        Err(ServiceError::InvalidState {
            id: *id,
            status,
            reason: "task changed state while cancelling".to_string(),
        })
    }

    pub fn stats(&self) -> PoolStats {
        let shared = &self.shared;
        let queue = shared.queue();
        PoolStats {
            running: shared.running.load(Ordering::SeqCst),
            peak_running: shared.peak_running.load(Ordering::SeqCst),
            queued: queue.len(),
            max_concurrency: shared.options.max_concurrency,
            backlog_limit: queue.capacity(),
            accepting: shared.accepting.load(Ordering::SeqCst),
        }
    }

    /// Stop accepting work, cancel everything in flight and wait for the
    /// workers to exit.
    pub async fn shutdown(&self) {
        let shared = &self.shared;
        shared.accepting.store(false, Ordering::SeqCst);

        let drained = {
            let mut queue = shared.queue();
            let ids = queue.drain();
            for id in &ids {
                let _ = shared.registry.transition(
                    id,
                    TaskStatus::Pending,
                    TaskStatus::Cancelled,
                    TransitionFields::none(),
                );
            }
            ids.len()
        };

        shared.shutdown.cancel();
        let handles: Vec<JoinHandle<()>> = {
            let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
            workers.drain(..).collect()
        };
        info!(cancelled_pending = drained, workers = handles.len(), "dispatcher shutting down");

        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "worker exited abnormally");
            }
        }
        info!("dispatcher stopped");
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}
