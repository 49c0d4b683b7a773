// src/scheduler/worker.rs

//! Worker loop: claim the oldest pending task, run it, record the outcome.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use futures::FutureExt;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::errors::ServiceError;
use crate::exec::{OutputSink, RunContext, RunOutcome};
use crate::registry::TransitionFields;
use crate::task::{FailureReason, TaskError};
use crate::types::{TaskId, TaskStatus};

use super::Shared;

pub(super) async fn worker_loop(shared: Arc<Shared>, index: usize) {
    debug!(worker = index, "worker started");

    loop {
        // Register interest before looking at the queue so a submission
        // between the check and the wait is not missed.
        let notified = shared.wakeup.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if shared.shutdown.is_cancelled() {
            break;
        }

        let next = shared.queue().pop();
        match next {
            Some(id) => run_one(&shared, id, index).await,
            None => {
                tokio::select! {
                    _ = &mut notified => {}
                    _ = shared.shutdown.cancelled() => break,
                }
            }
        }
    }

    debug!(worker = index, "worker finished");
}

async fn run_one(shared: &Shared, id: TaskId, worker: usize) {
    let token = shared.shutdown.child_token();
    shared.active().insert(id, token.clone());

    let task = match shared.registry.transition(
        &id,
        TaskStatus::Pending,
        TaskStatus::Running,
        TransitionFields::none(),
    ) {
        Ok(task) => task,
        Err(e) => {
            shared.active().remove(&id);
            match e {
                ServiceError::StaleTransition { actual, .. } => {
                    debug!(task_id = %id, %actual, "task left pending before it was claimed; skipping");
                }
                ServiceError::NotFound(_) => debug!(task_id = %id, "queued task vanished; skipping"),
                other => error!(task_id = %id, error = %other, "failed to claim task"),
            }
            return;
        }
    };

    let now_running = shared.running.fetch_add(1, Ordering::SeqCst) + 1;
    shared.peak_running.fetch_max(now_running, Ordering::SeqCst);

    let kind = task.kind();
    let timeout = shared.options.timeouts.for_kind(kind);
    info!(task_id = %id, %kind, worker, timeout = ?timeout, "task started");

    let ctx = RunContext {
        task_id: id,
        parameters: task.parameters.clone(),
        sink: OutputSink::new(Arc::clone(&shared.registry), id),
        store: shared.store.clone(),
        cancel: token,
        deadline: Instant::now() + timeout,
        timeout,
        grace_period: shared.options.grace_period,
    };

    let executor = Arc::clone(&shared.executor);
    let outcome = AssertUnwindSafe(async move { executor.execute(ctx).await })
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| {
            let message = panic_message(panic.as_ref());
            error!(task_id = %id, %message, "executor panicked");
            RunOutcome::Failed(TaskError::new(
                FailureReason::Internal,
                format!("executor panicked: {message}"),
            ))
        });

    {
        // A concurrent cancel either finds the token or reads the final status.
        let mut active = shared.active();
        record_outcome(shared, &id, outcome);
        active.remove(&id);
    }
    shared.running.fetch_sub(1, Ordering::SeqCst);
}

fn record_outcome(shared: &Shared, id: &TaskId, outcome: RunOutcome) {
    let (status, fields) = match outcome {
        RunOutcome::Completed {
            exit_code,
            artifacts,
            progress,
        } => (
            TaskStatus::Completed,
            TransitionFields {
                exit_code,
                artifacts,
                progress,
                error: None,
            },
        ),
        RunOutcome::Failed(err) => (TaskStatus::Failed, TransitionFields::failed(err)),
        RunOutcome::Cancelled => (TaskStatus::Cancelled, TransitionFields::none()),
    };

    for attempt in 0..2 {
        match shared
            .registry
            .transition(id, TaskStatus::Running, status, fields.clone())
        {
            Ok(task) => {
                let reason = task.error.as_ref().map(|e| e.reason);
                info!(
                    task_id = %id,
                    kind = %task.kind(),
                    status = %task.status,
                    exit_code = ?task.exit_code,
                    reason = ?reason,
                    "task finished"
                );
                return;
            }
            Err(ServiceError::StaleTransition { actual, .. }) if attempt == 0 => {
                // Only the owning worker moves a task out of `running`.
                error!(task_id = %id, %actual, "stale transition recording outcome; re-reading");
                match shared.registry.status(id) {
                    Ok(TaskStatus::Running) => continue,
                    Ok(other) => {
                        warn!(task_id = %id, status = %other, "outcome dropped; task already terminal");
                        return;
                    }
                    Err(e) => {
                        warn!(task_id = %id, error = %e, "outcome dropped");
                        return;
                    }
                }
            }
            Err(e) => {
                error!(task_id = %id, error = %e, "failed to record task outcome");
                return;
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
