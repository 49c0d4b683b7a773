use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Semaphore;
use taskforge::exec::{Interrupt, RunContext, RunFuture, RunOutcome, TaskExecutor};
use taskforge::store::PutMode;
use taskforge::task::{FailureReason, TaskError};
use taskforge::types::TaskId;

/// What the fake does with every task it is handed.
#[derive(Debug, Clone)]
pub enum FakeBehavior {
    /// Complete right away, storing a small `result.txt` artifact.
    Complete,
    /// Wait until the test releases a permit, then complete.
    Gated,
    /// Sleep for the given time, honouring cancellation and the deadline.
    Sleep(Duration),
    Fail(FailureReason),
    Panic,
}

#[derive(Debug, Default)]
struct FakeState {
    started: Mutex<Vec<TaskId>>,
    finished: Mutex<Vec<TaskId>>,
    running: AtomicUsize,
    peak: AtomicUsize,
}

/// An executor that never touches processes or the network.
///
/// - records the order in which tasks were started and finished
/// - tracks the highest number of runs in flight at once
/// - clones share state, so a test keeps one to observe and release runs
#[derive(Debug, Clone)]
pub struct FakeExecutor {
    behavior: FakeBehavior,
    state: Arc<FakeState>,
    gate: Arc<Semaphore>,
}

impl FakeExecutor {
    pub fn new(behavior: FakeBehavior) -> Self {
        Self {
            behavior,
            state: Arc::new(FakeState::default()),
            gate: Arc::new(Semaphore::new(0)),
        }
    }

    pub fn completing() -> Self {
        Self::new(FakeBehavior::Complete)
    }

    pub fn gated() -> Self {
        Self::new(FakeBehavior::Gated)
    }

    /// Let `n` gated runs finish.
    pub fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }

    pub fn started(&self) -> Vec<TaskId> {
        self.state.started.lock().unwrap().clone()
    }

    pub fn finished(&self) -> Vec<TaskId> {
        self.state.finished.lock().unwrap().clone()
    }

    pub fn running(&self) -> usize {
        self.state.running.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.state.peak.load(Ordering::SeqCst)
    }

    /// Wait until at least `n` runs have started.
    pub async fn wait_started(&self, n: usize) {
        while self.state.started.lock().unwrap().len() < n {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

impl TaskExecutor for FakeExecutor {
    fn execute(&self, ctx: RunContext) -> RunFuture {
        let behavior = self.behavior.clone();
        let state = Arc::clone(&self.state);
        let gate = Arc::clone(&self.gate);

        Box::pin(async move {
            state.started.lock().unwrap().push(ctx.task_id);
            let now = state.running.fetch_add(1, Ordering::SeqCst) + 1;
            state.peak.fetch_max(now, Ordering::SeqCst);

            let outcome = match behavior {
                FakeBehavior::Complete => complete(&ctx).await,
                FakeBehavior::Gated => {
                    tokio::select! {
                        permit = gate.acquire() => {
                            match permit {
                                Ok(p) => {
                                    p.forget();
                                    complete(&ctx).await
                                }
                                Err(_) => RunOutcome::Cancelled,
                            }
                        }
                        interrupt = ctx.interrupted() => interrupted(interrupt),
                    }
                }
                FakeBehavior::Sleep(d) => {
                    tokio::select! {
                        _ = tokio::time::sleep(d) => complete(&ctx).await,
                        interrupt = ctx.interrupted() => interrupted(interrupt),
                    }
                }
                FakeBehavior::Fail(reason) => {
                    RunOutcome::Failed(TaskError::new(reason, "fake failure"))
                }
                FakeBehavior::Panic => {
                    state.running.fetch_sub(1, Ordering::SeqCst);
                    panic!("fake executor exploded");
                }
            };

            state.running.fetch_sub(1, Ordering::SeqCst);
            state.finished.lock().unwrap().push(ctx.task_id);
            outcome
        })
    }
}

async fn complete(ctx: &RunContext) -> RunOutcome {
    ctx.sink.line("fake run done");
    match ctx
        .store
        .put(&ctx.task_id, "result.txt", b"fake result", PutMode::Replace)
        .await
    {
        Ok(artifact) => RunOutcome::completed(Some(0), vec![artifact]),
        Err(e) => RunOutcome::Failed(TaskError::new(FailureReason::WriteError, e.to_string())),
    }
}

fn interrupted(interrupt: Interrupt) -> RunOutcome {
    match interrupt {
        Interrupt::Cancelled => RunOutcome::Cancelled,
        Interrupt::TimedOut => {
            RunOutcome::Failed(TaskError::new(FailureReason::Timeout, "fake run timed out"))
        }
    }
}
