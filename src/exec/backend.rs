// src/exec/backend.rs

//! Pluggable executor abstraction.
//!
//! Workers talk to a [`TaskExecutor`] instead of running operations inline.
//! Tests swap in executors that never touch processes or the network, while
//! production uses [`RealExecutor`], which dispatches on the task kind.
//!
//! An executor never returns an error: every failure is folded into a
//! [`RunOutcome`] before it leaves the runner.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::registry::TaskRegistry;
use crate::store::{ArtifactRef, ResultStore};
use crate::task::{Progress, TaskError, TaskParameters};
use crate::types::{TaskId, TaskKind};

use super::{download, scrape, shell};

/// Terminal result of one run, as reported by a runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed {
        exit_code: Option<i32>,
        artifacts: Vec<ArtifactRef>,
        progress: Option<Progress>,
    },
    Failed(TaskError),
    /// The run stopped because cancellation was requested and its resources
    /// have been released.
    Cancelled,
}

impl RunOutcome {
    pub fn completed(exit_code: Option<i32>, artifacts: Vec<ArtifactRef>) -> Self {
        RunOutcome::Completed {
            exit_code,
            artifacts,
            progress: None,
        }
    }
}

/// Why a run was interrupted before finishing on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    Cancelled,
    TimedOut,
}

/// Worker-owned handle for writing a running task's output and progress.
#[derive(Debug, Clone)]
pub struct OutputSink {
    registry: Arc<TaskRegistry>,
    task_id: TaskId,
}

impl OutputSink {
    pub fn new(registry: Arc<TaskRegistry>, task_id: TaskId) -> Self {
        Self { registry, task_id }
    }

    /// Append one line (a trailing newline is added).
    pub fn line(&self, line: &str) {
        let mut chunk = String::with_capacity(line.len() + 1);
        chunk.push_str(line);
        chunk.push('\n');
        self.append(&chunk);
    }

    pub fn append(&self, chunk: &str) {
        if let Err(e) = self.registry.append_output(&self.task_id, chunk) {
            debug!(task_id = %self.task_id, error = %e, "output dropped");
        }
    }

    pub fn progress(&self, progress: Progress) {
        if let Err(e) = self.registry.report_progress(&self.task_id, progress) {
            debug!(task_id = %self.task_id, error = %e, "progress dropped");
        }
    }
}

/// Everything a runner needs for one task.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub task_id: TaskId,
    pub parameters: TaskParameters,
    pub sink: OutputSink,
    pub store: ResultStore,
    pub cancel: CancellationToken,
    pub deadline: Instant,
    pub timeout: Duration,
    pub grace_period: Duration,
}

impl RunContext {
    pub fn kind(&self) -> TaskKind {
        self.parameters.kind()
    }

    /// Resolves when the run is cancelled or its deadline passes.
    pub async fn interrupted(&self) -> Interrupt {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Interrupt::Cancelled,
            _ = tokio::time::sleep_until(self.deadline) => Interrupt::TimedOut,
        }
    }
}

/// Boxed future returned by executors.
pub type RunFuture = Pin<Box<dyn Future<Output = RunOutcome> + Send + 'static>>;

/// Trait abstracting how a claimed task is executed.
pub trait TaskExecutor: Send + Sync + 'static {
    fn execute(&self, ctx: RunContext) -> RunFuture;
}

/// Settings shared by the production runners.
#[derive(Debug, Clone)]
pub struct ExecSettings {
    pub user_agent: String,
    pub max_download_bytes: Option<u64>,
    pub scrape_parallelism: usize,
    /// Cap on the media a scrape discovers and then fetches.
    pub max_targets: usize,
    /// Default page budget for discovery when a scrape sets none.
    pub max_pages: usize,
}

impl Default for ExecSettings {
    fn default() -> Self {
        Self {
            user_agent: concat!("taskforge/", env!("CARGO_PKG_VERSION")).to_string(),
            max_download_bytes: None,
            scrape_parallelism: 4,
            max_targets: 500,
            max_pages: 50,
        }
    }
}

/// Production executor: shell commands, downloads and scrapes.
#[derive(Debug, Clone)]
pub struct RealExecutor {
    client: reqwest::Client,
    settings: Arc<ExecSettings>,
}

impl RealExecutor {
    pub fn new(settings: ExecSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(settings.user_agent.clone())
            .connect_timeout(Duration::from_secs(30))
            .build()
            .context("building HTTP client")?;
        Ok(Self {
            client,
            settings: Arc::new(settings),
        })
    }
}

impl TaskExecutor for RealExecutor {
    fn execute(&self, ctx: RunContext) -> RunFuture {
        let client = self.client.clone();
        let settings = Arc::clone(&self.settings);

        Box::pin(async move {
            match ctx.parameters.clone() {
                TaskParameters::ShellCommand(params) => shell::run_shell(&ctx, &params).await,
                TaskParameters::UrlDownload(params) => {
                    download::run_download(&ctx, &client, &settings, &params).await
                }
                TaskParameters::BulkScrape(params) => {
                    scrape::run_scrape(&ctx, &client, &settings, &params).await
                }
            }
        })
    }
}
