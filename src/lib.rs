// src/lib.rs

pub mod cli;
pub mod config;
pub mod errors;
pub mod exec;
pub mod http;
pub mod logging;
pub mod query;
pub mod registry;
pub mod scheduler;
pub mod store;
pub mod task;
pub mod types;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cli::CliArgs;
use crate::config::{ConfigFile, load_effective};
use crate::exec::{RealExecutor, TaskExecutor};
use crate::http::AppState;
use crate::registry::{FileJournal, TaskRegistry};
use crate::scheduler::Dispatcher;
use crate::store::ResultStore;

/// A running service: store, registry and worker pool wired together.
pub struct Service {
    dispatcher: Arc<Dispatcher>,
    journal_writer: Option<JoinHandle<()>>,
}

impl Service {
    /// Build the service with the production executor.
    pub async fn start(cfg: &ConfigFile) -> Result<Self> {
        let executor = RealExecutor::new(cfg.exec_settings())?;
        Self::start_with_executor(cfg, Arc::new(executor)).await
    }

    /// Build the service around any executor.
    pub async fn start_with_executor(
        cfg: &ConfigFile,
        executor: Arc<dyn TaskExecutor>,
    ) -> Result<Self> {
        let store = ResultStore::new(&cfg.store.root);
        store
            .init()
            .await
            .with_context(|| format!("creating store root {}", cfg.store.root.display()))?;

        let options = cfg.registry_options();
        let (registry, journal_writer) = match cfg.store.journal {
            Some(ref path) => {
                let tasks = FileJournal::load(path)?;
                FileJournal::compact(path, &tasks)?;
                let (journal, writer) = FileJournal::spawn(path)?;
                let registry = TaskRegistry::restore(options, Arc::new(journal), tasks);
                (registry, Some(writer))
            }
            None => {
                debug!("no journal configured; task history is kept in memory only");
                (TaskRegistry::in_memory(options), None)
            }
        };

        let dispatcher = Dispatcher::start(
            Arc::new(registry),
            store,
            executor,
            cfg.policy.clone(),
            cfg.dispatch_options(),
        );

        Ok(Self {
            dispatcher: Arc::new(dispatcher),
            journal_writer,
        })
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn app_state(&self) -> AppState {
        AppState::new(Arc::clone(&self.dispatcher))
    }

    /// Stop the worker pool and flush the journal.
    pub async fn shutdown(self) {
        self.dispatcher.shutdown().await;
        drop(self.dispatcher);

        if let Some(writer) = self.journal_writer {
            match tokio::time::timeout(Duration::from_secs(5), writer).await {
                Ok(Ok(())) => debug!("journal flushed"),
                Ok(Err(e)) => warn!(error = %e, "journal writer failed"),
                Err(_) => warn!("journal writer still busy; giving up waiting"),
            }
        }
    }
}

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - config loading (file + CLI overrides)
/// - result store, registry and journal
/// - worker pool
/// - HTTP server
/// - Ctrl-C / SIGTERM handling
pub async fn run(args: CliArgs) -> Result<()> {
    let cfg = load_effective(args.config.as_deref(), &args.overrides())?;

    if args.dry_run {
        print_dry_run(&cfg);
        return Ok(());
    }

    info!(version = env!("CARGO_PKG_VERSION"), "taskforge starting");
    let service = Service::start(&cfg).await?;

    let listener = TcpListener::bind(cfg.bind)
        .await
        .with_context(|| format!("binding {}", cfg.bind))?;
    let served = http::serve(listener, service.app_state(), shutdown_signal()).await;

    service.shutdown().await;
    info!("taskforge stopped");
    served
}

/// Resolves when SIGINT (Ctrl-C) or SIGTERM is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received; starting graceful shutdown");
}

/// Simple dry-run output: print the effective configuration.
fn print_dry_run(cfg: &ConfigFile) {
    println!("taskforge dry-run");
    println!("  server.bind = {}", cfg.bind);
    println!("  service.max_concurrency = {}", cfg.service.max_concurrency);
    println!("  service.backlog_limit = {}", cfg.service.backlog_limit);
    println!("  service.grace_period = {:?}", cfg.service.grace_period);
    println!("  service.retry_after = {:?}", cfg.service.retry_after);
    println!("  service.max_output_bytes = {}", cfg.service.max_output_bytes);
    println!("  service.max_page_size = {}", cfg.service.max_page_size);
    println!();

    println!("timeouts:");
    println!("  url_download = {:?}", cfg.timeouts.url_download);
    println!("  bulk_scrape = {:?}", cfg.timeouts.bulk_scrape);
    println!("  shell_command = {:?}", cfg.timeouts.shell_command);
    println!();

    println!("store:");
    println!("  root = {}", cfg.store.root.display());
    match cfg.store.journal {
        Some(ref journal) => println!("  journal = {}", journal.display()),
        None => println!("  journal = (memory only)"),
    }
    println!();

    println!("download:");
    println!("  user_agent = {}", cfg.download.user_agent);
    if let Some(max) = cfg.download.max_download_bytes {
        println!("  max_download_bytes = {max}");
    }
    println!("  max_targets = {}", cfg.download.max_targets);
    println!("  max_pages = {}", cfg.download.max_pages);
    println!("  scrape_parallelism = {}", cfg.download.scrape_parallelism);
    println!();

    println!("policy:");
    println!("  allow_shell = {}", cfg.policy.allow_shell);
    for re in &cfg.policy.command_allowlist {
        println!("  command_allowlist: {re}");
    }
    for dir in &cfg.policy.allowed_working_dirs {
        println!("  allowed_working_dir: {}", dir.display());
    }

    debug!("dry-run complete (nothing started)");
}
