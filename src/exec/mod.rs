// src/exec/mod.rs

//! Execution layer: runs one claimed task to a terminal outcome.
//!
//! - [`backend`] provides the `TaskExecutor` trait, the per-run
//!   `RunContext`, and `RealExecutor`, which dispatches on the task kind.
//! - [`shell`] runs shell commands with process-group termination.
//! - [`download`] and [`scrape`] stream HTTP sources into the result store
//!   through the shared helpers in [`fetch`]. Scrapes can find their
//!   targets on web pages first, see [`discover`].

pub mod backend;
pub mod discover;
pub mod download;
pub mod fetch;
pub mod scrape;
pub mod shell;

pub use backend::{
    ExecSettings, Interrupt, OutputSink, RealExecutor, RunContext, RunFuture, RunOutcome,
    TaskExecutor,
};
