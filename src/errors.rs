// src/errors.rs

//! Crate-wide error types.
//!
//! - [`TaskforgeError`] covers startup concerns (config, IO, TOML).
//! - [`ServiceError`] is the control-plane taxonomy returned synchronously by
//!   the registry, dispatcher and query layer.
//!
//! Execution failures are not part of `ServiceError`: a runner failure ends
//! up as a `failed` task with a [`TaskError`] attached.
//!
//! [`TaskError`]: crate::task::TaskError

use std::time::Duration;

use thiserror::Error;

use crate::types::{TaskId, TaskStatus};

#[derive(Error, Debug)]
pub enum TaskforgeError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, TaskforgeError>;

/// Errors surfaced by control-plane operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    /// Client input violates the kind-specific parameter contract.
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    /// The execution policy refuses this request.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The backlog is full; the caller should retry after `retry_after`.
    #[error("service overloaded ({queued} tasks queued); retry in {retry_after:?}")]
    Overloaded { queued: usize, retry_after: Duration },

    #[error("task {0} not found")]
    NotFound(TaskId),

    #[error("artifact '{name}' of task {task_id} not found")]
    ArtifactNotFound { task_id: TaskId, name: String },

    /// Operation is not valid for the task's current status.
    #[error("task {id} is {status}: {reason}")]
    InvalidState {
        id: TaskId,
        status: TaskStatus,
        reason: String,
    },

    /// A compare-and-swap transition observed a different status than
    /// expected.
    #[error("stale transition on task {id}: expected {expected}, found {actual}")]
    StaleTransition {
        id: TaskId,
        expected: TaskStatus,
        actual: TaskStatus,
    },

    /// An artifact already exists and replacement was not requested.
    #[error("artifact '{name}' of task {task_id} already exists")]
    Conflict { task_id: TaskId, name: String },

    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    /// Stable machine-readable code used on the wire.
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::InvalidParameters(_) => "invalid_parameters",
            ServiceError::Forbidden(_) => "forbidden",
            ServiceError::Overloaded { .. } => "overloaded",
            ServiceError::NotFound(_) | ServiceError::ArtifactNotFound { .. } => "not_found",
            ServiceError::InvalidState { .. } => "invalid_state",
            ServiceError::StaleTransition { .. } => "stale_transition",
            ServiceError::Conflict { .. } => "conflict",
            ServiceError::Internal(_) => "internal",
        }
    }
}

pub type ServiceResult<T> = std::result::Result<T, ServiceError>;
