// src/http/schema.rs

//! Wire shapes of the REST API (camelCase JSON).

use serde::{Deserialize, Serialize};

use crate::query::StatusView;
use crate::registry::StatusCounts;
use crate::scheduler::PoolStats;
use crate::store::ArtifactRef;
use crate::task::{Progress, TaskError, TaskHeader, TaskParameters};
use crate::types::{TaskId, TaskStatus, Timestamp};

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub task_id: TaskId,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactView {
    pub name: String,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl From<&ArtifactRef> for ArtifactView {
    fn from(a: &ArtifactRef) -> Self {
        Self {
            name: a.name.clone(),
            size: a.size,
            checksum: a.checksum.clone(),
        }
    }
}

/// Full task record minus the captured output (see the output endpoint).
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskView {
    pub id: TaskId,
    #[serde(flatten)]
    pub parameters: TaskParameters,
    pub status: TaskStatus,
    pub created_at: Timestamp,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<Progress>,
    pub progress_summary: String,
    pub artifacts: Vec<ArtifactView>,
    pub output_bytes: usize,
    pub output_truncated: bool,
}

impl From<TaskHeader> for TaskView {
    fn from(task: TaskHeader) -> Self {
        Self {
            id: task.id,
            artifacts: task.artifacts.iter().map(ArtifactView::from).collect(),
            output_bytes: task.output_bytes,
            output_truncated: task.output_truncated,
            parameters: task.parameters,
            status: task.status,
            created_at: task.created_at,
            started_at: task.started_at,
            finished_at: task.finished_at,
            error: task.error,
            exit_code: task.exit_code,
            progress: task.progress,
            progress_summary: task.progress_summary,
        }
    }
}

pub type StatusResponse = StatusView;

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
    pub kind: Option<String>,
    pub limit: Option<usize>,
    pub cursor: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResponse {
    pub tasks: Vec<TaskView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct OutputQuery {
    #[serde(default)]
    pub offset: usize,
}

#[derive(Debug, Default, Deserialize)]
pub struct ResultQuery {
    pub artifact: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestResponse {
    pub task_id: TaskId,
    pub artifacts: Vec<ArtifactView>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelResponse {
    pub status: TaskStatus,
    pub cancel_requested: bool,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    pub pool: PoolStats,
    pub tasks: StatusCounts,
}
