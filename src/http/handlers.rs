// src/http/handlers.rs

use axum::Json;
use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::registry::{Cursor, TaskFilter};
use crate::scheduler::CancelOutcome;
use crate::task::TaskParameters;
use crate::types::{TaskId, TaskKind, TaskStatus};

use super::AppState;
use super::error::ApiError;
use super::schema::{
    ArtifactView, CancelResponse, HealthResponse, ListQuery, ListResponse, ManifestResponse,
    OutputQuery, ResultQuery, StatsResponse, StatusResponse, SubmitResponse, TaskView,
};
use crate::query::OutputChunk;

fn parse_id(raw: &str) -> Result<TaskId, ApiError> {
    raw.parse().map_err(ApiError::bad_request)
}

pub async fn submit_task(
    State(state): State<AppState>,
    body: Result<Json<TaskParameters>, JsonRejection>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let Json(parameters) = body?;
    let task_id = state.dispatcher.submit(parameters)?;
    Ok((StatusCode::ACCEPTED, Json(SubmitResponse { task_id })))
}

pub async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TaskView>, ApiError> {
    let id = parse_id(&id)?;
    Ok(Json(state.query.get_task(&id)?.into()))
}

pub async fn get_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<StatusResponse>, ApiError> {
    let id = parse_id(&id)?;
    Ok(Json(state.query.get_status(&id)?))
}

pub async fn list_tasks(
    State(state): State<AppState>,
    Query(q): Query<ListQuery>,
) -> Result<Json<ListResponse>, ApiError> {
    let filter = TaskFilter {
        status: q
            .status
            .as_deref()
            .map(str::parse::<TaskStatus>)
            .transpose()
            .map_err(ApiError::bad_request)?,
        kind: q
            .kind
            .as_deref()
            .map(str::parse::<TaskKind>)
            .transpose()
            .map_err(ApiError::bad_request)?,
    };
    let cursor = q
        .cursor
        .as_deref()
        .map(str::parse::<Cursor>)
        .transpose()
        .map_err(ApiError::bad_request)?;
    let limit = q.limit.unwrap_or(20);

    let page = state.query.list(&filter, limit, cursor.as_ref());
    Ok(Json(ListResponse {
        tasks: page.tasks.into_iter().map(TaskView::from).collect(),
        next_cursor: page.next_cursor.map(|c| c.to_string()),
    }))
}

pub async fn get_output(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<OutputQuery>,
) -> Result<Json<OutputChunk>, ApiError> {
    let id = parse_id(&id)?;
    Ok(Json(state.query.get_output(&id, q.offset)?))
}

/// Artifact bytes, or a JSON manifest when the task has several artifacts
/// and none was named.
pub async fn get_result(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<ResultQuery>,
) -> Result<Response, ApiError> {
    let id = parse_id(&id)?;

    if q.artifact.is_none() {
        let artifacts = state.query.get_result(&id)?;
        if artifacts.len() != 1 {
            return Ok(Json(ManifestResponse {
                task_id: id,
                artifacts: artifacts.iter().map(ArtifactView::from).collect(),
            })
            .into_response());
        }
    }

    let (artifact, file) = state.query.open_artifact(&id, q.artifact.as_deref()).await?;
    debug!(task_id = %id, artifact = %artifact.name, size = artifact.size, "streaming artifact");

    let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(artifact.size));
    if let Ok(value) =
        HeaderValue::from_str(&format!("attachment; filename=\"{}\"", artifact.name))
    {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    Ok(response)
}

pub async fn cancel_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<CancelResponse>, ApiError> {
    let id = parse_id(&id)?;
    let response = match state.dispatcher.cancel(&id)? {
        CancelOutcome::Cancelled => CancelResponse {
            status: TaskStatus::Cancelled,
            cancel_requested: false,
        },
        CancelOutcome::CancelRequested => CancelResponse {
            status: TaskStatus::Running,
            cancel_requested: true,
        },
    };
    Ok(Json(response))
}

pub async fn delete_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = parse_id(&id)?;
    state.dispatcher.registry().delete(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

pub async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        pool: state.dispatcher.stats(),
        tasks: state.dispatcher.registry().counts(),
    })
}
