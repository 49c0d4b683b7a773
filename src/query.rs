// src/query.rs

//! Read-side API used by the HTTP layer.
//!
//! Every call reads a registry snapshot (and, for results, the store); none
//! of them waits on execution.

use std::sync::Arc;

use serde::Serialize;
use tokio::fs::File;

use crate::errors::{ServiceError, ServiceResult};
use crate::registry::{Cursor, TaskFilter, TaskPage, TaskRegistry};
use crate::store::{ArtifactRef, ResultStore};
use crate::task::{TaskError, TaskHeader};
use crate::types::{TaskId, TaskKind, TaskStatus};

/// Cheap status projection for polling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusView {
    pub id: TaskId,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub progress_summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
}

/// A window of captured output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputChunk {
    pub text: String,
    pub offset: usize,
    pub next_offset: usize,
    pub truncated: bool,
    /// No more output will be appended.
    pub complete: bool,
}

#[derive(Debug, Clone)]
pub struct StatusQuery {
    registry: Arc<TaskRegistry>,
    store: ResultStore,
}

impl StatusQuery {
    pub fn new(registry: Arc<TaskRegistry>, store: ResultStore) -> Self {
        Self { registry, store }
    }

    pub fn get_status(&self, id: &TaskId) -> ServiceResult<StatusView> {
        self.registry.view(id, |task| StatusView {
            id: task.id,
            kind: task.kind(),
            status: task.status,
            progress_summary: task.progress_summary(),
            error: task.error.clone(),
        })
    }

    /// The task record without its output text.
    pub fn get_task(&self, id: &TaskId) -> ServiceResult<TaskHeader> {
        self.registry.header(id)
    }

    pub fn list(&self, filter: &TaskFilter, limit: usize, cursor: Option<&Cursor>) -> TaskPage {
        self.registry.list(filter, limit, cursor)
    }

    /// Output from byte `offset` on; pass `next_offset` back to continue.
    pub fn get_output(&self, id: &TaskId, offset: usize) -> ServiceResult<OutputChunk> {
        let window = self.registry.output_since(id, offset)?;
        Ok(OutputChunk {
            text: window.text,
            offset: window.offset,
            next_offset: window.end,
            truncated: window.truncated,
            complete: window.terminal,
        })
    }

    /// Artifacts of a completed task.
    pub fn get_result(&self, id: &TaskId) -> ServiceResult<Vec<ArtifactRef>> {
        self.registry.view(id, |task| {
            if task.status != TaskStatus::Completed {
                return Err(ServiceError::InvalidState {
                    id: *id,
                    status: task.status,
                    reason: "results are available once the task has completed".to_string(),
                });
            }
            Ok(task.artifacts.clone())
        })?
    }

    /// Resolve and open one artifact of a completed task.
    ///
    /// Without a name the task must have exactly one artifact.
    pub async fn open_artifact(
        &self,
        id: &TaskId,
        name: Option<&str>,
    ) -> ServiceResult<(ArtifactRef, File)> {
        let artifacts = self.get_result(id)?;
        let artifact = match name {
            Some(name) => artifacts
                .into_iter()
                .find(|a| a.name == name)
                .ok_or_else(|| ServiceError::ArtifactNotFound {
                    task_id: *id,
                    name: name.to_string(),
                })?,
            None => {
                let count = artifacts.len();
                let mut iter = artifacts.into_iter();
                match (iter.next(), count) {
                    (Some(only), 1) => only,
                    (None, _) => {
                        return Err(ServiceError::ArtifactNotFound {
                            task_id: *id,
                            name: String::new(),
                        });
                    }
                    _ => {
                        return Err(ServiceError::InvalidParameters(format!(
                            "task has {count} artifacts; choose one with ?artifact=<name>"
                        )));
                    }
                }
            }
        };

        let file = self.store.get(&artifact).await?;
        Ok((artifact, file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{RegistryOptions, TransitionFields};
    use crate::store::PutMode;
    use crate::task::{ShellCommandParams, TaskParameters};

    fn setup() -> (StatusQuery, Arc<TaskRegistry>, ResultStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(TaskRegistry::in_memory(RegistryOptions::default()));
        let store = ResultStore::new(dir.path());
        let query = StatusQuery::new(Arc::clone(&registry), store.clone());
        (query, registry, store, dir)
    }

    fn shell() -> TaskParameters {
        TaskParameters::ShellCommand(ShellCommandParams {
            command: "echo".into(),
            working_dir: None,
        })
    }

    #[tokio::test]
    async fn result_is_only_available_after_completion() {
        let (query, registry, store, _dir) = setup();
        let id = registry.create(shell()).unwrap().id;
        registry
            .transition(&id, TaskStatus::Pending, TaskStatus::Running, TransitionFields::none())
            .unwrap();

        assert!(matches!(
            query.get_result(&id),
            Err(ServiceError::InvalidState { status: TaskStatus::Running, .. })
        ));

        let artifact = store.put(&id, "out.txt", b"data", PutMode::CreateNew).await.unwrap();
        registry
            .transition(
                &id,
                TaskStatus::Running,
                TaskStatus::Completed,
                TransitionFields::completed(Some(0), vec![artifact.clone()]),
            )
            .unwrap();

        assert_eq!(query.get_result(&id).unwrap(), vec![artifact.clone()]);
        let (opened, _file) = query.open_artifact(&id, None).await.unwrap();
        assert_eq!(opened, artifact);
        assert!(matches!(
            query.open_artifact(&id, Some("other.txt")).await,
            Err(ServiceError::ArtifactNotFound { .. })
        ));
    }

    #[test]
    fn output_polling_tracks_offsets() {
        let (query, registry, _store, _dir) = setup();
        let id = registry.create(shell()).unwrap().id;
        registry
            .transition(&id, TaskStatus::Pending, TaskStatus::Running, TransitionFields::none())
            .unwrap();
        registry.append_output(&id, "one\n").unwrap();

        let first = query.get_output(&id, 0).unwrap();
        assert_eq!(first.text, "one\n");
        assert!(!first.complete);

        registry.append_output(&id, "two\n").unwrap();
        let second = query.get_output(&id, first.next_offset).unwrap();
        assert_eq!(second.text, "two\n");
        assert_eq!(second.offset, 4);
        assert_eq!(second.next_offset, 8);
    }

    #[test]
    fn status_view_has_progress_summary() {
        let (query, registry, _store, _dir) = setup();
        let id = registry.create(shell()).unwrap().id;
        let view = query.get_status(&id).unwrap();
        assert_eq!(view.status, TaskStatus::Pending);
        assert_eq!(view.progress_summary, "queued");
        assert!(view.error.is_none());
    }
}
