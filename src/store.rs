// src/store.rs

//! Result store: durable artifacts keyed by task id.
//!
//! Layout on disk:
//!
//! `<root>/<task-id>/<artifact-name>`
//!
//! Writers stream into `<artifact-name>.part` and rename on
//! [`ArtifactWriter::finish`], so readers never observe a partial artifact.
//! The store is independent of the registry: removing a task record leaves
//! its artifacts in place.

use std::io;
use std::path::{Path, PathBuf};

use blake3::Hasher;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::errors::ServiceError;
use crate::task::validate_artifact_name;
use crate::types::TaskId;

const PART_SUFFIX: &str = ".part";

/// Reference to a stored artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub task_id: TaskId,
    pub name: String,
    pub size: u64,
    /// BLAKE3 digest (hex), known when the artifact was written by this
    /// process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

/// What to do when the artifact already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutMode {
    CreateNew,
    Replace,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("artifact '{name}' of task {task_id} already exists")]
    Conflict { task_id: TaskId, name: String },

    #[error("artifact '{name}' of task {task_id} not found")]
    NotFound { task_id: TaskId, name: String },

    #[error("invalid artifact name '{0}'")]
    InvalidName(String),

    #[error("store IO error: {0}")]
    Io(#[from] io::Error),
}

impl From<StoreError> for ServiceError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict { task_id, name } => ServiceError::Conflict { task_id, name },
            StoreError::NotFound { task_id, name } => {
                ServiceError::ArtifactNotFound { task_id, name }
            }
            StoreError::InvalidName(name) => {
                ServiceError::InvalidParameters(format!("invalid artifact name '{name}'"))
            }
            StoreError::Io(e) => ServiceError::Internal(format!("store IO error: {e}")),
        }
    }
}

/// Filesystem-backed artifact store.
#[derive(Debug, Clone)]
pub struct ResultStore {
    root: PathBuf,
}

impl ResultStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the root directory if needed.
    pub async fn init(&self) -> Result<(), StoreError> {
        fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    fn task_dir(&self, task_id: &TaskId) -> PathBuf {
        self.root.join(task_id.to_string())
    }

    fn artifact_path(&self, task_id: &TaskId, name: &str) -> Result<PathBuf, StoreError> {
        validate_artifact_name(name).map_err(|_| StoreError::InvalidName(name.to_string()))?;
        Ok(self.task_dir(task_id).join(name))
    }

    /// Start streaming a new artifact.
    pub async fn create(
        &self,
        task_id: &TaskId,
        name: &str,
        mode: PutMode,
    ) -> Result<ArtifactWriter, StoreError> {
        let path = self.artifact_path(task_id, name)?;
        if mode == PutMode::CreateNew && fs::try_exists(&path).await? {
            return Err(StoreError::Conflict {
                task_id: *task_id,
                name: name.to_string(),
            });
        }

        fs::create_dir_all(self.task_dir(task_id)).await?;
        let part_path = part_path_for(&path);

        // A second concurrent writer for the same artifact is a conflict
        // regardless of the mode.
        let file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&part_path)
            .await
        {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(StoreError::Conflict {
                    task_id: *task_id,
                    name: name.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        debug!(task_id = %task_id, artifact = %name, "artifact writer opened");

        Ok(ArtifactWriter {
            task_id: *task_id,
            name: name.to_string(),
            mode,
            final_path: path,
            part_path,
            file: Some(file),
            hasher: Hasher::new(),
            size: 0,
        })
    }

    /// Store a complete artifact from memory.
    pub async fn put(
        &self,
        task_id: &TaskId,
        name: &str,
        bytes: &[u8],
        mode: PutMode,
    ) -> Result<ArtifactRef, StoreError> {
        let mut writer = self.create(task_id, name, mode).await?;
        writer.write(bytes).await?;
        writer.finish().await
    }

    /// Open an artifact for streaming.
    pub async fn get(&self, artifact: &ArtifactRef) -> Result<File, StoreError> {
        self.open(&artifact.task_id, &artifact.name).await
    }

    pub async fn open(&self, task_id: &TaskId, name: &str) -> Result<File, StoreError> {
        let path = self.artifact_path(task_id, name)?;
        match File::open(&path).await {
            Ok(f) => Ok(f),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StoreError::NotFound {
                task_id: *task_id,
                name: name.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// List finished artifacts of a task (sorted by name).
    pub async fn list(&self, task_id: &TaskId) -> Result<Vec<ArtifactRef>, StoreError> {
        let dir = self.task_dir(task_id);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut refs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(PART_SUFFIX) {
                continue;
            }
            let meta = entry.metadata().await?;
            if meta.is_file() {
                refs.push(ArtifactRef {
                    task_id: *task_id,
                    name,
                    size: meta.len(),
                    checksum: None,
                });
            }
        }
        refs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(refs)
    }

    /// Remove a single artifact. Missing artifacts are reported as
    /// `NotFound`.
    pub async fn remove(&self, artifact: &ArtifactRef) -> Result<(), StoreError> {
        let path = self.artifact_path(&artifact.task_id, &artifact.name)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StoreError::NotFound {
                task_id: artifact.task_id,
                name: artifact.name.clone(),
            }),
            Err(e) => Err(e.into()),
        }
    }
}

fn part_path_for(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(PART_SUFFIX);
    PathBuf::from(s)
}

/// Streaming writer for one artifact.
///
/// Dropping a writer without calling [`finish`](Self::finish) discards the
/// partial file.
#[derive(Debug)]
pub struct ArtifactWriter {
    task_id: TaskId,
    name: String,
    mode: PutMode,
    final_path: PathBuf,
    part_path: PathBuf,
    file: Option<File>,
    hasher: Hasher,
    size: u64,
}

impl ArtifactWriter {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bytes written so far.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// BLAKE3 digest (hex) of everything written so far.
    pub fn checksum(&self) -> String {
        self.hasher.finalize().to_hex().to_string()
    }

    pub async fn write(&mut self, chunk: &[u8]) -> Result<(), StoreError> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::other("artifact writer already closed"))?;
        file.write_all(chunk).await?;
        self.hasher.update(chunk);
        self.size += chunk.len() as u64;
        Ok(())
    }

    /// Flush and publish the artifact under its final name.
    pub async fn finish(mut self) -> Result<ArtifactRef, StoreError> {
        let mut file = self
            .file
            .take()
            .ok_or_else(|| io::Error::other("artifact writer already closed"))?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        if self.mode == PutMode::CreateNew && fs::try_exists(&self.final_path).await? {
            let _ = fs::remove_file(&self.part_path).await;
            return Err(StoreError::Conflict {
                task_id: self.task_id,
                name: self.name.clone(),
            });
        }

        fs::rename(&self.part_path, &self.final_path).await?;
        debug!(
            task_id = %self.task_id,
            artifact = %self.name,
            size = self.size,
            "artifact stored"
        );

        Ok(ArtifactRef {
            task_id: self.task_id,
            name: self.name.clone(),
            size: self.size,
            checksum: Some(self.checksum()),
        })
    }

    /// Discard the partial artifact.
    pub async fn abort(mut self) {
        self.file.take();
        if let Err(e) = fs::remove_file(&self.part_path).await {
            warn!(artifact = %self.name, error = %e, "failed to remove partial artifact");
        }
    }
}

impl Drop for ArtifactWriter {
    fn drop(&mut self) {
        if self.file.take().is_none() {
            return;
        }
        let part = std::mem::take(&mut self.part_path);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || remove_part(&part));
            }
            Err(_) => remove_part(&part),
        }
    }
}

fn remove_part(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to remove partial artifact");
        }
    }
}
