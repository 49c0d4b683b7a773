// src/registry/journal.rs

//! Persistence of task records as a JSON-lines journal.
//!
//! Every registry mutation that matters across restarts (create, status
//! transition, delete) is recorded as one line. Loading replays the lines in
//! order; the last `upsert` for an id wins and a `delete` removes it.
//!
//! Writes go through an unbounded channel to a background writer task so the
//! registry never blocks on disk while holding its lock.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::task::Task;
use crate::types::TaskId;

/// One journal line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum JournalEntry {
    Upsert { task: Box<Task> },
    Delete { id: TaskId },
}

impl JournalEntry {
    pub fn upsert(task: Task) -> Self {
        JournalEntry::Upsert { task: Box::new(task) }
    }

    pub fn delete(id: TaskId) -> Self {
        JournalEntry::Delete { id }
    }
}

/// Sink for registry mutations.
///
/// `record` is called with the registry lock held and must not block.
pub trait RegistryJournal: Send + Sync + fmt::Debug {
    fn record(&self, entry: JournalEntry);
}

/// Journal that forgets everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopJournal;

impl RegistryJournal for NoopJournal {
    fn record(&self, _entry: JournalEntry) {}
}

/// Append-only JSON-lines journal on disk.
#[derive(Debug)]
pub struct FileJournal {
    path: PathBuf,
    tx: mpsc::UnboundedSender<JournalEntry>,
}

impl FileJournal {
    /// Replay the journal at `path` into the latest record per task.
    ///
    /// A missing file yields no tasks. Lines that fail to parse are skipped
    /// with a warning; a torn last line after a crash is expected.
    pub fn load(path: &Path) -> Result<Vec<Task>> {
        let file = match fs::File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("opening journal {}", path.display()));
            }
        };

        let mut latest: HashMap<TaskId, Task> = HashMap::new();
        for (lineno, line) in BufReader::new(file).lines().enumerate() {
            let line = line.with_context(|| format!("reading journal {}", path.display()))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<JournalEntry>(&line) {
                Ok(JournalEntry::Upsert { task }) => {
                    latest.insert(task.id, *task);
                }
                Ok(JournalEntry::Delete { id }) => {
                    latest.remove(&id);
                }
                Err(e) => warn!(
                    journal = %path.display(),
                    line = lineno + 1,
                    error = %e,
                    "skipping unreadable journal line"
                ),
            }
        }

        let mut tasks: Vec<Task> = latest.into_values().collect();
        tasks.sort_by_key(|t| (t.created_at, t.id));
        info!(journal = %path.display(), tasks = tasks.len(), "journal loaded");
        Ok(tasks)
    }

    /// Rewrite the journal so it holds exactly one `upsert` per task.
    pub fn compact(path: &Path, tasks: &[Task]) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating journal directory {}", parent.display()))?;
        }

        let tmp = path.with_extension("compact");
        {
            let mut out = io::BufWriter::new(
                fs::File::create(&tmp)
                    .with_context(|| format!("creating {}", tmp.display()))?,
            );
            for task in tasks {
                let entry = JournalEntry::upsert(task.clone());
                serde_json::to_writer(&mut out, &entry)?;
                out.write_all(b"\n")?;
            }
            out.flush()?;
            out.get_ref().sync_all()?;
        }
        fs::rename(&tmp, path)
            .with_context(|| format!("replacing journal {}", path.display()))?;

        debug!(journal = %path.display(), tasks = tasks.len(), "journal compacted");
        Ok(())
    }

    /// Open the journal for appending and spawn its writer task.
    ///
    /// Must be called from within a Tokio runtime. The writer exits once the
    /// returned journal (and every clone of its sender) is dropped.
    pub fn spawn(path: &Path) -> Result<(Self, JoinHandle<()>)> {
        let (tx, mut rx) = mpsc::unbounded_channel::<JournalEntry>();
        let writer_path = path.to_path_buf();

        let handle = tokio::spawn(async move {
            let mut file = match OpenOptions::new()
                .create(true)
                .append(true)
                .open(&writer_path)
                .await
            {
                Ok(f) => f,
                Err(e) => {
                    error!(journal = %writer_path.display(), error = %e, "cannot open journal; records will be lost");
                    while rx.recv().await.is_some() {}
                    return;
                }
            };

            while let Some(entry) = rx.recv().await {
                let mut batch = Vec::new();
                push_line(&mut batch, &entry);
                while let Ok(more) = rx.try_recv() {
                    push_line(&mut batch, &more);
                }
                if let Err(e) = file.write_all(&batch).await {
                    error!(journal = %writer_path.display(), error = %e, "journal write failed");
                    continue;
                }
                if let Err(e) = file.flush().await {
                    warn!(journal = %writer_path.display(), error = %e, "journal flush failed");
                }
            }

            let _ = file.sync_all().await;
            debug!(journal = %writer_path.display(), "journal writer finished");
        });

        Ok((
            Self {
                path: path.to_path_buf(),
                tx,
            },
            handle,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn push_line(buf: &mut Vec<u8>, entry: &JournalEntry) {
    match serde_json::to_vec(entry) {
        Ok(mut line) => {
            line.push(b'\n');
            buf.extend_from_slice(&line);
        }
        Err(e) => error!(error = %e, "failed to serialise journal entry"),
    }
}

impl RegistryJournal for FileJournal {
    fn record(&self, entry: JournalEntry) {
        if self.tx.send(entry).is_err() {
            warn!(journal = %self.path.display(), "journal writer stopped; dropping record");
        }
    }
}
