// src/registry/mod.rs

//! Task registry: the authoritative table of task records.
//!
//! All status changes go through [`TaskRegistry::transition`], a
//! compare-and-swap on the current status. Two actors racing to move the same
//! task out of the same status cannot both win: the loser gets
//! `StaleTransition`. Output and progress may only be written while a task is
//! `running`.
//!
//! - [`journal`] persists records so history survives restarts.

pub mod journal;

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, SubsecRound, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use ulid::{Generator, Ulid};

use crate::errors::{ServiceError, ServiceResult};
use crate::store::ArtifactRef;
use crate::task::{
    FailureReason, ParameterLimits, Progress, Task, TaskError, TaskHeader, TaskOutput, TaskParameters,
};
use crate::types::{TaskId, TaskKind, TaskStatus, Timestamp};

pub use journal::{FileJournal, JournalEntry, NoopJournal, RegistryJournal};

/// Tunables for the registry.
#[derive(Debug, Clone, Copy)]
pub struct RegistryOptions {
    pub max_output_bytes: usize,
    pub max_page_size: usize,
    pub limits: ParameterLimits,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            max_output_bytes: 1024 * 1024,
            max_page_size: 200,
            limits: ParameterLimits::default(),
        }
    }
}

/// Extra fields applied together with a status transition.
#[derive(Debug, Clone, Default)]
pub struct TransitionFields {
    pub exit_code: Option<i32>,
    pub error: Option<TaskError>,
    pub artifacts: Vec<ArtifactRef>,
    pub progress: Option<Progress>,
}

impl TransitionFields {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn failed(error: TaskError) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }

    pub fn completed(exit_code: Option<i32>, artifacts: Vec<ArtifactRef>) -> Self {
        Self {
            exit_code,
            artifacts,
            ..Self::default()
        }
    }
}

/// Optional list filter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub kind: Option<TaskKind>,
}

impl TaskFilter {
    pub fn matches(&self, task: &Task) -> bool {
        self.status.is_none_or(|s| s == task.status) && self.kind.is_none_or(|k| k == task.kind())
    }
}

/// Opaque pagination cursor: the position just after the last returned task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    created_at: Timestamp,
    id: TaskId,
}

impl Cursor {
    fn after(task: &TaskHeader) -> Self {
        Self {
            created_at: task.created_at,
            id: task.id,
        }
    }

    fn key(&self) -> (Timestamp, TaskId) {
        (self.created_at, self.id)
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.created_at.timestamp_micros(), self.id)
    }
}

impl FromStr for Cursor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (micros, id) = s
            .split_once('.')
            .ok_or_else(|| format!("invalid cursor '{s}'"))?;
        let micros: i64 = micros
            .parse()
            .map_err(|_| format!("invalid cursor '{s}'"))?;
        let created_at =
            DateTime::from_timestamp_micros(micros).ok_or_else(|| format!("invalid cursor '{s}'"))?;
        Ok(Self {
            created_at,
            id: id.parse()?,
        })
    }
}

/// One page of a listing.
#[derive(Debug, Clone)]
pub struct TaskPage {
    pub tasks: Vec<TaskHeader>,
    /// Present when more tasks follow; pass it back to continue.
    pub next_cursor: Option<Cursor>,
}

/// A slice of a task's captured output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputWindow {
    pub text: String,
    /// Byte offset where `text` starts.
    pub offset: usize,
    /// Byte offset just past the captured output.
    pub end: usize,
    pub truncated: bool,
    pub terminal: bool,
}

/// Per-status task counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

struct RegistryInner {
    tasks: HashMap<TaskId, Task>,
    /// Ascending (created_at, id); listings walk it backwards.
    order: BTreeSet<(Timestamp, TaskId)>,
    ids: Generator,
    /// Highest id ever issued or loaded. New ids must be strictly greater.
    last_issued: Option<Ulid>,
}

impl fmt::Debug for RegistryInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryInner")
            .field("tasks", &self.tasks)
            .field("order", &self.order)
            .field("last_issued", &self.last_issued)
            .finish_non_exhaustive()
    }
}

impl RegistryInner {
    fn next_id(&mut self) -> TaskId {
        let mut candidate = self.ids.generate().unwrap_or_else(|_| Ulid::new());
        if let Some(last) = self.last_issued {
            if candidate <= last {
                candidate = last.increment().unwrap_or_else(Ulid::new);
            }
        }
        self.last_issued = Some(candidate);
        TaskId::from_ulid(candidate)
    }

    fn insert(&mut self, task: Task) {
        let ulid = task.id.as_ulid();
        if self.last_issued.is_none_or(|last| ulid > last) {
            self.last_issued = Some(ulid);
        }
        self.order.insert((task.created_at, task.id));
        self.tasks.insert(task.id, task);
    }
}

/// In-memory task table with a persistence journal.
pub struct TaskRegistry {
    inner: RwLock<RegistryInner>,
    journal: Arc<dyn RegistryJournal>,
    options: RegistryOptions,
}

impl fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("tasks", &self.read().tasks.len())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl TaskRegistry {
    pub fn new(options: RegistryOptions, journal: Arc<dyn RegistryJournal>) -> Self {
        Self {
            inner: RwLock::new(RegistryInner {
                tasks: HashMap::new(),
                order: BTreeSet::new(),
                ids: Generator::new(),
                last_issued: None,
            }),
            journal,
            options,
        }
    }

    /// Registry without persistence.
    pub fn in_memory(options: RegistryOptions) -> Self {
        Self::new(options, Arc::new(NoopJournal))
    }

    /// Rebuild a registry from previously journaled records.
    ///
    /// Tasks the previous process left in flight are settled along a
    /// lifecycle edge: `pending` becomes `cancelled` (it never started) and
    /// `running` becomes `failed` with reason `interrupted`.
    pub fn restore(
        options: RegistryOptions,
        journal: Arc<dyn RegistryJournal>,
        tasks: Vec<Task>,
    ) -> Self {
        let registry = Self::new(options, journal);
        let (mut cancelled, mut interrupted) = (0usize, 0usize);
        {
            let mut inner = registry.write();
            for mut task in tasks {
                match task.status {
                    TaskStatus::Pending => {
                        settle_in_flight(&mut task, TaskStatus::Cancelled);
                        cancelled += 1;
                    }
                    TaskStatus::Running => {
                        settle_in_flight(&mut task, TaskStatus::Failed);
                        interrupted += 1;
                    }
                    _ => {
                        inner.insert(task);
                        continue;
                    }
                }
                registry.journal.record(JournalEntry::upsert(task.clone()));
                inner.insert(task);
            }
            info!(
                restored = inner.tasks.len(),
                cancelled,
                interrupted,
                "task registry restored from journal"
            );
        }
        registry
    }

    pub fn options(&self) -> &RegistryOptions {
        &self.options
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` against a task under the read lock, copying only what it returns.
    pub fn view<T>(&self, id: &TaskId, f: impl FnOnce(&Task) -> T) -> ServiceResult<T> {
        let inner = self.read();
        inner.tasks.get(id).map(f).ok_or(ServiceError::NotFound(*id))
    }

    /// Task record without its output text.
    pub fn header(&self, id: &TaskId) -> ServiceResult<TaskHeader> {
        self.view(id, |task| TaskHeader::from(task))
    }

    /// Validate parameters and create a `pending` task.
    pub fn create(&self, parameters: TaskParameters) -> ServiceResult<Task> {
        parameters.validate(&self.options.limits)?;

        let mut inner = self.write();
        let id = inner.next_id();
        let task = Task {
            id,
            parameters,
            status: TaskStatus::Pending,
            created_at: Utc::now().trunc_subsecs(6),
            started_at: None,
            finished_at: None,
            output: TaskOutput::default(),
            progress: None,
            artifacts: Vec::new(),
            error: None,
            exit_code: None,
        };
        inner.insert(task.clone());
        self.journal.record(JournalEntry::upsert(task.clone()));

        debug!(task_id = %id, kind = %task.kind(), "task created");
        Ok(task)
    }

    /// Compare-and-swap status transition.
    ///
    /// Succeeds only if the current status equals `expected` and
    /// `expected -> new` is an edge of the lifecycle graph.
    pub fn transition(
        &self,
        id: &TaskId,
        expected: TaskStatus,
        new: TaskStatus,
        fields: TransitionFields,
    ) -> ServiceResult<Task> {
        let mut inner = self.write();
        let task = inner.tasks.get_mut(id).ok_or(ServiceError::NotFound(*id))?;

        if task.status != expected {
            return Err(ServiceError::StaleTransition {
                id: *id,
                expected,
                actual: task.status,
            });
        }
        if !expected.can_transition_to(new) {
            return Err(ServiceError::InvalidState {
                id: *id,
                status: task.status,
                reason: format!("transition {expected} -> {new} is not allowed"),
            });
        }

        let now = Utc::now();
        task.status = new;
        if new == TaskStatus::Running {
            task.started_at = Some(later_of(now, task.created_at));
        }
        if new.is_terminal() {
            task.finished_at = Some(later_of(now, task.started_at.unwrap_or(task.created_at)));
        }

        if new == TaskStatus::Failed {
            task.error = Some(fields.error.unwrap_or_else(|| {
                TaskError::new(FailureReason::Internal, "task failed without a reported reason")
            }));
        }
        if new.is_terminal() && task.kind() != TaskKind::BulkScrape {
            task.exit_code = fields.exit_code;
        }
        if let Some(progress) = fields.progress {
            task.progress = Some(progress);
        }
        task.artifacts.extend(fields.artifacts);

        let snapshot = task.clone();
        self.journal.record(JournalEntry::upsert(snapshot.clone()));

        debug!(task_id = %id, from = %expected, to = %new, "task transitioned");
        Ok(snapshot)
    }

    /// Full copy of a task, output included. Polling paths use
    /// [`header`](Self::header) or [`view`](Self::view) instead.
    pub fn get(&self, id: &TaskId) -> ServiceResult<Task> {
        self.view(id, Task::clone)
    }

    /// Current status only.
    pub fn status(&self, id: &TaskId) -> ServiceResult<TaskStatus> {
        self.view(id, |t| t.status)
    }

    /// Tasks ordered by `created_at` descending, starting after `cursor`.
    pub fn list(
        &self,
        filter: &TaskFilter,
        limit: usize,
        cursor: Option<&Cursor>,
    ) -> TaskPage {
        let limit = limit.clamp(1, self.options.max_page_size.max(1));
        let inner = self.read();

        let keys: Box<dyn Iterator<Item = &(Timestamp, TaskId)>> = match cursor {
            Some(c) => Box::new(inner.order.range(..c.key()).rev()),
            None => Box::new(inner.order.iter().rev()),
        };

        let mut tasks: Vec<TaskHeader> = keys
            .filter_map(|(_, id)| inner.tasks.get(id))
            .filter(|t| filter.matches(t))
            .take(limit + 1)
            .map(TaskHeader::from)
            .collect();

        let next_cursor = if tasks.len() > limit {
            tasks.truncate(limit);
            tasks.last().map(Cursor::after)
        } else {
            None
        };

        TaskPage { tasks, next_cursor }
    }

    /// Append captured text to a running task.
    pub fn append_output(&self, id: &TaskId, chunk: &str) -> ServiceResult<()> {
        let max = self.options.max_output_bytes;
        let mut inner = self.write();
        let task = running_task_mut(&mut inner, id, "output can only be appended while running")?;
        task.output.append(chunk, max);
        Ok(())
    }

    /// Record progress of a running task.
    pub fn report_progress(&self, id: &TaskId, progress: Progress) -> ServiceResult<()> {
        let mut inner = self.write();
        let task = running_task_mut(&mut inner, id, "progress can only be reported while running")?;
        task.progress = Some(progress);
        Ok(())
    }

    /// Captured output from byte `offset` on. Only the window is copied.
    pub fn output_since(&self, id: &TaskId, offset: usize) -> ServiceResult<OutputWindow> {
        self.view(id, |task| {
            let text = &task.output.text;
            let mut start = offset.min(text.len());
            while start > 0 && !text.is_char_boundary(start) {
                start -= 1;
            }
            OutputWindow {
                text: text[start..].to_string(),
                offset: start,
                end: text.len(),
                truncated: task.output.truncated,
                terminal: task.is_terminal(),
            }
        })
    }

    /// Explicitly remove a terminal task's record.
    pub fn delete(&self, id: &TaskId) -> ServiceResult<Task> {
        let mut inner = self.write();
        let status = inner
            .tasks
            .get(id)
            .map(|t| t.status)
            .ok_or(ServiceError::NotFound(*id))?;
        if !status.is_terminal() {
            return Err(ServiceError::InvalidState {
                id: *id,
                status,
                reason: "only finished tasks can be deleted".to_string(),
            });
        }
        let task = inner.tasks.remove(id).ok_or(ServiceError::NotFound(*id))?;
        inner.order.remove(&(task.created_at, task.id));
        self.journal.record(JournalEntry::delete(*id));
        info!(task_id = %id, "task record deleted");
        Ok(task)
    }

    pub fn counts(&self) -> StatusCounts {
        let inner = self.read();
        let mut counts = StatusCounts::default();
        for task in inner.tasks.values() {
            match task.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::Running => counts.running += 1,
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Failed => counts.failed += 1,
                TaskStatus::Cancelled => counts.cancelled += 1,
            }
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.read().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All records, oldest first (used for journal compaction).
    pub fn all(&self) -> Vec<Task> {
        let inner = self.read();
        inner
            .order
            .iter()
            .filter_map(|(_, id)| inner.tasks.get(id).cloned())
            .collect()
    }
}

fn running_task_mut<'a>(
    inner: &'a mut RegistryInner,
    id: &TaskId,
    reason: &str,
) -> ServiceResult<&'a mut Task> {
    let task = inner.tasks.get_mut(id).ok_or(ServiceError::NotFound(*id))?;
    if task.status != TaskStatus::Running {
        warn!(task_id = %id, status = %task.status, "{reason}");
        return Err(ServiceError::InvalidState {
            id: *id,
            status: task.status,
            reason: reason.to_string(),
        });
    }
    Ok(task)
}

/// Keep timestamps ordered even if the wall clock stepped backwards.
fn later_of(now: Timestamp, floor: Timestamp) -> Timestamp {
    if now < floor { floor } else { now }
}

/// Move a task left in flight by a previous process to `to`.
fn settle_in_flight(task: &mut Task, to: TaskStatus) {
    debug_assert!(task.status.can_transition_to(to));
    let floor = task.started_at.unwrap_or(task.created_at);
    task.status = to;
    task.finished_at = Some(later_of(Utc::now(), floor));
    if to == TaskStatus::Failed {
        task.error = Some(TaskError::new(
            FailureReason::Interrupted,
            "service stopped while the task was running",
        ));
    }
}
