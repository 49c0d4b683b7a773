// src/types.rs

//! Small shared vocabulary types: task ids, kinds and statuses, plus the
//! task lifecycle graph.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use petgraph::graphmap::DiGraphMap;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Wall-clock timestamp stored on task records.
pub type Timestamp = DateTime<Utc>;

/// Opaque, immutable task identifier (ULID text form on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Ulid);

impl TaskId {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    pub fn as_ulid(&self) -> Ulid {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TaskId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(s.trim())
            .map(TaskId)
            .map_err(|e| format!("invalid task id '{s}': {e}"))
    }
}

/// The kind of operation a task runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    UrlDownload,
    BulkScrape,
    ShellCommand,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::UrlDownload => "url_download",
            TaskKind::BulkScrape => "bulk_scrape",
            TaskKind::ShellCommand => "shell_command",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "url_download" => Ok(TaskKind::UrlDownload),
            "bulk_scrape" => Ok(TaskKind::BulkScrape),
            "shell_command" => Ok(TaskKind::ShellCommand),
            other => Err(format!(
                "invalid task kind: {other} (expected url_download, bulk_scrape or shell_command)"
            )),
        }
    }
}

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Pending,
        TaskStatus::Running,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Whether `self -> next` is an edge of the lifecycle graph.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        lifecycle_graph().contains_edge(*self, next)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(format!("invalid task status: {other}")),
        }
    }
}

/// The fixed directed acyclic graph of allowed status transitions.
///
/// Edge direction: from -> to.
pub fn lifecycle_graph() -> &'static DiGraphMap<TaskStatus, ()> {
    static GRAPH: OnceLock<DiGraphMap<TaskStatus, ()>> = OnceLock::new();
    GRAPH.get_or_init(|| {
        let mut graph = DiGraphMap::new();
        for status in TaskStatus::ALL {
            graph.add_node(status);
        }
        graph.add_edge(TaskStatus::Pending, TaskStatus::Running, ());
        graph.add_edge(TaskStatus::Pending, TaskStatus::Cancelled, ());
        graph.add_edge(TaskStatus::Running, TaskStatus::Completed, ());
        graph.add_edge(TaskStatus::Running, TaskStatus::Failed, ());
        graph.add_edge(TaskStatus::Running, TaskStatus::Cancelled, ());
        graph
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use petgraph::algo::toposort;
    use petgraph::Direction;

    #[test]
    fn lifecycle_graph_is_acyclic() {
        let order = toposort(lifecycle_graph(), None).expect("lifecycle must be a DAG");
        assert_eq!(order.first(), Some(&TaskStatus::Pending));
    }

    #[test]
    fn nothing_returns_to_pending() {
        let incoming = lifecycle_graph()
            .neighbors_directed(TaskStatus::Pending, Direction::Incoming)
            .count();
        assert_eq!(incoming, 0);
    }

    #[test]
    fn terminal_states_have_no_outgoing_edges() {
        for status in TaskStatus::ALL.into_iter().filter(|s| s.is_terminal()) {
            let outgoing = lifecycle_graph()
                .neighbors_directed(status, Direction::Outgoing)
                .count();
            assert_eq!(outgoing, 0, "{status} must be terminal");
        }
    }

    #[test]
    fn pending_cannot_skip_to_completed() {
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Completed));
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Failed));
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Cancelled));
    }

    #[test]
    fn task_id_round_trips_through_text() {
        let id = TaskId::from_ulid(Ulid::new());
        let parsed: TaskId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-ulid".parse::<TaskId>().is_err());
    }
}
