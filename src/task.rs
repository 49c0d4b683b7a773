// src/task.rs

//! The task record and its kind-specific parameters.
//!
//! A [`Task`] is created by the registry and only ever changed through the
//! registry's transition / output operations. Everything here is plain data
//! plus validation of the submission contract.

use std::path::{Component, Path};

use globset::Glob;
use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::errors::{ServiceError, ServiceResult};
use crate::store::ArtifactRef;
use crate::types::{TaskId, TaskKind, TaskStatus, Timestamp};

/// Kind-specific, immutable task input.
///
/// On the wire this is the `{kind, parameters}` pair of a submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "parameters", rename_all = "snake_case")]
pub enum TaskParameters {
    UrlDownload(UrlDownloadParams),
    BulkScrape(BulkScrapeParams),
    ShellCommand(ShellCommandParams),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UrlDownloadParams {
    pub url: String,
    /// File name for the stored artifact. Derived from the URL when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_path: Option<String>,
    /// Expected size in bytes, used to verify the transfer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_size: Option<u64>,
    /// Expected BLAKE3 digest (hex) of the downloaded content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkScrapeParams {
    /// Explicit URLs to fetch.
    #[serde(default)]
    pub targets: Vec<String>,
    /// Page to search for media (images, video, audio, iframes and inline
    /// style backgrounds). Found media are fetched alongside `targets`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_url: Option<String>,
    /// Link hops to follow from `start_url` when `follow_links` is set.
    #[serde(default)]
    pub depth: u32,
    /// Follow same-host links from discovered pages, up to `depth` hops.
    #[serde(default)]
    pub follow_links: bool,
    /// Most pages to visit during discovery.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_pages: Option<usize>,
    /// Only discover: store the media manifest and fetch nothing.
    #[serde(default)]
    pub analyze_only: bool,
    /// Glob patterns matched against each target's file name. Empty means
    /// "everything".
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
    /// Requested internal parallelism; capped by the service configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallelism: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShellCommandParams {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
}

/// Deepest link-following a scrape may ask for.
pub const MAX_DISCOVERY_DEPTH: u32 = 5;

/// Limits applied while validating submissions.
#[derive(Debug, Clone, Copy)]
pub struct ParameterLimits {
    pub max_targets: usize,
    /// Upper bound for a scrape's `limit_pages`.
    pub max_pages: usize,
}

impl Default for ParameterLimits {
    fn default() -> Self {
        Self {
            max_targets: 500,
            max_pages: 50,
        }
    }
}

impl TaskParameters {
    pub fn kind(&self) -> TaskKind {
        match self {
            TaskParameters::UrlDownload(_) => TaskKind::UrlDownload,
            TaskParameters::BulkScrape(_) => TaskKind::BulkScrape,
            TaskParameters::ShellCommand(_) => TaskKind::ShellCommand,
        }
    }

    /// Check the kind-specific parameter contract.
    pub fn validate(&self, limits: &ParameterLimits) -> ServiceResult<()> {
        match self {
            TaskParameters::UrlDownload(p) => {
                parse_source_url(&p.url)?;
                if let Some(ref name) = p.output_path {
                    validate_artifact_name(name)?;
                }
                if let Some(ref checksum) = p.checksum {
                    validate_checksum(checksum)?;
                }
                Ok(())
            }
            TaskParameters::BulkScrape(p) => {
                if p.targets.is_empty() && p.start_url.is_none() {
                    return Err(invalid("bulk_scrape requires targets or a start_url"));
                }
                if p.analyze_only && p.start_url.is_none() {
                    return Err(invalid("analyze_only requires a start_url"));
                }
                if let Some(ref start) = p.start_url {
                    parse_source_url(start)?;
                }
                if p.depth > MAX_DISCOVERY_DEPTH {
                    return Err(invalid(format!(
                        "depth must be at most {MAX_DISCOVERY_DEPTH} (got {})",
                        p.depth
                    )));
                }
                match p.limit_pages {
                    Some(0) => return Err(invalid("limit_pages must be >= 1")),
                    Some(n) if n > limits.max_pages => {
                        return Err(invalid(format!(
                            "limit_pages must be at most {} (got {n})",
                            limits.max_pages
                        )));
                    }
                    _ => {}
                }
                if p.targets.len() > limits.max_targets {
                    return Err(invalid(format!(
                        "bulk_scrape accepts at most {} targets (got {})",
                        limits.max_targets,
                        p.targets.len()
                    )));
                }
                for target in &p.targets {
                    parse_source_url(target)?;
                }
                for pattern in p.include.iter().chain(p.exclude.iter()) {
                    Glob::new(pattern)
                        .map_err(|e| invalid(format!("invalid glob '{pattern}': {e}")))?;
                }
                if p.parallelism == Some(0) {
                    return Err(invalid("parallelism must be >= 1"));
                }
                Ok(())
            }
            TaskParameters::ShellCommand(p) => {
                if p.command.trim().is_empty() {
                    return Err(invalid("command must not be empty"));
                }
                if p.command.contains('\0') {
                    return Err(invalid("command must not contain NUL bytes"));
                }
                if let Some(ref dir) = p.working_dir {
                    if dir.trim().is_empty() {
                        return Err(invalid("working_dir must not be empty when given"));
                    }
                }
                Ok(())
            }
        }
    }

    /// Short description used in listings and logs.
    pub fn summary(&self) -> String {
        match self {
            TaskParameters::UrlDownload(p) => p.url.clone(),
            TaskParameters::BulkScrape(p) => match (&p.start_url, p.targets.len()) {
                (Some(start), 0) => format!("media from {start}"),
                (Some(start), n) => format!("{n} targets + media from {start}"),
                (None, n) => format!("{n} targets"),
            },
            TaskParameters::ShellCommand(p) => p.command.clone(),
        }
    }
}

fn invalid(msg: impl Into<String>) -> ServiceError {
    ServiceError::InvalidParameters(msg.into())
}

/// Parse a download / scrape source. Only absolute URLs with a host are
/// accepted here; the scheme check happens in the runner so that an
/// unsupported scheme is reported as a task failure.
pub fn parse_source_url(raw: &str) -> ServiceResult<Url> {
    let url = Url::parse(raw.trim()).map_err(|e| invalid(format!("malformed URL '{raw}': {e}")))?;
    if url.host_str().is_none_or(str::is_empty) {
        return Err(invalid(format!("URL '{raw}' has no host")));
    }
    Ok(url)
}

/// Artifact names are single relative path components.
pub fn validate_artifact_name(name: &str) -> ServiceResult<()> {
    let path = Path::new(name);
    let mut components = path.components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) if !name.ends_with(".part") => Ok(()),
        _ => Err(invalid(format!(
            "'{name}' is not a valid artifact name (expected a plain file name)"
        ))),
    }
}

fn validate_checksum(hex: &str) -> ServiceResult<()> {
    if hex.len() == 64 && hex.chars().all(|c| c.is_ascii_hexdigit()) {
        Ok(())
    } else {
        Err(invalid("checksum must be a 64-character BLAKE3 hex digest"))
    }
}

/// Machine-usable failure reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Unreachable,
    UnsupportedSource,
    WriteError,
    ChecksumMismatch,
    IncompleteTransfer,
    Timeout,
    SpawnFailed,
    PermissionDenied,
    AllTargetsFailed,
    /// The service stopped while the task was in flight.
    Interrupted,
    Internal,
}

/// Error attached to a `failed` task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub reason: FailureReason,
    pub message: String,
}

impl TaskError {
    pub fn new(reason: FailureReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressUnit {
    Bytes,
    Targets,
    Lines,
    Pages,
}

/// Worker-reported progress of a running task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub unit: ProgressUnit,
    pub done: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    #[serde(default)]
    pub failed: u64,
}

impl Progress {
    pub fn new(unit: ProgressUnit, done: u64, total: Option<u64>) -> Self {
        Self {
            unit,
            done,
            total,
            failed: 0,
        }
    }

    /// Human-readable one-liner, e.g. `3/10 targets (1 failed)`.
    pub fn summary(&self) -> String {
        let unit = match self.unit {
            ProgressUnit::Bytes => "bytes",
            ProgressUnit::Targets => "targets",
            ProgressUnit::Lines => "lines",
            ProgressUnit::Pages => "pages",
        };
        let mut s = match self.total {
            Some(total) => format!("{}/{} {}", self.done, total, unit),
            None => format!("{} {}", self.done, unit),
        };
        if self.failed > 0 {
            s.push_str(&format!(" ({} failed)", self.failed));
        }
        s
    }
}

/// Captured text of a task. Append-only while the task is running.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOutput {
    pub text: String,
    /// Set once a chunk had to be dropped because of the size cap.
    #[serde(default)]
    pub truncated: bool,
}

impl TaskOutput {
    /// Append `chunk`, keeping the buffer within `max_bytes`.
    ///
    /// A chunk that does not fit is cut at a char boundary and further
    /// chunks are dropped.
    pub fn append(&mut self, chunk: &str, max_bytes: usize) {
        if self.truncated {
            return;
        }
        let room = max_bytes.saturating_sub(self.text.len());
        if chunk.len() <= room {
            self.text.push_str(chunk);
            return;
        }
        let mut cut = room;
        while cut > 0 && !chunk.is_char_boundary(cut) {
            cut -= 1;
        }
        self.text.push_str(&chunk[..cut]);
        self.truncated = true;
    }
}

/// A task record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub parameters: TaskParameters,
    pub status: TaskStatus,
    pub created_at: Timestamp,
    #[serde(default)]
    pub started_at: Option<Timestamp>,
    #[serde(default)]
    pub finished_at: Option<Timestamp>,
    #[serde(default)]
    pub output: TaskOutput,
    #[serde(default)]
    pub progress: Option<Progress>,
    #[serde(default)]
    pub artifacts: Vec<ArtifactRef>,
    #[serde(default)]
    pub error: Option<TaskError>,
    #[serde(default)]
    pub exit_code: Option<i32>,
}

impl Task {
    pub fn kind(&self) -> TaskKind {
        self.parameters.kind()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Progress line for status polling.
    pub fn progress_summary(&self) -> String {
        match (self.status, self.progress) {
            (_, Some(p)) => p.summary(),
            (TaskStatus::Pending, None) => "queued".to_string(),
            (TaskStatus::Running, None) => "started".to_string(),
            (TaskStatus::Completed, None) => "done".to_string(),
            (TaskStatus::Failed, None) => "failed".to_string(),
            (TaskStatus::Cancelled, None) => "cancelled".to_string(),
        }
    }
}

/// A task record without its captured output text.
///
/// Polling and listing copy these instead of whole [`Task`]s.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskHeader {
    pub id: TaskId,
    pub parameters: TaskParameters,
    pub status: TaskStatus,
    pub created_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub finished_at: Option<Timestamp>,
    pub progress: Option<Progress>,
    pub artifacts: Vec<ArtifactRef>,
    pub error: Option<TaskError>,
    pub exit_code: Option<i32>,
    pub output_bytes: usize,
    pub output_truncated: bool,
    pub progress_summary: String,
}

impl From<&Task> for TaskHeader {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id,
            parameters: task.parameters.clone(),
            status: task.status,
            created_at: task.created_at,
            started_at: task.started_at,
            finished_at: task.finished_at,
            progress: task.progress,
            artifacts: task.artifacts.clone(),
            error: task.error.clone(),
            exit_code: task.exit_code,
            output_bytes: task.output.text.len(),
            output_truncated: task.output.truncated,
            progress_summary: task.progress_summary(),
        }
    }
}

impl TaskHeader {
    pub fn kind(&self) -> TaskKind {
        self.parameters.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> ParameterLimits {
        ParameterLimits {
            max_targets: 3,
            max_pages: 10,
        }
    }

    #[test]
    fn empty_command_is_rejected() {
        let p = TaskParameters::ShellCommand(ShellCommandParams {
            command: "   ".into(),
            working_dir: None,
        });
        assert!(matches!(
            p.validate(&limits()),
            Err(ServiceError::InvalidParameters(_))
        ));
    }

    #[test]
    fn malformed_url_is_rejected() {
        let p = TaskParameters::UrlDownload(UrlDownloadParams {
            url: "not a url".into(),
            output_path: None,
            expected_size: None,
            checksum: None,
        });
        assert!(p.validate(&limits()).is_err());
    }

    #[test]
    fn output_path_must_be_a_plain_file_name() {
        for bad in ["../etc/passwd", "a/b.bin", "/abs.bin", "x.part"] {
            let p = TaskParameters::UrlDownload(UrlDownloadParams {
                url: "https://example.com/a.bin".into(),
                output_path: Some(bad.into()),
                expected_size: None,
                checksum: None,
            });
            assert!(p.validate(&limits()).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn too_many_scrape_targets_are_rejected() {
        let p = TaskParameters::BulkScrape(BulkScrapeParams {
            targets: (0..4).map(|i| format!("https://example.com/{i}.jpg")).collect(),
            ..BulkScrapeParams::default()
        });
        let err = p.validate(&limits()).unwrap_err();
        assert!(err.to_string().contains("at most 3"));
    }

    #[test]
    fn bad_glob_is_rejected() {
        let p = TaskParameters::BulkScrape(BulkScrapeParams {
            targets: vec!["https://example.com/a.jpg".into()],
            include: vec!["[".into()],
            ..BulkScrapeParams::default()
        });
        assert!(p.validate(&limits()).is_err());
    }

    fn discovery(edit: impl FnOnce(&mut BulkScrapeParams)) -> TaskParameters {
        let mut p = BulkScrapeParams {
            start_url: Some("https://example.com/gallery".into()),
            ..BulkScrapeParams::default()
        };
        edit(&mut p);
        TaskParameters::BulkScrape(p)
    }

    #[test]
    fn start_url_stands_in_for_targets() {
        assert!(discovery(|_| {}).validate(&limits()).is_ok());
        assert!(discovery(|p| {
            p.follow_links = true;
            p.depth = MAX_DISCOVERY_DEPTH;
            p.limit_pages = Some(10);
            p.analyze_only = true;
        })
        .validate(&limits())
        .is_ok());

        let empty = TaskParameters::BulkScrape(BulkScrapeParams::default());
        assert!(empty.validate(&limits()).is_err());
    }

    #[test]
    fn discovery_bounds_are_checked() {
        let cases: [(&str, fn(&mut BulkScrapeParams)); 5] = [
            ("no start_url", |p| {
                p.start_url = None;
                p.targets = vec!["https://example.com/a.jpg".into()];
                p.analyze_only = true;
            }),
            ("bad start_url", |p| p.start_url = Some("not a url".into())),
            ("too deep", |p| p.depth = MAX_DISCOVERY_DEPTH + 1),
            ("zero pages", |p| p.limit_pages = Some(0)),
            ("too many pages", |p| p.limit_pages = Some(11)),
        ];
        for (label, edit) in cases {
            assert!(discovery(edit).validate(&limits()).is_err(), "{label} should be rejected");
        }
    }

    #[test]
    fn discovery_fields_default_when_absent() {
        let json = r#"{"kind":"bulk_scrape","parameters":{"startUrl":"https://example.com/"}}"#;
        let TaskParameters::BulkScrape(p) = serde_json::from_str(json).unwrap() else {
            panic!("expected bulk_scrape");
        };
        assert!(p.targets.is_empty());
        assert_eq!(p.depth, 0);
        assert!(!p.follow_links && !p.analyze_only);
        assert_eq!(p.limit_pages, None);
    }

    #[test]
    fn submission_json_uses_kind_and_parameters() {
        let json = r#"{"kind":"shell_command","parameters":{"command":"echo hi","workingDir":"/tmp"}}"#;
        let p: TaskParameters = serde_json::from_str(json).unwrap();
        assert_eq!(p.kind(), TaskKind::ShellCommand);
        assert_eq!(
            p,
            TaskParameters::ShellCommand(ShellCommandParams {
                command: "echo hi".into(),
                working_dir: Some("/tmp".into()),
            })
        );
    }

    #[test]
    fn output_append_stops_at_cap() {
        let mut out = TaskOutput::default();
        out.append("hello ", 8);
        out.append("world", 8);
        assert_eq!(out.text, "hello wo");
        assert!(out.truncated);
        out.append("more", 8);
        assert_eq!(out.text, "hello wo");
    }

    #[test]
    fn progress_summary_mentions_failures() {
        let mut p = Progress::new(ProgressUnit::Targets, 3, Some(10));
        p.failed = 1;
        assert_eq!(p.summary(), "3/10 targets (1 failed)");
    }
}
