// src/exec/fetch.rs

//! Streaming HTTP fetch into the result store, shared by the download and
//! scrape runners.

use futures::StreamExt;
use reqwest::{Client, Url};
use tracing::debug;

use crate::store::{ArtifactRef, PutMode, ResultStore, StoreError};
use crate::task::{FailureReason, TaskError};
use crate::types::TaskId;

/// One transfer into one artifact.
#[derive(Debug, Clone)]
pub struct FetchRequest<'a> {
    pub url: &'a Url,
    pub artifact: &'a str,
    pub expected_size: Option<u64>,
    /// Expected BLAKE3 hex digest.
    pub checksum: Option<&'a str>,
    pub max_bytes: Option<u64>,
}

/// Only plain HTTP(S) sources are fetched.
pub fn check_scheme(url: &Url) -> Result<(), TaskError> {
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(TaskError::new(
            FailureReason::UnsupportedSource,
            format!("unsupported URL scheme '{other}' (only http and https are fetched)"),
        )),
    }
}

/// Stream `req.url` into the store, verifying size and checksum.
///
/// `on_progress(bytes_so_far, total)` is called after every chunk. Dropping
/// the returned future mid-transfer releases the connection and discards the
/// partial artifact.
pub async fn fetch_to_store<F>(
    client: &Client,
    store: &ResultStore,
    task_id: &TaskId,
    req: FetchRequest<'_>,
    mut on_progress: F,
) -> Result<ArtifactRef, TaskError>
where
    F: FnMut(u64, Option<u64>),
{
    check_scheme(req.url)?;

    let resp = client
        .get(req.url.clone())
        .send()
        .await
        .map_err(|e| unreachable(req.url, e))?
        .error_for_status()
        .map_err(|e| unreachable(req.url, e))?;

    let content_length = resp.content_length();
    let total = req.expected_size.or(content_length);
    if let (Some(max), Some(len)) = (req.max_bytes, content_length) {
        if len > max {
            return Err(too_large(max));
        }
    }

    let mut writer = store
        .create(task_id, req.artifact, PutMode::CreateNew)
        .await
        .map_err(write_error)?;

    let mut body = resp.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| {
            TaskError::new(
                FailureReason::IncompleteTransfer,
                format!("transfer from {} interrupted: {e}", req.url),
            )
        })?;
        writer.write(&chunk).await.map_err(write_error)?;
        if req.max_bytes.is_some_and(|max| writer.size() > max) {
            return Err(too_large(req.max_bytes.unwrap_or_default()));
        }
        on_progress(writer.size(), total);
    }

    let received = writer.size();
    for (label, expected) in [("Content-Length", content_length), ("expected size", req.expected_size)] {
        if let Some(expected) = expected {
            if expected != received {
                return Err(TaskError::new(
                    FailureReason::IncompleteTransfer,
                    format!("received {received} bytes but {label} is {expected}"),
                ));
            }
        }
    }

    if let Some(expected) = req.checksum {
        let actual = writer.checksum();
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(TaskError::new(
                FailureReason::ChecksumMismatch,
                format!("BLAKE3 mismatch: expected {expected}, got {actual}"),
            ));
        }
    }

    let artifact = writer.finish().await.map_err(write_error)?;
    debug!(task_id = %task_id, url = %req.url, size = artifact.size, "fetch finished");
    Ok(artifact)
}

fn unreachable(url: &Url, e: reqwest::Error) -> TaskError {
    let detail = match e.status() {
        Some(status) => format!("server answered {status}"),
        None => e.to_string(),
    };
    TaskError::new(FailureReason::Unreachable, format!("{url}: {detail}"))
}

fn write_error(e: StoreError) -> TaskError {
    TaskError::new(FailureReason::WriteError, e.to_string())
}

fn too_large(max: u64) -> TaskError {
    TaskError::new(
        FailureReason::WriteError,
        format!("download exceeds the configured limit of {max} bytes"),
    )
}

/// Derive a plain artifact file name from the last path segment of `url`.
pub fn artifact_name_for(url: &Url) -> String {
    let segment = url
        .path_segments()
        .and_then(|mut segments| segments.rfind(|s| !s.is_empty()))
        .unwrap_or("");

    let mut name: String = segment
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = name.trim_start_matches('.').len();
    name = name.split_off(name.len() - trimmed);

    if name.is_empty() {
        name = "download".to_string();
    }
    if name.ends_with(".part") {
        name.push('_');
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::validate_artifact_name;

    #[test]
    fn artifact_names_come_from_the_last_segment() {
        let cases = [
            ("https://example.com/files/photo.jpg", "photo.jpg"),
            ("https://example.com/files/dir/", "dir"),
            ("https://example.com/", "download"),
            ("https://example.com/a%20b.txt", "a_20b.txt"),
            ("https://example.com/..", "download"),
            ("https://example.com/x.part", "x.part_"),
            ("https://example.com/.hidden", "hidden"),
        ];
        for (url, expected) in cases {
            let name = artifact_name_for(&Url::parse(url).unwrap());
            assert_eq!(name, expected, "{url}");
            validate_artifact_name(&name).unwrap();
        }
    }

    #[test]
    fn only_http_schemes_are_supported() {
        assert!(check_scheme(&Url::parse("https://example.com/a").unwrap()).is_ok());
        let err = check_scheme(&Url::parse("ftp://example.com/a").unwrap()).unwrap_err();
        assert_eq!(err.reason, FailureReason::UnsupportedSource);
    }
}
