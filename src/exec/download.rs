// src/exec/download.rs

//! Single URL download runner.

use reqwest::{Client, Url};
use tracing::{info, warn};

use crate::task::{FailureReason, Progress, ProgressUnit, TaskError, UrlDownloadParams};

use super::backend::{ExecSettings, Interrupt, RunContext, RunOutcome};
use super::fetch::{FetchRequest, artifact_name_for, fetch_to_store};

pub async fn run_download(
    ctx: &RunContext,
    client: &Client,
    settings: &ExecSettings,
    params: &UrlDownloadParams,
) -> RunOutcome {
    let url = match Url::parse(params.url.trim()) {
        Ok(url) => url,
        Err(e) => {
            return RunOutcome::Failed(TaskError::new(
                FailureReason::UnsupportedSource,
                format!("cannot parse '{}': {e}", params.url),
            ));
        }
    };
    let name = params
        .output_path
        .clone()
        .unwrap_or_else(|| artifact_name_for(&url));

    info!(task_id = %ctx.task_id, url = %url, artifact = %name, "starting download");

    let request = FetchRequest {
        url: &url,
        artifact: &name,
        expected_size: params.expected_size,
        checksum: params.checksum.as_deref(),
        max_bytes: settings.max_download_bytes,
    };
    let sink = ctx.sink.clone();
    let transfer = fetch_to_store(client, &ctx.store, &ctx.task_id, request, move |done, total| {
        sink.progress(Progress::new(ProgressUnit::Bytes, done, total));
    });

    // Losing the race drops the transfer: the connection is released and the
    // partial artifact removed before we report back.
    tokio::select! {
        result = transfer => match result {
            Ok(artifact) => {
                ctx.sink.line(&format!("downloaded {} ({} bytes)", artifact.name, artifact.size));
                info!(task_id = %ctx.task_id, size = artifact.size, "download finished");
                let progress = Progress::new(ProgressUnit::Bytes, artifact.size, Some(artifact.size));
                RunOutcome::Completed {
                    exit_code: Some(0),
                    artifacts: vec![artifact],
                    progress: Some(progress),
                }
            }
            Err(err) => {
                warn!(task_id = %ctx.task_id, reason = ?err.reason, error = %err.message, "download failed");
                ctx.sink.line(&format!("error: {}", err.message));
                RunOutcome::Failed(err)
            }
        },
        interrupt = ctx.interrupted() => match interrupt {
            Interrupt::Cancelled => {
                info!(task_id = %ctx.task_id, "download cancelled");
                RunOutcome::Cancelled
            }
            Interrupt::TimedOut => RunOutcome::Failed(TaskError::new(
                FailureReason::Timeout,
                format!("download exceeded its timeout of {:?}", ctx.timeout),
            )),
        },
    }
}
