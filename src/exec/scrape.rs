// src/exec/scrape.rs

//! Bulk scrape runner: many small downloads under one task.
//!
//! Targets come from the explicit list and, with a `start_url`, from media
//! discovered on web pages (recorded in a `manifest.json` artifact).
//! Targets whose file name does not pass the include/exclude globs are
//! skipped. The rest are fetched with bounded internal parallelism; a failed
//! target is recorded and the run carries on. The task only fails when every
//! attempted target failed.

use std::collections::HashSet;

use futures::StreamExt;
use globset::{Glob, GlobSet, GlobSetBuilder};
use reqwest::{Client, Url};
use tracing::{debug, info, warn};

use crate::store::{ArtifactRef, PutMode};
use crate::task::{BulkScrapeParams, FailureReason, Progress, ProgressUnit, TaskError};

use super::backend::{ExecSettings, Interrupt, RunContext, RunOutcome};
use super::discover::{CrawlLimits, PageEvent, PageScanner, discover};
use super::fetch::{FetchRequest, artifact_name_for, check_scheme, fetch_to_store};

/// Artifact listing what discovery found.
pub const MANIFEST: &str = "manifest.json";

/// Include/exclude globs matched against a target's file name.
#[derive(Debug, Clone)]
pub struct ScrapeFilter {
    include: Option<GlobSet>,
    exclude: GlobSet,
}

impl ScrapeFilter {
    pub fn new(include: &[String], exclude: &[String]) -> Result<Self, globset::Error> {
        let include = if include.is_empty() {
            None
        } else {
            Some(build_set(include)?)
        };
        Ok(Self {
            include,
            exclude: build_set(exclude)?,
        })
    }

    pub fn accepts(&self, file_name: &str) -> bool {
        if self.exclude.is_match(file_name) {
            return false;
        }
        self.include.as_ref().is_none_or(|set| set.is_match(file_name))
    }
}

fn build_set(patterns: &[String]) -> Result<GlobSet, globset::Error> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    builder.build()
}

#[derive(Debug)]
struct Target {
    url: Url,
    artifact: String,
}

/// Parse, dedupe and filter the sources, giving each a distinct artifact
/// name that avoids `reserved`.
/// Returns the planned targets, unparseable sources, and the skip count.
fn plan(sources: &[String], filter: &ScrapeFilter, reserved: &[&str]) -> (Vec<Target>, Vec<String>, u64) {
    let mut targets = Vec::new();
    let mut invalid = Vec::new();
    let mut skipped = 0u64;
    let mut used: HashSet<String> = reserved.iter().map(|s| s.to_string()).collect();
    let mut seen_urls: HashSet<Url> = HashSet::new();

    for raw in sources {
        let url = match Url::parse(raw.trim()) {
            Ok(url) => url,
            Err(e) => {
                invalid.push(format!("{raw}: {e}"));
                continue;
            }
        };
        if !seen_urls.insert(url.clone()) {
            continue;
        }
        let base = artifact_name_for(&url);
        if !filter.accepts(&base) {
            skipped += 1;
            continue;
        }

        let mut artifact = base.clone();
        let mut n = 1;
        while !used.insert(artifact.clone()) {
            artifact = numbered(&base, n);
            n += 1;
        }
        targets.push(Target { url, artifact });
    }

    (targets, invalid, skipped)
}

/// `photo.jpg` -> `photo-1.jpg`
fn numbered(name: &str, n: usize) -> String {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem}-{n}.{ext}"),
        _ => format!("{name}-{n}"),
    }
}

pub async fn run_scrape(
    ctx: &RunContext,
    client: &Client,
    settings: &ExecSettings,
    params: &BulkScrapeParams,
) -> RunOutcome {
    tokio::select! {
        outcome = scrape(ctx, client, settings, params) => outcome,
        interrupt = ctx.interrupted() => match interrupt {
            Interrupt::Cancelled => {
                info!(task_id = %ctx.task_id, "bulk scrape cancelled");
                RunOutcome::Cancelled
            }
            Interrupt::TimedOut => RunOutcome::Failed(TaskError::new(
                FailureReason::Timeout,
                format!("bulk scrape exceeded its timeout of {:?}", ctx.timeout),
            )),
        },
    }
}

async fn scrape(
    ctx: &RunContext,
    client: &Client,
    settings: &ExecSettings,
    params: &BulkScrapeParams,
) -> RunOutcome {
    let filter = match ScrapeFilter::new(&params.include, &params.exclude) {
        Ok(f) => f,
        Err(e) => {
            return RunOutcome::Failed(TaskError::new(
                FailureReason::Internal,
                format!("invalid scrape filter: {e}"),
            ));
        }
    };

    let mut artifacts: Vec<ArtifactRef> = Vec::new();
    let mut sources: Vec<String> = params.targets.clone();
    let mut reserved: Vec<&str> = Vec::new();

    if let Some(ref start) = params.start_url {
        let found = match discover_media(ctx, client, settings, params, start).await {
            Ok(found) => found,
            Err(err) => return RunOutcome::Failed(err),
        };
        artifacts.push(found.manifest);
        reserved.push(MANIFEST);

        if params.analyze_only {
            info!(task_id = %ctx.task_id, media = found.urls.len(), "scrape analysis finished");
            return RunOutcome::Completed {
                exit_code: None,
                artifacts,
                progress: Some(found.progress),
            };
        }

        let room = settings.max_targets.saturating_sub(sources.len());
        if found.urls.len() > room {
            ctx.sink.line(&format!(
                "discovered {} media; fetching the first {room}",
                found.urls.len()
            ));
        }
        sources.extend(found.urls.into_iter().take(room));
    }

    let (targets, invalid, skipped) = plan(&sources, &filter, &reserved);
    let parallelism = params
        .parallelism
        .unwrap_or(1)
        .min(settings.scrape_parallelism)
        .max(1);
    let total = (targets.len() + invalid.len()) as u64;

    info!(
        task_id = %ctx.task_id,
        targets = total,
        skipped,
        parallelism,
        "starting bulk scrape"
    );
    if skipped > 0 {
        ctx.sink.line(&format!("skipped {skipped} targets by filter"));
    }
    let mut failures: Vec<String> = invalid;
    for line in &failures {
        ctx.sink.line(&format!("failed {line}"));
    }

    let mut progress = Progress::new(ProgressUnit::Targets, failures.len() as u64, Some(total));
    progress.failed = failures.len() as u64;
    ctx.sink.progress(progress);

    let mut fetched: Vec<ArtifactRef> = Vec::new();
    let mut results = futures::stream::iter(targets.iter().map(|target| {
        let request = FetchRequest {
            url: &target.url,
            artifact: &target.artifact,
            expected_size: None,
            checksum: None,
            max_bytes: settings.max_download_bytes,
        };
        async move {
            let result = fetch_to_store(client, &ctx.store, &ctx.task_id, request, |_, _| {}).await;
            (target, result)
        }
    }).collect::<Vec<_>>())
    .buffer_unordered(parallelism);

    while let Some((target, result)) = results.next().await {
        progress.done += 1;
        match result {
            Ok(artifact) => {
                ctx.sink.line(&format!("fetched {} -> {}", target.url, artifact.name));
                fetched.push(artifact);
            }
            Err(err) => {
                debug!(task_id = %ctx.task_id, url = %target.url, reason = ?err.reason, "scrape target failed");
                ctx.sink.line(&format!("failed {}: {}", target.url, err.message));
                progress.failed += 1;
                failures.push(format!("{}: {}", target.url, err.message));
            }
        }
        ctx.sink.progress(progress);
    }

    let failed = failures.len();
    let succeeded = fetched.len();
    let summary = format!("{succeeded} fetched, {failed} failed, {skipped} skipped");
    ctx.sink.line(&summary);

    if succeeded == 0 && failed > 0 {
        warn!(task_id = %ctx.task_id, failed, "every scrape target failed");
        return RunOutcome::Failed(TaskError::new(
            FailureReason::AllTargetsFailed,
            format!("all {failed} attempted targets failed; first: {}", failures[0]),
        ));
    }

    artifacts.extend(fetched);
    artifacts.sort_by(|a, b| a.name.cmp(&b.name));
    info!(task_id = %ctx.task_id, succeeded, failed, skipped, "bulk scrape finished");
    RunOutcome::Completed {
        exit_code: None,
        artifacts,
        progress: Some(progress),
    }
}

struct Discovered {
    manifest: ArtifactRef,
    urls: Vec<String>,
    progress: Progress,
}

/// Crawl from `start`, store the manifest, and hand back the media URLs.
async fn discover_media(
    ctx: &RunContext,
    client: &Client,
    settings: &ExecSettings,
    params: &BulkScrapeParams,
    start: &str,
) -> Result<Discovered, TaskError> {
    let start = Url::parse(start.trim()).map_err(|e| {
        TaskError::new(FailureReason::UnsupportedSource, format!("malformed start_url: {e}"))
    })?;
    check_scheme(&start)?;
    let scanner = PageScanner::new().map_err(|e| {
        TaskError::new(FailureReason::Internal, format!("building page scanner: {e}"))
    })?;

    let limits = CrawlLimits {
        depth: params.depth,
        follow_links: params.follow_links,
        max_pages: params
            .limit_pages
            .unwrap_or(settings.max_pages)
            .clamp(1, settings.max_pages.max(1)),
    };
    info!(
        task_id = %ctx.task_id,
        %start,
        depth = limits.depth,
        follow_links = limits.follow_links,
        max_pages = limits.max_pages,
        "discovering media"
    );

    let mut progress = Progress::new(ProgressUnit::Pages, 0, None);
    let manifest = discover(client, &scanner, &start, limits, |event| {
        progress.done += 1;
        match event {
            PageEvent::Scanned { url, media } => {
                ctx.sink.line(&format!("scanned {url}: {media} media"));
            }
            PageEvent::Failed { url, error } => {
                progress.failed += 1;
                ctx.sink.line(&format!("failed to read {url}: {error}"));
            }
        }
        ctx.sink.progress(progress);
    })
    .await;

    if manifest.pages_visited.is_empty() {
        let detail = manifest
            .pages_failed
            .first()
            .map_or_else(|| "no page was read".to_string(), |f| f.error.clone());
        return Err(TaskError::new(
            FailureReason::Unreachable,
            format!("could not read start page {start}: {detail}"),
        ));
    }

    let body = serde_json::to_vec_pretty(&manifest).map_err(|e| {
        TaskError::new(FailureReason::Internal, format!("encoding manifest: {e}"))
    })?;
    let stored = ctx
        .store
        .put(&ctx.task_id, MANIFEST, &body, PutMode::Replace)
        .await
        .map_err(|e| TaskError::new(FailureReason::WriteError, e.to_string()))?;
    ctx.sink.line(&format!(
        "discovered {} media on {} pages",
        manifest.total_media,
        manifest.pages_visited.len()
    ));

    Ok(Discovered {
        manifest: stored,
        urls: manifest.media.into_iter().map(|m| m.url).collect(),
        progress,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(targets: &[&str], include: &[&str], exclude: &[&str]) -> BulkScrapeParams {
        BulkScrapeParams {
            targets: targets.iter().map(|s| s.to_string()).collect(),
            include: include.iter().map(|s| s.to_string()).collect(),
            exclude: exclude.iter().map(|s| s.to_string()).collect(),
            ..BulkScrapeParams::default()
        }
    }

    #[test]
    fn filter_applies_exclude_before_include() {
        let filter = ScrapeFilter::new(&["*.jpg".into(), "*.mp4".into()], &["thumb_*".into()]).unwrap();
        assert!(filter.accepts("photo.jpg"));
        assert!(filter.accepts("clip.mp4"));
        assert!(!filter.accepts("thumb_photo.jpg"));
        assert!(!filter.accepts("notes.txt"));
    }

    #[test]
    fn empty_include_accepts_everything_not_excluded() {
        let filter = ScrapeFilter::new(&[], &["*.gif".into()]).unwrap();
        assert!(filter.accepts("a.txt"));
        assert!(!filter.accepts("a.gif"));
    }

    #[test]
    fn plan_counts_skipped_and_dedupes_names() {
        let p = params(
            &[
                "https://a.example/x/photo.jpg",
                "https://b.example/y/photo.jpg",
                "https://a.example/readme.txt",
            ],
            &["*.jpg"],
            &[],
        );
        let filter = ScrapeFilter::new(&p.include, &p.exclude).unwrap();
        let (targets, invalid, skipped) = plan(&p.targets, &filter, &[]);

        assert!(invalid.is_empty());
        assert_eq!(skipped, 1);
        let names: Vec<_> = targets.iter().map(|t| t.artifact.as_str()).collect();
        assert_eq!(names, vec!["photo.jpg", "photo-1.jpg"]);
    }

    #[test]
    fn plan_drops_repeated_urls_and_avoids_reserved_names() {
        let sources: Vec<String> = [
            "https://a.example/manifest.json",
            "https://a.example/p.jpg",
            "https://a.example/p.jpg",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let filter = ScrapeFilter::new(&[], &[]).unwrap();
        let (targets, _, skipped) = plan(&sources, &filter, &[MANIFEST]);

        assert_eq!(skipped, 0);
        let names: Vec<_> = targets.iter().map(|t| t.artifact.as_str()).collect();
        assert_eq!(names, vec!["manifest-1.json", "p.jpg"]);
    }
}
