mod common;

use std::sync::Arc;

use tokio::io::AsyncReadExt;

use crate::common::builders::{DispatchOptionsBuilder, DownloadBuilder, ScrapeBuilder, download};
use crate::common::{Harness, wait_terminal};

use taskforge::exec::{ExecSettings, RealExecutor};
use taskforge::query::StatusQuery;
use taskforge::task::{FailureReason, ProgressUnit};
use taskforge::types::TaskStatus;
use taskforge_test_utils::file_server::FileServer;

async fn harness() -> Harness {
    let executor = RealExecutor::new(ExecSettings::default()).unwrap();
    Harness::new(Arc::new(executor), DispatchOptionsBuilder::new().build()).await
}

async fn server() -> FileServer {
    FileServer::start([
        ("report.pdf", b"%PDF-1.4 fake report".to_vec()),
        ("photo.jpg", vec![0xFF, 0xD8, 0xFF, 0xE0, 1, 2, 3]),
        ("clip.mp4", vec![0u8; 4096]),
        ("notes.txt", b"hello".to_vec()),
    ])
    .await
    .unwrap()
}

#[tokio::test]
async fn download_stores_the_artifact_with_checksum() {
    let srv = server().await;
    let h = harness().await;
    let query = StatusQuery::new(Arc::clone(&h.registry), h.store.clone());

    let digest = blake3::hash(b"%PDF-1.4 fake report").to_hex().to_string();
    let params = DownloadBuilder::new(&srv.url("report.pdf"))
        .checksum(&digest)
        .expected_size(20)
        .build();
    let id = h.dispatcher.submit(params).unwrap();
    let task = wait_terminal(&h.registry, &id).await;

    assert_eq!(task.status, TaskStatus::Completed, "error: {:?}", task.error);
    assert_eq!(task.exit_code, Some(0));
    assert_eq!(task.artifacts.len(), 1);
    let artifact = &task.artifacts[0];
    assert_eq!(artifact.name, "report.pdf");
    assert_eq!(artifact.size, 20);
    assert_eq!(artifact.checksum.as_deref(), Some(digest.as_str()));
    let progress = task.progress.expect("download reports progress");
    assert_eq!(progress.unit, ProgressUnit::Bytes);
    assert_eq!(progress.done, 20);

    let (_, mut file) = query.open_artifact(&id, None).await.unwrap();
    let mut body = Vec::new();
    file.read_to_end(&mut body).await.unwrap();
    assert_eq!(body, b"%PDF-1.4 fake report");
}

#[tokio::test]
async fn output_path_names_the_artifact() {
    let srv = server().await;
    let h = harness().await;

    let params = DownloadBuilder::new(&srv.url("notes.txt"))
        .output_path("renamed.txt")
        .build();
    let id = h.dispatcher.submit(params).unwrap();
    let task = wait_terminal(&h.registry, &id).await;

    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.artifacts[0].name, "renamed.txt");
}

#[tokio::test]
async fn checksum_mismatch_fails_and_leaves_no_artifact() {
    let srv = server().await;
    let h = harness().await;

    let params = DownloadBuilder::new(&srv.url("notes.txt"))
        .checksum(&"0".repeat(64))
        .build();
    let id = h.dispatcher.submit(params).unwrap();
    let task = wait_terminal(&h.registry, &id).await;

    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.error.unwrap().reason, FailureReason::ChecksumMismatch);
    assert!(task.artifacts.is_empty());
    assert!(h.store.list(&id).await.unwrap().is_empty());
}

#[tokio::test]
async fn size_mismatch_is_incomplete_transfer() {
    let srv = server().await;
    let h = harness().await;

    let params = DownloadBuilder::new(&srv.url("notes.txt"))
        .expected_size(500)
        .build();
    let id = h.dispatcher.submit(params).unwrap();
    let task = wait_terminal(&h.registry, &id).await;

    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.error.unwrap().reason, FailureReason::IncompleteTransfer);
}

#[tokio::test]
async fn missing_file_is_unreachable() {
    let srv = server().await;
    let h = harness().await;

    let id = h.dispatcher.submit(download(&srv.url("gone.bin"))).unwrap();
    let task = wait_terminal(&h.registry, &id).await;

    assert_eq!(task.status, TaskStatus::Failed);
    let error = task.error.unwrap();
    assert_eq!(error.reason, FailureReason::Unreachable);
    assert!(error.message.contains("404"), "message: {}", error.message);
}

#[tokio::test]
async fn non_http_scheme_is_unsupported_source() {
    let h = harness().await;

    let id = h
        .dispatcher
        .submit(download("ftp://files.example.com/archive.zip"))
        .unwrap();
    let task = wait_terminal(&h.registry, &id).await;

    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.error.unwrap().reason, FailureReason::UnsupportedSource);
}

#[tokio::test]
async fn scrape_collects_partial_success() {
    let srv = server().await;
    let h = harness().await;

    let params = ScrapeBuilder::new()
        .target(&srv.url("photo.jpg"))
        .target(&srv.url("clip.mp4"))
        .target(&srv.url("notes.txt"))
        .target(&srv.url("missing.jpg"))
        .include("*.jpg")
        .include("*.mp4")
        .parallelism(2)
        .build();
    let id = h.dispatcher.submit(params).unwrap();
    let task = wait_terminal(&h.registry, &id).await;

    assert_eq!(task.status, TaskStatus::Completed, "error: {:?}", task.error);
    assert!(task.exit_code.is_none());
    let names: Vec<_> = task.artifacts.iter().map(|a| a.name.as_str()).collect();
    assert_eq!(names, vec!["clip.mp4", "photo.jpg"]);

    let progress = task.progress.expect("scrape reports progress");
    assert_eq!(progress.unit, ProgressUnit::Targets);
    assert_eq!(progress.total, Some(3));
    assert_eq!(progress.done, 3);
    assert_eq!(progress.failed, 1);
    assert!(task.output.text.contains("skipped 1 targets by filter"));
}

#[tokio::test]
async fn scrape_with_only_failures_fails() {
    let srv = server().await;
    let h = harness().await;

    let params = ScrapeBuilder::new()
        .target(&srv.url("a.jpg"))
        .target(&srv.url("b.jpg"))
        .build();
    let id = h.dispatcher.submit(params).unwrap();
    let task = wait_terminal(&h.registry, &id).await;

    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.error.unwrap().reason, FailureReason::AllTargetsFailed);
}

const GALLERY: &str = r#"<html><body>
  <img src="photo.jpg" alt="photo">
  <video src="clip.mp4" poster="poster.jpg"></video>
  <a href="more.html">more</a>
  <a href="mailto:owner@example.com">mail</a>
</body></html>"#;

const MORE: &str = r#"<div style="background-image: url('notes.txt')"></div>
<img src="photo.jpg">"#;

async fn site() -> FileServer {
    FileServer::start([
        ("gallery.html", GALLERY.as_bytes().to_vec()),
        ("more.html", MORE.as_bytes().to_vec()),
        ("photo.jpg", vec![0xFF, 0xD8, 0xFF, 0xE0, 1, 2, 3]),
        ("clip.mp4", vec![0u8; 4096]),
        ("notes.txt", b"hello".to_vec()),
    ])
    .await
    .unwrap()
}

async fn manifest(query: &StatusQuery, id: &taskforge::types::TaskId) -> serde_json::Value {
    let (_, mut file) = query.open_artifact(id, Some("manifest.json")).await.unwrap();
    let mut body = Vec::new();
    file.read_to_end(&mut body).await.unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn scrape_fetches_media_found_on_the_start_page() {
    let srv = site().await;
    let h = harness().await;
    let query = StatusQuery::new(Arc::clone(&h.registry), h.store.clone());

    let params = ScrapeBuilder::new()
        .start_url(&srv.url("gallery.html"))
        .include("*.jpg")
        .include("*.mp4")
        .parallelism(2)
        .build();
    let id = h.dispatcher.submit(params).unwrap();
    let task = wait_terminal(&h.registry, &id).await;

    assert_eq!(task.status, TaskStatus::Completed, "error: {:?}", task.error);
    let names: Vec<_> = task.artifacts.iter().map(|a| a.name.as_str()).collect();
    assert_eq!(names, vec!["clip.mp4", "manifest.json", "photo.jpg"]);

    // poster.jpg is referenced but missing on the server.
    let progress = task.progress.unwrap();
    assert_eq!(progress.unit, ProgressUnit::Targets);
    assert_eq!(progress.total, Some(3));
    assert_eq!(progress.failed, 1);

    // Links are not followed unless asked.
    let manifest = manifest(&query, &id).await;
    assert_eq!(manifest["pagesVisited"].as_array().unwrap().len(), 1);
    assert_eq!(manifest["totalMedia"], 3);
    assert_eq!(manifest["media"][0]["kind"], "image");
    assert_eq!(manifest["media"][0]["context"], "<img src>");
    assert!(task.output.text.contains("discovered 3 media on 1 pages"));
}

#[tokio::test]
async fn analyze_only_follows_same_host_links_and_fetches_nothing() {
    let srv = site().await;
    let h = harness().await;
    let query = StatusQuery::new(Arc::clone(&h.registry), h.store.clone());

    let params = ScrapeBuilder::new()
        .start_url(&srv.url("gallery.html"))
        .follow_links(1)
        .analyze_only()
        .build();
    let id = h.dispatcher.submit(params).unwrap();
    let task = wait_terminal(&h.registry, &id).await;

    assert_eq!(task.status, TaskStatus::Completed, "error: {:?}", task.error);
    let names: Vec<_> = task.artifacts.iter().map(|a| a.name.as_str()).collect();
    assert_eq!(names, vec!["manifest.json"]);
    let progress = task.progress.unwrap();
    assert_eq!(progress.unit, ProgressUnit::Pages);
    assert_eq!(progress.done, 2);

    let manifest = manifest(&query, &id).await;
    assert_eq!(manifest["pagesVisited"].as_array().unwrap().len(), 2);
    // photo.jpg appears on both pages but is listed once.
    let urls: Vec<&str> = manifest["media"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["url"].as_str().unwrap())
        .collect();
    assert_eq!(
        urls,
        vec![
            srv.url("photo.jpg"),
            srv.url("clip.mp4"),
            srv.url("poster.jpg"),
            srv.url("notes.txt"),
        ]
    );
    assert_eq!(manifest["media"][3]["kind"], "style_background");
}

#[tokio::test]
async fn page_budget_stops_the_crawl() {
    let srv = site().await;
    let h = harness().await;
    let query = StatusQuery::new(Arc::clone(&h.registry), h.store.clone());

    let params = ScrapeBuilder::new()
        .start_url(&srv.url("gallery.html"))
        .follow_links(3)
        .limit_pages(1)
        .analyze_only()
        .build();
    let id = h.dispatcher.submit(params).unwrap();
    let task = wait_terminal(&h.registry, &id).await;

    assert_eq!(task.status, TaskStatus::Completed);
    let manifest = manifest(&query, &id).await;
    assert_eq!(manifest["pagesVisited"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn unreadable_start_page_is_unreachable() {
    let srv = site().await;
    let h = harness().await;

    let params = ScrapeBuilder::new()
        .start_url(&srv.url("missing.html"))
        .build();
    let id = h.dispatcher.submit(params).unwrap();
    let task = wait_terminal(&h.registry, &id).await;

    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.error.unwrap().reason, FailureReason::Unreachable);
}
