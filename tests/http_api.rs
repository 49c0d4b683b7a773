mod common;

use std::sync::Arc;

use axum::Router;
use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, Method, Request, StatusCode, header};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

use crate::common::builders::DispatchOptionsBuilder;
use crate::common::{FakeExecutor, Harness, wait_for, wait_terminal};

use taskforge::http::{AppState, router};
use taskforge::scheduler::{DispatchOptions, ExecutionPolicy};
use taskforge::types::{TaskId, TaskStatus};

struct TestApp {
    harness: Harness,
    app: Router,
}

impl TestApp {
    async fn new(exec: FakeExecutor, options: DispatchOptions) -> Self {
        Self::with_policy(exec, options, ExecutionPolicy::permissive()).await
    }

    async fn with_policy(exec: FakeExecutor, options: DispatchOptions, policy: ExecutionPolicy) -> Self {
        let harness = Harness::with_policy(Arc::new(exec), options, policy).await;
        let app = router(AppState::new(Arc::clone(&harness.dispatcher)));
        Self { harness, app }
    }

    async fn send(&self, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, HeaderMap, Bytes) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(v) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(v.to_string())
            }
            None => Body::empty(),
        };
        let response = self
            .app
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, headers, bytes)
    }

    async fn json(&self, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let (status, _, bytes) = self.send(method, uri, body).await;
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    async fn submit_shell(&self, command: &str) -> TaskId {
        let (status, body) = self
            .json(
                Method::POST,
                "/tasks",
                Some(json!({"kind": "shell_command", "parameters": {"command": command}})),
            )
            .await;
        assert_eq!(status, StatusCode::ACCEPTED, "body: {body}");
        body["taskId"].as_str().unwrap().parse().unwrap()
    }
}

#[tokio::test]
async fn submit_then_poll_until_completed() {
    let t = TestApp::new(FakeExecutor::completing(), DispatchOptionsBuilder::new().build()).await;

    let id = t.submit_shell("echo hi").await;
    wait_terminal(&t.harness.registry, &id).await;

    let (status, body) = t.json(Method::GET, &format!("/tasks/{id}/status"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "completed");
    assert_eq!(body["kind"], "shell_command");

    let (status, body) = t.json(Method::GET, &format!("/tasks/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], id.to_string());
    assert_eq!(body["parameters"]["command"], "echo hi");
    assert!(body["createdAt"].is_string());
    assert!(body["finishedAt"].is_string());
    assert_eq!(body["artifacts"][0]["name"], "result.txt");

    let (status, body) = t.json(Method::GET, &format!("/tasks/{id}/output"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["text"], "fake run done\n");
    assert_eq!(body["complete"], true);
}

#[tokio::test]
async fn result_streams_the_single_artifact() {
    let t = TestApp::new(FakeExecutor::completing(), DispatchOptionsBuilder::new().build()).await;
    let id = t.submit_shell("echo hi").await;
    wait_terminal(&t.harness.registry, &id).await;

    let (status, headers, bytes) = t.send(Method::GET, &format!("/tasks/{id}/result"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::CONTENT_TYPE], "application/octet-stream");
    assert_eq!(headers[header::CONTENT_LENGTH], "11");
    assert_eq!(&bytes[..], b"fake result");
}

#[tokio::test]
async fn unknown_and_malformed_ids() {
    let t = TestApp::new(FakeExecutor::completing(), DispatchOptionsBuilder::new().build()).await;

    let (status, body) = t
        .json(Method::GET, "/tasks/01ARZ3NDEKTSV4RRFFQ69G5FAV", None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "not_found");

    let (status, body) = t.json(Method::GET, "/tasks/not-an-id/status", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_parameters");
}

#[tokio::test]
async fn bad_submissions_are_rejected() {
    let t = TestApp::new(FakeExecutor::completing(), DispatchOptionsBuilder::new().build()).await;

    let (status, body) = t
        .json(
            Method::POST,
            "/tasks",
            Some(json!({"kind": "shell_command", "parameters": {"command": ""}})),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_parameters");

    let (status, _) = t
        .json(Method::POST, "/tasks", Some(json!({"kind": "teleport", "parameters": {}})))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = t
        .json(
            Method::POST,
            "/tasks",
            Some(json!({"kind": "url_download", "parameters": {"url": "not a url"}})),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_parameters");

    assert!(t.harness.registry.is_empty());
}

#[tokio::test]
async fn shell_is_forbidden_by_default_policy() {
    let t = TestApp::with_policy(
        FakeExecutor::completing(),
        DispatchOptionsBuilder::new().build(),
        ExecutionPolicy::default(),
    )
    .await;

    let (status, body) = t
        .json(
            Method::POST,
            "/tasks",
            Some(json!({"kind": "shell_command", "parameters": {"command": "rm -rf /"}})),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "forbidden");
    assert!(t.harness.registry.is_empty());
}

#[tokio::test]
async fn running_task_conflicts() {
    let exec = FakeExecutor::gated();
    let t = TestApp::new(exec.clone(), DispatchOptionsBuilder::new().build()).await;
    let id = t.submit_shell("echo wait").await;
    wait_for(&t.harness.registry, &id, |task| task.status == TaskStatus::Running).await;

    let (status, body) = t.json(Method::GET, &format!("/tasks/{id}/result"), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "invalid_state");

    let (status, _) = t.json(Method::DELETE, &format!("/tasks/{id}"), None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, body) = t.json(Method::POST, &format!("/tasks/{id}/cancel"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cancelRequested"], true);

    let task = wait_terminal(&t.harness.registry, &id).await;
    assert_eq!(task.status, TaskStatus::Cancelled);

    let (status, _) = t.json(Method::POST, &format!("/tasks/{id}/cancel"), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn overloaded_sets_retry_after() {
    let exec = FakeExecutor::gated();
    let t = TestApp::new(
        exec.clone(),
        DispatchOptionsBuilder::new()
            .max_concurrency(1)
            .backlog_limit(1)
            .build(),
    )
    .await;

    t.submit_shell("echo 1").await;
    exec.wait_started(1).await;
    let queued = t.submit_shell("echo 2").await;

    let (status, headers, bytes) = t
        .send(
            Method::POST,
            "/tasks",
            Some(json!({"kind": "shell_command", "parameters": {"command": "echo 3"}})),
        )
        .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(headers[header::RETRY_AFTER], "1");
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["code"], "overloaded");

    let (status, body) = t.json(Method::POST, &format!("/tasks/{queued}/cancel"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "cancelled");
    assert_eq!(body["cancelRequested"], false);

    exec.release(1);
}

#[tokio::test]
async fn delete_removes_only_terminal_tasks() {
    let t = TestApp::new(FakeExecutor::completing(), DispatchOptionsBuilder::new().build()).await;
    let id = t.submit_shell("echo bye").await;
    wait_terminal(&t.harness.registry, &id).await;

    let (status, _, bytes) = t.send(Method::DELETE, &format!("/tasks/{id}"), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(bytes.is_empty());

    let (status, _) = t.json(Method::GET, &format!("/tasks/{id}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Artifacts outlive the record.
    assert_eq!(t.harness.store.list(&id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn listing_pages_newest_first() {
    let t = TestApp::new(FakeExecutor::completing(), DispatchOptionsBuilder::new().build()).await;
    let mut ids = Vec::new();
    for i in 0..3 {
        ids.push(t.submit_shell(&format!("echo {i}")).await);
    }
    for id in &ids {
        wait_terminal(&t.harness.registry, id).await;
    }

    let (status, body) = t.json(Method::GET, "/tasks?limit=2", None).await;
    assert_eq!(status, StatusCode::OK);
    let tasks = body["tasks"].as_array().unwrap();
    assert_eq!(tasks.len(), 2);
    assert_eq!(tasks[0]["id"], ids[2].to_string());
    assert_eq!(tasks[1]["id"], ids[1].to_string());
    let cursor = body["nextCursor"].as_str().unwrap().to_string();

    let (_, body) = t
        .json(Method::GET, &format!("/tasks?limit=2&cursor={cursor}"), None)
        .await;
    let tasks = body["tasks"].as_array().unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0]["id"], ids[0].to_string());
    assert!(body.get("nextCursor").is_none());

    let (status, body) = t.json(Method::GET, "/tasks?status=failed", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["tasks"].as_array().unwrap().is_empty());

    let (status, _) = t.json(Method::GET, "/tasks?status=bogus", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn health_and_stats() {
    let t = TestApp::new(FakeExecutor::completing(), DispatchOptionsBuilder::new().build()).await;

    let (status, body) = t.json(Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (status, body) = t.json(Method::GET, "/stats", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["pool"]["maxConcurrency"], 2);
    assert_eq!(body["pool"]["running"], 0);
    assert_eq!(body["tasks"]["pending"], 0);
}
