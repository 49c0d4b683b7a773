// src/http/mod.rs

//! REST/JSON boundary over the dispatcher and the query API.
//!
//! - [`handlers`] holds one function per route.
//! - [`schema`] defines the camelCase wire shapes.
//! - [`error`] maps `ServiceError` onto status codes.

pub mod error;
pub mod handlers;
pub mod schema;

use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use axum::routing::{get, post};
use tokio::net::TcpListener;
use tracing::info;

use crate::query::StatusQuery;
use crate::scheduler::Dispatcher;

/// State injected into every handler.
#[derive(Debug, Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub query: StatusQuery,
}

impl AppState {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        let query = StatusQuery::new(
            Arc::clone(dispatcher.registry()),
            dispatcher.store().clone(),
        );
        Self { dispatcher, query }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/stats", get(handlers::stats))
        .route("/tasks", post(handlers::submit_task).get(handlers::list_tasks))
        .route(
            "/tasks/{id}",
            get(handlers::get_task).delete(handlers::delete_task),
        )
        .route("/tasks/{id}/status", get(handlers::get_status))
        .route("/tasks/{id}/output", get(handlers::get_output))
        .route("/tasks/{id}/result", get(handlers::get_result))
        .route("/tasks/{id}/cancel", post(handlers::cancel_task))
        .with_state(state)
}

/// Serve until `shutdown` resolves, then finish in-flight requests.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr().context("reading listener address")?;
    info!(%addr, "HTTP server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("HTTP server failed")?;

    info!("HTTP server stopped");
    Ok(())
}
