use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

type Files = Arc<HashMap<String, Vec<u8>>>;

/// Tiny HTTP server handing out fixed files under `/files/{name}`.
///
/// Names ending in `.html` are served as `text/html`. Unknown names answer
/// `404`. The server stops when dropped.
pub struct FileServer {
    addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl FileServer {
    pub async fn start<I, N>(files: I) -> anyhow::Result<Self>
    where
        I: IntoIterator<Item = (N, Vec<u8>)>,
        N: Into<String>,
    {
        let files: Files = Arc::new(files.into_iter().map(|(n, b)| (n.into(), b)).collect());
        let app = Router::new()
            .route("/files/{name}", get(serve_file))
            .with_state(files);

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Ok(Self { addr, handle })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Absolute URL for `/files/{name}`.
    pub fn url(&self, name: &str) -> String {
        format!("http://{}/files/{}", self.addr, name)
    }
}

impl Drop for FileServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn serve_file(State(files): State<Files>, Path(name): Path<String>) -> Response {
    match files.get(&name) {
        Some(bytes) if name.ends_with(".html") => {
            ([(header::CONTENT_TYPE, "text/html; charset=utf-8")], bytes.clone()).into_response()
        }
        Some(bytes) => bytes.clone().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
