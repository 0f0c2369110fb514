//! HTTP endpoint serving task payload files.
//!
//! # Design
//! - Files are addressed as `/stream/{id}/{file_index}`, the same shape
//!   `cinder_torrent_core::stream_url` produces.
//! - Paths are resolved through the live engine task on every request, so a
//!   moved or deleted task stops being served immediately.
//! - `start` replaces a running listener; `stop` shuts it down gracefully.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use axum::Router;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use cinder_torrent_core::{
    InfoHash, StreamingEndpoint, TorrentError, TorrentResult, TransferEngine,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{info, warn};

struct RunningServer {
    addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Axum-backed [`StreamingEndpoint`].
pub struct HttpStreamingEndpoint {
    engine: Arc<dyn TransferEngine>,
    server: Mutex<Option<RunningServer>>,
}

impl HttpStreamingEndpoint {
    /// Endpoint resolving files through `engine`.
    #[must_use]
    pub fn new(engine: Arc<dyn TransferEngine>) -> Self {
        Self {
            engine,
            server: Mutex::new(None),
        }
    }

    /// Bound address while serving.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lock_server().as_ref().map(|server| server.addr)
    }

    fn lock_server(&self) -> MutexGuard<'_, Option<RunningServer>> {
        self.server.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn router(&self) -> Router {
        Router::new()
            .route("/stream/{id}/{file_index}", get(serve_file))
            .with_state(Arc::clone(&self.engine))
    }
}

#[async_trait]
impl StreamingEndpoint for HttpStreamingEndpoint {
    async fn start(&self, host: &str, port: u16) -> TorrentResult<()> {
        self.stop().await;
        let listener = TcpListener::bind((host, port))
            .await
            .map_err(|err| TorrentError::operation_failed("streaming_bind", None, err))?;
        let addr = listener
            .local_addr()
            .map_err(|err| TorrentError::operation_failed("streaming_bind", None, err))?;

        let (shutdown, signal) = oneshot::channel::<()>();
        let router = self.router();
        let task = tokio::spawn(async move {
            let served = axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = signal.await;
                })
                .await;
            if let Err(err) = served {
                warn!(error = %err, "streaming endpoint stopped with error");
            }
        });
        info!(%addr, "streaming endpoint listening");
        *self.lock_server() = Some(RunningServer {
            addr,
            shutdown,
            task,
        });
        Ok(())
    }

    async fn stop(&self) {
        let Some(server) = self.lock_server().take() else {
            return;
        };
        let _ = server.shutdown.send(());
        if let Err(err) = server.task.await {
            warn!(error = %err, "streaming endpoint task join failed");
        }
        info!(addr = %server.addr, "streaming endpoint stopped");
    }
}

async fn serve_file(
    State(engine): State<Arc<dyn TransferEngine>>,
    Path((id, file_index)): Path<(String, usize)>,
) -> Response {
    let Ok(id) = InfoHash::parse(&id) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let Some(path) = engine
        .task(&id)
        .and_then(|task| task.file_path(file_index))
    else {
        return StatusCode::NOT_FOUND.into_response();
    };
    match tokio::fs::read(&path).await {
        Ok(bytes) => (
            [(header::CONTENT_TYPE, "application/octet-stream")],
            bytes,
        )
            .into_response(),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            StatusCode::NOT_FOUND.into_response()
        }
        Err(err) => {
            warn!(path = %path.display(), error = %err, "failed to read streamed file");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
