// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! HTTP API
//!
//! Thin handlers over [`DownloadManager`]. All bodies are JSON.
//!
//! # Endpoints
//!
//! - `POST /download` - Queue a download
//! - `GET /status/:id` - Status of one job
//! - `GET /queue` - All jobs, newest first
//! - `POST /cancel/:id` - Cancel a pending or running job
//! - `POST /retry/:id` - Re-queue a failed job
//! - `GET /downloads` - Files in the download directory
//! - `POST /clear-history` - Forget completed and failed jobs
//! - `GET /health` - Health check
//!
//! # Example
//!
//! ```no_run
//! use vidqueue::config::Config;
//! use vidqueue::server::Server;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let server = Server::from_config(&Config::default());
//! server.start().await?;
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use anyhow::Result;
use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit, Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Serialize;
use tower_http::timeout::TimeoutLayer;

use crate::config::Config;
use crate::download::{
    files, DownloadManager, FileEntry, JobId, JobRequest, JobSnapshot, JobStatus, ProcessRunner,
};
use crate::error::{FailureBody, QueueError};

/// Maximum request body size (64 KiB). Requests are tiny JSON objects.
const MAX_BODY_SIZE: usize = 64 * 1024;

/// Per-request timeout. No handler waits on a download.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// API server configuration.
pub struct Server {
    manager: DownloadManager,
    port: u16,
    /// Address to bind to (defaults to 127.0.0.1).
    bind_address: String,
}

impl Server {
    /// Create a server for `manager` on the default port, bound to localhost.
    pub fn new(manager: DownloadManager) -> Self {
        let defaults = Config::default();
        Self {
            manager,
            port: defaults.port,
            bind_address: defaults.bind_address,
        }
    }

    /// Build the manager and server described by `config`.
    pub fn from_config(config: &Config) -> Self {
        let runner = ProcessRunner::new(config.downloader_command(), &config.downloads_dir)
            .with_cancel_grace(config.cancel_grace());
        let manager = DownloadManager::new(runner, config.queue_settings());
        Self::new(manager)
            .with_port(config.port)
            .with_bind_address(config.bind_address.clone())
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the bind address.
    /// Use "0.0.0.0" to allow network access, "127.0.0.1" (default) for localhost only.
    pub fn with_bind_address(mut self, addr: impl Into<String>) -> Self {
        self.bind_address = addr.into();
        self
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn bind_address(&self) -> &str {
        &self.bind_address
    }

    pub fn manager(&self) -> &DownloadManager {
        &self.manager
    }

    /// Start the server with graceful shutdown.
    ///
    /// A running download is killed when the runtime shuts down.
    pub async fn start(&self) -> Result<()> {
        let app = router(self.manager.clone());
        let addr = format!("{}:{}", self.bind_address, self.port);

        tracing::info!(
            output_dir = ?self.manager.runner().output_dir(),
            downloader = ?self.manager.runner().downloader().program,
            "Starting server on {}",
            addr
        );

        if self.bind_address == "0.0.0.0" {
            tracing::warn!(
                "Server is binding to 0.0.0.0 which exposes the API to the network. \
                Use 127.0.0.1 (default) for local-only access."
            );
        }

        let listener = tokio::net::TcpListener::bind(&addr).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                anyhow::anyhow!(
                    "Port {} is already in use. \
                    This usually means another vidqueue server is running. \
                    Stop the other instance or use a different port with: vidqueue serve --port <PORT>",
                    self.port
                )
            } else {
                anyhow::anyhow!("Failed to bind to {}: {}", addr, e)
            }
        })?;

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        Ok(())
    }
}

/// Build the API router around `manager`.
pub fn router(manager: DownloadManager) -> Router {
    Router::new()
        .route("/download", post(download_handler))
        .route("/status/:id", get(status_handler))
        .route("/queue", get(queue_handler))
        .route("/cancel/:id", post(cancel_handler))
        .route("/retry/:id", post(retry_handler))
        .route("/downloads", get(downloads_handler))
        .route("/clear-history", post(clear_history_handler))
        .route("/health", get(health_handler))
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .with_state(manager)
}

// =============================================================================
// Response Types
// =============================================================================

#[derive(Serialize)]
struct SubmitResponse {
    success: bool,
    task_id: JobId,
}

#[derive(Serialize)]
struct SuccessResponse {
    success: bool,
}

#[derive(Serialize)]
struct MessageResponse {
    success: bool,
    message: String,
}

#[derive(Serialize)]
struct StatusResponse {
    status: JobStatus,
    progress: f64,
    filename: String,
    error: Option<String>,
}

#[derive(Serialize)]
struct QueueResponse {
    tasks: Vec<JobSnapshot>,
    queue_size: usize,
}

#[derive(Serialize)]
struct DownloadsResponse {
    files: Vec<FileEntry>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    queue_size: usize,
}

fn failure(status: StatusCode, error: impl Into<String>) -> Response {
    let body = FailureBody {
        success: false,
        error: error.into(),
    };
    (status, Json(body)).into_response()
}

// =============================================================================
// Handlers
// =============================================================================

async fn download_handler(
    State(manager): State<DownloadManager>,
    payload: Result<Json<JobRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            tracing::debug!(error = %rejection.body_text(), "Malformed download request");
            // Oversized bodies keep 413; every other rejection is a bad request.
            let status = match rejection.status() {
                StatusCode::PAYLOAD_TOO_LARGE => StatusCode::PAYLOAD_TOO_LARGE,
                _ => StatusCode::BAD_REQUEST,
            };
            return failure(status, rejection.body_text());
        }
    };

    match manager.submit(request) {
        Ok(task_id) => Json(SubmitResponse {
            success: true,
            task_id,
        })
        .into_response(),
        Err(e) => e.into_response(),
    }
}

async fn status_handler(
    State(manager): State<DownloadManager>,
    Path(id): Path<String>,
) -> Result<Json<StatusResponse>, QueueError> {
    let snapshot = manager.status(&id)?;
    Ok(Json(StatusResponse {
        status: snapshot.status,
        progress: snapshot.progress,
        filename: snapshot.filename,
        error: snapshot.error,
    }))
}

async fn queue_handler(State(manager): State<DownloadManager>) -> Json<QueueResponse> {
    Json(QueueResponse {
        tasks: manager.list(),
        queue_size: manager.queue_size(),
    })
}

async fn cancel_handler(
    State(manager): State<DownloadManager>,
    Path(id): Path<String>,
) -> Result<Json<SuccessResponse>, QueueError> {
    manager.cancel(&id)?;
    Ok(Json(SuccessResponse { success: true }))
}

async fn retry_handler(
    State(manager): State<DownloadManager>,
    Path(id): Path<String>,
) -> Result<Json<SuccessResponse>, QueueError> {
    manager.retry(&id)?;
    Ok(Json(SuccessResponse { success: true }))
}

async fn downloads_handler(State(manager): State<DownloadManager>) -> Response {
    match files::list_files(manager.runner().output_dir()) {
        Ok(files) => Json(DownloadsResponse { files }).into_response(),
        Err(e) => {
            tracing::error!(error = %format!("{:#}", e), "Failed to list downloads");
            failure(StatusCode::INTERNAL_SERVER_ERROR, "Could not read the download directory")
        }
    }
}

async fn clear_history_handler(State(manager): State<DownloadManager>) -> Json<MessageResponse> {
    let removed = manager.clear_history();
    Json(MessageResponse {
        success: true,
        message: format!("Cleared {} finished task(s)", removed),
    })
}

async fn health_handler(State(manager): State<DownloadManager>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        queue_size: manager.queue_size(),
    })
}

/// Graceful shutdown signal handler.
///
/// Waits for SIGINT/SIGTERM (Ctrl+C elsewhere).
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => {
                        tracing::info!("Received SIGTERM, initiating graceful shutdown...");
                    }
                    _ = sigint.recv() => {
                        tracing::info!("Received SIGINT (Ctrl+C), initiating graceful shutdown...");
                    }
                }
            }
            _ => {
                tracing::warn!("Failed to install signal handlers, falling back to Ctrl+C");
                wait_for_ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        wait_for_ctrl_c().await;
    }

    tracing::info!("Shutting down server");
}

async fn wait_for_ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Received Ctrl+C, initiating graceful shutdown..."),
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::QueueSettings;

    fn manager() -> DownloadManager {
        let runner = ProcessRunner::new(Default::default(), "downloads");
        DownloadManager::new(runner, QueueSettings::default())
    }

    #[test]
    fn test_server_creation() {
        let server = Server::new(manager());
        assert_eq!(server.port(), 5000);
        assert_eq!(server.bind_address(), "127.0.0.1");
    }

    #[test]
    fn test_server_builder() {
        let server = Server::new(manager())
            .with_port(8080)
            .with_bind_address("0.0.0.0");
        assert_eq!(server.port(), 8080);
        assert_eq!(server.bind_address(), "0.0.0.0");
    }

    #[test]
    fn test_server_from_config() {
        let config = Config {
            port: 5055,
            downloads_dir: "media".into(),
            ..Config::default()
        };
        let server = Server::from_config(&config);
        assert_eq!(server.port(), 5055);
        assert_eq!(
            server.manager().runner().output_dir(),
            std::path::Path::new("media")
        );
    }
}
