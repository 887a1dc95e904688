// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! API server
//!
//! HTTP and server-sent-events front end for the download queue, consumed
//! by the browser UI.
//!
//! # Endpoints
//!
//! - `GET /` - API description
//! - `POST /api/info` - Media info for a URL
//! - `POST /api/download` - Queue a download
//! - `GET /api/queue` - Queue snapshot
//! - `POST /api/queue/{pause,resume,cancel}/:id` - Job control
//! - `DELETE /api/queue/:id` - Remove a job and its partial files
//! - `POST /api/queue/remove-only/:id` - Remove a job, keep files
//! - `POST /api/queue/clear-completed` - Drop completed jobs
//! - `POST /api/queue/concurrent-limit` - Change the concurrency limit
//! - `GET /api/downloads` - Files in the downloads directory
//! - `DELETE /api/delete-file` - Delete one of those files
//! - `GET /api/events` - Live queue events
//!
//! # Example
//!
//! ```no_run
//! use vidqueue::server::Server;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let server = Server::new(3000).with_downloads_dir("./downloads");
//! server.start().await?;
//! # Ok(())
//! # }
//! ```

use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    extract::{DefaultBodyLimit, Path, State},
    http::{header, HeaderValue, Method},
    response::{
        sse::{Event, KeepAlive, Sse},
        Json,
    },
    routing::{delete, get, post},
    Router,
};
use futures_util::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::download::files::{delete_download, list_downloads, DownloadedFile};
use crate::download::info::{probe_info, MediaInfo};
use crate::download::{
    default_tool_candidates, validate_url, BroadcastSink, JobId, JobRequest, NotificationSink, QueueEvent,
    QueueManager, QueueOptions, QueueStatus, ToolLocator, YtDlpLauncher, DEFAULT_CONCURRENT,
};
use crate::errors::{ApiError, ApiResult};

// Maximum request body size (1MB)
const MAX_BODY_SIZE: usize = 1024 * 1024;

/// Server state shared across handlers.
pub struct AppState {
    pub queue: QueueManager,
    /// Event fan-out; also feeds the SSE endpoint.
    pub sink: BroadcastSink,
    /// Used for info lookups.
    pub locator: ToolLocator,
    pub downloads_dir: PathBuf,
}

impl AppState {
    pub fn new(queue: QueueManager, sink: BroadcastSink, locator: ToolLocator, downloads_dir: PathBuf) -> Self {
        Self {
            queue,
            sink,
            locator,
            downloads_dir,
        }
    }
}

/// API server configuration.
#[derive(Debug, Clone)]
pub struct Server {
    port: u16,
    /// Address to bind to (defaults to 127.0.0.1 for security).
    bind_address: String,
    downloads_dir: PathBuf,
    max_concurrent: usize,
    tool_candidates: Vec<String>,
    allowed_origins: Vec<String>,
    kill_grace: Duration,
}

impl Default for Server {
    fn default() -> Self {
        Self::new(3000)
    }
}

impl Server {
    /// Create a new server with the specified port.
    /// By default, binds to 127.0.0.1 (localhost only) for security.
    pub fn new(port: u16) -> Self {
        Self {
            port,
            bind_address: "127.0.0.1".to_string(),
            downloads_dir: PathBuf::from("./downloads"),
            max_concurrent: DEFAULT_CONCURRENT,
            tool_candidates: default_tool_candidates(),
            allowed_origins: Vec::new(),
            kill_grace: Duration::from_secs(10),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            port: config.port,
            bind_address: config.bind_address.clone(),
            downloads_dir: config.downloads_dir.clone(),
            max_concurrent: config.ceiling(),
            tool_candidates: config.tool_candidates.clone(),
            allowed_origins: config.allowed_origins.clone(),
            kill_grace: config.kill_grace(),
        }
    }

    pub fn with_downloads_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.downloads_dir = dir.into();
        self
    }

    /// Build shared state, starting the download queue.
    pub fn build_state(&self) -> Arc<AppState> {
        let sink = BroadcastSink::default();
        let locator = ToolLocator::new(self.tool_candidates.clone());
        let launcher = YtDlpLauncher::new(locator.clone()).with_kill_grace(self.kill_grace);
        let queue = QueueManager::new(
            Arc::new(launcher),
            Arc::new(sink.clone()),
            QueueOptions {
                output_dir: self.downloads_dir.clone(),
                max_concurrent: self.max_concurrent,
            },
        );
        Arc::new(AppState::new(queue, sink, locator, self.downloads_dir.clone()))
    }

    /// Build the router with all routes plus CORS.
    pub fn build_router(&self, state: Arc<AppState>) -> Router {
        router(state).layer(cors_layer(self.allowed_origins.clone()))
    }

    /// Start the server with graceful shutdown.
    ///
    /// Running downloads are stopped (and left paused) before returning.
    pub async fn start(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.downloads_dir)
            .await
            .with_context(|| format!("Failed to create {}", self.downloads_dir.display()))?;

        let state = self.build_state();
        let queue = state.queue.clone();
        let router = self.build_router(state);
        let addr = format!("{}:{}", self.bind_address, self.port);

        tracing::info!("Starting server on {}", addr);
        tracing::info!("Downloads go to {}", self.downloads_dir.display());

        // Security warning if binding to all interfaces
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
                    Another vidqueue server may be running; use a different port with: vidqueue --port <PORT>",
                    self.port
                )
            } else {
                anyhow::anyhow!("Failed to bind to {}: {}", addr, e)
            }
        })?;

        // Stopping the queue first also ends open event streams.
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                shutdown_signal().await;
                if let Err(e) = queue.shutdown().await {
                    tracing::warn!("Download queue already stopped: {}", e);
                }
            })
            .await?;

        tracing::info!("Cleanup complete, server stopped");
        Ok(())
    }

    /// Get the port.
    pub fn port(&self) -> u16 {
        self.port
    }
}

/// Routes without CORS, ready for `oneshot` testing.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/api/info", post(info_handler))
        .route("/api/download", post(download_handler))
        .route("/api/queue", get(queue_handler))
        .route("/api/queue/pause/:id", post(pause_handler))
        .route("/api/queue/resume/:id", post(resume_handler))
        .route("/api/queue/cancel/:id", post(cancel_handler))
        .route("/api/queue/remove-only/:id", post(remove_only_handler))
        .route("/api/queue/clear-completed", post(clear_completed_handler))
        .route("/api/queue/concurrent-limit", post(concurrent_limit_handler))
        .route("/api/queue/:id", delete(remove_handler))
        .route("/api/downloads", get(downloads_handler))
        .route("/api/delete-file", delete(delete_file_handler))
        .route("/api/events", get(events_handler))
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Localhost on any port is always allowed.
fn is_local_origin(origin: &str) -> bool {
    ["http://localhost", "http://127.0.0.1", "http://[::1]"]
        .iter()
        .any(|host| match origin.strip_prefix(host) {
            Some(rest) => rest.is_empty() || rest.starts_with(':'),
            None => false,
        })
}

fn cors_layer(allowed: Vec<String>) -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(move |origin: &HeaderValue, _| {
            origin
                .to_str()
                .map(|o| is_local_origin(o) || allowed.iter().any(|a| a == o))
                .unwrap_or(false)
        }))
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE])
}

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Deserialize)]
struct InfoRequest {
    #[serde(default)]
    url: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DownloadRequest {
    #[serde(default)]
    url: String,
    format: Option<String>,
    custom_filename: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DownloadResponse {
    download_id: JobId,
    status: &'static str,
    message: &'static str,
}

#[derive(Serialize)]
struct ActionResponse {
    success: bool,
    message: String,
}

impl ActionResponse {
    fn ok(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            success: true,
            message: message.into(),
        })
    }
}

#[derive(Deserialize)]
struct LimitRequest {
    limit: Option<Value>,
}

#[derive(Deserialize)]
struct DeleteFileRequest {
    #[serde(default)]
    filename: String,
}

// =============================================================================
// Handlers
// =============================================================================

async fn root_handler() -> Json<Value> {
    Json(json!({
        "name": "vidqueue",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
        "endpoints": [
            "POST /api/info",
            "POST /api/download",
            "GET /api/queue",
            "POST /api/queue/pause/:id",
            "POST /api/queue/resume/:id",
            "POST /api/queue/cancel/:id",
            "DELETE /api/queue/:id",
            "POST /api/queue/remove-only/:id",
            "POST /api/queue/clear-completed",
            "POST /api/queue/concurrent-limit",
            "GET /api/downloads",
            "DELETE /api/delete-file",
            "GET /api/events",
        ],
    }))
}

async fn info_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<InfoRequest>,
) -> ApiResult<Json<MediaInfo>> {
    validate_url(&request.url)?;
    let tool = state.locator.discover().await?;
    let info = probe_info(&tool, &request.url).await?;
    Ok(Json(info))
}

async fn download_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<DownloadRequest>,
) -> ApiResult<Json<DownloadResponse>> {
    validate_url(&request.url)?;

    let mut job = JobRequest::new(request.url);
    job.format = request.format;
    job.filename = request.custom_filename;
    let id = state.queue.submit(job).await?;

    Ok(Json(DownloadResponse {
        download_id: id,
        status: "queued",
        message: "Added to download queue",
    }))
}

async fn queue_handler(State(state): State<Arc<AppState>>) -> Json<QueueStatus> {
    Json(state.queue.snapshot())
}

fn parse_id(raw: &str, refusal: &str) -> ApiResult<JobId> {
    raw.parse().map_err(|_| ApiError::not_found(refusal))
}

async fn pause_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<ActionResponse>> {
    const REFUSED: &str = "Download not found or cannot be paused";
    let id = parse_id(&id, REFUSED)?;
    if state.queue.pause(id).await? {
        Ok(ActionResponse::ok("Download paused"))
    } else {
        Err(ApiError::not_found(REFUSED))
    }
}

async fn resume_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<ActionResponse>> {
    const REFUSED: &str = "Download not found or cannot be resumed";
    let id = parse_id(&id, REFUSED)?;
    if state.queue.resume(id).await? {
        Ok(ActionResponse::ok("Download resumed"))
    } else {
        Err(ApiError::not_found(REFUSED))
    }
}

async fn cancel_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<ActionResponse>> {
    const REFUSED: &str = "Download not found";
    let id = parse_id(&id, REFUSED)?;
    if state.queue.cancel(id).await? {
        Ok(ActionResponse::ok("Download cancelled"))
    } else {
        Err(ApiError::not_found(REFUSED))
    }
}

async fn remove_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<ActionResponse>> {
    let id = parse_id(&id, "Download not found")?;
    if state.queue.remove(id, true).await? {
        Ok(ActionResponse::ok("Download removed from queue"))
    } else {
        Err(ApiError::not_found("Download not found"))
    }
}

async fn remove_only_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<ActionResponse>> {
    let id = parse_id(&id, "Download not found")?;
    if state.queue.remove_only(id).await? {
        Ok(ActionResponse::ok("Download removed from queue (file kept)"))
    } else {
        Err(ApiError::not_found("Download not found"))
    }
}

async fn clear_completed_handler(State(state): State<Arc<AppState>>) -> ApiResult<Json<Value>> {
    let cleared = state.queue.clear_completed().await?;
    Ok(Json(json!({
        "success": true,
        "message": format!("Cleared {} completed download(s)", cleared),
        "cleared": cleared,
    })))
}

async fn concurrent_limit_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<LimitRequest>,
) -> ApiResult<Json<Value>> {
    let limit = request
        .limit
        .as_ref()
        .and_then(Value::as_u64)
        .ok_or_else(|| ApiError::bad_request("Limit must be between 1 and 10"))?;
    let limit = usize::try_from(limit).unwrap_or(usize::MAX);
    state.queue.set_ceiling(limit).await?;

    Ok(Json(json!({
        "success": true,
        "message": format!("Concurrent download limit set to {}", limit),
        "limit": limit,
    })))
}

async fn downloads_handler(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<DownloadedFile>>> {
    let files = list_downloads(&state.downloads_dir)
        .await
        .map_err(|e| ApiError::internal(&format!("Could not list downloads: {e}")))?;
    Ok(Json(files))
}

async fn delete_file_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<DeleteFileRequest>,
) -> ApiResult<Json<ActionResponse>> {
    delete_download(&state.downloads_dir, &request.filename).await?;

    state.sink.emit(QueueEvent::FileDeleted {
        filename: request.filename.clone(),
    });
    state.sink.emit(QueueEvent::DownloadsUpdated);
    Ok(ActionResponse::ok("File deleted successfully"))
}

/// Live events. Starts with a queue snapshot so late subscribers catch up.
async fn events_handler(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let initial = QueueEvent::QueueUpdate(state.queue.snapshot());
    let receiver = state.sink.subscribe();
    tracing::debug!("Event stream opened ({} subscribers)", state.sink.subscriber_count());
    let updates = BroadcastStream::new(receiver).filter_map(|item| async move {
        match item {
            Ok(event) => Some(event),
            Err(BroadcastStreamRecvError::Lagged(missed)) => {
                tracing::debug!("Event subscriber lagged, {} events dropped", missed);
                None
            }
        }
    });

    let queue = state.queue.clone();
    let events = stream::once(async move { initial })
        .chain(updates)
        .take_until(async move { queue.closed().await })
        .map(|event| Ok(sse_event(&event)));

    Sse::new(events).keep_alive(KeepAlive::default())
}

fn sse_event(event: &QueueEvent) -> Event {
    let data = serde_json::to_value(event)
        .ok()
        .and_then(|mut value| value.get_mut("data").map(Value::take))
        .unwrap_or_else(|| json!({}));
    Event::default().event(event.name()).data(data.to_string())
}

/// Graceful shutdown signal handler.
///
/// Waits for SIGINT/SIGTERM.
async fn shutdown_signal() {
    // On Unix, listen for SIGINT and SIGTERM
    // On Windows, fall back to Ctrl+C only
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(term), Ok(int)) => (term, int),
            (Err(e), _) | (_, Err(e)) => {
                tracing::error!("Failed to install signal handlers: {}", e);
                return std::future::pending().await;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown...");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT (Ctrl+C), initiating graceful shutdown...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        // Fallback: just handle Ctrl+C on non-Unix platforms (Windows)
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            return std::future::pending().await;
        }
        tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_creation() {
        let server = Server::new(3000);
        assert_eq!(server.port(), 3000);
        assert_eq!(server.bind_address, "127.0.0.1");
    }

    #[test]
    fn test_server_from_config() {
        let config = Config {
            port: 8080,
            max_concurrent: 99,
            ..Config::default()
        };
        let server = Server::from_config(&config);
        assert_eq!(server.port(), 8080);
        assert_eq!(server.max_concurrent, 10);
    }

    #[test]
    fn test_local_origins() {
        assert!(is_local_origin("http://localhost:5173"));
        assert!(is_local_origin("http://localhost"));
        assert!(is_local_origin("http://127.0.0.1:3000"));
        assert!(!is_local_origin("http://localhost.evil.com"));
        assert!(!is_local_origin("https://example.com"));
    }
}
