// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! vidqueue - Local yt-dlp download queue
//!
//! Runs yt-dlp downloads in the background with a bounded number of
//! concurrent processes and exposes the queue to a browser UI:
//!
//! **HTTP/SSE API** -> **Queue worker** -> **yt-dlp processes**
//!
//! # Core Modules
//!
//! - [`download`] - Queue manager, process launcher, output parsing
//! - [`server`] - HTTP server and live event stream
//! - [`config`] - Persistent settings
//! - [`errors`] - HTTP error responses

pub mod config;
pub mod download;
pub mod errors;
pub mod server;

pub use config::{load_config, save_config, Config};
pub use download::{
    BroadcastSink, DownloadError, Job, JobId, JobRequest, JobStatus, Launcher, NotificationSink, QueueEvent,
    QueueManager, QueueOptions, QueueStatus, YtDlpLauncher,
};
pub use errors::{generate_reference_code, ApiError, ApiResult};
pub use server::Server;
