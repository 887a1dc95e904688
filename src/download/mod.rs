// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download queue for vidqueue
//!
//! This module drives yt-dlp downloads with:
//! - A bounded number of concurrent processes (adjustable at runtime)
//! - Pause, resume, cancel and removal of individual jobs
//! - Progress and title discovery from the tool's output
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐
//! │ QueueManager    │────▶│ Queue worker    │
//! │ (handle)        │     │ (tokio task)    │
//! └────────┬────────┘     └───┬─────────┬───┘
//!          │ snapshots        │         │ events
//!          ▼                  ▼         ▼
//! ┌─────────────────┐  ┌────────────┐ ┌──────────────────┐
//! │ watch channel   │  │ Launcher   │ │ NotificationSink │
//! └─────────────────┘  │ + pumps    │ └──────────────────┘
//!                      └────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use vidqueue::download::{BroadcastSink, JobRequest, QueueManager, QueueOptions, YtDlpLauncher};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let sink = Arc::new(BroadcastSink::default());
//! let queue = QueueManager::new(Arc::new(YtDlpLauncher::default()), sink, QueueOptions::default());
//!
//! let id = queue.submit(JobRequest::new("https://example.com/watch?v=1")).await?;
//! println!("{} is {}", id, queue.snapshot().job(id).map(|j| j.status.as_str()).unwrap_or("gone"));
//! # Ok(())
//! # }
//! ```

pub mod cleanup;
pub mod error;
pub mod events;
pub mod files;
pub mod info;
pub mod launcher;
pub mod manager;
pub mod parser;
pub mod types;

// Re-export commonly used items
pub use error::DownloadError;
pub use events::{BroadcastSink, MessageLevel, NotificationSink, QueueEvent};
pub use launcher::{
    default_tool_candidates, validate_url, LaunchParams, Launcher, ProcessExit, ProcessHandle, ProcessOutput,
    Terminator, ToolLocator, YtDlpLauncher,
};
pub use manager::{QueueManager, QueueOptions, DEFAULT_CONCURRENT, MAX_CONCURRENT, MIN_CONCURRENT};
pub use parser::{parse_line, LineBuffer, ProgressDelta};
pub use types::{Job, JobId, JobRequest, JobStatus, QueueStatus};
