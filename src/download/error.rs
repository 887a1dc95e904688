// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download error taxonomy.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use super::manager::{MAX_CONCURRENT, MIN_CONCURRENT};

/// Errors raised by the download queue and its collaborators.
///
/// Every variant renders a reason string suitable for showing to a user.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// The request itself is unusable (empty URL and similar).
    #[error("{0}")]
    InvalidRequest(String),

    /// None of the candidate executables answered `--version`.
    #[error("yt-dlp not found (tried: {})", .tried.join(", "))]
    Discovery { tried: Vec<String> },

    /// The tool was found but the process could not be started.
    #[error("Failed to start {}: {source}", .program.display())]
    Launch {
        program: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The process started and then exited unsuccessfully.
    #[error("{0}")]
    Runtime(String),

    /// A partial file could not be deleted during removal.
    #[error("Could not delete partial file {file}: {source}")]
    Cleanup {
        file: String,
        #[source]
        source: io::Error,
    },

    #[error("Limit must be between {} and {}", MIN_CONCURRENT, MAX_CONCURRENT)]
    InvalidCeiling(usize),

    /// The queue worker has stopped.
    #[error("Download queue is shut down")]
    ManagerClosed,
}

impl DownloadError {
    /// True for failures that happen before any process exists.
    pub fn is_launch_failure(&self) -> bool {
        matches!(self, DownloadError::Discovery { .. } | DownloadError::Launch { .. })
    }
}
