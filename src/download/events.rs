// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Events emitted by the download queue and the sink that fans them out.

use serde::Serialize;
use tokio::sync::broadcast;

use super::types::{JobId, JobStatus, QueueStatus};

/// Severity of an operator-facing status message.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageLevel {
    Info,
    Error,
}

/// Everything observers can learn about the queue.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum QueueEvent {
    /// Full queue snapshot.
    QueueUpdate(QueueStatus),
    /// Per-job progress or status change.
    #[serde(rename_all = "camelCase")]
    DownloadProgress {
        download_id: JobId,
        progress: f64,
        speed: String,
        eta: String,
        status: JobStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    DownloadCompleted {
        download_id: JobId,
        title: String,
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    DownloadError { download_id: JobId, message: String },
    /// Advisory message for whoever is operating the UI.
    StatusMessage { message: String, level: MessageLevel },
    /// The set of files in the downloads directory changed.
    DownloadsUpdated,
    FileDeleted { filename: String },
}

impl QueueEvent {
    /// Event name used by transports that label messages.
    pub fn name(&self) -> &'static str {
        match self {
            QueueEvent::QueueUpdate(_) => "queue-update",
            QueueEvent::DownloadProgress { .. } => "download-progress",
            QueueEvent::DownloadCompleted { .. } => "download-completed",
            QueueEvent::DownloadError { .. } => "download-error",
            QueueEvent::StatusMessage { .. } => "status-message",
            QueueEvent::DownloadsUpdated => "downloads-updated",
            QueueEvent::FileDeleted { .. } => "file-deleted",
        }
    }

    pub fn error_message(message: impl Into<String>) -> Self {
        QueueEvent::StatusMessage {
            message: message.into(),
            level: MessageLevel::Error,
        }
    }
}

/// Receives queue events. Delivery is fire-and-forget: implementations must
/// not block the caller.
pub trait NotificationSink: Send + Sync + 'static {
    fn emit(&self, event: QueueEvent);
}

/// Broadcast fan-out to any number of subscribers.
///
/// Events sent while nobody is subscribed are dropped; slow subscribers
/// lose the oldest events once `capacity` is exceeded.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<QueueEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for BroadcastSink {
    fn default() -> Self {
        Self::new(256)
    }
}

impl NotificationSink for BroadcastSink {
    fn emit(&self, event: QueueEvent) {
        tracing::trace!(event = event.name(), "queue event");
        // No subscribers is not an error.
        let _ = self.tx.send(event);
    }
}
