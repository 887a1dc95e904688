// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Job records and their lifecycle.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

use super::parser::ProgressDelta;

/// Format selector used when the caller does not pick one.
pub const DEFAULT_FORMAT: &str = "best";

/// Opaque job identifier, rendered as `download_<n>` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(u64);

impl JobId {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Numeric sequence value. Later submissions always have larger values.
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "download_{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = std::num::ParseIntError;

    /// Accepts both `download_7` and a bare `7`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.strip_prefix("download_").unwrap_or(s);
        digits.parse().map(JobId)
    }
}

impl Serialize for JobId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Status of a download job.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting for a free slot
    Queued,
    /// External process running
    Downloading,
    /// Stopped by the user, can be resumed
    Paused,
    /// Process exited successfully
    Completed,
    /// Launch or process failure
    Failed,
    /// Stopped by the user for good
    Cancelled,
}

impl JobStatus {
    /// Returns true once no further transition is possible (except deletion).
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Downloading => "downloading",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A download request as submitted by a caller.
#[derive(Debug, Clone, Default)]
pub struct JobRequest {
    pub url: String,
    pub format: Option<String>,
    pub filename: Option<String>,
}

impl JobRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }
}

/// One download request tracked end-to-end by the queue.
///
/// Field names on the wire follow what the browser UI consumes.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    #[serde(rename = "url")]
    pub source_url: String,
    #[serde(rename = "format")]
    pub format_selector: String,
    #[serde(rename = "customFilename")]
    pub requested_filename: Option<String>,
    pub status: JobStatus,
    #[serde(rename = "addedAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "progress")]
    pub progress_percent: f64,
    #[serde(rename = "speed")]
    pub transfer_rate: String,
    #[serde(rename = "eta")]
    pub estimated_time_remaining: String,
    #[serde(rename = "title")]
    pub display_title: String,
    #[serde(rename = "error")]
    pub last_error: Option<String>,
}

impl Job {
    /// Create a queued job. A filename override doubles as the initial title.
    pub fn new(id: JobId, request: JobRequest) -> Self {
        let format_selector = request
            .format
            .map(|f| f.trim().to_string())
            .filter(|f| !f.is_empty())
            .unwrap_or_else(|| DEFAULT_FORMAT.to_string());
        let requested_filename = request.filename.as_deref().and_then(sanitize_filename);

        Self {
            id,
            source_url: request.url.trim().to_string(),
            format_selector,
            display_title: requested_filename.clone().unwrap_or_default(),
            requested_filename,
            status: JobStatus::Queued,
            created_at: Utc::now(),
            progress_percent: 0.0,
            transfer_rate: String::new(),
            estimated_time_remaining: String::new(),
            last_error: None,
        }
    }

    pub fn has_filename_override(&self) -> bool {
        self.requested_filename.is_some()
    }

    /// queued -> downloading
    pub fn start(&mut self) -> bool {
        if self.status != JobStatus::Queued {
            return false;
        }
        self.status = JobStatus::Downloading;
        self.last_error = None;
        true
    }

    /// Fold a parsed progress delta into the record.
    ///
    /// Percent only moves forward while downloading; yt-dlp restarts at 0%
    /// for the audio stream of a merged format. Returns true when the title
    /// changed.
    pub fn apply_progress(&mut self, delta: &ProgressDelta) -> bool {
        if self.status != JobStatus::Downloading {
            return false;
        }
        if let Some(percent) = delta.percent {
            if percent > self.progress_percent {
                self.progress_percent = percent.min(100.0);
            }
            self.transfer_rate = delta.rate.clone().unwrap_or_default();
            self.estimated_time_remaining = delta.eta.clone().unwrap_or_default();
        }
        match delta.title.as_deref() {
            Some(title) => self.discover_title(title),
            None => false,
        }
    }

    /// Set the title from process output. Overrides always win and a
    /// non-empty title is frozen.
    pub fn discover_title(&mut self, title: &str) -> bool {
        let title = title.trim();
        if self.has_filename_override() || !self.display_title.is_empty() || title.is_empty() {
            return false;
        }
        self.display_title = title.to_string();
        true
    }

    /// downloading -> completed
    pub fn complete(&mut self) -> bool {
        if self.status != JobStatus::Downloading {
            return false;
        }
        self.status = JobStatus::Completed;
        self.progress_percent = 100.0;
        self.transfer_rate.clear();
        self.estimated_time_remaining.clear();
        true
    }

    /// downloading -> failed
    pub fn fail(&mut self, reason: impl Into<String>) -> bool {
        if self.status != JobStatus::Downloading {
            return false;
        }
        self.status = JobStatus::Failed;
        self.last_error = Some(reason.into());
        self.transfer_rate.clear();
        self.estimated_time_remaining.clear();
        true
    }

    /// downloading -> paused
    pub fn pause(&mut self) -> bool {
        if self.status != JobStatus::Downloading {
            return false;
        }
        self.status = JobStatus::Paused;
        self.transfer_rate.clear();
        self.estimated_time_remaining.clear();
        true
    }

    /// paused -> queued
    pub fn resume(&mut self) -> bool {
        if self.status != JobStatus::Paused {
            return false;
        }
        self.status = JobStatus::Queued;
        true
    }

    /// downloading -> queued, used when the ceiling drops below the active count.
    pub fn preempt(&mut self) -> bool {
        if self.status != JobStatus::Downloading {
            return false;
        }
        self.status = JobStatus::Queued;
        self.transfer_rate.clear();
        self.estimated_time_remaining.clear();
        true
    }

    /// queued | downloading | paused -> cancelled
    pub fn cancel(&mut self) -> bool {
        match self.status {
            JobStatus::Queued | JobStatus::Downloading | JobStatus::Paused => {
                self.status = JobStatus::Cancelled;
                self.transfer_rate.clear();
                self.estimated_time_remaining.clear();
                true
            }
            _ => false,
        }
    }
}

/// Make a caller-supplied filename safe to embed in an output template.
///
/// Returns `None` when nothing usable is left.
pub fn sanitize_filename(raw: &str) -> Option<String> {
    let cleaned: String = raw
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let cleaned = cleaned.trim_matches(|c: char| c == '.' || c.is_whitespace());
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned.to_string())
    }
}

/// Point-in-time view of the whole queue.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub queue: Vec<Job>,
    pub active_count: usize,
    pub max_concurrent: usize,
}

impl QueueStatus {
    pub fn empty(max_concurrent: usize) -> Self {
        Self {
            queue: Vec::new(),
            active_count: 0,
            max_concurrent,
        }
    }

    pub fn job(&self, id: JobId) -> Option<&Job> {
        self.queue.iter().find(|job| job.id == id)
    }

    /// Number of jobs in the given status.
    pub fn count(&self, status: JobStatus) -> usize {
        self.queue.iter().filter(|job| job.status == status).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> Job {
        Job::new(JobId::new(1), JobRequest::new("https://example.com/v"))
    }

    fn progress(percent: f64) -> ProgressDelta {
        ProgressDelta {
            percent: Some(percent),
            rate: Some("1.0MiB/s".to_string()),
            eta: Some("00:10".to_string()),
            title: None,
        }
    }

    #[test]
    fn test_job_id_round_trip() {
        let id = JobId::new(42);
        assert_eq!(id.to_string(), "download_42");
        assert_eq!("download_42".parse::<JobId>().unwrap(), id);
        assert_eq!("42".parse::<JobId>().unwrap(), id);
        assert!("download_x".parse::<JobId>().is_err());
    }

    #[test]
    fn test_new_job_defaults() {
        let job = job();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.format_selector, DEFAULT_FORMAT);
        assert!(job.display_title.is_empty());
        assert_eq!(job.progress_percent, 0.0);
    }

    #[test]
    fn test_override_is_initial_title() {
        let job = Job::new(
            JobId::new(1),
            JobRequest::new("u").with_filename("my clip"),
        );
        assert_eq!(job.display_title, "my clip");
        assert!(job.has_filename_override());
    }

    #[test]
    fn test_lifecycle_complete() {
        let mut job = job();
        assert!(job.start());
        assert!(!job.start());
        job.apply_progress(&progress(40.0));
        assert!(job.complete());
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress_percent, 100.0);
        assert!(!job.cancel());
        assert!(!job.pause());
    }

    #[test]
    fn test_progress_is_monotonic_while_downloading() {
        let mut job = job();
        job.start();
        job.apply_progress(&progress(60.0));
        job.apply_progress(&progress(5.0));
        assert_eq!(job.progress_percent, 60.0);
        job.apply_progress(&progress(99.5));
        assert_eq!(job.progress_percent, 99.5);
    }

    #[test]
    fn test_progress_ignored_unless_downloading() {
        let mut job = job();
        job.apply_progress(&progress(50.0));
        assert_eq!(job.progress_percent, 0.0);
    }

    #[test]
    fn test_title_frozen_once_set() {
        let mut job = job();
        assert!(job.discover_title("First.mp4"));
        assert!(!job.discover_title("Second.mp4"));
        assert!(!job.discover_title(""));
        assert_eq!(job.display_title, "First.mp4");
    }

    #[test]
    fn test_title_override_wins() {
        let mut job = Job::new(JobId::new(1), JobRequest::new("u").with_filename("mine"));
        assert!(!job.discover_title("Other.mp4"));
        assert_eq!(job.display_title, "mine");
    }

    #[test]
    fn test_pause_resume_cycle() {
        let mut job = job();
        assert!(!job.pause());
        job.start();
        assert!(job.pause());
        assert_eq!(job.status, JobStatus::Paused);
        assert!(!job.start());
        assert!(job.resume());
        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.start());
    }

    #[test]
    fn test_fail_records_reason() {
        let mut job = job();
        assert!(!job.fail("too early"));
        job.start();
        assert!(job.fail("Download failed with code 1"));
        assert_eq!(job.last_error.as_deref(), Some("Download failed with code 1"));
        assert!(job.status.is_terminal());
    }

    #[test]
    fn test_cancel_from_queued() {
        let mut job = job();
        assert!(job.cancel());
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(!job.resume());
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("a/b\\c"), Some("a_b_c".to_string()));
        assert_eq!(sanitize_filename("  ..  "), None);
        assert_eq!(sanitize_filename("../etc/passwd"), Some("_etc_passwd".to_string()));
        assert_eq!(sanitize_filename("My Clip"), Some("My Clip".to_string()));
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&JobStatus::Downloading).unwrap();
        assert_eq!(json, "\"downloading\"");
    }

    #[test]
    fn test_job_wire_names() {
        let value = serde_json::to_value(job()).unwrap();
        assert_eq!(value["id"], "download_1");
        assert_eq!(value["url"], "https://example.com/v");
        assert!(value.get("addedAt").is_some());
        assert!(value.get("customFilename").is_some());
    }
}
