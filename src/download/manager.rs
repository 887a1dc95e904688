// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download queue manager.
//!
//! All job state lives in a single worker task. [`QueueManager`] is a
//! cheap cloneable handle that talks to it over a command channel and reads
//! snapshots from a watch channel. Process output is pumped by one task per
//! running download and handed back to the worker as discrete events.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use indexmap::IndexMap;
use tokio::sync::{mpsc, oneshot, watch};

use super::cleanup::{match_stem, purge_partial_files};
use super::error::DownloadError;
use super::events::{MessageLevel, NotificationSink, QueueEvent};
use super::launcher::{validate_url, LaunchParams, Launcher, ProcessExit, ProcessHandle, ProcessOutput, Terminator};
use super::parser::{parse_line, ProgressDelta};
use super::types::{Job, JobId, JobRequest, JobStatus, QueueStatus};

pub const MIN_CONCURRENT: usize = 1;
pub const MAX_CONCURRENT: usize = 10;
pub const DEFAULT_CONCURRENT: usize = 3;

const COMMAND_BUFFER: usize = 100;

/// Construction options for a [`QueueManager`].
#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// Directory the tool writes into.
    pub output_dir: PathBuf,
    /// Initial concurrency ceiling, clamped into the valid range.
    pub max_concurrent: usize,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("downloads"),
            max_concurrent: DEFAULT_CONCURRENT,
        }
    }
}

/// Commands handled by the queue worker.
#[derive(Debug)]
enum QueueCommand {
    Submit {
        request: JobRequest,
        reply: oneshot::Sender<Result<JobId, DownloadError>>,
    },
    Pause { id: JobId, reply: oneshot::Sender<bool> },
    Resume { id: JobId, reply: oneshot::Sender<bool> },
    Cancel { id: JobId, reply: oneshot::Sender<bool> },
    Remove {
        id: JobId,
        purge: bool,
        reply: oneshot::Sender<bool>,
    },
    ClearCompleted { reply: oneshot::Sender<usize> },
    SetCeiling {
        limit: usize,
        reply: oneshot::Sender<Result<(), DownloadError>>,
    },
    Shutdown { reply: oneshot::Sender<()> },
}

/// Messages from launch and output tasks back to the worker.
///
/// `run` identifies one launch of a job; events from an older run are
/// stale once the job was paused, cancelled or restarted.
#[derive(Debug)]
enum ProcessEvent {
    Launched {
        id: JobId,
        run: u64,
        result: Result<ProcessHandle, DownloadError>,
    },
    Output {
        id: JobId,
        run: u64,
        delta: ProgressDelta,
    },
    Exited {
        id: JobId,
        run: u64,
        exit: ProcessExit,
    },
}

/// Handle to the download queue.
#[derive(Debug, Clone)]
pub struct QueueManager {
    command_tx: mpsc::Sender<QueueCommand>,
    status_rx: watch::Receiver<QueueStatus>,
}

impl QueueManager {
    /// Start the queue worker. Must be called from within a tokio runtime.
    pub fn new(
        launcher: Arc<dyn Launcher>,
        sink: Arc<dyn NotificationSink>,
        options: QueueOptions,
    ) -> Self {
        let ceiling = options.max_concurrent.clamp(MIN_CONCURRENT, MAX_CONCURRENT);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(QueueStatus::empty(ceiling));

        let worker = QueueWorker {
            jobs: IndexMap::new(),
            active: HashMap::new(),
            purges: HashMap::new(),
            ceiling,
            next_id: 0,
            next_run: 0,
            output_dir: options.output_dir,
            launcher,
            sink,
            events_tx,
            status_tx,
        };
        tokio::spawn(worker.run(command_rx, events_rx));

        Self { command_tx, status_rx }
    }

    /// Queue a download. Never waits for a free slot.
    pub async fn submit(&self, request: JobRequest) -> Result<JobId, DownloadError> {
        self.request(|reply| QueueCommand::Submit { request, reply })
            .await?
    }

    /// Stop a running download, keeping it resumable.
    pub async fn pause(&self, id: JobId) -> Result<bool, DownloadError> {
        self.request(|reply| QueueCommand::Pause { id, reply }).await
    }

    pub async fn resume(&self, id: JobId) -> Result<bool, DownloadError> {
        self.request(|reply| QueueCommand::Resume { id, reply }).await
    }

    pub async fn cancel(&self, id: JobId) -> Result<bool, DownloadError> {
        self.request(|reply| QueueCommand::Cancel { id, reply }).await
    }

    /// Delete a job record, cancelling it first if it is running.
    ///
    /// With `purge_files` set and the job unfinished, partial output is
    /// removed from the destination directory before this returns. A running
    /// job's files are only touched once its process has exited. Cleanup
    /// problems are reported as status messages, not errors.
    pub async fn remove(&self, id: JobId, purge_files: bool) -> Result<bool, DownloadError> {
        self.request(|reply| QueueCommand::Remove {
            id,
            purge: purge_files,
            reply,
        })
        .await
    }

    /// Delete a job record and leave its files alone.
    pub async fn remove_only(&self, id: JobId) -> Result<bool, DownloadError> {
        self.remove(id, false).await
    }

    /// Drop every completed record. Returns how many were removed.
    pub async fn clear_completed(&self) -> Result<usize, DownloadError> {
        self.request(|reply| QueueCommand::ClearCompleted { reply }).await
    }

    pub async fn set_ceiling(&self, limit: usize) -> Result<(), DownloadError> {
        self.request(|reply| QueueCommand::SetCeiling { limit, reply })
            .await?
    }

    /// Consistent point-in-time view of the queue.
    pub fn snapshot(&self) -> QueueStatus {
        self.status_rx.borrow().clone()
    }

    /// Receiver that observes every snapshot change.
    pub fn watch(&self) -> watch::Receiver<QueueStatus> {
        self.status_rx.clone()
    }

    /// Terminate running downloads (they end up paused) and stop the worker.
    pub async fn shutdown(&self) -> Result<(), DownloadError> {
        self.request(|reply| QueueCommand::Shutdown { reply }).await
    }

    pub fn is_closed(&self) -> bool {
        self.command_tx.is_closed()
    }

    /// Resolves once the worker has stopped.
    pub async fn closed(&self) {
        self.command_tx.closed().await
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> QueueCommand,
    ) -> Result<T, DownloadError> {
        let (reply, response) = oneshot::channel();
        self.command_tx
            .send(build(reply))
            .await
            .map_err(|_| DownloadError::ManagerClosed)?;
        response.await.map_err(|_| DownloadError::ManagerClosed)
    }
}

/// A job holding a slot. `terminator` is empty while the launch is pending.
struct ActiveProcess {
    run: u64,
    terminator: Option<Terminator>,
}

/// File cleanup for a removed job, held until its process has exited so
/// no partial file is still open.
struct PendingPurge {
    run: u64,
    stem: Option<String>,
    reply: oneshot::Sender<bool>,
}

struct QueueWorker {
    jobs: IndexMap<JobId, Job>,
    active: HashMap<JobId, ActiveProcess>,
    purges: HashMap<JobId, PendingPurge>,
    ceiling: usize,
    next_id: u64,
    next_run: u64,
    output_dir: PathBuf,
    launcher: Arc<dyn Launcher>,
    sink: Arc<dyn NotificationSink>,
    events_tx: mpsc::UnboundedSender<ProcessEvent>,
    status_tx: watch::Sender<QueueStatus>,
}

impl QueueWorker {
    async fn run(
        mut self,
        mut command_rx: mpsc::Receiver<QueueCommand>,
        mut events_rx: mpsc::UnboundedReceiver<ProcessEvent>,
    ) {
        tracing::debug!("Download queue worker started (max {} concurrent)", self.ceiling);

        loop {
            tokio::select! {
                command = command_rx.recv() => match command {
                    Some(QueueCommand::Shutdown { reply }) => {
                        self.shutdown();
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        self.shutdown();
                        break;
                    }
                },
                Some(event) = events_rx.recv() => self.handle_event(event),
            }
        }

        tracing::debug!("Download queue worker stopped");
    }

    fn handle_command(&mut self, command: QueueCommand) {
        match command {
            QueueCommand::Submit { request, reply } => {
                let _ = reply.send(self.submit(request));
            }
            QueueCommand::Pause { id, reply } => {
                let _ = reply.send(self.pause(id));
            }
            QueueCommand::Resume { id, reply } => {
                let _ = reply.send(self.resume(id));
            }
            QueueCommand::Cancel { id, reply } => {
                let _ = reply.send(self.cancel(id));
            }
            QueueCommand::Remove { id, purge, reply } => self.remove(id, purge, reply),
            QueueCommand::ClearCompleted { reply } => {
                let _ = reply.send(self.clear_completed());
            }
            QueueCommand::SetCeiling { limit, reply } => {
                let _ = reply.send(self.set_ceiling(limit));
            }
            // Handled by the run loop.
            QueueCommand::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn submit(&mut self, request: JobRequest) -> Result<JobId, DownloadError> {
        validate_url(&request.url)?;

        self.next_id += 1;
        let id = JobId::new(self.next_id);
        let job = Job::new(id, request);

        if let Some(name) = &job.requested_filename {
            let clash = self.jobs.values().any(|other| {
                !other.status.is_terminal() && other.requested_filename.as_ref() == Some(name)
            });
            if clash {
                tracing::warn!("Filename '{}' is already used by a pending download", name);
                self.sink.emit(QueueEvent::StatusMessage {
                    message: format!("Another download already writes to '{name}'; it may be overwritten"),
                    level: MessageLevel::Info,
                });
            }
        }

        tracing::info!("Queued {} for {}", id, job.source_url);
        self.jobs.insert(id, job);
        self.publish();
        self.evaluate_slots();
        Ok(id)
    }

    fn pause(&mut self, id: JobId) -> bool {
        let paused = self.jobs.get_mut(&id).map_or(false, Job::pause);
        if !paused {
            return false;
        }
        self.stop_process(id);
        tracing::info!("Paused {}", id);
        self.publish();
        self.evaluate_slots();
        true
    }

    fn resume(&mut self, id: JobId) -> bool {
        let resumed = self.jobs.get_mut(&id).map_or(false, Job::resume);
        if resumed {
            tracing::info!("Resumed {}", id);
            self.publish();
            self.evaluate_slots();
        }
        resumed
    }

    fn cancel(&mut self, id: JobId) -> bool {
        let cancelled = self.jobs.get_mut(&id).map_or(false, Job::cancel);
        if cancelled {
            self.stop_process(id);
            tracing::info!("Cancelled {}", id);
            self.publish();
        }
        self.evaluate_slots();
        cancelled
    }

    fn remove(&mut self, id: JobId, purge: bool, reply: oneshot::Sender<bool>) {
        let Some(job) = self.jobs.shift_remove(&id) else {
            let _ = reply.send(false);
            return;
        };

        let stopped_run = self.stop_process(id);
        tracing::info!("Removed {} from queue", id);
        self.publish();
        self.evaluate_slots();

        if !purge || job.status == JobStatus::Completed {
            let _ = reply.send(true);
            return;
        }

        let stem = match_stem(&job);
        match stopped_run {
            Some(run) => {
                tracing::debug!("Purging files of {} once its process exits", id);
                self.purges.insert(id, PendingPurge { run, stem, reply });
            }
            None => self.purge_files(id, stem, reply),
        }
    }

    /// Run a purge held back for `run`, if there is one.
    fn release_purge(&mut self, id: JobId, run: u64) {
        if self.purges.get(&id).map_or(false, |pending| pending.run == run) {
            if let Some(pending) = self.purges.remove(&id) {
                self.purge_files(id, pending.stem, pending.reply);
            }
        }
    }

    /// Delete partial files of a removed job off the worker task, then reply.
    fn purge_files(&self, id: JobId, stem: Option<String>, reply: oneshot::Sender<bool>) {
        let protected: Vec<String> = self
            .jobs
            .values()
            .filter(|other| !other.status.is_terminal())
            .filter_map(match_stem)
            .collect();
        let dir = self.output_dir.clone();
        let sink = self.sink.clone();

        tokio::spawn(async move {
            let purge =
                tokio::task::spawn_blocking(move || purge_partial_files(&dir, stem.as_deref(), &protected));
            match purge.await {
                Ok(report) => {
                    if !report.is_clean() {
                        tracing::warn!("{} partial file(s) of {} could not be deleted", report.failures.len(), id);
                    }
                    for failure in &report.failures {
                        sink.emit(QueueEvent::error_message(failure.to_string()));
                    }
                    if !report.removed.is_empty() {
                        tracing::info!("Removed {} partial file(s) for {}", report.removed.len(), id);
                        sink.emit(QueueEvent::DownloadsUpdated);
                    }
                }
                Err(e) => {
                    tracing::error!("Partial file cleanup for {} panicked: {}", id, e);
                    sink.emit(QueueEvent::error_message(format!("Cleanup failed: {e}")));
                }
            }
            let _ = reply.send(true);
        });
    }

    fn clear_completed(&mut self) -> usize {
        let before = self.jobs.len();
        self.jobs.retain(|_, job| job.status != JobStatus::Completed);
        let removed = before - self.jobs.len();
        if removed > 0 {
            tracing::info!("Cleared {} completed download(s)", removed);
            self.publish();
        }
        removed
    }

    fn set_ceiling(&mut self, limit: usize) -> Result<(), DownloadError> {
        if !(MIN_CONCURRENT..=MAX_CONCURRENT).contains(&limit) {
            return Err(DownloadError::InvalidCeiling(limit));
        }
        if limit != self.ceiling {
            tracing::info!("Concurrent download limit {} -> {}", self.ceiling, limit);
            self.ceiling = limit;
            self.publish();
        }
        self.evaluate_slots();
        Ok(())
    }

    fn shutdown(&mut self) {
        let running: Vec<JobId> = self.active.keys().copied().collect();
        for id in running {
            self.stop_process(id);
            if let Some(job) = self.jobs.get_mut(&id) {
                job.pause();
            }
        }
        if !self.jobs.is_empty() {
            self.publish();
        }
        // Records are already gone; the files stay.
        for (_, pending) in self.purges.drain() {
            let _ = pending.reply.send(true);
        }
    }

    /// Bring the active set in line with the ceiling.
    ///
    /// Excess running jobs (newest first) go back to `queued`, then the
    /// oldest queued jobs fill any free slots.
    fn evaluate_slots(&mut self) {
        let mut changed = false;

        while self.active.len() > self.ceiling {
            let newest = self
                .active
                .iter()
                .max_by_key(|(_, process)| process.run)
                .map(|(id, _)| *id);
            let Some(id) = newest else { break };
            self.stop_process(id);
            if let Some(job) = self.jobs.get_mut(&id) {
                job.preempt();
            }
            tracing::info!("Requeued {} to respect the concurrency limit", id);
            changed = true;
        }

        let available = self.ceiling.saturating_sub(self.active.len());
        let next: Vec<JobId> = self
            .jobs
            .values()
            .filter(|job| job.status == JobStatus::Queued)
            .take(available)
            .map(|job| job.id)
            .collect();
        for id in next {
            changed |= self.start(id);
        }

        if changed {
            self.publish();
        }
    }

    fn start(&mut self, id: JobId) -> bool {
        let Some(job) = self.jobs.get_mut(&id) else {
            return false;
        };
        if !job.start() {
            return false;
        }

        self.next_run += 1;
        let run = self.next_run;
        self.active.insert(id, ActiveProcess { run, terminator: None });

        let params = LaunchParams {
            url: job.source_url.clone(),
            format: job.format_selector.clone(),
            filename: job.requested_filename.clone(),
            output_dir: self.output_dir.clone(),
        };
        tracing::info!("Starting {} ({})", id, params.url);

        let launcher = self.launcher.clone();
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let result = launcher.launch(&params).await;
            let _ = events.send(ProcessEvent::Launched { id, run, result });
        });
        true
    }

    /// Release a slot, asking the process to stop if it has started.
    /// Returns the run that held the slot.
    fn stop_process(&mut self, id: JobId) -> Option<u64> {
        let mut process = self.active.remove(&id)?;
        if let Some(terminator) = process.terminator.as_mut() {
            terminator.terminate();
        }
        Some(process.run)
    }

    fn is_current(&self, id: JobId, run: u64) -> bool {
        self.active.get(&id).map_or(false, |process| process.run == run)
    }

    fn handle_event(&mut self, event: ProcessEvent) {
        match event {
            ProcessEvent::Launched { id, run, result } => self.on_launched(id, run, result),
            ProcessEvent::Output { id, run, delta } => self.on_output(id, run, delta),
            ProcessEvent::Exited { id, run, exit } => self.on_exited(id, run, exit),
        }
    }

    fn on_launched(&mut self, id: JobId, run: u64, result: Result<ProcessHandle, DownloadError>) {
        if !self.is_current(id, run) {
            // Paused, cancelled or removed while the launch was pending.
            match result {
                Ok(handle) => {
                    tracing::debug!("Stopping stale process for {}", id);
                    let (output, mut terminator) = handle.into_parts();
                    terminator.terminate();
                    // Its exit still has to arrive before a held purge runs.
                    tokio::spawn(pump_output(id, run, output, true, self.events_tx.clone()));
                }
                Err(_) => self.release_purge(id, run),
            }
            return;
        }

        match result {
            Ok(handle) => {
                let (output, terminator) = handle.into_parts();
                if let Some(process) = self.active.get_mut(&id) {
                    process.terminator = Some(terminator);
                }
                let has_override = self.jobs.get(&id).map_or(false, Job::has_filename_override);
                tokio::spawn(pump_output(id, run, output, has_override, self.events_tx.clone()));
            }
            Err(err) => {
                self.active.remove(&id);
                let reason = err.to_string();
                tracing::error!("Could not start {}: {}", id, reason);
                if let Some(job) = self.jobs.get_mut(&id) {
                    job.fail(reason.clone());
                }
                self.sink.emit(QueueEvent::DownloadError {
                    download_id: id,
                    message: reason.clone(),
                });
                if err.is_launch_failure() {
                    self.sink
                        .emit(QueueEvent::error_message(format!("Download failed: {reason}")));
                }
                self.publish();
                self.evaluate_slots();
            }
        }
    }

    fn on_output(&mut self, id: JobId, run: u64, delta: ProgressDelta) {
        if !self.is_current(id, run) {
            return;
        }
        let Some(job) = self.jobs.get_mut(&id) else {
            return;
        };

        let title_changed = job.apply_progress(&delta);
        if delta.is_progress() {
            self.sink.emit(QueueEvent::DownloadProgress {
                download_id: id,
                progress: job.progress_percent,
                speed: job.transfer_rate.clone(),
                eta: job.estimated_time_remaining.clone(),
                status: job.status,
                message: None,
            });
        }

        if title_changed {
            tracing::debug!("{} is '{}'", id, job.display_title);
            self.publish();
        } else {
            self.refresh();
        }
    }

    fn on_exited(&mut self, id: JobId, run: u64, exit: ProcessExit) {
        if !self.is_current(id, run) {
            tracing::debug!("Ignoring exit of superseded process for {}", id);
            self.release_purge(id, run);
            return;
        }
        self.active.remove(&id);

        if let Some(job) = self.jobs.get_mut(&id) {
            if exit.success() {
                job.complete();
                let title = if job.display_title.is_empty() {
                    "Download".to_string()
                } else {
                    job.display_title.clone()
                };
                tracing::info!("Completed {} ({})", id, title);
                self.sink.emit(QueueEvent::DownloadProgress {
                    download_id: id,
                    progress: 100.0,
                    speed: String::new(),
                    eta: String::new(),
                    status: JobStatus::Completed,
                    message: Some("Download completed successfully!".to_string()),
                });
                self.sink.emit(QueueEvent::DownloadCompleted {
                    download_id: id,
                    message: format!("{title} downloaded successfully"),
                    title,
                });
                self.sink.emit(QueueEvent::DownloadsUpdated);
            } else {
                let reason = exit.failure_reason();
                tracing::warn!("{} failed: {}", id, reason);
                job.fail(reason.clone());
                self.sink.emit(QueueEvent::DownloadError {
                    download_id: id,
                    message: reason,
                });
            }
        }

        self.publish();
        self.evaluate_slots();
    }

    fn status(&self) -> QueueStatus {
        QueueStatus {
            queue: self.jobs.values().cloned().collect(),
            active_count: self.active.len(),
            max_concurrent: self.ceiling,
        }
    }

    /// Update the snapshot without announcing it.
    fn refresh(&self) {
        self.status_tx.send_replace(self.status());
    }

    /// Update the snapshot and notify observers.
    fn publish(&self) {
        let status = self.status();
        self.status_tx.send_replace(status.clone());
        self.sink.emit(QueueEvent::QueueUpdate(status));
    }
}

/// Forward parsed output of one process to the worker, then its exit.
async fn pump_output(
    id: JobId,
    run: u64,
    output: ProcessOutput,
    has_override: bool,
    events: mpsc::UnboundedSender<ProcessEvent>,
) {
    let ProcessOutput { mut lines, mut exit } = output;
    let forward = |line: &str| {
        tracing::trace!(target: "vidqueue::tool", "{}: {}", id, line);
        if let Some(delta) = parse_line(line, has_override) {
            let _ = events.send(ProcessEvent::Output { id, run, delta });
        }
    };

    let mut lines_open = true;
    let exit = loop {
        tokio::select! {
            biased;
            line = lines.recv(), if lines_open => match line {
                Some(line) => forward(&line),
                None => lines_open = false,
            },
            status = &mut exit => break status.unwrap_or_else(|_| ProcessExit::interrupted()),
        }
    };

    while let Ok(line) = lines.try_recv() {
        forward(&line);
    }

    let _ = events.send(ProcessEvent::Exited { id, run, exit });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::events::BroadcastSink;
    use async_trait::async_trait;
    use std::time::Duration;

    /// Launcher that always fails, counting attempts.
    struct FailingLauncher {
        attempts: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl Launcher for FailingLauncher {
        async fn launch(&self, _params: &LaunchParams) -> Result<ProcessHandle, DownloadError> {
            self.attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Err(DownloadError::Discovery {
                tried: vec!["yt-dlp".to_string()],
            })
        }
    }

    async fn wait_until(manager: &QueueManager, check: impl Fn(&QueueStatus) -> bool) -> QueueStatus {
        let mut rx = manager.watch();
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let status = rx.borrow_and_update().clone();
                if check(&status) {
                    return status;
                }
                if rx.changed().await.is_err() {
                    return manager.snapshot();
                }
            }
        })
        .await
        .expect("queue did not reach expected state")
    }

    fn manager(launcher: Arc<dyn Launcher>, sink: Arc<BroadcastSink>) -> QueueManager {
        QueueManager::new(
            launcher,
            sink,
            QueueOptions {
                output_dir: std::env::temp_dir(),
                max_concurrent: 2,
            },
        )
    }

    #[tokio::test]
    async fn test_launch_failure_marks_job_failed() {
        let launcher = Arc::new(FailingLauncher {
            attempts: Default::default(),
        });
        let sink = Arc::new(BroadcastSink::new(64));
        let mut events = sink.subscribe();
        let queue = manager(launcher.clone(), sink);

        let id = queue.submit(JobRequest::new("https://example.com/a")).await.unwrap();
        let status = wait_until(&queue, |s| s.count(JobStatus::Failed) == 1).await;

        let job = status.job(id).unwrap();
        assert!(job.last_error.as_deref().unwrap().contains("yt-dlp not found"));
        assert_eq!(status.active_count, 0);
        assert_eq!(launcher.attempts.load(std::sync::atomic::Ordering::SeqCst), 1);

        let mut saw_error = false;
        let mut saw_status = false;
        while let Ok(event) = events.try_recv() {
            match event {
                QueueEvent::DownloadError { download_id, .. } => saw_error = download_id == id,
                QueueEvent::StatusMessage { message, level } => {
                    saw_status = message.starts_with("Download failed:") && level == MessageLevel::Error
                }
                _ => {}
            }
        }
        assert!(saw_error);
        assert!(saw_status);
    }

    #[tokio::test]
    async fn test_empty_url_rejected() {
        let launcher = Arc::new(FailingLauncher {
            attempts: Default::default(),
        });
        let queue = manager(launcher.clone(), Arc::new(BroadcastSink::default()));
        let err = queue.submit(JobRequest::new("   ")).await.unwrap_err();
        assert!(matches!(err, DownloadError::InvalidRequest(_)));
        assert!(queue.snapshot().queue.is_empty());
    }

    #[tokio::test]
    async fn test_option_like_url_rejected() {
        let launcher = Arc::new(FailingLauncher {
            attempts: Default::default(),
        });
        let queue = manager(launcher.clone(), Arc::new(BroadcastSink::default()));
        for url in ["--version", "--exec=touch /tmp/x", " -a list.txt"] {
            let err = queue.submit(JobRequest::new(url)).await.unwrap_err();
            assert!(matches!(err, DownloadError::InvalidRequest(_)), "{url:?} accepted");
        }
        assert!(queue.snapshot().queue.is_empty());
        assert_eq!(launcher.attempts.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_ceiling_bounds() {
        let launcher = Arc::new(FailingLauncher {
            attempts: Default::default(),
        });
        let queue = manager(launcher, Arc::new(BroadcastSink::default()));
        assert!(matches!(queue.set_ceiling(0).await, Err(DownloadError::InvalidCeiling(0))));
        assert!(matches!(queue.set_ceiling(11).await, Err(DownloadError::InvalidCeiling(11))));
        queue.set_ceiling(5).await.unwrap();
        assert_eq!(queue.snapshot().max_concurrent, 5);
    }

    #[tokio::test]
    async fn test_closed_after_shutdown() {
        let launcher = Arc::new(FailingLauncher {
            attempts: Default::default(),
        });
        let queue = manager(launcher, Arc::new(BroadcastSink::default()));
        queue.shutdown().await.unwrap();
        let err = queue.submit(JobRequest::new("https://example.com")).await.unwrap_err();
        assert!(matches!(err, DownloadError::ManagerClosed));
    }

    #[tokio::test]
    async fn test_unknown_ids_are_refused() {
        let launcher = Arc::new(FailingLauncher {
            attempts: Default::default(),
        });
        let queue = manager(launcher, Arc::new(BroadcastSink::default()));
        let ghost = JobId::new(99);
        assert!(!queue.pause(ghost).await.unwrap());
        assert!(!queue.resume(ghost).await.unwrap());
        assert!(!queue.cancel(ghost).await.unwrap());
        assert!(!queue.remove(ghost, true).await.unwrap());
    }
}
