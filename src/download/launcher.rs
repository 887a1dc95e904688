// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Starting and supervising the external download tool.
//!
//! A [`Launcher`] turns [`LaunchParams`] into a [`ProcessHandle`]: a stream
//! of logical output lines, a one-shot completion signal and a way to ask
//! the process to stop. The queue only ever sees handles, so tests can
//! substitute scripted processes.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};

use super::error::DownloadError;
use super::parser::LineBuffer;

/// How long discovery waits for `<candidate> --version`.
const VERSION_CHECK_TIMEOUT: Duration = Duration::from_secs(15);

/// How long to wait for output readers after the process has exited.
/// Grandchildren (ffmpeg) can hold the pipes open past that point.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Default grace period between SIGINT and a hard kill.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(10);

/// Check a URL before it becomes the tool's first argument. Anything
/// starting with `-` would be parsed as an option.
pub fn validate_url(url: &str) -> Result<(), DownloadError> {
    let url = url.trim();
    if url.is_empty() {
        return Err(DownloadError::InvalidRequest("URL is required".to_string()));
    }
    if url.starts_with('-') {
        return Err(DownloadError::InvalidRequest("Invalid URL".to_string()));
    }
    Ok(())
}

/// Parameters for one download process.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchParams {
    pub url: String,
    pub format: String,
    /// Sanitised caller-supplied base name, without extension.
    pub filename: Option<String>,
    pub output_dir: PathBuf,
}

impl LaunchParams {
    /// `-o` template: the override when present, else the tool's title.
    pub fn output_template(&self) -> PathBuf {
        match &self.filename {
            Some(name) => self.output_dir.join(format!("{name}.%(ext)s")),
            None => self.output_dir.join("%(title)s.%(ext)s"),
        }
    }

    /// Full argument list passed to the tool.
    pub fn args(&self) -> Vec<String> {
        vec![
            self.url.clone(),
            "-o".to_string(),
            self.output_template().to_string_lossy().into_owned(),
            "--format".to_string(),
            self.format.clone(),
            "--newline".to_string(),
        ]
    }
}

/// How a process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code, `None` when killed by a signal or lost.
    pub code: Option<i32>,
    /// Last `ERROR:` line the tool printed on stderr.
    pub detail: Option<String>,
}

impl ProcessExit {
    pub fn code(code: i32) -> Self {
        Self { code: Some(code), detail: None }
    }

    pub fn interrupted() -> Self {
        Self { code: None, detail: None }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Human-readable reason for a failed exit.
    pub fn failure_reason(&self) -> String {
        let base = match self.code {
            Some(code) => format!("Download failed with code {code}"),
            None => "Download was interrupted".to_string(),
        };
        match &self.detail {
            Some(detail) => format!("{base}: {detail}"),
            None => base,
        }
    }
}

/// Read side of a running process.
#[derive(Debug)]
pub struct ProcessOutput {
    /// Logical stdout lines, closed when the stream ends.
    pub lines: mpsc::UnboundedReceiver<String>,
    /// Authoritative completion signal.
    pub exit: oneshot::Receiver<ProcessExit>,
}

/// Requests graceful termination of a process. Best effort: the process
/// may take a while to go away, and only its exit signal says it did.
/// Dropping the terminator of a live process also stops it.
#[derive(Debug)]
pub struct Terminator {
    stop: Option<oneshot::Sender<()>>,
}

impl Terminator {
    /// Returns false if termination was already requested or the process
    /// supervisor is gone.
    pub fn terminate(&mut self) -> bool {
        match self.stop.take() {
            Some(stop) => stop.send(()).is_ok(),
            None => false,
        }
    }
}

/// Opaque handle to one launched process.
#[derive(Debug)]
pub struct ProcessHandle {
    output: ProcessOutput,
    terminator: Terminator,
}

impl ProcessHandle {
    /// Assemble a handle from its channels. Launchers own the other ends.
    pub fn new(
        lines: mpsc::UnboundedReceiver<String>,
        exit: oneshot::Receiver<ProcessExit>,
        stop: oneshot::Sender<()>,
    ) -> Self {
        Self {
            output: ProcessOutput { lines, exit },
            terminator: Terminator { stop: Some(stop) },
        }
    }

    pub fn into_parts(self) -> (ProcessOutput, Terminator) {
        (self.output, self.terminator)
    }
}

/// Starts download processes.
#[async_trait]
pub trait Launcher: Send + Sync + 'static {
    /// Spawn exactly one process for `params`.
    ///
    /// Fails with [`DownloadError::Discovery`] when no tool is found and
    /// [`DownloadError::Launch`] when spawning fails. A process that starts
    /// and later exits non-zero is reported through its handle instead.
    async fn launch(&self, params: &LaunchParams) -> Result<ProcessHandle, DownloadError>;
}

/// Candidate executables in priority order for this platform.
pub fn default_tool_candidates() -> Vec<String> {
    let local = if cfg!(windows) { "./yt-dlp.exe" } else { "./yt-dlp" };
    vec![
        local.to_string(),
        "yt-dlp".to_string(),
        "yt-dlp.exe".to_string(),
        "youtube-dl".to_string(),
        "youtube-dl.exe".to_string(),
    ]
}

/// Finds a working download tool. Nothing is cached: every call probes the
/// candidates again, so installing the tool fixes later jobs.
#[derive(Debug, Clone)]
pub struct ToolLocator {
    candidates: Vec<String>,
}

impl ToolLocator {
    pub fn new(candidates: Vec<String>) -> Self {
        Self { candidates }
    }

    /// First candidate whose `--version` exits successfully.
    pub async fn discover(&self) -> Result<PathBuf, DownloadError> {
        for candidate in &self.candidates {
            if probe_version(candidate).await {
                tracing::debug!("Using download tool {}", candidate);
                return Ok(PathBuf::from(candidate));
            }
        }
        tracing::warn!("No download tool found among {:?}", self.candidates);
        Err(DownloadError::Discovery {
            tried: self.candidates.clone(),
        })
    }
}

impl Default for ToolLocator {
    fn default() -> Self {
        Self::new(default_tool_candidates())
    }
}

async fn probe_version(candidate: &str) -> bool {
    let status = Command::new(candidate)
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .status();

    match tokio::time::timeout(VERSION_CHECK_TIMEOUT, status).await {
        Ok(Ok(status)) => status.success(),
        Ok(Err(e)) => {
            tracing::trace!("Candidate {} unavailable: {}", candidate, e);
            false
        }
        Err(_) => {
            tracing::warn!("Candidate {} timed out answering --version", candidate);
            false
        }
    }
}

/// Launches yt-dlp (or a compatible tool) as a child process.
#[derive(Debug, Clone)]
pub struct YtDlpLauncher {
    locator: ToolLocator,
    kill_grace: Duration,
}

impl YtDlpLauncher {
    pub fn new(locator: ToolLocator) -> Self {
        Self {
            locator,
            kill_grace: DEFAULT_KILL_GRACE,
        }
    }

    /// Grace period after SIGINT before the process is killed outright.
    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }
}

impl Default for YtDlpLauncher {
    fn default() -> Self {
        Self::new(ToolLocator::default())
    }
}

#[async_trait]
impl Launcher for YtDlpLauncher {
    async fn launch(&self, params: &LaunchParams) -> Result<ProcessHandle, DownloadError> {
        validate_url(&params.url)?;

        let program = self.locator.discover().await?;
        spawn_process(&program, params, self.kill_grace)
    }
}

fn spawn_process(
    program: &Path,
    params: &LaunchParams,
    kill_grace: Duration,
) -> Result<ProcessHandle, DownloadError> {
    let mut child = Command::new(program)
        .args(params.args())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| DownloadError::Launch {
            program: program.to_path_buf(),
            source,
        })?;

    tracing::info!(
        pid = child.id(),
        url = %params.url,
        "Started {}",
        program.display()
    );

    let (line_tx, line_rx) = mpsc::unbounded_channel();
    let (exit_tx, exit_rx) = oneshot::channel();
    let (stop_tx, stop_rx) = oneshot::channel();

    let stdout_task = child.stdout.take().map(|out| tokio::spawn(forward_lines(out, line_tx)));
    let stderr_task = child.stderr.take().map(|err| tokio::spawn(last_error_line(err)));

    tokio::spawn(async move {
        let exit = supervise(child, stop_rx, kill_grace).await;

        if let Some(task) = stdout_task {
            if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, task).await.is_err() {
                tracing::debug!("stdout still open after exit, not waiting further");
            }
        }
        let detail = match stderr_task {
            Some(task) => tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, task)
                .await
                .ok()
                .and_then(|joined| joined.ok())
                .flatten(),
            None => None,
        };

        let exit = match detail {
            Some(detail) if !exit.success() => exit.with_detail(detail),
            _ => exit,
        };
        let _ = exit_tx.send(exit);
    });

    Ok(ProcessHandle::new(line_rx, exit_rx, stop_tx))
}

/// Wait for the child. A stop request, or the handle being dropped,
/// interrupts it and escalates to a kill after `kill_grace`.
async fn supervise(mut child: Child, stop_rx: oneshot::Receiver<()>, kill_grace: Duration) -> ProcessExit {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = stop_rx => {
            interrupt(&mut child);
            match tokio::time::timeout(kill_grace, child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    tracing::warn!(
                        pid = child.id(),
                        "Process ignored interrupt for {:?}, killing",
                        kill_grace
                    );
                    if let Err(e) = child.kill().await {
                        tracing::debug!("Kill failed: {}", e);
                    }
                    child.wait().await
                }
            }
        }
    };

    match status {
        Ok(status) => ProcessExit {
            code: status.code(),
            detail: None,
        },
        Err(e) => {
            tracing::error!("Failed waiting for download process: {}", e);
            ProcessExit::interrupted()
        }
    }
}

/// Send an interrupt so the tool can clean up its fragments.
#[cfg(unix)]
fn interrupt(child: &mut Child) {
    match child.id() {
        Some(pid) => {
            // SAFETY: kill(2) has no memory-safety preconditions; the pid
            // belongs to a child we have not reaped yet.
            let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGINT) };
            if rc != 0 {
                tracing::debug!(pid, "SIGINT failed: {}", std::io::Error::last_os_error());
            }
        }
        None => tracing::debug!("Process already reaped, nothing to interrupt"),
    }
}

#[cfg(not(unix))]
fn interrupt(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        tracing::debug!("Terminate request failed: {}", e);
    }
}

/// Forward logical lines from a pipe. Keeps draining after the receiver is
/// gone so the child never blocks on a full pipe.
async fn forward_lines<R>(mut reader: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut buffer = LineBuffer::new();
    let mut chunk = [0u8; 4096];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                for line in buffer.push(&chunk[..n]) {
                    let _ = tx.send(line);
                }
            }
            Err(e) => {
                tracing::debug!("Output read failed: {}", e);
                break;
            }
        }
    }
    if let Some(line) = buffer.finish() {
        let _ = tx.send(line);
    }
}

/// Drain stderr to EOF and keep the last `ERROR:` line. Bytes are decoded
/// lossily; stopping early would close the pipe under the child.
async fn last_error_line<R>(mut reader: R) -> Option<String>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = LineBuffer::new();
    let mut chunk = [0u8; 4096];
    let mut last = None;
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                for line in buffer.push(&chunk[..n]) {
                    note_error_line(&line, &mut last);
                }
            }
            Err(e) => {
                tracing::debug!("Error output read failed: {}", e);
                break;
            }
        }
    }
    if let Some(line) = buffer.finish() {
        note_error_line(&line, &mut last);
    }
    last
}

fn note_error_line(line: &str, last: &mut Option<String>) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    tracing::debug!(target: "vidqueue::tool", "{}", line);
    if line.starts_with("ERROR:") {
        *last = Some(line.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(filename: Option<&str>) -> LaunchParams {
        LaunchParams {
            url: "https://example.com/watch?v=1".to_string(),
            format: "best".to_string(),
            filename: filename.map(str::to_string),
            output_dir: PathBuf::from("/out"),
        }
    }

    #[test]
    fn test_output_template() {
        assert_eq!(params(None).output_template(), PathBuf::from("/out/%(title)s.%(ext)s"));
        assert_eq!(
            params(Some("clip")).output_template(),
            PathBuf::from("/out/clip.%(ext)s")
        );
    }

    #[test]
    fn test_validate_url() {
        assert!(validate_url("https://example.com/v").is_ok());
        for bad in ["", "   ", "--version", " --exec=rm", "-a list.txt"] {
            assert!(
                matches!(validate_url(bad), Err(DownloadError::InvalidRequest(_))),
                "{bad:?} accepted"
            );
        }
    }

    #[test]
    fn test_args_order() {
        let args = params(None).args();
        assert_eq!(args[0], "https://example.com/watch?v=1");
        assert_eq!(args[1], "-o");
        assert_eq!(args[3], "--format");
        assert_eq!(args[4], "best");
        assert_eq!(args[5], "--newline");
    }

    #[test]
    fn test_failure_reasons() {
        assert_eq!(ProcessExit::code(1).failure_reason(), "Download failed with code 1");
        assert_eq!(ProcessExit::interrupted().failure_reason(), "Download was interrupted");
        assert_eq!(
            ProcessExit::code(1)
                .with_detail("ERROR: Unsupported URL")
                .failure_reason(),
            "Download failed with code 1: ERROR: Unsupported URL"
        );
        assert!(ProcessExit::code(0).success());
        assert!(!ProcessExit::interrupted().success());
    }

    #[test]
    fn test_terminator_fires_once() {
        let (_line_tx, line_rx) = mpsc::unbounded_channel();
        let (_exit_tx, exit_rx) = oneshot::channel();
        let (stop_tx, mut stop_rx) = oneshot::channel();
        let (_output, mut terminator) = ProcessHandle::new(line_rx, exit_rx, stop_tx).into_parts();
        assert!(terminator.terminate());
        assert!(!terminator.terminate());
        assert!(stop_rx.try_recv().is_ok());
    }

    #[test]
    fn test_default_candidates_prefer_local_binary() {
        let candidates = default_tool_candidates();
        assert!(candidates[0].starts_with("./yt-dlp"));
        assert!(candidates.contains(&"youtube-dl".to_string()));
    }

    #[tokio::test]
    async fn test_discovery_fails_for_missing_tools() {
        let locator = ToolLocator::new(vec!["vidqueue-no-such-tool-0".to_string()]);
        let err = locator.discover().await.unwrap_err();
        assert!(matches!(err, DownloadError::Discovery { .. }));
    }

    #[tokio::test]
    async fn test_empty_url_rejected_before_discovery() {
        let launcher = YtDlpLauncher::new(ToolLocator::new(vec![]));
        let mut p = params(None);
        p.url = "  ".to_string();
        let err = launcher.launch(&p).await.unwrap_err();
        assert!(matches!(err, DownloadError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_forward_lines_reassembles_output() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let input: &[u8] = b"[download]  10.0% at 1MiB/s\r[download]  20.0%\nDestination: x";
        forward_lines(input, tx).await;
        assert_eq!(rx.recv().await.as_deref(), Some("[download]  10.0% at 1MiB/s"));
        assert_eq!(rx.recv().await.as_deref(), Some("[download]  20.0%"));
        assert_eq!(rx.recv().await.as_deref(), Some("Destination: x"));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_last_error_line() {
        let input: &[u8] = b"WARNING: slow\nERROR: first\nERROR: second\n\n";
        assert_eq!(last_error_line(input).await.as_deref(), Some("ERROR: second"));
        let quiet: &[u8] = b"WARNING: only warnings\n";
        assert_eq!(last_error_line(quiet).await, None);
    }

    #[tokio::test]
    async fn test_last_error_line_survives_invalid_utf8() {
        let input: &[u8] = b"WARNING: caf\xe9 title\nERROR: caf\xe9 gone\nWARNING: after\n";
        assert_eq!(
            last_error_line(input).await.as_deref(),
            Some("ERROR: caf\u{fffd} gone")
        );
    }
}
