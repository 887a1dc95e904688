// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Real process path: `bash` stands in for yt-dlp and the "URL" is the
//! script it runs, so the tool sees `<script> -o <template> --format ...`.

#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use vidqueue::download::{
    BroadcastSink, DownloadError, JobRequest, JobStatus, LaunchParams, Launcher, ProcessExit, QueueManager,
    QueueOptions, ToolLocator, YtDlpLauncher,
};

fn bash_launcher() -> YtDlpLauncher {
    YtDlpLauncher::new(ToolLocator::new(vec!["bash".to_string()])).with_kill_grace(Duration::from_millis(300))
}

fn write_script(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("tool.sh");
    std::fs::write(&path, body).unwrap();
    path
}

fn params(script: &Path, dir: &Path) -> LaunchParams {
    LaunchParams {
        url: script.to_string_lossy().into_owned(),
        format: "best".to_string(),
        filename: None,
        output_dir: dir.to_path_buf(),
    }
}

async fn run(launcher: &YtDlpLauncher, params: &LaunchParams) -> (Vec<String>, ProcessExit) {
    let handle = launcher.launch(params).await.unwrap();
    let (mut output, _terminator) = handle.into_parts();
    let mut lines = Vec::new();
    let exit = tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(line) = output.lines.recv().await {
            lines.push(line);
        }
        output.exit.await.unwrap()
    })
    .await
    .expect("process did not finish");
    (lines, exit)
}

#[tokio::test]
async fn test_output_lines_and_success() {
    let dir = TempDir::new().unwrap();
    let script = write_script(
        dir.path(),
        "echo \"[download] Destination: $2\"\nprintf '[download]  50.0%% at 1.0MiB/s ETA 00:01\\r[download] 100%%\\n'\nexit 0\n",
    );
    let params = params(&script, dir.path());

    let (lines, exit) = run(&bash_launcher(), &params).await;
    assert!(exit.success());
    assert_eq!(
        lines,
        vec![
            format!("[download] Destination: {}", params.output_template().display()),
            "[download]  50.0% at 1.0MiB/s ETA 00:01".to_string(),
            "[download] 100%".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_nonzero_exit_keeps_error_line() {
    let dir = TempDir::new().unwrap();
    let script = write_script(dir.path(), "echo 'WARNING: meh' >&2\necho 'ERROR: Video unavailable' >&2\nexit 3\n");

    let (_, exit) = run(&bash_launcher(), &params(&script, dir.path())).await;
    assert_eq!(exit.code, Some(3));
    assert_eq!(
        exit.failure_reason(),
        "Download failed with code 3: ERROR: Video unavailable"
    );
}

#[tokio::test]
async fn test_undecodable_stderr_does_not_break_the_pipe() {
    let dir = TempDir::new().unwrap();
    let script = write_script(
        dir.path(),
        "printf 'WARNING: caf\\351 title\\n' >&2\nsleep 0.3\nfor i in $(seq 1 50); do echo \"WARNING: line $i\" >&2; done\nexit 0\n",
    );

    let (_, exit) = run(&bash_launcher(), &params(&script, dir.path())).await;
    assert!(exit.success(), "{exit:?}");
}

#[tokio::test]
async fn test_option_like_url_never_reaches_tool() {
    let dir = TempDir::new().unwrap();
    let params = LaunchParams {
        url: "--version".to_string(),
        format: "best".to_string(),
        filename: None,
        output_dir: dir.path().to_path_buf(),
    };
    let err = bash_launcher().launch(&params).await.unwrap_err();
    assert!(matches!(err, DownloadError::InvalidRequest(_)));
}

#[tokio::test]
async fn test_terminate_interrupts_process() {
    let dir = TempDir::new().unwrap();
    let script = write_script(dir.path(), "echo started\nexec sleep 30\n");
    let handle = bash_launcher().launch(&params(&script, dir.path())).await.unwrap();
    let (mut output, mut terminator) = handle.into_parts();

    assert_eq!(output.lines.recv().await.as_deref(), Some("started"));
    assert!(terminator.terminate());
    assert!(!terminator.terminate());

    let exit = tokio::time::timeout(Duration::from_secs(10), output.exit)
        .await
        .expect("process ignored termination")
        .unwrap();
    assert!(!exit.success());
    assert_eq!(exit.failure_reason(), "Download was interrupted");
}

#[tokio::test]
async fn test_ignored_interrupt_escalates_to_kill() {
    let dir = TempDir::new().unwrap();
    let script = write_script(dir.path(), "trap '' INT\necho started\nexec sleep 30\n");
    let handle = bash_launcher().launch(&params(&script, dir.path())).await.unwrap();
    let (mut output, mut terminator) = handle.into_parts();

    assert_eq!(output.lines.recv().await.as_deref(), Some("started"));
    terminator.terminate();

    let exit = tokio::time::timeout(Duration::from_secs(10), output.exit)
        .await
        .expect("process was not killed")
        .unwrap();
    assert_eq!(exit.code, None);
}

#[tokio::test]
async fn test_queue_runs_real_process_to_completion() {
    let dir = TempDir::new().unwrap();
    let script = write_script(
        dir.path(),
        "echo \"[download] Destination: $(dirname \"$2\")/Script Clip.mp4\"\necho '[download]  30.0% at 2.0MiB/s ETA 00:05'\n",
    );
    let sink = Arc::new(BroadcastSink::new(64));
    let queue = QueueManager::new(
        Arc::new(bash_launcher()),
        sink,
        QueueOptions {
            output_dir: dir.path().to_path_buf(),
            max_concurrent: 1,
        },
    );

    let id = queue
        .submit(JobRequest::new(script.to_string_lossy()))
        .await
        .unwrap();

    let mut rx = queue.watch();
    let status = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let status = rx.borrow_and_update().clone();
            if status.job(id).map(|job| job.status) == Some(JobStatus::Completed) {
                return status;
            }
            rx.changed().await.unwrap();
        }
    })
    .await
    .expect("job did not complete");

    let job = status.job(id).unwrap();
    assert_eq!(job.display_title, "Script Clip.mp4");
    assert_eq!(job.progress_percent, 100.0);
    assert_eq!(status.active_count, 0);
}
