// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Media metadata lookup via `--dump-json`.

use std::path::Path;
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use tokio::process::Command;

use super::error::DownloadError;
use super::launcher::validate_url;

/// One downloadable format as reported by the tool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediaFormat {
    pub format_id: String,
    #[serde(default)]
    pub ext: Option<String>,
    #[serde(default)]
    pub resolution: Option<String>,
    #[serde(default)]
    pub filesize: Option<u64>,
    #[serde(default)]
    pub vcodec: Option<String>,
    #[serde(default)]
    pub acodec: Option<String>,
    #[serde(default)]
    pub format_note: Option<String>,
    #[serde(default)]
    pub quality: Option<f64>,
    #[serde(default)]
    pub fps: Option<f64>,
    /// Total bitrate
    #[serde(default)]
    pub tbr: Option<f64>,
}

/// Summary of a media URL.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MediaInfo {
    pub title: Option<String>,
    pub duration: Option<f64>,
    pub uploader: Option<String>,
    pub thumbnail: Option<String>,
    pub formats: Vec<MediaFormat>,
    #[serde(rename = "formatCount")]
    pub format_count: usize,
}

#[derive(Debug, Deserialize)]
struct RawInfo {
    title: Option<String>,
    duration: Option<f64>,
    uploader: Option<String>,
    thumbnail: Option<String>,
    #[serde(default)]
    formats: Vec<RawFormat>,
}

#[derive(Debug, Deserialize)]
struct RawFormat {
    format_id: Option<String>,
    #[serde(flatten)]
    rest: serde_json::Map<String, serde_json::Value>,
}

/// Parse the tool's `--dump-json` output.
pub fn parse_info(json: &str) -> Result<MediaInfo, DownloadError> {
    let raw: RawInfo = serde_json::from_str(json)
        .map_err(|e| DownloadError::Runtime(format!("Could not parse video info: {e}")))?;

    let formats: Vec<MediaFormat> = raw
        .formats
        .into_iter()
        .filter_map(|format| {
            let format_id = format.format_id.filter(|id| !id.is_empty())?;
            let mut fields = format.rest;
            fields.insert("format_id".to_string(), serde_json::Value::String(format_id));
            let mut parsed: MediaFormat =
                serde_json::from_value(serde_json::Value::Object(fields)).ok()?;
            if parsed.resolution.as_deref().map_or(true, str::is_empty) {
                parsed.resolution = Some("audio".to_string());
            }
            Some(parsed)
        })
        .collect();

    Ok(MediaInfo {
        title: raw.title,
        duration: raw.duration,
        uploader: raw.uploader,
        thumbnail: raw.thumbnail,
        format_count: formats.len(),
        formats,
    })
}

/// Run `<tool> <url> --dump-json --no-download` and summarise the result.
pub async fn probe_info(tool: &Path, url: &str) -> Result<MediaInfo, DownloadError> {
    validate_url(url)?;
    let url = url.trim();

    tracing::debug!("Fetching info for {}", url);
    let output = Command::new(tool)
        .arg(url)
        .arg("--dump-json")
        .arg("--no-download")
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| DownloadError::Launch {
            program: tool.to_path_buf(),
            source,
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = stderr.trim();
        let detail = if stderr.is_empty() { "Unknown error" } else { stderr };
        tracing::warn!("Info lookup for {} failed: {}", url, detail);
        return Err(DownloadError::Runtime(format!(
            "Could not get video info. yt-dlp error: {detail}"
        )));
    }

    parse_info(&String::from_utf8_lossy(&output.stdout))
}
