// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! yt-dlp output parsing.
//!
//! [`parse_line`] is a pure function over one logical line of output.
//! Splitting raw process output into lines is [`LineBuffer`]'s job, since
//! pipe reads land on arbitrary byte boundaries.

use once_cell::sync::Lazy;
use regex::Regex;

static PERCENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+(?:\.\d+)?)%").expect("valid percent regex"));

static RATE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\bat\s+(Unknown B/s|\S+)").expect("valid rate regex"));

static ETA_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\bETA\s+(\S+)").expect("valid eta regex"));

static DESTINATION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:\[\w+\]\s+)?Destination:\s*(.+)$").expect("valid destination regex")
});

static MERGER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^\[Merger\]\s+Merging formats into\s+"(.+)"$"#).expect("valid merger regex")
});

static ALREADY_DOWNLOADED_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\[download\]\s+(.+?)\s+has already been downloaded").expect("valid regex")
});

/// Structured information extracted from one line of output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressDelta {
    /// Completion percentage in `[0, 100]`
    pub percent: Option<f64>,
    /// Display-only transfer rate, e.g. `1.2MiB/s`
    pub rate: Option<String>,
    /// Display-only time remaining, e.g. `00:30`
    pub eta: Option<String>,
    /// Base filename announced by the tool
    pub title: Option<String>,
}

impl ProgressDelta {
    pub fn is_progress(&self) -> bool {
        self.percent.is_some()
    }
}

/// Parse one line of yt-dlp output.
///
/// With `has_filename_override` set, destination lines are not turned into
/// titles. Returns `None` for lines that carry nothing of interest.
pub fn parse_line(line: &str, has_filename_override: bool) -> Option<ProgressDelta> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    if let Some(path) = destination_path(line) {
        if has_filename_override {
            return None;
        }
        return base_filename(path).map(|title| ProgressDelta {
            title: Some(title),
            ..ProgressDelta::default()
        });
    }

    if !line.starts_with("[download]") {
        return None;
    }

    let percent = PERCENT_RE
        .captures(line)
        .and_then(|caps| caps[1].parse::<f64>().ok())?
        .clamp(0.0, 100.0);
    let rate = RATE_RE.captures(line).map(|caps| caps[1].to_string());
    let eta = ETA_RE.captures(line).map(|caps| caps[1].to_string());

    Some(ProgressDelta {
        percent: Some(percent),
        rate,
        eta,
        title: None,
    })
}

/// Output path announced by a destination-style line, if any.
fn destination_path(line: &str) -> Option<&str> {
    [&*DESTINATION_RE, &*MERGER_RE, &*ALREADY_DOWNLOADED_RE]
        .iter()
        .find_map(|re| re.captures(line).and_then(|caps| caps.get(1)))
        .map(|m| m.as_str().trim())
        .filter(|path| !path.is_empty())
}

/// Strip directories from a path printed by the tool. Handles both
/// separators since the tool may run on another platform's conventions.
fn base_filename(path: &str) -> Option<String> {
    let name = path
        .rsplit(|c| c == '/' || c == '\\')
        .next()
        .unwrap_or(path)
        .trim();
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

/// Reassembles logical lines from raw output chunks.
///
/// yt-dlp terminates progress updates with `\r` when not given `--newline`,
/// so both `\r` and `\n` end a line. Empty lines are dropped.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and collect every line it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in chunk {
            if byte == b'\n' || byte == b'\r' {
                if let Some(line) = self.take_line() {
                    lines.push(line);
                }
            } else {
                self.pending.push(byte);
            }
        }
        lines
    }

    /// Flush whatever is left once the stream has ended.
    pub fn finish(&mut self) -> Option<String> {
        self.take_line()
    }

    fn take_line(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let bytes = std::mem::take(&mut self.pending);
        let line = String::from_utf8_lossy(&bytes).trim_end().to_string();
        if line.is_empty() {
            None
        } else {
            Some(line)
        }
    }
}
