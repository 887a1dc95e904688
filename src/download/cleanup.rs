// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Best-effort removal of partial output left behind by unfinished jobs.

use std::fs;
use std::io;
use std::path::Path;

use super::error::DownloadError;
use super::types::Job;

/// Suffixes yt-dlp uses for incomplete artifacts.
const PARTIAL_SUFFIXES: &[&str] = &[".part", ".ytdl", ".temp"];

/// Fragment files look like `name.mp4.part-Frag12`.
const FRAGMENT_MARKER: &str = ".part-frag";

/// Outcome of a purge. Failures never abort the sweep.
#[derive(Debug, Default)]
pub struct PurgeReport {
    pub removed: Vec<String>,
    pub failures: Vec<DownloadError>,
}

impl PurgeReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Lowercased name fragment that identifies a job's output files.
///
/// Discovered titles carry the container extension, which is stripped so
/// `.part` and intermediate format files still match. Overrides are used
/// as given.
pub fn match_stem(job: &Job) -> Option<String> {
    let title = job.display_title.trim();
    if title.is_empty() {
        return None;
    }
    let stem = if job.has_filename_override() {
        title
    } else {
        Path::new(title)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(title)
    };
    let stem = stem.trim();
    if stem.is_empty() {
        None
    } else {
        Some(stem.to_lowercase())
    }
}

fn is_partial_name(lower: &str) -> bool {
    PARTIAL_SUFFIXES.iter().any(|suffix| lower.ends_with(suffix)) || lower.contains(FRAGMENT_MARKER)
}

/// Delete files in `dir` that belong to an unfinished job.
///
/// A file is a candidate when its name contains `stem` (case-insensitive)
/// or looks like a partial artifact. Candidates whose names contain a
/// `protected` stem belong to another live job and are left alone, unless
/// `stem` is the more specific match.
pub fn purge_partial_files(dir: &Path, stem: Option<&str>, protected: &[String]) -> PurgeReport {
    let mut report = PurgeReport::default();

    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return report,
        Err(source) => {
            report.failures.push(DownloadError::Cleanup {
                file: dir.display().to_string(),
                source,
            });
            return report;
        }
    };

    let stem = stem.map(str::to_lowercase).filter(|s| !s.is_empty());

    for entry in entries.flatten() {
        let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
        if !is_file {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let lower = name.to_lowercase();

        let owned = stem.as_deref().map_or(false, |s| lower.contains(s));
        if !owned && !is_partial_name(&lower) {
            continue;
        }

        let claimed_elsewhere = protected.iter().any(|other| {
            let other = other.to_lowercase();
            if other.is_empty() || !lower.contains(&other) {
                return false;
            }
            match stem.as_deref() {
                Some(s) if owned => s.len() <= other.len(),
                _ => true,
            }
        });
        if claimed_elsewhere {
            tracing::debug!("Keeping {} (belongs to another download)", name);
            continue;
        }

        match fs::remove_file(entry.path()) {
            Ok(()) => {
                tracing::info!("Removed partial file {}", name);
                report.removed.push(name);
            }
            Err(source) => {
                tracing::warn!("Could not remove {}: {}", name, source);
                report.failures.push(DownloadError::Cleanup { file: name, source });
            }
        }
    }

    report
}
