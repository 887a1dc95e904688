// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Listing and deleting finished downloads.

use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// A file in the downloads directory.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DownloadedFile {
    pub name: String,
    pub size: u64,
    /// Last modification time, RFC 3339.
    pub modified: String,
}

/// Why a delete request was refused.
#[derive(Debug, thiserror::Error)]
pub enum FileError {
    #[error("Invalid filename")]
    InvalidName,
    #[error("File not found")]
    NotFound,
    #[error("Failed to delete file: {0}")]
    Io(#[from] io::Error),
}

/// Non-hidden entries of `dir`, sorted by name. A missing directory lists
/// as empty.
pub async fn list_downloads(dir: &Path) -> io::Result<Vec<DownloadedFile>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        let metadata = match entry.metadata().await {
            Ok(metadata) => metadata,
            Err(e) => {
                tracing::debug!("Skipping {}: {}", name, e);
                continue;
            }
        };
        let modified = metadata
            .modified()
            .map(|time| DateTime::<Utc>::from(time).to_rfc3339())
            .unwrap_or_default();
        files.push(DownloadedFile {
            name,
            size: metadata.len(),
            modified,
        });
    }

    files.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(files)
}

/// Resolve `filename` inside `dir`, refusing anything that could escape it.
pub fn resolve_download(dir: &Path, filename: &str) -> Result<PathBuf, FileError> {
    let filename = filename.trim();
    if filename.is_empty()
        || filename.contains("..")
        || filename.contains('/')
        || filename.contains('\\')
    {
        return Err(FileError::InvalidName);
    }
    Ok(dir.join(filename))
}

/// Delete one file from the downloads directory.
pub async fn delete_download(dir: &Path, filename: &str) -> Result<(), FileError> {
    let path = resolve_download(dir, filename)?;

    let metadata = match tokio::fs::symlink_metadata(&path).await {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(FileError::NotFound),
        Err(e) => return Err(FileError::Io(e)),
    };
    if !metadata.is_file() {
        return Err(FileError::InvalidName);
    }

    tokio::fs::remove_file(&path).await?;
    tracing::info!("Deleted {}", filename);
    Ok(())
}
