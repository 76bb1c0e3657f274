// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Output directory helpers.

use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde::Serialize;

/// A file in the output directory.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FileEntry {
    pub name: String,
    /// Size in bytes
    pub size: u64,
    /// Modification time, seconds since the Unix epoch
    pub modified: f64,
}

/// Create the output directory (and parents) if it does not exist.
pub fn ensure_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create download directory: {:?}", dir))
}

fn epoch_secs(time: SystemTime) -> f64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// List regular files in `dir`, newest first.
///
/// A missing directory is an empty listing, not an error.
pub fn list_files(dir: &Path) -> Result<Vec<FileEntry>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut files = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("Failed to read {:?}", dir))? {
        let entry = entry?;
        let metadata = match entry.metadata() {
            Ok(m) if m.is_file() => m,
            // Vanished or not a regular file
            _ => continue,
        };
        files.push(FileEntry {
            name: entry.file_name().to_string_lossy().into_owned(),
            size: metadata.len(),
            modified: metadata.modified().map(epoch_secs).unwrap_or(0.0),
        });
    }

    files.sort_by(|a, b| b.modified.total_cmp(&a.modified));
    Ok(files)
}

/// Name of the most recently modified entry in `dir`.
pub fn newest_file(dir: &Path) -> Result<Option<String>> {
    let mut newest: Option<(SystemTime, String)> = None;
    for entry in fs::read_dir(dir).with_context(|| format!("Failed to read {:?}", dir))? {
        let entry = entry?;
        let modified = entry.metadata()?.modified()?;
        if newest.as_ref().map_or(true, |(t, _)| modified > *t) {
            newest = Some((modified, entry.file_name().to_string_lossy().into_owned()));
        }
    }
    Ok(newest.map(|(_, name)| name))
}
