// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Downloader command line construction.
//!
//! Video format selectors degrade in layers: the ideal combination first,
//! then progressively looser ones, ending with `b` (best single file), so a
//! missing format narrows the result instead of failing the job.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::types::{Job, MediaKind};

/// Output file name template, relative to the output directory.
pub const OUTPUT_TEMPLATE: &str = "%(title)s.%(ext)s";

/// Program used to run downloads, plus arguments placed before the
/// per-job ones (e.g. `python3 -m yt_dlp`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloaderCommand {
    pub program: PathBuf,
    #[serde(default)]
    pub prefix_args: Vec<String>,
}

impl DownloaderCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            prefix_args: Vec::new(),
        }
    }

    pub fn with_prefix_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.prefix_args = args.into_iter().map(Into::into).collect();
        self
    }
}

impl Default for DownloaderCommand {
    fn default() -> Self {
        Self::new("yt-dlp")
    }
}

/// Video height ceiling requested by a quality token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualityTier {
    Unbounded,
    MaxHeight(u32),
}

impl QualityTier {
    /// `best`, `1080p`, `720p`; anything else is treated as 480p.
    pub fn from_token(token: &str) -> Self {
        match token.trim() {
            "best" => QualityTier::Unbounded,
            "1080p" => QualityTier::MaxHeight(1080),
            "720p" => QualityTier::MaxHeight(720),
            _ => QualityTier::MaxHeight(480),
        }
    }

    fn height_filter(&self) -> String {
        match self {
            QualityTier::Unbounded => String::new(),
            QualityTier::MaxHeight(h) => format!("[height<={}]", h),
        }
    }
}

/// Build the `-f` selector for a video job.
pub fn video_format_selector(quality: &str, compatibility_mode: bool) -> String {
    let tier = QualityTier::from_token(quality);
    let h = tier.height_filter();

    if compatibility_mode {
        // H.264 only, for players that cannot decode VP9/AV1.
        format!("bv*{h}[vcodec^=avc]+ba/bv*{h}[vcodec^=avc]/b{h}[ext=mp4]/b")
    } else {
        match tier {
            QualityTier::Unbounded => "bv*+ba/b".to_string(),
            QualityTier::MaxHeight(_) => format!("bv*{h}+ba/b{h}/bv*+ba/b"),
        }
    }
}

/// Bitrate for `--postprocessor-args`, or `None` for `best`.
fn audio_bitrate(quality: &str) -> Option<String> {
    let quality = quality.trim();
    if quality.is_empty() || quality == "best" {
        return None;
    }
    let digits = quality.trim_end_matches(['k', 'K']);
    Some(format!("ffmpeg:-b:a {}k", digits))
}

/// Per-job downloader arguments (without the program and prefix arguments).
pub fn build_args(job: &Job, output_dir: &Path) -> Vec<OsString> {
    let template = output_dir.join(OUTPUT_TEMPLATE);
    let mut args: Vec<OsString> = Vec::new();

    match job.kind {
        MediaKind::Video => {
            args.push("-f".into());
            args.push(video_format_selector(&job.quality, job.compatibility_mode).into());
            args.push("--merge-output-format".into());
            args.push("mp4".into());
        }
        MediaKind::Audio => {
            if let Some(bitrate) = audio_bitrate(&job.quality) {
                args.push("--postprocessor-args".into());
                args.push(bitrate.into());
            }
            args.push("-x".into());
            args.push("--audio-format".into());
            args.push("mp3".into());
            args.push("--audio-quality".into());
            args.push("0".into());
        }
    }

    args.push("-o".into());
    args.push(template.into_os_string());
    args.push("--newline".into());
    args.push("--no-warnings".into());
    if job.kind == MediaKind::Video {
        // Keeps one bad playlist entry from aborting the whole job.
        args.push("--ignore-errors".into());
    }
    args.push(job.url.clone().into());

    args
}
