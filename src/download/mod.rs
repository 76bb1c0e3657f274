// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download queue for vidqueue
//!
//! Jobs are submitted over HTTP, wait in a FIFO queue, and are run one at a
//! time by a single background worker that drives an external downloader
//! (yt-dlp by default) and parses its output for progress.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐
//! │ DownloadManager │────▶│ Worker (tokio)  │
//! │ (submit/cancel) │     │ one job at once │
//! └────────┬────────┘     └────────┬────────┘
//!          │                       │
//!          ▼                       ▼
//! ┌─────────────────┐     ┌─────────────────┐
//! │ JobRegistry     │     │ ProcessRunner   │
//! │ (in memory)     │     │ (downloader)    │
//! └─────────────────┘     └─────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use vidqueue::download::{DownloadManager, DownloaderCommand, JobRequest, ProcessRunner, QueueSettings};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let runner = ProcessRunner::new(DownloaderCommand::default(), "downloads");
//! let manager = DownloadManager::new(runner, QueueSettings::default());
//!
//! let id = manager.submit(JobRequest::audio("https://youtu.be/dQw4w9WgXcQ"))?;
//! let snapshot = manager.status(&id.to_string())?;
//! println!("Status: {}", snapshot.status);
//! # Ok(())
//! # }
//! ```

pub mod command;
pub mod files;
pub mod manager;
pub mod progress;
pub mod registry;
pub mod runner;
pub mod types;

pub use command::{DownloaderCommand, QualityTier};
pub use files::FileEntry;
pub use manager::{DownloadManager, QueueSettings};
pub use registry::JobRegistry;
pub use runner::ProcessRunner;
pub use types::{Job, JobId, JobRequest, JobSnapshot, JobStatus, MediaKind, ProcessHandle};
