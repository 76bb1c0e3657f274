// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! vidqueue - local download queue library
//!
//! Queues video and audio downloads, runs them one at a time through an
//! external downloader, and tracks their progress from its console output.
//!
//! # Core Modules
//!
//! - [`download`] - Jobs, the queue worker and the downloader process runner
//! - [`server`] - HTTP API over the queue
//! - [`config`] - User configuration in `~/.vidqueue/config.json`
//! - [`error`] - Request errors and CLI error formatting
//! - [`locks`] - Poison-tolerant lock helpers

pub mod config;
pub mod download;
pub mod error;
pub mod locks;
pub mod server;

pub use config::Config;
pub use download::{
    DownloadManager, DownloaderCommand, Job, JobId, JobRequest, JobSnapshot, JobStatus,
    MediaKind, ProcessRunner, QueueSettings,
};
pub use error::QueueError;
pub use server::{router, Server};
