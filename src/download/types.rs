// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Job types for the download queue.

use std::fmt;
use std::str::FromStr;
use std::sync::RwLock;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize, Serializer};
use tokio_util::sync::CancellationToken;

use crate::locks::{resilient_read, resilient_write};

/// Job identifier, derived from the creation time in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobId(u64);

impl JobId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(JobId)
    }
}

// Ids go over the wire as strings.
impl Serialize for JobId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// What to extract from the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    #[default]
    Video,
    Audio,
}

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting in the queue
    Pending,
    /// Downloader process is running
    Running,
    /// Downloader exited successfully
    Completed,
    /// Downloader failed, or the retry cap was hit
    Failed,
    /// Cancelled by the user
    Cancelled,
}

impl JobStatus {
    /// Returns true once the job will not run again without a retry.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Returns true if a cancel request is accepted in this status.
    pub fn is_cancellable(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters of a download request.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct JobRequest {
    #[serde(default)]
    pub url: String,
    #[serde(rename = "type", default)]
    pub kind: MediaKind,
    #[serde(default = "default_quality")]
    pub quality: String,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default, rename = "compatible_mode")]
    pub compatibility_mode: bool,
}

fn default_quality() -> String {
    "best".to_string()
}

impl JobRequest {
    pub fn video(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            kind: MediaKind::Video,
            quality: default_quality(),
            max_retries: 0,
            compatibility_mode: false,
        }
    }

    pub fn audio(url: impl Into<String>) -> Self {
        Self {
            kind: MediaKind::Audio,
            ..Self::video(url)
        }
    }

    pub fn with_quality(mut self, quality: impl Into<String>) -> Self {
        self.quality = quality.into();
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_compatibility_mode(mut self, enabled: bool) -> Self {
        self.compatibility_mode = enabled;
        self
    }
}

/// Handle to the downloader process of a running job.
///
/// The child itself is owned by the runner; the handle only lets other
/// parties identify it and ask for termination through [`Job::cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessHandle {
    pid: Option<u32>,
}

impl ProcessHandle {
    pub fn new(pid: Option<u32>) -> Self {
        Self { pid }
    }

    /// OS process id, if the process had one when it was attached.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

/// Mutable part of a job. Everything the cancel path and the runner race on
/// sits behind the same lock.
#[derive(Debug)]
struct JobState {
    status: JobStatus,
    progress: f64,
    filename: Option<String>,
    error: Option<String>,
    /// One token per run attempt; a retry starts with a fresh one.
    cancel_token: CancellationToken,
    process: Option<ProcessHandle>,
}

/// One requested download.
#[derive(Debug)]
pub struct Job {
    pub id: JobId,
    pub url: String,
    pub kind: MediaKind,
    pub quality: String,
    pub compatibility_mode: bool,
    /// 0 disables the retry cap.
    pub max_retries: u32,
    pub created_at: DateTime<Local>,
    state: RwLock<JobState>,
}

impl Job {
    pub fn new(id: JobId, request: JobRequest) -> Self {
        Self {
            id,
            url: request.url,
            kind: request.kind,
            quality: request.quality,
            compatibility_mode: request.compatibility_mode,
            max_retries: request.max_retries,
            created_at: Local::now(),
            state: RwLock::new(JobState {
                status: JobStatus::Pending,
                progress: 0.0,
                filename: None,
                error: None,
                cancel_token: CancellationToken::new(),
                process: None,
            }),
        }
    }

    pub fn status(&self) -> JobStatus {
        resilient_read(&self.state).status
    }

    pub fn progress(&self) -> f64 {
        resilient_read(&self.state).progress
    }

    pub fn cancel_requested(&self) -> bool {
        resilient_read(&self.state).cancel_token.is_cancelled()
    }

    /// Token of the current run attempt. Cancelled by [`Job::cancel`].
    pub fn cancel_token(&self) -> CancellationToken {
        resilient_read(&self.state).cancel_token.clone()
    }

    pub fn process(&self) -> Option<ProcessHandle> {
        resilient_read(&self.state).process
    }

    /// Pending -> Running. Returns false (and leaves the job alone) if the
    /// job was cancelled or otherwise settled while it sat in the queue.
    pub fn mark_running(&self) -> bool {
        let mut state = resilient_write(&self.state);
        if state.status != JobStatus::Pending || state.cancel_token.is_cancelled() {
            return false;
        }
        state.status = JobStatus::Running;
        true
    }

    /// Record the spawned downloader. Returns false if a cancel request got
    /// in first; the caller must then terminate the process itself.
    pub fn attach_process(&self, handle: ProcessHandle) -> bool {
        let mut state = resilient_write(&self.state);
        if state.cancel_token.is_cancelled() || state.status != JobStatus::Running {
            return false;
        }
        state.process = Some(handle);
        true
    }

    /// Overwrite the progress value. Values outside 0..=100 are clamped.
    pub fn set_progress(&self, percent: f64) {
        let mut state = resilient_write(&self.state);
        if state.status == JobStatus::Running {
            state.progress = percent.clamp(0.0, 100.0);
        }
    }

    /// Running -> Completed, unless a cancel request won the race.
    pub fn complete(&self, filename: impl Into<String>) -> JobStatus {
        let mut state = resilient_write(&self.state);
        if !state.cancel_token.is_cancelled() {
            state.status = JobStatus::Completed;
            state.progress = 100.0;
            state.filename = Some(filename.into());
        } else {
            state.status = JobStatus::Cancelled;
        }
        state.process = None;
        state.status
    }

    /// Running -> Failed, unless a cancel request won the race.
    pub fn fail(&self, message: impl Into<String>) -> JobStatus {
        let mut state = resilient_write(&self.state);
        if !state.cancel_token.is_cancelled() {
            state.status = JobStatus::Failed;
            state.error = Some(message.into());
        } else {
            state.status = JobStatus::Cancelled;
        }
        state.process = None;
        state.status
    }

    /// Settle a run that observed its cancel token.
    pub fn finish_cancelled(&self) -> JobStatus {
        let mut state = resilient_write(&self.state);
        state.status = JobStatus::Cancelled;
        state.process = None;
        state.status
    }

    /// Request cancellation. Only pending and running jobs accept it.
    ///
    /// On success the job is Cancelled immediately, the runner (if any) is
    /// woken up through the attempt's token to terminate the process, and the
    /// detached process handle is returned. On refusal the current status is
    /// returned unchanged.
    pub fn cancel(&self) -> Result<Option<ProcessHandle>, JobStatus> {
        let mut state = resilient_write(&self.state);
        if !state.status.is_cancellable() {
            return Err(state.status);
        }
        state.cancel_token.cancel();
        state.status = JobStatus::Cancelled;
        Ok(state.process.take())
    }

    /// Failed -> Pending with progress, error and cancel state cleared.
    pub fn reset_for_retry(&self) -> Result<(), JobStatus> {
        let mut state = resilient_write(&self.state);
        if state.status != JobStatus::Failed {
            return Err(state.status);
        }
        state.status = JobStatus::Pending;
        state.progress = 0.0;
        state.error = None;
        state.filename = None;
        state.cancel_token = CancellationToken::new();
        state.process = None;
        Ok(())
    }

    /// Point-in-time copy of the job for status and listing responses.
    pub fn snapshot(&self) -> JobSnapshot {
        let state = resilient_read(&self.state);
        JobSnapshot {
            task_id: self.id,
            url: self.url.clone(),
            kind: self.kind,
            quality: self.quality.clone(),
            max_retries: self.max_retries,
            compatible_mode: self.compatibility_mode,
            status: state.status,
            progress: state.progress,
            filename: state.filename.clone().unwrap_or_default(),
            error: state.error.clone(),
            added_time: self.created_at.format("%H:%M:%S").to_string(),
            created_at: self.created_at,
        }
    }

    /// Test-only shortcut to force a status without going through a run.
    #[cfg(test)]
    pub(crate) fn force_status(&self, status: JobStatus) {
        resilient_write(&self.state).status = status;
    }
}

/// Serializable view of a job.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub task_id: JobId,
    pub url: String,
    #[serde(rename = "type")]
    pub kind: MediaKind,
    pub quality: String,
    pub max_retries: u32,
    pub compatible_mode: bool,
    pub status: JobStatus,
    pub progress: f64,
    pub filename: String,
    pub error: Option<String>,
    pub added_time: String,
    pub created_at: DateTime<Local>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> Job {
        Job::new(JobId::new(1), JobRequest::video("https://youtu.be/abc"))
    }

    #[test]
    fn test_new_job_is_pending() {
        let job = job();
        assert_eq!(job.status(), JobStatus::Pending);
        assert_eq!(job.progress(), 0.0);
        assert!(job.process().is_none());
        assert!(!job.cancel_requested());
    }

    #[test]
    fn test_request_defaults_from_json() {
        let request: JobRequest = serde_json::from_str(r#"{"url": "https://youtu.be/x"}"#).unwrap();
        assert_eq!(request.kind, MediaKind::Video);
        assert_eq!(request.quality, "best");
        assert_eq!(request.max_retries, 0);
        assert!(!request.compatibility_mode);

        let request: JobRequest = serde_json::from_str(
            r#"{"url": "u", "type": "audio", "quality": "192", "max_retries": 3, "compatible_mode": true}"#,
        )
        .unwrap();
        assert_eq!(request.kind, MediaKind::Audio);
        assert_eq!(request.quality, "192");
        assert_eq!(request.max_retries, 3);
        assert!(request.compatibility_mode);
    }

    #[test]
    fn test_process_handle_only_while_running() {
        let job = job();
        assert!(!job.attach_process(ProcessHandle::new(Some(10))));
        assert!(job.mark_running());
        assert!(job.attach_process(ProcessHandle::new(Some(10))));
        assert_eq!(job.process().and_then(|p| p.pid()), Some(10));

        job.complete("clip.mp4");
        assert!(job.process().is_none());
        assert_eq!(job.status(), JobStatus::Completed);
        assert_eq!(job.progress(), 100.0);
    }

    #[test]
    fn test_cancel_beats_completion() {
        let job = job();
        job.mark_running();
        job.attach_process(ProcessHandle::new(Some(10)));

        let handle = job.cancel().unwrap();
        assert_eq!(handle.and_then(|h| h.pid()), Some(10));
        assert!(job.process().is_none());

        assert_eq!(job.complete("clip.mp4"), JobStatus::Cancelled);
        assert_eq!(job.fail("boom"), JobStatus::Cancelled);
        assert!(job.snapshot().error.is_none());
        assert_eq!(job.snapshot().filename, "");
    }

    #[test]
    fn test_attach_refused_after_cancel() {
        let job = job();
        assert!(job.mark_running());
        job.cancel().unwrap();
        assert!(!job.attach_process(ProcessHandle::new(Some(10))));
        assert!(job.process().is_none());
    }

    #[test]
    fn test_cancelled_while_queued_is_not_started() {
        let job = job();
        job.cancel().unwrap();
        assert!(!job.mark_running());
        assert_eq!(job.status(), JobStatus::Cancelled);
    }

    #[test]
    fn test_cancel_rejected_for_terminal_jobs() {
        let job = job();
        job.mark_running();
        job.fail("nope");
        assert_eq!(job.cancel(), Err(JobStatus::Failed));
        assert!(!job.cancel_requested());
    }

    #[test]
    fn test_retry_resets_state() {
        let job = job();
        job.mark_running();
        job.set_progress(42.0);
        job.fail("network");

        job.reset_for_retry().unwrap();
        let snapshot = job.snapshot();
        assert_eq!(snapshot.status, JobStatus::Pending);
        assert_eq!(snapshot.progress, 0.0);
        assert!(snapshot.error.is_none());
        assert!(job.mark_running());
    }

    #[test]
    fn test_retry_starts_a_fresh_cancel_token() {
        let job = job();
        job.mark_running();
        job.fail("network");
        let first = job.cancel_token();

        job.reset_for_retry().unwrap();
        let second = job.cancel_token();
        job.cancel().unwrap();

        assert!(second.is_cancelled());
        assert!(!first.is_cancelled());
    }

    #[test]
    fn test_cancel_token_fires_for_pending_job() {
        let job = job();
        let token = job.cancel_token();
        assert!(!token.is_cancelled());
        job.cancel().unwrap();
        assert!(token.is_cancelled());
        assert!(job.cancel_requested());
    }

    #[test]
    fn test_retry_only_from_failed() {
        let job = job();
        assert_eq!(job.reset_for_retry(), Err(JobStatus::Pending));
        job.cancel().unwrap();
        assert_eq!(job.reset_for_retry(), Err(JobStatus::Cancelled));
    }

    #[test]
    fn test_progress_clamped_and_ignored_when_not_running() {
        let job = job();
        job.set_progress(50.0);
        assert_eq!(job.progress(), 0.0);
        job.mark_running();
        job.set_progress(150.0);
        assert_eq!(job.progress(), 100.0);
    }

    #[test]
    fn test_snapshot_serialization() {
        let job = Job::new(
            JobId::new(1700000000123),
            JobRequest::audio("https://youtu.be/abc").with_quality("192"),
        );
        let value = serde_json::to_value(job.snapshot()).unwrap();
        assert_eq!(value["task_id"], "1700000000123");
        assert_eq!(value["type"], "audio");
        assert_eq!(value["status"], "pending");
        assert_eq!(value["quality"], "192");
        assert!(value["error"].is_null());
        assert_eq!(value["added_time"].as_str().map(|s| s.len()), Some(8));
    }

    #[test]
    fn test_job_id_parse() {
        assert_eq!("  42 ".parse::<JobId>().unwrap(), JobId::new(42));
        assert!("abc".parse::<JobId>().is_err());
    }
}
