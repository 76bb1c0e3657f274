// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error types and formatting for vidqueue.
//!
//! Two kinds of errors live here:
//!
//! - [`QueueError`]: request-level failures (bad URL, unknown job, wrong
//!   state). They surface synchronously to the HTTP caller as
//!   `{"success": false, "error": "..."}` and never change job state.
//! - [`format_error`] / [`ErrorBuilder`]: titled CLI messages with possible
//!   causes and suggested fixes, printed by the binary on startup failures.
//!
//! Failures *inside* a download never become a `QueueError`; the runner
//! records them on the job itself.

use std::fmt;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::download::{JobId, JobStatus};

/// Request-level error returned by [`crate::download::DownloadManager`].
#[derive(Debug, Clone, PartialEq)]
pub enum QueueError {
    /// The submitted URL was empty.
    EmptyUrl,
    /// The URL does not point at a supported host.
    UnsupportedUrl { url: String },
    /// No job with this id is known.
    NotFound { id: String },
    /// Cancel was requested for a job that is not pending or running.
    NotCancellable { id: JobId, status: JobStatus },
    /// Retry was requested for a job that has not failed.
    NotRetryable { id: JobId, status: JobStatus },
}

impl QueueError {
    /// HTTP status code used when this error is returned by the API.
    pub fn status_code(&self) -> StatusCode {
        match self {
            QueueError::EmptyUrl | QueueError::UnsupportedUrl { .. } => StatusCode::BAD_REQUEST,
            QueueError::NotFound { .. } => StatusCode::NOT_FOUND,
            QueueError::NotCancellable { .. } | QueueError::NotRetryable { .. } => {
                StatusCode::CONFLICT
            }
        }
    }

    /// User-facing message.
    pub fn message(&self) -> String {
        match self {
            QueueError::EmptyUrl => "Please enter a URL".to_string(),
            QueueError::UnsupportedUrl { .. } => "Please enter a valid YouTube URL".to_string(),
            QueueError::NotFound { .. } => "Task not found".to_string(),
            QueueError::NotCancellable { .. } => {
                "Only pending or downloading tasks can be cancelled".to_string()
            }
            QueueError::NotRetryable { .. } => "Only failed tasks can be retried".to_string(),
        }
    }
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueError::UnsupportedUrl { url } => write!(f, "unsupported URL: {}", url),
            QueueError::NotFound { id } => write!(f, "task {} not found", id),
            QueueError::NotCancellable { id, status } => {
                write!(f, "task {} cannot be cancelled while {}", id, status)
            }
            QueueError::NotRetryable { id, status } => {
                write!(f, "task {} cannot be retried while {}", id, status)
            }
            QueueError::EmptyUrl => write!(f, "empty URL"),
        }
    }
}

impl std::error::Error for QueueError {}

/// JSON body for a rejected request.
#[derive(Debug, Serialize)]
pub struct FailureBody {
    pub success: bool,
    pub error: String,
}

impl IntoResponse for QueueError {
    fn into_response(self) -> Response {
        tracing::debug!(error = %self, "request rejected");
        let body = FailureBody {
            success: false,
            error: self.message(),
        };
        (self.status_code(), Json(body)).into_response()
    }
}

/// Formats an error message with title, causes and fixes.
///
/// ```
/// use vidqueue::error::format_error;
///
/// let error = format_error(
///     "Failed to start server",
///     &["Another vidqueue instance is running"],
///     &["Use a different port: vidqueue serve --port 5001"],
/// );
/// assert!(error.contains("Possible causes:"));
/// ```
pub fn format_error(title: &str, causes: &[&str], fixes: &[&str]) -> String {
    let mut output = format!("[✗] {}\n", title);

    if !causes.is_empty() {
        output.push_str("\nPossible causes:\n");
        for cause in causes {
            output.push_str(&format!("  - {}\n", cause));
        }
    }

    if !fixes.is_empty() {
        output.push_str("\nTry these fixes:\n");
        for (i, fix) in fixes.iter().enumerate() {
            output.push_str(&format!("  {}. {}\n", i + 1, fix));
        }
    }

    output
}

/// Builder for [`format_error`] messages.
#[derive(Debug, Clone)]
pub struct ErrorBuilder {
    title: String,
    causes: Vec<String>,
    fixes: Vec<String>,
}

impl ErrorBuilder {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            causes: Vec::new(),
            fixes: Vec::new(),
        }
    }

    pub fn cause(mut self, cause: impl Into<String>) -> Self {
        self.causes.push(cause.into());
        self
    }

    pub fn fix(mut self, fix: impl Into<String>) -> Self {
        self.fixes.push(fix.into());
        self
    }

    pub fn build(&self) -> String {
        let causes: Vec<&str> = self.causes.iter().map(|s| s.as_str()).collect();
        let fixes: Vec<&str> = self.fixes.iter().map(|s| s.as_str()).collect();
        format_error(&self.title, &causes, &fixes)
    }
}

impl fmt::Display for ErrorBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.build())
    }
}
