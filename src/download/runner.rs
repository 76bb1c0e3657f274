// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Runs one job's downloader process to completion.
//!
//! The runner reports exclusively through the [`Job`] it is given: status,
//! progress, result file name and error message. It never returns an error
//! to its caller; anything that goes wrong becomes a Failed job.
//!
//! Cancellation is cooperative. The job's cancel token is checked before
//! each output line is handled and once more after the process exits, so a
//! line that is already being handled finishes first. A cancel request also
//! wakes the runner while it waits for output, which then terminates the
//! process (SIGTERM, then a hard kill after the grace period).

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::command::{self, DownloaderCommand};
use super::files;
use super::progress;
use super::types::{Job, JobStatus, ProcessHandle};

/// Result file name used when the output file cannot be determined.
pub const FILENAME_PLACEHOLDER: &str = "download complete";

/// Error recorded when the downloader exits with a non-zero code.
pub const EXIT_FAILURE_MESSAGE: &str = "Download failed, please check that the URL is correct";

/// Default wait between SIGTERM and a hard kill.
pub const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(3);

/// Lines buffered between the pipe readers and the runner.
const LINE_BUFFER: usize = 256;

/// Executes downloads for the queue worker.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    downloader: DownloaderCommand,
    output_dir: PathBuf,
    cancel_grace: Duration,
}

impl ProcessRunner {
    pub fn new(downloader: DownloaderCommand, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            downloader,
            output_dir: output_dir.into(),
            cancel_grace: DEFAULT_CANCEL_GRACE,
        }
    }

    /// Set how long a terminated process gets before it is killed.
    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn downloader(&self) -> &DownloaderCommand {
        &self.downloader
    }

    /// Run `job` to a terminal status and return it.
    pub async fn run(&self, job: &Job) -> JobStatus {
        tracing::info!(job_id = %job.id, url = %job.url, kind = ?job.kind, quality = %job.quality, "Starting download");

        let status = match self.execute(job).await {
            Ok(status) => status,
            Err(e) => {
                let message = format!("{:#}", e);
                tracing::error!(job_id = %job.id, error = %message, "Download run failed");
                job.fail(message)
            }
        };

        tracing::info!(job_id = %job.id, status = %status, "Download finished");
        status
    }

    async fn execute(&self, job: &Job) -> Result<JobStatus> {
        files::ensure_dir(&self.output_dir)?;

        match job.status() {
            JobStatus::Pending => {
                if !job.mark_running() {
                    return Ok(job.status());
                }
            }
            JobStatus::Running => {}
            other => return Ok(other),
        }

        let cancel = job.cancel_token();
        let args = command::build_args(job, &self.output_dir);
        let mut cmd = Command::new(&self.downloader.program);
        cmd.args(&self.downloader.prefix_args)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("PYTHONIOENCODING", "utf-8")
            .kill_on_drop(true);

        let mut child = cmd.spawn().with_context(|| {
            format!("Failed to start downloader {:?}", self.downloader.program)
        })?;

        if !job.attach_process(ProcessHandle::new(child.id())) {
            // Cancelled between dequeue and spawn
            self.terminate(job, &mut child).await;
            return Ok(job.finish_cancelled());
        }
        tracing::debug!(job_id = %job.id, pid = ?child.id(), "Downloader started");

        let (tx, mut lines) = mpsc::channel::<String>(LINE_BUFFER);
        let mut pumps = PumpTasks::default();
        if let Some(stdout) = child.stdout.take() {
            pumps.0.push(tokio::spawn(pump_lines(stdout, tx.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.0.push(tokio::spawn(pump_lines(stderr, tx.clone())));
        }
        drop(tx);

        let mut retries = 0u32;
        let mut destination: Option<String> = None;

        loop {
            let line = tokio::select! {
                line = lines.recv() => match line {
                    Some(line) => line,
                    None => break,
                },
                _ = cancel.cancelled() => {
                    tracing::warn!(job_id = %job.id, "Cancel requested, stopping downloader");
                    self.terminate(job, &mut child).await;
                    return Ok(job.finish_cancelled());
                }
            };

            if cancel.is_cancelled() {
                self.terminate(job, &mut child).await;
                return Ok(job.finish_cancelled());
            }

            tracing::trace!(job_id = %job.id, "{}", line);

            if job.max_retries > 0 && progress::is_retry_notice(&line) {
                retries += 1;
                tracing::warn!(job_id = %job.id, retries, max_retries = job.max_retries, "Downloader is retrying");
                if retries >= job.max_retries {
                    self.terminate(job, &mut child).await;
                    return Ok(job.fail(format!(
                        "Download failed: errors were retried more than {} times \
                         (possibly a network problem or a restricted video)",
                        job.max_retries
                    )));
                }
                continue;
            }

            if let Some(path) = progress::destination_from_line(&line) {
                destination = Some(path);
            }

            if let Some(percent) = progress::extract_progress(&line) {
                // A 0% announcement (new fragment, second stream) must not
                // wipe the progress already shown.
                if percent > 0.0 {
                    job.set_progress(percent);
                    tracing::debug!(job_id = %job.id, percent, "Progress");
                }
            }
        }

        let exit: ExitStatus = tokio::select! {
            exit = child.wait() => exit.context("Failed to wait for downloader")?,
            _ = cancel.cancelled() => {
                self.terminate(job, &mut child).await;
                return Ok(job.finish_cancelled());
            }
        };

        // The stream can end because a cancel request killed the process.
        if cancel.is_cancelled() {
            return Ok(job.finish_cancelled());
        }

        if exit.success() {
            let filename = self.resolve_filename(destination.as_deref());
            Ok(job.complete(filename))
        } else {
            tracing::warn!(job_id = %job.id, code = ?exit.code(), "Downloader exited with failure");
            Ok(job.fail(EXIT_FAILURE_MESSAGE))
        }
    }

    /// Name of the produced file: the last destination the downloader
    /// announced if it exists, else the newest file in the output directory.
    fn resolve_filename(&self, destination: Option<&str>) -> String {
        if let Some(dest) = destination {
            let announced = Path::new(dest);
            if let Some(name) = progress::destination_file_name(dest) {
                if announced.is_file() || self.output_dir.join(&name).is_file() {
                    return name;
                }
            }
        }

        match files::newest_file(&self.output_dir) {
            Ok(Some(name)) => name,
            Ok(None) => FILENAME_PLACEHOLDER.to_string(),
            Err(e) => {
                tracing::debug!(error = %e, "Could not scan download directory");
                FILENAME_PLACEHOLDER.to_string()
            }
        }
    }

    /// Stop the downloader: SIGTERM first where available, hard kill if it
    /// is still alive after the grace period.
    async fn terminate(&self, job: &Job, child: &mut Child) {
        #[cfg(unix)]
        {
            if let Some(pid) = child.id() {
                // SAFETY: `pid` is our own child and has not been reaped yet
                // (`Child::id` returns None after that).
                let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
                if rc == 0 {
                    match tokio::time::timeout(self.cancel_grace, child.wait()).await {
                        Ok(_) => return,
                        Err(_) => {
                            tracing::warn!(job_id = %job.id, pid, "Downloader ignored SIGTERM, killing");
                        }
                    }
                }
            }
        }

        if let Err(e) = child.kill().await {
            tracing::warn!(job_id = %job.id, error = %e, "Failed to kill downloader");
        }
    }
}

/// Pipe readers of one run, aborted when the run returns.
///
/// A grandchild (ffmpeg under yt-dlp) can keep the pipes open after the
/// downloader itself is gone; its readers must not outlive the job.
#[derive(Default)]
struct PumpTasks(Vec<JoinHandle<()>>);

impl Drop for PumpTasks {
    fn drop(&mut self) {
        for handle in &self.0 {
            handle.abort();
        }
    }
}

/// Forward decoded output lines from one pipe into `tx`.
///
/// Bare `\r` counts as a line break, since progress bars redraw with it.
/// Bytes that are not valid UTF-8 are replaced rather than failing the read.
async fn pump_lines<R>(reader: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                for segment in buf.split(|b| *b == b'\n' || *b == b'\r') {
                    if segment.is_empty() {
                        continue;
                    }
                    let line = String::from_utf8_lossy(segment).into_owned();
                    if tx.send(line).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read downloader output");
                break;
            }
        }
    }
}
