// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download queue and its single background worker.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinError;

use crate::error::QueueError;
use crate::locks::{resilient_lock, resilient_read, resilient_write};

use super::registry::JobRegistry;
use super::runner::ProcessRunner;
use super::types::{Job, JobId, JobRequest, JobSnapshot, JobStatus};

/// Error recorded on a job whose run panicked or was aborted.
const UNEXPECTED_FAILURE_MESSAGE: &str = "Unexpected error during download";

/// Queue behaviour that is not part of running a single job.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    /// Substrings one of which a submitted URL must contain.
    pub allowed_hosts: Vec<String>,
    /// How long the idle worker waits before polling the queue again.
    pub poll_interval: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            allowed_hosts: vec!["youtube.com".to_string(), "youtu.be".to_string()],
            poll_interval: Duration::from_secs(1),
        }
    }
}

struct Inner {
    registry: JobRegistry,
    queue: Mutex<VecDeque<Arc<Job>>>,
    queued: Notify,
    worker_started: AtomicBool,
    active: RwLock<Option<JobId>>,
    runner: ProcessRunner,
    settings: QueueSettings,
}

/// Handle to the download queue. Cheap to clone; all clones share one queue
/// and one worker.
///
/// The worker is spawned on the first submission and lives as long as the
/// runtime does, so the manager must be used from within a tokio runtime.
#[derive(Clone)]
pub struct DownloadManager {
    inner: Arc<Inner>,
}

impl DownloadManager {
    pub fn new(runner: ProcessRunner, settings: QueueSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry: JobRegistry::new(),
                queue: Mutex::new(VecDeque::new()),
                queued: Notify::new(),
                worker_started: AtomicBool::new(false),
                active: RwLock::new(None),
                runner,
                settings,
            }),
        }
    }

    pub fn runner(&self) -> &ProcessRunner {
        &self.inner.runner
    }

    /// Validate `request`, register a Pending job for it and enqueue it.
    pub fn submit(&self, mut request: JobRequest) -> Result<JobId, QueueError> {
        let url = request.url.trim();
        if url.is_empty() {
            return Err(QueueError::EmptyUrl);
        }
        if !self
            .inner
            .settings
            .allowed_hosts
            .iter()
            .any(|host| url.contains(host.as_str()))
        {
            return Err(QueueError::UnsupportedUrl {
                url: url.to_string(),
            });
        }
        request.url = url.to_string();

        let job = self.inner.registry.create(request);
        let id = job.id;
        tracing::info!(job_id = %id, url = %job.url, kind = ?job.kind, "Job queued");
        self.enqueue(job);
        Ok(id)
    }

    pub fn get(&self, id: JobId) -> Option<Arc<Job>> {
        self.inner.registry.get(id)
    }

    /// Snapshot of the job with the given textual id.
    pub fn status(&self, id: &str) -> Result<JobSnapshot, QueueError> {
        self.lookup(id).map(|job| job.snapshot())
    }

    /// Snapshots of every known job, newest first.
    pub fn list(&self) -> Vec<JobSnapshot> {
        self.inner
            .registry
            .list_newest_first()
            .iter()
            .map(|job| job.snapshot())
            .collect()
    }

    /// Number of jobs waiting in the queue (not counting the running one).
    pub fn queue_size(&self) -> usize {
        resilient_lock(&self.inner.queue).len()
    }

    /// Id of the job the worker is running, if any.
    pub fn active_job(&self) -> Option<JobId> {
        *resilient_read(&self.inner.active)
    }

    /// Cancel a pending or running job.
    ///
    /// A pending job stays in the queue and is skipped when it comes up. A
    /// running job's runner is woken and terminates the downloader.
    pub fn cancel(&self, id: &str) -> Result<(), QueueError> {
        let job = self.lookup(id)?;
        match job.cancel() {
            Ok(process) => {
                tracing::warn!(job_id = %job.id, pid = ?process.and_then(|p| p.pid()), "Job cancelled");
                Ok(())
            }
            Err(status) => Err(QueueError::NotCancellable { id: job.id, status }),
        }
    }

    /// Put a failed job back at the tail of the queue.
    pub fn retry(&self, id: &str) -> Result<(), QueueError> {
        let job = self.lookup(id)?;
        job.reset_for_retry()
            .map_err(|status| QueueError::NotRetryable { id: job.id, status })?;
        tracing::info!(job_id = %job.id, "Job re-queued for retry");
        self.enqueue(job);
        Ok(())
    }

    /// Forget completed and failed jobs. Returns how many were removed.
    pub fn clear_history(&self) -> usize {
        let removed = self.inner.registry.clear_finished();
        tracing::info!(removed, "Cleared finished jobs");
        removed
    }

    fn lookup(&self, id: &str) -> Result<Arc<Job>, QueueError> {
        id.parse::<JobId>()
            .ok()
            .and_then(|id| self.inner.registry.get(id))
            .ok_or_else(|| QueueError::NotFound { id: id.to_string() })
    }

    fn enqueue(&self, job: Arc<Job>) {
        resilient_lock(&self.inner.queue).push_back(job);
        self.inner.queued.notify_one();
        self.ensure_worker();
    }

    /// Spawn the worker unless it is already running.
    fn ensure_worker(&self) {
        if self
            .inner
            .worker_started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            tracing::debug!("Starting download worker");
            let inner = Arc::clone(&self.inner);
            tokio::spawn(worker_loop(inner));
        }
    }
}

async fn worker_loop(inner: Arc<Inner>) {
    loop {
        let next = resilient_lock(&inner.queue).pop_front();
        let job = match next {
            Some(job) => job,
            None => {
                let _ = tokio::time::timeout(inner.settings.poll_interval, inner.queued.notified())
                    .await;
                continue;
            }
        };

        if !job.mark_running() {
            tracing::debug!(job_id = %job.id, status = %job.status(), "Skipping job that is no longer pending");
            continue;
        }

        *resilient_write(&inner.active) = Some(job.id);

        let handle = {
            let runner = inner.runner.clone();
            let job = Arc::clone(&job);
            tokio::spawn(async move { runner.run(&job).await })
        };

        settle_run(&job, handle.await);

        *resilient_write(&inner.active) = None;
    }
}

/// Outcome of one run task. A panic or abort fails the job unless it already
/// reached a terminal status; the worker carries on with the next job.
fn settle_run(job: &Job, outcome: Result<JobStatus, JoinError>) -> JobStatus {
    match outcome {
        Ok(status) => status,
        Err(e) => {
            tracing::error!(job_id = %job.id, error = %e, "Download task aborted");
            if job.status().is_terminal() {
                job.status()
            } else {
                job.fail(UNEXPECTED_FAILURE_MESSAGE)
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::download::command::DownloaderCommand;
    use std::fs;
    use std::path::PathBuf;
    use std::time::Instant;
    use tempfile::TempDir;

    /// Fake downloader that appends each URL it is given to a log file.
    ///
    /// URLs containing `bad` fail, URLs containing `slow` take a while.
    const SCRIPT: &str = r#"
for a; do last=$a; done
echo "$last" >> "$LOG"
case "$last" in
  *bad*) exit 1 ;;
  *slow*)
    i=0
    while [ $i -lt 6 ]; do echo "[download]  $((i*10+5)).0% of 1MiB"; sleep 0.05; i=$((i+1)); done
    ;;
esac
echo "[download] 100% of 1MiB"
exit 0
"#;

    struct Fixture {
        dir: TempDir,
        manager: DownloadManager,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().expect("Failed to create temp dir");
            let script = dir.path().join("fake-dl.sh");
            let log = dir.path().join("calls.log");
            fs::write(&script, SCRIPT.replace("$LOG", &log.display().to_string()))
                .expect("write script");

            let runner = ProcessRunner::new(
                DownloaderCommand::new("sh").with_prefix_args([script.display().to_string()]),
                dir.path().join("out"),
            );
            let settings = QueueSettings {
                poll_interval: Duration::from_millis(50),
                ..QueueSettings::default()
            };
            Self {
                manager: DownloadManager::new(runner, settings),
                dir,
            }
        }

        fn log_path(&self) -> PathBuf {
            self.dir.path().join("calls.log")
        }

        fn calls(&self) -> Vec<String> {
            fs::read_to_string(self.log_path())
                .unwrap_or_default()
                .lines()
                .map(str::to_string)
                .collect()
        }

        fn submit(&self, url: &str) -> JobId {
            self.manager.submit(JobRequest::video(url)).expect("valid url")
        }

        fn status(&self, id: JobId) -> JobStatus {
            self.manager.get(id).expect("job exists").status()
        }

        async fn wait_for(&self, id: JobId, status: JobStatus) {
            let deadline = Instant::now() + Duration::from_secs(10);
            while self.status(id) != status {
                assert!(
                    Instant::now() < deadline,
                    "job {} stuck in {} waiting for {}",
                    id,
                    self.status(id),
                    status
                );
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }

    #[tokio::test]
    async fn test_submit_rejects_bad_urls() {
        let fx = Fixture::new();
        assert_eq!(
            fx.manager.submit(JobRequest::video("   ")),
            Err(QueueError::EmptyUrl)
        );
        assert!(matches!(
            fx.manager.submit(JobRequest::video("https://example.com/watch?v=1")),
            Err(QueueError::UnsupportedUrl { .. })
        ));
        assert!(fx.manager.list().is_empty());
        assert_eq!(fx.manager.queue_size(), 0);
    }

    #[tokio::test]
    async fn test_jobs_run_one_at_a_time_in_order() {
        let fx = Fixture::new();
        let ids = [
            fx.submit("https://youtu.be/slow-a"),
            fx.submit("https://youtu.be/slow-b"),
            fx.submit("https://www.youtube.com/watch?v=slow-c"),
        ];

        let deadline = Instant::now() + Duration::from_secs(15);
        loop {
            let running = fx
                .manager
                .list()
                .iter()
                .filter(|s| s.status == JobStatus::Running)
                .count();
            assert!(running <= 1, "{} jobs running at once", running);

            if ids.iter().all(|id| fx.status(*id) == JobStatus::Completed) {
                break;
            }
            assert!(Instant::now() < deadline, "jobs did not finish");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(
            fx.calls(),
            vec![
                "https://youtu.be/slow-a",
                "https://youtu.be/slow-b",
                "https://www.youtube.com/watch?v=slow-c"
            ]
        );
    }

    #[tokio::test]
    async fn test_retry_goes_to_the_back_of_the_queue() {
        let fx = Fixture::new();
        let bad = fx.submit("https://youtu.be/bad");
        fx.wait_for(bad, JobStatus::Failed).await;
        assert!(fx.manager.status(&bad.to_string()).unwrap().error.is_some());

        let slow = fx.submit("https://youtu.be/slow");
        let fast = fx.submit("https://youtu.be/fast");
        fx.wait_for(slow, JobStatus::Running).await;

        fx.manager.retry(&bad.to_string()).unwrap();
        let snapshot = fx.manager.status(&bad.to_string()).unwrap();
        assert_eq!(snapshot.status, JobStatus::Pending);
        assert_eq!(snapshot.progress, 0.0);
        assert!(snapshot.error.is_none());

        fx.wait_for(fast, JobStatus::Completed).await;
        fx.wait_for(bad, JobStatus::Failed).await;
        assert_eq!(
            fx.calls(),
            vec![
                "https://youtu.be/bad",
                "https://youtu.be/slow",
                "https://youtu.be/fast",
                "https://youtu.be/bad"
            ]
        );
    }

    #[tokio::test]
    async fn test_cancelled_pending_job_never_runs() {
        let fx = Fixture::new();
        let slow = fx.submit("https://youtu.be/slow");
        let queued = fx.submit("https://youtu.be/queued");
        fx.wait_for(slow, JobStatus::Running).await;
        assert_eq!(fx.manager.active_job(), Some(slow));

        fx.manager.cancel(&queued.to_string()).unwrap();
        assert_eq!(fx.status(queued), JobStatus::Cancelled);

        fx.wait_for(slow, JobStatus::Completed).await;
        // Let the worker pass over the cancelled entry
        let deadline = Instant::now() + Duration::from_secs(5);
        while fx.manager.queue_size() > 0 {
            assert!(Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(fx.status(queued), JobStatus::Cancelled);
        assert_eq!(fx.calls(), vec!["https://youtu.be/slow"]);
    }

    #[tokio::test]
    async fn test_cancel_and_retry_policy_errors() {
        let fx = Fixture::new();
        assert_eq!(
            fx.manager.cancel("12345"),
            Err(QueueError::NotFound { id: "12345".to_string() })
        );
        assert!(matches!(
            fx.manager.retry("not-a-number"),
            Err(QueueError::NotFound { .. })
        ));

        let done = fx.submit("https://youtu.be/done");
        fx.wait_for(done, JobStatus::Completed).await;

        assert_eq!(
            fx.manager.cancel(&done.to_string()),
            Err(QueueError::NotCancellable {
                id: done,
                status: JobStatus::Completed
            })
        );
        assert_eq!(
            fx.manager.retry(&done.to_string()),
            Err(QueueError::NotRetryable {
                id: done,
                status: JobStatus::Completed
            })
        );
        assert_eq!(fx.status(done), JobStatus::Completed);
    }

    async fn panicked() -> JoinError {
        tokio::spawn(async { panic!("runner blew up") })
            .await
            .expect_err("task panicked")
    }

    #[tokio::test]
    async fn test_panicked_run_fails_only_that_job() {
        let job = Job::new(JobId::new(1), JobRequest::video("https://youtu.be/boom"));
        assert!(job.mark_running());

        assert_eq!(settle_run(&job, Err(panicked().await)), JobStatus::Failed);
        assert_eq!(
            job.snapshot().error.as_deref(),
            Some(UNEXPECTED_FAILURE_MESSAGE)
        );
    }

    #[tokio::test]
    async fn test_panic_after_terminal_status_keeps_it() {
        let job = Job::new(JobId::new(1), JobRequest::video("https://youtu.be/x"));
        job.mark_running();
        job.cancel().unwrap();

        assert_eq!(settle_run(&job, Err(panicked().await)), JobStatus::Cancelled);
        assert!(job.snapshot().error.is_none());

        let done = Job::new(JobId::new(2), JobRequest::video("https://youtu.be/y"));
        assert_eq!(settle_run(&done, Ok(JobStatus::Completed)), JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_clear_history() {
        let fx = Fixture::new();
        let ok = fx.submit("https://youtu.be/ok");
        let bad = fx.submit("https://youtu.be/bad");
        fx.wait_for(ok, JobStatus::Completed).await;
        fx.wait_for(bad, JobStatus::Failed).await;

        let slow = fx.submit("https://youtu.be/slow");
        let pending = fx.submit("https://youtu.be/pending");
        fx.wait_for(slow, JobStatus::Running).await;

        assert_eq!(fx.manager.clear_history(), 2);
        let ids: Vec<JobId> = fx.manager.list().iter().map(|s| s.task_id).collect();
        assert_eq!(ids, vec![pending, slow]);
    }
}
