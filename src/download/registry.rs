// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! In-memory job registry.
//!
//! Every job ever submitted lives here until history is cleared. Nothing is
//! persisted; a restart starts with an empty registry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;

use crate::locks::{resilient_lock, resilient_read, resilient_write};

use super::types::{Job, JobId, JobRequest, JobStatus};

/// Map from id to job, plus the id allocator.
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: RwLock<HashMap<JobId, Arc<Job>>>,
    last_id: Mutex<u64>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an id from the current time in milliseconds.
    ///
    /// Two submissions in the same millisecond would collide, so a repeat
    /// is bumped past the last id handed out. Ids are strictly increasing,
    /// which also makes them a creation-order sort key.
    pub fn next_id(&self) -> JobId {
        let now = Utc::now().timestamp_millis().max(0) as u64;
        let mut last = resilient_lock(&self.last_id);
        let id = if now > *last { now } else { *last + 1 };
        *last = id;
        JobId::new(id)
    }

    /// Create a Pending job for `request` and register it.
    pub fn create(&self, request: JobRequest) -> Arc<Job> {
        let job = Arc::new(Job::new(self.next_id(), request));
        resilient_write(&self.jobs).insert(job.id, Arc::clone(&job));
        job
    }

    pub fn get(&self, id: JobId) -> Option<Arc<Job>> {
        resilient_read(&self.jobs).get(&id).cloned()
    }

    /// All jobs, newest first.
    pub fn list_newest_first(&self) -> Vec<Arc<Job>> {
        let mut jobs: Vec<Arc<Job>> = resilient_read(&self.jobs).values().cloned().collect();
        jobs.sort_by(|a, b| b.id.cmp(&a.id));
        jobs
    }

    /// Drop Completed and Failed jobs. Returns how many were removed.
    ///
    /// Cancelled jobs stay listed, as do pending and running ones.
    pub fn clear_finished(&self) -> usize {
        let mut jobs = resilient_write(&self.jobs);
        let before = jobs.len();
        jobs.retain(|_, job| !matches!(job.status(), JobStatus::Completed | JobStatus::Failed));
        before - jobs.len()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        resilient_read(&self.jobs).len()
    }
}
