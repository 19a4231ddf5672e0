//! Job tracker
//!
//! Thread-safe record of the latest known state of every job.

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use submitter_types::{JobStatus, JobSummary};

use super::{Job, JobOutbox};

/// Latest state per job id.
/// Uses DashMap for thread-safe concurrent access
pub struct JobTracker {
    jobs: DashMap<String, JobSummary>,
    /// Optional sink for caller-visible persistence
    outbox: Option<Arc<dyn JobOutbox>>,
}

impl JobTracker {
    pub fn new() -> Self {
        Self {
            jobs: DashMap::new(),
            outbox: None,
        }
    }

    pub fn with_outbox(outbox: Arc<dyn JobOutbox>) -> Self {
        Self {
            jobs: DashMap::new(),
            outbox: Some(outbox),
        }
    }

    pub fn has_outbox(&self) -> bool {
        self.outbox.is_some()
    }

    /// Record a job's current state.
    ///
    /// A revision older than (or equal to) the one already recorded is
    /// ignored, so a slow writer can never roll a job back. The outbox is
    /// called while the entry is held, keeping its view in revision order.
    pub fn record(&self, job: &Job) -> bool {
        match self.jobs.entry(job.id.clone()) {
            Entry::Occupied(mut entry) => {
                if entry.get().revision >= job.revision {
                    return false;
                }
                let summary = job.summary();
                if let Some(ref outbox) = self.outbox {
                    outbox.record(&summary);
                }
                entry.insert(summary);
            }
            Entry::Vacant(entry) => {
                let summary = job.summary();
                if let Some(ref outbox) = self.outbox {
                    outbox.record(&summary);
                }
                entry.insert(summary);
            }
        }
        log::debug!(
            "[JOBS] {} -> {} (attempt {}, rev {})",
            job.id,
            job.status,
            job.attempts,
            job.revision
        );
        true
    }

    pub fn get(&self, id: &str) -> Option<JobSummary> {
        self.jobs.get(id).map(|r| r.clone())
    }

    /// List jobs sorted by updated_at (most recent first)
    pub fn list_recent(&self, status: Option<JobStatus>, limit: usize) -> Vec<JobSummary> {
        let mut jobs: Vec<_> = self
            .jobs
            .iter()
            .filter(|r| status.is_none_or(|s| r.value().status == s))
            .map(|r| r.value().clone())
            .collect();
        jobs.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        jobs.truncate(limit);
        jobs
    }

    pub fn count_by_status(&self, status: JobStatus) -> usize {
        self.jobs
            .iter()
            .filter(|r| r.value().status == status)
            .count()
    }

    pub fn count(&self) -> usize {
        self.jobs.len()
    }

    /// Drop terminal jobs last updated more than `max_age_hours` ago
    pub fn cleanup_old(&self, max_age_hours: i64) -> usize {
        let cutoff = Utc::now() - chrono::Duration::hours(max_age_hours);
        let before = self.jobs.len();
        self.jobs
            .retain(|_, job| !(job.status.is_terminal() && job.updated_at < cutoff));
        let count = before.saturating_sub(self.jobs.len());

        if count > 0 {
            log::info!("[JOBS] Cleaned up {} finished jobs", count);
        }
        count
    }
}

impl Default for JobTracker {
    fn default() -> Self {
        Self::new()
    }
}
