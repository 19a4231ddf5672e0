//! Job data type

use chrono::{DateTime, Utc};
use submitter_types::{JobPayload, JobStatus, JobSummary};

#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: String,
    pub payload: JobPayload,
    pub status: JobStatus,
    /// Dispatch cycles started so far
    pub attempts: u32,
    pub last_error: Option<String>,
    pub key_index: Option<u32>,
    pub sequence: Option<u64>,
    pub tx_id: Option<String>,
    pub revision: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(payload: JobPayload) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            payload,
            status: JobStatus::Queued,
            attempts: 0,
            last_error: None,
            key_index: None,
            sequence: None,
            tx_id: None,
            revision: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Rebuild a job persisted by an earlier process
    pub fn restore(summary: JobSummary) -> Self {
        Self {
            id: summary.id,
            payload: summary.payload,
            status: summary.status,
            attempts: summary.attempts,
            last_error: summary.last_error,
            key_index: summary.key_index,
            sequence: summary.sequence,
            tx_id: summary.tx_id,
            revision: summary.revision,
            created_at: summary.created_at,
            updated_at: summary.updated_at,
        }
    }

    pub fn summary(&self) -> JobSummary {
        JobSummary::from(self)
    }

    fn transition(&mut self, status: JobStatus) {
        self.status = status;
        self.revision += 1;
        self.updated_at = Utc::now();
    }

    pub fn mark_queued(&mut self) {
        self.transition(JobStatus::Queued);
    }

    /// A key was leased for the job; this starts a new attempt
    pub fn mark_leased(&mut self) {
        self.attempts += 1;
        self.key_index = None;
        self.sequence = None;
        self.transition(JobStatus::Leased);
    }

    pub fn mark_submitted(&mut self, key_index: u32, sequence: u64) {
        self.key_index = Some(key_index);
        self.sequence = Some(sequence);
        self.transition(JobStatus::Submitted);
    }

    pub fn mark_confirmed(&mut self, tx_id: String) {
        self.tx_id = Some(tx_id);
        self.last_error = None;
        self.transition(JobStatus::Confirmed);
    }

    pub fn mark_requeued(&mut self, error: impl Into<String>) {
        self.last_error = Some(error.into());
        self.transition(JobStatus::Requeued);
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.last_error = Some(error.into());
        self.transition(JobStatus::Failed);
    }
}

impl From<&Job> for JobSummary {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id.clone(),
            status: job.status,
            attempts: job.attempts,
            last_error: job.last_error.clone(),
            key_index: job.key_index,
            sequence: job.sequence,
            tx_id: job.tx_id.clone(),
            payload: job.payload.clone(),
            revision: job.revision,
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}
