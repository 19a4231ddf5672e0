//! Submission jobs
//!
//! A job is created at admission and carries its payload through every
//! dispatch cycle:
//!
//! 1. `Queued`: admitted, waiting for a worker
//! 2. `Leased`: a worker took it and holds (or waits for) a proposal key
//! 3. `Submitted`: handed to the chain with the key's sequence number
//! 4. `Confirmed` / `Failed`: terminal
//!
//! `Requeued` sits between a transient failure and the job's next `Queued`.
//! Every transition is recorded in the `JobTracker` and forwarded to the
//! optional `JobOutbox`.

mod tracker;
mod types;

pub use tracker::JobTracker;
pub use types::Job;

use submitter_types::JobSummary;

/// Receives every job state change, in revision order per job
pub trait JobOutbox: Send + Sync {
    fn record(&self, job: &JobSummary);
}
