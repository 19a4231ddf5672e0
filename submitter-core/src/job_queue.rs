//! Bounded job admission queue
//!
//! Capacity bounds the number of admitted jobs that have not finished yet: a
//! slot is taken at `enqueue` and given back by `complete` once the job is
//! confirmed or failed. A job that is retried keeps its slot while it waits
//! in backoff, so re-admitting it can never be refused or overshoot.
//!
//! Maintenance mode only gates `enqueue`. Jobs already queued keep draining.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use submitter_types::JobStatus;
use tokio::sync::Notify;

use crate::error::{AdmissionError, QueueError};
use crate::jobs::Job;
use crate::settings::SettingsGate;

struct QueueState {
    jobs: VecDeque<Job>,
    /// Admitted jobs not yet completed, queued or not
    outstanding: usize,
    closed: bool,
}

pub struct JobQueue {
    capacity: usize,
    state: Mutex<QueueState>,
    available: Notify,
    gate: Arc<dyn SettingsGate>,
}

impl JobQueue {
    pub fn new(capacity: usize, gate: Arc<dyn SettingsGate>) -> Self {
        Self {
            capacity,
            state: Mutex::new(QueueState {
                jobs: VecDeque::with_capacity(capacity.min(1024)),
                outstanding: 0,
                closed: false,
            }),
            available: Notify::new(),
            gate,
        }
    }

    /// Admit a new job at the back of the queue
    pub fn enqueue(&self, job: Job) -> Result<(), AdmissionError> {
        if self.gate.is_maintenance_mode() {
            return Err(AdmissionError::MaintenanceMode);
        }
        self.admit(job)
    }

    /// Admit a job accepted by an earlier process. Capacity still applies;
    /// maintenance mode does not, since the work was already accepted.
    pub fn readmit(&self, job: Job) -> Result<(), AdmissionError> {
        self.admit(job)
    }

    fn admit(&self, mut job: Job) -> Result<(), AdmissionError> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(AdmissionError::Closed);
            }
            if state.outstanding >= self.capacity {
                return Err(AdmissionError::AtCapacity {
                    capacity: self.capacity,
                });
            }
            state.outstanding += 1;
            if job.status != JobStatus::Queued {
                job.mark_queued();
            }
            state.jobs.push_back(job);
        }
        self.available.notify_one();
        Ok(())
    }

    /// Put a job that already holds a slot back at the end of the queue.
    /// Accepted even after `close`, so shutdown still sees it.
    pub fn requeue(&self, job: Job) {
        self.state.lock().jobs.push_back(job);
        self.available.notify_one();
    }

    /// Wait for the next job. Fails only once the queue is closed and empty.
    pub async fn dequeue(&self) -> Result<Job, QueueError> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if let Some(job) = state.jobs.pop_front() {
                    return Ok(job);
                }
                if state.closed {
                    return Err(QueueError::Closed);
                }
            }

            notified.await;
        }
    }

    /// Give back the slot of a job that reached a terminal state
    pub fn complete(&self) {
        let mut state = self.state.lock();
        state.outstanding = state.outstanding.saturating_sub(1);
    }

    /// Stop admitting. Waiting consumers drain what is left, then see `Closed`.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.available.notify_waiters();
        log::info!("[JOB_QUEUE] Closed");
    }

    /// Take every job still waiting, releasing their slots
    pub fn drain_remaining(&self) -> Vec<Job> {
        let mut state = self.state.lock();
        let jobs: Vec<Job> = state.jobs.drain(..).collect();
        state.outstanding = state.outstanding.saturating_sub(jobs.len());
        jobs
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Jobs waiting for a worker
    pub fn len(&self) -> usize {
        self.state.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Admitted jobs not yet completed
    pub fn outstanding(&self) -> usize {
        self.state.lock().outstanding
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
