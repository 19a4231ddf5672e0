//! Dispatcher and worker pool
//!
//! A fixed number of workers share the job queue and the key pool. Each
//! worker loops:
//!
//! 1. dequeue a job
//! 2. lease a proposal key and mark the job leased (surplus workers wait
//!    here, so chain concurrency is capped by the key count while worker
//!    count only tunes how fast the queue is drained)
//! 3. sign and submit with the key's sequence number, bounded by the
//!    configured submit timeout
//! 4. release the key according to the verdict and resolve the job:
//!    confirmed, requeued after backoff, or failed
//!
//! No key is held across more than one submission; the key is always back in
//! the pool before a worker sleeps out a backoff delay.
//!
//! Once shutdown begins, workers stop taking jobs off the queue. Only
//! submissions that already hold a key run to completion; everything else
//! stays queued and is parked when shutdown finishes.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use submitter_types::{JobPayload, JobSummary};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::chain::TransactionSubmitter;
use crate::config::SubmitterConfig;
use crate::error::{AdmissionError, LeaseError, QueueError};
use crate::job_queue::JobQueue;
use crate::jobs::{Job, JobTracker};
use crate::key_pool::{KeyPool, ReleaseOutcome};
use crate::retry::{self, RetryDecision, Verdict};

/// Time cancelled workers get to hand their keys back before being aborted
const FORCE_ABORT_GRACE: Duration = Duration::from_secs(1);

/// Whether a worker keeps looping after a job
enum Flow {
    Continue,
    Stop,
}

/// What shutdown did with work that was still around
#[derive(Debug, Default)]
pub struct ShutdownReport {
    /// Every worker finished on its own within the drain timeout
    pub drained: bool,
    /// Workers that ignored cancellation and had to be aborted
    pub aborted_workers: usize,
    /// Jobs handed to the outbox for the next process lifetime
    pub requeued: Vec<JobSummary>,
    /// Jobs given up because there was nowhere to persist them
    pub failed: Vec<JobSummary>,
}

pub struct Dispatcher {
    config: Arc<SubmitterConfig>,
    queue: Arc<JobQueue>,
    keys: Arc<KeyPool>,
    submitter: Arc<dyn TransactionSubmitter>,
    tracker: Arc<JobTracker>,
    /// Jobs currently owned by a worker, by id
    in_flight: DashMap<String, Job>,
    /// Resumed jobs waiting for a free capacity slot
    backlog: Mutex<VecDeque<Job>>,
    workers: Mutex<Option<JoinSet<()>>>,
    /// Set when shutdown begins: no more jobs leave the queue
    draining: CancellationToken,
    /// Set when the drain timeout runs out: in-flight work is abandoned
    cancel: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        config: Arc<SubmitterConfig>,
        queue: Arc<JobQueue>,
        keys: Arc<KeyPool>,
        submitter: Arc<dyn TransactionSubmitter>,
        tracker: Arc<JobTracker>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            queue,
            keys,
            submitter,
            tracker,
            in_flight: DashMap::new(),
            backlog: Mutex::new(VecDeque::new()),
            workers: Mutex::new(None),
            draining: CancellationToken::new(),
            cancel: CancellationToken::new(),
        })
    }

    /// Admit a new job. Capacity and maintenance refusals are returned as-is.
    pub fn submit(&self, payload: JobPayload) -> Result<JobSummary, AdmissionError> {
        let job = Job::new(payload);
        self.queue.enqueue(job.clone())?;
        self.tracker.record(&job);
        log::info!("[DISPATCHER] Admitted job {}", job.id);
        Ok(job.summary())
    }

    /// Re-admit jobs a previous process parked at shutdown.
    ///
    /// Jobs that do not fit in the queue yet wait in a backlog, still
    /// requeued in the outbox, and are admitted in order as slots free up.
    /// A job parked during its last allowed attempt never got a verdict, so
    /// it comes back with exactly one attempt left.
    ///
    /// Returns how many made it back into the queue right away.
    pub fn resume(&self, jobs: Vec<JobSummary>) -> usize {
        let last_attempt = self.config.max_attempts.saturating_sub(1);
        {
            let mut backlog = self.backlog.lock();
            for summary in jobs {
                let mut job = Job::restore(summary);
                if job.attempts > last_attempt {
                    log::info!(
                        "[DISPATCHER] Job {} was parked after {} attempts; allowing one more",
                        job.id,
                        job.attempts
                    );
                    job.attempts = last_attempt;
                }
                backlog.push_back(job);
            }
        }

        let resumed = self.admit_backlog();
        if resumed > 0 {
            log::info!("[DISPATCHER] Resumed {} jobs from the previous run", resumed);
        }
        let waiting = self.backlog.lock().len();
        if waiting > 0 {
            log::warn!(
                "[DISPATCHER] {} resumed jobs wait for queue capacity",
                waiting
            );
        }
        resumed
    }

    /// Move backlog jobs into the queue while capacity allows
    fn admit_backlog(&self) -> usize {
        let mut backlog = self.backlog.lock();
        let mut admitted = 0;
        while let Some(mut job) = backlog.pop_front() {
            job.mark_queued();
            match self.queue.readmit(job.clone()) {
                Ok(()) => {
                    self.tracker.record(&job);
                    admitted += 1;
                }
                Err(_) => {
                    backlog.push_front(job);
                    break;
                }
            }
        }
        admitted
    }

    /// Spawn the worker pool
    pub fn start(self: &Arc<Self>) {
        let mut workers = self.workers.lock();
        if workers.is_some() {
            log::warn!("[DISPATCHER] Already running");
            return;
        }
        if self.queue.is_closed() {
            log::warn!("[DISPATCHER] Queue is closed; not starting workers");
            return;
        }

        let mut set = JoinSet::new();
        for worker_id in 0..self.config.worker_count {
            let this = Arc::clone(self);
            set.spawn(async move { this.run_worker(worker_id).await });
        }
        *workers = Some(set);

        log::info!(
            "[DISPATCHER] Started {} workers over {} proposal keys (queue capacity {})",
            self.config.worker_count,
            self.keys.len(),
            self.queue.capacity()
        );
    }

    async fn run_worker(self: Arc<Self>, worker_id: usize) {
        loop {
            let job = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = self.draining.cancelled() => break,
                next = self.queue.dequeue() => match next {
                    Ok(job) => job,
                    Err(QueueError::Closed) => break,
                },
            };
            if self.draining.is_cancelled() {
                self.queue.requeue(job);
                break;
            }

            if let Flow::Stop = self.process(job).await {
                break;
            }
        }
        log::debug!("[DISPATCHER] Worker {} exiting", worker_id);
    }

    /// One dispatch cycle
    async fn process(&self, mut job: Job) -> Flow {
        // still queued while waiting for a key
        self.in_flight.insert(job.id.clone(), job.clone());

        let lease = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Flow::Stop,
            _ = self.draining.cancelled() => {
                self.put_back(job);
                return Flow::Stop;
            }
            lease = self.keys.lease() => lease,
        };
        let lease = match lease {
            Ok(lease) => lease,
            // shutdown parks the job
            Err(LeaseError::PoolClosed) => return Flow::Stop,
            // a failed resync or a stray permit costs the job an attempt
            Err(err) => {
                job.mark_leased();
                self.hold(&job);
                return self.retry_or_fail(job, err.to_string()).await;
            }
        };

        job.mark_leased();
        let (key_index, sequence) = (lease.key_index(), lease.sequence());
        job.mark_submitted(key_index, sequence);
        self.hold(&job);

        let timeout = self.config.submit_timeout;
        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                log::warn!(
                    "[DISPATCHER] Job {} interrupted mid-submission; key {} will be resynced",
                    job.id,
                    key_index
                );
                self.keys.release(lease, ReleaseOutcome::TransientFailure);
                return Flow::Stop;
            }
            result = tokio::time::timeout(
                timeout,
                self.submitter.submit(&job.payload, key_index, sequence),
            ) => result.ok(),
        };

        match Verdict::from_submit(result, timeout) {
            Verdict::Confirmed { tx_id } => {
                self.keys.release(lease, ReleaseOutcome::Success(sequence + 1));
                log::info!(
                    "[DISPATCHER] Job {} confirmed as {} (key {}, sequence {})",
                    job.id,
                    tx_id,
                    key_index,
                    sequence
                );
                job.mark_confirmed(tx_id);
                self.finish(job);
                Flow::Continue
            }
            Verdict::Transient(error) => {
                self.keys.release(lease, ReleaseOutcome::TransientFailure);
                self.retry_or_fail(job, error).await
            }
            Verdict::Fatal(error) => {
                self.keys.release(lease, ReleaseOutcome::FatalFailure);
                log::warn!("[DISPATCHER] Job {} failed: {}", job.id, error);
                job.mark_failed(error);
                self.finish(job);
                Flow::Continue
            }
        }
    }

    async fn retry_or_fail(&self, mut job: Job, error: String) -> Flow {
        match retry::decide(job.attempts, self.config.max_attempts, &self.config.backoff) {
            RetryDecision::GiveUp => {
                log::warn!(
                    "[DISPATCHER] Job {} failed after {} attempts: {}",
                    job.id,
                    job.attempts,
                    error
                );
                job.mark_failed(error);
                self.finish(job);
                Flow::Continue
            }
            RetryDecision::Requeue(delay) => {
                log::info!(
                    "[DISPATCHER] Job {} attempt {}/{} failed ({}); retrying in {}ms",
                    job.id,
                    job.attempts,
                    self.config.max_attempts,
                    error,
                    delay.as_millis()
                );
                job.mark_requeued(error);
                self.hold(&job);

                let flow = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return Flow::Stop,
                    _ = self.draining.cancelled() => Flow::Stop,
                    _ = tokio::time::sleep(delay) => Flow::Continue,
                };

                job.mark_queued();
                self.tracker.record(&job);
                self.put_back(job);
                flow
            }
        }
    }

    /// Return a job that keeps its slot to the queue
    fn put_back(&self, job: Job) {
        self.in_flight.remove(&job.id);
        self.queue.requeue(job);
    }

    fn hold(&self, job: &Job) {
        self.tracker.record(job);
        self.in_flight.insert(job.id.clone(), job.clone());
    }

    fn finish(&self, job: Job) {
        self.in_flight.remove(&job.id);
        self.tracker.record(&job);
        self.queue.complete();
        if !self.draining.is_cancelled() {
            self.admit_backlog();
        }
    }

    /// Stop admitting and stop dequeuing, then give submissions that already
    /// hold a key up to `drain_timeout` to finish before cancelling them.
    /// Keys held by cancelled workers come back flagged for resync. Jobs that
    /// did not finish are parked as requeued when an outbox can carry them to
    /// the next run, failed otherwise.
    pub async fn shutdown(&self, drain_timeout: Duration) -> ShutdownReport {
        log::info!(
            "[DISPATCHER] Shutting down; draining in-flight submissions for up to {}ms",
            drain_timeout.as_millis()
        );
        self.queue.close();
        self.draining.cancel();

        let mut report = ShutdownReport {
            drained: true,
            ..ShutdownReport::default()
        };

        let workers = self.workers.lock().take();
        if let Some(mut set) = workers {
            report.drained = tokio::time::timeout(drain_timeout, join_workers(&mut set))
                .await
                .is_ok();

            if !report.drained {
                log::warn!(
                    "[DISPATCHER] {} workers still busy after {}ms; cancelling",
                    set.len(),
                    drain_timeout.as_millis()
                );
                self.cancel.cancel();
                if tokio::time::timeout(FORCE_ABORT_GRACE, join_workers(&mut set))
                    .await
                    .is_err()
                {
                    report.aborted_workers = set.len();
                    set.abort_all();
                    join_workers(&mut set).await;
                }
            }
        }
        self.cancel.cancel();
        self.keys.close();

        let stranded: Vec<String> = self.in_flight.iter().map(|e| e.key().clone()).collect();
        let mut parked: Vec<Job> = Vec::new();
        for id in stranded {
            if let Some((_, job)) = self.in_flight.remove(&id) {
                self.queue.complete();
                parked.push(job);
            }
        }
        parked.extend(self.queue.drain_remaining());
        parked.extend(self.backlog.lock().drain(..));

        let persist = self.tracker.has_outbox();
        for mut job in parked {
            if persist {
                job.mark_requeued("interrupted by shutdown");
                self.tracker.record(&job);
                report.requeued.push(job.summary());
            } else {
                job.mark_failed("interrupted by shutdown with nowhere to persist it");
                self.tracker.record(&job);
                report.failed.push(job.summary());
            }
        }

        log::info!(
            "[DISPATCHER] Shutdown complete (drained: {}, requeued: {}, failed: {}, aborted workers: {})",
            report.drained,
            report.requeued.len(),
            report.failed.len(),
            report.aborted_workers
        );
        report
    }

    pub fn job(&self, id: &str) -> Option<JobSummary> {
        self.tracker.get(id)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Resumed jobs still waiting for queue capacity
    pub fn backlog(&self) -> usize {
        self.backlog.lock().len()
    }

    pub fn is_running(&self) -> bool {
        self.workers.lock().is_some()
    }

    pub fn config(&self) -> &SubmitterConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    pub fn keys(&self) -> &Arc<KeyPool> {
        &self.keys
    }

    pub fn tracker(&self) -> &Arc<JobTracker> {
        &self.tracker
    }
}

async fn join_workers(set: &mut JoinSet<()>) {
    while let Some(result) = set.join_next().await {
        if let Err(e) = result {
            if e.is_panic() {
                log::error!("[DISPATCHER] Worker panicked: {}", e);
            }
        }
    }
}
