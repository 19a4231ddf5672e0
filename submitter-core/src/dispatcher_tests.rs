//! End-to-end tests for the dispatcher: queue, key pool and workers together
//! against a scripted chain.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use submitter_types::{JobPayload, JobStatus, JobSummary};
use tokio::sync::Semaphore;
use tokio::time::Instant;

use crate::chain::{EmulatorChain, SequenceSource, SubmitOutcome, TransactionSubmitter};
use crate::config::SubmitterConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{AdmissionError, ChainError};
use crate::job_queue::JobQueue;
use crate::jobs::{Job, JobOutbox, JobTracker};
use crate::key_pool::{KeyPool, ProposalKey};
use crate::retry::BackoffPolicy;
use crate::settings::SettingsService;

const ADMIN: &str = "0xf8d6e0586b0a20c7";
const START_SEQUENCE: u64 = 100;

fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

/// Canned reply for one submit call
enum Step {
    Reply(SubmitOutcome),
    Fail(ChainError),
    Hang,
}

#[derive(Debug, Clone, Copy)]
struct Call {
    key_index: u32,
    sequence: u64,
    at: Instant,
}

/// Plays scripted steps first, then falls through to the emulator
struct ScriptedChain {
    emulator: EmulatorChain,
    script: Mutex<VecDeque<Step>>,
    calls: Mutex<Vec<Call>>,
    gate: Option<Arc<Semaphore>>,
    latency: Duration,
    active: AtomicUsize,
    peak: AtomicUsize,
    /// Sequence queries left to fail
    failing_queries: AtomicUsize,
}

impl ScriptedChain {
    fn new(key_count: u16) -> Self {
        Self {
            emulator: EmulatorChain::new(ADMIN, key_count, START_SEQUENCE),
            script: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            gate: None,
            latency: Duration::ZERO,
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            failing_queries: AtomicUsize::new(0),
        }
    }

    fn with_script(self, steps: impl IntoIterator<Item = Step>) -> Self {
        self.script.lock().extend(steps);
        self
    }

    /// Every submit waits for a permit on `gate`
    fn with_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn with_failing_queries(self, count: usize) -> Self {
        self.failing_queries.store(count, Ordering::SeqCst);
        self
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl TransactionSubmitter for ScriptedChain {
    async fn submit(
        &self,
        payload: &JobPayload,
        key_index: u32,
        sequence: u64,
    ) -> Result<SubmitOutcome, ChainError> {
        self.calls.lock().push(Call {
            key_index,
            sequence,
            at: Instant::now(),
        });
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(active, Ordering::SeqCst);

        if let Some(ref gate) = self.gate {
            gate.acquire().await.unwrap().forget();
        }

        let step = self.script.lock().pop_front();
        let result = match step {
            Some(Step::Reply(outcome)) => Ok(outcome),
            Some(Step::Fail(err)) => Err(err),
            Some(Step::Hang) => std::future::pending().await,
            None => {
                if !self.latency.is_zero() {
                    tokio::time::sleep(self.latency).await;
                }
                self.emulator.submit(payload, key_index, sequence).await
            }
        };

        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

#[async_trait]
impl SequenceSource for ScriptedChain {
    async fn current_sequence(&self, key_index: u32) -> Result<u64, ChainError> {
        let failing = self
            .failing_queries
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ChainError::Transport("access node unreachable".into()));
        }
        self.emulator.current_sequence(key_index).await
    }
}

#[derive(Default)]
struct RecordingOutbox {
    seen: Mutex<Vec<JobSummary>>,
}

impl RecordingOutbox {
    fn last_status(&self, id: &str) -> Option<JobStatus> {
        self.seen
            .lock()
            .iter()
            .rev()
            .find(|j| j.id == id)
            .map(|j| j.status)
    }
}

impl JobOutbox for RecordingOutbox {
    fn record(&self, job: &JobSummary) {
        self.seen.lock().push(job.clone());
    }
}

struct Harness {
    dispatcher: Arc<Dispatcher>,
    chain: Arc<ScriptedChain>,
    settings: Arc<SettingsService>,
}

fn config(keys: u16, workers: usize, capacity: usize) -> SubmitterConfig {
    SubmitterConfig {
        admin_address: ADMIN.to_string(),
        proposal_key_count: keys,
        worker_count: workers,
        queue_capacity: capacity,
        max_attempts: 5,
        backoff: BackoffPolicy::new(ms(10), ms(100)),
        submit_timeout: Duration::from_secs(5),
        drain_timeout: Duration::from_secs(5),
    }
}

fn harness(config: SubmitterConfig, chain: ScriptedChain) -> Harness {
    harness_with_tracker(config, chain, JobTracker::new())
}

fn harness_with_tracker(
    config: SubmitterConfig,
    chain: ScriptedChain,
    tracker: JobTracker,
) -> Harness {
    let chain = Arc::new(chain);
    let settings = Arc::new(SettingsService::in_memory());
    let keys = KeyPool::new(
        ADMIN,
        (0..config.proposal_key_count as u32)
            .map(|i| ProposalKey::new(i, START_SEQUENCE))
            .collect(),
        chain.clone(),
    );
    let queue = Arc::new(JobQueue::new(config.queue_capacity, settings.clone()));
    let dispatcher = Dispatcher::new(
        Arc::new(config),
        queue,
        keys,
        chain.clone(),
        Arc::new(tracker),
    );
    Harness {
        dispatcher,
        chain,
        settings,
    }
}

fn payload() -> JobPayload {
    JobPayload::new("transaction { prepare(signer: &Account) {} }")
}

async fn wait_for(dispatcher: &Dispatcher, id: &str, status: JobStatus) -> JobSummary {
    let deadline = Instant::now() + Duration::from_secs(30);
    loop {
        if let Some(job) = dispatcher.job(id) {
            if job.status == status {
                return job;
            }
        }
        assert!(
            Instant::now() < deadline,
            "job {} never reached {}: {:?}",
            id,
            status,
            dispatcher.job(id)
        );
        tokio::time::sleep(ms(2)).await;
    }
}

#[tokio::test]
async fn test_capacity_frees_when_job_finishes() {
    let gate = Arc::new(Semaphore::new(0));
    let h = harness(config(1, 2, 2), ScriptedChain::new(1).with_gate(gate.clone()));
    h.dispatcher.start();

    let a = h.dispatcher.submit(payload()).unwrap();
    let b = h.dispatcher.submit(payload()).unwrap();
    assert_eq!(
        h.dispatcher.submit(payload()).unwrap_err(),
        AdmissionError::AtCapacity { capacity: 2 }
    );

    wait_for(&h.dispatcher, &a.id, JobStatus::Submitted).await;
    gate.add_permits(1);
    let a = wait_for(&h.dispatcher, &a.id, JobStatus::Confirmed).await;
    assert_eq!(a.sequence, Some(START_SEQUENCE));

    let d = h.dispatcher.submit(payload()).unwrap();
    assert!(matches!(
        h.dispatcher.submit(payload()),
        Err(AdmissionError::AtCapacity { .. })
    ));

    gate.add_permits(10);
    let b = wait_for(&h.dispatcher, &b.id, JobStatus::Confirmed).await;
    let d = wait_for(&h.dispatcher, &d.id, JobStatus::Confirmed).await;
    assert_eq!(b.sequence, Some(START_SEQUENCE + 1));
    assert_eq!(d.sequence, Some(START_SEQUENCE + 2));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_key_uses_consecutive_sequences() {
    let h = harness(config(1, 5, 10), ScriptedChain::new(1));
    h.dispatcher.start();

    let mut handles = Vec::new();
    for _ in 0..5 {
        let dispatcher = h.dispatcher.clone();
        handles.push(tokio::spawn(async move { dispatcher.submit(payload()) }));
    }
    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.unwrap().unwrap().id);
    }

    let mut used = Vec::new();
    for id in &ids {
        let job = wait_for(&h.dispatcher, id, JobStatus::Confirmed).await;
        assert_eq!(job.attempts, 1);
        used.push(job.sequence.unwrap());
    }
    used.sort_unstable();
    let expected: Vec<u64> = (START_SEQUENCE..START_SEQUENCE + 5).collect();
    assert_eq!(used, expected);

    let accepted: Vec<u64> = h.chain.emulator.accepted().iter().map(|t| t.sequence).collect();
    assert_eq!(accepted, expected);
    assert_eq!(h.dispatcher.keys().snapshot()[0].sequence, START_SEQUENCE + 5);
    assert_eq!(h.chain.emulator.sequence_queries(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_chain_concurrency_capped_by_key_count() {
    let chain = ScriptedChain::new(2).with_latency(ms(2));
    let h = harness(config(2, 8, 20), chain);
    h.dispatcher.start();

    let ids: Vec<String> = (0..20)
        .map(|_| h.dispatcher.submit(payload()).unwrap().id)
        .collect();
    for id in &ids {
        wait_for(&h.dispatcher, id, JobStatus::Confirmed).await;
    }

    assert!(h.chain.peak.load(Ordering::SeqCst) <= 2);
    let accepted = h.chain.emulator.accepted();
    assert_eq!(accepted.len(), 20);
    for key in 0..2u32 {
        let sequences: Vec<u64> = accepted
            .iter()
            .filter(|t| t.key_index == key)
            .map(|t| t.sequence)
            .collect();
        let expected: Vec<u64> =
            (START_SEQUENCE..START_SEQUENCE + sequences.len() as u64).collect();
        assert_eq!(sequences, expected, "key {} skipped or reused a sequence", key);
    }
}

#[tokio::test]
async fn test_sequence_mismatch_resyncs_once_then_confirms() {
    let h = harness(config(1, 1, 4), ScriptedChain::new(1));
    // the chain moved on without us
    h.chain.emulator.set_sequence(0, START_SEQUENCE + 5);
    h.dispatcher.start();

    let job = h.dispatcher.submit(payload()).unwrap();
    let job = wait_for(&h.dispatcher, &job.id, JobStatus::Confirmed).await;

    assert_eq!(job.attempts, 2);
    assert_eq!(job.sequence, Some(START_SEQUENCE + 5));
    assert_eq!(h.chain.emulator.sequence_queries(), 1);

    let calls = h.chain.calls();
    assert!(calls.iter().all(|c| c.key_index == 0));
    let sequences: Vec<u64> = calls.iter().map(|c| c.sequence).collect();
    assert_eq!(sequences, vec![START_SEQUENCE, START_SEQUENCE + 5]);

    let key = &h.dispatcher.keys().snapshot()[0];
    assert_eq!(key.sequence, START_SEQUENCE + 6);
    assert!(!key.needs_resync);
}

#[tokio::test]
async fn test_failed_resync_costs_an_attempt() {
    let chain = ScriptedChain::new(1).with_failing_queries(1);
    chain.emulator.set_sequence(0, START_SEQUENCE + 2);
    let h = harness(config(1, 1, 4), chain);
    h.dispatcher.start();

    let job = h.dispatcher.submit(payload()).unwrap();
    let job = wait_for(&h.dispatcher, &job.id, JobStatus::Confirmed).await;

    // mismatch, failed resync, then success
    assert_eq!(job.attempts, 3);
    assert_eq!(job.sequence, Some(START_SEQUENCE + 2));
    assert_eq!(h.chain.calls().len(), 2);
    assert_eq!(h.dispatcher.keys().stats().resync_queries, 2);
    assert!(!h.dispatcher.keys().snapshot()[0].needs_resync);
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_back_off_until_attempts_run_out() {
    let mut cfg = config(1, 1, 4);
    cfg.max_attempts = 4;
    cfg.backoff = BackoffPolicy::new(ms(100), Duration::from_secs(10));
    let backoff = cfg.backoff;

    let steps = (0..4).map(|_| Step::Fail(ChainError::Transport("node unavailable".into())));
    let h = harness(cfg, ScriptedChain::new(1).with_script(steps));
    h.dispatcher.start();

    let job = h.dispatcher.submit(payload()).unwrap();
    let job = wait_for(&h.dispatcher, &job.id, JobStatus::Failed).await;

    assert_eq!(job.attempts, 4);
    assert!(job.last_error.unwrap().contains("node unavailable"));

    let calls = h.chain.calls();
    assert_eq!(calls.len(), 4);
    let gaps: Vec<Duration> = calls.windows(2).map(|w| w[1].at - w[0].at).collect();
    for (i, gap) in gaps.iter().enumerate() {
        assert!(*gap >= backoff.delay_for_attempt(i as u32 + 1));
    }
    assert!(gaps.windows(2).all(|w| w[1] > w[0]), "gaps not increasing: {:?}", gaps);

    assert!(h.dispatcher.keys().snapshot()[0].needs_resync);
    assert_eq!(h.dispatcher.queue().outstanding(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_submit_timeout_counts_as_transient() {
    let mut cfg = config(1, 1, 4);
    cfg.submit_timeout = Duration::from_secs(1);
    let h = harness(cfg, ScriptedChain::new(1).with_script([Step::Hang]));
    h.dispatcher.start();

    let job = h.dispatcher.submit(payload()).unwrap();
    let job = wait_for(&h.dispatcher, &job.id, JobStatus::Confirmed).await;

    assert_eq!(job.attempts, 2);
    assert_eq!(job.last_error, None);
    assert_eq!(h.chain.calls().len(), 2);
    // the hung call never landed, so the resync hands back the same sequence
    assert_eq!(h.chain.emulator.sequence_queries(), 1);
    assert_eq!(job.sequence, Some(START_SEQUENCE));
}

#[tokio::test]
async fn test_fatal_errors_fail_without_retry() {
    let rejected = Step::Reply(SubmitOutcome::Rejected {
        reason: "cadence runtime error".into(),
    });
    let h = harness(config(1, 2, 4), ScriptedChain::new(1).with_script([rejected]));
    h.dispatcher.start();

    let job = h.dispatcher.submit(payload()).unwrap();
    let job = wait_for(&h.dispatcher, &job.id, JobStatus::Failed).await;
    assert_eq!(job.attempts, 1);
    assert!(job.last_error.unwrap().contains("cadence runtime error"));

    let invalid = h.dispatcher.submit(JobPayload::new("")).unwrap();
    let invalid = wait_for(&h.dispatcher, &invalid.id, JobStatus::Failed).await;
    assert_eq!(invalid.attempts, 1);

    assert_eq!(h.chain.calls().len(), 2);
    let key = &h.dispatcher.keys().snapshot()[0];
    assert_eq!(key.sequence, START_SEQUENCE);
    assert!(!key.needs_resync);
    assert_eq!(h.chain.emulator.sequence_queries(), 0);
}

#[tokio::test]
async fn test_maintenance_refuses_new_jobs_but_drains_backlog() {
    let h = harness(config(2, 4, 10), ScriptedChain::new(2));
    let ids: Vec<String> = (0..3)
        .map(|_| h.dispatcher.submit(payload()).unwrap().id)
        .collect();

    h.settings.set_maintenance_mode(true).unwrap();
    assert_eq!(
        h.dispatcher.submit(payload()).unwrap_err(),
        AdmissionError::MaintenanceMode
    );

    h.dispatcher.start();
    for id in &ids {
        wait_for(&h.dispatcher, id, JobStatus::Confirmed).await;
    }
    assert_eq!(
        h.dispatcher.submit(payload()).unwrap_err(),
        AdmissionError::MaintenanceMode
    );

    h.settings.set_maintenance_mode(false).unwrap();
    assert!(h.dispatcher.submit(payload()).is_ok());
}

#[tokio::test]
async fn test_shutdown_after_clean_drain() {
    let h = harness(config(1, 2, 10), ScriptedChain::new(1));
    let ids: Vec<String> = (0..3)
        .map(|_| h.dispatcher.submit(payload()).unwrap().id)
        .collect();
    h.dispatcher.start();
    for id in &ids {
        wait_for(&h.dispatcher, id, JobStatus::Confirmed).await;
    }

    let report = h.dispatcher.shutdown(Duration::from_secs(5)).await;
    assert!(report.drained);
    assert_eq!(report.aborted_workers, 0);
    assert!(report.requeued.is_empty());
    assert!(report.failed.is_empty());
    assert!(!h.dispatcher.is_running());
    assert!(h.dispatcher.keys().is_closed());
    assert_eq!(
        h.dispatcher.submit(payload()).unwrap_err(),
        AdmissionError::Closed
    );
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_parks_stranded_jobs_and_flags_keys() {
    let outbox = Arc::new(RecordingOutbox::default());
    let tracker = JobTracker::with_outbox(outbox.clone());
    let chain = ScriptedChain::new(1).with_script([Step::Hang]);
    let h = harness_with_tracker(config(1, 1, 4), chain, tracker);
    h.dispatcher.start();

    let a = h.dispatcher.submit(payload()).unwrap();
    let b = h.dispatcher.submit(payload()).unwrap();
    wait_for(&h.dispatcher, &a.id, JobStatus::Submitted).await;

    let report = h.dispatcher.shutdown(ms(50)).await;
    assert!(!report.drained);
    assert_eq!(report.aborted_workers, 0);
    assert!(report.failed.is_empty());

    let parked: HashSet<&str> = report.requeued.iter().map(|j| j.id.as_str()).collect();
    assert_eq!(parked, HashSet::from([a.id.as_str(), b.id.as_str()]));
    assert_eq!(outbox.last_status(&a.id), Some(JobStatus::Requeued));
    assert_eq!(outbox.last_status(&b.id), Some(JobStatus::Requeued));

    let key = &h.dispatcher.keys().snapshot()[0];
    assert!(!key.leased);
    assert!(key.needs_resync);
    assert!(h.dispatcher.keys().is_closed());
    assert_eq!(h.dispatcher.in_flight(), 0);
    assert_eq!(h.dispatcher.queue().outstanding(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_without_outbox_fails_stranded_jobs() {
    let chain = ScriptedChain::new(1).with_script([Step::Hang]);
    let h = harness(config(1, 1, 4), chain);
    h.dispatcher.start();

    let a = h.dispatcher.submit(payload()).unwrap();
    wait_for(&h.dispatcher, &a.id, JobStatus::Submitted).await;

    let report = h.dispatcher.shutdown(ms(50)).await;
    assert!(report.requeued.is_empty());
    assert_eq!(report.failed.len(), 1);
    assert_eq!(h.dispatcher.job(&a.id).unwrap().status, JobStatus::Failed);
}

#[tokio::test]
async fn test_shutdown_stops_handing_out_queued_jobs() {
    let outbox = Arc::new(RecordingOutbox::default());
    let tracker = JobTracker::with_outbox(outbox.clone());
    let gate = Arc::new(Semaphore::new(0));
    let chain = ScriptedChain::new(1).with_gate(gate.clone());
    let h = harness_with_tracker(config(1, 1, 4), chain, tracker);
    h.dispatcher.start();

    let a = h.dispatcher.submit(payload()).unwrap();
    let b = h.dispatcher.submit(payload()).unwrap();
    let c = h.dispatcher.submit(payload()).unwrap();
    wait_for(&h.dispatcher, &a.id, JobStatus::Submitted).await;

    let shutdown = {
        let dispatcher = h.dispatcher.clone();
        tokio::spawn(async move { dispatcher.shutdown(Duration::from_secs(5)).await })
    };
    while !h.dispatcher.queue().is_closed() {
        tokio::time::sleep(ms(1)).await;
    }
    gate.add_permits(10);

    let report = shutdown.await.unwrap();
    assert!(report.drained);
    assert_eq!(h.chain.calls().len(), 1);
    assert_eq!(h.dispatcher.job(&a.id).unwrap().status, JobStatus::Confirmed);

    let parked: HashSet<&str> = report.requeued.iter().map(|j| j.id.as_str()).collect();
    assert_eq!(parked, HashSet::from([b.id.as_str(), c.id.as_str()]));
    for job in &report.requeued {
        assert_eq!(job.attempts, 0);
        assert_eq!(outbox.last_status(&job.id), Some(JobStatus::Requeued));
    }
    assert!(!h.dispatcher.keys().snapshot()[0].needs_resync);
}

fn parked_job(attempts: u32) -> JobSummary {
    let mut job = Job::new(payload());
    for _ in 0..attempts {
        job.mark_leased();
    }
    job.mark_requeued("interrupted by shutdown");
    job.summary()
}

#[tokio::test]
async fn test_resume_waits_for_capacity_instead_of_dropping_jobs() {
    let outbox = Arc::new(RecordingOutbox::default());
    let tracker = JobTracker::with_outbox(outbox.clone());
    let h = harness_with_tracker(config(1, 1, 1), ScriptedChain::new(1), tracker);
    h.settings.set_maintenance_mode(true).unwrap();

    let parked = vec![parked_job(1), parked_job(1)];
    let (first, second) = (parked[0].id.clone(), parked[1].id.clone());

    // capacity 1: the second one waits for the first to finish
    assert_eq!(h.dispatcher.resume(parked), 1);
    assert_eq!(h.dispatcher.backlog(), 1);
    assert_eq!(h.dispatcher.job(&first).unwrap().status, JobStatus::Queued);
    assert!(h.dispatcher.job(&second).is_none());

    h.dispatcher.start();
    let first = wait_for(&h.dispatcher, &first, JobStatus::Confirmed).await;
    let second = wait_for(&h.dispatcher, &second, JobStatus::Confirmed).await;
    assert_eq!(first.attempts, 2);
    assert_eq!(second.attempts, 2);
    assert_eq!(second.sequence, Some(START_SEQUENCE + 1));
    assert_eq!(h.dispatcher.backlog(), 0);
    assert!(
        outbox
            .seen
            .lock()
            .iter()
            .all(|j| j.status != JobStatus::Failed)
    );
}

#[tokio::test]
async fn test_shutdown_keeps_backlog_parked() {
    let outbox = Arc::new(RecordingOutbox::default());
    let tracker = JobTracker::with_outbox(outbox.clone());
    let h = harness_with_tracker(config(1, 1, 1), ScriptedChain::new(1), tracker);

    let parked = vec![parked_job(1), parked_job(2)];
    let ids: HashSet<String> = parked.iter().map(|j| j.id.clone()).collect();
    assert_eq!(h.dispatcher.resume(parked), 1);

    let report = h.dispatcher.shutdown(ms(50)).await;
    let requeued: HashSet<String> = report.requeued.iter().map(|j| j.id.clone()).collect();
    assert_eq!(requeued, ids);
    assert!(report.failed.is_empty());
    assert_eq!(h.dispatcher.backlog(), 0);
}

#[tokio::test]
async fn test_resume_allows_one_final_attempt_for_exhausted_jobs() {
    let mut cfg = config(1, 1, 4);
    cfg.max_attempts = 2;
    let steps = (0..3).map(|_| Step::Fail(ChainError::Transport("node unavailable".into())));
    let h = harness(cfg, ScriptedChain::new(1).with_script(steps));

    let parked = parked_job(2);
    let id = parked.id.clone();
    assert_eq!(h.dispatcher.resume(vec![parked]), 1);
    assert_eq!(h.dispatcher.job(&id).unwrap().attempts, 1);

    h.dispatcher.start();
    let job = wait_for(&h.dispatcher, &id, JobStatus::Failed).await;
    assert_eq!(job.attempts, 2);
    assert_eq!(h.chain.calls().len(), 1);
}
