//! Retry policy and submission result classification.
//!
//! A dispatch cycle ends in one of three verdicts. Transient verdicts are
//! retried with exponential backoff until the attempt budget runs out; fatal
//! verdicts end the job immediately.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::chain::SubmitOutcome;
use crate::error::ChainError;

/// Exponential backoff between dispatch cycles of the same job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay after the first failed attempt
    pub base: Duration,
    /// Upper bound on any single delay
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay before re-admitting a job that has failed `attempt` times (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max)
            .min(self.max)
    }
}

/// How a dispatch cycle ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Confirmed { tx_id: String },
    /// Sequence mismatch, network trouble or timeout
    Transient(String),
    /// Invalid payload or rejected by the chain
    Fatal(String),
}

impl Verdict {
    /// Classify the result of a submit call. `None` means the call timed out.
    pub fn from_submit(result: Option<Result<SubmitOutcome, ChainError>>, timeout: Duration) -> Self {
        match result {
            None => Verdict::Transient(format!(
                "submission timed out after {}ms",
                timeout.as_millis()
            )),
            Some(Ok(SubmitOutcome::Accepted { tx_id })) => Verdict::Confirmed { tx_id },
            Some(Ok(SubmitOutcome::SequenceMismatch { expected })) => Verdict::Transient(format!(
                "sequence mismatch (chain expects {})",
                expected
            )),
            Some(Ok(SubmitOutcome::Rejected { reason })) => {
                Verdict::Fatal(format!("rejected by chain: {}", reason))
            }
            Some(Err(e)) if e.is_retriable() => Verdict::Transient(e.to_string()),
            Some(Err(e)) => Verdict::Fatal(e.to_string()),
        }
    }
}

/// What to do with a job after a transient failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Put it back at the end of the queue after this delay
    Requeue(Duration),
    /// Attempts exhausted
    GiveUp,
}

pub fn decide(attempts: u32, max_attempts: u32, backoff: &BackoffPolicy) -> RetryDecision {
    if attempts >= max_attempts {
        RetryDecision::GiveUp
    } else {
        RetryDecision::Requeue(backoff.delay_for_attempt(attempts))
    }
}
