//! In-process chain emulator
//!
//! Tracks one sequence number per proposal key and accepts a transaction only
//! when it carries exactly the expected sequence, like a real access node
//! would. Used for local development and by the dispatcher tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use submitter_types::JobPayload;

use super::{SequenceSource, SubmitOutcome, TransactionSubmitter};
use crate::error::ChainError;

/// A submission the emulator accepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptedTx {
    pub tx_id: String,
    pub key_index: u32,
    pub sequence: u64,
}

pub struct EmulatorChain {
    admin_address: String,
    sequences: Mutex<Vec<u64>>,
    accepted: Mutex<Vec<AcceptedTx>>,
    latency: Duration,
    sequence_queries: AtomicU64,
}

impl EmulatorChain {
    /// Every key of the admin account starts at `start_sequence`
    pub fn new(admin_address: impl Into<String>, key_count: u16, start_sequence: u64) -> Self {
        Self {
            admin_address: admin_address.into(),
            sequences: Mutex::new(vec![start_sequence; key_count as usize]),
            accepted: Mutex::new(Vec::new()),
            latency: Duration::ZERO,
            sequence_queries: AtomicU64::new(0),
        }
    }

    /// Simulated round-trip time of every call
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn admin_address(&self) -> &str {
        &self.admin_address
    }

    /// Move a key's on-chain sequence behind the process's back
    pub fn set_sequence(&self, key_index: u32, sequence: u64) {
        if let Some(slot) = self.sequences.lock().get_mut(key_index as usize) {
            *slot = sequence;
        }
    }

    pub fn sequence_of(&self, key_index: u32) -> Option<u64> {
        self.sequences.lock().get(key_index as usize).copied()
    }

    /// Accepted transactions in the order the emulator saw them
    pub fn accepted(&self) -> Vec<AcceptedTx> {
        self.accepted.lock().clone()
    }

    pub fn sequence_queries(&self) -> u64 {
        self.sequence_queries.load(Ordering::SeqCst)
    }

    async fn simulate_latency(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

#[async_trait]
impl TransactionSubmitter for EmulatorChain {
    async fn submit(
        &self,
        payload: &JobPayload,
        key_index: u32,
        sequence: u64,
    ) -> Result<SubmitOutcome, ChainError> {
        if payload.code.trim().is_empty() {
            return Err(ChainError::InvalidPayload("transaction code is empty".to_string()));
        }

        self.simulate_latency().await;

        let mut sequences = self.sequences.lock();
        let Some(expected) = sequences.get_mut(key_index as usize) else {
            return Ok(SubmitOutcome::Rejected {
                reason: format!(
                    "account {} has no proposal key {}",
                    self.admin_address, key_index
                ),
            });
        };

        if *expected != sequence {
            log::debug!(
                "[EMULATOR] Key {} sent sequence {}, expected {}",
                key_index,
                sequence,
                expected
            );
            return Ok(SubmitOutcome::SequenceMismatch { expected: *expected });
        }

        *expected += 1;
        let tx_id = uuid::Uuid::new_v4().simple().to_string();
        self.accepted.lock().push(AcceptedTx {
            tx_id: tx_id.clone(),
            key_index,
            sequence,
        });

        Ok(SubmitOutcome::Accepted { tx_id })
    }
}

#[async_trait]
impl SequenceSource for EmulatorChain {
    async fn current_sequence(&self, key_index: u32) -> Result<u64, ChainError> {
        self.sequence_queries.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        self.sequence_of(key_index).ok_or_else(|| {
            ChainError::Transport(format!(
                "account {} has no proposal key {}",
                self.admin_address, key_index
            ))
        })
    }
}
