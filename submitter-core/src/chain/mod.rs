//! Chain-facing capabilities
//!
//! The submission core never signs or talks to an access node itself. It is
//! handed two capabilities at construction time:
//!
//! - **TransactionSubmitter**: builds, signs and sends a transaction with a
//!   given proposal key and sequence number
//! - **SequenceSource**: reports the sequence number the chain currently
//!   expects for a key, used only to resync a key after a suspected desync
//!
//! `EmulatorChain` implements both in-process for local development.

mod emulator;

pub use emulator::EmulatorChain;

use async_trait::async_trait;
use submitter_types::JobPayload;

use crate::error::ChainError;

/// What the chain said about a submitted transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Accepted; the key's sequence number has been consumed
    Accepted { tx_id: String },
    /// The key's sequence number was not the one the chain expected
    SequenceMismatch { expected: u64 },
    /// Rejected for a reason that retrying will not fix
    Rejected { reason: String },
}

#[async_trait]
pub trait TransactionSubmitter: Send + Sync {
    /// Sign `payload` with proposal key `key_index` at `sequence` and send it
    async fn submit(
        &self,
        payload: &JobPayload,
        key_index: u32,
        sequence: u64,
    ) -> Result<SubmitOutcome, ChainError>;
}

#[async_trait]
pub trait SequenceSource: Send + Sync {
    /// The next sequence number the chain will accept for `key_index`
    async fn current_sequence(&self, key_index: u32) -> Result<u64, ChainError>;
}
