//! Transaction submission core
//!
//! Accepts opaque transaction jobs, queues them with bounded capacity and
//! dispatches them through a worker pool that signs each one with a leased
//! proposal key of a shared admin account. Every key's sequence number is
//! owned by exactly one worker at a time, so concurrent submissions never
//! reuse or skip a sequence.

pub mod chain;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod job_queue;
pub mod jobs;
pub mod key_pool;
pub mod retry;
pub mod settings;

#[cfg(test)]
mod dispatcher_tests;

pub use chain::{EmulatorChain, SequenceSource, SubmitOutcome, TransactionSubmitter};
pub use config::SubmitterConfig;
pub use dispatcher::{Dispatcher, ShutdownReport};
pub use error::{AdmissionError, ChainError, ConfigError, LeaseError, QueueError, SettingsError};
pub use job_queue::JobQueue;
pub use jobs::{Job, JobOutbox, JobTracker};
pub use key_pool::{KeyLease, KeyPool, ProposalKey, ReleaseOutcome};
pub use retry::BackoffPolicy;
pub use settings::{MemorySettingsStore, SettingsGate, SettingsService, SettingsStore};
