//! Error taxonomy for admission, leasing and submission.

use std::fmt;

/// Why a job was refused at admission. Never retried by the core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    /// Every capacity slot is taken; the caller should retry later
    AtCapacity { capacity: usize },
    /// Admission is paused by the operator
    MaintenanceMode,
    /// Shutdown has begun
    Closed,
}

impl fmt::Display for AdmissionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdmissionError::AtCapacity { capacity } => {
                write!(f, "job queue is at capacity ({} jobs)", capacity)
            }
            AdmissionError::MaintenanceMode => write!(f, "service is in maintenance mode"),
            AdmissionError::Closed => write!(f, "job queue is closed"),
        }
    }
}

impl std::error::Error for AdmissionError {}

/// Returned by `JobQueue::dequeue` once shutdown has begun and nothing is left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    Closed,
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueError::Closed => write!(f, "job queue is closed"),
        }
    }
}

impl std::error::Error for QueueError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseError {
    /// The key pool has been shut down
    PoolClosed,
    /// The chain could not be asked for the key's sequence number; the key
    /// went back to the pool still flagged
    ResyncFailed { key_index: u32, message: String },
    /// A free-key permit was granted while every slot was marked leased
    NoFreeKey,
}

impl fmt::Display for LeaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LeaseError::PoolClosed => write!(f, "key pool is closed"),
            LeaseError::ResyncFailed { key_index, message } => {
                write!(f, "sequence resync for key {} failed: {}", key_index, message)
            }
            LeaseError::NoFreeKey => write!(f, "no free proposal key despite a free permit"),
        }
    }
}

impl std::error::Error for LeaseError {}

/// Errors raised by the chain-facing capabilities
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    /// Network or access node trouble; the submission may or may not have landed
    Transport(String),
    /// The transaction could not be built or signed; it never reached the chain
    InvalidPayload(String),
}

impl ChainError {
    pub fn is_retriable(&self) -> bool {
        matches!(self, ChainError::Transport(_))
    }
}

impl fmt::Display for ChainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainError::Transport(msg) => write!(f, "chain transport error: {}", msg),
            ChainError::InvalidPayload(msg) => write!(f, "invalid payload: {}", msg),
        }
    }
}

impl std::error::Error for ChainError {}

/// A configuration value is missing or out of range
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    pub field: String,
    pub message: String,
}

impl ConfigError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid config `{}`: {}", self.field, self.message)
    }
}

impl std::error::Error for ConfigError {}

/// The settings store could not be read or written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingsError {
    pub message: String,
}

impl SettingsError {
    pub fn new(message: impl Into<String>) -> Self {
        SettingsError {
            message: message.into(),
        }
    }
}

impl fmt::Display for SettingsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "settings store error: {}", self.message)
    }
}

impl std::error::Error for SettingsError {}

impl From<String> for SettingsError {
    fn from(s: String) -> Self {
        SettingsError::new(s)
    }
}
