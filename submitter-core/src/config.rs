use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ConfigError;
use crate::retry::BackoffPolicy;

/// Immutable configuration for the submission core.
///
/// Built once by the embedding process and shared by reference; nothing in
/// the core reads the environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitterConfig {
    /// Address of the custodial admin account that owns the proposal keys
    pub admin_address: String,
    /// Number of proposal keys registered on the admin account
    pub proposal_key_count: u16,
    /// Number of concurrent workers pulling from the queue
    pub worker_count: usize,
    /// Maximum number of admitted jobs that have not yet finished
    pub queue_capacity: usize,
    /// Dispatch cycles a job gets before it is marked failed
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    /// Upper bound on a single sign-and-submit call
    pub submit_timeout: Duration,
    /// How long shutdown waits for in-flight work before forcing leases back
    pub drain_timeout: Duration,
}

impl Default for SubmitterConfig {
    fn default() -> Self {
        Self {
            admin_address: String::new(),
            proposal_key_count: 1,
            worker_count: 100,
            queue_capacity: 1000,
            max_attempts: 5,
            backoff: BackoffPolicy::default(),
            submit_timeout: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(20),
        }
    }
}

impl SubmitterConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.admin_address.trim().is_empty() {
            return Err(ConfigError::new("admin_address", "must not be empty"));
        }
        if self.proposal_key_count == 0 {
            return Err(ConfigError::new("proposal_key_count", "must be at least 1"));
        }
        if self.worker_count == 0 {
            return Err(ConfigError::new("worker_count", "must be at least 1"));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::new("queue_capacity", "must be at least 1"));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::new("max_attempts", "must be at least 1"));
        }
        if self.backoff.base.is_zero() {
            return Err(ConfigError::new("backoff.base", "must be greater than zero"));
        }
        if self.backoff.max < self.backoff.base {
            return Err(ConfigError::new("backoff.max", "must not be below backoff.base"));
        }
        if self.submit_timeout.is_zero() {
            return Err(ConfigError::new("submit_timeout", "must be greater than zero"));
        }
        Ok(())
    }
}
