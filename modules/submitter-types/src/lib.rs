//! Shared types for the transaction submitter service and its RPC clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

// =====================================================
// Domain Types
// =====================================================

/// Opaque transaction template plus the signer inputs it needs.
///
/// The submission core never looks inside; it is handed verbatim to the
/// signing/submission capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    /// Transaction script / template body
    pub code: String,
    /// Encoded script arguments
    #[serde(default)]
    pub arguments: Vec<serde_json::Value>,
    /// Addresses of managed accounts that must co-sign as authorizers
    #[serde(default)]
    pub authorizers: Vec<String>,
}

impl JobPayload {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            arguments: Vec::new(),
            authorizers: Vec::new(),
        }
    }
}

/// Lifecycle state of a submission job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Admitted, waiting for a worker
    Queued,
    /// Picked up by a worker, holding or waiting on a proposal key
    Leased,
    /// Handed to the chain with a leased key and sequence number
    Submitted,
    /// Accepted by the chain
    Confirmed,
    /// Failed transiently, waiting to go back into the queue
    Requeued,
    /// Gave up (fatal error or attempts exhausted)
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Confirmed | JobStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Leased => "leased",
            JobStatus::Submitted => "submitted",
            JobStatus::Confirmed => "confirmed",
            JobStatus::Requeued => "requeued",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(JobStatus::Queued),
            "leased" => Some(JobStatus::Leased),
            "submitted" => Some(JobStatus::Submitted),
            "confirmed" => Some(JobStatus::Confirmed),
            "requeued" => Some(JobStatus::Requeued),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Caller-visible snapshot of a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    pub id: String,
    pub status: JobStatus,
    /// Number of dispatch cycles the job has been through
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Proposal key used by the most recent dispatch cycle
    pub key_index: Option<u32>,
    /// Sequence number used by the most recent dispatch cycle
    pub sequence: Option<u64>,
    /// Chain transaction id, set once confirmed
    pub tx_id: Option<String>,
    pub payload: JobPayload,
    /// Bumped on every state change; later revisions supersede earlier ones
    pub revision: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Operational settings owned by the settings store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// When set, new jobs are refused at admission; queued jobs keep draining
    pub maintenance_mode: bool,
    /// When chain event listening was paused, if it is
    pub paused_since: Option<DateTime<Utc>>,
}

/// Partial settings update. Absent fields leave the current value alone.
///
/// `paused_since` distinguishes "absent" (`None`) from an explicit `null`
/// (`Some(None)`), which clears the stored value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingsUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maintenance_mode: Option<bool>,
    #[serde(
        default,
        deserialize_with = "double_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub paused_since: Option<Option<DateTime<Utc>>>,
}

fn double_option<'de, D, T>(de: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Deserialize::deserialize(de).map(Some)
}

/// Point-in-time view of one proposal key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyState {
    pub index: u32,
    pub sequence: u64,
    pub leased: bool,
    pub needs_resync: bool,
}

/// Aggregate key pool counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPoolStats {
    pub total: usize,
    pub leased: usize,
    pub needs_resync: usize,
    pub resync_queries: u64,
}

// =====================================================
// RPC Request Types
// =====================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct GetJobRequest {
    pub id: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RecentJobsQuery {
    pub status: Option<JobStatus>,
    pub limit: Option<usize>,
}

// =====================================================
// RPC Response Types
// =====================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct RpcResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> RpcResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub running: bool,
    pub uptime_secs: u64,
    pub admin_address: String,
    pub maintenance_mode: bool,
    pub worker_count: usize,
    pub queue_length: usize,
    pub queue_outstanding: usize,
    pub queue_capacity: usize,
    pub in_flight: usize,
    pub keys: KeyPoolStats,
    pub key_states: Vec<KeyState>,
}
