//! Service configuration from `SUBMITTER_*` environment variables.

use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;
use submitter_core::{BackoffPolicy, ConfigError, SubmitterConfig};

const DEFAULT_PORT: u16 = 9110;
const DEFAULT_DB_PATH: &str = "./submitter.db";

/// Where transactions are sent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainMode {
    /// In-process emulator; nothing leaves the machine
    Emulator,
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub submitter: SubmitterConfig,
    pub port: u16,
    pub db_path: String,
    pub chain_mode: ChainMode,
    /// Sequence every emulated proposal key starts at
    pub emulator_start_sequence: u64,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Build from any variable lookup. Unset or blank variables take their default.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = SubmitterConfig::default();

        let admin_address = var("SUBMITTER_ADMIN_ADDRESS")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ConfigError::new("SUBMITTER_ADMIN_ADDRESS", "is required"))?;

        let backoff = BackoffPolicy::new(
            Duration::from_millis(parse(
                &var,
                "SUBMITTER_BACKOFF_BASE_MS",
                defaults.backoff.base.as_millis() as u64,
            )?),
            Duration::from_millis(parse(
                &var,
                "SUBMITTER_BACKOFF_MAX_MS",
                defaults.backoff.max.as_millis() as u64,
            )?),
        );

        let submitter = SubmitterConfig {
            admin_address,
            proposal_key_count: parse(
                &var,
                "SUBMITTER_PROPOSAL_KEY_COUNT",
                defaults.proposal_key_count,
            )?,
            worker_count: parse(&var, "SUBMITTER_WORKER_COUNT", defaults.worker_count)?,
            queue_capacity: parse(&var, "SUBMITTER_QUEUE_CAPACITY", defaults.queue_capacity)?,
            max_attempts: parse(&var, "SUBMITTER_MAX_ATTEMPTS", defaults.max_attempts)?,
            backoff,
            submit_timeout: Duration::from_secs(parse(
                &var,
                "SUBMITTER_SUBMIT_TIMEOUT_SECS",
                defaults.submit_timeout.as_secs(),
            )?),
            drain_timeout: Duration::from_secs(parse(
                &var,
                "SUBMITTER_DRAIN_TIMEOUT_SECS",
                defaults.drain_timeout.as_secs(),
            )?),
        };
        submitter.validate()?;

        let mode = var("SUBMITTER_CHAIN_MODE");
        let chain_mode = match mode.as_deref().map(str::trim) {
            None | Some("") | Some("emulator") => ChainMode::Emulator,
            Some(other) => {
                return Err(ConfigError::new(
                    "SUBMITTER_CHAIN_MODE",
                    format!("unsupported chain mode '{}' (expected 'emulator')", other),
                ));
            }
        };

        Ok(Self {
            submitter,
            port: parse(&var, "SUBMITTER_PORT", DEFAULT_PORT)?,
            db_path: var("SUBMITTER_DB_PATH")
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            chain_mode,
            emulator_start_sequence: parse(&var, "SUBMITTER_EMULATOR_START_SEQUENCE", 0)?,
        })
    }
}

fn parse<T>(var: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match var(name) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e| ConfigError::new(name, format!("invalid value '{}': {}", raw, e))),
        _ => Ok(default),
    }
}
