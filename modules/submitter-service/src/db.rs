//! SQLite persistence: the settings record and the job outbox.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Result as SqliteResult, params};
use std::sync::{Mutex, MutexGuard};
use submitter_core::{JobOutbox, SettingsError, SettingsStore};
use submitter_types::*;

const JOB_COLUMNS: &str = "id, status, attempts, last_error, key_index, sequence, tx_id,
                           payload, revision, created_at, updated_at";

pub struct Db {
    conn: Mutex<Connection>,
}

impl Db {
    pub fn open(path: &str) -> SqliteResult<Self> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            Connection::open(path)?
        };
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        create_tables(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, String> {
        self.conn
            .lock()
            .map_err(|_| "database lock poisoned".to_string())
    }

    /// Insert or update a job. An older revision never overwrites a newer one.
    pub fn upsert_job(&self, job: &JobSummary) -> Result<(), String> {
        let payload = serde_json::to_string(&job.payload)
            .map_err(|e| format!("Failed to encode payload: {}", e))?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO jobs (id, status, attempts, last_error, key_index, sequence, tx_id,
                               payload, revision, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                attempts = excluded.attempts,
                last_error = excluded.last_error,
                key_index = excluded.key_index,
                sequence = excluded.sequence,
                tx_id = excluded.tx_id,
                revision = excluded.revision,
                updated_at = excluded.updated_at
             WHERE excluded.revision > jobs.revision",
            params![
                job.id,
                job.status.as_str(),
                job.attempts,
                job.last_error,
                job.key_index,
                job.sequence.map(|s| s as i64),
                job.tx_id,
                payload,
                job.revision as i64,
                timestamp(&job.created_at),
                timestamp(&job.updated_at),
            ],
        )
        .map_err(|e| format!("Failed to upsert job: {}", e))?;
        Ok(())
    }

    pub fn get_job(&self, id: &str) -> Result<Option<JobSummary>, String> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS),
            params![id],
            row_to_job,
        )
        .optional()
        .map_err(|e| format!("Database error: {}", e))
    }

    /// Most recently updated first
    pub fn list_recent_jobs(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<JobSummary>, String> {
        let conn = self.conn()?;
        let limit = limit as i64;
        let mut stmt;
        let rows = match status {
            Some(status) => {
                stmt = conn
                    .prepare(&format!(
                        "SELECT {} FROM jobs WHERE status = ?1
                         ORDER BY updated_at DESC LIMIT ?2",
                        JOB_COLUMNS
                    ))
                    .map_err(|e| format!("Database error: {}", e))?;
                stmt.query_map(params![status.as_str(), limit], row_to_job)
            }
            None => {
                stmt = conn
                    .prepare(&format!(
                        "SELECT {} FROM jobs ORDER BY updated_at DESC LIMIT ?1",
                        JOB_COLUMNS
                    ))
                    .map_err(|e| format!("Database error: {}", e))?;
                stmt.query_map(params![limit], row_to_job)
            }
        }
        .map_err(|e| format!("Database error: {}", e))?;

        rows.collect::<SqliteResult<Vec<_>>>()
            .map_err(|e| format!("Database error: {}", e))
    }

    /// Jobs a previous run parked at shutdown, oldest first
    pub fn load_requeued_jobs(&self) -> Result<Vec<JobSummary>, String> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM jobs WHERE status = 'requeued' ORDER BY created_at ASC",
                JOB_COLUMNS
            ))
            .map_err(|e| format!("Database error: {}", e))?;
        let rows = stmt
            .query_map([], row_to_job)
            .map_err(|e| format!("Database error: {}", e))?;
        rows.collect::<SqliteResult<Vec<_>>>()
            .map_err(|e| format!("Database error: {}", e))
    }
}

fn create_tables(conn: &Connection) -> SqliteResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS system_settings (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            maintenance_mode INTEGER NOT NULL DEFAULT 0,
            paused_since TEXT,
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;
    conn.execute(
        "INSERT OR IGNORE INTO system_settings (id) VALUES (1)",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS jobs (
            id TEXT PRIMARY KEY,
            status TEXT NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            key_index INTEGER,
            sequence INTEGER,
            tx_id TEXT,
            payload TEXT NOT NULL,
            revision INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_jobs_updated_at ON jobs(updated_at)",
        [],
    )?;
    Ok(())
}

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}

/// Fixed-width RFC 3339 so stored timestamps sort as text
fn timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(idx: usize, raw: String) -> SqliteResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, format!("bad timestamp '{}': {}", raw, e)))
}

fn row_to_job(row: &rusqlite::Row) -> SqliteResult<JobSummary> {
    let status: String = row.get(1)?;
    let status = JobStatus::parse(&status)
        .ok_or_else(|| conversion_error(1, format!("unknown job status '{}'", status)))?;
    let payload: String = row.get(7)?;
    let payload: JobPayload = serde_json::from_str(&payload)
        .map_err(|e| conversion_error(7, format!("bad payload: {}", e)))?;
    let sequence: Option<i64> = row.get(5)?;
    let revision: i64 = row.get(8)?;

    Ok(JobSummary {
        id: row.get(0)?,
        status,
        attempts: row.get(2)?,
        last_error: row.get(3)?,
        key_index: row.get(4)?,
        sequence: sequence.map(|s| s as u64),
        tx_id: row.get(6)?,
        payload,
        revision: revision as u64,
        created_at: parse_timestamp(9, row.get(9)?)?,
        updated_at: parse_timestamp(10, row.get(10)?)?,
    })
}

impl SettingsStore for Db {
    fn load(&self) -> Result<Settings, SettingsError> {
        let conn = self.conn()?;
        let (maintenance_mode, paused_since): (bool, Option<String>) = conn
            .query_row(
                "SELECT maintenance_mode, paused_since FROM system_settings WHERE id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(|e| SettingsError::new(format!("Failed to load settings: {}", e)))?;

        let paused_since = paused_since
            .map(|raw| parse_timestamp(1, raw))
            .transpose()
            .map_err(|e| SettingsError::new(e.to_string()))?;

        Ok(Settings {
            maintenance_mode,
            paused_since,
        })
    }

    fn save(&self, settings: &Settings) -> Result<(), SettingsError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE system_settings
             SET maintenance_mode = ?1,
                 paused_since = ?2,
                 updated_at = datetime('now')
             WHERE id = 1",
            params![
                settings.maintenance_mode,
                settings.paused_since.as_ref().map(timestamp),
            ],
        )
        .map_err(|e| SettingsError::new(format!("Failed to save settings: {}", e)))?;
        Ok(())
    }
}

impl JobOutbox for Db {
    fn record(&self, job: &JobSummary) {
        if let Err(e) = self.upsert_job(job) {
            log::error!("[SUBMITTER] Failed to persist job {}: {}", job.id, e);
        }
    }
}
