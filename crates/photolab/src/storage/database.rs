//! SQLite database backing the job queue
//!
//! The database file is the only channel between the API process and worker
//! processes. Every state change is a guarded `UPDATE ... WHERE state = ...`
//! so transitions stay monotonic, and claims run inside an `IMMEDIATE`
//! transaction so a queued job is handed to exactly one worker.

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::types::{ClaimedJob, ItemResult, Job, JobItem, JobState, Mode, Progress};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Jobs removed by a retention purge
#[derive(Debug, Default)]
pub struct PurgedJobs {
    pub count: usize,
    /// Results of the removed jobs, whose stored objects are now unreferenced
    pub results: Vec<ItemResult>,
}

/// SQLite-based job store
pub struct JobDatabase {
    conn: Arc<Mutex<Connection>>,
}

impl JobDatabase {
    /// Create or open the database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)
            .map_err(|e| Error::database(format!("Failed to open database: {}", e)))?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(|e| Error::database(format!("Failed to set busy timeout: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.migrate()?;
        Ok(db)
    }

    /// Create an in-memory database (for testing)
    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::database(format!("Failed to open in-memory database: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.migrate()?;
        Ok(db)
    }

    /// Run database migrations
    fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock();

        // WAL lets status readers run while a worker writes progress
        conn.execute_batch(r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA temp_store=MEMORY;
        "#).map_err(|e| Error::database(format!("Failed to set pragmas: {}", e)))?;

        conn.execute_batch(r#"
            CREATE TABLE IF NOT EXISTS jobs (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                mode TEXT NOT NULL,
                state TEXT NOT NULL,
                total_items INTEGER NOT NULL,
                items_done INTEGER NOT NULL DEFAULT 0,
                timeout_secs INTEGER NOT NULL,
                results_json TEXT,
                error TEXT,
                worker_id TEXT,
                created_at TEXT NOT NULL,
                started_at TEXT,
                ended_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_state_seq ON jobs(state, seq);

            CREATE TABLE IF NOT EXISTS job_items (
                job_id TEXT NOT NULL,
                position INTEGER NOT NULL,
                filename TEXT NOT NULL,
                data BLOB NOT NULL,
                PRIMARY KEY (job_id, position)
            );
        "#).map_err(|e| Error::database(format!("Failed to create tables: {}", e)))?;

        Ok(())
    }

    // ==================== Producer Operations ====================

    /// Insert a queued job and its items in one transaction
    pub fn insert_job(&self, id: Uuid, mode: Mode, timeout: Duration, items: &[JobItem]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| Error::database(format!("Failed to begin transaction: {}", e)))?;

        tx.execute(
            r#"
            INSERT INTO jobs (id, mode, state, total_items, items_done, timeout_secs, created_at)
            VALUES (?1, ?2, 'queued', ?3, 0, ?4, ?5)
            "#,
            params![
                id.to_string(),
                mode.as_str(),
                items.len() as i64,
                timeout.as_secs() as i64,
                timestamp(Utc::now()),
            ],
        ).map_err(|e| Error::database(format!("Failed to create job: {}", e)))?;

        {
            let mut stmt = tx
                .prepare("INSERT INTO job_items (job_id, position, filename, data) VALUES (?1, ?2, ?3, ?4)")
                .map_err(|e| Error::database(format!("Failed to prepare query: {}", e)))?;
            for (position, item) in items.iter().enumerate() {
                stmt.execute(params![id.to_string(), position as i64, item.filename, item.data])
                    .map_err(|e| Error::database(format!("Failed to add item {}: {}", item.filename, e)))?;
            }
        }

        tx.commit()
            .map_err(|e| Error::database(format!("Failed to commit job: {}", e)))?;
        Ok(())
    }

    // ==================== Reader Operations ====================

    /// Get a job by ID (without item payloads)
    pub fn get_job(&self, id: Uuid) -> Result<Option<Job>> {
        let conn = self.conn.lock();

        let job = conn
            .query_row(
                r#"
                SELECT id, mode, state, total_items, items_done, timeout_secs, results_json,
                       error, worker_id, created_at, started_at, ended_at
                FROM jobs WHERE id = ?1
                "#,
                params![id.to_string()],
                row_to_job,
            )
            .optional()
            .map_err(|e| Error::database(format!("Failed to get job: {}", e)))?;

        let Some(mut job) = job else {
            return Ok(None);
        };

        let mut stmt = conn
            .prepare("SELECT filename FROM job_items WHERE job_id = ?1 ORDER BY position ASC")
            .map_err(|e| Error::database(format!("Failed to prepare query: {}", e)))?;
        job.filenames = stmt
            .query_map(params![id.to_string()], |row| row.get::<_, String>(0))
            .map_err(|e| Error::database(format!("Failed to list items: {}", e)))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| Error::database(format!("Failed to read items: {}", e)))?;

        Ok(Some(job))
    }

    /// Number of jobs per state
    pub fn count_by_state(&self) -> Result<Vec<(JobState, usize)>> {
        let conn = self.conn.lock();

        let mut stmt = conn
            .prepare("SELECT state, COUNT(*) FROM jobs GROUP BY state")
            .map_err(|e| Error::database(format!("Failed to prepare query: {}", e)))?;

        let counts = stmt
            .query_map([], |row| {
                let state: String = row.get(0)?;
                let count: i64 = row.get(1)?;
                Ok((state, count as usize))
            })
            .map_err(|e| Error::database(format!("Failed to count jobs: {}", e)))?
            .filter_map(|r| r.ok())
            .filter_map(|(state, count)| JobState::parse(&state).map(|s| (s, count)))
            .collect();

        Ok(counts)
    }

    // ==================== Worker Operations ====================

    /// Atomically move the oldest queued job to `started` for `worker_id`
    pub fn claim_next(&self, worker_id: &str) -> Result<Option<ClaimedJob>> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| Error::database(format!("Failed to begin claim: {}", e)))?;

        let candidate = tx
            .query_row(
                "SELECT id, mode, timeout_secs FROM jobs WHERE state = 'queued' ORDER BY seq ASC LIMIT 1",
                [],
                |row| {
                    let id: String = row.get(0)?;
                    let mode: String = row.get(1)?;
                    let timeout_secs: i64 = row.get(2)?;
                    Ok((id, mode, timeout_secs))
                },
            )
            .optional()
            .map_err(|e| Error::database(format!("Failed to find queued job: {}", e)))?;

        let Some((id_str, mode_str, timeout_secs)) = candidate else {
            return Ok(None);
        };

        let claimed = tx
            .execute(
                r#"
                UPDATE jobs SET state = 'started', worker_id = ?2, started_at = ?3
                WHERE id = ?1 AND state = 'queued'
                "#,
                params![id_str, worker_id, timestamp(Utc::now())],
            )
            .map_err(|e| Error::database(format!("Failed to claim job: {}", e)))?;
        if claimed == 0 {
            return Ok(None);
        }

        let items = {
            let mut stmt = tx
                .prepare("SELECT filename, data FROM job_items WHERE job_id = ?1 ORDER BY position ASC")
                .map_err(|e| Error::database(format!("Failed to prepare query: {}", e)))?;
            let rows = stmt
                .query_map(params![id_str], |row| {
                    Ok(JobItem {
                        filename: row.get(0)?,
                        data: row.get(1)?,
                    })
                })
                .map_err(|e| Error::database(format!("Failed to load items: {}", e)))?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(|e| Error::database(format!("Failed to read items: {}", e)))?;
            rows
        };

        tx.commit()
            .map_err(|e| Error::database(format!("Failed to commit claim: {}", e)))?;

        let id = Uuid::parse_str(&id_str)
            .map_err(|e| Error::database(format!("Corrupt job id '{}': {}", id_str, e)))?;
        let mode = mode_str.parse::<Mode>()?;

        Ok(Some(ClaimedJob {
            id,
            mode,
            timeout: Duration::from_secs(timeout_secs.max(0) as u64),
            items,
        }))
    }

    /// Raise the completed item count of a started job; never lowers it
    pub fn update_progress(&self, id: Uuid, done: usize) -> Result<bool> {
        let conn = self.conn.lock();

        let updated = conn
            .execute(
                r#"
                UPDATE jobs SET items_done = ?2
                WHERE id = ?1 AND state = 'started' AND items_done < ?2 AND ?2 <= total_items
                "#,
                params![id.to_string(), done as i64],
            )
            .map_err(|e| Error::database(format!("Failed to update progress: {}", e)))?;

        Ok(updated == 1)
    }

    /// Write the full result list and mark a started job finished
    pub fn finish_job(&self, id: Uuid, results: &[ItemResult]) -> Result<bool> {
        let conn = self.conn.lock();
        let results_json = serde_json::to_string(results)?;

        let updated = conn
            .execute(
                r#"
                UPDATE jobs SET state = 'finished', results_json = ?2, items_done = total_items, ended_at = ?3
                WHERE id = ?1 AND state = 'started'
                "#,
                params![id.to_string(), results_json, timestamp(Utc::now())],
            )
            .map_err(|e| Error::database(format!("Failed to finish job: {}", e)))?;

        Ok(updated == 1)
    }

    /// Mark a non-terminal job failed
    pub fn fail_job(&self, id: Uuid, error: &str) -> Result<bool> {
        let conn = self.conn.lock();

        let updated = conn
            .execute(
                r#"
                UPDATE jobs SET state = 'failed', error = ?2, ended_at = ?3
                WHERE id = ?1 AND state IN ('queued', 'started')
                "#,
                params![id.to_string(), error, timestamp(Utc::now())],
            )
            .map_err(|e| Error::database(format!("Failed to fail job: {}", e)))?;

        Ok(updated == 1)
    }

    // ==================== Maintenance Operations ====================

    /// Started jobs with their start time and timeout
    pub fn started_jobs(&self) -> Result<Vec<(Uuid, DateTime<Utc>, Duration)>> {
        let conn = self.conn.lock();

        let mut stmt = conn
            .prepare("SELECT id, started_at, timeout_secs FROM jobs WHERE state = 'started'")
            .map_err(|e| Error::database(format!("Failed to prepare query: {}", e)))?;

        let jobs = stmt
            .query_map([], |row| {
                let id: String = row.get(0)?;
                let started_at: Option<String> = row.get(1)?;
                let timeout_secs: i64 = row.get(2)?;
                Ok((id, started_at, timeout_secs))
            })
            .map_err(|e| Error::database(format!("Failed to list started jobs: {}", e)))?
            .filter_map(|r| r.ok())
            .filter_map(|(id, started_at, timeout_secs)| {
                let id = Uuid::parse_str(&id).ok()?;
                let started_at = parse_time(started_at.as_deref()?)?;
                Some((id, started_at, Duration::from_secs(timeout_secs.max(0) as u64)))
            })
            .collect();

        Ok(jobs)
    }

    /// Delete terminal jobs that ended before `cutoff`
    pub fn purge_ended_before(&self, cutoff: DateTime<Utc>) -> Result<PurgedJobs> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| Error::database(format!("Failed to begin transaction: {}", e)))?;
        let cutoff = timestamp(cutoff);

        let results = {
            let mut stmt = tx
                .prepare(
                    r#"
                    SELECT results_json FROM jobs
                    WHERE state IN ('finished', 'failed') AND ended_at < ?1 AND results_json IS NOT NULL
                    "#,
                )
                .map_err(|e| Error::database(format!("Failed to prepare query: {}", e)))?;
            let rows = stmt
                .query_map(params![cutoff], |row| row.get::<_, String>(0))
                .map_err(|e| Error::database(format!("Failed to list expired results: {}", e)))?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(|e| Error::database(format!("Failed to read expired results: {}", e)))?;

            let mut results = Vec::new();
            for json in rows {
                match serde_json::from_str::<Vec<ItemResult>>(&json) {
                    Ok(items) => results.extend(items),
                    Err(e) => tracing::warn!("Skipping unreadable results of an expired job: {}", e),
                }
            }
            results
        };

        tx.execute(
            r#"
            DELETE FROM job_items WHERE job_id IN (
                SELECT id FROM jobs WHERE state IN ('finished', 'failed') AND ended_at < ?1
            )
            "#,
            params![cutoff],
        ).map_err(|e| Error::database(format!("Failed to purge items: {}", e)))?;

        let count = tx
            .execute(
                "DELETE FROM jobs WHERE state IN ('finished', 'failed') AND ended_at < ?1",
                params![cutoff],
            )
            .map_err(|e| Error::database(format!("Failed to purge jobs: {}", e)))?;

        tx.commit()
            .map_err(|e| Error::database(format!("Failed to commit purge: {}", e)))?;
        Ok(PurgedJobs { count, results })
    }

    /// Flush the write-ahead log into the main database file
    pub fn checkpoint(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))
            .optional()
            .map_err(|e| Error::database(format!("Failed to checkpoint: {}", e)))?;
        Ok(())
    }
}

/// Fixed-width RFC 3339 so stored times compare correctly as text
fn timestamp(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_time(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .ok()
}

fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<Job> {
    let id_str: String = row.get(0)?;
    let mode_str: String = row.get(1)?;
    let state_str: String = row.get(2)?;
    let total_items: i64 = row.get(3)?;
    let items_done: i64 = row.get(4)?;
    let timeout_secs: i64 = row.get(5)?;
    let results_json: Option<String> = row.get(6)?;
    let error: Option<String> = row.get(7)?;
    let worker_id: Option<String> = row.get(8)?;
    let created_at_str: String = row.get(9)?;
    let started_at_str: Option<String> = row.get(10)?;
    let ended_at_str: Option<String> = row.get(11)?;

    let conversion = |col: usize, message: String| {
        rusqlite::Error::FromSqlConversionFailure(
            col,
            rusqlite::types::Type::Text,
            message.into(),
        )
    };

    let id = Uuid::parse_str(&id_str).map_err(|e| conversion(0, e.to_string()))?;
    let mode = mode_str
        .parse::<Mode>()
        .map_err(|e| conversion(1, e.to_string()))?;
    let state = JobState::parse(&state_str)
        .ok_or_else(|| conversion(2, format!("unknown state '{}'", state_str)))?;
    let results: Vec<ItemResult> = match results_json {
        Some(json) => serde_json::from_str(&json).map_err(|e| conversion(6, e.to_string()))?,
        None => Vec::new(),
    };

    Ok(Job {
        id,
        mode,
        state,
        progress: Progress {
            done: items_done.max(0) as usize,
            total: total_items.max(0) as usize,
        },
        results,
        filenames: Vec::new(),
        error,
        timeout: Duration::from_secs(timeout_secs.max(0) as u64),
        worker_id,
        created_at: parse_time(&created_at_str).unwrap_or_else(Utc::now),
        started_at: started_at_str.as_deref().and_then(parse_time),
        ended_at: ended_at_str.as_deref().and_then(parse_time),
    })
}
