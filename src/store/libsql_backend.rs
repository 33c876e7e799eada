//! libSQL backend — async `JobStore` implementation.
//!
//! Supports local file and in-memory databases. Every worker process opens
//! its own connection to the same file; SQLite's file locking serializes
//! writers across processes, and each mutation below is one statement.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};

use crate::error::{DatabaseError, JobError};
use crate::job::model::now;
use crate::job::{Job, JobState};
use crate::store::lease::{MAX_CLAIM_ROUNDS, format_ts, stale_cutoff};
use crate::store::migrations;
use crate::store::traits::{JobStore, QueueStats};

/// How long a connection waits on another process's write lock.
const BUSY_TIMEOUT_MS: u64 = 5_000;

/// libSQL job store.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlJobStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlJobStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        pragma(&conn, &format!("PRAGMA busy_timeout = {BUSY_TIMEOUT_MS}")).await?;
        pragma(&conn, "PRAGMA journal_mode = WAL").await?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::run_migrations(store.conn()).await?;
        info!(path = %path.display(), "Job store opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::run_migrations(store.conn()).await?;
        Ok(store)
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Pick the job this worker should try to lease next.
    ///
    /// Pending jobs first, then retry-ready failures, then processing jobs
    /// whose lease went stale, or that were released and left untouched for
    /// the lease timeout.
    async fn select_candidate(
        &self,
        now: &str,
        cutoff: &str,
    ) -> Result<Option<Job>, DatabaseError> {
        let pending = format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE state = 'pending' AND {CLAIMABLE_LEASE} \
             ORDER BY created_at ASC, id ASC LIMIT 1"
        );
        if let Some(job) = self.query_one(&pending, params![cutoff]).await? {
            return Ok(Some(job));
        }

        let retry_ready = format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE state = 'failed' AND attempts < max_retries \
               AND (next_retry_at IS NULL OR next_retry_at <= ?2) \
               AND {CLAIMABLE_LEASE} \
             ORDER BY next_retry_at ASC, created_at ASC LIMIT 1"
        );
        if let Some(job) = self.query_one(&retry_ready, params![cutoff, now]).await? {
            return Ok(Some(job));
        }

        let orphaned = format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE state = 'processing' AND {CLAIMABLE_LEASE} AND {PROCESSING_STALE} \
             ORDER BY created_at ASC, id ASC LIMIT 1"
        );
        self.query_one(&orphaned, params![cutoff]).await
    }

    async fn query_one(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Option<Job>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("select_candidate: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_job(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("select_candidate row: {e}"))),
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Run a PRAGMA and drain its result row.
async fn pragma(conn: &Connection, sql: &str) -> Result<(), DatabaseError> {
    let mut rows = conn
        .query(sql, ())
        .await
        .map_err(|e| DatabaseError::Pool(format!("{sql}: {e}")))?;
    rows.next()
        .await
        .map_err(|e| DatabaseError::Pool(format!("{sql}: {e}")))?;
    Ok(())
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_ts(ts: Option<DateTime<Utc>>) -> libsql::Value {
    match ts {
        Some(ts) => libsql::Value::Text(format_ts(ts)),
        None => libsql::Value::Null,
    }
}

fn to_u32(v: i64, column: &str) -> Result<u32, DatabaseError> {
    u32::try_from(v)
        .map_err(|_| DatabaseError::Serialization(format!("{column} out of range: {v}")))
}

/// Map a libsql Row to a Job.
///
/// Column order matches JOB_COLUMNS.
fn row_to_job(row: &libsql::Row) -> Result<Job, DatabaseError> {
    let get_err = |e: libsql::Error| DatabaseError::Serialization(format!("job row: {e}"));

    let state_str: String = row.get(2).map_err(get_err)?;
    let state = state_str
        .parse::<JobState>()
        .map_err(DatabaseError::Serialization)?;
    let attempts: i64 = row.get(3).map_err(get_err)?;
    let max_retries: i64 = row.get(4).map_err(get_err)?;
    let created_str: String = row.get(5).map_err(get_err)?;
    let updated_str: String = row.get(6).map_err(get_err)?;
    let next_retry_str: Option<String> = row.get(8).ok();
    let locked_at_str: Option<String> = row.get(10).ok();

    Ok(Job {
        id: row.get(0).map_err(get_err)?,
        command: row.get(1).map_err(get_err)?,
        state,
        attempts: to_u32(attempts, "attempts")?,
        max_retries: to_u32(max_retries, "max_retries")?,
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
        error_message: row.get(7).ok(),
        next_retry_at: parse_optional_datetime(&next_retry_str),
        locked_by: row.get(9).ok(),
        locked_at: parse_optional_datetime(&locked_at_str),
    })
}

// ── Trait implementation ────────────────────────────────────────────

const JOB_COLUMNS: &str = "id, command, state, attempts, max_retries, created_at, updated_at, error_message, next_retry_at, locked_by, locked_at";

/// Lease absent or stale; `?1` is the stale cutoff.
const CLAIMABLE_LEASE: &str = "(locked_by IS NULL OR locked_at IS NULL OR locked_at <= ?1)";

/// A processing row is only taken over once it has been quiet for the lease
/// timeout. A released lease leaves `locked_at` NULL, so `updated_at` (stamped
/// by `release`) stands in for it.
const PROCESSING_STALE: &str = "COALESCE(locked_at, updated_at) <= ?1";

#[async_trait]
impl JobStore for LibSqlJobStore {
    async fn add(&self, job: &Job) -> Result<(), JobError> {
        let inserted = self
            .conn()
            .execute(
                "INSERT INTO jobs (id, command, state, attempts, max_retries, created_at, updated_at, error_message, next_retry_at, locked_by, locked_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT(id) DO NOTHING",
                params![
                    job.id.as_str(),
                    job.command.as_str(),
                    job.state.as_str(),
                    i64::from(job.attempts),
                    i64::from(job.max_retries),
                    format_ts(job.created_at),
                    format_ts(job.updated_at),
                    opt_text(job.error_message.as_deref()),
                    opt_ts(job.next_retry_at),
                    opt_text(job.locked_by.as_deref()),
                    opt_ts(job.locked_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("add: {e}")))?;

        if inserted == 0 {
            return Err(JobError::DuplicateId { id: job.id.clone() });
        }
        debug!(job_id = %job.id, "Job inserted");
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Job, JobError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(row_to_job(&row)?),
            Ok(None) => Err(JobError::NotFound { id: id.to_string() }),
            Err(e) => Err(DatabaseError::Query(format!("get row: {e}")).into()),
        }
    }

    async fn update(&self, job: &Job) -> Result<(), JobError> {
        let updated = self
            .conn()
            .execute(
                "UPDATE jobs SET state = ?1, attempts = ?2, updated_at = ?3, error_message = ?4, next_retry_at = ?5, locked_by = ?6, locked_at = ?7
                 WHERE id = ?8 AND (state NOT IN ('completed', 'dead') OR state = ?1)",
                params![
                    job.state.as_str(),
                    i64::from(job.attempts),
                    format_ts(job.updated_at),
                    opt_text(job.error_message.as_deref()),
                    opt_ts(job.next_retry_at),
                    opt_text(job.locked_by.as_deref()),
                    opt_ts(job.locked_at),
                    job.id.as_str(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update: {e}")))?;

        if updated == 0 {
            // Either the row is gone or it sits in a terminal state.
            let stored = self.get(&job.id).await?;
            return Err(JobError::InvalidTransition {
                id: job.id.clone(),
                from: stored.state,
                to: job.state,
            });
        }
        debug!(job_id = %job.id, state = %job.state, attempts = job.attempts, "Job updated");
        Ok(())
    }

    async fn list(&self, state: Option<JobState>) -> Result<Vec<Job>, JobError> {
        let mut rows = match state {
            Some(state) => {
                self.conn()
                    .query(
                        &format!(
                            "SELECT {JOB_COLUMNS} FROM jobs WHERE state = ?1 ORDER BY created_at DESC, id ASC"
                        ),
                        params![state.as_str()],
                    )
                    .await
            }
            None => {
                self.conn()
                    .query(
                        &format!("SELECT {JOB_COLUMNS} FROM jobs ORDER BY created_at DESC, id ASC"),
                        (),
                    )
                    .await
            }
        }
        .map_err(|e| DatabaseError::Query(format!("list: {e}")))?;

        let mut jobs = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list row: {e}")))?
        {
            jobs.push(row_to_job(&row)?);
        }
        Ok(jobs)
    }

    async fn stats(&self) -> Result<QueueStats, JobError> {
        let conn = self.conn();
        let mut stats = QueueStats::default();

        let mut rows = conn
            .query("SELECT state, COUNT(*) FROM jobs GROUP BY state", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("stats: {e}")))?;
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("stats row: {e}")))?
        {
            let state_str: String = row
                .get(0)
                .map_err(|e| DatabaseError::Serialization(format!("stats state: {e}")))?;
            let count: i64 = row.get(1).unwrap_or(0);
            match state_str.parse::<JobState>() {
                Ok(state) => stats.set(state, count.max(0) as u64),
                Err(e) => tracing::warn!(error = %e, "Skipping unknown state in stats"),
            }
        }

        let cutoff = format_ts(stale_cutoff(now()));
        let mut rows = conn
            .query(
                "SELECT COUNT(DISTINCT locked_by) FROM jobs WHERE locked_by IS NOT NULL AND locked_at > ?1",
                params![cutoff],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("stats workers: {e}")))?;
        if let Ok(Some(row)) = rows.next().await {
            let active: i64 = row.get(0).unwrap_or(0);
            stats.active_workers = active.max(0) as u64;
        }

        Ok(stats)
    }

    async fn acquire(&self, worker_id: &str) -> Result<Option<Job>, JobError> {
        for round in 0..MAX_CLAIM_ROUNDS {
            let now = now();
            let now_str = format_ts(now);
            let cutoff = format_ts(stale_cutoff(now));

            let Some(candidate) = self.select_candidate(&now_str, &cutoff).await? else {
                return Ok(None);
            };

            // Compare-and-set: the lease and eligibility are re-checked by the
            // same statement that writes the new lease.
            let claimed = self
                .conn()
                .execute(
                    &format!(
                        "UPDATE jobs SET state = 'processing', locked_by = ?2, locked_at = ?3, next_retry_at = NULL, updated_at = ?3
                         WHERE id = ?4 AND state = ?5 AND {CLAIMABLE_LEASE}
                           AND (state != 'processing' OR {PROCESSING_STALE})
                           AND (state != 'failed' OR (attempts < max_retries AND (next_retry_at IS NULL OR next_retry_at <= ?3)))"
                    ),
                    params![
                        cutoff,
                        worker_id,
                        now_str,
                        candidate.id.as_str(),
                        candidate.state.as_str(),
                    ],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("acquire: {e}")))?;

            if claimed == 1 {
                if candidate.state == JobState::Processing {
                    info!(
                        job_id = %candidate.id,
                        worker_id,
                        previous_holder = candidate.locked_by.as_deref().unwrap_or("-"),
                        "Reclaimed job with stale lease"
                    );
                }
                debug!(job_id = %candidate.id, worker_id, "Job claimed");
                return self.get(&candidate.id).await.map(Some);
            }

            debug!(job_id = %candidate.id, worker_id, round, "Lost claim race, reselecting");
        }
        Ok(None)
    }

    async fn release(&self, id: &str) -> Result<(), JobError> {
        self.conn()
            .execute(
                "UPDATE jobs SET locked_by = NULL, locked_at = NULL, updated_at = ?1
                 WHERE id = ?2 AND (locked_by IS NOT NULL OR locked_at IS NOT NULL)",
                params![format_ts(now()), id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("release: {e}")))?;
        Ok(())
    }

    async fn retry_dead(&self, id: &str) -> Result<Job, JobError> {
        let mut job = self.get(id).await?;
        job.reset_from_dlq()?;

        // Conditional on the row still being dead, so a concurrent reset
        // cannot apply twice.
        let reset = self
            .conn()
            .execute(
                "UPDATE jobs SET state = ?1, attempts = ?2, error_message = NULL, next_retry_at = NULL,
                     locked_by = NULL, locked_at = NULL, updated_at = ?3
                 WHERE id = ?4 AND state = 'dead'",
                params![
                    job.state.as_str(),
                    i64::from(job.attempts),
                    format_ts(job.updated_at),
                    id,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("retry_dead: {e}")))?;

        if reset == 0 {
            let current = self.get(id).await?;
            return Err(JobError::NotInDlq {
                id: id.to_string(),
                state: current.state,
            });
        }
        info!(job_id = %id, "Job moved from DLQ back to pending");
        Ok(job)
    }
}
