//! SQLite-backed run queue and result store.
//!
//! Two tables:
//!
//! - `runs(id, start, end)`: one row per enqueue; `id` increases monotonically.
//! - `test_instances(run_id, env, id, status, run_result, compare_result)`: natural key `(run_id, env, id)`.
//!
//! Every public operation holds the store's [`Lock`] for its whole duration, opens a fresh connection and runs
//! inside one transaction. Connections are never cached: the database file is shared with other processes and
//! other machines, and the lock is the only coordination between them.
//!
//! Timestamps are stored as fixed-width RFC 3339 UTC text, so `start <= ?` in SQL compares chronologically.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use thiserror::Error;
use toolcheck_core::{Env, ParseEnumError, RunResult, Status, TransitionError};

use crate::lock::{FileLock, Lock, LockError};

/// Marker file name, created next to the database.
pub const LOCK_FILENAME: &str = "db.lock";

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    start TEXT NOT NULL,
    "end" TEXT
);
CREATE TABLE IF NOT EXISTS test_instances (
    run_id INTEGER NOT NULL REFERENCES runs(id),
    env TEXT NOT NULL,
    id TEXT NOT NULL,
    status TEXT NOT NULL,
    run_result TEXT,
    compare_result TEXT,
    PRIMARY KEY (run_id, env, id)
);
"#;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("run result {result} given with status {status}; results are only recorded on completion")]
    ResultWithoutCompletion { status: Status, result: RunResult },

    #[error("dequeue of run {run_id} for {env} claimed {claimed} rows for {expected} test ids")]
    Integrity {
        env: Env,
        run_id: i64,
        expected: usize,
        claimed: usize,
    },

    #[error("no run with id {0}")]
    UnknownRun(i64),

    #[error("corrupt stored value: {0}")]
    Corrupt(#[from] ParseEnumError),

    #[error("corrupt stored timestamp '{value}': {source}")]
    Timestamp {
        value: String,
        #[source]
        source: chrono::ParseError,
    },
}

/// A newly created run and the ids queued under it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueuedRun {
    pub run_id: i64,
    /// Sorted, deduplicated
    pub test_ids: Vec<String>,
}

/// Instances just moved from `queued` to `waiting` for one environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DequeuedBatch {
    pub run_id: i64,
    pub test_ids: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRecord {
    pub id: i64,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRecord {
    pub run_id: i64,
    pub env: Env,
    pub test_id: String,
    pub status: Status,
    pub run_result: Option<RunResult>,
    pub compare_result: Option<String>,
}

/// Every row of both tables, read under one lock acquisition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub runs: Vec<RunRecord>,
    pub instances: Vec<InstanceRecord>,
}

pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(value: String) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(&value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|source| StoreError::Timestamp { value, source })
}

pub struct ResultStore<L: Lock = FileLock> {
    db_path: PathBuf,
    lock: L,
}

impl ResultStore<FileLock> {
    /// Store at `db_path`, locked by `db.lock` in the same directory.
    pub fn open(db_path: impl Into<PathBuf>) -> Self {
        Self::open_with_timeout(db_path, None)
    }

    pub fn open_with_timeout(db_path: impl Into<PathBuf>, timeout: Option<Duration>) -> Self {
        let db_path = db_path.into();
        let lock_path = db_path
            .parent()
            .map(|dir| dir.join(LOCK_FILENAME))
            .unwrap_or_else(|| PathBuf::from(LOCK_FILENAME));
        Self {
            db_path,
            lock: FileLock::new(lock_path).with_timeout(timeout),
        }
    }
}

impl<L: Lock> ResultStore<L> {
    pub fn with_lock(db_path: impl Into<PathBuf>, lock: L) -> Self {
        Self {
            db_path: db_path.into(),
            lock,
        }
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Run `f` in one transaction while holding the lock. An `Err` from `f` rolls back.
    fn with_tx<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T, StoreError>) -> Result<T, StoreError> {
        let _guard = self.lock.acquire()?;
        let mut conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA)?;
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// Create a run and queue one instance per `(env, id)`.
    ///
    /// With `only_prior_failures`, ids are first narrowed to those whose most recent recorded result is `FAIL`.
    /// Returns `None`, and leaves the database untouched, when no ids remain.
    #[tracing::instrument(skip_all, fields(ids = test_ids.len(), only_prior_failures = only_prior_failures))]
    pub fn enqueue_run(
        &self,
        test_ids: &[String],
        environments: &[Env],
        only_prior_failures: bool,
        start: DateTime<Utc>,
    ) -> Result<Option<EnqueuedRun>, StoreError> {
        self.with_tx(|tx| {
            let mut ids: BTreeSet<String> = test_ids.iter().cloned().collect();
            if only_prior_failures {
                let failed = latest_failures(tx)?;
                ids.retain(|id| failed.contains(id));
            }
            if ids.is_empty() || environments.is_empty() {
                tracing::info!("nothing to enqueue");
                return Ok(None);
            }

            tx.execute("INSERT INTO runs (start) VALUES (?1)", params![format_timestamp(start)])?;
            let run_id = tx.last_insert_rowid();
            for &env in environments {
                for id in &ids {
                    upsert_instance(tx, run_id, env, id, Status::Queued, None, None)?;
                }
            }

            tracing::info!(run_id, count = ids.len(), "enqueued run");
            Ok(Some(EnqueuedRun {
                run_id,
                test_ids: ids.into_iter().collect(),
            }))
        })
    }

    /// [`Self::dequeue_at`] with the current time.
    pub fn dequeue(&self, env: Env) -> Result<Option<DequeuedBatch>, StoreError> {
        self.dequeue_at(env, Utc::now())
    }

    /// Claim the queued instances of `env` in the most recent run that has started by `now`.
    ///
    /// Older eligible runs stay queued for later calls. A claim that touches more rows than the ids it returns
    /// means the table has lost its natural key, and is rolled back as [`StoreError::Integrity`].
    #[tracing::instrument(skip_all, fields(env = %env))]
    pub fn dequeue_at(&self, env: Env, now: DateTime<Utc>) -> Result<Option<DequeuedBatch>, StoreError> {
        self.with_tx(|tx| {
            let mut stmt = tx.prepare(
                "SELECT t.run_id, t.id FROM test_instances t
                 JOIN runs r ON r.id = t.run_id
                 WHERE t.env = ?1 AND t.status = 'queued' AND r.start <= ?2",
            )?;
            let rows = stmt
                .query_map(params![env.as_str(), format_timestamp(now)], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            let mut by_run: BTreeMap<i64, BTreeSet<String>> = BTreeMap::new();
            for (run_id, id) in rows {
                by_run.entry(run_id).or_default().insert(id);
            }
            let Some((run_id, test_ids)) = by_run.pop_last() else {
                return Ok(None);
            };
            if !by_run.is_empty() {
                tracing::debug!(older = ?by_run.keys().collect::<Vec<_>>(), "older runs left queued");
            }

            let claimed = tx.execute(
                "UPDATE test_instances SET status = 'waiting'
                 WHERE run_id = ?1 AND env = ?2 AND status = 'queued'",
                params![run_id, env.as_str()],
            )?;
            if claimed != test_ids.len() {
                return Err(StoreError::Integrity {
                    env,
                    run_id,
                    expected: test_ids.len(),
                    claimed,
                });
            }

            tracing::info!(run_id, count = test_ids.len(), "dequeued");
            Ok(Some(DequeuedBatch { run_id, test_ids }))
        })
    }

    /// Upsert one instance's status. Only forward, single-step transitions are accepted.
    #[tracing::instrument(skip_all, fields(run_id = run_id, env = %env, test_id = test_id, status = %status))]
    pub fn update_status(
        &self,
        run_id: i64,
        env: Env,
        test_id: &str,
        status: Status,
        run_result: Option<RunResult>,
        compare_result: Option<&str>,
    ) -> Result<(), StoreError> {
        if let Some(result) = run_result {
            if status != Status::Complete {
                return Err(StoreError::ResultWithoutCompletion { status, result });
            }
        }
        self.with_tx(|tx| upsert_instance(tx, run_id, env, test_id, status, run_result, compare_result))
    }

    #[tracing::instrument(skip_all, fields(run_id = run_id))]
    pub fn set_run_end(&self, run_id: i64, end: DateTime<Utc>) -> Result<(), StoreError> {
        self.with_tx(|tx| {
            let changed = tx.execute(
                "UPDATE runs SET \"end\" = ?1 WHERE id = ?2",
                params![format_timestamp(end), run_id],
            )?;
            if changed == 0 {
                return Err(StoreError::UnknownRun(run_id));
            }
            Ok(())
        })
    }

    pub fn fetch_all(&self) -> Result<Snapshot, StoreError> {
        self.with_tx(|tx| {
            let runs = {
                let mut stmt = tx.prepare("SELECT id, start, \"end\" FROM runs ORDER BY id")?;
                let raw = stmt
                    .query_map([], |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, Option<String>>(2)?,
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                raw.into_iter()
                    .map(|(id, start, end)| -> Result<RunRecord, StoreError> {
                        Ok(RunRecord {
                            id,
                            start: parse_timestamp(start)?,
                            end: end.map(parse_timestamp).transpose()?,
                        })
                    })
                    .collect::<Result<Vec<_>, StoreError>>()?
            };

            let instances = {
                let mut stmt = tx.prepare(
                    "SELECT run_id, env, id, status, run_result, compare_result
                     FROM test_instances ORDER BY run_id, env, id",
                )?;
                let raw = stmt
                    .query_map([], |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, Option<String>>(4)?,
                            row.get::<_, Option<String>>(5)?,
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                raw.into_iter().map(instance_from_row).collect::<Result<Vec<_>, StoreError>>()?
            };

            Ok(Snapshot { runs, instances })
        })
    }
}

type InstanceRow = (i64, String, String, String, Option<String>, Option<String>);

fn instance_from_row(row: InstanceRow) -> Result<InstanceRecord, StoreError> {
    let (run_id, env, test_id, status, run_result, compare_result) = row;
    Ok(InstanceRecord {
        run_id,
        env: env.parse()?,
        test_id,
        status: status.parse()?,
        run_result: run_result.map(|r| r.parse::<RunResult>()).transpose()?,
        compare_result,
    })
}

/// Ids whose most recent recorded result (across environments) includes a `FAIL`.
fn latest_failures(tx: &Transaction<'_>) -> Result<BTreeSet<String>, StoreError> {
    let mut stmt = tx.prepare(
        "SELECT DISTINCT t.id FROM test_instances t
         WHERE t.run_result = 'FAIL' AND t.run_id = (
             SELECT MAX(u.run_id) FROM test_instances u
             WHERE u.id = t.id AND u.run_result IS NOT NULL
         )",
    )?;
    let ids = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<BTreeSet<_>, _>>()?;
    Ok(ids)
}

fn upsert_instance(
    tx: &Transaction<'_>,
    run_id: i64,
    env: Env,
    test_id: &str,
    status: Status,
    run_result: Option<RunResult>,
    compare_result: Option<&str>,
) -> Result<(), StoreError> {
    let current: Option<String> = tx
        .query_row(
            "SELECT status FROM test_instances WHERE run_id = ?1 AND env = ?2 AND id = ?3",
            params![run_id, env.as_str(), test_id],
            |row| row.get(0),
        )
        .optional()?;
    let current = current.map(|s| s.parse::<Status>()).transpose()?;
    Status::check_transition(current, status)?;

    tx.execute(
        "INSERT INTO test_instances (run_id, env, id, status, run_result, compare_result)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT (run_id, env, id) DO UPDATE SET
             status = excluded.status,
             run_result = excluded.run_result,
             compare_result = excluded.compare_result",
        params![
            run_id,
            env.as_str(),
            test_id,
            status.as_str(),
            run_result.map(RunResult::as_str),
            compare_result
        ],
    )?;
    Ok(())
}
