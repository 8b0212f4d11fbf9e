use std::path::Path;
use std::sync::Arc;

use at_types::{AtResult, Candidate, Job, JobId, JobStatus, StoreError};
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS autotune_jobs (
        id TEXT PRIMARY KEY,
        dataset_id TEXT NOT NULL,
        benchmark_id TEXT NOT NULL,
        base_config_id TEXT,
        status TEXT NOT NULL,
        phase_message TEXT NOT NULL DEFAULT '',
        top_k INTEGER NOT NULL,
        candidates TEXT,
        current_training_idx INTEGER NOT NULL DEFAULT 0,
        current_eval_idx INTEGER NOT NULL DEFAULT 0,
        started_at TEXT NOT NULL,
        completed_at TEXT,
        error TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_autotune_jobs_status ON autotune_jobs(status);
    CREATE INDEX IF NOT EXISTS idx_autotune_jobs_started_at ON autotune_jobs(started_at);";

const COLUMNS: &str = "id, dataset_id, benchmark_id, base_config_id, status, phase_message, top_k, \
     candidates, current_training_idx, current_eval_idx, started_at, completed_at, error";

fn db_error(e: rusqlite::Error) -> StoreError {
    StoreError::Database {
        message: e.to_string(),
    }
}

// Fixed-width UTC timestamps so `ORDER BY started_at` sorts chronologically.
// Nanoseconds keep a read-back record equal to the one written.
fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Durable job record store backed by SQLite.
///
/// Every write is a single `INSERT OR REPLACE` in autocommit mode, so a
/// record is either fully written or not at all, and is visible to other
/// readers as soon as the call returns. Clones share one connection.
#[derive(Clone)]
pub struct JobStore {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for JobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobStore").finish_non_exhaustive()
    }
}

impl JobStore {
    pub fn open<P: AsRef<Path>>(db_path: P) -> AtResult<Self> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(db_path.as_ref()).map_err(db_error)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;").map_err(db_error)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> AtResult<Self> {
        let conn = Connection::open_in_memory().map_err(db_error)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> AtResult<Self> {
        conn.execute_batch(SCHEMA).map_err(db_error)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn create(&self, job: &Job) -> AtResult<()> {
        self.write(job)?;
        tracing::debug!(job_id = %job.id, status = %job.status, "Created autotune job");
        Ok(())
    }

    /// Full overwrite; last writer wins.
    pub fn update(&self, job: &Job) -> AtResult<()> {
        self.write(job)
    }

    fn write(&self, job: &Job) -> AtResult<()> {
        let candidates = if job.candidates.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&job.candidates)?)
        };

        let conn = self.conn.lock();
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO autotune_jobs ({COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
            ),
            params![
                job.id.to_string(),
                job.dataset_id.to_string(),
                job.benchmark_id.to_string(),
                job.base_config_id.map(|id| id.to_string()),
                job.status.as_str(),
                job.phase_message,
                job.top_k as i64,
                candidates,
                job.current_training_idx as i64,
                job.current_eval_idx as i64,
                format_timestamp(&job.started_at),
                job.completed_at.as_ref().map(format_timestamp),
                job.error,
            ],
        )
        .map_err(db_error)?;
        Ok(())
    }

    pub fn get(&self, id: JobId) -> AtResult<Option<Job>> {
        let conn = self.conn.lock();
        let raw = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM autotune_jobs WHERE id = ?1"),
                params![id.to_string()],
                RawJob::from_row,
            )
            .optional()
            .map_err(db_error)?;
        drop(conn);

        raw.map(RawJob::into_job).transpose()
    }

    /// All jobs, most recently started first.
    pub fn list(&self) -> AtResult<Vec<Job>> {
        self.query_jobs(
            &format!("SELECT {COLUMNS} FROM autotune_jobs ORDER BY started_at DESC"),
            &[],
        )
    }

    pub fn list_by_status(&self, statuses: &[JobStatus]) -> AtResult<Vec<Job>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = (1..=statuses.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {COLUMNS} FROM autotune_jobs WHERE status IN ({placeholders}) ORDER BY started_at DESC"
        );
        let values: Vec<&str> = statuses.iter().map(|s| s.as_str()).collect();
        self.query_jobs(&sql, &values)
    }

    fn query_jobs(&self, sql: &str, values: &[&str]) -> AtResult<Vec<Job>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql).map_err(db_error)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(values.iter()), RawJob::from_row)
            .map_err(db_error)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_error)?;
        drop(stmt);
        drop(conn);

        rows.into_iter().map(RawJob::into_job).collect()
    }

    /// Returns `false` when no job had this id.
    pub fn delete(&self, id: JobId) -> AtResult<bool> {
        let conn = self.conn.lock();
        let affected = conn
            .execute("DELETE FROM autotune_jobs WHERE id = ?1", params![id.to_string()])
            .map_err(db_error)?;
        Ok(affected > 0)
    }
}

/// Column values as stored, decoded outside the connection lock.
struct RawJob {
    id: String,
    dataset_id: String,
    benchmark_id: String,
    base_config_id: Option<String>,
    status: String,
    phase_message: String,
    top_k: i64,
    candidates: Option<String>,
    current_training_idx: i64,
    current_eval_idx: i64,
    started_at: String,
    completed_at: Option<String>,
    error: Option<String>,
}

impl RawJob {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            dataset_id: row.get(1)?,
            benchmark_id: row.get(2)?,
            base_config_id: row.get(3)?,
            status: row.get(4)?,
            phase_message: row.get(5)?,
            top_k: row.get(6)?,
            candidates: row.get(7)?,
            current_training_idx: row.get(8)?,
            current_eval_idx: row.get(9)?,
            started_at: row.get(10)?,
            completed_at: row.get(11)?,
            error: row.get(12)?,
        })
    }

    fn into_job(self) -> AtResult<Job> {
        let id = self.id.clone();
        let corrupt = |message: String| StoreError::CorruptRecord {
            id: id.clone(),
            message,
        };
        let uuid = |field: &str, value: &str| {
            Uuid::parse_str(value).map_err(|e| corrupt(format!("{field}: {e}")))
        };
        let timestamp = |field: &str, value: &str| {
            DateTime::parse_from_rfc3339(value)
                .map(|ts| ts.with_timezone(&Utc))
                .map_err(|e| corrupt(format!("{field}: {e}")))
        };

        let candidates: Vec<Candidate> = match self.candidates.as_deref() {
            Some(json) => {
                serde_json::from_str(json).map_err(|e| corrupt(format!("candidates: {e}")))?
            }
            None => Vec::new(),
        };
        let status: JobStatus = self
            .status
            .parse()
            .map_err(|_| corrupt(format!("status: {}", self.status)))?;

        Ok(Job {
            id: uuid("id", &self.id)?,
            dataset_id: uuid("dataset_id", &self.dataset_id)?,
            benchmark_id: uuid("benchmark_id", &self.benchmark_id)?,
            base_config_id: self
                .base_config_id
                .as_deref()
                .map(|v| uuid("base_config_id", v))
                .transpose()?,
            status,
            phase_message: self.phase_message,
            top_k: self.top_k.max(0) as usize,
            candidates,
            current_training_idx: self.current_training_idx.max(0) as usize,
            current_eval_idx: self.current_eval_idx.max(0) as usize,
            started_at: timestamp("started_at", &self.started_at)?,
            completed_at: self
                .completed_at
                .as_deref()
                .map(|v| timestamp("completed_at", v))
                .transpose()?,
            error: self.error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use at_types::Hyperparameters;
    use chrono::Duration;
    use tempfile::TempDir;

    fn job() -> Job {
        Job::new(Uuid::new_v4(), Uuid::new_v4(), None, 2)
    }

    fn candidate(rank: usize) -> Candidate {
        Candidate::new(
            rank,
            Hyperparameters {
                learning_rate: 5e-5,
                lora_r: 16,
                batch_size: 2,
                num_epochs: 1,
            },
            0.5 - rank as f64 * 0.1,
        )
    }

    #[test]
    fn create_get_round_trip() {
        let store = JobStore::open_in_memory().unwrap();
        let mut job = job();
        job.base_config_id = Some(Uuid::new_v4());
        store.create(&job).unwrap();

        let loaded = store.get(job.id).unwrap().unwrap();
        assert_eq!(loaded.id, job.id);
        assert_eq!(loaded.base_config_id, job.base_config_id);
        assert_eq!(loaded.status, JobStatus::Pending);
        assert_eq!(loaded.phase_message, "Starting AutoTune...");
        assert!(loaded.candidates.is_empty());
    }

    #[test]
    fn read_back_equals_written_record() {
        let store = JobStore::open_in_memory().unwrap();
        let mut job = job();
        store.create(&job).unwrap();
        assert_eq!(store.get(job.id).unwrap().unwrap(), job);

        job.transition(JobStatus::Probing, "Probing").unwrap();
        job.set_candidates(vec![candidate(1)]).unwrap();
        job.mark_failed("probe crashed").unwrap();
        store.update(&job).unwrap();
        let loaded = store.get(job.id).unwrap().unwrap();
        assert_eq!(loaded.completed_at, job.completed_at);
        assert_eq!(loaded, job);
    }

    #[test]
    fn update_overwrites_whole_record() {
        let store = JobStore::open_in_memory().unwrap();
        let mut job = job();
        store.create(&job).unwrap();

        job.transition(JobStatus::Probing, "Probing").unwrap();
        job.set_candidates(vec![candidate(1), candidate(2)]).unwrap();
        job.transition(JobStatus::Training, "Training").unwrap();
        job.current_training_idx = 1;
        job.candidate_mut(0).unwrap().experiment_id = Some(Uuid::new_v4());
        store.update(&job).unwrap();

        let loaded = store.get(job.id).unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Training);
        assert_eq!(loaded.current_training_idx, 1);
        assert_eq!(loaded.candidates, job.candidates);
    }

    #[test]
    fn unknown_ids_are_not_errors() {
        let store = JobStore::open_in_memory().unwrap();
        assert!(store.get(Uuid::new_v4()).unwrap().is_none());
        assert!(!store.delete(Uuid::new_v4()).unwrap());
    }

    #[test]
    fn delete_reports_existence() {
        let store = JobStore::open_in_memory().unwrap();
        let job = job();
        store.create(&job).unwrap();
        assert!(store.delete(job.id).unwrap());
        assert!(store.get(job.id).unwrap().is_none());
        assert!(!store.delete(job.id).unwrap());
    }

    #[test]
    fn list_orders_by_start_time_descending() {
        let store = JobStore::open_in_memory().unwrap();
        let now = Utc::now();
        let mut ids = Vec::new();
        for minutes in [10, 0, 5] {
            let mut job = job();
            job.started_at = now - Duration::minutes(minutes);
            store.create(&job).unwrap();
            ids.push((minutes, job.id));
        }

        let listed: Vec<JobId> = store.list().unwrap().iter().map(|j| j.id).collect();
        let expected: Vec<JobId> = [0, 5, 10]
            .iter()
            .map(|m| ids.iter().find(|(minutes, _)| minutes == m).unwrap().1)
            .collect();
        assert_eq!(listed, expected);
    }

    #[test]
    fn list_by_status_filters() {
        let store = JobStore::open_in_memory().unwrap();
        let pending = job();
        let mut failed = job();
        failed.mark_failed("boom").unwrap();
        let mut probing = job();
        probing.transition(JobStatus::Probing, "Probing").unwrap();
        for j in [&pending, &failed, &probing] {
            store.create(j).unwrap();
        }

        let mut stale: Vec<JobId> = store
            .list_by_status(&[JobStatus::Pending, JobStatus::Probing])
            .unwrap()
            .iter()
            .map(|j| j.id)
            .collect();
        stale.sort();
        let mut expected = vec![pending.id, probing.id];
        expected.sort();
        assert_eq!(stale, expected);
        assert!(store.list_by_status(&[]).unwrap().is_empty());
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("jobs.db");
        let job = job();
        {
            let store = JobStore::open(&path).unwrap();
            store.create(&job).unwrap();
        }
        let reopened = JobStore::open(&path).unwrap();
        assert_eq!(reopened.get(job.id).unwrap().unwrap().id, job.id);
    }

    #[test]
    fn concurrent_writers_on_distinct_ids() {
        let store = JobStore::open_in_memory().unwrap();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    let mut job = job();
                    store.create(&job).unwrap();
                    job.transition(JobStatus::Probing, "Probing").unwrap();
                    store.update(&job).unwrap();
                    job.id
                })
            })
            .collect();
        let ids: Vec<JobId> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        for id in ids {
            assert_eq!(store.get(id).unwrap().unwrap().status, JobStatus::Probing);
        }
    }
}
