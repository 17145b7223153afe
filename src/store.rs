//! SQLite persistence layer.
//!
//! Single source of truth for all job state. The persisted row is the only
//! cross-process mutual-exclusion mechanism: a claim is valid only once the
//! conditional status update succeeds (`rows_affected == 1`). Everything
//! layered above — the prefetch buffer, in-process locks — is advisory.
//!
//! Timestamps are stored as fixed-width RFC 3339 text (microsecond
//! precision, UTC) so lexicographic order equals chronological order.

use std::collections::BTreeMap;
use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use crate::error::{Error, Result};
use crate::model::{Job, JobId, NewJob, Status, dedup_key};

/// Result of offering a job to the store.
#[derive(Debug)]
pub enum Offered {
    /// A new row was inserted.
    Created(Job),
    /// An existing row with the same dedup key was reset to NEW and reused.
    Reused(Job),
}

impl Offered {
    pub fn job(&self) -> &Job {
        match self {
            Offered::Created(job) | Offered::Reused(job) => job,
        }
    }

    pub fn into_job(self) -> Job {
        match self {
            Offered::Created(job) | Offered::Reused(job) => job,
        }
    }
}

/// Storage backend. Owns the SQLite connection.
///
/// The connection sits behind a mutex; every call is a short local
/// statement, so contention stays negligible next to action execution.
pub struct JobStore {
    conn: Mutex<Connection>,
}

impl JobStore {
    /// Open or create a database at the given path.
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init()?;
        Ok(store)
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<()> {
        let conn = self.lock();

        // WAL mode for concurrent readers
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS jobs (
                id          TEXT PRIMARY KEY,
                action_type TEXT NOT NULL,
                status      TEXT NOT NULL DEFAULT 'NEW',
                dedup_key   TEXT NOT NULL,
                added       TEXT NOT NULL,
                start       TEXT,
                finished    TEXT,
                error       TEXT,
                UNIQUE (action_type, dedup_key)
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_poll ON jobs(action_type, added)
                WHERE status = 'NEW';
            CREATE INDEX IF NOT EXISTS idx_jobs_stalled ON jobs(action_type, start)
                WHERE status = 'PROCESSING';

            CREATE TABLE IF NOT EXISTS job_parameters (
                job_id  TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
                key     TEXT NOT NULL,
                value   TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_job_parameters ON job_parameters(job_id);
            ",
        )?;

        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // Poisoning only happens if a holder panicked mid-statement; the
        // connection itself is still usable.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    // -----------------------------------------------------------------------
    // Offer / lookup
    // -----------------------------------------------------------------------

    /// Persist a job, reusing an existing row with the same
    /// (action type, parameters) pair if one exists.
    ///
    /// On reuse the row is reset to NEW with `start`, `finished`, and
    /// `error` cleared; `id` and `added` are kept. Insert and parameter
    /// rows go in one transaction, so a failure leaves no partial state.
    pub fn offer(&self, new: &NewJob) -> Result<Offered> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let key = dedup_key(&new.parameters);

        let existing: Option<String> = tx
            .query_row(
                "SELECT id FROM jobs WHERE action_type = ?1 AND dedup_key = ?2",
                params![new.action_type, key],
                |row| row.get(0),
            )
            .optional()?;

        let reused = existing.is_some();
        let id = match existing {
            Some(id) => {
                tx.execute(
                    "UPDATE jobs SET status = 'NEW', start = NULL, finished = NULL, error = NULL
                     WHERE id = ?1",
                    params![id],
                )?;
                id
            }
            None => {
                let id = JobId::new().0.to_string();
                tx.execute(
                    "INSERT INTO jobs (id, action_type, status, dedup_key, added)
                     VALUES (?1, ?2, 'NEW', ?3, ?4)",
                    params![id, new.action_type, key, ts(Utc::now())],
                )?;
                for (k, v) in &new.parameters {
                    tx.execute(
                        "INSERT INTO job_parameters (job_id, key, value) VALUES (?1, ?2, ?3)",
                        params![id, k, v],
                    )?;
                }
                id
            }
        };

        let job = get_job_on(&tx, &id)?;
        tx.commit()?;

        if reused {
            Ok(Offered::Reused(job))
        } else {
            Ok(Offered::Created(job))
        }
    }

    /// Get a job by ID.
    pub fn get(&self, id: JobId) -> Result<Job> {
        get_job_on(&self.lock(), &id.0.to_string())
    }

    /// Find the job matching an exact parameter set, regardless of status.
    pub fn find(
        &self,
        action_type: &str,
        parameters: &BTreeMap<String, String>,
    ) -> Result<Option<Job>> {
        let conn = self.lock();
        let id: Option<String> = conn
            .query_row(
                "SELECT id FROM jobs WHERE action_type = ?1 AND dedup_key = ?2",
                params![action_type, dedup_key(parameters)],
                |row| row.get(0),
            )
            .optional()?;

        match id {
            Some(id) => Ok(Some(get_job_on(&conn, &id)?)),
            None => Ok(None),
        }
    }

    // -----------------------------------------------------------------------
    // Claiming
    // -----------------------------------------------------------------------

    /// IDs of the oldest NEW jobs for one action type, in `added` order.
    /// Feed for the queue's prefetch buffer — candidates only, never a claim.
    pub fn next_candidates(&self, action_type: &str, limit: usize) -> Result<Vec<JobId>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id FROM jobs WHERE action_type = ?1 AND status = 'NEW'
             ORDER BY added ASC, id ASC LIMIT ?2",
        )?;

        let ids = stmt
            .query_map(params![action_type, limit as i64], |row| {
                row.get::<_, String>(0)
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        ids.iter().map(|s| parse_id(s)).collect()
    }

    /// Attempt the conditional claim: NEW → PROCESSING with `start = now`.
    ///
    /// Returns `None` when the row is gone or no longer NEW (lost race),
    /// which callers treat as "no job", never as an error.
    pub fn claim(&self, id: JobId) -> Result<Option<Job>> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE jobs SET status = 'PROCESSING', start = ?1
             WHERE id = ?2 AND status = 'NEW'",
            params![ts(Utc::now()), id.0.to_string()],
        )?;

        if changed == 0 {
            return Ok(None);
        }
        Ok(Some(get_job_on(&conn, &id.0.to_string())?))
    }

    /// Read-only view of the job `claim` would take next.
    pub fn peek_next(&self, action_type: &str) -> Result<Option<Job>> {
        let conn = self.lock();
        let id: Option<String> = conn
            .query_row(
                "SELECT id FROM jobs WHERE action_type = ?1 AND status = 'NEW'
                 ORDER BY added ASC, id ASC LIMIT 1",
                params![action_type],
                |row| row.get(0),
            )
            .optional()?;

        match id {
            Some(id) => Ok(Some(get_job_on(&conn, &id)?)),
            None => Ok(None),
        }
    }

    /// Give a claim back: PROCESSING → NEW with `start` cleared.
    /// Returns false if the job was not PROCESSING anymore.
    pub fn release(&self, id: JobId) -> Result<bool> {
        let changed = self.lock().execute(
            "UPDATE jobs SET status = 'NEW', start = NULL
             WHERE id = ?1 AND status = 'PROCESSING'",
            params![id.0.to_string()],
        )?;
        Ok(changed == 1)
    }

    // -----------------------------------------------------------------------
    // Terminal outcomes
    // -----------------------------------------------------------------------

    /// PROCESSING → FINISHED with `finished = now`.
    ///
    /// Conditional on the claim still being held: if the stalled-job sweep
    /// revoked it meanwhile, this affects zero rows and returns false.
    pub fn mark_finished(&self, id: JobId) -> Result<bool> {
        let changed = self.lock().execute(
            "UPDATE jobs SET status = 'FINISHED', finished = ?1
             WHERE id = ?2 AND status = 'PROCESSING'",
            params![ts(Utc::now()), id.0.to_string()],
        )?;
        Ok(changed == 1)
    }

    /// PROCESSING → BROKEN, recording the failure message.
    pub fn mark_broken(&self, id: JobId, error: &str) -> Result<bool> {
        let changed = self.lock().execute(
            "UPDATE jobs SET status = 'BROKEN', error = ?1
             WHERE id = ?2 AND status = 'PROCESSING'",
            params![error, id.0.to_string()],
        )?;
        Ok(changed == 1)
    }

    // -----------------------------------------------------------------------
    // Deletion
    // -----------------------------------------------------------------------

    /// Hard-delete one job, ignoring status. Parameters cascade.
    pub fn remove(&self, id: JobId) -> Result<bool> {
        let changed = self
            .lock()
            .execute("DELETE FROM jobs WHERE id = ?1", params![id.0.to_string()])?;
        Ok(changed == 1)
    }

    /// Hard-delete every job of one action type. Returns the count removed.
    pub fn clear(&self, action_type: &str) -> Result<usize> {
        let changed = self.lock().execute(
            "DELETE FROM jobs WHERE action_type = ?1",
            params![action_type],
        )?;
        Ok(changed)
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    /// Count of NEW jobs for one action type.
    pub fn count_new(&self, action_type: &str) -> Result<usize> {
        let count: i64 = self.lock().query_row(
            "SELECT COUNT(*) FROM jobs WHERE action_type = ?1 AND status = 'NEW'",
            params![action_type],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// All jobs of one action type, any status, in `added` order.
    pub fn list(&self, action_type: &str) -> Result<Vec<Job>> {
        self.list_where(action_type, None)
    }

    /// NEW jobs of one action type, in `added` order.
    pub fn list_new(&self, action_type: &str) -> Result<Vec<Job>> {
        self.list_where(action_type, Some(Status::New))
    }

    fn list_where(&self, action_type: &str, status: Option<Status>) -> Result<Vec<Job>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id FROM jobs
             WHERE action_type = ?1 AND (?2 IS NULL OR status = ?2)
             ORDER BY added ASC, id ASC",
        )?;

        let ids = stmt
            .query_map(params![action_type, status.map(Status::as_str)], |row| {
                row.get::<_, String>(0)
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut jobs = Vec::with_capacity(ids.len());
        for id in &ids {
            jobs.push(get_job_on(&conn, id)?);
        }
        Ok(jobs)
    }

    // -----------------------------------------------------------------------
    // Stall recovery
    // -----------------------------------------------------------------------

    /// Reset every PROCESSING job of one action type whose claim started
    /// before `cutoff` back to NEW with `start` cleared.
    ///
    /// A single UPDATE, so the sweep is all-or-nothing. Returns the number
    /// of jobs reset.
    pub fn reset_stalled(&self, action_type: &str, cutoff: DateTime<Utc>) -> Result<usize> {
        let changed = self.lock().execute(
            "UPDATE jobs SET status = 'NEW', start = NULL
             WHERE action_type = ?1 AND status = 'PROCESSING' AND start < ?2",
            params![action_type, ts(cutoff)],
        )?;
        Ok(changed)
    }
}

// ---------------------------------------------------------------------------
// Inner functions — accept &Connection so they work with both
// Connection (auto-commit) and Transaction (deref to Connection).
// ---------------------------------------------------------------------------

fn get_job_on(conn: &Connection, id: &str) -> Result<Job> {
    let row: Option<(String, String, String, String, Option<String>, Option<String>, Option<String>)> =
        conn.query_row(
            "SELECT id, action_type, status, added, start, finished, error
             FROM jobs WHERE id = ?1",
            params![id],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                ))
            },
        )
        .optional()?;

    let (id, action_type, status, added, start, finished, error) =
        row.ok_or_else(|| Error::NotFound(id.to_string()))?;

    let mut parameters = BTreeMap::new();
    let mut stmt = conn.prepare("SELECT key, value FROM job_parameters WHERE job_id = ?1")?;
    let rows = stmt.query_map(params![id], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;
    for pair in rows {
        let (k, v) = pair?;
        parameters.insert(k, v);
    }

    Ok(Job {
        id: parse_id(&id)?,
        action_type,
        status: status
            .parse()
            .map_err(|e: String| Error::Config(format!("corrupt status column: {e}")))?,
        parameters,
        added: parse_ts(&added)?,
        start: start.as_deref().map(parse_ts).transpose()?,
        finished: finished.as_deref().map(parse_ts).transpose()?,
        error,
    })
}

fn parse_id(s: &str) -> Result<JobId> {
    s.parse()
        .map(JobId)
        .map_err(|e: uuid::Error| Error::Config(format!("corrupt job id {s}: {e}")))
}

fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Config(format!("corrupt timestamp {s}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn store() -> JobStore {
        JobStore::in_memory().unwrap()
    }

    fn offer(store: &JobStore, action: &str, id_param: &str) -> Job {
        store
            .offer(&NewJob::new(action).parameter("id", id_param))
            .unwrap()
            .into_job()
    }

    #[test]
    fn offer_then_get_round_trip() {
        let store = store();
        let job = offer(&store, "index", "1");

        let loaded = store.get(job.id).unwrap();
        assert_eq!(loaded.action_type, "index");
        assert_eq!(loaded.status, Status::New);
        assert_eq!(loaded.parameters.get("id").map(String::as_str), Some("1"));
        assert!(loaded.start.is_none());
        assert!(loaded.finished.is_none());
    }

    #[test]
    fn offer_same_parameters_reuses_row() {
        let store = store();
        let first = offer(&store, "index", "1");

        let second = store
            .offer(&NewJob::new("index").parameter("id", "1"))
            .unwrap();
        assert!(matches!(second, Offered::Reused(_)));
        assert_eq!(second.job().id, first.id);
        assert_eq!(second.job().added, first.added);
        assert_eq!(store.list("index").unwrap().len(), 1);
    }

    #[test]
    fn offer_distinct_parameters_creates_rows() {
        let store = store();
        offer(&store, "index", "1");
        offer(&store, "index", "2");
        assert_eq!(store.list("index").unwrap().len(), 2);
    }

    #[test]
    fn claim_is_conditional_on_new() {
        let store = store();
        let job = offer(&store, "index", "1");

        let claimed = store.claim(job.id).unwrap().expect("first claim wins");
        assert_eq!(claimed.status, Status::Processing);
        assert!(claimed.start.is_some());

        // Second claim loses the race: zero rows affected, no error.
        assert!(store.claim(job.id).unwrap().is_none());
    }

    #[test]
    fn finish_requires_live_claim() {
        let store = store();
        let job = offer(&store, "index", "1");

        // Not claimed yet — terminal write must not apply.
        assert!(!store.mark_finished(job.id).unwrap());

        store.claim(job.id).unwrap().unwrap();
        assert!(store.mark_finished(job.id).unwrap());

        let done = store.get(job.id).unwrap();
        assert_eq!(done.status, Status::Finished);
        assert!(done.finished.is_some());
        assert!(done.finished.unwrap() >= done.start.unwrap());
    }

    #[test]
    fn broken_records_error() {
        let store = store();
        let job = offer(&store, "index", "1");
        store.claim(job.id).unwrap().unwrap();
        assert!(store.mark_broken(job.id, "boom").unwrap());

        let broken = store.get(job.id).unwrap();
        assert_eq!(broken.status, Status::Broken);
        assert_eq!(broken.error.as_deref(), Some("boom"));
    }

    #[test]
    fn reuse_clears_terminal_fields() {
        let store = store();
        let job = offer(&store, "index", "1");
        store.claim(job.id).unwrap().unwrap();
        store.mark_broken(job.id, "boom").unwrap();

        let reused = offer(&store, "index", "1");
        assert_eq!(reused.id, job.id);
        assert_eq!(reused.status, Status::New);
        assert!(reused.start.is_none());
        assert!(reused.finished.is_none());
        assert!(reused.error.is_none());
    }

    #[test]
    fn candidates_come_back_in_added_order() {
        let store = store();
        let a = offer(&store, "index", "a");
        let b = offer(&store, "index", "b");
        let c = offer(&store, "index", "c");

        let ids = store.next_candidates("index", 10).unwrap();
        assert_eq!(ids, vec![a.id, b.id, c.id]);
    }

    #[test]
    fn candidates_ignore_other_action_types() {
        let store = store();
        offer(&store, "index", "1");
        let other = offer(&store, "publish", "1");

        let ids = store.next_candidates("publish", 10).unwrap();
        assert_eq!(ids, vec![other.id]);
    }

    #[test]
    fn reset_stalled_honors_cutoff() {
        let store = store();
        let stale = offer(&store, "index", "stale");
        let fresh = offer(&store, "index", "fresh");
        store.claim(stale.id).unwrap().unwrap();
        store.claim(fresh.id).unwrap().unwrap();

        // Backdate the stale claim by 20 minutes.
        store
            .lock()
            .execute(
                "UPDATE jobs SET start = ?1 WHERE id = ?2",
                params![ts(Utc::now() - Duration::minutes(20)), stale.id.0.to_string()],
            )
            .unwrap();

        let cutoff = Utc::now() - Duration::minutes(10);
        assert_eq!(store.reset_stalled("index", cutoff).unwrap(), 1);

        let stale = store.get(stale.id).unwrap();
        assert_eq!(stale.status, Status::New);
        assert!(stale.start.is_none());

        let fresh = store.get(fresh.id).unwrap();
        assert_eq!(fresh.status, Status::Processing);
    }

    #[test]
    fn late_finish_after_reset_is_dropped() {
        let store = store();
        let job = offer(&store, "index", "1");
        store.claim(job.id).unwrap().unwrap();
        store.release(job.id).unwrap();

        // Worker from the revoked claim reports success too late.
        assert!(!store.mark_finished(job.id).unwrap());
        assert_eq!(store.get(job.id).unwrap().status, Status::New);
    }

    #[test]
    fn remove_cascades_parameters() {
        let store = store();
        let job = offer(&store, "index", "1");
        assert!(store.remove(job.id).unwrap());

        let count: i64 = store
            .lock()
            .query_row("SELECT COUNT(*) FROM job_parameters", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
        assert!(matches!(store.get(job.id), Err(Error::NotFound(_))));
    }

    #[test]
    fn clear_deletes_regardless_of_status() {
        let store = store();
        let a = offer(&store, "index", "a");
        offer(&store, "index", "b");
        store.claim(a.id).unwrap().unwrap();

        assert_eq!(store.clear("index").unwrap(), 2);
        assert_eq!(store.list("index").unwrap().len(), 0);
    }
}
