//! Per-action-type FIFO queue over the persisted job table.
//!
//! One `JobQueue` per action type. The queue keeps a small prefetch buffer
//! of claim candidates; the buffer is an optimization only. A claim is
//! valid only once the conditional status update on the persisted row
//! succeeds, so two processes (or two local tasks) can never both own a
//! job. One mutex serializes pop → refill → claim locally; any
//! out-of-order access (dedup lookup, explicit out-of-order claim,
//! deletion) clears the buffer, since it may have made cached entries
//! stale.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, Notify};
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::{Job, JobId, NewJob};
use crate::store::{JobStore, Offered};

/// Per-queue tuning, decided by the embedding host at registration time.
#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// How many candidate rows to prefetch per refill.
    pub prefetch: usize,
    /// Whether the queue starts enabled.
    pub enabled: bool,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            prefetch: 100,
            enabled: true,
        }
    }
}

/// FIFO view over NEW jobs of one action type, with claim semantics.
pub struct JobQueue {
    action_type: String,
    store: Arc<JobStore>,
    /// Buffer of claim candidates, oldest first. The lock also serializes
    /// the pop → refill → claim sequence.
    buffer: Mutex<VecDeque<JobId>>,
    notify: Notify,
    enabled: AtomicBool,
    prefetch: usize,
}

impl JobQueue {
    pub fn new(action_type: impl Into<String>, store: Arc<JobStore>, options: QueueOptions) -> Self {
        Self {
            action_type: action_type.into(),
            store,
            buffer: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            enabled: AtomicBool::new(options.enabled),
            prefetch: options.prefetch.max(1),
        }
    }

    pub fn action_type(&self) -> &str {
        &self.action_type
    }

    // -----------------------------------------------------------------------
    // Producing
    // -----------------------------------------------------------------------

    /// Persist a job, reusing an existing row with equal parameters.
    ///
    /// The reused (or new) row comes back NEW with `start` cleared, and
    /// waiters are signaled. Persistence errors abort with no state change.
    pub async fn offer(&self, new: NewJob) -> Result<Offered> {
        if new.action_type != self.action_type {
            return Err(Error::Config(format!(
                "job for action type {} offered to queue {}",
                new.action_type, self.action_type
            )));
        }

        let offered = self.store.offer(&new)?;

        // The dedup lookup may have resurrected a row out of added-order.
        self.buffer.lock().await.clear();

        debug!(
            queue = %self.action_type,
            job = %offered.job().id,
            reused = matches!(offered, Offered::Reused(_)),
            "job offered"
        );
        self.wake();
        Ok(offered)
    }

    // -----------------------------------------------------------------------
    // Claiming
    // -----------------------------------------------------------------------

    /// Claim the next eligible job: lowest `added` among NEW, flipped to
    /// PROCESSING with `start = now`.
    ///
    /// Returns `None` when nothing is available, when the queue is
    /// disabled, or when every buffered candidate lost its claim race.
    pub async fn poll(&self) -> Result<Option<Job>> {
        if !self.is_enabled() {
            return Ok(None);
        }

        let mut buffer = self.buffer.lock().await;
        loop {
            if buffer.is_empty() {
                let candidates = self.store.next_candidates(&self.action_type, self.prefetch)?;
                if candidates.is_empty() {
                    return Ok(None);
                }
                buffer.extend(candidates);
            }

            while let Some(id) = buffer.pop_front() {
                // Zero rows affected means another claimer won; skip.
                if let Some(job) = self.store.claim(id)? {
                    debug!(queue = %self.action_type, job = %job.id, "job claimed");
                    return Ok(Some(job));
                }
            }
        }
    }

    /// Read-only equivalent of `poll`: the job it would return, unmutated.
    pub fn peek(&self) -> Result<Option<Job>> {
        if !self.is_enabled() {
            return Ok(None);
        }
        self.store.peek_next(&self.action_type)
    }

    /// Claim the job matching this exact parameter set, bypassing FIFO
    /// order. Returns `None` if no such job exists or it is not NEW.
    pub async fn get_element_out_of_order(
        &self,
        parameters: &BTreeMap<String, String>,
    ) -> Result<Option<Job>> {
        let mut buffer = self.buffer.lock().await;
        buffer.clear();

        let job = match self.store.find(&self.action_type, parameters)? {
            Some(job) => job,
            None => return Ok(None),
        };

        let claimed = self.store.claim(job.id)?;
        if let Some(ref job) = claimed {
            debug!(queue = %self.action_type, job = %job.id, "job claimed out of order");
        }
        Ok(claimed)
    }

    // -----------------------------------------------------------------------
    // Deleting
    // -----------------------------------------------------------------------

    /// Hard-delete the job matching this parameter set, ignoring status.
    pub async fn remove(&self, parameters: &BTreeMap<String, String>) -> Result<bool> {
        let mut buffer = self.buffer.lock().await;
        buffer.clear();

        match self.store.find(&self.action_type, parameters)? {
            Some(job) => self.store.remove(job.id),
            None => Ok(false),
        }
    }

    /// Hard-delete every job of this action type. Returns the count.
    pub async fn clear(&self) -> Result<usize> {
        let mut buffer = self.buffer.lock().await;
        buffer.clear();
        self.store.clear(&self.action_type)
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    /// Count of NEW jobs.
    pub fn size(&self) -> Result<usize> {
        self.store.count_new(&self.action_type)
    }

    /// NEW jobs in claim order, read-only.
    pub fn new_jobs(&self) -> Result<Vec<Job>> {
        self.store.list_new(&self.action_type)
    }

    /// All jobs of this action type, any status, for the admin surface.
    pub fn jobs(&self) -> Result<Vec<Job>> {
        self.store.list(&self.action_type)
    }

    // -----------------------------------------------------------------------
    // Signaling and lifecycle
    // -----------------------------------------------------------------------

    /// Wake any task blocked waiting for this queue. Called by producers,
    /// by workers on completion, and by the stalled-job sweep.
    pub fn wake(&self) {
        self.notify.notify_waiters();
    }

    /// A future resolving on the next `wake`. Callers pair it with a
    /// bounded timeout: `notify_waiters` carries no permit, so a signal
    /// sent while nobody waits is deliberately covered by the timeout
    /// re-check, not by the notification itself.
    pub(crate) fn notified(&self) -> tokio::sync::futures::Notified<'_> {
        self.notify.notified()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Disable the queue: `poll`/`peek` return `None` until re-enabled.
    /// Persisted jobs are untouched.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
        if !enabled {
            self.wake();
        }
    }

    /// The shared persisted store backing this queue.
    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }
}
