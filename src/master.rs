//! Job master: the per-queue scheduler loop.
//!
//! Continuously pulls claimed jobs from its queue and dispatches them to a
//! worker pool bounded at a configured concurrency. Admission control is
//! the master's own: it checks the active-worker count before polling, so
//! a saturated pool pauses claiming instead of piling claimed jobs behind
//! the pool and defeating queue ordering.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::action::ActionRegistry;
use crate::model::Job;
use crate::queue::JobQueue;
use crate::worker;

/// Per-master tuning.
#[derive(Debug, Clone)]
pub struct MasterOptions {
    /// Worker-pool bound: at most this many jobs execute concurrently.
    pub workers: usize,
    /// Upper bound on the idle wait. A safety net against the
    /// missed-notification race, not the normal wake path.
    pub idle_wait: Duration,
    /// Recheck pause while the pool is saturated.
    pub saturation_pause: Duration,
    /// How long `prepare_close` waits for in-flight jobs to drain.
    pub shutdown_grace: Duration,
}

impl Default for MasterOptions {
    fn default() -> Self {
        Self {
            workers: 4,
            idle_wait: Duration::from_secs(60),
            saturation_pause: Duration::from_millis(100),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Dispatch {
    /// Job handed to a worker or terminally resolved.
    Submitted,
    /// Job released because its action is deactivated.
    Parked,
}

/// One scheduler per queue, running as a long-lived task.
pub struct JobMaster {
    queue: Arc<JobQueue>,
    registry: Arc<ActionRegistry>,
    options: MasterOptions,
    admitting: AtomicBool,
    shutdown: Notify,
    active: AtomicUsize,
}

impl JobMaster {
    pub fn new(queue: Arc<JobQueue>, registry: Arc<ActionRegistry>, options: MasterOptions) -> Self {
        Self {
            queue,
            registry,
            options,
            admitting: AtomicBool::new(true),
            shutdown: Notify::new(),
            active: AtomicUsize::new(0),
        }
    }

    /// Jobs currently executing under this master.
    pub fn active_workers(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Run the scheduler loop until `prepare_close`/`close`.
    pub async fn run(self: Arc<Self>) {
        info!(queue = %self.queue.action_type(), workers = self.options.workers, "job master started");

        while self.admitting.load(Ordering::Acquire) {
            if self.active.load(Ordering::Acquire) >= self.options.workers {
                // Saturated: brief pause and recheck.
                sleep(self.options.saturation_pause).await;
                continue;
            }

            match self.queue.poll().await {
                Ok(Some(job)) => {
                    if self.dispatch(job) == Dispatch::Parked {
                        // Deactivated action: do not spin on claim/release.
                        self.idle_wait().await;
                    }
                }
                Ok(None) => self.idle_wait().await,
                Err(e) => {
                    // Isolated per attempt; the loop keeps going.
                    error!(queue = %self.queue.action_type(), error = %e, "poll failed");
                    sleep(Duration::from_secs(1)).await;
                }
            }
        }

        info!(queue = %self.queue.action_type(), "job master stopped");
    }

    /// Resolve the job's action and hand it to a worker, or put it back.
    fn dispatch(self: &Arc<Self>, job: Job) -> Dispatch {
        let action = match self.registry.get(&job.action_type) {
            Some(action) => action,
            None => {
                // Construction failure: terminal, nothing to roll back.
                error!(job = %job.id, action_type = %job.action_type, "no action registered");
                if let Err(e) = self
                    .queue
                    .store()
                    .mark_broken(job.id, &format!("no action registered for {}", job.action_type))
                {
                    error!(job = %job.id, error = %e, "failed to mark job broken");
                }
                return Dispatch::Submitted;
            }
        };

        if !action.is_activated() {
            // Not lost, not executed: back to NEW for whenever the action
            // comes back.
            debug!(job = %job.id, action = %action.name(), "action deactivated, releasing job");
            if let Err(e) = self.queue.store().release(job.id) {
                error!(job = %job.id, error = %e, "failed to release job");
            }
            return Dispatch::Parked;
        }

        let master = Arc::clone(self);
        let queue = Arc::clone(&self.queue);
        self.active.fetch_add(1, Ordering::AcqRel);
        tokio::spawn(async move {
            worker::run(&queue, action, job).await;
            master.active.fetch_sub(1, Ordering::AcqRel);
            // Wake the master (and anyone else blocked on this queue)
            // regardless of outcome.
            queue.wake();
        });
        Dispatch::Submitted
    }

    /// Block until the queue signals, the idle bound elapses, or shutdown.
    async fn idle_wait(&self) {
        tokio::select! {
            _ = self.queue.notified() => {}
            _ = self.shutdown.notified() => {}
            _ = sleep(self.options.idle_wait) => {}
        }
    }

    // -----------------------------------------------------------------------
    // Two-phase shutdown
    // -----------------------------------------------------------------------

    /// Phase one: stop admitting new jobs, wake any waiter, and wait up to
    /// the grace period for in-flight workers to finish.
    pub async fn prepare_close(&self) {
        self.admitting.store(false, Ordering::Release);
        self.shutdown.notify_waiters();
        self.queue.wake();

        let deadline = tokio::time::Instant::now() + self.options.shutdown_grace;
        while self.active.load(Ordering::Acquire) > 0 {
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    queue = %self.queue.action_type(),
                    in_flight = self.active.load(Ordering::Acquire),
                    "shutdown grace period elapsed with workers still running"
                );
                return;
            }
            sleep(Duration::from_millis(50)).await;
        }
    }

    /// Phase two: abandon whatever is still running. Abandoned jobs stay
    /// PROCESSING and the stalled-job sweep reclaims them later.
    pub fn close(&self) {
        self.admitting.store(false, Ordering::Release);
        self.shutdown.notify_waiters();

        let in_flight = self.active.load(Ordering::Acquire);
        if in_flight > 0 {
            warn!(
                queue = %self.queue.action_type(),
                in_flight,
                "closing with jobs still in flight; stalled-job sweep will reclaim them"
            );
        }
    }
}
