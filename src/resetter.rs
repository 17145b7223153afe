//! Stalled-job recovery.
//!
//! A single periodic task that scans for jobs stuck in PROCESSING with a
//! claim older than the grace period and rewrites them back to NEW. This
//! is the crash-recovery path: a worker process that died mid-execution
//! leaves its claim behind, and nothing else will ever release it.
//!
//! The sweep only rewrites persisted state. It cannot stop a worker that
//! is actually still running under the old claim, which is why terminal
//! writes are claim-guarded (`store::JobStore::mark_finished`) and actions
//! must tolerate re-execution.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use crate::queue::JobQueue;

/// Periodic sweep resetting orphaned PROCESSING jobs to NEW.
pub struct StalledJobResetter {
    queues: Vec<Arc<JobQueue>>,
    grace: Duration,
    shutdown: Notify,
}

impl StalledJobResetter {
    /// One resetter covers every registered queue; the sweep interval
    /// equals the grace period.
    pub fn new(queues: Vec<Arc<JobQueue>>, grace: Duration) -> Self {
        Self {
            queues,
            grace,
            shutdown: Notify::new(),
        }
    }

    /// Run sweeps at the grace interval until `stop`. The first sweep
    /// happens immediately, reclaiming claims orphaned by a crash before
    /// this process started.
    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.grace);
        loop {
            tokio::select! {
                _ = interval.tick() => self.sweep(),
                _ = self.shutdown.notified() => {
                    info!("stalled-job resetter stopped");
                    return;
                }
            }
        }
    }

    /// One sweep pass over all queues.
    ///
    /// Each queue's reset is a single statement, so a persistence failure
    /// aborts that queue's sweep whole with no partial resets. Waiters are
    /// only woken when something was actually reset.
    pub fn sweep(&self) {
        // A grace period too large to subtract means no claim can have
        // expired yet; there is nothing to reset.
        let cutoff = match chrono::TimeDelta::from_std(self.grace)
            .ok()
            .and_then(|grace| Utc::now().checked_sub_signed(grace))
        {
            Some(cutoff) => cutoff,
            None => {
                warn!(grace_secs = self.grace.as_secs(), "grace period out of range, skipping sweep");
                return;
            }
        };

        for queue in &self.queues {
            match queue.store().reset_stalled(queue.action_type(), cutoff) {
                Ok(0) => {}
                Ok(reset) => {
                    info!(queue = %queue.action_type(), reset, "reset stalled jobs");
                    queue.wake();
                }
                Err(e) => {
                    error!(queue = %queue.action_type(), error = %e, "stalled-job sweep failed");
                }
            }
        }
    }

    pub fn stop(&self) {
        self.shutdown.notify_waiters();
    }
}
