//! Single-job execution and outcome persistence.
//!
//! A worker gets one already-claimed job (status PROCESSING), runs its
//! action to completion on a blocking thread, and persists the terminal
//! outcome under its own transaction:
//!
//! - `execute` succeeds → FINISHED with `finished = now`.
//! - `execute` signals failure → `rollback` (best-effort) → BROKEN.
//! - `execute` panics → BROKEN, rollback not invoked.
//!
//! Terminal writes are conditional on the claim still being held; if the
//! stalled-job sweep revoked it mid-run, the late write affects zero rows
//! and is logged, not treated as an error.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use tracing::{error, info, warn};

use crate::action::{ExecutionError, JobAction};
use crate::model::Job;
use crate::queue::JobQueue;

/// Execute one claimed job and persist the outcome.
pub(crate) async fn run(queue: &JobQueue, action: Arc<dyn JobAction>, job: Job) {
    let start = Instant::now();
    let id = job.id;
    let action_name = action.name().to_string();

    let executed = tokio::task::spawn_blocking(move || {
        let result = action.execute(&job);
        let rollback = match result {
            Ok(()) => None,
            Err(_) => Some(try_rollback(&*action, &job)),
        };
        (result, rollback)
    })
    .await;

    let duration_ms = start.elapsed().as_millis() as u64;
    let store = queue.store();

    let persisted = match executed {
        Ok((Ok(()), _)) => {
            info!(job = %id, action = %action_name, duration_ms, "job finished");
            store.mark_finished(id)
        }
        Ok((Err(e), rollback)) => {
            error!(job = %id, action = %action_name, duration_ms, error = %e, "job execution failed");
            if let Some(Err(rollback_err)) = rollback {
                // Logged only — the original execution error stands.
                error!(job = %id, action = %action_name, error = %rollback_err, "rollback failed");
            }
            store.mark_broken(id, &e.message)
        }
        Err(join_err) => {
            // Panic or cancellation inside the blocking task. Nothing ran
            // to completion, so there is nothing to compensate.
            error!(job = %id, action = %action_name, duration_ms, error = %join_err, "job died unexpectedly");
            store.mark_broken(id, &format!("action died: {join_err}"))
        }
    };

    match persisted {
        Ok(true) => {}
        Ok(false) => {
            warn!(job = %id, "claim was revoked before the outcome landed; dropping late write");
        }
        Err(e) => {
            // Job stays PROCESSING; the stalled-job sweep will reclaim it.
            error!(job = %id, error = %e, "failed to persist job outcome");
        }
    }
}

/// Invoke the rollback hook, containing panics so they cannot mask the
/// original execution error.
fn try_rollback(action: &dyn JobAction, job: &Job) -> Result<(), ExecutionError> {
    match std::panic::catch_unwind(AssertUnwindSafe(|| action.rollback(job))) {
        Ok(result) => result,
        Err(_) => Err(ExecutionError::new("rollback panicked")),
    }
}
