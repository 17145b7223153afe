//! Pluggable job actions and their registry.
//!
//! An action is the behavior behind an action type. The core never
//! interprets job parameters; it resolves the action by type, checks the
//! activation gate, and runs `execute`. Actions must tolerate re-execution:
//! a job re-queued by the stalled-job sweep after a crash will run again.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use crate::model::Job;

/// Failure signaled by an action's `execute`. Not a crate error — it maps
/// to the job's BROKEN outcome and triggers the rollback hook.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ExecutionError {
    pub message: String,
}

impl ExecutionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Contract for pluggable work.
///
/// `execute` runs at most once per claim, but at least once across the
/// job's lifetime if a crashed claim gets re-queued. `rollback` is invoked
/// only after `execute` returns an error, as best-effort compensation; its
/// own failure is logged and never masks the original error.
pub trait JobAction: Send + Sync {
    /// Human-readable name, used in logs.
    fn name(&self) -> &str;

    /// Gates dispatch: a deactivated action's jobs are released back to
    /// the queue unexecuted.
    fn is_activated(&self) -> bool {
        true
    }

    /// Do the work for one claimed job.
    fn execute(&self, job: &Job) -> Result<(), ExecutionError>;

    /// Compensate a failed `execute`. Default: nothing to undo.
    fn rollback(&self, _job: &Job) -> Result<(), ExecutionError> {
        Ok(())
    }
}

/// Registry of actions, indexed by action type.
///
/// Built once at startup and shared by reference; dispatch looks actions
/// up by the job's stored type identifier.
#[derive(Default)]
pub struct ActionRegistry {
    actions: HashMap<String, Arc<dyn JobAction>>,
}

impl ActionRegistry {
    /// Create an empty registry with no actions.
    pub fn new() -> Self {
        Self {
            actions: HashMap::new(),
        }
    }

    /// Register an action under an action type. Replaces any previous
    /// registration for the same type.
    pub fn register(&mut self, action_type: impl Into<String>, action: Arc<dyn JobAction>) {
        self.actions.insert(action_type.into(), action);
    }

    /// Look up an action by type.
    pub fn get(&self, action_type: &str) -> Option<Arc<dyn JobAction>> {
        self.actions.get(action_type).cloned()
    }

    /// Registered action types, for wiring queues and the stall sweep.
    pub fn action_types(&self) -> Vec<String> {
        self.actions.keys().cloned().collect()
    }
}
