//! # conveyor
//!
//! Embedded, crash-resilient job queue with a worker-pool scheduler.
//!
//! Application code offers units of deferred work ("jobs") keyed by an
//! action type and a string parameter map. The crate guarantees each job
//! is executed by at most one worker at a time, survives process restarts,
//! and self-heals when a worker dies mid-execution: claims are conditional
//! updates on the persisted row, and a periodic sweep re-queues jobs whose
//! claim outlived the grace period.
//!
//! ```no_run
//! use std::sync::Arc;
//! use conveyor::{
//!     ActionRegistry, Config, ExecutionError, Job, JobAction, JobRuntime, JobStore, NewJob,
//! };
//!
//! struct Reindex;
//!
//! impl JobAction for Reindex {
//!     fn name(&self) -> &str {
//!         "reindex"
//!     }
//!
//!     fn execute(&self, job: &Job) -> Result<(), ExecutionError> {
//!         let id = job.parameters.get("id").ok_or_else(|| ExecutionError::new("missing id"))?;
//!         println!("reindexing {id}");
//!         Ok(())
//!     }
//! }
//!
//! # async fn demo() -> conveyor::Result<()> {
//! let store = Arc::new(JobStore::open("jobs.db")?);
//! let mut registry = ActionRegistry::new();
//! registry.register("reindex", Arc::new(Reindex));
//!
//! let mut runtime = JobRuntime::new(store, registry, Config::from_env()?);
//! let queue = runtime.register_queue("reindex")?;
//! runtime.start();
//!
//! queue.offer(NewJob::new("reindex").parameter("id", "42")).await?;
//! # runtime.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod action;
pub mod config;
pub mod error;
pub mod master;
pub mod model;
pub mod queue;
pub mod resetter;
pub mod runtime;
pub mod store;
mod worker;

pub use action::{ActionRegistry, ExecutionError, JobAction};
pub use config::Config;
pub use error::{Error, Result};
pub use master::{JobMaster, MasterOptions};
pub use model::{Job, JobId, NewJob, Status};
pub use queue::{JobQueue, QueueOptions};
pub use resetter::StalledJobResetter;
pub use runtime::JobRuntime;
pub use store::{JobStore, Offered};
