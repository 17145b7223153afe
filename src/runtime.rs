//! Process-level wiring: one runtime owns every queue and scheduler.
//!
//! The runtime is an explicit registry mapping action types to their
//! queue/master pair, built once at startup and passed by reference — no
//! global mutable state. It also owns lifecycle ordering: schedulers shut
//! down before their queues, queues before the store is dropped.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::action::ActionRegistry;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::master::{JobMaster, MasterOptions};
use crate::queue::{JobQueue, QueueOptions};
use crate::resetter::StalledJobResetter;
use crate::store::JobStore;

/// Owner of all queues, masters, and the stalled-job resetter.
pub struct JobRuntime {
    store: Arc<JobStore>,
    registry: Arc<ActionRegistry>,
    config: Config,
    queues: HashMap<String, Arc<JobQueue>>,
    masters: HashMap<String, Arc<JobMaster>>,
    resetter: Option<Arc<StalledJobResetter>>,
    tasks: Vec<JoinHandle<()>>,
}

impl JobRuntime {
    pub fn new(store: Arc<JobStore>, registry: ActionRegistry, config: Config) -> Self {
        Self {
            store,
            registry: Arc::new(registry),
            config,
            queues: HashMap::new(),
            masters: HashMap::new(),
            resetter: None,
            tasks: Vec::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    /// Register a queue and scheduler for one action type with the
    /// config-derived defaults.
    pub fn register_queue(&mut self, action_type: &str) -> Result<Arc<JobQueue>> {
        let queue_options = QueueOptions {
            prefetch: self.config.prefetch,
            enabled: true,
        };
        let master_options = MasterOptions {
            workers: self.config.workers,
            idle_wait: self.config.idle_wait,
            shutdown_grace: self.config.shutdown_grace,
            ..MasterOptions::default()
        };
        self.register_queue_with(action_type, queue_options, master_options)
    }

    /// Register a queue and scheduler with explicit per-queue tuning.
    pub fn register_queue_with(
        &mut self,
        action_type: &str,
        queue_options: QueueOptions,
        master_options: MasterOptions,
    ) -> Result<Arc<JobQueue>> {
        if self.registry.get(action_type).is_none() {
            return Err(Error::UnknownActionType(action_type.to_string()));
        }

        let queue = Arc::new(JobQueue::new(
            action_type,
            Arc::clone(&self.store),
            queue_options,
        ));
        let master = Arc::new(JobMaster::new(
            Arc::clone(&queue),
            Arc::clone(&self.registry),
            master_options,
        ));

        self.queues.insert(action_type.to_string(), Arc::clone(&queue));
        self.masters.insert(action_type.to_string(), master);
        Ok(queue)
    }

    /// Register a queue for every action type in the registry.
    pub fn register_all(&mut self) -> Result<()> {
        for action_type in self.registry.action_types() {
            self.register_queue(&action_type)?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn queue(&self, action_type: &str) -> Option<Arc<JobQueue>> {
        self.queues.get(action_type).cloned()
    }

    /// Registered queue names, for the admin surface.
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queues.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Spawn every registered scheduler plus the stalled-job resetter.
    ///
    /// No-op (beyond a log line) when jobs are globally disabled.
    pub fn start(&mut self) {
        if !self.config.enabled {
            warn!("job processing is globally disabled; not starting schedulers");
            return;
        }
        if !self.tasks.is_empty() {
            return;
        }

        for master in self.masters.values() {
            self.tasks.push(tokio::spawn(Arc::clone(master).run()));
        }

        let resetter = Arc::new(StalledJobResetter::new(
            self.queues.values().cloned().collect(),
            self.config.stall_grace,
        ));
        self.tasks.push(tokio::spawn(Arc::clone(&resetter).run()));
        self.resetter = Some(resetter);

        info!(queues = self.queues.len(), "job runtime started");
    }

    /// Two-phase shutdown in dependency order: drain and stop the
    /// schedulers first, then disable the queues, then the resetter. The
    /// store outlives all of it and simply drops with the runtime.
    pub async fn shutdown(&mut self) {
        // Phase one, all masters in parallel: stop admitting, drain.
        let mut draining = Vec::new();
        for master in self.masters.values() {
            let master = Arc::clone(master);
            draining.push(tokio::spawn(async move { master.prepare_close().await }));
        }
        for handle in draining {
            let _ = handle.await;
        }

        // Phase two: abandon stragglers.
        for master in self.masters.values() {
            master.close();
        }

        for queue in self.queues.values() {
            queue.set_enabled(false);
        }

        if let Some(resetter) = &self.resetter {
            resetter.stop();
        }

        for task in self.tasks.drain(..) {
            let _ = task.await;
        }

        info!("job runtime stopped");
    }
}
