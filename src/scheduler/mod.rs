//! Scheduler module: reconciles persisted targets with running workers.

use crate::config::MonitorDefaults;
use crate::db::{DbError, IncidentStore, TargetDef, TargetSource};
use crate::probe::{ConfigError, ProbeRegistry, TargetConfig};
use crate::worker::{ShutdownReport, Worker, WorkerError, WorkerRegistry};

use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Scheduler error types.
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),
    #[error("Database error: {0}")]
    Store(#[from] DbError),
}

/// Summary of [`Scheduler::initialize`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InitReport {
    pub total: usize,
    pub started: usize,
    pub failed: usize,
}

/// Builds workers from target definitions and hands them to the registry.
pub struct Scheduler {
    registry: Arc<WorkerRegistry>,
    targets: Arc<dyn TargetSource>,
    incidents: Arc<dyn IncidentStore>,
    probes: ProbeRegistry,
    defaults: MonitorDefaults,
    shutdown_timeout: Duration,
}

impl Scheduler {
    pub fn new(
        registry: Arc<WorkerRegistry>,
        targets: Arc<dyn TargetSource>,
        incidents: Arc<dyn IncidentStore>,
    ) -> Self {
        Self {
            registry,
            targets,
            incidents,
            probes: ProbeRegistry::default(),
            defaults: MonitorDefaults::default(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }

    /// Replace the probe strategies (defaults to the built-in ones).
    pub fn with_probes(mut self, probes: ProbeRegistry) -> Self {
        self.probes = probes;
        self
    }

    pub fn with_defaults(mut self, defaults: MonitorDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    /// Start a worker for every active target.
    ///
    /// A target that cannot be built or started is logged and counted; it
    /// never prevents the others from starting. Only a failure to load the
    /// definitions is returned.
    pub async fn initialize(&self) -> Result<InitReport, SchedulerError> {
        let defs = self.targets.load_targets()?;
        let mut report = InitReport {
            total: defs.len(),
            ..Default::default()
        };

        tracing::info!("Initializing scheduler with {} targets", report.total);

        let mut workers = Vec::with_capacity(defs.len());
        for def in &defs {
            match self.build_worker(def) {
                Ok(worker) => workers.push(worker),
                Err(e) => {
                    tracing::error!(
                        "Failed to create worker for target {} ({}): {}",
                        def.id,
                        def.name,
                        e
                    );
                    report.failed += 1;
                }
            }
        }

        let results = join_all(workers.into_iter().map(|worker| self.registry.add(worker))).await;
        for result in results {
            match result {
                Ok(_) => report.started += 1,
                // Already logged by the registry.
                Err(_) => report.failed += 1,
            }
        }

        tracing::info!(
            "Scheduler initialized: {} of {} targets started, {} failed",
            report.started,
            report.total,
            report.failed
        );
        Ok(report)
    }

    /// Build and register a worker for `def`.
    pub async fn start(&self, def: &TargetDef) -> Result<(), SchedulerError> {
        let worker = self.build_worker(def)?;
        if self.registry.add(worker).await? {
            tracing::info!("Scheduler: started target {} ({})", def.id, def.name);
        }
        Ok(())
    }

    /// Deregister and stop the worker for `def`.
    pub async fn stop(&self, def: &TargetDef) -> Result<(), SchedulerError> {
        if self.registry.remove(def.id).await? {
            tracing::info!("Scheduler: stopped target {} ({})", def.id, def.name);
        }
        Ok(())
    }

    /// Stop the current worker for `def`, if any, then start a fresh one.
    pub async fn restart(&self, def: &TargetDef) -> Result<(), SchedulerError> {
        if let Err(e) = self.stop(def).await {
            tracing::error!("Failed to stop target {} for restart: {}", def.id, e);
        }
        self.start(def).await
    }

    /// Stop every worker within the configured shutdown deadline.
    pub async fn shutdown(&self) -> ShutdownReport {
        self.registry.shutdown(self.shutdown_timeout).await
    }

    fn build_worker(&self, def: &TargetDef) -> Result<Arc<Worker>, ConfigError> {
        let config = TargetConfig::from_def(def, &self.defaults);
        let probe = self.probes.build(&config)?;
        Ok(Arc::new(Worker::new(config, probe, self.incidents.clone())))
    }
}
