//! Registry of running workers.

use super::{Lifecycle, WorkerError};
use crate::db::TargetId;

use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Stand-in deadline when the requested one does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Outcome of [`WorkerRegistry::shutdown`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub stopped: usize,
    pub failed: Vec<TargetId>,
    /// Workers still stopping when the deadline passed.
    pub abandoned: Vec<TargetId>,
}

/// The single authoritative map from target id to running worker.
///
/// Every map mutation goes through one mutex. `add` holds it while the worker
/// starts, so a registered worker is always one whose start succeeded.
pub struct WorkerRegistry {
    workers: Mutex<HashMap<TargetId, Arc<dyn Lifecycle>>>,
    stop_timeout: Option<Duration>,
}

impl WorkerRegistry {
    /// `stop_timeout` bounds each individual stop before the worker is aborted.
    pub fn new(stop_timeout: Option<Duration>) -> Self {
        Self {
            workers: Mutex::new(HashMap::new()),
            stop_timeout,
        }
    }

    /// Start and register `worker`.
    ///
    /// Returns `Ok(false)` without starting anything when the id is already
    /// registered. On start failure the worker is stopped again and the error
    /// returned; it is never registered.
    pub async fn add(&self, worker: Arc<dyn Lifecycle>) -> Result<bool, WorkerError> {
        let id = worker.id();
        let mut workers = self.workers.lock().await;

        if workers.contains_key(&id) {
            tracing::warn!("Worker {} already registered, skipping", id);
            return Ok(false);
        }

        if let Err(e) = worker.start().await {
            tracing::error!("Failed to start worker {}: {}", id, e);
            if let Err(cleanup) = worker.stop(self.stop_timeout).await {
                tracing::error!("Failed to stop worker {} during cleanup: {}", id, cleanup);
            }
            return Err(e);
        }

        workers.insert(id, worker);
        drop(workers);

        tracing::debug!("Worker {} added to registry", id);
        Ok(true)
    }

    /// Deregister and stop the worker for `id`.
    ///
    /// Returns `Ok(false)` if nothing was registered under `id`.
    pub async fn remove(&self, id: TargetId) -> Result<bool, WorkerError> {
        let worker = self.workers.lock().await.remove(&id);

        let Some(worker) = worker else {
            tracing::debug!("Worker {} not registered, nothing to remove", id);
            return Ok(false);
        };

        if let Err(e) = worker.stop(self.stop_timeout).await {
            tracing::error!("Failed to stop worker {}: {}", id, e);
            return Err(e);
        }

        tracing::debug!("Worker {} removed from registry", id);
        Ok(true)
    }

    /// Drain the registry and stop every worker in parallel, all within one
    /// `deadline`.
    ///
    /// Never fails: per-worker errors are logged and reported, and workers
    /// still stopping at the deadline are abandoned.
    pub async fn shutdown(&self, deadline: Duration) -> ShutdownReport {
        let drained: Vec<Arc<dyn Lifecycle>> = {
            let mut workers = self.workers.lock().await;
            workers.drain().map(|(_, worker)| worker).collect()
        };

        tracing::info!("Shutting down {} workers", drained.len());

        let mut report = ShutdownReport::default();
        let mut outstanding: BTreeSet<TargetId> = drained.iter().map(|w| w.id()).collect();
        let stop_timeout = self.stop_timeout;

        let mut stops: FuturesUnordered<_> = drained
            .into_iter()
            .map(|worker| async move {
                let result = worker.stop(stop_timeout).await;
                (worker.id(), result)
            })
            .collect();

        let now = tokio::time::Instant::now();
        let expires = now
            .checked_add(deadline)
            .unwrap_or_else(|| now + FAR_FUTURE);
        loop {
            match tokio::time::timeout_at(expires, stops.next()).await {
                Ok(Some((id, result))) => {
                    outstanding.remove(&id);
                    match result {
                        Ok(()) => report.stopped += 1,
                        Err(e) => {
                            tracing::error!("Failed to stop worker {}: {}", id, e);
                            report.failed.push(id);
                        }
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    tracing::error!(
                        "Shutdown deadline of {:?} exceeded, abandoning workers {:?}",
                        deadline,
                        outstanding
                    );
                    report.abandoned = outstanding.into_iter().collect();
                    break;
                }
            }
        }

        tracing::info!(
            "Shutdown finished: {} stopped, {} failed, {} abandoned",
            report.stopped,
            report.failed.len(),
            report.abandoned.len()
        );
        report
    }

    pub async fn contains(&self, id: TargetId) -> bool {
        self.workers.lock().await.contains_key(&id)
    }

    pub async fn len(&self) -> usize {
        self.workers.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.workers.lock().await.is_empty()
    }

    /// Registered ids, sorted.
    pub async fn ids(&self) -> Vec<TargetId> {
        let mut ids: Vec<_> = self.workers.lock().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}
