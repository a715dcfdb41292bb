//! Workers: one background probe loop per monitored target.
//!
//! A [`Worker`] owns a target's configuration and probe strategy and runs
//! the loop that probes the target and feeds every outcome through the
//! incident coalescing in [`incident`]. The [`WorkerRegistry`] owns running
//! workers.

pub mod incident;
mod registry;

pub use incident::{record_outcome, Transition};
pub use registry::*;

use crate::db::{IncidentStore, TargetId};
use crate::probe::{Anomaly, Outcome, Probe, ProbeError, TargetConfig};

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::{AbortHandle, JoinHandle};

/// Upper bound of the random delay before each probe.
const MAX_JITTER_MS: u64 = 100;

/// Worker lifecycle errors.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("worker {0}: no async runtime to run on")]
    NoRuntime(TargetId),
    #[error("worker {id} loop panicked: {reason}")]
    Panicked { id: TargetId, reason: String },
}

/// Lifecycle state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Start/stop control the registry needs from a worker.
#[async_trait]
pub trait Lifecycle: Send + Sync {
    fn id(&self) -> TargetId;

    /// Start the background loop. Starting a running worker is a no-op.
    async fn start(&self) -> Result<(), WorkerError>;

    /// Stop the background loop, waiting up to `timeout` (forever when
    /// `None`) before aborting it. Stopping a stopped worker is a no-op.
    async fn stop(&self, timeout: Option<Duration>) -> Result<(), WorkerError>;
}

struct RunningTask {
    handle: JoinHandle<()>,
    cancel: watch::Sender<bool>,
}

/// Periodically probes one target.
pub struct Worker {
    config: Arc<TargetConfig>,
    probe: Arc<dyn Probe>,
    incidents: Arc<dyn IncidentStore>,
    // Serializes start/stop of this worker.
    task: Mutex<Option<RunningTask>>,
    state: Arc<watch::Sender<WorkerState>>,
}

impl Worker {
    pub fn new(
        config: TargetConfig,
        probe: Arc<dyn Probe>,
        incidents: Arc<dyn IncidentStore>,
    ) -> Self {
        let (state, _) = watch::channel(WorkerState::Stopped);
        Self {
            config: Arc::new(config),
            probe,
            incidents,
            task: Mutex::new(None),
            state: Arc::new(state),
        }
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    pub async fn is_running(&self) -> bool {
        let task = self.task.lock().await;
        task.as_ref().is_some_and(|t| !t.handle.is_finished())
    }
}

#[async_trait]
impl Lifecycle for Worker {
    fn id(&self) -> TargetId {
        self.config.id
    }

    async fn start(&self) -> Result<(), WorkerError> {
        let mut task = self.task.lock().await;

        if task.as_ref().is_some_and(|t| !t.handle.is_finished()) {
            tracing::warn!("Worker {} is already running", self.config.id);
            return Ok(());
        }

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| WorkerError::NoRuntime(self.config.id))?;

        self.state.send_replace(WorkerState::Starting);

        let (cancel, cancel_rx) = watch::channel(false);
        let handle = runtime.spawn(run_loop(
            self.config.clone(),
            self.probe.clone(),
            self.incidents.clone(),
            cancel_rx,
        ));
        *task = Some(RunningTask { handle, cancel });

        self.state.send_replace(WorkerState::Running);
        tracing::debug!("Worker {} started", self.config.id);
        Ok(())
    }

    async fn stop(&self, timeout: Option<Duration>) -> Result<(), WorkerError> {
        let mut task = self.task.lock().await;

        let Some(RunningTask { mut handle, cancel }) = task.take() else {
            tracing::warn!("Worker {} is not running", self.config.id);
            return Ok(());
        };

        tracing::debug!("Stopping worker {}", self.config.id);
        self.state.send_replace(WorkerState::Stopping);
        let _ = cancel.send(true);

        // Declared after the task lock so it drops first.
        let _guard = StopGuard {
            abort: handle.abort_handle(),
            state: self.state.clone(),
        };

        let joined = match timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    tracing::warn!(
                        "Worker {} did not stop within {:?}, aborting",
                        self.config.id,
                        limit
                    );
                    handle.abort();
                    (&mut handle).await
                }
            },
            None => (&mut handle).await,
        };

        self.state.send_replace(WorkerState::Stopped);
        tracing::debug!("Worker {} stopped", self.config.id);

        match joined {
            Ok(()) => Ok(()),
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => Err(WorkerError::Panicked {
                id: self.config.id,
                reason: e.to_string(),
            }),
        }
    }
}

/// Finishes a stop even when its future is dropped part way: the loop is
/// aborted and the worker reported Stopped.
struct StopGuard {
    abort: AbortHandle,
    state: Arc<watch::Sender<WorkerState>>,
}

impl Drop for StopGuard {
    fn drop(&mut self) {
        self.abort.abort();
        self.state.send_replace(WorkerState::Stopped);
    }
}

/// The probe loop of one worker. Exits only on cancellation.
async fn run_loop(
    config: Arc<TargetConfig>,
    probe: Arc<dyn Probe>,
    incidents: Arc<dyn IncidentStore>,
    mut cancel: watch::Receiver<bool>,
) {
    if !config.initial_delay.is_zero() {
        tokio::select! {
            _ = cancelled(&mut cancel) => return,
            _ = tokio::time::sleep(config.initial_delay) => {}
        }
    }

    loop {
        if *cancel.borrow() {
            break;
        }

        run_cycle(&config, probe.as_ref(), &incidents).await;

        tokio::select! {
            _ = cancelled(&mut cancel) => break,
            _ = tokio::time::sleep(config.interval) => {}
        }
    }

    tracing::debug!("Worker {} loop exited", config.id);
}

/// Resolves once cancellation is requested or the worker handle is gone.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    let _ = cancel.wait_for(|stop| *stop).await;
}

/// One probe cycle: probe within `check_timeout`, then record the outcome.
/// Never fails; every problem is logged or turned into an anomaly.
async fn run_cycle(
    config: &TargetConfig,
    probe: &dyn Probe,
    incidents: &Arc<dyn IncidentStore>,
) {
    let outcome = match tokio::time::timeout(config.check_timeout, probe_once(probe)).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => {
            tracing::error!("Probe failed for target {}: {}", config.id, e);
            Anomaly::service_unavailable().into()
        }
        Err(_) => {
            tracing::warn!(
                "Probe for target {} exceeded {:?}",
                config.id,
                config.check_timeout
            );
            Anomaly::service_timeout().into()
        }
    };

    let store = incidents.clone();
    let target_id = config.id;
    let recorded = tokio::task::spawn_blocking(move || {
        record_outcome(store.as_ref(), target_id, &outcome, Utc::now())
    })
    .await;

    match recorded {
        Ok(Ok(transition)) => log_transition(config, &transition),
        Ok(Err(e)) => {
            tracing::error!("Failed to record outcome for target {}: {}", config.id, e)
        }
        Err(e) => {
            tracing::error!("Recording outcome for target {} panicked: {}", config.id, e)
        }
    }
}

/// Jitter, then run the probe with panics turned into errors.
async fn probe_once(probe: &dyn Probe) -> Result<Outcome, ProbeError> {
    let jitter = rand::random::<u64>() % MAX_JITTER_MS;
    tokio::time::sleep(Duration::from_millis(jitter)).await;

    match AssertUnwindSafe(probe.check()).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(ProbeError::Unexpected(reason))
        }
    }
}

fn log_transition(config: &TargetConfig, transition: &Transition) {
    match transition {
        Transition::Unchanged => {
            tracing::trace!("Target {} healthy", config.id);
        }
        Transition::Opened(incident) => tracing::info!(
            "Incident {} opened for {} ({}): {}",
            incident.id,
            config.name,
            incident.category,
            incident.message
        ),
        Transition::Refreshed(incident) => {
            tracing::debug!("Incident {} for {} still ongoing", incident.id, config.name)
        }
        Transition::Replaced { resolved, opened } => tracing::info!(
            "Incident {} for {} superseded by {} ({}): {}",
            resolved.id,
            config.name,
            opened.id,
            opened.category,
            opened.message
        ),
        Transition::Resolved(incident) => {
            tracing::info!("Incident {} for {} resolved", incident.id, config.name)
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::MonitorDefaults;
    use crate::db::{IncidentCategory, Store, TargetDef};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    /// Plays back scripted outcomes, repeating the last one.
    pub(crate) struct ScriptedProbe {
        script: StdMutex<VecDeque<Outcome>>,
        pub calls: AtomicUsize,
        delay: Duration,
    }

    impl ScriptedProbe {
        pub(crate) fn new(outcomes: Vec<Outcome>) -> Self {
            Self {
                script: StdMutex::new(outcomes.into()),
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
            }
        }

        pub(crate) fn hanging(delay: Duration) -> Self {
            Self {
                delay,
                ..Self::new(vec![Outcome::Healthy])
            }
        }
    }

    #[async_trait]
    impl Probe for ScriptedProbe {
        async fn check(&self) -> Result<Outcome, ProbeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let mut script = self.script.lock().unwrap();
            let outcome = if script.len() > 1 {
                script.pop_front().unwrap()
            } else {
                script.front().cloned().unwrap_or(Outcome::Healthy)
            };
            Ok(outcome)
        }
    }

    struct PanickingProbe;

    #[async_trait]
    impl Probe for PanickingProbe {
        async fn check(&self) -> Result<Outcome, ProbeError> {
            panic!("probe blew up");
        }
    }

    pub(crate) fn fast_config(id: TargetId) -> TargetConfig {
        let def = TargetDef {
            id,
            name: format!("target-{}", id),
            endpoint: "http://127.0.0.1/".to_string(),
            interval_secs: 0.02,
            check_timeout_secs: 1.0,
            ..Default::default()
        };
        TargetConfig::from_def(&def, &MonitorDefaults::default())
    }

    /// An in-memory store holding one target, for incidents to reference.
    pub(crate) fn store_with_target() -> (Arc<Store>, TargetId) {
        let store = Store::open_in_memory().unwrap();
        let mut def = TargetDef {
            name: "api".to_string(),
            endpoint: "http://127.0.0.1/".to_string(),
            ..Default::default()
        };
        let id = store.add_target(&mut def).unwrap();
        (Arc::new(store), id)
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not met in time");
    }

    #[tokio::test]
    async fn test_start_and_stop_transitions() {
        let (store, id) = store_with_target();
        let worker = Worker::new(
            fast_config(id),
            Arc::new(ScriptedProbe::new(vec![Outcome::Healthy])),
            store,
        );
        assert_eq!(worker.state(), WorkerState::Stopped);

        worker.start().await.unwrap();
        assert_eq!(worker.state(), WorkerState::Running);
        assert!(worker.is_running().await);

        worker.stop(Some(Duration::from_secs(1))).await.unwrap();
        assert_eq!(worker.state(), WorkerState::Stopped);
        assert!(!worker.is_running().await);
    }

    #[tokio::test]
    async fn test_start_and_stop_are_idempotent() {
        let (store, id) = store_with_target();
        let probe = Arc::new(ScriptedProbe::new(vec![Outcome::Healthy]));
        let worker = Worker::new(fast_config(id), probe, store);

        tokio_test::assert_ok!(worker.stop(None).await);
        assert_eq!(worker.state(), WorkerState::Stopped);

        worker.start().await.unwrap();
        worker.start().await.unwrap();
        assert_eq!(worker.state(), WorkerState::Running);

        worker.stop(None).await.unwrap();
        tokio_test::assert_ok!(worker.stop(None).await);
        assert_eq!(worker.state(), WorkerState::Stopped);
    }

    #[tokio::test]
    async fn test_loop_records_incidents() {
        let (store, id) = store_with_target();
        let probe = Arc::new(ScriptedProbe::new(vec![
            Anomaly::major_outage("Connection error").into(),
            Anomaly::major_outage("Connection error").into(),
            Outcome::Healthy,
        ]));
        let worker = Worker::new(fast_config(id), probe.clone(), store.clone());

        worker.start().await.unwrap();
        wait_until(|| probe.calls.load(Ordering::SeqCst) >= 4).await;
        worker.stop(Some(Duration::from_secs(1))).await.unwrap();

        let incidents = store.list_incidents(Some(id), None).unwrap();
        assert_eq!(incidents.len(), 1);
        assert_eq!(incidents[0].category, IncidentCategory::MajorOutage);
        assert!(!incidents[0].is_open());
    }

    #[tokio::test]
    async fn test_panicking_probe_does_not_kill_loop() {
        let (store, id) = store_with_target();
        let worker = Worker::new(fast_config(id), Arc::new(PanickingProbe), store.clone());

        worker.start().await.unwrap();
        let check = store.clone();
        wait_until(move || !check.list_incidents(Some(id), None).unwrap().is_empty()).await;
        assert!(worker.is_running().await);
        worker.stop(Some(Duration::from_secs(1))).await.unwrap();

        let incidents = store.list_incidents(Some(id), None).unwrap();
        assert_eq!(incidents[0].message, "Service unavailable");
        assert_eq!(incidents[0].category, IncidentCategory::MajorOutage);
    }

    #[tokio::test]
    async fn test_cycle_timeout_is_recorded_as_failure() {
        let (store, id) = store_with_target();
        let mut config = fast_config(id);
        config.check_timeout = Duration::from_millis(150);
        let worker = Worker::new(
            config,
            Arc::new(ScriptedProbe::hanging(Duration::from_secs(30))),
            store.clone(),
        );

        worker.start().await.unwrap();
        let check = store.clone();
        wait_until(move || !check.list_incidents(Some(id), None).unwrap().is_empty()).await;
        worker.stop(Some(Duration::from_millis(100))).await.unwrap();

        let incidents = store.list_incidents(Some(id), None).unwrap();
        assert_eq!(incidents[0].message, "Service timeout");
    }

    #[tokio::test]
    async fn test_stop_aborts_loop_stuck_in_cycle() {
        let (store, id) = store_with_target();
        let mut config = fast_config(id);
        config.check_timeout = Duration::from_secs(60);
        let probe = Arc::new(ScriptedProbe::hanging(Duration::from_secs(60)));
        let worker = Worker::new(config, probe.clone(), store);

        worker.start().await.unwrap();
        wait_until(|| probe.calls.load(Ordering::SeqCst) >= 1).await;

        let started = std::time::Instant::now();
        worker.stop(Some(Duration::from_millis(100))).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(worker.state(), WorkerState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_interrupts_interval_sleep() {
        let (store, id) = store_with_target();
        let mut config = fast_config(id);
        config.interval = Duration::from_secs(3600);
        let probe = Arc::new(ScriptedProbe::new(vec![Outcome::Healthy]));
        let worker = Worker::new(config, probe.clone(), store);

        worker.start().await.unwrap();
        wait_until(|| probe.calls.load(Ordering::SeqCst) >= 1).await;

        // No timeout: the loop must notice cancellation while sleeping.
        let started = std::time::Instant::now();
        worker.stop(None).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_stop_during_initial_delay_skips_probe() {
        let (store, id) = store_with_target();
        let mut config = fast_config(id);
        config.initial_delay = Duration::from_secs(3600);
        let probe = Arc::new(ScriptedProbe::new(vec![Outcome::Healthy]));
        let worker = Worker::new(config, probe.clone(), store);

        worker.start().await.unwrap();
        worker.stop(None).await.unwrap();
        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let (store, id) = store_with_target();
        let probe = Arc::new(ScriptedProbe::new(vec![Outcome::Healthy]));
        let worker = Worker::new(fast_config(id), probe, store);

        worker.start().await.unwrap();
        worker.stop(None).await.unwrap();
        worker.start().await.unwrap();
        assert_eq!(worker.state(), WorkerState::Running);
        worker.stop(None).await.unwrap();
    }

    #[test]
    fn test_start_without_runtime_fails() {
        let (store, id) = store_with_target();
        let worker = Worker::new(
            fast_config(id),
            Arc::new(ScriptedProbe::new(vec![Outcome::Healthy])),
            store,
        );

        let result = futures::executor::block_on(worker.start());
        assert!(matches!(result, Err(WorkerError::NoRuntime(got)) if got == id));
        assert_eq!(worker.state(), WorkerState::Stopped);
    }

    #[tokio::test]
    async fn test_concurrent_start_and_stop_are_serialized() {
        let (store, id) = store_with_target();
        let mut config = fast_config(id);
        config.interval = Duration::from_secs(3600);
        let probe = Arc::new(ScriptedProbe::new(vec![Outcome::Healthy]));
        let worker = Arc::new(Worker::new(config, probe.clone(), store));

        // Racing starts spawn a single loop, which probes once then sleeps.
        let (a, b, c) = tokio::join!(worker.start(), worker.start(), worker.start());
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        wait_until(|| probe.calls.load(Ordering::SeqCst) >= 1).await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
        assert_eq!(worker.state(), WorkerState::Running);

        let (a, b) = tokio::join!(worker.stop(None), worker.stop(None));
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(worker.state(), WorkerState::Stopped);
        assert!(!worker.is_running().await);

        let ops: Vec<_> = (0..20)
            .map(|i| {
                let worker = worker.clone();
                tokio::spawn(async move {
                    if i % 2 == 0 {
                        worker.start().await
                    } else {
                        worker.stop(Some(Duration::from_secs(1))).await
                    }
                })
            })
            .collect();
        for op in ops {
            op.await.unwrap().unwrap();
        }
        let running = worker.is_running().await;
        assert_eq!(worker.state() == WorkerState::Running, running);

        worker.start().await.unwrap();
        assert_eq!(worker.state(), WorkerState::Running);
        worker.stop(None).await.unwrap();
        assert_eq!(worker.state(), WorkerState::Stopped);
        assert!(!worker.is_running().await);
    }
}
