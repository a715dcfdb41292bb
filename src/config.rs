//! Configuration module for statuswatch.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Defaults applied when a persisted target leaves a field unset.
#[derive(Debug, Clone)]
pub struct MonitorDefaults {
    /// Time between probe cycles (default: 60s)
    pub interval: Duration,
    /// Upper bound of a single probe cycle (default: 30s)
    pub check_timeout: Duration,
    /// Latency above which a healthy response counts as degraded (default: 1000ms)
    pub latency_threshold_ms: u64,
}

impl Default for MonitorDefaults {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            check_timeout: Duration::from_secs(30),
            latency_threshold_ms: 1000,
        }
    }
}

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Path to the SQLite database file (default: "statuswatch.db")
    pub db_path: String,
    /// Overall deadline for stopping every worker at exit (default: 30s)
    pub shutdown_timeout: Duration,
    /// How long a single worker may take to stop before it is aborted (default: 10s)
    pub stop_timeout: Duration,
    pub monitor: MonitorDefaults,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            db_path: "statuswatch.db".to_string(),
            shutdown_timeout: Duration::from_secs(30),
            stop_timeout: Duration::from_secs(10),
            monitor: MonitorDefaults::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `STATUSWATCH_DB_PATH`: Database file path (default: "statuswatch.db")
    /// - `STATUSWATCH_SHUTDOWN_TIMEOUT`: Shutdown deadline in seconds (default: 30)
    /// - `STATUSWATCH_STOP_TIMEOUT`: Per-worker stop timeout in seconds (default: 10)
    /// - `STATUSWATCH_DEFAULT_INTERVAL`: Probe interval in seconds (default: 60)
    /// - `STATUSWATCH_DEFAULT_CHECK_TIMEOUT`: Probe timeout in seconds (default: 30)
    /// - `STATUSWATCH_DEFAULT_LATENCY_THRESHOLD_MS`: Latency threshold (default: 1000)
    pub fn load() -> Self {
        Self::load_from(|key| env::var(key).ok())
    }

    /// Load configuration using `lookup` to resolve variables.
    pub fn load_from<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        if let Some(db_path) = lookup("STATUSWATCH_DB_PATH") {
            cfg.db_path = db_path;
        }

        if let Some(secs) = parse_secs(&lookup, "STATUSWATCH_SHUTDOWN_TIMEOUT") {
            cfg.shutdown_timeout = secs;
        }

        if let Some(secs) = parse_secs(&lookup, "STATUSWATCH_STOP_TIMEOUT") {
            cfg.stop_timeout = secs;
        }

        if let Some(secs) = parse_secs(&lookup, "STATUSWATCH_DEFAULT_INTERVAL") {
            cfg.monitor.interval = secs;
        }

        if let Some(secs) = parse_secs(&lookup, "STATUSWATCH_DEFAULT_CHECK_TIMEOUT") {
            cfg.monitor.check_timeout = secs;
        }

        if let Some(ms) = parse::<_, u64>(&lookup, "STATUSWATCH_DEFAULT_LATENCY_THRESHOLD_MS") {
            if ms > 0 {
                cfg.monitor.latency_threshold_ms = ms;
            } else {
                tracing::warn!("Ignoring zero latency threshold");
            }
        }

        cfg
    }
}

fn parse<F, T>(lookup: &F, key: &str) -> Option<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("Ignoring invalid value {:?} for {}", raw, key);
            None
        }
    }
}

/// Positive seconds that fit in a [`Duration`] only.
fn parse_secs<F>(lookup: &F, key: &str) -> Option<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    let secs: f64 = parse(lookup, key)?;
    match Duration::try_from_secs_f64(secs) {
        Ok(duration) if !duration.is_zero() => Some(duration),
        _ => {
            tracing::warn!("Ignoring out of range value {} for {}", secs, key);
            None
        }
    }
}
