//! Runtime configuration of a single monitored target.

use crate::config::MonitorDefaults;
use crate::db::{TargetDef, TargetId};

use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// A target definition that cannot be turned into a running worker.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("unsupported probe type: {0}")]
    UnsupportedProbeType(String),
    #[error("invalid endpoint {endpoint:?}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },
    #[error("invalid HTTP method {0:?}, allowed: GET, POST, PUT, DELETE")]
    InvalidMethod(String),
    #[error("invalid header {0:?}")]
    InvalidHeader(String),
    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Immutable configuration a worker runs with.
///
/// Every duration is strictly positive except `initial_delay`, which may be
/// zero.
#[derive(Debug, Clone)]
pub struct TargetConfig {
    pub id: TargetId,
    pub name: String,
    pub probe_type: String,
    pub interval: Duration,
    pub initial_delay: Duration,
    pub check_timeout: Duration,

    pub endpoint: String,
    pub method: Option<String>,
    pub headers: HashMap<String, String>,
    pub request_body: Option<String>,
    pub expected_response_code: Option<u16>,
    pub expected_content_pattern: Option<String>,
    pub latency_threshold_ms: u64,
    /// Status code (as a decimal string) to incident message.
    pub error_mapping: HashMap<String, String>,
}

impl TargetConfig {
    /// Map a persisted definition onto runtime configuration, filling gaps
    /// from `defaults`.
    pub fn from_def(def: &TargetDef, defaults: &MonitorDefaults) -> Self {
        Self {
            id: def.id,
            name: def.name.clone(),
            probe_type: def.probe_type.clone(),
            interval: positive_secs(def.interval_secs).unwrap_or(defaults.interval),
            initial_delay: positive_secs(def.initial_delay_secs).unwrap_or(Duration::ZERO),
            check_timeout: positive_secs(def.check_timeout_secs).unwrap_or(defaults.check_timeout),
            endpoint: def.endpoint.trim().to_string(),
            method: non_empty(&def.method),
            headers: def.headers.clone().unwrap_or_default(),
            request_body: non_empty(&def.request_body),
            expected_response_code: def.expected_response_code.filter(|code| *code != 0),
            expected_content_pattern: non_empty(&def.expected_content_pattern),
            latency_threshold_ms: def
                .latency_threshold_ms
                .filter(|ms| *ms > 0)
                .unwrap_or(defaults.latency_threshold_ms),
            error_mapping: def.error_mapping.clone().unwrap_or_default(),
        }
    }
}

/// `None` unless `secs` is positive and fits in a [`Duration`].
fn positive_secs(secs: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(secs)
        .ok()
        .filter(|duration| !duration.is_zero())
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .map(str::to_string)
}
