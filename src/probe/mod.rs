//! Probe module for target monitoring.
//!
//! A probe strategy runs one check against one target and reports either a
//! healthy outcome or a classified [`Anomaly`]. Strategies are looked up by
//! the target's `probe_type` in a [`ProbeRegistry`]; nothing else in the crate
//! depends on a concrete strategy.

mod config;
mod http;

pub use config::*;
pub use http::*;

use crate::db::IncidentCategory;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Probe error types.
///
/// Transport failures are not errors: strategies classify them into an
/// [`Anomaly`]. These cover what a strategy could not classify at all.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("failed to build request: {0}")]
    Request(String),
    #[error("unexpected probe failure: {0}")]
    Unexpected(String),
}

/// A classified unhealthy probe result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Anomaly {
    pub message: String,
    pub category: IncidentCategory,
}

impl Anomaly {
    pub fn new(category: IncidentCategory, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            category,
        }
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self::new(IncidentCategory::Degraded, message)
    }

    pub fn partial_outage(message: impl Into<String>) -> Self {
        Self::new(IncidentCategory::PartialOutage, message)
    }

    pub fn major_outage(message: impl Into<String>) -> Self {
        Self::new(IncidentCategory::MajorOutage, message)
    }

    /// Stand-in for any failure nothing more specific describes.
    pub fn service_unavailable() -> Self {
        Self::major_outage("Service unavailable")
    }

    pub fn service_timeout() -> Self {
        Self::major_outage("Service timeout")
    }
}

/// Result of one probe cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Healthy,
    Anomaly(Anomaly),
}

impl Outcome {
    pub fn anomaly(&self) -> Option<&Anomaly> {
        match self {
            Outcome::Healthy => None,
            Outcome::Anomaly(anomaly) => Some(anomaly),
        }
    }
}

impl From<Anomaly> for Outcome {
    fn from(anomaly: Anomaly) -> Self {
        Outcome::Anomaly(anomaly)
    }
}

/// One check strategy bound to one target.
#[async_trait]
pub trait Probe: Send + Sync {
    /// Run a single check.
    async fn check(&self) -> Result<Outcome, ProbeError>;
}

/// Builds a strategy for a target.
pub type ProbeConstructor = fn(&TargetConfig) -> Result<Arc<dyn Probe>, ConfigError>;

/// Strategies known out of the box, keyed by `probe_type`.
static BUILTIN_STRATEGIES: &[(&str, ProbeConstructor)] =
    &[("http", build_http_probe as ProbeConstructor)];

/// Maps a target's `probe_type` to the constructor of its strategy.
#[derive(Clone)]
pub struct ProbeRegistry {
    constructors: HashMap<String, ProbeConstructor>,
}

impl Default for ProbeRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        for (name, constructor) in BUILTIN_STRATEGIES {
            registry.register(name, *constructor);
        }
        registry
    }
}

impl ProbeRegistry {
    /// A registry without any strategy.
    pub fn empty() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// Add or replace the strategy for `probe_type` (case-insensitive).
    pub fn register(&mut self, probe_type: &str, constructor: ProbeConstructor) {
        self.constructors
            .insert(probe_type.to_ascii_lowercase(), constructor);
    }

    /// Build the strategy for `config`.
    pub fn build(&self, config: &TargetConfig) -> Result<Arc<dyn Probe>, ConfigError> {
        let constructor = self
            .constructors
            .get(&config.probe_type.to_ascii_lowercase())
            .ok_or_else(|| ConfigError::UnsupportedProbeType(config.probe_type.clone()))?;
        constructor(config)
    }
}
