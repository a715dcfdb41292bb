//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Identity of a monitored target.
pub type TargetId = i64;

/// A persisted monitoring target definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetDef {
    pub id: TargetId,
    pub name: String,
    pub probe_type: String,
    pub endpoint: String,
    pub method: Option<String>,
    pub headers: Option<HashMap<String, String>>,
    pub request_body: Option<String>,
    pub expected_response_code: Option<u16>,
    pub expected_content_pattern: Option<String>,
    pub latency_threshold_ms: Option<u64>,
    /// Status code (as a decimal string) to incident message.
    pub error_mapping: Option<HashMap<String, String>>,
    pub interval_secs: f64,
    pub initial_delay_secs: f64,
    pub check_timeout_secs: f64,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Default for TargetDef {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            name: String::new(),
            probe_type: "http".to_string(),
            endpoint: String::new(),
            method: None,
            headers: None,
            request_body: None,
            expected_response_code: None,
            expected_content_pattern: None,
            latency_threshold_ms: None,
            error_mapping: None,
            interval_secs: 60.0,
            initial_delay_secs: 0.0,
            check_timeout_secs: 30.0,
            is_deleted: false,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Severity of an incident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentCategory {
    Degraded,
    PartialOutage,
    MajorOutage,
}

impl IncidentCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Degraded => "degraded",
            Self::PartialOutage => "partial_outage",
            Self::MajorOutage => "major_outage",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "degraded" => Some(Self::Degraded),
            "partial_outage" => Some(Self::PartialOutage),
            "major_outage" => Some(Self::MajorOutage),
            _ => None,
        }
    }
}

impl fmt::Display for IncidentCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentStatus {
    Open,
    Resolved,
}

impl IncidentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Resolved => "resolved",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(Self::Open),
            "resolved" => Some(Self::Resolved),
            _ => None,
        }
    }
}

/// A span of time during which a target was in an anomalous state.
///
/// An `id` of 0 marks a row that has not been inserted yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub id: i64,
    pub target_id: TargetId,
    pub category: IncidentCategory,
    pub status: IncidentStatus,
    pub message: String,
    pub created_at: DateTime<Utc>,
    /// Last time a probe cycle confirmed this incident.
    pub updated_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Incident {
    /// Build a new, not yet persisted, open incident.
    pub fn open(
        target_id: TargetId,
        category: IncidentCategory,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: 0,
            target_id,
            category,
            status: IncidentStatus::Open,
            message: message.into(),
            created_at: now,
            updated_at: now,
            ended_at: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == IncidentStatus::Open
    }

    /// Mark the incident resolved at `now`.
    pub fn resolve(&mut self, now: DateTime<Utc>) {
        self.status = IncidentStatus::Resolved;
        self.updated_at = now;
        self.ended_at = Some(now);
    }
}
