//! statuswatch - endpoint monitoring engine.
//!
//! Periodically probes persisted targets and records their anomalies as
//! coalesced incidents.

pub mod config;
pub mod db;
pub mod probe;
pub mod scheduler;
pub mod worker;
