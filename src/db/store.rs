//! SQLite database store implementation.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, Type, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row};
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use super::models::*;
use super::repository::{IncidentStore, IncidentTx, TargetSource};

mod embedded {
    refinery::embed_migrations!("migrations");
}

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

const TARGET_COLUMNS: &str = "id, name, probe_type, endpoint, method, headers, request_body, \
     expected_response_code, expected_content_pattern, latency_threshold_ms, error_mapping, \
     interval_secs, initial_delay_secs, check_timeout_secs, is_deleted, created_at, updated_at";

const INCIDENT_COLUMNS: &str =
    "id, target_id, category, status, message, created_at, updated_at, ended_at";

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("JSON column error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("database lock poisoned")]
    LockPoisoned,
    #[error("Not found")]
    NotFound,
}

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        Self::from_connection(Connection::open(path)?)
    }

    /// Create a store backed by a private in-memory database.
    pub fn open_in_memory() -> Result<Self, DbError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, DbError> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Run the embedded migrations.
    fn init(&self) -> Result<(), DbError> {
        let mut conn = self.conn()?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        let report = embedded::migrations::runner()
            .run(&mut *conn)
            .map_err(|e| DbError::Migration(e.to_string()))?;

        for migration in report.applied_migrations() {
            tracing::info!("Applied migration {}", migration);
        }

        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::LockPoisoned)
    }

    // --- Target CRUD ---

    /// Add a new target and return its ID.
    pub fn add_target(&self, target: &mut TargetDef) -> Result<TargetId, DbError> {
        let now = Utc::now();
        target.created_at = now;
        target.updated_at = now;

        let headers = to_json_column(&target.headers)?;
        let error_mapping = to_json_column(&target.error_mapping)?;

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO targets (name, probe_type, endpoint, method, headers, request_body,
                expected_response_code, expected_content_pattern, latency_threshold_ms,
                error_mapping, interval_secs, initial_delay_secs, check_timeout_secs,
                is_deleted, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, 0, ?14, ?15)",
            params![
                target.name,
                target.probe_type,
                target.endpoint,
                target.method,
                headers,
                target.request_body,
                target.expected_response_code,
                target.expected_content_pattern,
                target.latency_threshold_ms.map(|v| v as i64),
                error_mapping,
                target.interval_secs,
                target.initial_delay_secs,
                target.check_timeout_secs,
                format_db_time(now),
                format_db_time(now),
            ],
        )?;
        let id = conn.last_insert_rowid();
        target.id = id;
        target.is_deleted = false;
        Ok(id)
    }

    /// Update an existing target.
    pub fn update_target(&self, target: &TargetDef) -> Result<(), DbError> {
        let headers = to_json_column(&target.headers)?;
        let error_mapping = to_json_column(&target.error_mapping)?;

        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE targets SET name=?1, probe_type=?2, endpoint=?3, method=?4, headers=?5,
                request_body=?6, expected_response_code=?7, expected_content_pattern=?8,
                latency_threshold_ms=?9, error_mapping=?10, interval_secs=?11,
                initial_delay_secs=?12, check_timeout_secs=?13, updated_at=?14
             WHERE id=?15 AND is_deleted = 0",
            params![
                target.name,
                target.probe_type,
                target.endpoint,
                target.method,
                headers,
                target.request_body,
                target.expected_response_code,
                target.expected_content_pattern,
                target.latency_threshold_ms.map(|v| v as i64),
                error_mapping,
                target.interval_secs,
                target.initial_delay_secs,
                target.check_timeout_secs,
                format_db_time(Utc::now()),
                target.id,
            ],
        )?;

        if updated == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    /// Get all active targets, newest first.
    pub fn get_targets(&self) -> Result<Vec<TargetDef>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {TARGET_COLUMNS} FROM targets WHERE is_deleted = 0
             ORDER BY created_at DESC, id DESC"
        ))?;

        let targets = stmt
            .query_map([], target_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(targets)
    }

    /// Get an active target by ID.
    pub fn get_target(&self, id: TargetId) -> Result<TargetDef, DbError> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {TARGET_COLUMNS} FROM targets WHERE id = ?1 AND is_deleted = 0"),
            params![id],
            target_from_row,
        )
        .optional()?
        .ok_or(DbError::NotFound)
    }

    /// Soft-delete a target. Its incident history is kept.
    pub fn delete_target(&self, id: TargetId) -> Result<(), DbError> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE targets SET is_deleted = 1, updated_at = ?1 WHERE id = ?2 AND is_deleted = 0",
            params![format_db_time(Utc::now()), id],
        )?;

        if updated == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    // --- Incidents ---

    /// List incidents, newest first, optionally filtered by target and by
    /// creation time.
    pub fn list_incidents(
        &self,
        target_id: Option<TargetId>,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Incident>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {INCIDENT_COLUMNS} FROM incidents
             WHERE (?1 IS NULL OR target_id = ?1) AND (?2 IS NULL OR created_at > ?2)
             ORDER BY created_at DESC, id DESC"
        ))?;

        let incidents = stmt
            .query_map(
                params![target_id, since.map(format_db_time)],
                incident_from_row,
            )?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(incidents)
    }

    pub fn get_incident(&self, id: i64) -> Result<Incident, DbError> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {INCIDENT_COLUMNS} FROM incidents WHERE id = ?1"),
            params![id],
            incident_from_row,
        )
        .optional()?
        .ok_or(DbError::NotFound)
    }

    /// Resolve an incident by hand.
    ///
    /// Runs in the same locked transaction as the worker's coalescing step, so
    /// the two never interleave. Resolving an already resolved incident
    /// returns it unchanged.
    pub fn resolve_incident(&self, id: i64) -> Result<Incident, DbError> {
        let mut tx = self.begin()?;
        let mut incident = tx.find_by_id(id, true)?.ok_or(DbError::NotFound)?;

        if incident.is_open() {
            incident.resolve(Utc::now());
            incident = tx.save(&incident)?;
            tracing::info!("Incident {} for target {} resolved manually", id, incident.target_id);
        }

        tx.commit()?;
        Ok(incident)
    }
}

impl TargetSource for Store {
    fn load_targets(&self) -> Result<Vec<TargetDef>, DbError> {
        self.get_targets()
    }
}

impl IncidentStore for Store {
    fn begin(&self) -> Result<Box<dyn IncidentTx + '_>, DbError> {
        let conn = self.conn()?;
        // IMMEDIATE takes the database write lock up front.
        conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(Box::new(StoreTx {
            conn,
            finished: false,
        }))
    }
}

/// A transaction holding the store's connection for its whole lifetime.
struct StoreTx<'a> {
    conn: MutexGuard<'a, Connection>,
    finished: bool,
}

impl IncidentTx for StoreTx<'_> {
    // SQLite has no row locks; the IMMEDIATE transaction already excludes
    // every other writer, so `for_update` needs no extra clause.
    fn find_open(
        &mut self,
        target_id: TargetId,
        _for_update: bool,
    ) -> Result<Option<Incident>, DbError> {
        let incident = self
            .conn
            .query_row(
                &format!(
                    "SELECT {INCIDENT_COLUMNS} FROM incidents WHERE target_id = ?1 AND status = ?2"
                ),
                params![target_id, IncidentStatus::Open],
                incident_from_row,
            )
            .optional()?;
        Ok(incident)
    }

    fn find_by_id(&mut self, id: i64, _for_update: bool) -> Result<Option<Incident>, DbError> {
        let incident = self
            .conn
            .query_row(
                &format!("SELECT {INCIDENT_COLUMNS} FROM incidents WHERE id = ?1"),
                params![id],
                incident_from_row,
            )
            .optional()?;
        Ok(incident)
    }

    fn save(&mut self, incident: &Incident) -> Result<Incident, DbError> {
        let mut saved = incident.clone();

        if incident.id == 0 {
            self.conn.execute(
                "INSERT INTO incidents
                    (target_id, category, status, message, created_at, updated_at, ended_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    incident.target_id,
                    incident.category,
                    incident.status,
                    incident.message,
                    format_db_time(incident.created_at),
                    format_db_time(incident.updated_at),
                    incident.ended_at.map(format_db_time),
                ],
            )?;
            saved.id = self.conn.last_insert_rowid();
        } else {
            let updated = self.conn.execute(
                "UPDATE incidents SET category=?1, status=?2, message=?3, updated_at=?4, ended_at=?5
                 WHERE id=?6",
                params![
                    incident.category,
                    incident.status,
                    incident.message,
                    format_db_time(incident.updated_at),
                    incident.ended_at.map(format_db_time),
                    incident.id,
                ],
            )?;
            if updated == 0 {
                return Err(DbError::NotFound);
            }
        }

        Ok(saved)
    }

    fn commit(mut self: Box<Self>) -> Result<(), DbError> {
        self.conn.execute_batch("COMMIT")?;
        self.finished = true;
        Ok(())
    }
}

impl Drop for StoreTx<'_> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                tracing::error!("Failed to roll back incident transaction: {}", e);
            }
        }
    }
}

impl ToSql for IncidentCategory {
    fn to_sql(&self) -> SqlResult<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for IncidentCategory {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        IncidentCategory::parse(s)
            .ok_or_else(|| FromSqlError::Other(format!("unknown incident category: {s}").into()))
    }
}

impl ToSql for IncidentStatus {
    fn to_sql(&self) -> SqlResult<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for IncidentStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        IncidentStatus::parse(s)
            .ok_or_else(|| FromSqlError::Other(format!("unknown incident status: {s}").into()))
    }
}

fn target_from_row(row: &Row<'_>) -> SqlResult<TargetDef> {
    let created_at: String = row.get(15)?;
    let updated_at: String = row.get(16)?;
    let latency_threshold_ms: Option<i64> = row.get(9)?;

    Ok(TargetDef {
        id: row.get(0)?,
        name: row.get(1)?,
        probe_type: row.get(2)?,
        endpoint: row.get(3)?,
        method: row.get(4)?,
        headers: json_column(row, 5)?,
        request_body: row.get(6)?,
        expected_response_code: row.get(7)?,
        expected_content_pattern: row.get(8)?,
        latency_threshold_ms: latency_threshold_ms.map(|v| v.max(0) as u64),
        error_mapping: json_column(row, 10)?,
        interval_secs: row.get(11)?,
        initial_delay_secs: row.get(12)?,
        check_timeout_secs: row.get(13)?,
        is_deleted: row.get(14)?,
        created_at: parse_db_time(&created_at).unwrap_or_else(Utc::now),
        updated_at: parse_db_time(&updated_at).unwrap_or_else(Utc::now),
    })
}

fn incident_from_row(row: &Row<'_>) -> SqlResult<Incident> {
    let created_at: String = row.get(5)?;
    let updated_at: String = row.get(6)?;
    let ended_at: Option<String> = row.get(7)?;

    Ok(Incident {
        id: row.get(0)?,
        target_id: row.get(1)?,
        category: row.get(2)?,
        status: row.get(3)?,
        message: row.get(4)?,
        created_at: parse_db_time(&created_at).unwrap_or_else(Utc::now),
        updated_at: parse_db_time(&updated_at).unwrap_or_else(Utc::now),
        ended_at: ended_at.and_then(|s| parse_db_time(&s)),
    })
}

fn json_column<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> SqlResult<Option<T>> {
    let raw: Option<String> = row.get(idx)?;
    match raw {
        Some(s) if !s.is_empty() && s != "null" => serde_json::from_str(&s)
            .map(Some)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))),
        _ => Ok(None),
    }
}

fn to_json_column<T: serde::Serialize>(value: &Option<T>) -> Result<Option<String>, DbError> {
    Ok(value.as_ref().map(serde_json::to_string).transpose()?)
}

fn format_db_time(time: DateTime<Utc>) -> String {
    time.format(TIME_FORMAT).to_string()
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [TIME_FORMAT, "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
