//! Persistence interfaces consumed by the monitoring engine.
//!
//! The engine never talks to SQLite directly: the scheduler reads target
//! definitions through [`TargetSource`] and workers mutate incidents through
//! [`IncidentStore`]. [`Store`](super::Store) implements both.

use super::models::{Incident, TargetDef, TargetId};
use super::store::DbError;

/// Read access to the persisted target definitions.
pub trait TargetSource: Send + Sync {
    /// All active (not deleted) target definitions.
    fn load_targets(&self) -> Result<Vec<TargetDef>, DbError>;
}

/// Transactional access to incident rows.
pub trait IncidentStore: Send + Sync {
    /// Open a short-lived transaction. Dropping it without calling
    /// [`IncidentTx::commit`] rolls it back.
    fn begin(&self) -> Result<Box<dyn IncidentTx + '_>, DbError>;
}

/// One open transaction against the incident table.
pub trait IncidentTx {
    /// The open incident for `target_id`, if any. With `for_update` the row
    /// stays locked against concurrent writers until the transaction ends.
    fn find_open(
        &mut self,
        target_id: TargetId,
        for_update: bool,
    ) -> Result<Option<Incident>, DbError>;

    /// Find an incident by id.
    fn find_by_id(&mut self, id: i64, for_update: bool) -> Result<Option<Incident>, DbError>;

    /// Insert (`id == 0`) or update the incident and return the stored row.
    fn save(&mut self, incident: &Incident) -> Result<Incident, DbError>;

    fn commit(self: Box<Self>) -> Result<(), DbError>;
}
