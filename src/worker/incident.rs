//! Incident coalescing.
//!
//! Each probe cycle feeds its outcome through [`record_outcome`], which keeps
//! at most one open incident per target:
//!
//! | outcome | open incident        | effect                              |
//! |---------|----------------------|-------------------------------------|
//! | healthy | none                 | nothing                             |
//! | healthy | any                  | resolve it                          |
//! | anomaly | none                 | open a new incident                 |
//! | anomaly | same message + kind  | refresh it in place                 |
//! | anomaly | different            | resolve it, then open a new one     |

use crate::db::{DbError, Incident, IncidentStore, TargetId};
use crate::probe::Outcome;

use chrono::{DateTime, Utc};

/// What a cycle did to the target's incidents.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Unchanged,
    Opened(Incident),
    Refreshed(Incident),
    Replaced { resolved: Incident, opened: Incident },
    Resolved(Incident),
}

/// Apply one cycle's outcome for `target_id` in a single transaction.
///
/// The open incident is read with the lock flag set so a concurrent manual
/// resolution cannot interleave with the update.
pub fn record_outcome(
    store: &dyn IncidentStore,
    target_id: TargetId,
    outcome: &Outcome,
    now: DateTime<Utc>,
) -> Result<Transition, DbError> {
    let mut tx = store.begin()?;
    let open = tx.find_open(target_id, true)?;

    let transition = match (outcome.anomaly(), open) {
        (None, None) => Transition::Unchanged,
        (None, Some(mut open)) => {
            open.resolve(now);
            Transition::Resolved(tx.save(&open)?)
        }
        (Some(anomaly), None) => {
            let incident = Incident::open(target_id, anomaly.category, &anomaly.message, now);
            Transition::Opened(tx.save(&incident)?)
        }
        (Some(anomaly), Some(mut open))
            if open.message == anomaly.message && open.category == anomaly.category =>
        {
            open.updated_at = now;
            Transition::Refreshed(tx.save(&open)?)
        }
        (Some(anomaly), Some(mut open)) => {
            // Resolve first: the schema allows a single open row per target.
            open.resolve(now);
            let resolved = tx.save(&open)?;
            let incident = Incident::open(target_id, anomaly.category, &anomaly.message, now);
            let opened = tx.save(&incident)?;
            Transition::Replaced { resolved, opened }
        }
    };

    tx.commit()?;
    Ok(transition)
}
