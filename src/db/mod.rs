//! Database module.
//!
//! SQLite storage for target definitions and incidents, with embedded
//! migrations, plus the interfaces the monitoring engine consumes.

mod models;
mod repository;
mod store;

pub use models::*;
pub use repository::*;
pub use store::*;
