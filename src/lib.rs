//! ClinicTrack database maintenance
//!
//! Schema migration, integrity verification, and backup/restore for the
//! on-device clinical records store. Migrations run once, synchronously,
//! during application startup; nothing else may open the store for general
//! use until [`executor::prepare_database`] returns, or the caller has
//! explicitly decided to fall back to a backup via
//! [`backup::BackupManager`].

pub mod backup;
pub mod catalog;
pub mod db;
pub mod executor;
pub mod integrity;
pub mod schema;
pub mod steps;

pub use backup::{BackupError, BackupInfo, BackupManager};
pub use catalog::{MigrationCatalog, CURRENT_SCHEMA_VERSION};
pub use db::{Database, DbError, DbHandle};
pub use executor::{apply_edges, prepare_database, MigrationOutcome};
