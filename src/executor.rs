//! Migration execution engine for ClinicTrack
//!
//! Applies a resolved migration path edge by edge. Each edge runs inside a
//! single transaction, so a failing step rolls the whole edge back; the
//! version marker only advances after an edge commits, which makes a failed
//! startup retry from the same starting version. Migration failure is fatal
//! to startup: callers must not use the store until [`prepare_database`]
//! returns.

use crate::catalog::{create_fresh, MigrationCatalog, MigrationEdge, CURRENT_SCHEMA_VERSION};
use crate::db::{Database, DbError, META_LAST_MAINTENANCE, META_LAST_MIGRATION};
use crate::integrity::{self, IntegrityOutcome};
use serde::Serialize;
use tracing::{error, info};

/// What the startup maintenance pass did.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationOutcome {
    pub from_version: u32,
    pub to_version: u32,
    /// Names of the edges applied this run, in order.
    pub applied: Vec<String>,
    /// Result of the post-migration integrity verification (after any
    /// recovery attempt).
    pub integrity_ok: bool,
}

/// Apply a resolved path of migration edges in order.
///
/// After each edge commits, a `last_migration` record is written and the
/// schema version marker advances to the edge's end version. The first
/// failure stops the run; later edges are not attempted and the marker is
/// left at the last committed version.
pub fn apply_edges(db: &Database, edges: &[&MigrationEdge]) -> Result<(), DbError> {
    for edge in edges {
        info!("applying migration {}", edge.name());
        let tx = db.conn().unchecked_transaction()?;
        for step in &edge.steps {
            step.apply(db.conn()).map_err(|source| {
                error!(
                    "migration {} failed at step '{}': {}",
                    edge.name(),
                    step.describe(),
                    source
                );
                DbError::Migration {
                    edge: edge.name(),
                    source,
                }
            })?;
        }
        tx.commit()?;

        db.set_meta(META_LAST_MIGRATION, &edge.name())?;
        db.set_schema_version(edge.to)?;
        info!("migration {} complete", edge.name());
    }
    Ok(())
}

/// Startup entry point: carry the store to the current schema version and
/// verify it.
///
/// Runs synchronously before anything else opens the store for general use.
/// Fresh installs (version 0) get the full current schema directly. After
/// migration the integrity check runs; a non-ok result triggers the REINDEX
/// recovery path, and the final verdict is reported in the outcome rather
/// than failing the call, so the caller decides whether to fall back to a
/// backup.
pub fn prepare_database(db: &Database) -> Result<MigrationOutcome, DbError> {
    let catalog = MigrationCatalog::clinictrack();
    let from_version = db.schema_version()?;
    let mut applied = Vec::new();

    if from_version == 0 {
        info!("fresh install, creating schema at version {}", CURRENT_SCHEMA_VERSION);
        create_fresh(db.conn())?;
        db.set_schema_version(CURRENT_SCHEMA_VERSION)?;
    } else if from_version != CURRENT_SCHEMA_VERSION {
        let edges = catalog.migrations_to_run(from_version, CURRENT_SCHEMA_VERSION)?;
        applied = edges.iter().map(|e| e.name()).collect();
        info!(
            "migrating from version {} to {} ({} edges)",
            from_version,
            CURRENT_SCHEMA_VERSION,
            edges.len()
        );
        apply_edges(db, &edges)?;
    }

    let integrity_ok = match integrity::check_integrity(db.conn()) {
        IntegrityOutcome::Passed => true,
        _ => integrity::attempt_recovery(db)?,
    };

    db.set_meta(META_LAST_MAINTENANCE, &chrono::Utc::now().to_rfc3339())?;

    Ok(MigrationOutcome {
        from_version,
        to_version: CURRENT_SCHEMA_VERSION,
        applied,
        integrity_ok,
    })
}
