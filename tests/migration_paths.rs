//! Migration path tests
//!
//! End-to-end checks that a database migrated edge by edge from the oldest
//! release ends up structurally identical to a fresh install, and that the
//! table rebuild carries row data through the encoding change.

use clinictrack_db::catalog::{create_fresh, MigrationCatalog, CURRENT_SCHEMA_VERSION};
use clinictrack_db::db::{Database, DbError, META_LAST_MIGRATION};
use clinictrack_db::executor::{apply_edges, prepare_database};
use clinictrack_db::schema::{diff, SchemaSnapshot};
use tempfile::TempDir;

/// Schema as shipped in the first release (version 1).
const V1_SCHEMA: &str = "
CREATE TABLE patients (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    full_name TEXT NOT NULL,
    identifier TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL
);
CREATE TABLE events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    patient_id INTEGER NOT NULL REFERENCES patients(id) ON DELETE CASCADE,
    event_type TEXT NOT NULL,
    event_date TEXT NOT NULL,
    notes TEXT,
    is_confirmed INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);
";

fn v1_database() -> (Database, TempDir) {
    let dir = TempDir::new().unwrap();
    let db = Database::open(&dir.path().join("clinictrack.db")).unwrap();
    db.conn().execute_batch(V1_SCHEMA).unwrap();
    db.set_schema_version(1).unwrap();
    (db, dir)
}

fn migrate_to(db: &Database, target: u32) {
    let catalog = MigrationCatalog::clinictrack();
    let current = db.schema_version().unwrap();
    let edges = catalog.migrations_to_run(current, target).unwrap();
    apply_edges(db, &edges).unwrap();
}

#[test]
fn migrated_database_matches_fresh_install() {
    let (db, _dir) = v1_database();
    migrate_to(&db, CURRENT_SCHEMA_VERSION);
    let migrated = SchemaSnapshot::capture(db.conn()).unwrap();

    let fresh_dir = TempDir::new().unwrap();
    let fresh = Database::open(&fresh_dir.path().join("clinictrack.db")).unwrap();
    create_fresh(fresh.conn()).unwrap();
    let fresh_snapshot = SchemaSnapshot::capture(fresh.conn()).unwrap();

    let forward = diff(&migrated, &fresh_snapshot);
    assert!(forward.is_empty(), "differences found: {:?}", forward);
    let backward = diff(&fresh_snapshot, &migrated);
    assert!(backward.is_empty(), "differences found: {:?}", backward);
}

#[test]
fn stepwise_chain_matches_fresh_install() {
    // Same end state whether the resolver picked the skip edge or the full
    // chain: apply every single-version edge by hand.
    let (db, _dir) = v1_database();
    let catalog = MigrationCatalog::clinictrack();
    for target in 2..=CURRENT_SCHEMA_VERSION {
        let from = db.schema_version().unwrap();
        let edge = catalog
            .edges()
            .iter()
            .find(|e| e.from == from && e.to == target)
            .unwrap_or_else(|| panic!("missing edge {}_to_{}", from, target));
        apply_edges(&db, &[edge]).unwrap();
    }
    assert_eq!(db.schema_version().unwrap(), CURRENT_SCHEMA_VERSION);

    let migrated = SchemaSnapshot::capture(db.conn()).unwrap();
    let fresh_dir = TempDir::new().unwrap();
    let fresh = Database::open(&fresh_dir.path().join("clinictrack.db")).unwrap();
    create_fresh(fresh.conn()).unwrap();
    let fresh_snapshot = SchemaSnapshot::capture(fresh.conn()).unwrap();
    assert!(diff(&migrated, &fresh_snapshot).is_empty());
}

#[test]
fn rebuild_preserves_rows_and_maps_confirmation() {
    let (db, _dir) = v1_database();
    migrate_to(&db, 4);

    db.conn()
        .execute(
            "INSERT INTO patients (full_name, identifier, created_at) VALUES (?, ?, ?)",
            ("Ada Lovelace", "P-0001", "2026-01-01T00:00:00Z"),
        )
        .unwrap();
    for (event_type, confirmed) in [("checkup", 1i64), ("referral", 0), ("followup", 2)] {
        db.conn()
            .execute(
                "INSERT INTO events (patient_id, event_type, event_date, is_confirmed, created_at)
                 VALUES (1, ?, '2026-01-02', ?, '2026-01-02T00:00:00Z')",
                (event_type, confirmed),
            )
            .unwrap();
    }

    migrate_to(&db, 5);

    let count: i64 = db
        .conn()
        .query_row("SELECT COUNT(*) FROM events", [], |r| r.get(0))
        .unwrap();
    assert_eq!(count, 3, "row count must survive the rebuild");

    // Old value 1 -> 1, anything else -> NULL.
    let confirmed: Option<i64> = db
        .conn()
        .query_row(
            "SELECT confirmed_status FROM events WHERE event_type = 'checkup'",
            [],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(confirmed, Some(1));
    for event_type in ["referral", "followup"] {
        let status: Option<i64> = db
            .conn()
            .query_row(
                "SELECT confirmed_status FROM events WHERE event_type = ?",
                [event_type],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(status, None, "{} should map to NULL", event_type);
    }
}

#[test]
fn migration_records_written_per_edge() {
    let (db, _dir) = v1_database();
    migrate_to(&db, CURRENT_SCHEMA_VERSION);

    // Last record names the final edge of the resolved path.
    assert_eq!(
        db.get_meta(META_LAST_MIGRATION).unwrap().as_deref(),
        Some("4_to_5")
    );
    assert_eq!(db.schema_version().unwrap(), CURRENT_SCHEMA_VERSION);
}

#[test]
fn up_to_date_database_needs_no_migrations() {
    let catalog = MigrationCatalog::clinictrack();
    let edges = catalog
        .migrations_to_run(CURRENT_SCHEMA_VERSION, CURRENT_SCHEMA_VERSION)
        .unwrap();
    assert!(edges.is_empty());
}

#[test]
fn prepare_database_carries_old_store_forward() {
    let (db, _dir) = v1_database();
    let outcome = prepare_database(&db).unwrap();

    assert_eq!(outcome.from_version, 1);
    assert_eq!(outcome.to_version, CURRENT_SCHEMA_VERSION);
    assert!(!outcome.applied.is_empty());
    assert!(outcome.integrity_ok);
    assert_eq!(db.schema_version().unwrap(), CURRENT_SCHEMA_VERSION);
}

#[test]
fn prepare_database_propagates_invalid_marker() {
    let dir = TempDir::new().unwrap();
    let db = Database::open(&dir.path().join("clinictrack.db")).unwrap();
    db.set_meta("schema_version", "garbage").unwrap();
    assert!(matches!(
        prepare_database(&db),
        Err(DbError::InvalidVersionMarker(_))
    ));
}
