//! Integrity checking and recovery for ClinicTrack
//!
//! Wraps the engine's consistency-check primitive plus two logical checks
//! (foreign keys and index coverage). An integrity failure is informative,
//! not exceptional: the check functions never propagate errors, they fold
//! "could not run the check" into a distinguishable non-ok result so callers
//! can log it. Recovery is a REINDEX attempt followed by a re-check, with
//! the outcome recorded in the maintenance metadata.

use crate::db::{Database, DbError, META_CORRUPTION_DETECTED, META_RECOVERY_SUCCESS};
use crate::schema::SchemaSnapshot;
use rusqlite::Connection;
use serde::Serialize;
use std::collections::HashSet;
use tracing::{error, info, warn};

/// Result of the store's consistency check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityOutcome {
    /// The single-row "ok" sentinel came back.
    Passed,
    /// The check ran and reported problems.
    Corrupt(Vec<String>),
    /// The check itself could not run (I/O error, locked file).
    NotRun(String),
}

impl IntegrityOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Passed)
    }
}

/// One row from the engine's foreign key check.
#[derive(Debug, Clone, Serialize)]
pub struct FkViolation {
    pub table: String,
    pub rowid: Option<i64>,
    pub parent: String,
    pub fk_id: i64,
}

impl FkViolation {
    /// Synthetic violation used when the check itself could not run.
    fn check_unavailable(detail: String) -> Self {
        Self {
            table: "<check unavailable>".to_string(),
            rowid: None,
            parent: detail,
            fk_id: -1,
        }
    }
}

/// Run `PRAGMA integrity_check`, preserving the "could not run" case.
pub fn check_integrity(conn: &Connection) -> IntegrityOutcome {
    let mut stmt = match conn.prepare("PRAGMA integrity_check") {
        Ok(stmt) => stmt,
        Err(e) => return IntegrityOutcome::NotRun(e.to_string()),
    };
    let rows = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .and_then(|mapped| mapped.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(messages) if messages.len() == 1 && messages[0] == "ok" => IntegrityOutcome::Passed,
        Ok(messages) => IntegrityOutcome::Corrupt(messages),
        Err(e) => IntegrityOutcome::NotRun(e.to_string()),
    }
}

/// True iff the consistency check reports "ok".
pub fn verify_integrity(conn: &Connection) -> bool {
    check_integrity(conn).is_ok()
}

/// Run `PRAGMA foreign_key_check`; an empty list means no violations.
///
/// A failure to run the check is reported as a synthetic violation rather
/// than an error, so callers treating "non-empty" as "not clean" stay safe.
pub fn check_foreign_keys(conn: &Connection) -> Vec<FkViolation> {
    let mut stmt = match conn.prepare("PRAGMA foreign_key_check") {
        Ok(stmt) => stmt,
        Err(e) => return vec![FkViolation::check_unavailable(e.to_string())],
    };
    let rows = stmt
        .query_map([], |row| {
            Ok(FkViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_id: row.get(3)?,
            })
        })
        .and_then(|mapped| mapped.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(violations) => violations,
        Err(e) => vec![FkViolation::check_unavailable(e.to_string())],
    }
}

/// Logical index validation: every user index must reference columns that
/// exist on its table. Structural index corruption is the engine check's
/// job; this catches schema drift after hand-edited databases.
pub fn check_index_coverage(conn: &Connection) -> Vec<String> {
    let snapshot = match SchemaSnapshot::capture(conn) {
        Ok(snapshot) => snapshot,
        Err(e) => return vec![format!("could not read schema: {}", e)],
    };

    let mut problems = Vec::new();
    for table in &snapshot.tables {
        let columns: HashSet<&str> = table.columns.iter().map(|c| c.name.as_str()).collect();
        for index in &table.indexes {
            for column in &index.columns {
                if !columns.contains(column.as_str()) {
                    problems.push(format!(
                        "index {} references missing column {}.{}",
                        index.name, table.name, column
                    ));
                }
            }
        }
    }
    problems
}

/// Attempt to recover a store whose consistency check is not "ok".
///
/// REINDEX rebuilds every index from table data, which clears the most
/// common class of on-disk corruption. Returns whether the store checks out
/// afterwards; the outcome is recorded under `db_recovery_success` or
/// `db_corruption_detected`.
pub fn attempt_recovery(db: &Database) -> Result<bool, DbError> {
    match check_integrity(db.conn()) {
        IntegrityOutcome::Passed => Ok(true),
        outcome => {
            warn!(
                "integrity check failed ({:?}); attempting REINDEX recovery",
                outcome
            );
            if let Err(e) = db.conn().execute_batch("REINDEX;") {
                error!("REINDEX failed: {}", e);
                db.set_meta(META_CORRUPTION_DETECTED, &format!("reindex failed: {}", e))?;
                return Ok(false);
            }
            if verify_integrity(db.conn()) {
                info!("REINDEX recovery succeeded");
                db.set_meta(META_RECOVERY_SUCCESS, "reindex")?;
                Ok(true)
            } else {
                error!("store still corrupt after REINDEX");
                db.set_meta(META_CORRUPTION_DETECTED, "integrity check failed after reindex")?;
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::{Seek, SeekFrom, Write};
    use tempfile::tempdir;

    #[test]
    fn test_fresh_database_passes() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE patients (id INTEGER PRIMARY KEY);")
            .unwrap();
        assert_eq!(check_integrity(&conn), IntegrityOutcome::Passed);
        assert!(verify_integrity(&conn));
        assert!(check_foreign_keys(&conn).is_empty());
        assert!(check_index_coverage(&conn).is_empty());
    }

    #[test]
    fn test_foreign_key_violation_detected() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE patients (id INTEGER PRIMARY KEY);
             CREATE TABLE events (
                 id INTEGER PRIMARY KEY,
                 patient_id INTEGER NOT NULL REFERENCES patients(id)
             );
             -- enforcement off so the orphan row goes in
             PRAGMA foreign_keys = OFF;
             INSERT INTO events (id, patient_id) VALUES (1, 999);",
        )
        .unwrap();

        let violations = check_foreign_keys(&conn);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].table, "events");
        assert_eq!(violations[0].parent, "patients");
    }

    #[test]
    fn test_recovery_noop_when_healthy() {
        let dir = tempdir().unwrap();
        let db = Database::open(&dir.path().join("test.db")).unwrap();
        assert!(attempt_recovery(&db).unwrap());
        // No recovery records written for a healthy store.
        assert_eq!(db.get_meta(META_RECOVERY_SUCCESS).unwrap(), None);
        assert_eq!(db.get_meta(META_CORRUPTION_DETECTED).unwrap(), None);
    }

    #[test]
    fn test_recovery_records_unrepairable_corruption() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        // Table data damage cannot be repaired by rebuilding indices, so the
        // recovery attempt must end in a corruption record. The table has no
        // index of its own, keeping the REINDEX pass itself safe.
        let (root_page, page_size) = {
            let db = Database::open(&path).unwrap();
            db.conn()
                .execute_batch(
                    "CREATE TABLE patients (id INTEGER PRIMARY KEY, full_name TEXT NOT NULL);
                     INSERT INTO patients (full_name) VALUES ('a'), ('b'), ('c');",
                )
                .unwrap();
            let root_page: i64 = db
                .conn()
                .query_row(
                    "SELECT rootpage FROM sqlite_master WHERE name = 'patients'",
                    [],
                    |r| r.get(0),
                )
                .unwrap();
            let page_size: i64 = db
                .conn()
                .query_row("PRAGMA page_size", [], |r| r.get(0))
                .unwrap();
            (root_page, page_size)
        };

        let mut file = fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(((root_page - 1) * page_size) as u64))
            .unwrap();
        file.write_all(&vec![0xFF; page_size as usize]).unwrap();
        drop(file);

        let db = Database::open(&path).unwrap();
        assert!(!check_integrity(db.conn()).is_ok());

        assert!(!attempt_recovery(&db).unwrap());
        assert!(db.get_meta(META_CORRUPTION_DETECTED).unwrap().is_some());
        assert_eq!(db.get_meta(META_RECOVERY_SUCCESS).unwrap(), None);
    }
}
