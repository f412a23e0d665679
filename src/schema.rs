//! Schema introspection for ClinicTrack
//!
//! Captures a structural snapshot of the live database (tables, columns,
//! indices) and computes the difference between two snapshots. Snapshots are
//! diagnostic: the migration catalog, not a diff, decides what runs at
//! startup. Engine-internal objects (`sqlite_` prefix) are excluded.

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Name prefix of engine-internal tables and indices.
const SYSTEM_PREFIX: &str = "sqlite_";

/// One column of a captured table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    pub decl_type: String,
    pub notnull: bool,
    pub default_value: Option<String>,
}

/// One index of a captured table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSchema {
    pub name: String,
    pub unique: bool,
    /// Indexed columns in key order. Expression members are skipped.
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnSchema>,
    pub indexes: Vec<IndexSchema>,
}

/// Immutable structural description of a database at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    pub tables: Vec<TableSchema>,
}

/// Difference between two snapshots. Consumers must match exhaustively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SchemaDifference {
    TableAdded { table: String },
    TableRemoved { table: String },
    ColumnAdded { table: String, column: String },
    ColumnRemoved { table: String, column: String },
    ColumnTypeChanged {
        table: String,
        column: String,
        old_type: String,
        new_type: String,
    },
    IndexAdded { table: String, index: String },
    IndexRemoved { table: String, index: String },
}

impl SchemaSnapshot {
    /// Capture the structure of a live database, tables sorted by name.
    pub fn capture(conn: &Connection) -> Result<Self, rusqlite::Error> {
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master
             WHERE type = 'table' AND name NOT LIKE 'sqlite\\_%' ESCAPE '\\'
             ORDER BY name",
        )?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut tables = Vec::with_capacity(names.len());
        for name in names {
            tables.push(TableSchema {
                columns: capture_columns(conn, &name)?,
                indexes: capture_indexes(conn, &name)?,
                name,
            });
        }
        Ok(Self { tables })
    }

    /// Load a snapshot from a serialized reference.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Serialize the snapshot for storage as a reference file.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.iter().find(|t| t.name == name)
    }
}

fn capture_columns(conn: &Connection, table: &str) -> Result<Vec<ColumnSchema>, rusqlite::Error> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info(\"{}\")", table))?;
    let columns = stmt
        .query_map([], |row| {
            Ok(ColumnSchema {
                name: row.get(1)?,
                decl_type: row.get(2)?,
                notnull: row.get::<_, i64>(3)? != 0,
                default_value: row.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(columns)
}

fn capture_indexes(conn: &Connection, table: &str) -> Result<Vec<IndexSchema>, rusqlite::Error> {
    let mut stmt = conn.prepare(&format!("PRAGMA index_list(\"{}\")", table))?;
    let listed = stmt
        .query_map([], |row| {
            Ok((row.get::<_, String>(1)?, row.get::<_, i64>(2)? != 0))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut indexes = Vec::new();
    for (name, unique) in listed {
        // Implicit autoindexes (PRIMARY KEY / UNIQUE constraints) are engine
        // internals, same filter as tables.
        if name.starts_with(SYSTEM_PREFIX) {
            continue;
        }
        let mut info = conn.prepare(&format!("PRAGMA index_info(\"{}\")", name))?;
        let columns = info
            .query_map([], |row| row.get::<_, Option<String>>(2))?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .flatten()
            .collect();
        indexes.push(IndexSchema {
            name,
            unique,
            columns,
        });
    }
    indexes.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(indexes)
}

/// Compute the structural differences between two snapshots.
///
/// Pure and deterministic: tables are compared by name, then columns and
/// indices of tables present in both. Output ordering follows table name
/// order within each snapshot.
pub fn diff(old: &SchemaSnapshot, new: &SchemaSnapshot) -> Vec<SchemaDifference> {
    let old_tables: BTreeMap<&str, &TableSchema> =
        old.tables.iter().map(|t| (t.name.as_str(), t)).collect();
    let new_tables: BTreeMap<&str, &TableSchema> =
        new.tables.iter().map(|t| (t.name.as_str(), t)).collect();

    let mut differences = Vec::new();

    for (&name, _) in &new_tables {
        if !old_tables.contains_key(name) {
            differences.push(SchemaDifference::TableAdded {
                table: name.to_string(),
            });
        }
    }
    for (&name, _) in &old_tables {
        if !new_tables.contains_key(name) {
            differences.push(SchemaDifference::TableRemoved {
                table: name.to_string(),
            });
        }
    }

    for (&name, old_table) in &old_tables {
        let Some(new_table) = new_tables.get(name) else {
            continue;
        };
        diff_columns(old_table, new_table, &mut differences);
        diff_indexes(old_table, new_table, &mut differences);
    }

    differences
}

fn diff_columns(old: &TableSchema, new: &TableSchema, out: &mut Vec<SchemaDifference>) {
    let old_cols: BTreeMap<&str, &ColumnSchema> =
        old.columns.iter().map(|c| (c.name.as_str(), c)).collect();
    let new_cols: BTreeMap<&str, &ColumnSchema> =
        new.columns.iter().map(|c| (c.name.as_str(), c)).collect();

    for (&name, new_col) in &new_cols {
        match old_cols.get(name) {
            None => out.push(SchemaDifference::ColumnAdded {
                table: new.name.clone(),
                column: name.to_string(),
            }),
            Some(old_col) => {
                if !old_col.decl_type.eq_ignore_ascii_case(&new_col.decl_type) {
                    out.push(SchemaDifference::ColumnTypeChanged {
                        table: new.name.clone(),
                        column: name.to_string(),
                        old_type: old_col.decl_type.clone(),
                        new_type: new_col.decl_type.clone(),
                    });
                }
            }
        }
    }
    for &name in old_cols.keys() {
        if !new_cols.contains_key(name) {
            out.push(SchemaDifference::ColumnRemoved {
                table: old.name.clone(),
                column: name.to_string(),
            });
        }
    }
}

fn diff_indexes(old: &TableSchema, new: &TableSchema, out: &mut Vec<SchemaDifference>) {
    let old_idx: BTreeMap<&str, &IndexSchema> =
        old.indexes.iter().map(|i| (i.name.as_str(), i)).collect();
    let new_idx: BTreeMap<&str, &IndexSchema> =
        new.indexes.iter().map(|i| (i.name.as_str(), i)).collect();

    for &name in new_idx.keys() {
        if !old_idx.contains_key(name) {
            out.push(SchemaDifference::IndexAdded {
                table: new.name.clone(),
                index: name.to_string(),
            });
        }
    }
    for &name in old_idx.keys() {
        if !new_idx.contains_key(name) {
            out.push(SchemaDifference::IndexRemoved {
                table: old.name.clone(),
                index: name.to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn_with(sql: &str) -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(sql).unwrap();
        conn
    }

    #[test]
    fn test_capture_excludes_system_objects() {
        let conn = conn_with(
            "CREATE TABLE patients (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                identifier TEXT NOT NULL UNIQUE
            );",
        );
        // AUTOINCREMENT creates sqlite_sequence, UNIQUE creates an autoindex.
        let snapshot = SchemaSnapshot::capture(&conn).unwrap();
        assert_eq!(snapshot.tables.len(), 1);
        assert_eq!(snapshot.tables[0].name, "patients");
        assert!(snapshot.tables[0].indexes.is_empty());
    }

    #[test]
    fn test_capture_columns_and_indexes() {
        let conn = conn_with(
            "CREATE TABLE events (
                id INTEGER PRIMARY KEY,
                patient_id INTEGER NOT NULL,
                notes TEXT DEFAULT 'none'
            );
            CREATE INDEX idx_events_patient ON events (patient_id);",
        );
        let snapshot = SchemaSnapshot::capture(&conn).unwrap();
        let table = snapshot.table("events").unwrap();

        let patient_id = table.columns.iter().find(|c| c.name == "patient_id").unwrap();
        assert!(patient_id.notnull);
        assert_eq!(patient_id.decl_type, "INTEGER");

        let notes = table.columns.iter().find(|c| c.name == "notes").unwrap();
        assert_eq!(notes.default_value.as_deref(), Some("'none'"));

        assert_eq!(table.indexes.len(), 1);
        assert_eq!(table.indexes[0].name, "idx_events_patient");
        assert_eq!(table.indexes[0].columns, vec!["patient_id"]);
        assert!(!table.indexes[0].unique);
    }

    #[test]
    fn test_diff_reports_every_variant() {
        let old = SchemaSnapshot::capture(&conn_with(
            "CREATE TABLE gone (id INTEGER);
             CREATE TABLE events (
                 id INTEGER,
                 removed TEXT,
                 retyped INTEGER
             );
             CREATE INDEX idx_old ON events (removed);",
        ))
        .unwrap();
        let new = SchemaSnapshot::capture(&conn_with(
            "CREATE TABLE added (id INTEGER);
             CREATE TABLE events (
                 id INTEGER,
                 retyped TEXT,
                 fresh TEXT
             );
             CREATE INDEX idx_new ON events (fresh);",
        ))
        .unwrap();

        let differences = diff(&old, &new);
        assert!(differences.contains(&SchemaDifference::TableAdded {
            table: "added".into()
        }));
        assert!(differences.contains(&SchemaDifference::TableRemoved {
            table: "gone".into()
        }));
        assert!(differences.contains(&SchemaDifference::ColumnAdded {
            table: "events".into(),
            column: "fresh".into()
        }));
        assert!(differences.contains(&SchemaDifference::ColumnRemoved {
            table: "events".into(),
            column: "removed".into()
        }));
        assert!(differences.contains(&SchemaDifference::ColumnTypeChanged {
            table: "events".into(),
            column: "retyped".into(),
            old_type: "INTEGER".into(),
            new_type: "TEXT".into()
        }));
        assert!(differences.contains(&SchemaDifference::IndexAdded {
            table: "events".into(),
            index: "idx_new".into()
        }));
        assert!(differences.contains(&SchemaDifference::IndexRemoved {
            table: "events".into(),
            index: "idx_old".into()
        }));
    }

    #[test]
    fn test_diff_identical_is_empty() {
        let sql = "CREATE TABLE events (id INTEGER, notes TEXT);
                   CREATE INDEX idx_events ON events (id);";
        let a = SchemaSnapshot::capture(&conn_with(sql)).unwrap();
        let b = SchemaSnapshot::capture(&conn_with(sql)).unwrap();
        assert!(diff(&a, &b).is_empty());
    }

    #[test]
    fn test_snapshot_json_roundtrip() {
        let snapshot = SchemaSnapshot::capture(&conn_with(
            "CREATE TABLE facilities (id INTEGER PRIMARY KEY, name TEXT NOT NULL);",
        ))
        .unwrap();
        let json = snapshot.to_json().unwrap();
        let restored = SchemaSnapshot::from_json(&json).unwrap();
        assert_eq!(snapshot, restored);
        assert!(diff(&snapshot, &restored).is_empty());
    }
}
