//! Migration catalog and path resolver for ClinicTrack
//!
//! The catalog is the authoritative, build-time list of every migration edge
//! the application knows about, including direct "skip" edges spanning
//! several versions. Path resolution is a breadth-first search over the edge
//! graph: fewest edges wins, ties broken by declaration order. A degraded
//! range-based fallback exists for incomplete catalogs and is logged loudly,
//! because it can produce an incorrect or partial path.

use crate::steps::{SchemaStep, TableRebuild};
use rusqlite::Connection;
use std::collections::{HashMap, HashSet, VecDeque};
use thiserror::Error;
use tracing::warn;

/// Schema version the current release targets.
pub const CURRENT_SCHEMA_VERSION: u32 = 5;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("no migration path from version {from} to version {to}")]
    PathNotFound { from: u32, to: u32 },
}

/// One immutable migration edge: apply `steps` to move a version-`from`
/// database to version `to`.
#[derive(Debug, Clone)]
pub struct MigrationEdge {
    pub from: u32,
    pub to: u32,
    pub steps: Vec<SchemaStep>,
}

impl MigrationEdge {
    pub fn new(from: u32, to: u32, steps: Vec<SchemaStep>) -> Self {
        Self { from, to, steps }
    }

    /// Record value written under the `last_migration` meta key.
    pub fn name(&self) -> String {
        format!("{}_to_{}", self.from, self.to)
    }
}

/// Fixed, versioned list of migration edges. Never modified at runtime.
pub struct MigrationCatalog {
    edges: Vec<MigrationEdge>,
}

impl MigrationCatalog {
    /// Build a catalog from a fixed edge list.
    ///
    /// Two edges with the same endpoints are a programming error in the
    /// catalog definition.
    pub fn new(edges: Vec<MigrationEdge>) -> Self {
        let mut seen = HashSet::new();
        for edge in &edges {
            assert!(
                seen.insert((edge.from, edge.to)),
                "duplicate migration edge {}",
                edge.name()
            );
        }
        Self { edges }
    }

    /// The catalog shipped with this release.
    pub fn clinictrack() -> Self {
        Self::new(vec![
            edge_1_to_2(),
            edge_2_to_3(),
            edge_1_to_3(),
            edge_3_to_4(),
            edge_4_to_5(),
        ])
    }

    pub fn edges(&self) -> &[MigrationEdge] {
        &self.edges
    }

    /// Resolve the ordered edge list carrying `current` to `target`.
    ///
    /// Fresh installs (version 0) and up-to-date databases need no
    /// migrations. A direct edge is preferred over any multi-step path.
    /// An edge only applies from a version it names exactly.
    pub fn migrations_to_run(
        &self,
        current: u32,
        target: u32,
    ) -> Result<Vec<&MigrationEdge>, ResolveError> {
        if current == 0 || current == target {
            return Ok(Vec::new());
        }

        if let Some(direct) = self
            .edges
            .iter()
            .find(|e| e.from == current && e.to == target)
        {
            return Ok(vec![direct]);
        }

        if let Some(path) = self.shortest_path(current, target) {
            return Ok(path);
        }

        // Degraded fallback for an incomplete catalog: take every edge inside
        // the version range, ordered by start version. This can be wrong,
        // hence the warning.
        let fallback = self.fallback_path(current, target);
        if fallback.is_empty() {
            return Err(ResolveError::PathNotFound {
                from: current,
                to: target,
            });
        }
        warn!(
            "no exact migration path from {} to {}; falling back to {} range-selected edges",
            current,
            target,
            fallback.len()
        );
        Ok(fallback)
    }

    /// BFS over the version graph; fewest edges, declaration order breaks ties.
    fn shortest_path(&self, current: u32, target: u32) -> Option<Vec<&MigrationEdge>> {
        let mut adjacency: HashMap<u32, Vec<usize>> = HashMap::new();
        for (i, edge) in self.edges.iter().enumerate() {
            adjacency.entry(edge.from).or_default().push(i);
        }

        let mut queue = VecDeque::from([current]);
        let mut visited = HashSet::from([current]);
        let mut arrived_by: HashMap<u32, usize> = HashMap::new();

        while let Some(version) = queue.pop_front() {
            if version == target {
                let mut path = Vec::new();
                let mut at = target;
                while at != current {
                    let edge_index = arrived_by[&at];
                    path.push(&self.edges[edge_index]);
                    at = self.edges[edge_index].from;
                }
                path.reverse();
                return Some(path);
            }
            for &edge_index in adjacency.get(&version).into_iter().flatten() {
                let next = self.edges[edge_index].to;
                if visited.insert(next) {
                    arrived_by.insert(next, edge_index);
                    queue.push_back(next);
                }
            }
        }
        None
    }

    fn fallback_path(&self, current: u32, target: u32) -> Vec<&MigrationEdge> {
        let mut edges: Vec<&MigrationEdge> = self
            .edges
            .iter()
            .filter(|e| e.from >= current && e.to <= target)
            .collect();
        edges.sort_by_key(|e| e.from);
        edges
    }
}

// ============================================================================
// ClinicTrack schema
// ============================================================================
//
// The CREATE statements for the current shape are shared between the edges
// and `create_fresh` so a migrated database and a fresh install end up
// structurally identical.

const CREATE_PATIENTS_CURRENT: &str = "CREATE TABLE IF NOT EXISTS patients (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    full_name TEXT NOT NULL,
    identifier TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL,
    date_of_birth TEXT
);";

const CREATE_FACILITIES: &str = "CREATE TABLE IF NOT EXISTS facilities (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    region TEXT,
    created_at TEXT NOT NULL
);";

const CREATE_DIAGNOSTIC_CODES: &str = "CREATE TABLE IF NOT EXISTS diagnostic_codes (
    code TEXT PRIMARY KEY,
    description TEXT NOT NULL,
    coding_system TEXT NOT NULL DEFAULT 'ICD-10'
);";

const CREATE_EVENTS_CURRENT: &str = "CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    patient_id INTEGER NOT NULL REFERENCES patients(id) ON DELETE CASCADE,
    event_type TEXT NOT NULL,
    event_date TEXT NOT NULL,
    notes TEXT,
    confirmed_status INTEGER,
    created_at TEXT NOT NULL,
    facility_id INTEGER REFERENCES facilities(id),
    diagnostic_code TEXT REFERENCES diagnostic_codes(code)
);";

const IDX_EVENTS_FACILITY: &str =
    "CREATE INDEX IF NOT EXISTS idx_events_facility ON \"events\" (facility_id);";
const IDX_EVENTS_PATIENT: &str =
    "CREATE INDEX IF NOT EXISTS idx_events_patient ON \"events\" (patient_id);";
const IDX_EVENTS_CODE: &str =
    "CREATE INDEX IF NOT EXISTS idx_events_code ON \"events\" (diagnostic_code);";

/// Version 2 introduced facilities and tied events to them.
fn edge_1_to_2() -> MigrationEdge {
    MigrationEdge::new(1, 2, steps_1_to_2())
}

fn steps_1_to_2() -> Vec<SchemaStep> {
    vec![
        SchemaStep::CreateTable {
            name: "facilities",
            sql: CREATE_FACILITIES,
        },
        SchemaStep::AddColumn {
            table: "events",
            column: "facility_id",
            decl: "INTEGER REFERENCES facilities(id)",
        },
        SchemaStep::CreateIndex {
            name: "idx_events_facility",
            table: "events",
            columns: &["facility_id"],
            unique: false,
        },
    ]
}

/// Version 3 added the patient birth date and the per-patient event index.
fn edge_2_to_3() -> MigrationEdge {
    MigrationEdge::new(2, 3, steps_2_to_3())
}

fn steps_2_to_3() -> Vec<SchemaStep> {
    vec![
        SchemaStep::AddColumn {
            table: "patients",
            column: "date_of_birth",
            decl: "TEXT",
        },
        SchemaStep::CreateIndex {
            name: "idx_events_patient",
            table: "events",
            columns: &["patient_id"],
            unique: false,
        },
    ]
}

/// Direct skip edge, semantically the composition of 1->2 and 2->3. Kept so
/// databases two releases behind migrate in a single transaction each run.
fn edge_1_to_3() -> MigrationEdge {
    let mut steps = steps_1_to_2();
    steps.extend(steps_2_to_3());
    MigrationEdge::new(1, 3, steps)
}

/// Version 4 introduced the diagnostic code catalog.
fn edge_3_to_4() -> MigrationEdge {
    MigrationEdge::new(
        3,
        4,
        vec![
            SchemaStep::CreateTable {
                name: "diagnostic_codes",
                sql: CREATE_DIAGNOSTIC_CODES,
            },
            SchemaStep::AddColumn {
                table: "events",
                column: "diagnostic_code",
                decl: "TEXT REFERENCES diagnostic_codes(code)",
            },
            SchemaStep::CreateIndex {
                name: "idx_events_code",
                table: "events",
                columns: &["diagnostic_code"],
                unique: false,
            },
        ],
    )
}

/// Version 5 replaced the `is_confirmed` integer-boolean with a nullable
/// `confirmed_status` (1 stays 1, anything else becomes NULL / "unknown").
/// SQLite cannot change a column's shape in place, so the table is rebuilt.
fn edge_4_to_5() -> MigrationEdge {
    MigrationEdge::new(
        4,
        5,
        vec![SchemaStep::RebuildTable(TableRebuild {
            table: "events",
            create_sql: CREATE_EVENTS_CURRENT,
            column_map: &[
                ("id", "id"),
                ("patient_id", "patient_id"),
                ("event_type", "event_type"),
                ("event_date", "event_date"),
                ("notes", "notes"),
                (
                    "confirmed_status",
                    "CASE WHEN is_confirmed = 1 THEN 1 ELSE NULL END",
                ),
                ("created_at", "created_at"),
                ("facility_id", "facility_id"),
                ("diagnostic_code", "diagnostic_code"),
            ],
            indexes: &[IDX_EVENTS_FACILITY, IDX_EVENTS_PATIENT, IDX_EVENTS_CODE],
            guard_column: "confirmed_status",
        })],
    )
}

/// Create the full current schema from scratch. Fresh installs take this
/// path and never run migrations.
pub fn create_fresh(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(CREATE_PATIENTS_CURRENT)?;
    conn.execute_batch(CREATE_FACILITIES)?;
    conn.execute_batch(CREATE_DIAGNOSTIC_CODES)?;
    conn.execute_batch(CREATE_EVENTS_CURRENT)?;
    conn.execute_batch(IDX_EVENTS_FACILITY)?;
    conn.execute_batch(IDX_EVENTS_PATIENT)?;
    conn.execute_batch(IDX_EVENTS_CODE)?;
    Ok(())
}
