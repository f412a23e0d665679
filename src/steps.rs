//! Migration step library for ClinicTrack
//!
//! Named schema-mutation primitives used by the migration catalog. Every
//! step is safe to re-run: `IF NOT EXISTS` where SQLite supports it, and an
//! explicit `pragma table_info` probe before `ALTER TABLE ADD COLUMN`. The
//! one heavyweight primitive is [`TableRebuild`], used for changes SQLite
//! cannot express as a simple ALTER (column type or encoding changes).

use rusqlite::Connection;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum StepError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("table rebuild of {table} failed ({source}); rollback also failed ({rollback})")]
    RebuildRollbackFailed {
        table: String,
        #[source]
        source: rusqlite::Error,
        rollback: rusqlite::Error,
    },
}

/// One idempotent schema-mutation primitive.
#[derive(Debug, Clone)]
pub enum SchemaStep {
    /// Run a `CREATE TABLE IF NOT EXISTS` statement.
    CreateTable {
        name: &'static str,
        sql: &'static str,
    },
    /// Add a column unless it already exists.
    AddColumn {
        table: &'static str,
        column: &'static str,
        decl: &'static str,
    },
    /// Create an index unless it already exists.
    CreateIndex {
        name: &'static str,
        table: &'static str,
        columns: &'static [&'static str],
        unique: bool,
    },
    /// Rebuild a table through rename-create-copy-drop.
    RebuildTable(TableRebuild),
}

impl SchemaStep {
    /// Apply the step against a live connection.
    pub fn apply(&self, conn: &Connection) -> Result<(), StepError> {
        match self {
            Self::CreateTable { name, sql } => {
                conn.execute_batch(sql)?;
                debug!("ensured table {}", name);
                Ok(())
            }
            Self::AddColumn {
                table,
                column,
                decl,
            } => {
                if column_exists(conn, table, column)? {
                    debug!("column {}.{} already present", table, column);
                    return Ok(());
                }
                conn.execute_batch(&format!(
                    "ALTER TABLE \"{}\" ADD COLUMN {} {};",
                    table, column, decl
                ))?;
                info!("added column {}.{}", table, column);
                Ok(())
            }
            Self::CreateIndex {
                name,
                table,
                columns,
                unique,
            } => {
                let keyword = if *unique { "UNIQUE " } else { "" };
                conn.execute_batch(&format!(
                    "CREATE {}INDEX IF NOT EXISTS {} ON \"{}\" ({});",
                    keyword,
                    name,
                    table,
                    columns.join(", ")
                ))?;
                debug!("ensured index {}", name);
                Ok(())
            }
            Self::RebuildTable(rebuild) => rebuild.apply(conn),
        }
    }

    /// Short description for logs.
    pub fn describe(&self) -> String {
        match self {
            Self::CreateTable { name, .. } => format!("create table {}", name),
            Self::AddColumn { table, column, .. } => format!("add column {}.{}", table, column),
            Self::CreateIndex { name, .. } => format!("create index {}", name),
            Self::RebuildTable(r) => format!("rebuild table {}", r.table),
        }
    }
}

/// Rename-create-copy-drop rebuild of one table.
///
/// Used when the engine cannot alter a column in place. The copy transforms
/// values column-by-column through the `column_map` SELECT expressions. On
/// failure a best-effort compensation drops the half-built table and renames
/// the original back; a compensation failure is surfaced together with the
/// original failure, never swallowed.
#[derive(Debug, Clone)]
pub struct TableRebuild {
    pub table: &'static str,
    /// `CREATE TABLE IF NOT EXISTS` statement producing the final shape.
    pub create_sql: &'static str,
    /// (new column, SELECT expression over the old table) pairs.
    pub column_map: &'static [(&'static str, &'static str)],
    /// Index statements to recreate after the copy.
    pub indexes: &'static [&'static str],
    /// Column that only exists in the final shape; if present, the rebuild
    /// already ran and is a no-op.
    pub guard_column: &'static str,
}

impl TableRebuild {
    pub fn apply(&self, conn: &Connection) -> Result<(), StepError> {
        if column_exists(conn, self.table, self.guard_column)? {
            debug!("table {} already rebuilt, skipping", self.table);
            return Ok(());
        }

        let temp = format!("{}_rebuild_old", self.table);
        conn.execute_batch(&format!(
            "ALTER TABLE \"{}\" RENAME TO \"{}\";",
            self.table, temp
        ))?;

        match self.copy_into_new(conn, &temp) {
            Ok(rows) => {
                info!("rebuilt table {} ({} rows copied)", self.table, rows);
                Ok(())
            }
            Err(source) => {
                error!(
                    "table rebuild of {} failed: {}; attempting rollback",
                    self.table, source
                );
                match self.roll_back(conn, &temp) {
                    Ok(()) => {
                        warn!("rolled back partial rebuild of {}", self.table);
                        Err(StepError::Sqlite(source))
                    }
                    Err(rollback) => {
                        error!(
                            "rollback of {} rebuild failed: {}",
                            self.table, rollback
                        );
                        Err(StepError::RebuildRollbackFailed {
                            table: self.table.to_string(),
                            source,
                            rollback,
                        })
                    }
                }
            }
        }
    }

    fn copy_into_new(&self, conn: &Connection, temp: &str) -> Result<usize, rusqlite::Error> {
        conn.execute_batch(self.create_sql)?;

        let columns: Vec<&str> = self.column_map.iter().map(|(c, _)| *c).collect();
        let exprs: Vec<&str> = self.column_map.iter().map(|(_, e)| *e).collect();
        let rows = conn.execute(
            &format!(
                "INSERT INTO \"{}\" ({}) SELECT {} FROM \"{}\"",
                self.table,
                columns.join(", "),
                exprs.join(", "),
                temp
            ),
            [],
        )?;

        conn.execute_batch(&format!("DROP TABLE \"{}\";", temp))?;
        for statement in self.indexes {
            conn.execute_batch(statement)?;
        }
        Ok(rows)
    }

    fn roll_back(&self, conn: &Connection, temp: &str) -> Result<(), rusqlite::Error> {
        conn.execute_batch(&format!("DROP TABLE IF EXISTS \"{}\";", self.table))?;
        conn.execute_batch(&format!(
            "ALTER TABLE \"{}\" RENAME TO \"{}\";",
            temp, self.table
        ))
    }
}

/// Probe `pragma table_info` for a column.
pub fn column_exists(
    conn: &Connection,
    table: &str,
    column: &str,
) -> Result<bool, rusqlite::Error> {
    let exists = conn
        .prepare(&format!("PRAGMA table_info(\"{}\")", table))?
        .query_map([], |row| {
            let name: String = row.get(1)?;
            Ok(name)
        })?
        .filter_map(|r| r.ok())
        .any(|name| name == column);
    Ok(exists)
}
