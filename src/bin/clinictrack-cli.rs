//! ClinicTrack database maintenance CLI
//!
//! Command-line access to the migration, integrity, and backup subsystem:
//!
//!   clinictrack-cli migrate [--db <path>]
//!   clinictrack-cli check [--db <path>]
//!   clinictrack-cli backup [--db <path>]
//!   clinictrack-cli restore <archive> [--db <path>]
//!   clinictrack-cli backups list [--db <path>]
//!   clinictrack-cli backups delete <file> [--db <path>]
//!   clinictrack-cli schema dump [--db <path>]

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{anyhow, bail, Context};
use clinictrack_db::backup::BackupManager;
use clinictrack_db::db::{self, DbError, DbHandle};
use clinictrack_db::integrity;
use clinictrack_db::schema::SchemaSnapshot;
use clinictrack_db::{executor, CURRENT_SCHEMA_VERSION};

#[derive(Debug)]
enum Command {
    Migrate,
    Check,
    Backup,
    Restore { archive: PathBuf },
    BackupsList,
    BackupsDelete { file: String },
    SchemaDump,
    Help,
    Version,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut args: Vec<String> = env::args().skip(1).collect();
    let db_path = match take_db_flag(&mut args) {
        Ok(Some(path)) => path,
        Ok(None) => db::get_db_path(),
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };

    match parse_args(&args) {
        Ok(cmd) => match run_command(cmd, &db_path) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("Error: {e:#}");
                ExitCode::FAILURE
            }
        },
        Err(e) => {
            eprintln!("Error: {e}");
            print_usage();
            ExitCode::FAILURE
        }
    }
}

fn take_db_flag(args: &mut Vec<String>) -> anyhow::Result<Option<PathBuf>> {
    if let Some(pos) = args.iter().position(|a| a == "--db") {
        if pos + 1 >= args.len() {
            bail!("--db requires a path argument");
        }
        args.remove(pos);
        let value = args.remove(pos);
        return Ok(Some(PathBuf::from(value)));
    }
    Ok(None)
}

fn parse_args(args: &[String]) -> anyhow::Result<Command> {
    let mut it = args.iter().map(String::as_str);
    let cmd = match it.next() {
        None | Some("help") | Some("--help") | Some("-h") => Command::Help,
        Some("version") | Some("--version") => Command::Version,
        Some("migrate") => Command::Migrate,
        Some("check") => Command::Check,
        Some("backup") => Command::Backup,
        Some("restore") => {
            let archive = it
                .next()
                .ok_or_else(|| anyhow!("restore requires an archive path"))?;
            Command::Restore {
                archive: PathBuf::from(archive),
            }
        }
        Some("backups") => match it.next() {
            Some("list") | None => Command::BackupsList,
            Some("delete") => {
                let file = it
                    .next()
                    .ok_or_else(|| anyhow!("backups delete requires a file name"))?;
                Command::BackupsDelete {
                    file: file.to_string(),
                }
            }
            Some(other) => bail!("unknown backups subcommand: {other}"),
        },
        Some("schema") => match it.next() {
            Some("dump") | None => Command::SchemaDump,
            Some(other) => bail!("unknown schema subcommand: {other}"),
        },
        Some(other) => bail!("unknown command: {other}"),
    };
    Ok(cmd)
}

fn run_command(cmd: Command, db_path: &PathBuf) -> anyhow::Result<()> {
    match cmd {
        Command::Help => {
            print_usage();
            Ok(())
        }
        Command::Version => {
            println!(
                "clinictrack-cli {} (schema version {})",
                env!("CARGO_PKG_VERSION"),
                CURRENT_SCHEMA_VERSION
            );
            Ok(())
        }
        Command::Migrate => {
            let handle = DbHandle::open(db_path).context("open database")?;
            let outcome = handle.with(executor::prepare_database)?;
            if outcome.applied.is_empty() {
                println!(
                    "Schema up to date at version {}",
                    outcome.to_version
                );
            } else {
                println!(
                    "Migrated from version {} to {}: {}",
                    outcome.from_version,
                    outcome.to_version,
                    outcome.applied.join(", ")
                );
            }
            if !outcome.integrity_ok {
                bail!("integrity verification failed after migration; consider restoring a backup");
            }
            Ok(())
        }
        Command::Check => {
            let handle = DbHandle::open(db_path).context("open database")?;
            handle.with(|db| {
                let outcome = integrity::check_integrity(db.conn());
                println!("Integrity: {:?}", outcome);
                let fk = integrity::check_foreign_keys(db.conn());
                if fk.is_empty() {
                    println!("Foreign keys: ok");
                } else {
                    println!("Foreign key violations:");
                    for violation in &fk {
                        println!(
                            "  {} (rowid {:?}) -> {}",
                            violation.table, violation.rowid, violation.parent
                        );
                    }
                }
                for problem in integrity::check_index_coverage(db.conn()) {
                    println!("Index problem: {problem}");
                }
                Ok(())
            })?;
            Ok(())
        }
        Command::Backup => {
            let handle = DbHandle::open(db_path).context("open database")?;
            let manager = manager_for(db_path);
            let info = manager.create_backup(&handle)?;
            println!("Created {} ({} bytes)", info.file_name, info.size_bytes);
            Ok(())
        }
        Command::Restore { archive } => {
            let handle = DbHandle::open(db_path).context("open database")?;
            let manager = manager_for(db_path);
            manager.restore_backup(&handle, &archive)?;
            // The archive may predate the current release.
            let outcome = handle.with(executor::prepare_database)?;
            println!(
                "Restored from {:?} (schema version {})",
                archive, outcome.to_version
            );
            Ok(())
        }
        Command::BackupsList => {
            let manager = manager_for(db_path);
            let archives = manager.list_backups()?;
            if archives.is_empty() {
                println!("No backups found");
            }
            for info in archives {
                println!(
                    "{}  {}  {} bytes",
                    info.file_name,
                    info.modified.to_rfc3339(),
                    info.size_bytes
                );
            }
            Ok(())
        }
        Command::BackupsDelete { file } => {
            let manager = manager_for(db_path);
            let archives = manager.list_backups()?;
            let target = archives
                .iter()
                .find(|a| a.file_name == file)
                .ok_or_else(|| anyhow!("no backup named {file}"))?;
            manager.delete_backup(&target.path)?;
            println!("Deleted {file}");
            Ok(())
        }
        Command::SchemaDump => {
            let handle = DbHandle::open(db_path).context("open database")?;
            let snapshot =
                handle.with(|db| SchemaSnapshot::capture(db.conn()).map_err(DbError::from))?;
            let json = snapshot.to_json().context("serialize schema snapshot")?;
            println!("{json}");
            Ok(())
        }
    }
}

fn manager_for(db_path: &PathBuf) -> BackupManager {
    let backups_dir = db_path
        .parent()
        .map(|p| p.join("backups"))
        .unwrap_or_else(db::get_backups_dir);
    BackupManager::new(db_path.clone(), backups_dir)
        .with_preferences_dir(db::get_preferences_dir())
}

fn print_usage() {
    println!(
        "clinictrack-cli - ClinicTrack database maintenance

USAGE:
    clinictrack-cli <command> [--db <path>]

COMMANDS:
    migrate                 Apply pending schema migrations and verify
    check                   Run integrity, foreign key, and index checks
    backup                  Create a timestamped backup archive
    restore <archive>       Restore from a backup archive
    backups list            List available backup archives
    backups delete <file>   Delete one backup archive
    schema dump             Print the live schema as JSON
    help                    Show this help
    version                 Show version information"
    );
}
