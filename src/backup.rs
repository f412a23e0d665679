//! Backup and restore for the ClinicTrack database
//!
//! Creates timestamped ZIP snapshots of the primary database file, its
//! write-ahead and shared-memory companions (when present), and auxiliary
//! preference files. Restores unpack into an isolated temporary directory
//! first, then swap the extracted files over the live ones and validate the
//! result with the integrity checker. Whatever happens, the live connection
//! is reopened before returning so the application is never left without a
//! usable handle.

use crate::db::{DbError, DbHandle};
use crate::integrity;
use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{error, info, warn};
use zip::write::SimpleFileOptions;
use zip::{ZipArchive, ZipWriter};

/// Archives kept by the retention policy.
pub const DEFAULT_RETENTION: usize = 5;

/// Archive entry directory for the database files.
const DB_ENTRY_DIR: &str = "database";
/// Archive entry directory for auxiliary preference files.
const PREFS_ENTRY_DIR: &str = "preferences";

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("Database error: {0}")]
    Database(#[from] DbError),
    #[error("archive is missing the primary database entry: {0}")]
    MissingEntry(String),
    #[error("restored database failed integrity verification: {0}")]
    CorruptAfterRestore(String),
}

/// Handle to one archive on disk.
#[derive(Debug, Clone, Serialize)]
pub struct BackupInfo {
    pub path: PathBuf,
    pub file_name: String,
    pub modified: DateTime<Utc>,
    pub size_bytes: u64,
}

/// One-shot backup/restore operations against a single store.
///
/// Operations never run concurrently with each other: each closes the live
/// connection before touching files and reopens it afterwards, and the
/// [`DbHandle`] lock serializes everything else in between.
pub struct BackupManager {
    db_path: PathBuf,
    backups_dir: PathBuf,
    prefs_dir: Option<PathBuf>,
    prefix: String,
    retention: usize,
}

impl BackupManager {
    pub fn new(db_path: PathBuf, backups_dir: PathBuf) -> Self {
        Self {
            db_path,
            backups_dir,
            prefs_dir: None,
            prefix: "clinictrack_backup".to_string(),
            retention: DEFAULT_RETENTION,
        }
    }

    /// Include auxiliary preference files from `dir` in archives.
    pub fn with_preferences_dir(mut self, dir: PathBuf) -> Self {
        self.prefs_dir = Some(dir);
        self
    }

    pub fn with_retention(mut self, keep: usize) -> Self {
        self.retention = keep;
        self
    }

    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.prefix = prefix.to_string();
        self
    }

    /// Create a timestamped archive of the store and prune old archives.
    ///
    /// A live connection is checkpointed and closed first so the files on
    /// disk are quiescent, and reopened in a guaranteed step whatever the
    /// outcome. A handle that was already closed on entry stays closed.
    pub fn create_backup(&self, handle: &DbHandle) -> Result<BackupInfo, BackupError> {
        let was_open = handle.is_open();
        if was_open {
            handle.with(|db| db.checkpoint())?;
            handle.close();
        }

        let outcome: Result<BackupInfo, BackupError> = (|| {
            let info = self.write_archive()?;
            self.prune();
            Ok(info)
        })();

        // Reopening a connection the caller never had would create an empty
        // database file as a side effect.
        let reopened = if was_open {
            handle.reopen(&self.db_path)
        } else {
            Ok(())
        };
        match (outcome, reopened) {
            (Ok(info), Ok(())) => {
                info!("backup created: {:?}", info.path);
                Ok(info)
            }
            (Ok(_), Err(e)) => Err(e.into()),
            (Err(e), reopened) => {
                if let Err(reopen_err) = reopened {
                    error!("failed to reopen database after backup failure: {}", reopen_err);
                }
                Err(e)
            }
        }
    }

    fn write_archive(&self) -> Result<BackupInfo, BackupError> {
        fs::create_dir_all(&self.backups_dir)?;

        // Two backups within the same second get a sequence suffix instead
        // of truncating the earlier archive.
        let stamp = Local::now().format("%Y%m%d_%H%M%S").to_string();
        let mut file_name = format!("{}_{}.zip", self.prefix, stamp);
        let mut archive_path = self.backups_dir.join(&file_name);
        let mut sequence = 1;
        let file = loop {
            match File::options()
                .write(true)
                .create_new(true)
                .open(&archive_path)
            {
                Ok(file) => break file,
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists && sequence < 1000 => {
                    sequence += 1;
                    file_name = format!("{}_{}_{}.zip", self.prefix, stamp, sequence);
                    archive_path = self.backups_dir.join(&file_name);
                }
                Err(e) => return Err(e.into()),
            }
        };
        let mut zip = ZipWriter::new(file);
        let options =
            SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

        let db_file_name = file_name_of(&self.db_path)?;
        add_file(&mut zip, &self.db_path, &format!("{}/{}", DB_ENTRY_DIR, db_file_name), options)?;

        // WAL and shared-memory companions travel with the primary file.
        // Their absence is normal (no open writer, or rollback journal mode).
        for suffix in ["-wal", "-shm"] {
            let companion_path = companion(&self.db_path, suffix);
            if companion_path.exists() {
                add_file(
                    &mut zip,
                    &companion_path,
                    &format!("{}/{}{}", DB_ENTRY_DIR, db_file_name, suffix),
                    options,
                )?;
            }
        }

        if let Some(prefs_dir) = &self.prefs_dir {
            if prefs_dir.is_dir() {
                for entry in fs::read_dir(prefs_dir)? {
                    let path = entry?.path();
                    if path.extension().is_some_and(|ext| ext == "xml") {
                        let name = file_name_of(&path)?;
                        add_file(
                            &mut zip,
                            &path,
                            &format!("{}/{}", PREFS_ENTRY_DIR, name),
                            options,
                        )?;
                    }
                }
            }
        }

        zip.finish()?;
        let metadata = fs::metadata(&archive_path)?;
        Ok(BackupInfo {
            path: archive_path,
            file_name,
            modified: metadata.modified().map(DateTime::from).unwrap_or_else(|_| Utc::now()),
            size_bytes: metadata.len(),
        })
    }

    /// Delete the oldest archives beyond the retention count.
    ///
    /// One failed delete does not abort pruning of the rest.
    pub fn prune(&self) {
        let archives = match self.list_backups() {
            Ok(archives) => archives,
            Err(e) => {
                warn!("could not enumerate backups for pruning: {}", e);
                return;
            }
        };
        for stale in archives.iter().skip(self.retention) {
            match fs::remove_file(&stale.path) {
                Ok(()) => info!("pruned old backup {:?}", stale.path),
                Err(e) => warn!("failed to prune backup {:?}: {}", stale.path, e),
            }
        }
    }

    /// Archives in the backup location, newest first by modification time.
    pub fn list_backups(&self) -> Result<Vec<BackupInfo>, BackupError> {
        if !self.backups_dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut archives = Vec::new();
        for entry in fs::read_dir(&self.backups_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !self.is_archive_name(&name) {
                continue;
            }
            let metadata = entry.metadata()?;
            archives.push(BackupInfo {
                path: entry.path(),
                file_name: name,
                modified: metadata.modified().map(DateTime::from).unwrap_or_else(|_| Utc::now()),
                size_bytes: metadata.len(),
            });
        }
        archives.sort_by(|a, b| {
            b.modified
                .cmp(&a.modified)
                .then_with(|| b.file_name.cmp(&a.file_name))
        });
        Ok(archives)
    }

    /// Remove one archive. Failure is reported, not retried.
    pub fn delete_backup(&self, archive: &Path) -> Result<(), BackupError> {
        fs::remove_file(archive).map_err(|e| {
            error!("failed to delete backup {:?}: {}", archive, e);
            BackupError::Io(e)
        })
    }

    /// Restore the store from an archive.
    ///
    /// Extraction happens in an isolated temporary directory, never directly
    /// over the live files; only after the archive proves to contain the
    /// primary entry are the live files overwritten. The restored store is
    /// then reopened and verified: bytes that copied fine but do not form a
    /// usable database report [`BackupError::CorruptAfterRestore`], so the
    /// caller can distinguish that from plain I/O failure and try an older
    /// archive.
    pub fn restore_backup(&self, handle: &DbHandle, archive: &Path) -> Result<(), BackupError> {
        let temp = tempfile::tempdir()?;
        self.extract_archive(archive, temp.path())?;

        let db_file_name = file_name_of(&self.db_path)?;
        let extracted_primary = temp.path().join(DB_ENTRY_DIR).join(&db_file_name);
        if !extracted_primary.is_file() {
            return Err(BackupError::MissingEntry(format!(
                "{}/{}",
                DB_ENTRY_DIR, db_file_name
            )));
        }

        handle.close();

        if let Err(e) = self.swap_files(temp.path(), &extracted_primary, &db_file_name) {
            // Put a connection back before surfacing the failure.
            if let Err(reopen_err) = handle.reopen(&self.db_path) {
                error!(
                    "failed to reopen database after restore failure: {}",
                    reopen_err
                );
            }
            return Err(e);
        }

        match handle.reopen(&self.db_path) {
            Ok(()) => {}
            // The copy succeeded but the bytes are not an openable database.
            Err(e) => return Err(BackupError::CorruptAfterRestore(e.to_string())),
        }
        let passed = handle.with(|db| Ok(integrity::verify_integrity(db.conn())))?;
        if !passed {
            return Err(BackupError::CorruptAfterRestore(
                "integrity check did not report ok".to_string(),
            ));
        }

        info!("restored database from {:?}", archive);
        Ok(())
    }

    fn extract_archive(&self, archive: &Path, dest: &Path) -> Result<(), BackupError> {
        let file = File::open(archive)?;
        let mut zip = ZipArchive::new(file)?;
        for i in 0..zip.len() {
            let mut entry = zip.by_index(i)?;
            let Some(relative) = entry.enclosed_name() else {
                warn!("skipping archive entry with unsafe path: {}", entry.name());
                continue;
            };
            if !relative.starts_with(DB_ENTRY_DIR) && !relative.starts_with(PREFS_ENTRY_DIR) {
                continue;
            }
            let target = dest.join(&relative);
            if entry.is_dir() {
                fs::create_dir_all(&target)?;
                continue;
            }
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut out = File::create(&target)?;
            io::copy(&mut entry, &mut out)?;
        }
        Ok(())
    }

    fn swap_files(
        &self,
        extracted_root: &Path,
        extracted_primary: &Path,
        db_file_name: &str,
    ) -> Result<(), BackupError> {
        fs::copy(extracted_primary, &self.db_path)?;

        for suffix in ["-wal", "-shm"] {
            let source = extracted_root
                .join(DB_ENTRY_DIR)
                .join(format!("{}{}", db_file_name, suffix));
            let target = companion(&self.db_path, suffix);
            if source.is_file() {
                fs::copy(&source, &target)?;
            } else if target.exists() {
                // A stale companion from the pre-restore store would be
                // interpreted against the restored file. Remove it.
                fs::remove_file(&target)?;
            }
        }

        if let Some(prefs_dir) = &self.prefs_dir {
            let extracted_prefs = extracted_root.join(PREFS_ENTRY_DIR);
            if extracted_prefs.is_dir() {
                fs::create_dir_all(prefs_dir)?;
                for entry in fs::read_dir(&extracted_prefs)? {
                    let path = entry?.path();
                    if path.is_file() {
                        fs::copy(&path, prefs_dir.join(file_name_of(&path)?))?;
                    }
                }
            }
        }
        Ok(())
    }

    /// `<prefix>_<yyyyMMdd>_<HHmmss>.zip`, with an optional `_<n>` sequence
    /// suffix for archives created within the same second.
    fn is_archive_name(&self, name: &str) -> bool {
        let Some(rest) = name
            .strip_prefix(self.prefix.as_str())
            .and_then(|r| r.strip_prefix('_'))
        else {
            return false;
        };
        let Some(rest) = rest.strip_suffix(".zip") else {
            return false;
        };
        if !rest.is_ascii() || rest.len() < 15 {
            return false;
        }
        let (stamp, sequence) = rest.split_at(15);
        let stamp_ok = stamp.as_bytes()[8] == b'_'
            && stamp
                .chars()
                .enumerate()
                .all(|(i, c)| i == 8 || c.is_ascii_digit());
        let sequence_ok = sequence.is_empty()
            || sequence
                .strip_prefix('_')
                .is_some_and(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()));
        stamp_ok && sequence_ok
    }
}

fn add_file(
    zip: &mut ZipWriter<File>,
    source: &Path,
    entry_name: &str,
    options: SimpleFileOptions,
) -> Result<(), BackupError> {
    let mut file = File::open(source)?;
    zip.start_file(entry_name, options)?;
    io::copy(&mut file, zip)?;
    Ok(())
}

/// Companion file path (`clinictrack.db` -> `clinictrack.db-wal`).
fn companion(db_path: &Path, suffix: &str) -> PathBuf {
    let mut name = db_path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

fn file_name_of(path: &Path) -> Result<String, io::Error> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))
}
