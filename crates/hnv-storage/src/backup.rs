use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tracing::{info, warn};
use uuid::Uuid;

use crate::sha256_hex;

const BACKUP_PREFIX: &str = "hackernews_";
const BACKUP_SUFFIX: &str = ".db";
const STAMP_FORMAT: &str = "%Y%m%d%H%M%S";

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("store file not found at {0}")]
    MissingStore(PathBuf),
    #[error("{action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn io_err(action: &'static str, path: &Path) -> impl FnOnce(std::io::Error) -> BackupError {
    let path = path.to_path_buf();
    move |source| BackupError::Io {
        action,
        path,
        source,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupRecord {
    pub filename: String,
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
    /// Only computed for freshly created backups.
    pub sha256: Option<String>,
}

pub fn backup_filename(at: DateTime<Utc>) -> String {
    format!("{BACKUP_PREFIX}{}{BACKUP_SUFFIX}", at.format(STAMP_FORMAT))
}

fn parse_backup_filename(name: &str) -> Option<DateTime<Utc>> {
    let stamp = name.strip_prefix(BACKUP_PREFIX)?.strip_suffix(BACKUP_SUFFIX)?;
    NaiveDateTime::parse_from_str(stamp, STAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Copy the store file into `backup_dir` under a timestamped name.
///
/// The copy is written to a temp file first and renamed into place, so a
/// half-written backup never carries a `hackernews_*.db` name.
pub async fn create_backup(
    db_path: &Path,
    backup_dir: &Path,
    now: DateTime<Utc>,
) -> Result<BackupRecord, BackupError> {
    if !fs::try_exists(db_path)
        .await
        .map_err(io_err("checking", db_path))?
    {
        return Err(BackupError::MissingStore(db_path.to_path_buf()));
    }

    fs::create_dir_all(backup_dir)
        .await
        .map_err(io_err("creating backup directory", backup_dir))?;

    let bytes = fs::read(db_path)
        .await
        .map_err(io_err("reading store file", db_path))?;
    let filename = backup_filename(now);
    let path = backup_dir.join(&filename);
    let temp_path = backup_dir.join(format!(".{}.tmp", Uuid::new_v4()));

    fs::write(&temp_path, &bytes)
        .await
        .map_err(io_err("writing temp backup", &temp_path))?;
    if let Err(err) = fs::rename(&temp_path, &path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(io_err("renaming backup into", &path)(err));
    }

    let record = BackupRecord {
        filename,
        path,
        created_at: now,
        size_bytes: bytes.len() as u64,
        sha256: Some(sha256_hex(&bytes)),
    };
    info!(path = %record.path.display(), size_bytes = record.size_bytes, "backup created");
    Ok(record)
}

/// Backups in `backup_dir`, newest first. Files not matching the naming scheme are ignored.
pub async fn list_backups(backup_dir: &Path) -> Result<Vec<BackupRecord>, BackupError> {
    if !fs::try_exists(backup_dir)
        .await
        .map_err(io_err("checking", backup_dir))?
    {
        return Ok(Vec::new());
    }

    let mut entries = fs::read_dir(backup_dir)
        .await
        .map_err(io_err("listing", backup_dir))?;
    let mut backups = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(io_err("listing", backup_dir))?
    {
        let filename = entry.file_name().to_string_lossy().into_owned();
        let Some(created_at) = parse_backup_filename(&filename) else {
            continue;
        };
        let metadata = match entry.metadata().await {
            Ok(metadata) => metadata,
            Err(err) => {
                warn!(file = %filename, error = %err, "skipping unreadable backup");
                continue;
            }
        };
        backups.push(BackupRecord {
            filename,
            path: entry.path(),
            created_at,
            size_bytes: metadata.len(),
            sha256: None,
        });
    }

    backups.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.filename.cmp(&a.filename)));
    Ok(backups)
}

/// Delete all but the newest `keep` backups. Returns the removed records.
pub async fn cleanup_old_backups(
    backup_dir: &Path,
    keep: usize,
) -> Result<Vec<BackupRecord>, BackupError> {
    let backups = list_backups(backup_dir).await?;
    let mut removed = Vec::new();
    for old in backups.into_iter().skip(keep) {
        fs::remove_file(&old.path)
            .await
            .map_err(io_err("removing old backup", &old.path))?;
        info!(path = %old.path.display(), "removed old backup");
        removed.push(old);
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 3, minute, 0).single().unwrap()
    }

    #[test]
    fn filenames_round_trip_their_timestamp() {
        let name = backup_filename(at(7));
        assert_eq!(name, "hackernews_20260301030700.db");
        assert_eq!(parse_backup_filename(&name), Some(at(7)));
        assert_eq!(parse_backup_filename("hackernews_garbage.db"), None);
        assert_eq!(parse_backup_filename("notes.txt"), None);
    }

    #[tokio::test]
    async fn create_backup_copies_store_file() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("hackernews.db");
        std::fs::write(&db, b"sqlite bytes").unwrap();
        let backups = dir.path().join("backups");

        let record = create_backup(&db, &backups, at(0)).await.unwrap();
        assert_eq!(record.filename, "hackernews_20260301030000.db");
        assert_eq!(std::fs::read(&record.path).unwrap(), b"sqlite bytes");
        assert_eq!(record.size_bytes, 12);
        assert_eq!(record.sha256.as_deref(), Some(sha256_hex(b"sqlite bytes").as_str()));

        // no temp files left behind
        let names: Vec<_> = std::fs::read_dir(&backups)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![record.filename.clone()]);
    }

    #[tokio::test]
    async fn missing_store_is_reported() {
        let dir = tempdir().unwrap();
        let err = create_backup(&dir.path().join("absent.db"), dir.path(), at(0))
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::MissingStore(_)));
    }

    #[tokio::test]
    async fn retention_keeps_newest_backups() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("hackernews.db");
        std::fs::write(&db, b"x").unwrap();
        let backups = dir.path().join("backups");
        for minute in 0..5 {
            create_backup(&db, &backups, at(minute)).await.unwrap();
        }
        std::fs::write(backups.join("README"), b"not a backup").unwrap();

        let removed = cleanup_old_backups(&backups, 3).await.unwrap();
        assert_eq!(removed.len(), 2);

        let remaining: Vec<_> = list_backups(&backups)
            .await
            .unwrap()
            .into_iter()
            .map(|b| b.created_at)
            .collect();
        assert_eq!(remaining, vec![at(4), at(3), at(2)]);
        assert!(backups.join("README").exists());
    }

    #[tokio::test]
    async fn listing_a_missing_directory_is_empty() {
        let dir = tempdir().unwrap();
        assert!(list_backups(&dir.path().join("nope")).await.unwrap().is_empty());
    }
}
