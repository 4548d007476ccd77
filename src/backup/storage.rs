//! Local backup folders of a site: listing, deletion and retention
//!
//! Each backup lives in `<site>/backups/<YYYYMMDD_HHMMSS>/` and holds a
//! compressed database dump (`<db>.sql.gz`), a compressed file archive
//! (`files.tar.gz`), or both. Folders whose names do not parse as a
//! timestamp are foreign content and are never touched.

use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use serde::Serialize;
use tokio::fs as tokio_fs;
use tracing::{debug, info, warn};

use crate::backup::naming::{is_safe_component, parse_folder_name};
use crate::backup::registry::BackupKind;
use crate::backup::{BackupError, DB_DUMP_SUFFIX, FILES_ARCHIVE_NAME, Result};

/// A timestamp-named backup folder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupFolder {
    pub name: String,
    pub timestamp: NaiveDateTime,
    pub path: PathBuf,
}

/// One listed backup artifact, or the combined view of a folder holding both
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupEntry {
    pub name: String,
    pub size: u64,
    pub date: String,
    pub path: String,
    #[serde(rename = "type")]
    pub kind: BackupKind,
    pub folder: String,
}

/// Outcome of a retention pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionReport {
    pub kept: Vec<String>,
    pub removed: Vec<String>,
    pub failed: Vec<String>,
}

/// Timestamp-named folders under `backups_dir`, newest first
pub async fn list_backup_folders(backups_dir: &Path) -> Result<Vec<BackupFolder>> {
    let mut entries = match tokio_fs::read_dir(backups_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(BackupError::Io(e)),
    };

    let mut folders = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_dir() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        match parse_folder_name(&name) {
            Some(timestamp) => folders.push(BackupFolder {
                name,
                timestamp,
                path: entry.path(),
            }),
            None => debug!(folder = %name, "Skipping non-backup folder"),
        }
    }

    folders.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    Ok(folders)
}

/// List the backups of a site, newest first
///
/// A folder holding both a dump and an archive yields a combined `both`
/// entry followed by one entry per artifact.
pub async fn list_backups(backups_dir: &Path) -> Result<Vec<BackupEntry>> {
    let mut backups = Vec::new();

    for folder in list_backup_folders(backups_dir).await? {
        let date = folder.timestamp.format("%Y-%m-%d %H:%M:%S").to_string();
        let mut artifacts = Vec::new();

        let mut files = tokio_fs::read_dir(&folder.path).await?;
        while let Some(file) = files.next_entry().await? {
            let metadata = file.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            let Some(name) = file.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let kind = if name == FILES_ARCHIVE_NAME {
                BackupKind::Files
            } else if name.ends_with(DB_DUMP_SUFFIX) {
                BackupKind::Database
            } else {
                continue;
            };
            artifacts.push(BackupEntry {
                name,
                size: metadata.len(),
                date: date.clone(),
                path: file.path().to_string_lossy().to_string(),
                kind,
                folder: folder.name.clone(),
            });
        }

        // Database dumps before the file archive
        artifacts.sort_by(|a, b| {
            (a.kind == BackupKind::Files, &a.name).cmp(&(b.kind == BackupKind::Files, &b.name))
        });

        let has_db = artifacts.iter().any(|a| a.kind == BackupKind::Database);
        let has_files = artifacts.iter().any(|a| a.kind == BackupKind::Files);
        if has_db && has_files {
            backups.push(BackupEntry {
                name: folder.name.clone(),
                size: artifacts.iter().map(|a| a.size).sum(),
                date: date.clone(),
                path: folder.path.to_string_lossy().to_string(),
                kind: BackupKind::Both,
                folder: folder.name.clone(),
            });
        }
        backups.extend(artifacts);
    }

    Ok(backups)
}

/// Delete one backup folder by name
pub async fn delete_backup(backups_dir: &Path, folder: &str) -> Result<()> {
    if !is_safe_component(folder) {
        return Err(BackupError::Validation(format!(
            "Invalid backup folder name: {}",
            folder
        )));
    }

    let path = backups_dir.join(folder);
    match tokio_fs::metadata(&path).await {
        Ok(metadata) if metadata.is_dir() => {}
        Ok(_) => return Err(BackupError::BackupNotFound(folder.to_string())),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(BackupError::BackupNotFound(folder.to_string()));
        }
        Err(e) => return Err(BackupError::Io(e)),
    }

    tokio_fs::remove_dir_all(&path).await?;
    info!(folder, dir = %backups_dir.display(), "Deleted backup");
    Ok(())
}

/// Keep the `keep` newest backup folders and delete the rest
///
/// Deletion is best effort: a folder that cannot be removed is logged and
/// reported, and the remaining folders are still processed.
pub async fn enforce_retention(backups_dir: &Path, keep: usize) -> Result<RetentionReport> {
    enforce_retention_with(backups_dir, keep, |path| async move {
        tokio_fs::remove_dir_all(path).await
    })
    .await
}

async fn enforce_retention_with<F, Fut>(
    backups_dir: &Path,
    keep: usize,
    remove: F,
) -> Result<RetentionReport>
where
    F: Fn(PathBuf) -> Fut,
    Fut: Future<Output = std::io::Result<()>>,
{
    let folders = list_backup_folders(backups_dir).await?;
    let mut report = RetentionReport::default();

    for (index, folder) in folders.into_iter().enumerate() {
        if index < keep {
            report.kept.push(folder.name);
            continue;
        }
        match remove(folder.path.clone()).await {
            Ok(()) => {
                info!(folder = %folder.name, "Removed old backup");
                report.removed.push(folder.name);
            }
            Err(e) => {
                warn!(folder = %folder.name, error = %e, "Failed to remove old backup");
                report.failed.push(folder.name);
            }
        }
    }

    Ok(report)
}
