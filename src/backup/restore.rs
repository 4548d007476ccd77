//! Restore a site from one of its backup artifacts
//!
//! Artifacts are addressed as `<YYYYMMDD_HHMMSS>/<file>` relative to the
//! site's backups directory, or by bare file name for the newest backup
//! holding it. Restores run inline for the caller, bounded by a timeout.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::fs as tokio_fs;
use tracing::{info, warn};

use crate::backup::command::{CommandRunner, Invocation};
use crate::backup::executor::write_options_file;
use crate::backup::naming::{is_safe_component, parse_folder_name};
use crate::backup::storage::list_backup_folders;
use crate::backup::{BackupError, DB_DUMP_SUFFIX, FILES_ARCHIVE_NAME, Result};
use crate::sites::Site;

/// Restores database dumps and file archives
#[derive(Clone)]
pub struct RestoreService {
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
}

impl RestoreService {
    pub fn new(runner: Arc<dyn CommandRunner>, timeout: Duration) -> Self {
        Self { runner, timeout }
    }

    /// Load a `.sql.gz` dump into the site's database
    pub async fn restore_database(&self, site: &Site, filename: &str) -> Result<()> {
        let dump = resolve_artifact(site, filename, |name| name.ends_with(DB_DUMP_SUFFIX)).await?;
        let creds = site.credentials().ok_or_else(|| {
            BackupError::Config(format!("No database credentials for {}", site.domain))
        })?;
        let options = write_options_file(&creds)?;

        let invocation = Invocation::pipeline(vec![
            vec![
                "gunzip".to_string(),
                "-c".to_string(),
                dump.to_string_lossy().to_string(),
            ],
            vec![
                "mysql".to_string(),
                format!("--defaults-extra-file={}", options.path().display()),
                creds.name.clone(),
            ],
        ]);

        let output = self.runner.run(&invocation, self.timeout).await;
        drop(options);

        if !output.success {
            warn!(domain = %site.domain, filename, error = %output.diagnostic(), "Database restore failed");
            return Err(BackupError::Command(output.diagnostic()));
        }
        info!(domain = %site.domain, filename, "Database restored");
        Ok(())
    }

    /// Unpack `files.tar.gz` over the site's root
    pub async fn restore_files(&self, site: &Site, filename: &str) -> Result<()> {
        let archive = resolve_artifact(site, filename, |name| name == FILES_ARCHIVE_NAME).await?;

        let invocation = Invocation::direct([
            "tar".to_string(),
            "-xzf".to_string(),
            archive.to_string_lossy().to_string(),
            "-C".to_string(),
            site.root.to_string_lossy().to_string(),
        ]);

        let output = self.runner.run(&invocation, self.timeout).await;
        if !output.success {
            warn!(domain = %site.domain, filename, error = %output.diagnostic(), "File restore failed");
            return Err(BackupError::Command(output.diagnostic()));
        }
        info!(domain = %site.domain, filename, "Files restored");
        Ok(())
    }
}

/// Whether `name` is a file a backup job produces
pub(crate) fn is_artifact_name(name: &str) -> bool {
    name == FILES_ARCHIVE_NAME || name.ends_with(DB_DUMP_SUFFIX)
}

/// Map a backup file reference onto an existing artifact of the site
///
/// `<folder>/<file>` names one artifact exactly. A bare `<file>` resolves
/// to the newest backup folder holding a file of that name.
pub(crate) async fn resolve_artifact(
    site: &Site,
    filename: &str,
    accepts: impl Fn(&str) -> bool,
) -> Result<PathBuf> {
    let invalid = || BackupError::Validation(format!("Invalid backup file: {}", filename));

    let (folder, file) = match filename.split_once('/') {
        Some((folder, file)) => (Some(folder), file),
        None => (None, filename),
    };
    if !is_safe_component(file) || !accepts(file) {
        return Err(invalid());
    }

    let backups_dir = site.backups_dir();
    let candidates = match folder {
        Some(folder) => {
            if !is_safe_component(folder) || parse_folder_name(folder).is_none() {
                return Err(invalid());
            }
            vec![backups_dir.join(folder).join(file)]
        }
        None => list_backup_folders(&backups_dir)
            .await?
            .into_iter()
            .map(|backup| backup.path.join(file))
            .collect(),
    };

    for path in candidates {
        if let Ok(metadata) = tokio_fs::metadata(&path).await {
            if metadata.is_file() {
                return Ok(path);
            }
        }
    }
    Err(BackupError::BackupNotFound(filename.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::command::{CommandOutput, MockCommandRunner};
    use tempfile::{TempDir, tempdir};

    fn site_with_backup(temp_dir: &TempDir) -> Site {
        let mut site = Site::new("example.com", &temp_dir.path().join("example.com"));
        site.db_name = Some("example_wp".to_string());
        site.db_user = Some("example".to_string());
        site.db_password = Some("secret".to_string());

        let folder = site.backups_dir().join("20240105_101500");
        std::fs::create_dir_all(&folder).unwrap();
        std::fs::write(folder.join("example_wp.sql.gz"), "dump").unwrap();
        std::fs::write(folder.join("files.tar.gz"), "archive").unwrap();
        site
    }

    fn ok_output() -> CommandOutput {
        CommandOutput {
            success: true,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: Some(0),
        }
    }

    #[tokio::test]
    async fn test_restore_database_pipes_dump_into_mysql() {
        let temp_dir = tempdir().unwrap();
        let site = site_with_backup(&temp_dir);

        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|invocation, _| {
                let Invocation::Pipeline { stages, output } = invocation else {
                    return false;
                };
                output.is_none()
                    && stages.len() == 2
                    && stages[0][0] == "gunzip"
                    && stages[0][2].ends_with("20240105_101500/example_wp.sql.gz")
                    && stages[1][0] == "mysql"
                    && stages[1][1].starts_with("--defaults-extra-file=")
                    && stages[1][2] == "example_wp"
                    && !stages.iter().flatten().any(|arg| arg.contains("secret"))
            })
            .times(1)
            .returning(|_, _| ok_output());

        let service = RestoreService::new(Arc::new(runner), Duration::from_secs(60));
        service
            .restore_database(&site, "20240105_101500/example_wp.sql.gz")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_restore_files_extracts_into_site_root() {
        let temp_dir = tempdir().unwrap();
        let site = site_with_backup(&temp_dir);
        let root = site.root.to_string_lossy().to_string();

        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(move |invocation, _| {
                let Invocation::Direct(argv) = invocation else {
                    return false;
                };
                argv[0] == "tar" && argv[1] == "-xzf" && argv[4] == root
            })
            .times(1)
            .returning(|_, _| ok_output());

        let service = RestoreService::new(Arc::new(runner), Duration::from_secs(60));
        service
            .restore_files(&site, "20240105_101500/files.tar.gz")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_restore_rejects_bad_paths() {
        let temp_dir = tempdir().unwrap();
        let site = site_with_backup(&temp_dir);

        let mut runner = MockCommandRunner::new();
        runner.expect_run().never();
        let service = RestoreService::new(Arc::new(runner), Duration::from_secs(60));

        for filename in [
            "../../etc/passwd",
            "20240105_101500/../../x.sql.gz",
            "manual/example_wp.sql.gz",
            "20240105_101500/files.tar.gz",
            ".settings.json",
        ] {
            assert!(
                matches!(
                    service.restore_database(&site, filename).await,
                    Err(BackupError::Validation(_))
                ),
                "{} accepted",
                filename
            );
        }

        assert!(matches!(
            service
                .restore_database(&site, "20240101_000000/example_wp.sql.gz")
                .await,
            Err(BackupError::BackupNotFound(_))
        ));
        assert!(matches!(
            service
                .restore_files(&site, "20240105_101500/example_wp.sql.gz")
                .await,
            Err(BackupError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_bare_file_name_resolves_to_newest_backup() {
        let temp_dir = tempdir().unwrap();
        let site = site_with_backup(&temp_dir);
        let newer = site.backups_dir().join("20240201_080000");
        std::fs::create_dir_all(&newer).unwrap();
        std::fs::write(newer.join("files.tar.gz"), "newer archive").unwrap();

        let archive = resolve_artifact(&site, "files.tar.gz", is_artifact_name)
            .await
            .unwrap();
        assert_eq!(archive, newer.join("files.tar.gz"));

        let dump = resolve_artifact(&site, "example_wp.sql.gz", is_artifact_name)
            .await
            .unwrap();
        assert!(dump.ends_with("20240105_101500/example_wp.sql.gz"));

        assert!(matches!(
            resolve_artifact(&site, "other_wp.sql.gz", is_artifact_name).await,
            Err(BackupError::BackupNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_restore_failure_carries_diagnostics() {
        let temp_dir = tempdir().unwrap();
        let site = site_with_backup(&temp_dir);

        let mut runner = MockCommandRunner::new();
        runner.expect_run().times(1).returning(|_, _| CommandOutput {
            success: false,
            stdout: String::new(),
            stderr: "ERROR 1049 (42000): Unknown database".to_string(),
            exit_code: Some(1),
        });

        let service = RestoreService::new(Arc::new(runner), Duration::from_secs(60));
        let err = service
            .restore_database(&site, "20240105_101500/example_wp.sql.gz")
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::Command(ref msg) if msg.contains("Unknown database")));
    }

    #[tokio::test]
    async fn test_restore_database_needs_credentials() {
        let temp_dir = tempdir().unwrap();
        let mut site = site_with_backup(&temp_dir);
        site.db_password = None;

        let mut runner = MockCommandRunner::new();
        runner.expect_run().never();
        let service = RestoreService::new(Arc::new(runner), Duration::from_secs(60));

        assert!(matches!(
            service
                .restore_database(&site, "20240105_101500/example_wp.sql.gz")
                .await,
            Err(BackupError::Config(_))
        ));
    }
}
