//! Backup job execution
//!
//! A job produces a compressed database dump and/or a compressed archive of
//! the site's content tree inside a fresh timestamp-named folder. Jobs run
//! as detached tasks; callers get the job id back immediately and follow
//! progress through the [`JobRegistry`].
//!
//! Progress reported while a job runs:
//!
//! | step                         | progress | message                     |
//! |------------------------------|----------|-----------------------------|
//! | created                      | 0        | Starting backup...          |
//! | database dump started        | 10       | Backing up database...      |
//! | dump done, files pending     | 50       | Database backup completed   |
//! | file archive started         | 60 / 10  | Backing up files...         |
//! | finished                     | 100      | Backup completed successfully |

use std::any::Any;
use std::io::Write;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tempfile::NamedTempFile;
use tokio::fs as tokio_fs;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::backup::command::{CommandRunner, Invocation};
use crate::backup::naming::BackupId;
use crate::backup::registry::{BackupKind, JobRecord, JobRegistry};
use crate::backup::{BackupError, DB_DUMP_SUFFIX, FILES_ARCHIVE_NAME, Result};
use crate::sites::{DbCredentials, Site};

/// Time limits for the external tools of one job
#[derive(Debug, Clone, Copy)]
pub struct BackupTimeouts {
    /// Database dump and compression
    pub dump: Duration,
    /// File tree archive and compression
    pub archive: Duration,
}

impl Default for BackupTimeouts {
    fn default() -> Self {
        Self {
            dump: Duration::from_secs(30 * 60),
            archive: Duration::from_secs(60 * 60),
        }
    }
}

/// A job that has been registered and launched
#[derive(Debug)]
pub struct StartedJob {
    pub job_id: String,
    /// Handle of the detached task; dropping it does not stop the job
    pub handle: JoinHandle<()>,
}

/// Starts backup jobs and drives them to a terminal state
#[derive(Clone)]
pub struct BackupExecutor {
    registry: Arc<JobRegistry>,
    runner: Arc<dyn CommandRunner>,
    timeouts: BackupTimeouts,
    shutdown: CancellationToken,
}

impl BackupExecutor {
    pub fn new(
        registry: Arc<JobRegistry>,
        runner: Arc<dyn CommandRunner>,
        timeouts: BackupTimeouts,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            registry,
            runner,
            timeouts,
            shutdown,
        }
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    /// Register a backup job for `site` and launch it in the background
    ///
    /// Configuration problems are returned here and no job is created.
    /// Everything that goes wrong after this point ends up in the job's
    /// `error` status.
    pub async fn start(&self, site: &Site, kind: BackupKind) -> Result<StartedJob> {
        if kind.includes_database() && site.db_name.is_none() {
            return Err(BackupError::Config(format!(
                "No database configured for {}",
                site.domain
            )));
        }

        let id = BackupId::now(&site.domain);
        let job_id = id.to_string();
        let folder = site.backups_dir().join(id.folder_name());

        self.registry
            .put(JobRecord::started(&job_id, &site.domain, kind, id.timestamp()));
        info!(job_id = %job_id, domain = %site.domain, kind = kind.as_str(), "Backup job started");

        // The folder exists before this returns so retention sees it
        let prepared = tokio_fs::create_dir_all(&folder).await;
        if prepared.is_ok() {
            self.registry
                .set_folder(&job_id, &folder.to_string_lossy());
        }

        let this = self.clone();
        let site = site.clone();
        let task_job_id = job_id.clone();
        let handle = tokio::spawn(async move {
            match prepared {
                Ok(()) => this.run(site, kind, task_job_id, folder).await,
                Err(e) => {
                    error!(job_id = %task_job_id, error = %e, "Cannot create backup folder");
                    this.registry.fail(
                        &task_job_id,
                        &format!("Failed to create backup folder: {}", e),
                    );
                }
            }
        });

        Ok(StartedJob { job_id, handle })
    }

    async fn run(&self, site: Site, kind: BackupKind, job_id: String, folder: PathBuf) {
        let work = AssertUnwindSafe(self.execute(&site, kind, &job_id, &folder)).catch_unwind();

        let outcome = tokio::select! {
            result = work => match result {
                Ok(outcome) => outcome,
                Err(panic) => Err(format!("Backup failed unexpectedly: {}", panic_message(panic.as_ref()))),
            },
            // Dropping the work future kills the running tool
            _ = self.shutdown.cancelled() => Err("Backup cancelled: shutting down".to_string()),
        };

        match outcome {
            Ok(()) => {
                self.registry
                    .complete(&job_id, "Backup completed successfully");
                info!(job_id = %job_id, "Backup job completed");
            }
            Err(message) => {
                self.registry.fail(&job_id, &message);
                warn!(job_id = %job_id, error = %message, "Backup job failed");
            }
        }
    }

    /// Run the requested steps in order: database first, then files
    async fn execute(
        &self,
        site: &Site,
        kind: BackupKind,
        job_id: &str,
        folder: &Path,
    ) -> std::result::Result<(), String> {
        if kind.includes_database() {
            self.registry
                .set_progress(job_id, 10, "Backing up database...");
            let dump = self.backup_database(site, folder).await?;
            self.registry.add_file(job_id, &dump.to_string_lossy());

            if kind.includes_files() {
                self.registry
                    .set_progress(job_id, 50, "Database backup completed");
            }
        }

        if kind.includes_files() {
            let progress = if kind.includes_database() { 60 } else { 10 };
            self.registry
                .set_progress(job_id, progress, "Backing up files...");
            let archive = self.backup_files(site, folder).await?;
            self.registry.add_file(job_id, &archive.to_string_lossy());
        }

        Ok(())
    }

    async fn backup_database(&self, site: &Site, folder: &Path) -> std::result::Result<PathBuf, String> {
        let creds = site
            .credentials()
            .ok_or_else(|| "Could not resolve database credentials".to_string())?;

        // Removed when dropped, whichever way this function returns
        let options = write_options_file(&creds)
            .map_err(|e| format!("Failed to write credentials file: {}", e))?;

        let dump_path = folder.join(format!("{}{}", creds.name, DB_DUMP_SUFFIX));
        let invocation = Invocation::pipeline(vec![
            vec![
                "mysqldump".to_string(),
                format!("--defaults-extra-file={}", options.path().display()),
                "--single-transaction".to_string(),
                "--routines".to_string(),
                "--triggers".to_string(),
                creds.name.clone(),
            ],
            vec!["gzip".to_string()],
        ])
        .with_output(&dump_path);

        let output = self.runner.run(&invocation, self.timeouts.dump).await;
        drop(options);

        if !output.success {
            if output.timed_out() {
                warn!(domain = %site.domain, timeout_secs = self.timeouts.dump.as_secs(), "Database dump timed out");
            }
            let _ = tokio_fs::remove_file(&dump_path).await;
            return Err(format!("Database backup failed: {}", output.diagnostic()));
        }
        Ok(dump_path)
    }

    async fn backup_files(&self, site: &Site, folder: &Path) -> std::result::Result<PathBuf, String> {
        match tokio_fs::metadata(&site.content_root).await {
            Ok(metadata) if metadata.is_dir() => {}
            _ => {
                return Err(format!(
                    "Content directory not found: {}",
                    site.content_root.display()
                ));
            }
        }

        let parent = site
            .content_root
            .parent()
            .ok_or_else(|| "Content directory has no parent".to_string())?;
        let name = site
            .content_root
            .file_name()
            .ok_or_else(|| "Content directory has no name".to_string())?;

        let archive_path = folder.join(FILES_ARCHIVE_NAME);
        let invocation = Invocation::direct([
            "tar".to_string(),
            "-czf".to_string(),
            archive_path.to_string_lossy().to_string(),
            "-C".to_string(),
            parent.to_string_lossy().to_string(),
            name.to_string_lossy().to_string(),
        ]);

        let output = self.runner.run(&invocation, self.timeouts.archive).await;
        if !output.success {
            if output.timed_out() {
                warn!(domain = %site.domain, timeout_secs = self.timeouts.archive.as_secs(), "File archive timed out");
            }
            let _ = tokio_fs::remove_file(&archive_path).await;
            return Err(format!("File backup failed: {}", output.diagnostic()));
        }
        Ok(archive_path)
    }
}

/// Write MySQL client credentials to a private temporary option file
///
/// Keeps the password off the command line. The file is created with
/// owner-only permissions and deleted when the returned handle drops.
pub(crate) fn write_options_file(creds: &DbCredentials) -> std::io::Result<NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix(".panel-mysql-")
        .suffix(".cnf")
        .tempfile()?;
    writeln!(file, "[client]")?;
    writeln!(file, "user=\"{}\"", escape_option(&creds.user))?;
    writeln!(file, "password=\"{}\"", escape_option(&creds.password))?;
    writeln!(file, "host=\"{}\"", escape_option(&creds.host))?;
    file.flush()?;
    Ok(file)
}

fn escape_option(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
