//! Backup orchestration for hosted sites: running backup jobs, tracking
//! their progress, enforcing retention and firing scheduled backups.

pub mod command;
pub mod executor;
pub mod naming;
pub mod registry;
pub mod restore;
pub mod scheduler;
pub mod settings;
pub mod storage;

/// Name of the per-site directory holding backup folders
pub const BACKUPS_DIR: &str = "backups";

/// Archive name used for the site's content tree
pub const FILES_ARCHIVE_NAME: &str = "files.tar.gz";

/// Suffix of compressed database dumps
pub const DB_DUMP_SUFFIX: &str = ".sql.gz";

/// Error type for backup, restore and scheduling operations
#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Site not found: {0}")]
    SiteNotFound(String),

    #[error("Backup not found: {0}")]
    BackupNotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Command failed: {0}")]
    Command(String),
}

/// Result type for backup operations
pub type Result<T> = std::result::Result<T, BackupError>;
