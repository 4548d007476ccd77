//! Per-site backup schedule settings and the last auto-backup marker
//!
//! Both live next to the backup folders:
//! `<site>/backups/.settings.json` and `<site>/backups/.last_auto_backup`.

use std::io::ErrorKind;
use std::path::Path;

use chrono::{DateTime, Local, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use tokio::fs as tokio_fs;
use tracing::warn;

use crate::backup::registry::BackupKind;
use crate::backup::{BackupError, Result};

/// Settings document name inside a site's backups directory
pub const SETTINGS_FILE: &str = ".settings.json";

/// Marker file name inside a site's backups directory
pub const MARKER_FILE: &str = ".last_auto_backup";

const MARKER_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

/// How often a scheduled backup runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Daily,
    /// Mondays
    Weekly,
    /// First day of the month
    Monthly,
}

/// Automatic backup policy of one site
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleSettings {
    pub enabled: bool,
    pub frequency: Frequency,
    /// "HH:MM" in the host's local clock
    pub time: String,
    /// Number of backup folders to keep
    pub retention: u32,
    pub include_files: bool,
    pub include_db: bool,
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            frequency: Frequency::Daily,
            time: "00:00".to_string(),
            retention: 5,
            include_files: true,
            include_db: true,
        }
    }
}

impl ScheduleSettings {
    /// Parse the configured time of day
    pub fn scheduled_time(&self) -> Result<NaiveTime> {
        let bytes = self.time.as_bytes();
        if bytes.len() != 5 || bytes[2] != b':' {
            return Err(BackupError::Validation(format!(
                "Invalid schedule time '{}', expected HH:MM",
                self.time
            )));
        }
        NaiveTime::parse_from_str(&self.time, "%H:%M").map_err(|_| {
            BackupError::Validation(format!(
                "Invalid schedule time '{}', expected HH:MM",
                self.time
            ))
        })
    }

    /// Artifacts a scheduled run produces; `None` when neither is selected
    pub fn kind(&self) -> Option<BackupKind> {
        BackupKind::from_flags(self.include_db, self.include_files)
    }

    pub fn validate(&self) -> Result<()> {
        self.scheduled_time()?;
        if self.retention == 0 {
            return Err(BackupError::Validation(
                "Retention must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Load a site's schedule settings, or the defaults when none are saved
pub async fn load_settings(backups_dir: &Path) -> Result<ScheduleSettings> {
    match tokio_fs::read_to_string(backups_dir.join(SETTINGS_FILE)).await {
        Ok(contents) => Ok(serde_json::from_str(&contents)?),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(ScheduleSettings::default()),
        Err(e) => Err(BackupError::Io(e)),
    }
}

/// Validate and persist a site's schedule settings
pub async fn save_settings(backups_dir: &Path, settings: &ScheduleSettings) -> Result<()> {
    settings.validate()?;
    tokio_fs::create_dir_all(backups_dir).await?;
    let json = serde_json::to_string_pretty(settings)?;
    tokio_fs::write(backups_dir.join(SETTINGS_FILE), json).await?;
    Ok(())
}

/// When the scheduler last triggered an automatic backup for the site
///
/// A missing or unreadable marker counts as "never".
pub async fn read_marker(backups_dir: &Path) -> Result<Option<NaiveDateTime>> {
    let contents = match tokio_fs::read_to_string(backups_dir.join(MARKER_FILE)).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            warn!(dir = %backups_dir.display(), error = %e, "Cannot read auto-backup marker");
            return Ok(None);
        }
    };

    let parsed = parse_marker(contents.trim());
    if parsed.is_none() {
        warn!(dir = %backups_dir.display(), "Ignoring unparseable auto-backup marker");
    }
    Ok(parsed)
}

/// Record that an automatic backup was triggered at `at`
pub async fn write_marker(backups_dir: &Path, at: NaiveDateTime) -> Result<()> {
    tokio_fs::create_dir_all(backups_dir).await?;
    tokio_fs::write(
        backups_dir.join(MARKER_FILE),
        at.format(MARKER_FORMAT).to_string(),
    )
    .await?;
    Ok(())
}

fn parse_marker(text: &str) -> Option<NaiveDateTime> {
    if let Ok(naive) = NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(naive);
    }
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|dt| dt.with_timezone(&Local).naive_local())
}
