//! Timestamp-based names for backup folders and job identifiers
//!
//! Backup folders are named `YYYYMMDD_HHMMSS` after their creation time in
//! the host's local clock, and a job is identified by
//! `<domain>_<YYYYMMDD_HHMMSS>`. The folder name is the only ordering key
//! used for listing and retention.

use chrono::{Local, NaiveDateTime};
use std::fmt;

/// chrono format of a backup folder name
pub const FOLDER_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Format a timestamp as a backup folder name
pub fn folder_name(timestamp: NaiveDateTime) -> String {
    timestamp.format(FOLDER_FORMAT).to_string()
}

/// Parse a backup folder name back into its creation timestamp
///
/// Only the exact `YYYYMMDD_HHMMSS` shape is accepted; anything else is
/// treated as foreign content.
pub fn parse_folder_name(name: &str) -> Option<NaiveDateTime> {
    let bytes = name.as_bytes();
    if bytes.len() != 15 || bytes[8] != b'_' {
        return None;
    }
    let digits_ok = bytes
        .iter()
        .enumerate()
        .all(|(i, b)| i == 8 || b.is_ascii_digit());
    if !digits_ok {
        return None;
    }
    NaiveDateTime::parse_from_str(name, FOLDER_FORMAT).ok()
}

/// Whether `name` is a single, visible path component
///
/// Used for every folder or file name that arrives from a request before
/// it is joined onto a site's backups directory.
pub fn is_safe_component(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && !name.contains('/')
        && !name.contains('\\')
        && !name.contains('\0')
}

/// Identifier of one backup job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupId {
    domain: String,
    timestamp: NaiveDateTime,
}

impl BackupId {
    /// Create an identifier for a job started at `timestamp`
    pub fn new(domain: &str, timestamp: NaiveDateTime) -> Self {
        // Folder names carry whole seconds only
        let timestamp = parse_folder_name(&folder_name(timestamp)).unwrap_or(timestamp);
        Self {
            domain: domain.to_string(),
            timestamp,
        }
    }

    /// Create an identifier for a job starting now
    pub fn now(domain: &str) -> Self {
        Self::new(domain, Local::now().naive_local())
    }

    /// Parse `<domain>_<YYYYMMDD>_<HHMMSS>`
    pub fn parse(job_id: &str) -> Option<Self> {
        let mut parts = job_id.rsplitn(3, '_');
        let time = parts.next()?;
        let date = parts.next()?;
        let domain = parts.next()?;
        if domain.is_empty() {
            return None;
        }
        let timestamp = parse_folder_name(&format!("{}_{}", date, time))?;
        Some(Self {
            domain: domain.to_string(),
            timestamp,
        })
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn timestamp(&self) -> NaiveDateTime {
        self.timestamp
    }

    /// Name of the backup folder this job writes into
    pub fn folder_name(&self) -> String {
        folder_name(self.timestamp)
    }
}

impl fmt::Display for BackupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.domain, self.folder_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn ts(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_opt(h, mi, s)
            .unwrap()
    }

    #[test]
    fn test_folder_name_format() {
        assert_eq!(folder_name(ts(2024, 1, 3, 0, 0, 0)), "20240103_000000");
        assert_eq!(folder_name(ts(2025, 6, 1, 14, 30, 5)), "20250601_143005");
    }

    #[test]
    fn test_parse_folder_name() {
        assert_eq!(
            parse_folder_name("20250601_143005"),
            Some(ts(2025, 6, 1, 14, 30, 5))
        );
        assert_eq!(parse_folder_name("manual-copy"), None);
        assert_eq!(parse_folder_name("20250601-143005"), None);
        assert_eq!(parse_folder_name("20250601_1430"), None);
        assert_eq!(parse_folder_name("20251301_000000"), None);
        assert_eq!(parse_folder_name("+0250601_143005"), None);
        assert_eq!(parse_folder_name("20250601_143005_old"), None);
    }

    #[test]
    fn test_backup_id_display_and_parse() {
        let id = BackupId::new("example.com", ts(2025, 6, 1, 14, 30, 0));
        assert_eq!(id.to_string(), "example.com_20250601_143000");
        assert_eq!(id.folder_name(), "20250601_143000");

        let parsed = BackupId::parse("example.com_20250601_143000").unwrap();
        assert_eq!(parsed, id);

        let parsed = BackupId::parse("my_site.org_20250601_143000").unwrap();
        assert_eq!(parsed.domain(), "my_site.org");

        assert!(BackupId::parse("example.com").is_none());
        assert!(BackupId::parse("_20250601_143000").is_none());
        assert!(BackupId::parse("example.com_2025_1430").is_none());
    }

    #[test]
    fn test_backup_id_truncates_subseconds() {
        let precise = ts(2025, 6, 1, 14, 30, 0) + chrono::Duration::milliseconds(750);
        let id = BackupId::new("example.com", precise);
        assert_eq!(id.timestamp(), ts(2025, 6, 1, 14, 30, 0));
    }

    #[test]
    fn test_safe_component() {
        assert!(is_safe_component("20250601_143000"));
        assert!(is_safe_component("shop.sql.gz"));
        assert!(!is_safe_component(""));
        assert!(!is_safe_component(".."));
        assert!(!is_safe_component(".settings.json"));
        assert!(!is_safe_component("../other.com"));
        assert!(!is_safe_component("a/b"));
    }
}
