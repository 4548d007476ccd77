use std::env;
use std::path::PathBuf;
use std::time::Duration;

use chrono::TimeDelta;

use crate::backup::executor::BackupTimeouts;
use crate::backup::registry::RegistryPolicy;
use crate::backup::scheduler::SchedulerConfig;

/// Configuration for the control panel and its backup engine
#[derive(Debug, Clone)]
pub struct PanelConfig {
    /// Directory containing one subdirectory per hosted site
    pub sites_root: PathBuf,
    /// Address the HTTP API listens on
    pub bind_addr: String,
    /// Whether host commands run through `sudo -n`
    pub use_sudo: bool,
    /// Seconds between scheduler polls
    pub scheduler_poll_secs: u64,
    /// Grace window after a scheduled time, in minutes
    pub schedule_window_minutes: i64,
    /// Time limit for a database dump
    pub dump_timeout_secs: u64,
    /// Time limit for a file archive
    pub archive_timeout_secs: u64,
    /// Time limit for a restore
    pub restore_timeout_secs: u64,
    /// Hours a finished job stays queryable
    pub job_retention_hours: u64,
    /// Finished jobs kept per domain
    pub job_history_per_domain: usize,
}

impl Default for PanelConfig {
    fn default() -> Self {
        Self {
            sites_root: PathBuf::from("/var/www/sites"),
            bind_addr: String::from("0.0.0.0:5000"),
            use_sudo: true,
            scheduler_poll_secs: 30,
            schedule_window_minutes: 60,
            dump_timeout_secs: 30 * 60,
            archive_timeout_secs: 60 * 60,
            restore_timeout_secs: 60 * 60,
            job_retention_hours: 24,
            job_history_per_domain: 20,
        }
    }
}

impl PanelConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let number = |key: &str, default: u64| -> u64 {
            lookup(key)
                .and_then(|v| v.trim().parse().ok())
                .filter(|v| *v > 0)
                .unwrap_or(default)
        };

        let sites_root = lookup("SITES_ROOT")
            .map(PathBuf::from)
            .unwrap_or(defaults.sites_root);

        let bind_addr = lookup("PANEL_BIND_ADDR").unwrap_or(defaults.bind_addr);

        let use_sudo = lookup("PANEL_USE_SUDO")
            .map(|v| v.to_lowercase() != "false")
            .unwrap_or(defaults.use_sudo);

        Self {
            sites_root,
            bind_addr,
            use_sudo,
            scheduler_poll_secs: number("SCHEDULER_POLL_SECS", defaults.scheduler_poll_secs),
            schedule_window_minutes: number(
                "SCHEDULE_WINDOW_MINUTES",
                defaults.schedule_window_minutes as u64,
            ) as i64,
            dump_timeout_secs: number("BACKUP_DUMP_TIMEOUT_SECS", defaults.dump_timeout_secs),
            archive_timeout_secs: number(
                "BACKUP_ARCHIVE_TIMEOUT_SECS",
                defaults.archive_timeout_secs,
            ),
            restore_timeout_secs: number("RESTORE_TIMEOUT_SECS", defaults.restore_timeout_secs),
            job_retention_hours: number("JOB_RETENTION_HOURS", defaults.job_retention_hours),
            job_history_per_domain: number(
                "JOB_HISTORY_PER_DOMAIN",
                defaults.job_history_per_domain as u64,
            ) as usize,
        }
    }

    pub fn backup_timeouts(&self) -> BackupTimeouts {
        BackupTimeouts {
            dump: Duration::from_secs(self.dump_timeout_secs),
            archive: Duration::from_secs(self.archive_timeout_secs),
        }
    }

    pub fn restore_timeout(&self) -> Duration {
        Duration::from_secs(self.restore_timeout_secs)
    }

    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            poll_interval: Duration::from_secs(self.scheduler_poll_secs),
            window: TimeDelta::minutes(self.schedule_window_minutes),
        }
    }

    pub fn registry_policy(&self) -> RegistryPolicy {
        RegistryPolicy {
            terminal_ttl: Duration::from_secs(self.job_retention_hours * 3600),
            max_terminal_per_domain: self.job_history_per_domain,
        }
    }
}
