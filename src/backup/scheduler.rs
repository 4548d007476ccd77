//! Automatic backups driven by per-site schedule settings
//!
//! A single background task polls every site on a fixed interval. A site
//! is due when the poll falls inside the grace window that opens at the
//! configured time of day (and, for weekly and monthly schedules, on the
//! right day). The last-run marker suppresses a second trigger for the
//! same occurrence.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, Local, NaiveDateTime, TimeDelta, Weekday};
use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backup::executor::BackupExecutor;
use crate::backup::registry::BackupKind;
use crate::backup::settings::{Frequency, ScheduleSettings, load_settings, read_marker, write_marker};
use crate::backup::storage::enforce_retention;
use crate::backup::Result;
use crate::sites::{Site, SiteDirectory};

/// What the scheduler decided for one site in one poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Disabled,
    /// Outside the window or not the scheduled day
    NotDue,
    /// The current occurrence was already triggered
    AlreadyServed,
    /// Due, but neither database nor files are selected
    NothingSelected,
    Due(BackupKind),
}

/// Decide whether a site's scheduled backup should fire at `now`
///
/// All times are naive local times. `window` is the grace period after the
/// scheduled time during which a poll still counts as on time.
pub fn evaluate(
    settings: &ScheduleSettings,
    now: NaiveDateTime,
    marker: Option<NaiveDateTime>,
    window: TimeDelta,
) -> Result<Decision> {
    if !settings.enabled {
        return Ok(Decision::Disabled);
    }

    let scheduled = now.date().and_time(settings.scheduled_time()?);
    let elapsed = now - scheduled;
    if elapsed < TimeDelta::zero() || elapsed > window {
        return Ok(Decision::NotDue);
    }

    let right_day = match settings.frequency {
        Frequency::Daily => true,
        Frequency::Weekly => now.weekday() == Weekday::Mon,
        Frequency::Monthly => now.day() == 1,
    };
    if !right_day {
        return Ok(Decision::NotDue);
    }

    if let Some(last) = marker {
        if last.date() == now.date() && last >= scheduled {
            return Ok(Decision::AlreadyServed);
        }
    }

    Ok(match settings.kind() {
        Some(kind) => Decision::Due(kind),
        None => Decision::NothingSelected,
    })
}

/// Scheduler timing
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub poll_interval: Duration,
    pub window: TimeDelta,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            window: TimeDelta::minutes(60),
        }
    }
}

/// Result of one poll over all sites
#[derive(Debug, Default)]
pub struct CycleReport {
    /// Job ids started in this cycle
    pub triggered: Vec<String>,
    /// Domains whose processing failed
    pub failed: Vec<String>,
}

/// Polls schedule settings and starts due backups
pub struct AutoBackupScheduler {
    sites: Arc<dyn SiteDirectory>,
    executor: BackupExecutor,
    config: SchedulerConfig,
}

impl AutoBackupScheduler {
    pub fn new(sites: Arc<dyn SiteDirectory>, executor: BackupExecutor, config: SchedulerConfig) -> Self {
        Self {
            sites,
            executor,
            config,
        }
    }

    /// Run the polling loop in the background until `shutdown` fires
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }

    async fn run(&self, shutdown: CancellationToken) {
        info!(
            poll_secs = self.config.poll_interval.as_secs(),
            window_minutes = self.config.window.num_minutes(),
            "Auto-backup scheduler started"
        );

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Auto-backup scheduler stopping");
                    break;
                }
                _ = ticker.tick() => {
                    let now = Local::now().naive_local();
                    match AssertUnwindSafe(self.run_cycle(now)).catch_unwind().await {
                        Ok(report) if !report.triggered.is_empty() || !report.failed.is_empty() => {
                            debug!(
                                triggered = ?report.triggered,
                                failed = ?report.failed,
                                "Auto-backup cycle finished"
                            );
                        }
                        Ok(_) => {}
                        Err(_) => error!("Auto-backup cycle panicked; continuing on next poll"),
                    }
                }
            }
        }
    }

    /// Poll every site once
    pub async fn run_cycle(&self, now: NaiveDateTime) -> CycleReport {
        let mut report = CycleReport::default();

        for site in self.sites.all().await {
            let outcome = AssertUnwindSafe(self.process_site(&site, now))
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(Some(job_id))) => report.triggered.push(job_id),
                Ok(Ok(None)) => {}
                Ok(Err(e)) => {
                    warn!(domain = %site.domain, error = %e, "Auto-backup check failed");
                    report.failed.push(site.domain.clone());
                }
                Err(_) => {
                    error!(domain = %site.domain, "Auto-backup check panicked");
                    report.failed.push(site.domain.clone());
                }
            }
        }

        report
    }

    async fn process_site(&self, site: &Site, now: NaiveDateTime) -> Result<Option<String>> {
        let backups_dir = site.backups_dir();
        let settings = load_settings(&backups_dir).await?;
        if !settings.enabled {
            return Ok(None);
        }
        settings.validate()?;

        let marker = read_marker(&backups_dir).await?;
        let kind = match evaluate(&settings, now, marker, self.config.window)? {
            Decision::Due(kind) => kind,
            Decision::NothingSelected => {
                debug!(domain = %site.domain, "Scheduled backup selects nothing; skipping");
                return Ok(None);
            }
            _ => return Ok(None),
        };

        let started = self.executor.start(site, kind).await?;
        info!(domain = %site.domain, job_id = %started.job_id, "Scheduled backup triggered");

        // Written before the job finishes so a restart does not retrigger it
        if let Err(e) = write_marker(&backups_dir, now).await {
            error!(domain = %site.domain, error = %e, "Failed to record auto-backup marker");
        }

        match enforce_retention(&backups_dir, settings.retention as usize).await {
            Ok(retention) if !retention.removed.is_empty() => {
                info!(domain = %site.domain, removed = retention.removed.len(), "Old backups pruned");
            }
            Ok(_) => {}
            Err(e) => warn!(domain = %site.domain, error = %e, "Retention check failed"),
        }

        Ok(Some(started.job_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::command::{CommandOutput, MockCommandRunner};
    use crate::backup::executor::BackupTimeouts;
    use crate::backup::registry::JobRegistry;
    use crate::backup::settings::{MARKER_FILE, SETTINGS_FILE, save_settings};
    use crate::sites::FsSiteDirectory;
    use chrono::NaiveDate;
    use std::path::Path;
    use tempfile::tempdir;

    // 2025-06-02 is a Monday
    fn at(day: u32, h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 6, day)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn daily(time: &str) -> ScheduleSettings {
        ScheduleSettings {
            enabled: true,
            time: time.to_string(),
            ..ScheduleSettings::default()
        }
    }

    fn window() -> TimeDelta {
        TimeDelta::minutes(60)
    }

    #[test]
    fn test_daily_window_bounds() {
        let settings = daily("09:00");
        let decide = |now| evaluate(&settings, now, None, window()).unwrap();

        assert_eq!(decide(at(3, 8, 59)), Decision::NotDue);
        assert_eq!(decide(at(3, 9, 0)), Decision::Due(BackupKind::Both));
        assert_eq!(decide(at(3, 9, 30)), Decision::Due(BackupKind::Both));
        assert_eq!(decide(at(3, 10, 0)), Decision::Due(BackupKind::Both));
        assert_eq!(decide(at(3, 10, 1)), Decision::NotDue);
    }

    #[test]
    fn test_weekly_fires_on_mondays_only() {
        let settings = ScheduleSettings {
            frequency: Frequency::Weekly,
            ..daily("02:00")
        };
        assert_eq!(
            evaluate(&settings, at(2, 2, 5), None, window()).unwrap(),
            Decision::Due(BackupKind::Both)
        );
        assert_eq!(
            evaluate(&settings, at(3, 2, 5), None, window()).unwrap(),
            Decision::NotDue
        );
    }

    #[test]
    fn test_monthly_fires_on_the_first_only() {
        let settings = ScheduleSettings {
            frequency: Frequency::Monthly,
            ..daily("02:00")
        };
        assert_eq!(
            evaluate(&settings, at(1, 2, 5), None, window()).unwrap(),
            Decision::Due(BackupKind::Both)
        );
        assert_eq!(
            evaluate(&settings, at(2, 2, 5), None, window()).unwrap(),
            Decision::NotDue
        );
    }

    #[test]
    fn test_marker_suppresses_same_occurrence() {
        let settings = daily("09:00");

        let served = Some(at(3, 9, 15));
        assert_eq!(
            evaluate(&settings, at(3, 9, 50), served, window()).unwrap(),
            Decision::AlreadyServed
        );

        let yesterday = Some(at(2, 9, 15));
        assert_eq!(
            evaluate(&settings, at(3, 9, 50), yesterday, window()).unwrap(),
            Decision::Due(BackupKind::Both)
        );

        let earlier_today = Some(at(3, 8, 30));
        assert_eq!(
            evaluate(&settings, at(3, 9, 50), earlier_today, window()).unwrap(),
            Decision::Due(BackupKind::Both)
        );
    }

    #[test]
    fn test_disabled_and_empty_selection() {
        let settings = ScheduleSettings {
            enabled: false,
            ..daily("09:00")
        };
        assert_eq!(
            evaluate(&settings, at(3, 9, 0), None, window()).unwrap(),
            Decision::Disabled
        );

        let settings = ScheduleSettings {
            include_db: false,
            include_files: false,
            ..daily("09:00")
        };
        assert_eq!(
            evaluate(&settings, at(3, 9, 0), None, window()).unwrap(),
            Decision::NothingSelected
        );

        let settings = ScheduleSettings {
            include_db: false,
            ..daily("09:00")
        };
        assert_eq!(
            evaluate(&settings, at(3, 9, 0), None, window()).unwrap(),
            Decision::Due(BackupKind::Files)
        );
    }

    #[test]
    fn test_malformed_time_is_an_error() {
        assert!(evaluate(&daily("9am"), at(3, 9, 0), None, window()).is_err());
    }

    fn make_site(sites_root: &Path, domain: &str) -> std::path::PathBuf {
        let root = sites_root.join(domain);
        std::fs::create_dir_all(root.join("public_html")).unwrap();
        std::fs::write(root.join("public_html").join("wp-config.php"), "<?php").unwrap();
        root.join("backups")
    }

    fn scheduler(sites_root: &Path) -> (AutoBackupScheduler, Arc<JobRegistry>) {
        let mut runner = MockCommandRunner::new();
        runner.expect_run().returning(|_, _| CommandOutput {
            success: true,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: Some(0),
        });
        let registry = Arc::new(JobRegistry::default());
        let executor = BackupExecutor::new(
            registry.clone(),
            Arc::new(runner),
            BackupTimeouts::default(),
            CancellationToken::new(),
        );
        let sites = Arc::new(FsSiteDirectory::new(sites_root));
        (
            AutoBackupScheduler::new(sites, executor, SchedulerConfig::default()),
            registry,
        )
    }

    #[tokio::test]
    async fn test_cycle_triggers_once_and_prunes() {
        let temp_dir = tempdir().unwrap();
        let backups = make_site(temp_dir.path(), "example.com");
        let settings = ScheduleSettings {
            retention: 2,
            include_db: false,
            ..daily("09:00")
        };
        save_settings(&backups, &settings).await.unwrap();
        for name in ["20240101_000000", "20240102_000000", "20240103_000000"] {
            std::fs::create_dir_all(backups.join(name)).unwrap();
        }

        let (scheduler, registry) = scheduler(temp_dir.path());

        let report = scheduler.run_cycle(at(3, 9, 15)).await;
        assert_eq!(report.triggered.len(), 1);
        assert!(report.failed.is_empty());

        let job_id = &report.triggered[0];
        assert!(job_id.starts_with("example.com_"));
        assert_ne!(
            registry.get(job_id).status(),
            crate::backup::registry::JobStatus::NotFound
        );

        let marker = std::fs::read_to_string(backups.join(MARKER_FILE)).unwrap();
        assert!(marker.starts_with("2025-06-03T09:15:00"));

        let mut folders: Vec<String> = std::fs::read_dir(&backups)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .filter(|n| !n.starts_with('.'))
            .collect();
        folders.sort();
        assert_eq!(folders.len(), 2);
        assert_eq!(folders[0], "20240103_000000");

        let again = scheduler.run_cycle(at(3, 9, 50)).await;
        assert!(again.triggered.is_empty());

        let next_day = scheduler.run_cycle(at(4, 9, 5)).await;
        assert_eq!(next_day.triggered.len(), 1);
    }

    #[tokio::test]
    async fn test_one_broken_site_does_not_block_others() {
        let temp_dir = tempdir().unwrap();
        let broken = make_site(temp_dir.path(), "broken.com");
        std::fs::create_dir_all(&broken).unwrap();
        std::fs::write(broken.join(SETTINGS_FILE), "{ nope").unwrap();

        let healthy = make_site(temp_dir.path(), "healthy.com");
        let settings = ScheduleSettings {
            include_db: false,
            ..daily("09:00")
        };
        save_settings(&healthy, &settings).await.unwrap();

        let idle = make_site(temp_dir.path(), "idle.com");
        save_settings(&idle, &ScheduleSettings::default()).await.unwrap();

        let (scheduler, _registry) = scheduler(temp_dir.path());
        let report = scheduler.run_cycle(at(3, 9, 1)).await;

        assert_eq!(report.failed, vec!["broken.com".to_string()]);
        assert_eq!(report.triggered.len(), 1);
        assert!(report.triggered[0].starts_with("healthy.com_"));
        assert!(!idle.join(MARKER_FILE).exists());
    }

    #[tokio::test]
    async fn test_config_error_leaves_marker_unwritten() {
        let temp_dir = tempdir().unwrap();
        let backups = make_site(temp_dir.path(), "nodb.com");
        save_settings(&backups, &daily("09:00")).await.unwrap();

        let (scheduler, registry) = scheduler(temp_dir.path());
        let report = scheduler.run_cycle(at(3, 9, 1)).await;

        assert_eq!(report.failed, vec!["nodb.com".to_string()]);
        assert!(!backups.join(MARKER_FILE).exists());
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn test_invalid_settings_on_disk_skip_the_site() {
        let temp_dir = tempdir().unwrap();
        let backups = make_site(temp_dir.path(), "example.com");
        std::fs::create_dir_all(&backups).unwrap();
        std::fs::write(
            backups.join(SETTINGS_FILE),
            r#"{"enabled":true,"time":"09:00","retention":0,"include_db":false}"#,
        )
        .unwrap();
        std::fs::create_dir_all(backups.join("20240101_000000")).unwrap();

        let (scheduler, registry) = scheduler(temp_dir.path());
        let report = scheduler.run_cycle(at(3, 9, 5)).await;

        assert_eq!(report.failed, vec!["example.com".to_string()]);
        assert!(report.triggered.is_empty());
        assert_eq!(registry.len(), 0);
        assert!(backups.join("20240101_000000").is_dir());
        assert!(!backups.join(MARKER_FILE).exists());
    }

    #[tokio::test]
    async fn test_marker_write_failure_still_prunes() {
        let temp_dir = tempdir().unwrap();
        let backups = make_site(temp_dir.path(), "example.com");
        let settings = ScheduleSettings {
            retention: 1,
            include_db: false,
            ..daily("09:00")
        };
        save_settings(&backups, &settings).await.unwrap();
        std::fs::create_dir_all(backups.join("20240101_000000")).unwrap();
        // A directory where the marker file belongs cannot be written
        std::fs::create_dir_all(backups.join(MARKER_FILE)).unwrap();

        let (scheduler, _registry) = scheduler(temp_dir.path());
        let report = scheduler.run_cycle(at(3, 9, 5)).await;

        assert_eq!(report.triggered.len(), 1);
        assert!(report.failed.is_empty());
        assert!(!backups.join("20240101_000000").exists());
    }

    #[tokio::test]
    async fn test_spawned_loop_stops_on_shutdown() {
        let temp_dir = tempdir().unwrap();
        let (scheduler, _registry) = scheduler(temp_dir.path());
        let shutdown = CancellationToken::new();

        let handle = scheduler.spawn(shutdown.clone());
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.cancel();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
