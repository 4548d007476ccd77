//! In-memory registry of backup jobs
//!
//! The registry is the point of truth for what is running now. A single
//! mutex guards the map and is held only for the map operation itself,
//! never across I/O. Finished jobs are evicted after a retention window
//! and beyond a per-domain cap, so the map stays bounded.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backup::BackupError;

/// Which artifacts a job produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupKind {
    Database,
    Files,
    Both,
}

impl BackupKind {
    /// Derive the kind from schedule flags; `None` when nothing is selected
    pub fn from_flags(include_db: bool, include_files: bool) -> Option<Self> {
        match (include_db, include_files) {
            (true, true) => Some(BackupKind::Both),
            (true, false) => Some(BackupKind::Database),
            (false, true) => Some(BackupKind::Files),
            (false, false) => None,
        }
    }

    pub fn includes_database(self) -> bool {
        matches!(self, BackupKind::Database | BackupKind::Both)
    }

    pub fn includes_files(self) -> bool {
        matches!(self, BackupKind::Files | BackupKind::Both)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BackupKind::Database => "database",
            BackupKind::Files => "files",
            BackupKind::Both => "both",
        }
    }
}

impl FromStr for BackupKind {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "database" => Ok(BackupKind::Database),
            "files" => Ok(BackupKind::Files),
            "both" => Ok(BackupKind::Both),
            other => Err(BackupError::Validation(format!(
                "Unknown backup type: {}",
                other
            ))),
        }
    }
}

/// Lifecycle state of a job
///
/// `NotFound` is only ever produced by lookups of unknown ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Completed,
    Error,
    NotFound,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Error)
    }
}

/// Live status of one backup job
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobRecord {
    pub backup_id: String,
    pub domain: String,
    #[serde(rename = "type")]
    pub kind: BackupKind,
    pub status: JobStatus,
    pub progress: u8,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_folder: Option<String>,
    pub files: Vec<String>,
    pub started_at: NaiveDateTime,
}

impl JobRecord {
    /// A freshly started job
    pub fn started(backup_id: &str, domain: &str, kind: BackupKind, started_at: NaiveDateTime) -> Self {
        Self {
            backup_id: backup_id.to_string(),
            domain: domain.to_string(),
            kind,
            status: JobStatus::Running,
            progress: 0,
            message: "Starting backup...".to_string(),
            backup_folder: None,
            files: Vec::new(),
            started_at,
        }
    }
}

/// Result of a status lookup
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum JobLookup {
    Found(JobRecord),
    NotFound { status: JobStatus },
}

impl JobLookup {
    #[cfg(test)]
    pub fn status(&self) -> JobStatus {
        match self {
            JobLookup::Found(record) => record.status,
            JobLookup::NotFound { status } => *status,
        }
    }

    pub fn record(&self) -> Option<&JobRecord> {
        match self {
            JobLookup::Found(record) => Some(record),
            JobLookup::NotFound { .. } => None,
        }
    }
}

/// Eviction policy for finished jobs
#[derive(Debug, Clone, Copy)]
pub struct RegistryPolicy {
    /// How long a finished job stays queryable
    pub terminal_ttl: Duration,
    /// Maximum finished jobs kept per domain
    pub max_terminal_per_domain: usize,
}

impl Default for RegistryPolicy {
    fn default() -> Self {
        Self {
            terminal_ttl: Duration::from_secs(24 * 3600),
            max_terminal_per_domain: 20,
        }
    }
}

struct Entry {
    record: JobRecord,
    finished_at: Option<Instant>,
}

/// Registry of backup jobs keyed by job id
pub struct JobRegistry {
    jobs: Mutex<HashMap<String, Entry>>,
    policy: RegistryPolicy,
}

impl JobRegistry {
    pub fn new(policy: RegistryPolicy) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            policy,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        // A panic while holding the lock cannot leave an entry half-written
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert or replace a job record, evicting expired finished jobs
    pub fn put(&self, record: JobRecord) {
        let mut jobs = self.lock();
        let finished_at = record.status.is_terminal().then(Instant::now);
        jobs.insert(
            record.backup_id.clone(),
            Entry {
                record,
                finished_at,
            },
        );
        Self::sweep(&mut jobs, &self.policy);
    }

    /// Look up a job; unknown ids report `not_found`
    pub fn get(&self, job_id: &str) -> JobLookup {
        let jobs = self.lock();
        match jobs.get(job_id) {
            Some(entry) => JobLookup::Found(entry.record.clone()),
            None => JobLookup::NotFound {
                status: JobStatus::NotFound,
            },
        }
    }

    /// Running jobs of one domain, oldest first
    pub fn list_running_for(&self, domain: &str) -> Vec<JobRecord> {
        let jobs = self.lock();
        let mut running: Vec<JobRecord> = jobs
            .values()
            .filter(|e| e.record.domain == domain && e.record.status == JobStatus::Running)
            .map(|e| e.record.clone())
            .collect();
        running.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        running
    }

    /// Number of tracked jobs
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Advance a running job's progress and message
    ///
    /// Progress never moves backwards.
    pub fn set_progress(&self, job_id: &str, progress: u8, message: &str) -> bool {
        self.mutate(job_id, |record| {
            record.progress = record.progress.max(progress.min(100));
            record.message = message.to_string();
        })
    }

    /// Record the folder a running job writes into
    pub fn set_folder(&self, job_id: &str, folder: &str) -> bool {
        self.mutate(job_id, |record| {
            record.backup_folder = Some(folder.to_string());
        })
    }

    /// Append a produced artifact to a running job
    pub fn add_file(&self, job_id: &str, path: &str) -> bool {
        self.mutate(job_id, |record| {
            record.files.push(path.to_string());
        })
    }

    /// Mark a running job completed at 100%
    pub fn complete(&self, job_id: &str, message: &str) -> bool {
        self.mutate(job_id, |record| {
            record.status = JobStatus::Completed;
            record.progress = 100;
            record.message = message.to_string();
        })
    }

    /// Mark a running job failed
    pub fn fail(&self, job_id: &str, message: &str) -> bool {
        self.mutate(job_id, |record| {
            record.status = JobStatus::Error;
            record.message = message.to_string();
        })
    }

    /// Read-modify-write of a running entry under the lock
    ///
    /// Finished entries are final and are left untouched.
    fn mutate(&self, job_id: &str, f: impl FnOnce(&mut JobRecord)) -> bool {
        let mut jobs = self.lock();
        let Some(entry) = jobs.get_mut(job_id) else {
            return false;
        };
        if entry.record.status.is_terminal() {
            debug!(job_id, "Ignoring update to finished backup job");
            return false;
        }
        f(&mut entry.record);
        if entry.record.status.is_terminal() {
            entry.finished_at = Some(Instant::now());
        }
        true
    }

    fn sweep(jobs: &mut HashMap<String, Entry>, policy: &RegistryPolicy) {
        let now = Instant::now();
        jobs.retain(|_, entry| match entry.finished_at {
            Some(finished) => now.duration_since(finished) < policy.terminal_ttl,
            None => true,
        });

        let mut finished_by_domain: HashMap<&str, Vec<(Instant, &str)>> = HashMap::new();
        for (id, entry) in jobs.iter() {
            if let Some(finished) = entry.finished_at {
                finished_by_domain
                    .entry(entry.record.domain.as_str())
                    .or_default()
                    .push((finished, id.as_str()));
            }
        }

        let mut evict: Vec<String> = Vec::new();
        for (_, mut finished) in finished_by_domain {
            if finished.len() > policy.max_terminal_per_domain {
                finished.sort_by(|a, b| b.0.cmp(&a.0));
                evict.extend(
                    finished
                        .into_iter()
                        .skip(policy.max_terminal_per_domain)
                        .map(|(_, id)| id.to_string()),
                );
            }
        }
        for id in evict {
            jobs.remove(&id);
        }
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new(RegistryPolicy::default())
    }
}
