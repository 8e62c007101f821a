//! Per-job run statistics and aggregate health.

use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::jobs::{JobKind, SharedConfig};
use crate::models::{JobHealth, JobStatus};

pub const NOT_RUN_YET: &str = "Not run yet";

/// Concurrency-safe store of [`JobStatus`] records keyed by job kind.
///
/// Readers only ever receive copies.
#[derive(Debug)]
pub struct JobRegistry {
    config: SharedConfig,
    statuses: RwLock<HashMap<JobKind, JobStatus>>,
}

impl JobRegistry {
    pub fn new(config: SharedConfig) -> Self {
        Self {
            config,
            statuses: RwLock::new(HashMap::new()),
        }
    }

    pub fn initialize(&self, kinds: &[JobKind]) {
        let config = self.config.current();
        let now = Utc::now();
        let mut statuses = self.statuses.write().unwrap_or_else(PoisonError::into_inner);

        for kind in kinds {
            statuses.insert(
                *kind,
                JobStatus {
                    job_name: kind.display_name().to_string(),
                    last_run: None,
                    next_scheduled: after(now, kind.interval(&config)),
                    last_result: NOT_RUN_YET.to_string(),
                    run_count: 0,
                    error_count: 0,
                    average_runtime: Duration::ZERO,
                    is_running: false,
                    enabled: true,
                },
            );
        }
    }

    pub fn mark_running(&self, kind: JobKind) {
        let mut statuses = self.statuses.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(status) = statuses.get_mut(&kind) {
            status.is_running = true;
        }
    }

    pub fn record_outcome(
        &self,
        kind: JobKind,
        result: impl Into<String>,
        runtime: Duration,
        is_error: bool,
    ) {
        let config = self.config.current();
        let now = Utc::now();
        let mut statuses = self.statuses.write().unwrap_or_else(PoisonError::into_inner);

        if let Some(status) = statuses.get_mut(&kind) {
            status.last_run = Some(now);
            status.last_result = result.into();
            status.run_count += 1;
            status.average_runtime = runtime;
            status.is_running = false;
            if is_error {
                status.error_count += 1;
            }
            status.next_scheduled = after(now, kind.interval(&config));
        }
    }

    /// Recomputes `next_scheduled` from the current config.
    pub fn reschedule_all(&self) {
        let config = self.config.current();
        let now = Utc::now();
        let mut statuses = self.statuses.write().unwrap_or_else(PoisonError::into_inner);

        for (kind, status) in statuses.iter_mut() {
            status.next_scheduled = after(now, kind.interval(&config));
        }
    }

    pub fn snapshot(&self) -> BTreeMap<JobKind, JobStatus> {
        let statuses = self.statuses.read().unwrap_or_else(PoisonError::into_inner);
        statuses
            .iter()
            .map(|(kind, status)| (*kind, status.clone()))
            .collect()
    }

    pub fn status(&self, kind: JobKind) -> Option<JobStatus> {
        let statuses = self.statuses.read().unwrap_or_else(PoisonError::into_inner);
        statuses.get(&kind).cloned()
    }

    pub fn health(&self) -> JobHealth {
        let job_statuses = self.snapshot();
        let running_jobs = job_statuses.values().filter(|s| s.is_running).count();
        let failed_jobs = job_statuses.values().filter(|s| is_failing(s)).count();

        JobHealth {
            healthy: failed_jobs == 0,
            total_jobs: job_statuses.len(),
            running_jobs,
            failed_jobs,
            last_health_check: Utc::now(),
            job_statuses,
        }
    }
}

/// More than half of all runs errored.
fn is_failing(status: &JobStatus) -> bool {
    status.error_count > status.run_count / 2
}

fn after(now: DateTime<Utc>, interval: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(interval)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(now)
}
