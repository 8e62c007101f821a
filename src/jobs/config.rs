use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::models::duration_secs;

/// Tunables shared by every job. Always fully specified; replaced whole.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobConfig {
    #[serde(with = "duration_secs")]
    pub rating_reminder_interval: Duration,
    #[serde(with = "duration_secs")]
    pub auto_release_interval: Duration,
    #[serde(with = "duration_secs")]
    pub dispute_escalation_interval: Duration,
    pub rating_deadline_days: u32,
    pub min_rating_for_auto_release: f64,
    pub dispute_escalation_hours: u32,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            rating_reminder_interval: Duration::from_secs(24 * 60 * 60),
            auto_release_interval: Duration::from_secs(60 * 60),
            dispute_escalation_interval: Duration::from_secs(24 * 60 * 60),
            rating_deadline_days: 7,
            min_rating_for_auto_release: 3.0,
            dispute_escalation_hours: 72,
        }
    }
}

impl JobConfig {
    pub fn validate(&self) -> Result<()> {
        let intervals = [
            ("ratingReminderInterval", self.rating_reminder_interval),
            ("autoReleaseInterval", self.auto_release_interval),
            ("disputeEscalationInterval", self.dispute_escalation_interval),
        ];
        for (name, interval) in intervals {
            if interval.is_zero() {
                return Err(AppError::validation(format!("{name} must be positive")));
            }
        }
        if self.rating_deadline_days == 0 {
            return Err(AppError::validation("ratingDeadlineDays must be positive"));
        }
        if self.dispute_escalation_hours == 0 {
            return Err(AppError::validation(
                "disputeEscalationHours must be positive",
            ));
        }
        if !(0.0..=5.0).contains(&self.min_rating_for_auto_release) {
            return Err(AppError::validation(
                "minRatingForAutoRelease must be between 0 and 5",
            ));
        }
        Ok(())
    }
}

/// Process-wide handle to the current [`JobConfig`].
///
/// Readers get an `Arc` to an immutable snapshot, so a running job never sees
/// a half-applied update.
#[derive(Debug, Clone)]
pub struct SharedConfig {
    inner: Arc<ArcSwap<JobConfig>>,
}

impl SharedConfig {
    pub fn new(config: JobConfig) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(config)),
        }
    }

    pub fn current(&self) -> Arc<JobConfig> {
        self.inner.load_full()
    }

    pub fn replace(&self, config: JobConfig) {
        self.inner.store(Arc::new(config));
    }
}

impl Default for SharedConfig {
    fn default() -> Self {
        Self::new(JobConfig::default())
    }
}
