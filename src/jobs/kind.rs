use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::jobs::JobConfig;

/// The closed set of recurring background jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    RatingReminder,
    AutoRelease,
    DisputeEscalation,
}

impl JobKind {
    pub const ALL: [JobKind; 3] = [
        JobKind::RatingReminder,
        JobKind::AutoRelease,
        JobKind::DisputeEscalation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RatingReminder => "rating_reminder",
            Self::AutoRelease => "auto_release",
            Self::DisputeEscalation => "dispute_escalation",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::RatingReminder => "Rating Reminder",
            Self::AutoRelease => "Auto Release",
            Self::DisputeEscalation => "Dispute Escalation",
        }
    }

    pub fn interval(&self, config: &JobConfig) -> Duration {
        match self {
            Self::RatingReminder => config.rating_reminder_interval,
            Self::AutoRelease => config.auto_release_interval,
            Self::DisputeEscalation => config.dispute_escalation_interval,
        }
    }

    pub fn valid_names() -> Vec<&'static str> {
        Self::ALL.iter().map(JobKind::as_str).collect()
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = AppError;

    /// Accepts `auto_release` and the route form `auto-release`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| AppError::UnknownJob {
                name: s.to_string(),
            })
    }
}
