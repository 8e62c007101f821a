//! Job bodies.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};

use crate::error::Result;
use crate::jobs::{JobKind, SharedConfig};
use crate::services::escrow_service::EscrowService;
use crate::services::notification_service::Notification;

/// What a finished job reports back to the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobReport {
    pub message: String,
    /// The run completed but some items failed.
    pub failed: bool,
}

impl JobReport {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            failed: false,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            failed: true,
        }
    }
}

/// Runs one invocation of a job body.
///
/// Bodies may run concurrently with themselves (a manual trigger landing on a
/// scheduled run) and must tolerate it.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, kind: JobKind) -> Result<JobReport>;
}

/// The escrow jobs: rating reminders, auto-release and dispute escalation.
pub struct EscrowJobs {
    escrow: Arc<EscrowService>,
    config: SharedConfig,
}

impl EscrowJobs {
    pub fn new(escrow: Arc<EscrowService>, config: SharedConfig) -> Self {
        Self { escrow, config }
    }

    async fn rating_reminders(&self) -> Result<JobReport> {
        let config = self.config.current();
        let sent = self
            .escrow
            .send_rating_reminders(Utc::now(), config.rating_deadline_days)
            .await?;
        Ok(JobReport::success(format!(
            "Successfully sent {sent} rating reminders"
        )))
    }

    async fn auto_release(&self) -> Result<JobReport> {
        let started = Instant::now();
        let summary = self.escrow.process_automatic_releases(Utc::now()).await?;

        for error in summary.errors.iter().take(3) {
            warn!(%error, "auto-release error");
        }

        self.escrow
            .notifier()
            .notify(Notification::JobSummary {
                validated: summary.validated,
                processed: summary.processed,
                failed: summary.failed,
                total_released: summary.total_released,
                runtime: started.elapsed(),
            })
            .await;

        if summary.failed > 0 {
            Ok(JobReport::failure(format!(
                "Processed {} releases, {} failed (errors: {})",
                summary.processed,
                summary.failed,
                summary.errors.len()
            )))
        } else {
            Ok(JobReport::success(format!(
                "Successfully processed {} automatic releases",
                summary.processed
            )))
        }
    }

    async fn dispute_escalation(&self) -> Result<JobReport> {
        let config = self.config.current();
        let escalated = self
            .escrow
            .escalate_stale_disputes(Utc::now(), config.dispute_escalation_hours)
            .await?;
        if escalated > 0 {
            info!(escalated, "disputes escalated");
        }
        Ok(JobReport::success(format!(
            "Escalated {escalated} disputes open longer than {}h",
            config.dispute_escalation_hours
        )))
    }
}

#[async_trait]
impl JobExecutor for EscrowJobs {
    async fn execute(&self, kind: JobKind) -> Result<JobReport> {
        match kind {
            JobKind::RatingReminder => self.rating_reminders().await,
            JobKind::AutoRelease => self.auto_release().await,
            JobKind::DisputeEscalation => self.dispute_escalation().await,
        }
    }
}
