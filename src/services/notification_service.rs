//! Outbound notifications
//!
//! Escrow and job events are posted to a chat webhook. Delivery is fire and
//! forget: a failed post is logged, and a notifier without a webhook URL drops
//! every message silently.

use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, warn};

use crate::infrastructure::http_client;
use crate::ports::Notifier;

#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// A rating came in below the escrow's minimum.
    ManualReview {
        escrow_id: String,
        rating: f64,
        minimum: f64,
    },
    ReleaseSucceeded {
        escrow_id: String,
        amount: Decimal,
        reason: String,
    },
    ReleaseFailed {
        escrow_id: String,
        amount: Decimal,
        error: String,
    },
    JobSummary {
        validated: usize,
        processed: usize,
        failed: usize,
        total_released: Decimal,
        runtime: Duration,
    },
    RatingReminder {
        escrow_id: String,
        payer_id: String,
        payee_id: String,
    },
    DisputeEscalation {
        escrow_id: String,
        amount: Decimal,
        open_hours: i64,
        reason: Option<String>,
    },
}

impl Notification {
    /// Chat-formatted text for the webhook.
    pub fn render(&self) -> String {
        match self {
            Self::ManualReview {
                escrow_id,
                rating,
                minimum,
            } => format!(
                "*Escrow Manual Review Required*\n\nEscrow ID: {escrow_id}\nActual Rating: {rating:.1}\nMinimum Required: {minimum:.1}\n\nThis escrow requires manual review due to poor rating."
            ),
            Self::ReleaseSucceeded {
                escrow_id,
                amount,
                reason,
            } => format!(
                "*Escrow Payment Processed Successfully*\n\nEscrow ID: {escrow_id}\nAmount: €{amount:.2}\nReason: {reason}\nStatus: Released"
            ),
            Self::ReleaseFailed {
                escrow_id,
                amount,
                error,
            } => format!(
                "*Escrow Payment Processing Failed*\n\nEscrow ID: {escrow_id}\nAmount: €{amount:.2}\nError: {error}\nStatus: Failed"
            ),
            Self::JobSummary {
                validated,
                processed,
                failed,
                total_released,
                runtime,
            } => {
                let status = if *failed > 0 {
                    "Completed with Issues"
                } else if *processed > 0 {
                    "Completed Successfully"
                } else {
                    "No Payments to Process"
                };
                let released = if total_released.is_zero() {
                    "No payments released".to_string()
                } else {
                    format!("€{total_released:.2}")
                };
                format!(
                    "*Payment Processing Job {status}*\n\nPayments Validated: {validated}\nSuccessfully Processed: {processed}\nFailed: {failed}\nTotal Released: {released}\nRuntime: {}s",
                    runtime.as_secs()
                )
            }
            Self::RatingReminder {
                escrow_id,
                payer_id,
                payee_id,
            } => format!(
                "*Rating Reminder*\n\nPlayer {payer_id} has not rated organizer {payee_id} yet (escrow {escrow_id})."
            ),
            Self::DisputeEscalation {
                escrow_id,
                amount,
                open_hours,
                reason,
            } => format!(
                "*Dispute Escalation*\n\nEscrow ID: {escrow_id}\nAmount: €{amount:.2}\nOpen for: {open_hours}h\nReason: {}",
                reason.as_deref().unwrap_or("not given")
            ),
        }
    }
}

#[derive(Serialize)]
struct SlackMessage<'a> {
    text: &'a str,
}

/// Posts notifications to a Slack-compatible incoming webhook.
#[derive(Debug, Clone, Default)]
pub struct SlackNotifier {
    webhook_url: Option<String>,
}

impl SlackNotifier {
    pub fn new(webhook_url: Option<String>) -> Self {
        Self {
            webhook_url: webhook_url.filter(|url| !url.trim().is_empty()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.webhook_url.is_some()
    }
}

#[async_trait]
impl Notifier for SlackNotifier {
    async fn notify(&self, notification: Notification) {
        let Some(url) = self.webhook_url.as_deref() else {
            debug!(?notification, "webhook not configured, skipping notification");
            return;
        };

        let text = notification.render();
        match http_client::post_json(url, &SlackMessage { text: &text }).await {
            Ok(()) => debug!("notification delivered"),
            Err(e) => match e.status() {
                Some(status) => warn!(%status, "webhook rejected notification"),
                None => warn!(error = %e, "failed to send notification"),
            },
        }
    }
}
