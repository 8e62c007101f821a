//! Domain models and data structures
//!
//! This module contains the payment and escrow records plus the job telemetry
//! types. These are plain data; transitions live in the services.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::jobs::JobKind;

pub const DEFAULT_CURRENCY: &str = "EUR";

/// Release reason stamped by the auto-release job.
pub const AUTO_RELEASE_REASON: &str = "automatic_release";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Confirmed,
    Failed,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Failed => "failed",
            Self::Refunded => "refunded",
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscrowStatus {
    Held,
    PendingRating,
    Approved,
    Released,
    Disputed,
    Resolved,
    Refunded,
}

impl EscrowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Held => "held",
            Self::PendingRating => "pending_rating",
            Self::Approved => "approved",
            Self::Released => "released",
            Self::Disputed => "disputed",
            Self::Resolved => "resolved",
            Self::Refunded => "refunded",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Released | Self::Refunded | Self::Resolved)
    }

    /// Funds are still held and may be released by the auto-release pass.
    pub fn awaits_release(&self) -> bool {
        matches!(self, Self::Held | Self::PendingRating | Self::Approved)
    }
}

impl fmt::Display for EscrowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payment request from clients
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePayment {
    pub payer_id: String,
    pub payee_id: String,
    pub amount: Decimal,
    #[serde(default)]
    pub currency: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RefundRequest {
    pub amount: Decimal,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReleaseRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RatingRequest {
    pub rating: f64,
    pub reviewer_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DisputeRequest {
    pub reason: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResolveRequest {
    pub resolution: String,
}

/// A request to move a fixed gross amount from a payer to a payee.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payment {
    pub id: String,
    pub payer_id: String,
    pub payee_id: String,
    pub amount: Decimal,
    pub platform_fee: Decimal,
    pub processing_fee: Decimal,
    pub net_amount: Decimal,
    pub currency: String,
    pub status: PaymentStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escrow_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refunded_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refund_amount: Option<Decimal>,
}

/// Funds held in trust pending release conditions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EscrowTransaction {
    pub id: String,
    pub payment_id: String,
    pub payer_id: String,
    pub payee_id: String,
    pub amount: Decimal,
    pub status: EscrowStatus,
    pub held_at: DateTime<Utc>,
    pub release_eligible_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub released_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_reason: Option<String>,
    pub rating_received: bool,
    pub rating_approved: bool,
    pub min_rating_required: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_rating: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviewed_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dispute_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disputed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
}

impl EscrowTransaction {
    /// A freshly held escrow for a confirmed payment.
    pub fn held(
        payment: &Payment,
        held_at: DateTime<Utc>,
        hold: chrono::Duration,
        min_rating_required: f64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            payment_id: payment.id.clone(),
            payer_id: payment.payer_id.clone(),
            payee_id: payment.payee_id.clone(),
            amount: payment.net_amount,
            status: EscrowStatus::Held,
            held_at,
            release_eligible_at: held_at + hold,
            released_at: None,
            release_reason: None,
            rating_received: false,
            rating_approved: false,
            min_rating_required,
            actual_rating: None,
            reviewed_by: None,
            dispute_reason: None,
            disputed_at: None,
            escalated_at: None,
            resolved_at: None,
            resolution: None,
        }
    }
}

/// Runtime telemetry for one recurring job
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub job_name: String,
    pub last_run: Option<DateTime<Utc>>,
    pub next_scheduled: DateTime<Utc>,
    pub last_result: String,
    pub run_count: u64,
    pub error_count: u64,
    #[serde(with = "duration_millis")]
    pub average_runtime: Duration,
    pub is_running: bool,
    pub enabled: bool,
}

/// Aggregate health of the job system
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobHealth {
    pub healthy: bool,
    pub total_jobs: usize,
    pub running_jobs: usize,
    pub failed_jobs: usize,
    pub last_health_check: DateTime<Utc>,
    pub job_statuses: BTreeMap<JobKind, JobStatus>,
}

pub(crate) mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

pub(crate) mod duration_millis {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }
}
