//! Escrow lifecycle
//!
//! Payments are taken, held in escrow, and released to the payee once the hold
//! window has passed and the rating gate is satisfied. Disputes block release
//! until resolved.
//!
//! Every status change goes through [`Store::update_escrow_if`], so two passes
//! racing on the same escrow end with one write and one logged no-op. A
//! release claims the escrow before the gateway moves any money and puts it
//! back if the transfer fails.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use tracing::{debug, error, info, warn};

use crate::error::{AppError, Result};
use crate::jobs::SharedConfig;
use crate::models::*;
use crate::ports::{Confirmation, Notifier, PaymentGateway, Store};
use crate::services::fee_service::FeeSchedule;
use crate::services::notification_service::Notification;

/// Business rules for intake and release.
#[derive(Debug, Clone)]
pub struct EscrowPolicy {
    pub min_amount: Decimal,
    pub max_amount: Decimal,
    pub currency: String,
    pub fees: FeeSchedule,
    /// Mandatory hold after confirmation.
    pub hold: Duration,
    /// Extra wait for a rating once the hold expires.
    pub grace_period: Duration,
}

impl Default for EscrowPolicy {
    fn default() -> Self {
        Self {
            min_amount: Decimal::new(5, 0),
            max_amount: Decimal::new(50, 0),
            currency: DEFAULT_CURRENCY.to_string(),
            fees: FeeSchedule::default(),
            hold: Duration::hours(24),
            grace_period: Duration::hours(24),
        }
    }
}

/// Which branch of the release rules an escrow fell into.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReleaseDecision {
    Disputed,
    InsideHoldWindow,
    RatingApproved,
    BelowMinimumRating { rating: f64, minimum: f64 },
    AwaitingRating,
    NoRatingAfterGrace,
}

impl ReleaseDecision {
    pub fn is_eligible(&self) -> bool {
        matches!(self, Self::RatingApproved | Self::NoRatingAfterGrace)
    }
}

pub fn evaluate_release(
    escrow: &EscrowTransaction,
    now: DateTime<Utc>,
    grace_period: Duration,
) -> ReleaseDecision {
    if escrow.status == EscrowStatus::Disputed {
        return ReleaseDecision::Disputed;
    }
    if now < escrow.release_eligible_at {
        return ReleaseDecision::InsideHoldWindow;
    }

    if escrow.rating_received {
        let rating = escrow.actual_rating.unwrap_or(0.0);
        if rating >= escrow.min_rating_required {
            return ReleaseDecision::RatingApproved;
        }
        return ReleaseDecision::BelowMinimumRating {
            rating,
            minimum: escrow.min_rating_required,
        };
    }

    if now >= escrow.release_eligible_at + grace_period {
        ReleaseDecision::NoRatingAfterGrace
    } else {
        ReleaseDecision::AwaitingRating
    }
}

/// Release eligibility under the default 24h grace period.
pub fn is_auto_release_eligible(escrow: &EscrowTransaction, now: DateTime<Utc>) -> bool {
    evaluate_release(escrow, now, EscrowPolicy::default().grace_period).is_eligible()
}

/// Result of one auto-release pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReleaseSummary {
    /// Release attempts: `processed + failed`.
    pub validated: usize,
    pub processed: usize,
    pub failed: usize,
    pub errors: Vec<String>,
    pub total_released: Decimal,
}

enum PassOutcome {
    Released(Decimal),
    Skipped,
    Failed(String),
}

pub struct EscrowService {
    store: Arc<dyn Store>,
    gateway: Arc<dyn PaymentGateway>,
    notifier: Arc<dyn Notifier>,
    config: SharedConfig,
    policy: EscrowPolicy,
}

impl EscrowService {
    pub fn new(
        store: Arc<dyn Store>,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Arc<dyn Notifier>,
        config: SharedConfig,
        policy: EscrowPolicy,
    ) -> Self {
        Self {
            store,
            gateway,
            notifier,
            config,
            policy,
        }
    }

    pub fn policy(&self) -> &EscrowPolicy {
        &self.policy
    }

    pub fn notifier(&self) -> &Arc<dyn Notifier> {
        &self.notifier
    }

    pub async fn payment(&self, id: &str) -> Result<Payment> {
        self.store
            .get_payment(id)
            .await?
            .ok_or_else(|| AppError::NotFound {
                kind: "payment",
                id: id.to_string(),
            })
    }

    pub async fn escrow(&self, id: &str) -> Result<EscrowTransaction> {
        self.store
            .get_escrow(id)
            .await?
            .ok_or_else(|| AppError::NotFound {
                kind: "escrow",
                id: id.to_string(),
            })
    }

    pub async fn create_payment(&self, request: CreatePayment) -> Result<Payment> {
        info!(
            payer = %request.payer_id,
            payee = %request.payee_id,
            amount = %request.amount,
            "creating payment"
        );
        self.validate_request(&request)?;

        let fees = self.policy.fees.calculate(request.amount);
        let mut payment = Payment {
            id: uuid::Uuid::new_v4().to_string(),
            payer_id: request.payer_id,
            payee_id: request.payee_id,
            amount: request.amount,
            platform_fee: fees.platform_fee,
            processing_fee: fees.processing_fee,
            net_amount: fees.net_amount,
            currency: request
                .currency
                .unwrap_or_else(|| self.policy.currency.clone()),
            status: PaymentStatus::Pending,
            created_at: Utc::now(),
            confirmed_at: None,
            failure_reason: None,
            provider_reference: None,
            client_secret: None,
            escrow_id: None,
            refunded_at: None,
            refund_amount: None,
        };

        let held = self
            .gateway
            .create_held_payment(&payment, &payment.payee_id)
            .await?;
        payment.provider_reference = Some(held.provider_reference);
        payment.client_secret = Some(held.client_secret);

        self.store.put_payment(&payment).await?;
        info!(payment_id = %payment.id, "payment created");
        Ok(payment)
    }

    /// Confirms with the gateway and opens the escrow on success.
    pub async fn confirm_payment(
        &self,
        payment_id: &str,
    ) -> Result<(Payment, EscrowTransaction)> {
        let mut payment = self.payment(payment_id).await?;
        if payment.status != PaymentStatus::Pending {
            return Err(AppError::validation(format!(
                "payment cannot be confirmed, current status: {}",
                payment.status
            )));
        }
        let reference = provider_reference(&payment)?.to_string();

        let now = Utc::now();
        match self.gateway.confirm(&reference).await? {
            Confirmation::Succeeded => {
                let escrow = EscrowTransaction::held(
                    &payment,
                    now,
                    self.policy.hold,
                    self.config.current().min_rating_for_auto_release,
                );
                payment.status = PaymentStatus::Confirmed;
                payment.confirmed_at = Some(now);
                payment.escrow_id = Some(escrow.id.clone());

                self.store.put_escrow(&escrow).await?;
                self.store.put_payment(&payment).await?;
                info!(payment_id, escrow_id = %escrow.id, "payment confirmed, funds held");
                Ok((payment, escrow))
            }
            Confirmation::Failed { reason } => {
                payment.status = PaymentStatus::Failed;
                payment.confirmed_at = Some(now);
                payment.failure_reason = Some(reason.clone());
                if let Err(e) = self.store.put_payment(&payment).await {
                    warn!(payment_id, error = %e, "failed to persist payment failure");
                }
                warn!(payment_id, %reason, "payment failed");
                Err(AppError::PaymentFailed { reason })
            }
        }
    }

    /// Manual release, allowed from `held` or `approved` only.
    pub async fn release_escrow(&self, escrow_id: &str, reason: &str) -> Result<EscrowTransaction> {
        info!(escrow_id, reason, "processing escrow release");
        let escrow = self.escrow(escrow_id).await?;
        if !matches!(escrow.status, EscrowStatus::Held | EscrowStatus::Approved) {
            return Err(AppError::InvalidEscrowState {
                status: escrow.status.to_string(),
            });
        }

        let amount = escrow.amount;
        match self.settle(escrow, reason, Utc::now()).await? {
            Some(released) => {
                self.notifier
                    .notify(Notification::ReleaseSucceeded {
                        escrow_id: escrow_id.to_string(),
                        amount,
                        reason: reason.to_string(),
                    })
                    .await;
                Ok(released)
            }
            None => {
                let current = self.escrow(escrow_id).await?;
                Err(AppError::InvalidEscrowState {
                    status: current.status.to_string(),
                })
            }
        }
    }

    /// Refunds a confirmed payment and closes its escrow.
    pub async fn refund(&self, payment_id: &str, amount: Decimal, reason: &str) -> Result<Payment> {
        info!(payment_id, %amount, reason, "processing refund");
        let mut payment = self.payment(payment_id).await?;
        if payment.status != PaymentStatus::Confirmed {
            return Err(AppError::InvalidPaymentState {
                status: payment.status.to_string(),
            });
        }
        if amount <= Decimal::ZERO || amount > payment.amount {
            return Err(AppError::validation(format!(
                "refund amount must be between 0 and {:.2}",
                payment.amount
            )));
        }

        self.gateway
            .refund(provider_reference(&payment)?, amount, reason)
            .await?;

        let now = Utc::now();
        payment.status = PaymentStatus::Refunded;
        payment.refunded_at = Some(now);
        payment.refund_amount = Some(amount);
        self.store.put_payment(&payment).await?;

        if let Some(escrow_id) = payment.escrow_id.as_deref() {
            self.close_refunded_escrow(escrow_id).await?;
        }

        info!(payment_id, "refund processed");
        Ok(payment)
    }

    async fn close_refunded_escrow(&self, escrow_id: &str) -> Result<()> {
        let Some(mut escrow) = self.store.get_escrow(escrow_id).await? else {
            warn!(escrow_id, "refunded payment points at a missing escrow");
            return Ok(());
        };
        if escrow.status.is_terminal() {
            return Ok(());
        }
        let expected = escrow.status;
        escrow.status = EscrowStatus::Refunded;
        if !self.store.update_escrow_if(&escrow, expected).await? {
            warn!(escrow_id, "escrow changed while refunding");
        }
        Ok(())
    }

    pub async fn record_rating(
        &self,
        escrow_id: &str,
        rating: f64,
        reviewer_id: &str,
    ) -> Result<EscrowTransaction> {
        info!(escrow_id, rating, "updating escrow rating");
        if !(0.0..=5.0).contains(&rating) {
            return Err(AppError::validation("rating must be between 0 and 5"));
        }

        let mut escrow = self.escrow(escrow_id).await?;
        if escrow.status.is_terminal() || escrow.status == EscrowStatus::Disputed {
            return Err(AppError::validation(format!(
                "escrow cannot be rated, current status: {}",
                escrow.status
            )));
        }

        let expected = escrow.status;
        escrow.rating_received = true;
        escrow.actual_rating = Some(rating);
        escrow.reviewed_by = Some(reviewer_id.to_string());
        if rating >= escrow.min_rating_required {
            escrow.rating_approved = true;
            escrow.status = EscrowStatus::Approved;
        } else {
            // left for manual review
            escrow.rating_approved = false;
            escrow.status = EscrowStatus::Held;
        }

        self.write_transition(&escrow, expected).await?;
        info!(escrow_id, approved = escrow.rating_approved, "escrow rating updated");
        Ok(escrow)
    }

    pub async fn open_dispute(&self, escrow_id: &str, reason: &str) -> Result<EscrowTransaction> {
        let mut escrow = self.escrow(escrow_id).await?;
        if !escrow.status.awaits_release() {
            return Err(AppError::validation(format!(
                "escrow cannot be disputed, current status: {}",
                escrow.status
            )));
        }

        let expected = escrow.status;
        escrow.status = EscrowStatus::Disputed;
        escrow.dispute_reason = Some(reason.to_string());
        escrow.disputed_at = Some(Utc::now());
        self.write_transition(&escrow, expected).await?;
        info!(escrow_id, reason, "dispute opened");
        Ok(escrow)
    }

    pub async fn resolve_dispute(
        &self,
        escrow_id: &str,
        resolution: &str,
    ) -> Result<EscrowTransaction> {
        let mut escrow = self.escrow(escrow_id).await?;
        if escrow.status != EscrowStatus::Disputed {
            return Err(AppError::validation(format!(
                "escrow has no open dispute, current status: {}",
                escrow.status
            )));
        }

        escrow.status = EscrowStatus::Resolved;
        escrow.resolution = Some(resolution.to_string());
        escrow.resolved_at = Some(Utc::now());
        self.write_transition(&escrow, EscrowStatus::Disputed).await?;
        info!(escrow_id, resolution, "dispute resolved");
        Ok(escrow)
    }

    /// One auto-release pass over every escrow past its hold deadline.
    pub async fn process_automatic_releases(&self, now: DateTime<Utc>) -> Result<ReleaseSummary> {
        let escrows = self.store.escrows_awaiting_release(now).await?;
        debug!(count = escrows.len(), "escrows past hold deadline");

        let examined = escrows.len();
        let mut summary = ReleaseSummary::default();
        for escrow in escrows {
            let escrow_id = escrow.id.clone();
            match self.auto_release_one(escrow, now).await {
                PassOutcome::Released(amount) => {
                    summary.processed += 1;
                    summary.total_released += amount;
                }
                PassOutcome::Skipped => {}
                PassOutcome::Failed(error) => {
                    summary.failed += 1;
                    summary.errors.push(format!("Escrow {escrow_id}: {error}"));
                }
            }
        }

        summary.validated = summary.processed + summary.failed;
        info!(
            examined,
            validated = summary.validated,
            processed = summary.processed,
            failed = summary.failed,
            "auto-release pass completed"
        );
        Ok(summary)
    }

    async fn auto_release_one(&self, mut escrow: EscrowTransaction, now: DateTime<Utc>) -> PassOutcome {
        match evaluate_release(&escrow, now, self.policy.grace_period) {
            ReleaseDecision::Disputed | ReleaseDecision::InsideHoldWindow => PassOutcome::Skipped,
            ReleaseDecision::BelowMinimumRating { rating, minimum } => {
                self.notifier
                    .notify(Notification::ManualReview {
                        escrow_id: escrow.id.clone(),
                        rating,
                        minimum,
                    })
                    .await;
                PassOutcome::Skipped
            }
            ReleaseDecision::AwaitingRating => {
                if escrow.status != EscrowStatus::PendingRating {
                    let expected = escrow.status;
                    escrow.status = EscrowStatus::PendingRating;
                    if let Err(e) = self.store.update_escrow_if(&escrow, expected).await {
                        warn!(escrow_id = %escrow.id, error = %e, "failed to mark escrow pending rating");
                    }
                }
                PassOutcome::Skipped
            }
            decision @ (ReleaseDecision::RatingApproved | ReleaseDecision::NoRatingAfterGrace) => {
                if decision == ReleaseDecision::NoRatingAfterGrace {
                    info!(escrow_id = %escrow.id, "releasing escrow with no rating after grace period");
                }
                self.auto_release(escrow, decision, now).await
            }
        }
    }

    async fn auto_release(
        &self,
        candidate: EscrowTransaction,
        decision: ReleaseDecision,
        now: DateTime<Utc>,
    ) -> PassOutcome {
        // another pass may have got here first
        let mut escrow = match self.store.get_escrow(&candidate.id).await {
            Ok(Some(fresh)) if fresh.status.awaits_release() => fresh,
            Ok(_) => {
                debug!(escrow_id = %candidate.id, "escrow no longer releasable, skipping");
                return PassOutcome::Skipped;
            }
            Err(e) => return self.release_failed(&candidate, e.to_string()).await,
        };
        if decision == ReleaseDecision::RatingApproved {
            escrow.rating_approved = true;
        }

        let amount = escrow.amount;
        let escrow_id = escrow.id.clone();
        match self.settle(escrow, AUTO_RELEASE_REASON, now).await {
            Ok(Some(_)) => {
                info!(escrow_id = %escrow_id, %amount, "auto-released escrow");
                self.notifier
                    .notify(Notification::ReleaseSucceeded {
                        escrow_id,
                        amount,
                        reason: AUTO_RELEASE_REASON.to_string(),
                    })
                    .await;
                PassOutcome::Released(amount)
            }
            Ok(None) => PassOutcome::Skipped,
            Err(e) => self.release_failed(&candidate, e.to_string()).await,
        }
    }

    async fn release_failed(&self, escrow: &EscrowTransaction, error: String) -> PassOutcome {
        warn!(escrow_id = %escrow.id, %error, "failed to auto-release escrow");
        self.notifier
            .notify(Notification::ReleaseFailed {
                escrow_id: escrow.id.clone(),
                amount: escrow.amount,
                error: error.clone(),
            })
            .await;
        PassOutcome::Failed(error)
    }

    /// Claims the record as `released`, then moves the funds.
    ///
    /// Returns `None` when another writer changed the escrow first; no money
    /// moves in that case. A gateway failure puts the original record back.
    async fn settle(
        &self,
        escrow: EscrowTransaction,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<EscrowTransaction>> {
        let expected = escrow.status;
        let mut claimed = escrow.clone();
        claimed.status = EscrowStatus::Released;
        claimed.released_at = Some(now);
        claimed.release_reason = Some(reason.to_string());

        if !self.store.update_escrow_if(&claimed, expected).await? {
            warn!(escrow_id = %escrow.id, "escrow changed before release, leaving it to the other writer");
            return Ok(None);
        }

        if let Err(e) = self.gateway.release_funds(&claimed).await {
            match self
                .store
                .update_escrow_if(&escrow, EscrowStatus::Released)
                .await
            {
                Ok(true) => {}
                Ok(false) => error!(escrow_id = %escrow.id, "escrow moved while rolling back a failed release"),
                Err(store_err) => {
                    error!(escrow_id = %escrow.id, error = %store_err, "failed to roll back escrow after gateway error")
                }
            }
            return Err(e.into());
        }
        Ok(Some(claimed))
    }

    /// Reminds payers who have not rated a recent escrow.
    pub async fn send_rating_reminders(&self, now: DateTime<Utc>, deadline_days: u32) -> Result<usize> {
        let held_from = now - Duration::days(i64::from(deadline_days));
        let held_to = now - Duration::hours(24);
        if held_to < held_from {
            return Ok(0);
        }

        let escrows = self.store.escrows_awaiting_rating(held_from, held_to).await?;
        let mut sent = 0;
        for escrow in escrows {
            if escrow.rating_received
                || !matches!(escrow.status, EscrowStatus::Held | EscrowStatus::PendingRating)
            {
                continue;
            }
            debug!(escrow_id = %escrow.id, payer = %escrow.payer_id, "sending rating reminder");
            self.notifier
                .notify(Notification::RatingReminder {
                    escrow_id: escrow.id,
                    payer_id: escrow.payer_id,
                    payee_id: escrow.payee_id,
                })
                .await;
            sent += 1;
        }
        Ok(sent)
    }

    /// Flags disputes open longer than `escalation_hours`, once each.
    pub async fn escalate_stale_disputes(
        &self,
        now: DateTime<Utc>,
        escalation_hours: u32,
    ) -> Result<usize> {
        let threshold = Duration::hours(i64::from(escalation_hours));
        let mut escalated = 0;

        for mut escrow in self.store.open_disputes().await? {
            let Some(disputed_at) = escrow.disputed_at else {
                continue;
            };
            if escrow.status != EscrowStatus::Disputed
                || escrow.escalated_at.is_some()
                || disputed_at + threshold > now
            {
                continue;
            }

            escrow.escalated_at = Some(now);
            if !self
                .store
                .update_escrow_if(&escrow, EscrowStatus::Disputed)
                .await?
            {
                continue;
            }

            warn!(escrow_id = %escrow.id, "escalating stale dispute");
            self.notifier
                .notify(Notification::DisputeEscalation {
                    escrow_id: escrow.id.clone(),
                    amount: escrow.amount,
                    open_hours: (now - disputed_at).num_hours(),
                    reason: escrow.dispute_reason.clone(),
                })
                .await;
            escalated += 1;
        }
        Ok(escalated)
    }

    async fn write_transition(&self, escrow: &EscrowTransaction, expected: EscrowStatus) -> Result<()> {
        if self.store.update_escrow_if(escrow, expected).await? {
            return Ok(());
        }
        let current = self.escrow(&escrow.id).await?;
        Err(AppError::validation(format!(
            "escrow changed concurrently, current status: {}",
            current.status
        )))
    }

    fn validate_request(&self, request: &CreatePayment) -> Result<()> {
        if request.payer_id.trim().is_empty() {
            return Err(AppError::validation("payerId is required"));
        }
        if request.payee_id.trim().is_empty() {
            return Err(AppError::validation("payeeId is required"));
        }
        if request.amount < self.policy.min_amount {
            return Err(AppError::validation(format!(
                "minimum payment amount is €{:.2}",
                self.policy.min_amount
            )));
        }
        if request.amount > self.policy.max_amount {
            return Err(AppError::validation(format!(
                "maximum payment amount is €{:.2}",
                self.policy.max_amount
            )));
        }
        Ok(())
    }
}

fn provider_reference(payment: &Payment) -> Result<&str> {
    payment
        .provider_reference
        .as_deref()
        .ok_or_else(|| AppError::validation("payment has no provider reference"))
}
