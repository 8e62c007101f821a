use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use rust_decimal::Decimal;

use escrow_jobs::error::{AppError, GatewayError};
use escrow_jobs::infrastructure::MemoryStore;
use escrow_jobs::jobs::SharedConfig;
use escrow_jobs::models::*;
use escrow_jobs::ports::{Confirmation, HeldPayment, Notifier, PaymentGateway, Store};
use escrow_jobs::services::escrow_service::{EscrowPolicy, EscrowService};
use escrow_jobs::services::notification_service::Notification;

#[derive(Default)]
struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: Notification) {
        self.sent.lock().unwrap().push(notification);
    }
}

#[derive(Default)]
struct ScriptedGateway {
    decline: AtomicBool,
    fail_releases: AtomicBool,
    releases: AtomicUsize,
    refunds: AtomicUsize,
}

#[async_trait]
impl PaymentGateway for ScriptedGateway {
    async fn create_held_payment(
        &self,
        payment: &Payment,
        _payee_id: &str,
    ) -> Result<HeldPayment, GatewayError> {
        Ok(HeldPayment {
            provider_reference: format!("pi_{}", payment.id),
            client_secret: "secret".to_string(),
        })
    }

    async fn confirm(&self, _provider_reference: &str) -> Result<Confirmation, GatewayError> {
        if self.decline.load(Ordering::SeqCst) {
            Ok(Confirmation::Failed {
                reason: "card_declined".to_string(),
            })
        } else {
            Ok(Confirmation::Succeeded)
        }
    }

    async fn release_funds(&self, _escrow: &EscrowTransaction) -> Result<(), GatewayError> {
        if self.fail_releases.load(Ordering::SeqCst) {
            return Err(GatewayError::new("transfer rejected"));
        }
        self.releases.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn refund(
        &self,
        _provider_reference: &str,
        _amount: Decimal,
        _reason: &str,
    ) -> Result<(), GatewayError> {
        self.refunds.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Harness {
    service: Arc<EscrowService>,
    store: Arc<MemoryStore>,
    gateway: Arc<ScriptedGateway>,
    notifier: Arc<RecordingNotifier>,
}

fn harness() -> Harness {
    let store = Arc::new(MemoryStore::new());
    let gateway = Arc::new(ScriptedGateway::default());
    let notifier = Arc::new(RecordingNotifier::default());
    let service = Arc::new(EscrowService::new(
        store.clone(),
        gateway.clone(),
        notifier.clone(),
        SharedConfig::default(),
        EscrowPolicy::default(),
    ));
    Harness {
        service,
        store,
        gateway,
        notifier,
    }
}

fn request(amount: Decimal) -> CreatePayment {
    CreatePayment {
        payer_id: "player-1".to_string(),
        payee_id: "organizer-1".to_string(),
        amount,
        currency: None,
    }
}

impl Harness {
    async fn held_escrow(&self) -> (Payment, EscrowTransaction) {
        let payment = self
            .service
            .create_payment(request(Decimal::new(25, 0)))
            .await
            .unwrap();
        self.service.confirm_payment(&payment.id).await.unwrap()
    }

    async fn status(&self, escrow_id: &str) -> EscrowStatus {
        self.store.get_escrow(escrow_id).await.unwrap().unwrap().status
    }
}

#[tokio::test]
async fn create_and_confirm_opens_a_held_escrow() {
    let h = harness();
    let payment = h
        .service
        .create_payment(request(Decimal::new(25, 0)))
        .await
        .unwrap();
    assert_eq!(payment.status, PaymentStatus::Pending);
    assert_eq!(payment.platform_fee, Decimal::new(100, 2));
    assert_eq!(payment.processing_fee, Decimal::new(66, 2));
    assert_eq!(payment.net_amount, Decimal::new(2400, 2));
    assert_eq!(payment.currency, DEFAULT_CURRENCY);
    assert!(payment.provider_reference.is_some());

    let (payment, escrow) = h.service.confirm_payment(&payment.id).await.unwrap();
    assert_eq!(payment.status, PaymentStatus::Confirmed);
    assert_eq!(payment.escrow_id.as_deref(), Some(escrow.id.as_str()));
    assert_eq!(escrow.status, EscrowStatus::Held);
    assert_eq!(escrow.amount, payment.net_amount);
    assert_eq!(escrow.min_rating_required, 3.0);
    assert_eq!(escrow.release_eligible_at - escrow.held_at, Duration::hours(24));
}

#[tokio::test]
async fn amounts_outside_bounds_are_rejected() {
    let h = harness();
    for amount in [Decimal::new(499, 2), Decimal::new(5001, 2)] {
        let err = h.service.create_payment(request(amount)).await.unwrap_err();
        assert!(err.is_validation(), "{amount} should be rejected");
    }
}

#[tokio::test]
async fn declined_confirmation_fails_the_payment() {
    let h = harness();
    h.gateway.decline.store(true, Ordering::SeqCst);
    let payment = h
        .service
        .create_payment(request(Decimal::new(10, 0)))
        .await
        .unwrap();

    let err = h.service.confirm_payment(&payment.id).await.unwrap_err();
    assert!(matches!(err, AppError::PaymentFailed { ref reason } if reason == "card_declined"));

    let stored = h.service.payment(&payment.id).await.unwrap();
    assert_eq!(stored.status, PaymentStatus::Failed);
    assert_eq!(stored.failure_reason.as_deref(), Some("card_declined"));
    assert!(stored.escrow_id.is_none());
}

#[tokio::test]
async fn good_rating_is_released_after_the_hold() {
    let h = harness();
    let (_, escrow) = h.held_escrow().await;
    let rated = h
        .service
        .record_rating(&escrow.id, 4.5, "player-1")
        .await
        .unwrap();
    assert_eq!(rated.status, EscrowStatus::Approved);

    let summary = h
        .service
        .process_automatic_releases(escrow.held_at + Duration::hours(30))
        .await
        .unwrap();
    assert_eq!(summary.validated, 1);
    assert_eq!(summary.processed, 1);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.total_released, escrow.amount);

    let released = h.service.escrow(&escrow.id).await.unwrap();
    assert_eq!(released.status, EscrowStatus::Released);
    assert_eq!(released.release_reason.as_deref(), Some(AUTO_RELEASE_REASON));
    assert!(released.released_at.is_some());
    assert!(h.notifier.sent().contains(&Notification::ReleaseSucceeded {
        escrow_id: escrow.id.clone(),
        amount: escrow.amount,
        reason: AUTO_RELEASE_REASON.to_string(),
    }));
}

#[tokio::test]
async fn poor_rating_goes_to_manual_review() {
    let h = harness();
    let (_, escrow) = h.held_escrow().await;
    h.service
        .record_rating(&escrow.id, 2.0, "player-1")
        .await
        .unwrap();

    let summary = h
        .service
        .process_automatic_releases(escrow.held_at + Duration::hours(30))
        .await
        .unwrap();
    assert_eq!(summary.validated, 0);
    assert_eq!(summary.processed, 0);
    assert_eq!(summary.failed, 0);
    assert_eq!(h.status(&escrow.id).await, EscrowStatus::Held);
    assert_eq!(
        h.notifier.sent(),
        vec![Notification::ManualReview {
            escrow_id: escrow.id.clone(),
            rating: 2.0,
            minimum: 3.0,
        }]
    );
    assert_eq!(h.gateway.releases.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unrated_escrow_waits_for_the_grace_period() {
    let h = harness();
    let (_, escrow) = h.held_escrow().await;

    let summary = h
        .service
        .process_automatic_releases(escrow.release_eligible_at + Duration::hours(23))
        .await
        .unwrap();
    assert_eq!(summary.processed, 0);
    assert_eq!(h.status(&escrow.id).await, EscrowStatus::PendingRating);

    let summary = h
        .service
        .process_automatic_releases(escrow.release_eligible_at + Duration::hours(25))
        .await
        .unwrap();
    assert_eq!(summary.processed, 1);
    assert_eq!(h.status(&escrow.id).await, EscrowStatus::Released);
}

#[tokio::test]
async fn gateway_failure_leaves_escrow_untouched() {
    let h = harness();
    let (_, escrow) = h.held_escrow().await;
    h.service
        .record_rating(&escrow.id, 5.0, "player-1")
        .await
        .unwrap();
    h.gateway.fail_releases.store(true, Ordering::SeqCst);

    let summary = h
        .service
        .process_automatic_releases(escrow.held_at + Duration::hours(30))
        .await
        .unwrap();
    assert_eq!(summary.validated, 1);
    assert_eq!(summary.processed, 0);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.errors.len(), 1);
    assert!(summary.errors[0].contains(&escrow.id));
    assert!(h.notifier.sent().iter().any(|n| matches!(
        n,
        Notification::ReleaseFailed { escrow_id, .. } if *escrow_id == escrow.id
    )));

    let stored = h.service.escrow(&escrow.id).await.unwrap();
    assert_eq!(stored.status, EscrowStatus::Approved);
    assert!(stored.released_at.is_none());
    assert!(stored.release_reason.is_none());

    // the next pass retries once the gateway recovers
    h.gateway.fail_releases.store(false, Ordering::SeqCst);
    let summary = h
        .service
        .process_automatic_releases(escrow.held_at + Duration::hours(31))
        .await
        .unwrap();
    assert_eq!(summary.processed, 1);
    assert_eq!(h.status(&escrow.id).await, EscrowStatus::Released);
}

/// Writes a dispute from a stale read while the transfer is in flight.
struct DisputeDuringTransfer {
    store: Arc<MemoryStore>,
    seen_status: EscrowStatus,
    dispute_landed: AtomicBool,
    releases: AtomicUsize,
}

#[async_trait]
impl PaymentGateway for DisputeDuringTransfer {
    async fn create_held_payment(
        &self,
        payment: &Payment,
        _payee_id: &str,
    ) -> Result<HeldPayment, GatewayError> {
        Ok(HeldPayment {
            provider_reference: format!("pi_{}", payment.id),
            client_secret: "secret".to_string(),
        })
    }

    async fn confirm(&self, _provider_reference: &str) -> Result<Confirmation, GatewayError> {
        Ok(Confirmation::Succeeded)
    }

    async fn release_funds(&self, escrow: &EscrowTransaction) -> Result<(), GatewayError> {
        let mut disputed = escrow.clone();
        disputed.status = EscrowStatus::Disputed;
        disputed.dispute_reason = Some("no-show".to_string());
        disputed.disputed_at = Some(Utc::now());
        let landed = self
            .store
            .update_escrow_if(&disputed, self.seen_status)
            .await
            .map_err(|e| GatewayError::new(e.to_string()))?;
        self.dispute_landed.store(landed, Ordering::SeqCst);
        self.releases.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn refund(
        &self,
        _provider_reference: &str,
        _amount: Decimal,
        _reason: &str,
    ) -> Result<(), GatewayError> {
        Ok(())
    }
}

#[tokio::test]
async fn escrow_is_claimed_before_funds_move() {
    let store = Arc::new(MemoryStore::new());
    let gateway = Arc::new(DisputeDuringTransfer {
        store: store.clone(),
        seen_status: EscrowStatus::PendingRating,
        dispute_landed: AtomicBool::new(false),
        releases: AtomicUsize::new(0),
    });
    let notifier = Arc::new(RecordingNotifier::default());
    let service = EscrowService::new(
        store.clone(),
        gateway.clone(),
        notifier.clone(),
        SharedConfig::default(),
        EscrowPolicy::default(),
    );

    let payment = service
        .create_payment(request(Decimal::new(25, 0)))
        .await
        .unwrap();
    let (_, escrow) = service.confirm_payment(&payment.id).await.unwrap();
    service
        .process_automatic_releases(escrow.release_eligible_at + Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(
        service.escrow(&escrow.id).await.unwrap().status,
        EscrowStatus::PendingRating
    );

    let summary = service
        .process_automatic_releases(escrow.release_eligible_at + Duration::hours(25))
        .await
        .unwrap();
    assert_eq!(gateway.releases.load(Ordering::SeqCst), 1);
    assert!(!gateway.dispute_landed.load(Ordering::SeqCst));
    assert_eq!(summary.processed, 1);
    assert_eq!(summary.failed, 0);

    let released = service.escrow(&escrow.id).await.unwrap();
    assert_eq!(released.status, EscrowStatus::Released);
    assert!(released.dispute_reason.is_none());
    assert!(service.open_dispute(&escrow.id, "late").await.unwrap_err().is_validation());
    assert!(notifier.sent().iter().any(|n| matches!(
        n,
        Notification::ReleaseSucceeded { escrow_id, .. } if *escrow_id == escrow.id
    )));
}

#[tokio::test]
async fn disputed_escrow_is_never_released() {
    let h = harness();
    let (_, escrow) = h.held_escrow().await;
    h.service
        .open_dispute(&escrow.id, "no-show")
        .await
        .unwrap();

    let summary = h
        .service
        .process_automatic_releases(escrow.held_at + Duration::days(30))
        .await
        .unwrap();
    assert_eq!(summary.processed, 0);
    assert_eq!(h.status(&escrow.id).await, EscrowStatus::Disputed);

    let err = h
        .service
        .release_escrow(&escrow.id, "manual")
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "escrow cannot be released, current status: disputed"
    );

    let err = h
        .service
        .record_rating(&escrow.id, 5.0, "player-1")
        .await
        .unwrap_err();
    assert!(err.is_validation());
}

#[tokio::test]
async fn manual_release_moves_funds_once() {
    let h = harness();
    let (_, escrow) = h.held_escrow().await;

    let released = h
        .service
        .release_escrow(&escrow.id, "organizer_request")
        .await
        .unwrap();
    assert_eq!(released.status, EscrowStatus::Released);
    assert_eq!(released.release_reason.as_deref(), Some("organizer_request"));

    let err = h
        .service
        .release_escrow(&escrow.id, "organizer_request")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidEscrowState { ref status } if status == "released"));
    assert_eq!(h.gateway.releases.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn missing_records_are_not_found() {
    let h = harness();
    let err = h.service.release_escrow("nope", "manual").await.unwrap_err();
    assert!(matches!(err, AppError::NotFound { kind: "escrow", .. }));

    let err = h
        .service
        .refund("nope", Decimal::ONE, "duplicate")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound { kind: "payment", .. }));
}

#[tokio::test]
async fn refund_requires_a_confirmed_payment() {
    let h = harness();
    let payment = h
        .service
        .create_payment(request(Decimal::new(20, 0)))
        .await
        .unwrap();

    let err = h
        .service
        .refund(&payment.id, Decimal::new(20, 0), "cancelled")
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "payment cannot be refunded, current status: pending"
    );
    assert_eq!(h.gateway.refunds.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn refund_closes_the_escrow() {
    let h = harness();
    let (payment, escrow) = h.held_escrow().await;

    let err = h
        .service
        .refund(&payment.id, Decimal::new(26, 0), "cancelled")
        .await
        .unwrap_err();
    assert!(err.is_validation());

    let refunded = h
        .service
        .refund(&payment.id, Decimal::new(10, 0), "cancelled")
        .await
        .unwrap();
    assert_eq!(refunded.status, PaymentStatus::Refunded);
    assert_eq!(refunded.refund_amount, Some(Decimal::new(10, 0)));
    assert!(refunded.refunded_at.is_some());
    assert_eq!(h.status(&escrow.id).await, EscrowStatus::Refunded);

    let summary = h
        .service
        .process_automatic_releases(escrow.held_at + Duration::days(3))
        .await
        .unwrap();
    assert_eq!(summary.validated, 0);
}

#[tokio::test]
async fn late_rating_returns_pending_escrow_to_held() {
    let h = harness();
    let (_, escrow) = h.held_escrow().await;
    h.service
        .process_automatic_releases(escrow.release_eligible_at + Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(h.status(&escrow.id).await, EscrowStatus::PendingRating);

    let rated = h
        .service
        .record_rating(&escrow.id, 1.0, "player-1")
        .await
        .unwrap();
    assert_eq!(rated.status, EscrowStatus::Held);
    assert!(rated.rating_received);
    assert!(!rated.rating_approved);
    assert_eq!(rated.reviewed_by.as_deref(), Some("player-1"));

    let err = h
        .service
        .record_rating(&escrow.id, 5.5, "player-1")
        .await
        .unwrap_err();
    assert!(err.is_validation());
}

#[tokio::test]
async fn stale_disputes_are_escalated_once() {
    let h = harness();
    let (_, escrow) = h.held_escrow().await;
    let disputed = h
        .service
        .open_dispute(&escrow.id, "venue closed")
        .await
        .unwrap();
    let disputed_at = disputed.disputed_at.unwrap();

    let early = h
        .service
        .escalate_stale_disputes(disputed_at + Duration::hours(71), 72)
        .await
        .unwrap();
    assert_eq!(early, 0);

    let now = disputed_at + Duration::hours(73);
    assert_eq!(h.service.escalate_stale_disputes(now, 72).await.unwrap(), 1);
    assert_eq!(h.service.escalate_stale_disputes(now, 72).await.unwrap(), 0);

    let escalations: Vec<_> = h
        .notifier
        .sent()
        .into_iter()
        .filter(|n| matches!(n, Notification::DisputeEscalation { .. }))
        .collect();
    assert_eq!(
        escalations,
        vec![Notification::DisputeEscalation {
            escrow_id: escrow.id.clone(),
            amount: escrow.amount,
            open_hours: 73,
            reason: Some("venue closed".to_string()),
        }]
    );

    let resolved = h
        .service
        .resolve_dispute(&escrow.id, "refund issued offline")
        .await
        .unwrap();
    assert_eq!(resolved.status, EscrowStatus::Resolved);
    assert!(resolved.escalated_at.is_some());
}

#[tokio::test]
async fn reminders_go_to_unrated_escrows_only() {
    let h = harness();
    let (_, first) = h.held_escrow().await;
    let (_, second) = h.held_escrow().await;
    h.service
        .record_rating(&second.id, 4.0, "player-1")
        .await
        .unwrap();

    let now = first.held_at + Duration::days(2);
    assert_eq!(h.service.send_rating_reminders(now, 7).await.unwrap(), 1);
    assert_eq!(
        h.notifier.sent(),
        vec![Notification::RatingReminder {
            escrow_id: first.id.clone(),
            payer_id: "player-1".to_string(),
            payee_id: "organizer-1".to_string(),
        }]
    );

    // inside the first day, and past the deadline
    assert_eq!(
        h.service
            .send_rating_reminders(first.held_at + Duration::hours(2), 7)
            .await
            .unwrap(),
        0
    );
    assert_eq!(
        h.service
            .send_rating_reminders(first.held_at + Duration::days(8), 7)
            .await
            .unwrap(),
        0
    );
}

#[tokio::test]
async fn concurrent_passes_release_once() {
    let h = harness();
    let (_, escrow) = h.held_escrow().await;
    h.service
        .record_rating(&escrow.id, 4.0, "player-1")
        .await
        .unwrap();
    let now = escrow.held_at + Duration::hours(30);

    let (a, b) = tokio::join!(
        h.service.process_automatic_releases(now),
        h.service.process_automatic_releases(now)
    );
    let processed = a.unwrap().processed + b.unwrap().processed;
    assert_eq!(processed, 1);
    assert_eq!(h.status(&escrow.id).await, EscrowStatus::Released);

    let successes = h
        .notifier
        .sent()
        .into_iter()
        .filter(|n| matches!(n, Notification::ReleaseSucceeded { .. }))
        .count();
    assert_eq!(successes, 1);
}

#[tokio::test]
async fn nothing_is_due_before_the_hold_expires() {
    let h = harness();
    let (_, escrow) = h.held_escrow().await;
    let summary = h
        .service
        .process_automatic_releases(Utc::now())
        .await
        .unwrap();
    assert_eq!(summary.validated, 0);
    assert_eq!(h.status(&escrow.id).await, EscrowStatus::Held);
}
