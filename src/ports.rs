//! Collaborator contracts
//!
//! The core talks to the payment processor, the document store and the chat
//! notifier only through these traits.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::error::{GatewayError, StoreError};
use crate::models::{EscrowStatus, EscrowTransaction, Payment};
use crate::services::notification_service::Notification;

/// Provider-side handle for a payment whose funds are held.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeldPayment {
    pub provider_reference: String,
    pub client_secret: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Confirmation {
    Succeeded,
    Failed { reason: String },
}

/// External processor that actually moves money.
///
/// Every call is fallible and never retried internally; the next scheduled
/// pass is the retry. `release_funds` must tolerate being called twice for
/// the same escrow.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_held_payment(
        &self,
        payment: &Payment,
        payee_id: &str,
    ) -> Result<HeldPayment, GatewayError>;

    async fn confirm(&self, provider_reference: &str) -> Result<Confirmation, GatewayError>;

    async fn release_funds(&self, escrow: &EscrowTransaction) -> Result<(), GatewayError>;

    async fn refund(
        &self,
        provider_reference: &str,
        amount: Decimal,
        reason: &str,
    ) -> Result<(), GatewayError>;
}

/// Durable storage for payments and escrows.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_payment(&self, id: &str) -> Result<Option<Payment>, StoreError>;

    async fn put_payment(&self, payment: &Payment) -> Result<(), StoreError>;

    async fn get_escrow(&self, id: &str) -> Result<Option<EscrowTransaction>, StoreError>;

    async fn put_escrow(&self, escrow: &EscrowTransaction) -> Result<(), StoreError>;

    /// Writes `escrow` only if the stored record still has status `expected`.
    /// Returns whether the write happened.
    async fn update_escrow_if(
        &self,
        escrow: &EscrowTransaction,
        expected: EscrowStatus,
    ) -> Result<bool, StoreError>;

    /// Escrows still holding funds whose `release_eligible_at <= now`.
    async fn escrows_awaiting_release(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<EscrowTransaction>, StoreError>;

    /// Unrated escrows held within `[held_from, held_to]`.
    async fn escrows_awaiting_rating(
        &self,
        held_from: DateTime<Utc>,
        held_to: DateTime<Utc>,
    ) -> Result<Vec<EscrowTransaction>, StoreError>;

    async fn open_disputes(&self) -> Result<Vec<EscrowTransaction>, StoreError>;
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: Notification);
}
