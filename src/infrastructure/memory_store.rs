use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::models::{EscrowStatus, EscrowTransaction, Payment};
use crate::ports::Store;

/// In-process store. Used when no redis URL is configured, and in tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    payments: RwLock<HashMap<String, Payment>>,
    escrows: RwLock<HashMap<String, EscrowTransaction>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn sorted(mut escrows: Vec<EscrowTransaction>) -> Vec<EscrowTransaction> {
        escrows.sort_by(|a, b| {
            a.release_eligible_at
                .cmp(&b.release_eligible_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        escrows
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_payment(&self, id: &str) -> Result<Option<Payment>, StoreError> {
        Ok(self.payments.read().await.get(id).cloned())
    }

    async fn put_payment(&self, payment: &Payment) -> Result<(), StoreError> {
        self.payments
            .write()
            .await
            .insert(payment.id.clone(), payment.clone());
        Ok(())
    }

    async fn get_escrow(&self, id: &str) -> Result<Option<EscrowTransaction>, StoreError> {
        Ok(self.escrows.read().await.get(id).cloned())
    }

    async fn put_escrow(&self, escrow: &EscrowTransaction) -> Result<(), StoreError> {
        self.escrows
            .write()
            .await
            .insert(escrow.id.clone(), escrow.clone());
        Ok(())
    }

    async fn update_escrow_if(
        &self,
        escrow: &EscrowTransaction,
        expected: EscrowStatus,
    ) -> Result<bool, StoreError> {
        let mut escrows = self.escrows.write().await;
        match escrows.get_mut(&escrow.id) {
            Some(current) if current.status == expected => {
                *current = escrow.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn escrows_awaiting_release(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<EscrowTransaction>, StoreError> {
        let escrows = self.escrows.read().await;
        Ok(Self::sorted(
            escrows
                .values()
                .filter(|e| e.status.awaits_release() && e.release_eligible_at <= now)
                .cloned()
                .collect(),
        ))
    }

    async fn escrows_awaiting_rating(
        &self,
        held_from: DateTime<Utc>,
        held_to: DateTime<Utc>,
    ) -> Result<Vec<EscrowTransaction>, StoreError> {
        let escrows = self.escrows.read().await;
        Ok(Self::sorted(
            escrows
                .values()
                .filter(|e| {
                    !e.rating_received
                        && matches!(e.status, EscrowStatus::Held | EscrowStatus::PendingRating)
                        && e.held_at >= held_from
                        && e.held_at <= held_to
                })
                .cloned()
                .collect(),
        ))
    }

    async fn open_disputes(&self) -> Result<Vec<EscrowTransaction>, StoreError> {
        let escrows = self.escrows.read().await;
        Ok(Self::sorted(
            escrows
                .values()
                .filter(|e| e.status == EscrowStatus::Disputed)
                .cloned()
                .collect(),
        ))
    }
}
