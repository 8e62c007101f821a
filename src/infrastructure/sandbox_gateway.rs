use std::collections::HashSet;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::info;

use crate::error::GatewayError;
use crate::models::{EscrowTransaction, Payment};
use crate::ports::{Confirmation, HeldPayment, PaymentGateway};

/// Test-mode gateway: no money moves.
///
/// With `auto_accept` every confirmation succeeds; otherwise every one fails
/// as if the customer never completed checkout. Releases are idempotent per
/// escrow id.
#[derive(Debug, Default)]
pub struct SandboxGateway {
    auto_accept: bool,
    released: Mutex<HashSet<String>>,
    refunded: Mutex<HashSet<String>>,
}

impl SandboxGateway {
    pub fn new(auto_accept: bool) -> Self {
        Self {
            auto_accept,
            ..Self::default()
        }
    }

    pub async fn released_count(&self) -> usize {
        self.released.lock().await.len()
    }
}

#[async_trait]
impl PaymentGateway for SandboxGateway {
    async fn create_held_payment(
        &self,
        payment: &Payment,
        payee_id: &str,
    ) -> Result<HeldPayment, GatewayError> {
        let reference = format!("sandbox_pi_{}", uuid::Uuid::new_v4().simple());
        info!(payment_id = %payment.id, payee_id, %reference, "sandbox payment held");
        Ok(HeldPayment {
            client_secret: format!("{reference}_secret"),
            provider_reference: reference,
        })
    }

    async fn confirm(&self, provider_reference: &str) -> Result<Confirmation, GatewayError> {
        if self.auto_accept {
            Ok(Confirmation::Succeeded)
        } else {
            Ok(Confirmation::Failed {
                reason: format!("payment {provider_reference} requires customer action"),
            })
        }
    }

    async fn release_funds(&self, escrow: &EscrowTransaction) -> Result<(), GatewayError> {
        if self.released.lock().await.insert(escrow.id.clone()) {
            info!(escrow_id = %escrow.id, amount = %escrow.amount, payee = %escrow.payee_id, "sandbox transfer");
        }
        Ok(())
    }

    async fn refund(
        &self,
        provider_reference: &str,
        amount: Decimal,
        reason: &str,
    ) -> Result<(), GatewayError> {
        let mut refunded = self.refunded.lock().await;
        if !refunded.insert(provider_reference.to_string()) {
            return Err(GatewayError::new(format!(
                "charge {provider_reference} has already been refunded"
            )));
        }
        info!(provider_reference, %amount, reason, "sandbox refund");
        Ok(())
    }
}
