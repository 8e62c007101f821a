//! Fee calculation
//!
//! Converts a gross amount into platform fee, processing fee and net payout.
//! Pure arithmetic on `Decimal`, safe to call from any task.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeBreakdown {
    pub platform_fee: Decimal,
    pub processing_fee: Decimal,
    pub net_amount: Decimal,
}

/// Rates are percentages; `processing_fixed` is in currency units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeSchedule {
    pub platform_percent: Decimal,
    pub processing_percent: Decimal,
    pub processing_fixed: Decimal,
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self {
            platform_percent: Decimal::new(4, 0),
            processing_percent: Decimal::new(165, 2),
            processing_fixed: Decimal::new(25, 2),
        }
    }
}

impl FeeSchedule {
    pub fn calculate(&self, gross: Decimal) -> FeeBreakdown {
        let platform_fee = round2(gross * self.platform_percent / Decimal::ONE_HUNDRED);
        let processing_fee =
            round2(gross * self.processing_percent / Decimal::ONE_HUNDRED + self.processing_fixed);
        // net is defined against the rounded platform fee
        let net_amount = round2(gross - platform_fee);

        FeeBreakdown {
            platform_fee,
            processing_fee,
            net_amount,
        }
    }
}

/// Fees under the default schedule (4% platform, 1.65% + 0.25 processing).
pub fn calculate_fees(gross: Decimal) -> FeeBreakdown {
    FeeSchedule::default().calculate(gross)
}

fn round2(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}
