//! Forward fee policy applied before any send is prepared.

use rust_decimal::Decimal;
use tracing::warn;

use crate::domain::AppError;

/// Share of the minimum input fee always tolerated as network fee
const MIN_INPUT_FEE_SHARE: Decimal = Decimal::from_parts(5, 0, 0, false, 1);

/// Caps the network fee a send may burn relative to the amount moved
#[derive(Debug, Clone, Copy)]
pub struct FeeGate {
    /// Maximum fee as a fraction of the amount (0.05 = 5 %)
    fee_limit: Decimal,
}

impl FeeGate {
    #[must_use]
    pub fn new(fee_limit: Decimal) -> Self {
        Self { fee_limit }
    }

    pub fn fee_limit(&self) -> Decimal {
        self.fee_limit
    }

    /// Largest acceptable fee for moving `total_amount`
    pub fn max_fee(&self, min_input_fee: Decimal, total_amount: Decimal) -> Decimal {
        (total_amount * self.fee_limit).max(min_input_fee * MIN_INPUT_FEE_SHARE)
    }

    /// Accept or reject an estimated fee.
    ///
    /// A missing estimate and a zero amount are both rejected. A fee equal to
    /// the limit is accepted.
    pub fn verify(
        &self,
        estimated_fee: Option<Decimal>,
        min_input_fee: Decimal,
        total_amount: Decimal,
    ) -> Result<(), AppError> {
        let fee = estimated_fee
            .ok_or_else(|| AppError::FeeCheck("No fee estimation provided".to_string()))?;

        if total_amount.is_zero() {
            return Err(AppError::FeeCheck(
                "Total forward amount cannot be zero".to_string(),
            ));
        }

        let max_fee = self.max_fee(min_input_fee, total_amount);

        if fee > max_fee {
            let percent = (fee / total_amount * Decimal::ONE_HUNDRED).round_dp(1);
            warn!(%fee, %max_fee, %total_amount, %percent, "Forward fee rejected");
            return Err(AppError::FeeLimitExceeded { fee, percent });
        }

        Ok(())
    }
}
