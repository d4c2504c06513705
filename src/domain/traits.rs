//! Domain traits defining contracts for external systems.

use async_trait::async_trait;
use rust_decimal::Decimal;

use super::error::AppError;
use super::payin::{PayIn, PayInDecision, PayInIdentity, PayInStatus};
use super::types::{Asset, Blockchain, Price, TradeCurrency, TransactionSpecification};

/// Persistence for pay-in records
#[async_trait]
pub trait PayInRepository: Send + Sync {
    /// Check database connectivity
    async fn health_check(&self) -> Result<(), AppError>;

    /// Insert a new pay-in. When a record with the same identity already
    /// exists the stored record is returned unchanged.
    async fn create_pay_in(&self, pay_in: &PayIn) -> Result<PayIn, AppError>;

    /// Look up a pay-in by its natural key
    async fn find_by_identity(&self, identity: &PayInIdentity)
    -> Result<Option<PayIn>, AppError>;

    /// Get a single pay-in by ID
    async fn get_pay_in(&self, id: &str) -> Result<Option<PayIn>, AppError>;

    /// All pay-ins currently in one of the given statuses, oldest first
    async fn find_by_status(&self, statuses: &[PayInStatus]) -> Result<Vec<PayIn>, AppError>;

    /// Non-failed pay-ins whose inbound transaction is not yet confirmed
    async fn find_unconfirmed(&self) -> Result<Vec<PayIn>, AppError>;

    /// Persist the current state of a pay-in
    async fn save_pay_in(&self, pay_in: &PayIn) -> Result<(), AppError>;

    /// Persist several pay-ins
    async fn save_pay_ins(&self, pay_ins: &[PayIn]) -> Result<(), AppError> {
        for pay_in in pay_ins {
            self.save_pay_in(pay_in).await?;
        }
        Ok(())
    }
}

/// Source of the fee / volume rule set
#[async_trait]
pub trait SpecificationRepository: Send + Sync {
    async fn list_specifications(&self) -> Result<Vec<TransactionSpecification>, AppError>;
}

/// Price service
#[async_trait]
pub trait PriceProvider: Send + Sync {
    /// Quote for converting `from` units into `to` units
    async fn get_price(&self, from: &TradeCurrency, to: &TradeCurrency)
    -> Result<Price, AppError>;
}

/// Capabilities of one chain family's node client.
///
/// Amounts are in native units of the asset involved.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Chain family served by this client
    fn blockchain(&self) -> Blockchain;

    /// Check node connectivity
    async fn health_check(&self) -> Result<(), AppError>;

    /// Native coin balance of an address
    async fn get_native_balance(&self, address: &str) -> Result<Decimal, AppError> {
        let _ = address;
        Err(AppError::NotSupported(
            "get_native_balance not implemented".to_string(),
        ))
    }

    /// Token balance of an address
    async fn get_token_balance(&self, address: &str, asset: &Asset) -> Result<Decimal, AppError> {
        let _ = (address, asset);
        Err(AppError::NotSupported(
            "get_token_balance not implemented".to_string(),
        ))
    }

    /// Broadcast a native coin transfer, returns the transaction id
    async fn send_native(
        &self,
        from_address: &str,
        to_address: &str,
        amount: Decimal,
    ) -> Result<String, AppError> {
        let _ = (from_address, to_address, amount);
        Err(AppError::NotSupported(
            "send_native not implemented".to_string(),
        ))
    }

    /// Broadcast a token transfer, returns the transaction id
    async fn send_token(
        &self,
        from_address: &str,
        to_address: &str,
        asset: &Asset,
        amount: Decimal,
    ) -> Result<String, AppError> {
        let _ = (from_address, to_address, asset, amount);
        Err(AppError::NotSupported(
            "send_token not implemented".to_string(),
        ))
    }

    /// Whether the transaction reached the required confirmation depth
    async fn is_tx_complete(&self, tx_id: &str) -> Result<bool, AppError>;

    /// Estimated native fee for moving `asset` once.
    /// `None` means the node could not produce an estimate.
    async fn estimate_native_fee(&self, asset: &Asset) -> Result<Option<Decimal>, AppError> {
        let _ = asset;
        Err(AppError::NotSupported(
            "estimate_native_fee not implemented".to_string(),
        ))
    }
}

/// Liquidity venue able to sell an asset for the chain's reference coin
#[async_trait]
pub trait DexClient: Send + Sync {
    fn blockchain(&self) -> Blockchain;

    /// Sell `amount` of `asset`, returns the swap transaction id
    async fn sell_liquidity(&self, asset: &Asset, amount: Decimal) -> Result<String, AppError>;
}

/// Decides what happens to a freshly created pay-in (route match, compliance)
#[async_trait]
pub trait PayInClassifier: Send + Sync {
    async fn classify(&self, pay_in: &PayIn) -> Result<PayInDecision, AppError>;
}
