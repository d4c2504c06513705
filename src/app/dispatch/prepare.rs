//! Prepare facade: pre-funding steps a payout needs before it can be sent.

use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::{info, instrument};

use super::{DeclaresAliases, StrategyAlias, StrategyDependencies};
use crate::domain::{AppError, Asset, Blockchain, BlockchainAddress, ChainClient, PayoutOrder};

strategy_alias! {
    /// Prepare strategy keys, one per chain family
    PrepareAlias {
        Arbitrum,
        Bitcoin,
        Bsc,
        DeFiChain,
        Ethereum,
        Optimism,
    }
}

impl StrategyAlias for PrepareAlias {
    const FACADE: &'static str = "PrepareStrategy";

    fn all() -> &'static [Self] {
        Self::ALL
    }

    fn for_asset(asset: &Asset) -> Option<Self> {
        match asset.blockchain {
            Blockchain::Arbitrum => Some(Self::Arbitrum),
            Blockchain::Bitcoin => Some(Self::Bitcoin),
            Blockchain::BinanceSmartChain => Some(Self::Bsc),
            Blockchain::DeFiChain => Some(Self::DeFiChain),
            Blockchain::Ethereum => Some(Self::Ethereum),
            Blockchain::Optimism => Some(Self::Optimism),
            Blockchain::Lightning => None,
        }
    }
}

impl PrepareAlias {
    pub fn blockchain(&self) -> Blockchain {
        match self {
            Self::Arbitrum => Blockchain::Arbitrum,
            Self::Bitcoin => Blockchain::Bitcoin,
            Self::Bsc => Blockchain::BinanceSmartChain,
            Self::DeFiChain => Blockchain::DeFiChain,
            Self::Ethereum => Blockchain::Ethereum,
            Self::Optimism => Blockchain::Optimism,
        }
    }
}

#[async_trait]
pub trait PrepareStrategy: DeclaresAliases<PrepareAlias> + Send + Sync {
    /// Fund whatever the payout of `order` needs. Idempotent on `prepare_tx_id`.
    async fn prepare_payout(&self, order: &mut PayoutOrder) -> Result<(), AppError>;

    /// Whether the order is ready for payout
    async fn check_preparation_completion(&self, order: &PayoutOrder) -> Result<bool, AppError>;
}

/// Account-based chains pay fees from the payout wallet directly
pub struct NoPreparationStrategy {
    alias: PrepareAlias,
}

impl NoPreparationStrategy {
    #[must_use]
    pub fn new(alias: PrepareAlias) -> Self {
        Self { alias }
    }
}

impl DeclaresAliases<PrepareAlias> for NoPreparationStrategy {
    fn aliases(&self) -> Vec<PrepareAlias> {
        vec![self.alias]
    }
}

#[async_trait]
impl PrepareStrategy for NoPreparationStrategy {
    async fn prepare_payout(&self, _order: &mut PayoutOrder) -> Result<(), AppError> {
        Ok(())
    }

    async fn check_preparation_completion(&self, _order: &PayoutOrder) -> Result<bool, AppError> {
        Ok(true)
    }
}

/// UTXO chain where token payouts need native coin moved to the payout wallet first
pub struct UtxoTopUpStrategy {
    alias: PrepareAlias,
    client: Arc<dyn ChainClient>,
    fee_wallet: BlockchainAddress,
    payout_wallet: BlockchainAddress,
    top_up_amount: Decimal,
}

impl UtxoTopUpStrategy {
    #[must_use]
    pub fn new(
        alias: PrepareAlias,
        client: Arc<dyn ChainClient>,
        fee_wallet: BlockchainAddress,
        payout_wallet: BlockchainAddress,
        top_up_amount: Decimal,
    ) -> Self {
        Self {
            alias,
            client,
            fee_wallet,
            payout_wallet,
            top_up_amount,
        }
    }
}

impl DeclaresAliases<PrepareAlias> for UtxoTopUpStrategy {
    fn aliases(&self) -> Vec<PrepareAlias> {
        vec![self.alias]
    }
}

#[async_trait]
impl PrepareStrategy for UtxoTopUpStrategy {
    #[instrument(skip(self, order), fields(order_id = %order.id))]
    async fn prepare_payout(&self, order: &mut PayoutOrder) -> Result<(), AppError> {
        if order.prepare_tx_id.is_some() || !order.asset.is_token() {
            return Ok(());
        }

        let tx_id = self
            .client
            .send_native(
                &self.fee_wallet.address,
                &self.payout_wallet.address,
                self.top_up_amount,
            )
            .await?;
        info!(tx_id = %tx_id, amount = %self.top_up_amount, "Payout wallet topped up");
        order.prepare_tx_id = Some(tx_id);
        Ok(())
    }

    async fn check_preparation_completion(&self, order: &PayoutOrder) -> Result<bool, AppError> {
        match &order.prepare_tx_id {
            Some(tx_id) => self.client.is_tx_complete(tx_id).await,
            None => Ok(!order.asset.is_token()),
        }
    }
}

pub(super) fn build_strategies(
    deps: &StrategyDependencies,
) -> Result<Vec<Arc<dyn PrepareStrategy>>, AppError> {
    let mut strategies: Vec<Arc<dyn PrepareStrategy>> = Vec::new();

    for &alias in PrepareAlias::ALL {
        if alias == PrepareAlias::DeFiChain {
            let chain = alias.blockchain();
            let wallets = deps.wallets.get(chain)?;
            strategies.push(Arc::new(UtxoTopUpStrategy::new(
                alias,
                deps.chains.get(chain)?,
                wallets.fee.clone(),
                wallets.payout.clone(),
                deps.utxo_top_up_amount,
            )));
        } else {
            strategies.push(Arc::new(NoPreparationStrategy::new(alias)));
        }
    }

    Ok(strategies)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alias_per_chain() {
        for alias in PrepareAlias::ALL {
            let asset = Asset::coin(1, "X", alias.blockchain());
            assert_eq!(PrepareAlias::for_asset(&asset), Some(*alias));
        }
        let lightning = Asset::coin(1, "BTC", Blockchain::Lightning);
        assert_eq!(PrepareAlias::for_asset(&lightning), None);
    }
}
