//! Payout facade: sends settled obligations from the payout wallet.

use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::{info, instrument, warn};

use super::{DeclaresAliases, StrategyAlias, StrategyDependencies};
use crate::domain::{
    AppError, Asset, AssetType, Blockchain, BlockchainAddress, ChainClient, PayoutOrder,
};

strategy_alias! {
    /// Payout strategy keys
    PayoutAlias {
        ArbitrumCoin,
        ArbitrumToken,
        Bitcoin,
        BscCoin,
        BscToken,
        DeFiChainCoin,
        DeFiChainToken,
        EthereumCoin,
        EthereumToken,
        OptimismCoin,
        OptimismToken,
    }
}

impl StrategyAlias for PayoutAlias {
    const FACADE: &'static str = "PayoutStrategy";

    fn all() -> &'static [Self] {
        Self::ALL
    }

    fn for_asset(asset: &Asset) -> Option<Self> {
        use AssetType::{Coin, Token};
        match (asset.blockchain, asset.asset_type) {
            (Blockchain::Bitcoin, Coin) => Some(Self::Bitcoin),
            (Blockchain::Ethereum, Coin) => Some(Self::EthereumCoin),
            (Blockchain::Ethereum, Token) => Some(Self::EthereumToken),
            (Blockchain::BinanceSmartChain, Coin) => Some(Self::BscCoin),
            (Blockchain::BinanceSmartChain, Token) => Some(Self::BscToken),
            (Blockchain::Arbitrum, Coin) => Some(Self::ArbitrumCoin),
            (Blockchain::Arbitrum, Token) => Some(Self::ArbitrumToken),
            (Blockchain::Optimism, Coin) => Some(Self::OptimismCoin),
            (Blockchain::Optimism, Token) => Some(Self::OptimismToken),
            (Blockchain::DeFiChain, Coin) => Some(Self::DeFiChainCoin),
            (Blockchain::DeFiChain, Token) => Some(Self::DeFiChainToken),
            (Blockchain::Bitcoin, Token) | (Blockchain::Lightning, _) => None,
        }
    }
}

/// Chain-specific payout execution
#[async_trait]
pub trait PayoutStrategy: DeclaresAliases<PayoutAlias> + Send + Sync {
    /// Broadcast payouts for the given orders. Orders that already carry a
    /// payout transaction id are left alone.
    async fn do_payout(&self, orders: &mut [PayoutOrder]) -> Result<(), AppError>;

    /// Whether the payout transaction of an order is final
    async fn check_payout_completion(&self, order: &PayoutOrder) -> Result<bool, AppError>;

    /// Estimated native fee of a payout of `asset`
    async fn estimate_fee(&self, asset: &Asset) -> Result<Option<Decimal>, AppError>;
}

async fn check_completion(client: &dyn ChainClient, order: &PayoutOrder) -> Result<bool, AppError> {
    match &order.payout_tx_id {
        Some(tx_id) => client.is_tx_complete(tx_id).await,
        None => Ok(false),
    }
}

/// Native coin payouts
pub struct CoinPayoutStrategy {
    alias: PayoutAlias,
    client: Arc<dyn ChainClient>,
    wallet: BlockchainAddress,
}

impl CoinPayoutStrategy {
    #[must_use]
    pub fn new(
        alias: PayoutAlias,
        client: Arc<dyn ChainClient>,
        wallet: BlockchainAddress,
    ) -> Self {
        Self {
            alias,
            client,
            wallet,
        }
    }
}

impl DeclaresAliases<PayoutAlias> for CoinPayoutStrategy {
    fn aliases(&self) -> Vec<PayoutAlias> {
        vec![self.alias]
    }
}

#[async_trait]
impl PayoutStrategy for CoinPayoutStrategy {
    #[instrument(skip(self, orders), fields(alias = %self.alias, count = orders.len()))]
    async fn do_payout(&self, orders: &mut [PayoutOrder]) -> Result<(), AppError> {
        for order in orders.iter_mut().filter(|o| o.payout_tx_id.is_none()) {
            let tx_id = self
                .client
                .send_native(&self.wallet.address, &order.destination_address, order.amount)
                .await?;
            info!(order_id = %order.id, tx_id = %tx_id, "Coin payout broadcast");
            order.payout_tx_id = Some(tx_id);
        }
        Ok(())
    }

    async fn check_payout_completion(&self, order: &PayoutOrder) -> Result<bool, AppError> {
        check_completion(self.client.as_ref(), order).await
    }

    async fn estimate_fee(&self, asset: &Asset) -> Result<Option<Decimal>, AppError> {
        self.client.estimate_native_fee(asset).await
    }
}

/// Token payouts
pub struct TokenPayoutStrategy {
    alias: PayoutAlias,
    client: Arc<dyn ChainClient>,
    wallet: BlockchainAddress,
}

impl TokenPayoutStrategy {
    #[must_use]
    pub fn new(
        alias: PayoutAlias,
        client: Arc<dyn ChainClient>,
        wallet: BlockchainAddress,
    ) -> Self {
        Self {
            alias,
            client,
            wallet,
        }
    }
}

impl DeclaresAliases<PayoutAlias> for TokenPayoutStrategy {
    fn aliases(&self) -> Vec<PayoutAlias> {
        vec![self.alias]
    }
}

#[async_trait]
impl PayoutStrategy for TokenPayoutStrategy {
    #[instrument(skip(self, orders), fields(alias = %self.alias, count = orders.len()))]
    async fn do_payout(&self, orders: &mut [PayoutOrder]) -> Result<(), AppError> {
        for order in orders.iter_mut().filter(|o| o.payout_tx_id.is_none()) {
            if !order.asset.is_token() {
                warn!(order_id = %order.id, asset = %order.asset.name, "Coin order routed to token payout");
                return Err(AppError::NotSupported(format!(
                    "{} cannot pay out coin {}",
                    self.alias, order.asset.name
                )));
            }
            let tx_id = self
                .client
                .send_token(
                    &self.wallet.address,
                    &order.destination_address,
                    &order.asset,
                    order.amount,
                )
                .await?;
            info!(order_id = %order.id, tx_id = %tx_id, "Token payout broadcast");
            order.payout_tx_id = Some(tx_id);
        }
        Ok(())
    }

    async fn check_payout_completion(&self, order: &PayoutOrder) -> Result<bool, AppError> {
        check_completion(self.client.as_ref(), order).await
    }

    async fn estimate_fee(&self, asset: &Asset) -> Result<Option<Decimal>, AppError> {
        self.client.estimate_native_fee(asset).await
    }
}

pub(super) fn build_strategies(
    deps: &StrategyDependencies,
) -> Result<Vec<Arc<dyn PayoutStrategy>>, AppError> {
    let mut strategies: Vec<Arc<dyn PayoutStrategy>> = Vec::new();

    for &alias in PayoutAlias::ALL {
        let (chain, is_token) = match alias {
            PayoutAlias::Bitcoin => (Blockchain::Bitcoin, false),
            PayoutAlias::EthereumCoin => (Blockchain::Ethereum, false),
            PayoutAlias::EthereumToken => (Blockchain::Ethereum, true),
            PayoutAlias::BscCoin => (Blockchain::BinanceSmartChain, false),
            PayoutAlias::BscToken => (Blockchain::BinanceSmartChain, true),
            PayoutAlias::ArbitrumCoin => (Blockchain::Arbitrum, false),
            PayoutAlias::ArbitrumToken => (Blockchain::Arbitrum, true),
            PayoutAlias::OptimismCoin => (Blockchain::Optimism, false),
            PayoutAlias::OptimismToken => (Blockchain::Optimism, true),
            PayoutAlias::DeFiChainCoin => (Blockchain::DeFiChain, false),
            PayoutAlias::DeFiChainToken => (Blockchain::DeFiChain, true),
        };
        let client = deps.chains.get(chain)?;
        let wallet = deps.wallets.get(chain)?.payout.clone();

        if is_token {
            strategies.push(Arc::new(TokenPayoutStrategy::new(alias, client, wallet)));
        } else {
            strategies.push(Arc::new(CoinPayoutStrategy::new(alias, client, wallet)));
        }
    }

    Ok(strategies)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_alias_for_asset() {
        let usdt = Asset::token(3, "USDT", Blockchain::Optimism, "0x94b0");
        assert_eq!(PayoutAlias::for_asset(&usdt), Some(PayoutAlias::OptimismToken));

        let btc = Asset::coin(1, "BTC", Blockchain::Bitcoin);
        assert_eq!(PayoutAlias::for_asset(&btc), Some(PayoutAlias::Bitcoin));

        let lightning = Asset::coin(9, "BTC", Blockchain::Lightning);
        assert_eq!(PayoutAlias::for_asset(&lightning), None);
    }

    #[test]
    fn test_alias_parsing() {
        assert_eq!(PayoutAlias::ALL.len(), 11);
        for alias in PayoutAlias::ALL {
            assert_eq!(PayoutAlias::from_str(alias.as_str()).unwrap(), *alias);
        }
        assert!(PayoutAlias::from_str("NonExistingAlias").is_err());
    }
}
