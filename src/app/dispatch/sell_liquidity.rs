//! Sell-liquidity facade: converting an asset on a liquidity venue.

use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::{info, instrument};

use super::{DeclaresAliases, StrategyAlias, StrategyDependencies};
use crate::domain::{AppError, Asset, AssetType, Blockchain, ConfigError, DexClient};

strategy_alias! {
    /// Sell-liquidity strategy keys
    SellLiquidityAlias {
        ArbitrumCoin,
        ArbitrumToken,
        Bitcoin,
        BscCoin,
        BscToken,
        EthereumCoin,
        EthereumToken,
        OptimismCoin,
        OptimismToken,
    }
}

impl StrategyAlias for SellLiquidityAlias {
    const FACADE: &'static str = "SellLiquidityStrategy";

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
            (Blockchain::Bitcoin, Token)
            | (Blockchain::DeFiChain, _)
            | (Blockchain::Lightning, _) => None,
        }
    }
}

#[async_trait]
pub trait SellLiquidityStrategy: DeclaresAliases<SellLiquidityAlias> + Send + Sync {
    /// Sell `amount` of `asset`, returns the swap transaction id
    async fn sell_liquidity(&self, asset: &Asset, amount: Decimal) -> Result<String, AppError>;
}

/// Chains without a liquidity venue wired up: always declines
pub struct UnsupportedSellLiquidityStrategy {
    alias: SellLiquidityAlias,
    description: String,
}

impl UnsupportedSellLiquidityStrategy {
    #[must_use]
    pub fn new(alias: SellLiquidityAlias, blockchain: Blockchain, asset_type: AssetType) -> Self {
        let kind = match asset_type {
            AssetType::Coin => "coin",
            AssetType::Token => "token",
        };
        Self {
            alias,
            description: format!("{} {}", blockchain, kind),
        }
    }
}

impl DeclaresAliases<SellLiquidityAlias> for UnsupportedSellLiquidityStrategy {
    fn aliases(&self) -> Vec<SellLiquidityAlias> {
        vec![self.alias]
    }
}

#[async_trait]
impl SellLiquidityStrategy for UnsupportedSellLiquidityStrategy {
    async fn sell_liquidity(&self, _asset: &Asset, _amount: Decimal) -> Result<String, AppError> {
        Err(AppError::NotSupported(format!(
            "Selling liquidity on DEX is not supported for {}",
            self.description
        )))
    }
}

/// Sells through the chain's liquidity venue
pub struct DexSellLiquidityStrategy {
    aliases: Vec<SellLiquidityAlias>,
    dex: Arc<dyn DexClient>,
}

impl DexSellLiquidityStrategy {
    #[must_use]
    pub fn new(aliases: Vec<SellLiquidityAlias>, dex: Arc<dyn DexClient>) -> Self {
        Self { aliases, dex }
    }
}

impl DeclaresAliases<SellLiquidityAlias> for DexSellLiquidityStrategy {
    fn aliases(&self) -> Vec<SellLiquidityAlias> {
        self.aliases.clone()
    }
}

#[async_trait]
impl SellLiquidityStrategy for DexSellLiquidityStrategy {
    #[instrument(skip(self, asset), fields(asset = %asset.name, chain = %asset.blockchain))]
    async fn sell_liquidity(&self, asset: &Asset, amount: Decimal) -> Result<String, AppError> {
        let tx_id = self.dex.sell_liquidity(asset, amount).await?;
        info!(tx_id = %tx_id, "Liquidity sold");
        Ok(tx_id)
    }
}

pub(super) fn build_strategies(
    deps: &StrategyDependencies,
) -> Result<Vec<Arc<dyn SellLiquidityStrategy>>, AppError> {
    let dex_for = |chain: Blockchain| -> Result<Arc<dyn DexClient>, AppError> {
        deps.dex_clients.get(&chain).cloned().ok_or_else(|| {
            ConfigError::InvalidValue {
                key: "DEX_CLIENTS".to_string(),
                message: format!("no liquidity venue for {}", chain),
            }
            .into()
        })
    };

    let strategies: Vec<Arc<dyn SellLiquidityStrategy>> = vec![
        Arc::new(DexSellLiquidityStrategy::new(
            vec![SellLiquidityAlias::EthereumCoin, SellLiquidityAlias::EthereumToken],
            dex_for(Blockchain::Ethereum)?,
        )),
        Arc::new(DexSellLiquidityStrategy::new(
            vec![SellLiquidityAlias::BscCoin, SellLiquidityAlias::BscToken],
            dex_for(Blockchain::BinanceSmartChain)?,
        )),
        Arc::new(UnsupportedSellLiquidityStrategy::new(
            SellLiquidityAlias::ArbitrumCoin,
            Blockchain::Arbitrum,
            AssetType::Coin,
        )),
        Arc::new(UnsupportedSellLiquidityStrategy::new(
            SellLiquidityAlias::ArbitrumToken,
            Blockchain::Arbitrum,
            AssetType::Token,
        )),
        Arc::new(UnsupportedSellLiquidityStrategy::new(
            SellLiquidityAlias::OptimismCoin,
            Blockchain::Optimism,
            AssetType::Coin,
        )),
        Arc::new(UnsupportedSellLiquidityStrategy::new(
            SellLiquidityAlias::OptimismToken,
            Blockchain::Optimism,
            AssetType::Token,
        )),
        Arc::new(UnsupportedSellLiquidityStrategy::new(
            SellLiquidityAlias::Bitcoin,
            Blockchain::Bitcoin,
            AssetType::Coin,
        )),
    ];

    Ok(strategies)
}
