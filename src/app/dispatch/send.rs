//! Send facade: moving grouped pay-ins off their deposit address.
//!
//! A send runs in three steps driven by the sweep: `prepare_send` funds the
//! network fee (a top-up transaction for tokens, nothing for coins),
//! `check_preparation` waits for that funding to confirm, and `dispatch_send`
//! broadcasts one transaction for the whole group.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::{debug, info, instrument, warn};

use super::{DeclaresAliases, StrategyAlias, StrategyDependencies};
use crate::domain::{
    AppError, Asset, AssetType, Blockchain, BlockchainAddress, ChainClient, PayIn, PayInSendType,
    PayInStatus, PriceProvider, TradeCurrency,
};

/// Decimal places of the token top-up amount
const TOP_UP_DECIMALS: u32 = 12;

/// Decimal places of each member's share of the fee
const FEE_SHARE_DECIMALS: u32 = 16;

strategy_alias! {
    /// Send strategy keys
    SendAlias {
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

impl StrategyAlias for SendAlias {
    const FACADE: &'static str = "SendStrategy";

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

impl SendAlias {
    fn target(&self) -> (Blockchain, AssetType) {
        match self {
            Self::Bitcoin => (Blockchain::Bitcoin, AssetType::Coin),
            Self::EthereumCoin => (Blockchain::Ethereum, AssetType::Coin),
            Self::EthereumToken => (Blockchain::Ethereum, AssetType::Token),
            Self::BscCoin => (Blockchain::BinanceSmartChain, AssetType::Coin),
            Self::BscToken => (Blockchain::BinanceSmartChain, AssetType::Token),
            Self::ArbitrumCoin => (Blockchain::Arbitrum, AssetType::Coin),
            Self::ArbitrumToken => (Blockchain::Arbitrum, AssetType::Token),
            Self::OptimismCoin => (Blockchain::Optimism, AssetType::Coin),
            Self::OptimismToken => (Blockchain::Optimism, AssetType::Token),
            Self::DeFiChainCoin => (Blockchain::DeFiChain, AssetType::Coin),
            Self::DeFiChainToken => (Blockchain::DeFiChain, AssetType::Token),
        }
    }
}

/// Pay-ins moved together: same deposit account, destination, asset, status and direction
#[derive(Debug, Clone)]
pub struct SendGroup {
    pub account: BlockchainAddress,
    pub destination: BlockchainAddress,
    pub asset: Asset,
    pub status: PayInStatus,
    pub send_type: PayInSendType,
    pub pay_ins: Vec<PayIn>,
}

impl SendGroup {
    /// Split pay-ins into groups. Records without asset, destination or send
    /// type cannot be sent and are skipped.
    pub fn group(pay_ins: Vec<PayIn>) -> Vec<SendGroup> {
        let mut groups: Vec<SendGroup> = Vec::new();
        let mut index: HashMap<(String, String, i64, PayInStatus, PayInSendType), usize> =
            HashMap::new();

        for pay_in in pay_ins {
            let (Some(asset), Some(destination), Some(send_type)) = (
                pay_in.asset.clone(),
                pay_in.destination_address.clone(),
                pay_in.send_type,
            ) else {
                warn!(pay_in_id = %pay_in.id, status = %pay_in.status, "Pay-in not ready for sending, skipping");
                continue;
            };

            let key = (
                pay_in.address.to_string(),
                destination.to_string(),
                asset.id,
                pay_in.status,
                send_type,
            );

            match index.get(&key) {
                Some(&i) => groups[i].pay_ins.push(pay_in),
                None => {
                    index.insert(key, groups.len());
                    groups.push(SendGroup {
                        account: pay_in.address.clone(),
                        destination,
                        asset,
                        status: pay_in.status,
                        send_type,
                        pay_ins: vec![pay_in],
                    });
                }
            }
        }

        groups
    }

    /// Lock key, stable across the group's status changes
    pub fn key(&self) -> String {
        group_key(&self.account, &self.destination, &self.asset, self.send_type)
    }

    /// Lock key of the group `pay_in` belongs to, `None` when it cannot be sent
    pub fn key_of(pay_in: &PayIn) -> Option<String> {
        Some(group_key(
            &pay_in.address,
            pay_in.destination_address.as_ref()?,
            pay_in.asset.as_ref()?,
            pay_in.send_type?,
        ))
    }

    pub fn total_amount(&self) -> Decimal {
        self.pay_ins.iter().map(|p| p.amount).sum()
    }

    /// Fee recorded on the members at preparation
    pub fn total_forward_fee(&self) -> Decimal {
        self.pay_ins
            .iter()
            .filter_map(|p| p.forward_fee_amount)
            .sum()
    }

    /// Distinct prepare transactions of the members
    pub fn prepare_tx_ids(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.pay_ins
            .iter()
            .filter_map(|p| p.prepare_tx_id.clone())
            .filter(|id| seen.insert(id.clone()))
            .collect()
    }

    /// Outbound transaction already recorded on a member, if any
    pub fn recorded_send_tx(&self) -> Option<String> {
        self.pay_ins.iter().find_map(|p| match self.send_type {
            PayInSendType::Forward => p.out_tx_id.clone(),
            PayInSendType::Return => p.return_tx_id.clone(),
        })
    }

    /// Equal share of `fee` per member
    pub fn fee_share(&self, fee: Decimal) -> Decimal {
        let members = Decimal::from(self.pay_ins.len().max(1));
        (fee / members).round_dp(FEE_SHARE_DECIMALS)
    }
}

fn group_key(
    account: &BlockchainAddress,
    destination: &BlockchainAddress,
    asset: &Asset,
    send_type: PayInSendType,
) -> String {
    format!(
        "{}|{}|{}|{}",
        account,
        destination,
        asset.id,
        send_type.as_str()
    )
}

/// Chain-specific forwarding of grouped pay-ins
#[async_trait]
pub trait SendStrategy: DeclaresAliases<SendAlias> + Send + Sync {
    fn client(&self) -> &Arc<dyn ChainClient>;

    /// Operating wallet forwarded funds go to
    fn forward_address(&self) -> &BlockchainAddress;

    /// Native fee of one send of `asset`, `None` when no estimate is available
    async fn estimate_native_fee(&self, asset: &Asset) -> Result<Option<Decimal>, AppError> {
        self.client().estimate_native_fee(asset).await
    }

    /// A native fee expressed in units of `asset`
    async fn fee_in_asset(&self, asset: &Asset, native_fee: Decimal) -> Result<Decimal, AppError>;

    /// Whether every prepare transaction of the group has confirmed
    async fn check_preparation(&self, group: &SendGroup) -> Result<bool, AppError>;

    /// Whether `prepare_send` puts a transaction on chain
    fn broadcasts_on_prepare(&self) -> bool {
        true
    }

    /// Fund the send and move every member to `preparing`
    async fn prepare_send(&self, group: &mut SendGroup, native_fee: Decimal)
    -> Result<(), AppError>;

    /// Broadcast the group transfer, returns its transaction id
    async fn dispatch_send(
        &self,
        group: &SendGroup,
        estimated_native_fee: Decimal,
    ) -> Result<String, AppError>;

    /// Whether the inbound transaction reached confirmation depth
    async fn is_confirmed(&self, pay_in: &PayIn) -> Result<bool, AppError> {
        self.client().is_tx_complete(&pay_in.in_tx_id).await
    }

    /// Whether the outbound forward transaction is final
    async fn check_completion(&self, pay_in: &PayIn) -> Result<bool, AppError> {
        match &pay_in.out_tx_id {
            Some(tx_id) => self.client().is_tx_complete(tx_id).await,
            None => Ok(false),
        }
    }
}

/// Native coin sends: the fee is taken out of the amount moved
pub struct CoinSendStrategy {
    alias: SendAlias,
    client: Arc<dyn ChainClient>,
    forward_address: BlockchainAddress,
}

impl CoinSendStrategy {
    #[must_use]
    pub fn new(
        alias: SendAlias,
        client: Arc<dyn ChainClient>,
        forward_address: BlockchainAddress,
    ) -> Self {
        Self {
            alias,
            client,
            forward_address,
        }
    }
}

impl DeclaresAliases<SendAlias> for CoinSendStrategy {
    fn aliases(&self) -> Vec<SendAlias> {
        vec![self.alias]
    }
}

#[async_trait]
impl SendStrategy for CoinSendStrategy {
    fn client(&self) -> &Arc<dyn ChainClient> {
        &self.client
    }

    fn forward_address(&self) -> &BlockchainAddress {
        &self.forward_address
    }

    async fn fee_in_asset(&self, _asset: &Asset, native_fee: Decimal) -> Result<Decimal, AppError> {
        Ok(native_fee)
    }

    async fn check_preparation(&self, _group: &SendGroup) -> Result<bool, AppError> {
        Ok(true)
    }

    fn broadcasts_on_prepare(&self) -> bool {
        false
    }

    async fn prepare_send(
        &self,
        group: &mut SendGroup,
        native_fee: Decimal,
    ) -> Result<(), AppError> {
        let share = group.fee_share(native_fee);
        for pay_in in &mut group.pay_ins {
            pay_in.preparing(None, share)?;
        }
        Ok(())
    }

    #[instrument(skip(self, group), fields(alias = %self.alias, members = group.pay_ins.len()))]
    async fn dispatch_send(
        &self,
        group: &SendGroup,
        estimated_native_fee: Decimal,
    ) -> Result<String, AppError> {
        let amount = group.total_amount() - estimated_native_fee;
        if amount <= Decimal::ZERO {
            return Err(AppError::FeeCheck(format!(
                "Fee {} exceeds group amount {}",
                estimated_native_fee,
                group.total_amount()
            )));
        }

        let tx_id = self
            .client
            .send_native(&group.account.address, &group.destination.address, amount)
            .await?;
        info!(tx_id = %tx_id, %amount, "Coin send broadcast");
        Ok(tx_id)
    }
}

/// Token sends: the deposit address is first topped up with native coin
pub struct TokenSendStrategy {
    alias: SendAlias,
    client: Arc<dyn ChainClient>,
    forward_address: BlockchainAddress,
    fee_wallet: BlockchainAddress,
    native: Asset,
    price_provider: Arc<dyn PriceProvider>,
    top_up_factor: Decimal,
}

impl TokenSendStrategy {
    #[must_use]
    pub fn new(
        alias: SendAlias,
        client: Arc<dyn ChainClient>,
        forward_address: BlockchainAddress,
        fee_wallet: BlockchainAddress,
        price_provider: Arc<dyn PriceProvider>,
        top_up_factor: Decimal,
    ) -> Self {
        let chain = client.blockchain();
        Self {
            alias,
            client,
            forward_address,
            fee_wallet,
            native: Asset::coin(0, chain.native_coin(), chain),
            price_provider,
            top_up_factor,
        }
    }
}

impl DeclaresAliases<SendAlias> for TokenSendStrategy {
    fn aliases(&self) -> Vec<SendAlias> {
        vec![self.alias]
    }
}

#[async_trait]
impl SendStrategy for TokenSendStrategy {
    fn client(&self) -> &Arc<dyn ChainClient> {
        &self.client
    }

    fn forward_address(&self) -> &BlockchainAddress {
        &self.forward_address
    }

    async fn fee_in_asset(&self, asset: &Asset, native_fee: Decimal) -> Result<Decimal, AppError> {
        let price = self
            .price_provider
            .get_price(
                &TradeCurrency::Asset(self.native.clone()),
                &TradeCurrency::Asset(asset.clone()),
            )
            .await?;
        Ok(price.convert(native_fee))
    }

    async fn check_preparation(&self, group: &SendGroup) -> Result<bool, AppError> {
        if group.pay_ins.iter().any(|p| p.prepare_tx_id.is_none()) {
            warn!(group = %group.key(), "Token group member without prepare transaction");
            return Ok(false);
        }

        // usually a single transaction per group
        for tx_id in group.prepare_tx_ids() {
            if !self.client.is_tx_complete(&tx_id).await? {
                debug!(tx_id = %tx_id, "Prepare transaction not complete yet");
                return Ok(false);
            }
        }
        Ok(true)
    }

    #[instrument(skip(self, group), fields(alias = %self.alias, members = group.pay_ins.len()))]
    async fn prepare_send(
        &self,
        group: &mut SendGroup,
        native_fee: Decimal,
    ) -> Result<(), AppError> {
        let top_up = (native_fee * self.top_up_factor).round_dp(TOP_UP_DECIMALS);
        let prepare_tx_id = self
            .client
            .send_native(&self.fee_wallet.address, &group.account.address, top_up)
            .await?;
        info!(tx_id = %prepare_tx_id, %top_up, "Fee top-up broadcast");

        let share = group.fee_share(native_fee);
        for pay_in in &mut group.pay_ins {
            pay_in.preparing(Some(prepare_tx_id.clone()), share)?;
        }
        Ok(())
    }

    #[instrument(skip(self, group), fields(alias = %self.alias, members = group.pay_ins.len()))]
    async fn dispatch_send(
        &self,
        group: &SendGroup,
        _estimated_native_fee: Decimal,
    ) -> Result<String, AppError> {
        let amount = group.total_amount();
        let tx_id = self
            .client
            .send_token(
                &group.account.address,
                &group.destination.address,
                &group.asset,
                amount,
            )
            .await?;
        info!(tx_id = %tx_id, %amount, "Token send broadcast");
        Ok(tx_id)
    }
}

pub(super) fn build_strategies(
    deps: &StrategyDependencies,
) -> Result<Vec<Arc<dyn SendStrategy>>, AppError> {
    let mut strategies: Vec<Arc<dyn SendStrategy>> = Vec::new();

    for &alias in SendAlias::ALL {
        let (chain, asset_type) = alias.target();
        let client = deps.chains.get(chain)?;
        let wallets = deps.wallets.get(chain)?;

        match asset_type {
            AssetType::Coin => strategies.push(Arc::new(CoinSendStrategy::new(
                alias,
                client,
                wallets.forward.clone(),
            ))),
            AssetType::Token => strategies.push(Arc::new(TokenSendStrategy::new(
                alias,
                client,
                wallets.forward.clone(),
                wallets.fee.clone(),
                Arc::clone(&deps.price_provider),
                deps.token_top_up_factor,
            ))),
        }
    }

    Ok(strategies)
}
