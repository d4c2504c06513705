//! Domain types shared by the pay-in, specification and dispatch layers.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::error::{AppError, ExternalServiceError};

/// Chain family an asset or address lives on
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Blockchain {
    Bitcoin,
    Lightning,
    Ethereum,
    BinanceSmartChain,
    Arbitrum,
    Optimism,
    DeFiChain,
}

impl Blockchain {
    pub const ALL: [Blockchain; 7] = [
        Self::Bitcoin,
        Self::Lightning,
        Self::Ethereum,
        Self::BinanceSmartChain,
        Self::Arbitrum,
        Self::Optimism,
        Self::DeFiChain,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bitcoin => "Bitcoin",
            Self::Lightning => "Lightning",
            Self::Ethereum => "Ethereum",
            Self::BinanceSmartChain => "BinanceSmartChain",
            Self::Arbitrum => "Arbitrum",
            Self::Optimism => "Optimism",
            Self::DeFiChain => "DeFiChain",
        }
    }

    /// Prefix used for per-chain environment variables
    pub fn env_prefix(&self) -> &'static str {
        match self {
            Self::Bitcoin => "BITCOIN",
            Self::Lightning => "LIGHTNING",
            Self::Ethereum => "ETHEREUM",
            Self::BinanceSmartChain => "BSC",
            Self::Arbitrum => "ARBITRUM",
            Self::Optimism => "OPTIMISM",
            Self::DeFiChain => "DEFICHAIN",
        }
    }

    /// Ticker of the coin network fees are paid in
    pub fn native_coin(&self) -> &'static str {
        match self {
            Self::Bitcoin | Self::Lightning => "BTC",
            Self::Ethereum | Self::Arbitrum | Self::Optimism => "ETH",
            Self::BinanceSmartChain => "BNB",
            Self::DeFiChain => "DFI",
        }
    }

    /// Bitcoin-family transfers are priced without a stable-coin reference leg
    pub fn requires_stable_reference(&self) -> bool {
        !matches!(self, Self::Bitcoin | Self::Lightning)
    }
}

impl std::str::FromStr for Blockchain {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|b| b.as_str() == s)
            .ok_or_else(|| format!("Invalid blockchain: {}", s))
    }
}

impl std::fmt::Display for Blockchain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Native coin vs smart-contract token
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum AssetType {
    Coin,
    Token,
}

impl AssetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Coin => "Coin",
            Self::Token => "Token",
        }
    }
}

impl std::str::FromStr for AssetType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Coin" => Ok(Self::Coin),
            "Token" => Ok(Self::Token),
            _ => Err(format!("Invalid asset type: {}", s)),
        }
    }
}

impl std::fmt::Display for AssetType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A crypto asset on a specific chain
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Asset {
    pub id: i64,
    pub name: String,
    pub blockchain: Blockchain,
    pub asset_type: AssetType,
    /// Identifier used by specification rules and liquidity venues
    pub dex_name: String,
    /// Contract address for tokens
    pub chain_id: Option<String>,
    pub sellable: bool,
}

impl Asset {
    #[must_use]
    pub fn coin(id: i64, name: &str, blockchain: Blockchain) -> Self {
        Self {
            id,
            name: name.to_string(),
            blockchain,
            asset_type: AssetType::Coin,
            dex_name: name.to_string(),
            chain_id: None,
            sellable: true,
        }
    }

    #[must_use]
    pub fn token(id: i64, name: &str, blockchain: Blockchain, contract: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            blockchain,
            asset_type: AssetType::Token,
            dex_name: name.to_string(),
            chain_id: Some(contract.to_string()),
            sellable: true,
        }
    }

    pub fn is_token(&self) -> bool {
        self.asset_type == AssetType::Token
    }
}

/// A fiat currency
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Fiat {
    pub id: i64,
    pub name: String,
    pub sellable: bool,
}

impl Fiat {
    #[must_use]
    pub fn new(id: i64, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            sellable: true,
        }
    }
}

/// Anything a price can be quoted for
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum TradeCurrency {
    Asset(Asset),
    Fiat(Fiat),
}

/// System name used by specification rules for fiat currencies
pub const FIAT_SYSTEM: &str = "Fiat";

impl TradeCurrency {
    /// The (system, asset) key used for specification lookup
    pub fn spec_key(&self) -> (&str, &str) {
        match self {
            Self::Asset(asset) => (asset.blockchain.as_str(), asset.dex_name.as_str()),
            Self::Fiat(fiat) => (FIAT_SYSTEM, fiat.name.as_str()),
        }
    }

    pub fn is_fiat(&self) -> bool {
        matches!(self, Self::Fiat(_))
    }

    pub fn is_sellable(&self) -> bool {
        match self {
            Self::Asset(asset) => asset.sellable,
            Self::Fiat(fiat) => fiat.sellable,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Asset(asset) => &asset.name,
            Self::Fiat(fiat) => &fiat.name,
        }
    }
}

impl From<Asset> for TradeCurrency {
    fn from(asset: Asset) -> Self {
        Self::Asset(asset)
    }
}

impl From<Fiat> for TradeCurrency {
    fn from(fiat: Fiat) -> Self {
        Self::Fiat(fiat)
    }
}

/// Address on a given chain
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct BlockchainAddress {
    pub address: String,
    pub blockchain: Blockchain,
}

impl BlockchainAddress {
    #[must_use]
    pub fn new(address: impl Into<String>, blockchain: Blockchain) -> Self {
        Self {
            address: address.into(),
            blockchain,
        }
    }
}

impl std::fmt::Display for BlockchainAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.blockchain, self.address)
    }
}

/// Kind of product a deposit route feeds
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DepositRouteType {
    Sell,
    Staking,
    Swap,
}

impl DepositRouteType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sell => "Sell",
            Self::Staking => "Staking",
            Self::Swap => "Swap",
        }
    }
}

impl std::str::FromStr for DepositRouteType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Sell" => Ok(Self::Sell),
            "Staking" => Ok(Self::Staking),
            "Swap" => Ok(Self::Swap),
            _ => Err(format!("Invalid deposit route type: {}", s)),
        }
    }
}

/// Deposit address and the business route it belongs to
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DepositRoute {
    pub id: i64,
    pub route_type: DepositRouteType,
    pub deposit: BlockchainAddress,
}

/// Outcome of the compliance screening of a pay-in
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AmlCheck {
    Pass,
    Fail,
    Pending,
}

impl AmlCheck {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pass => "Pass",
            Self::Fail => "Fail",
            Self::Pending => "Pending",
        }
    }
}

impl std::str::FromStr for AmlCheck {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pass" => Ok(Self::Pass),
            "Fail" => Ok(Self::Fail),
            "Pending" => Ok(Self::Pending),
            _ => Err(format!("Invalid AML check: {}", s)),
        }
    }
}

/// Exchange rate between two currencies: one `source` unit buys `rate` `target` units
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Price {
    pub source: String,
    pub target: String,
    pub rate: Decimal,
}

impl Price {
    #[must_use]
    pub fn new(source: impl Into<String>, target: impl Into<String>, rate: Decimal) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            rate,
        }
    }

    /// Convert an amount in `source` units into `target` units
    pub fn convert(&self, amount: Decimal) -> Decimal {
        amount * self.rate
    }

    /// The reverse quote (target to source)
    pub fn invert(&self) -> Result<Price, AppError> {
        let rate = Decimal::ONE.checked_div(self.rate).ok_or_else(|| {
            AppError::ExternalService(ExternalServiceError::PriceUnavailable(format!(
                "zero rate for {}/{}",
                self.source, self.target
            )))
        })?;
        Ok(Price::new(self.target.clone(), self.source.clone(), rate))
    }
}

/// Direction a specification rule applies to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TransactionDirection {
    In,
    Out,
}

impl TransactionDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::In => "In",
            Self::Out => "Out",
        }
    }
}

impl std::str::FromStr for TransactionDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "In" => Ok(Self::In),
            "Out" => Ok(Self::Out),
            _ => Err(format!("Invalid transaction direction: {}", s)),
        }
    }
}

/// Minimum fee / volume rule in reference currency
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransactionSpecification {
    pub id: i64,
    /// Chain family name, or `Fiat`
    pub system: String,
    /// `None` matches every asset of the system
    pub asset: Option<String>,
    /// `None` matches both directions
    pub direction: Option<TransactionDirection>,
    pub min_fee: Decimal,
    pub min_volume: Decimal,
}

impl TransactionSpecification {
    pub fn spec(&self) -> TxSpec {
        TxSpec {
            min_fee: self.min_fee,
            min_volume: self.min_volume,
        }
    }
}

/// Minimum fee and volume pair
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct TxSpec {
    pub min_fee: Decimal,
    pub min_volume: Decimal,
}

/// Amount tagged with its currency name
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MinAmount {
    pub amount: Decimal,
    pub asset: String,
}

/// A settled obligation to pay out on-chain
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PayoutOrder {
    pub id: String,
    pub asset: Asset,
    pub amount: Decimal,
    pub destination_address: String,
    pub payout_tx_id: Option<String>,
    pub prepare_tx_id: Option<String>,
}

impl PayoutOrder {
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        asset: Asset,
        amount: Decimal,
        destination_address: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            asset,
            amount,
            destination_address: destination_address.into(),
            payout_tx_id: None,
            prepare_tx_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_blockchain_display_and_parsing() {
        for chain in Blockchain::ALL {
            assert_eq!(Blockchain::from_str(chain.as_str()).unwrap(), chain);
            assert_eq!(chain.to_string(), chain.as_str());
        }
        assert!(Blockchain::from_str("NewBlockchain").is_err());
    }

    #[test]
    fn test_stable_reference_requirement() {
        assert!(!Blockchain::Bitcoin.requires_stable_reference());
        assert!(!Blockchain::Lightning.requires_stable_reference());
        assert!(Blockchain::Ethereum.requires_stable_reference());
    }

    #[test]
    fn test_spec_key() {
        let usdt = TradeCurrency::from(Asset::token(3, "USDT", Blockchain::Ethereum, "0xdac17f"));
        assert_eq!(usdt.spec_key(), ("Ethereum", "USDT"));

        let eur = TradeCurrency::from(Fiat::new(1, "EUR"));
        assert_eq!(eur.spec_key(), ("Fiat", "EUR"));
        assert!(eur.is_fiat());
    }

    #[test]
    fn test_price_convert_and_invert() {
        let price = Price::new("ETH", "EUR", Decimal::new(2000, 0));
        assert_eq!(price.convert(Decimal::new(15, 1)), Decimal::new(3000, 0));

        let inverted = price.invert().unwrap();
        assert_eq!(inverted.source, "EUR");
        assert_eq!(inverted.target, "ETH");
        assert_eq!(inverted.convert(Decimal::new(3000, 0)).round_dp(8), Decimal::new(15, 1));
    }

    #[test]
    fn test_price_invert_zero_rate() {
        let price = Price::new("X", "EUR", Decimal::ZERO);
        assert!(price.invert().is_err());
    }
}
