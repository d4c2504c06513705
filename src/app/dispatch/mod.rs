//! Strategy dispatch: alias registries and the payout / prepare / send /
//! sell-liquidity facades built on them.
//!
//! Every facade has a closed alias enum (chain family x asset kind). An asset
//! maps to its alias through an exhaustive match, and a registry is only
//! built when every alias has exactly one strategy.

/// Declares the closed set of aliases of one facade.
macro_rules! strategy_alias {
    ($(#[$meta:meta])* $name:ident { $($variant:ident),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$(Self::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => stringify!($variant)),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::ALL
                    .iter()
                    .copied()
                    .find(|alias| alias.as_str() == s)
                    .ok_or_else(|| format!("Invalid {}: {}", stringify!($name), s))
            }
        }

        impl<'a> From<$name> for $crate::app::dispatch::StrategyTarget<'a, $name> {
            fn from(alias: $name) -> Self {
                Self::Alias(alias)
            }
        }
    };
}

pub mod payout;
pub mod prepare;
pub mod sell_liquidity;
pub mod send;

use std::collections::HashMap;
use std::env;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use rust_decimal::Decimal;

use crate::domain::{
    AppError, Asset, Blockchain, BlockchainAddress, ChainClient, ConfigError, DexClient,
    PriceProvider,
};

pub use payout::{CoinPayoutStrategy, PayoutAlias, PayoutStrategy, TokenPayoutStrategy};
pub use prepare::{NoPreparationStrategy, PrepareAlias, PrepareStrategy, UtxoTopUpStrategy};
pub use sell_liquidity::{
    DexSellLiquidityStrategy, SellLiquidityAlias, SellLiquidityStrategy,
    UnsupportedSellLiquidityStrategy,
};
pub use send::{CoinSendStrategy, SendAlias, SendGroup, SendStrategy, TokenSendStrategy};

/// Closed key set of a facade
pub trait StrategyAlias:
    Copy + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static
{
    /// Facade name used in diagnostics
    const FACADE: &'static str;

    fn all() -> &'static [Self];

    /// Alias handling this asset, `None` when the facade has no such alias
    fn for_asset(asset: &Asset) -> Option<Self>;

    fn parse(name: &str) -> Option<Self> {
        Self::all().iter().copied().find(|a| a.to_string() == name)
    }
}

/// Implemented by every strategy: the aliases it serves
pub trait DeclaresAliases<A> {
    fn aliases(&self) -> Vec<A>;
}

/// What a caller wants a strategy for
#[derive(Debug, Clone, Copy)]
pub enum StrategyTarget<'a, A> {
    Asset(&'a Asset),
    Alias(A),
}

impl<'a, A> From<&'a Asset> for StrategyTarget<'a, A> {
    fn from(asset: &'a Asset) -> Self {
        Self::Asset(asset)
    }
}

/// Alias to strategy map of one facade
pub struct StrategyRegistry<A: StrategyAlias, S: ?Sized> {
    strategies: HashMap<A, Arc<S>>,
}

impl<A, S> StrategyRegistry<A, S>
where
    A: StrategyAlias,
    S: DeclaresAliases<A> + Send + Sync + ?Sized,
{
    /// Register every strategy under the aliases it declares.
    ///
    /// Fails when an alias is claimed twice or left without a strategy.
    pub fn build(strategies: Vec<Arc<S>>) -> Result<Self, AppError> {
        let mut map: HashMap<A, Arc<S>> = HashMap::new();

        for strategy in strategies {
            for alias in strategy.aliases() {
                if map.insert(alias, Arc::clone(&strategy)).is_some() {
                    return Err(ConfigError::DuplicateStrategy {
                        facade: A::FACADE,
                        alias: alias.to_string(),
                    }
                    .into());
                }
            }
        }

        if let Some(missing) = A::all().iter().find(|alias| !map.contains_key(*alias)) {
            return Err(ConfigError::MissingStrategy {
                facade: A::FACADE,
                alias: missing.to_string(),
            }
            .into());
        }

        Ok(Self { strategies: map })
    }

    /// Strategy for an asset or an alias
    pub fn select<'a>(&self, target: impl Into<StrategyTarget<'a, A>>) -> Result<Arc<S>, AppError> {
        let alias = match target.into() {
            StrategyTarget::Alias(alias) => alias,
            StrategyTarget::Asset(asset) => A::for_asset(asset).ok_or_else(|| {
                AppError::StrategyNotFound {
                    facade: A::FACADE,
                    alias: format!("{}{}", asset.blockchain, asset.asset_type),
                }
            })?,
        };

        self.strategies
            .get(&alias)
            .cloned()
            .ok_or_else(|| AppError::StrategyNotFound {
                facade: A::FACADE,
                alias: alias.to_string(),
            })
    }

    /// Strategy for an alias given by name (operator tooling)
    pub fn select_by_name(&self, name: &str) -> Result<Arc<S>, AppError> {
        let alias = A::parse(name).ok_or_else(|| AppError::StrategyNotFound {
            facade: A::FACADE,
            alias: name.to_string(),
        })?;
        self.select(StrategyTarget::Alias(alias))
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }
}

/// Node clients keyed by chain family
#[derive(Clone, Default)]
pub struct ChainClients {
    clients: HashMap<Blockchain, Arc<dyn ChainClient>>,
}

impl ChainClients {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, client: Arc<dyn ChainClient>) -> Self {
        self.clients.insert(client.blockchain(), client);
        self
    }

    pub fn get(&self, blockchain: Blockchain) -> Result<Arc<dyn ChainClient>, AppError> {
        self.clients.get(&blockchain).cloned().ok_or_else(|| {
            ConfigError::InvalidValue {
                key: "CHAIN_GATEWAY_URL".to_string(),
                message: format!("no client for {}", blockchain),
            }
            .into()
        })
    }

    pub fn all(&self) -> impl Iterator<Item = &Arc<dyn ChainClient>> {
        self.clients.values()
    }
}

/// Custodial wallets of one chain family
#[derive(Debug, Clone)]
pub struct ChainWallets {
    /// Operating wallet pay-ins are forwarded to
    pub forward: BlockchainAddress,
    /// Wallet funding fee top-ups
    pub fee: BlockchainAddress,
    /// Wallet payouts are sent from
    pub payout: BlockchainAddress,
}

/// Wallet addresses per chain family
#[derive(Debug, Clone, Default)]
pub struct WalletConfig {
    wallets: HashMap<Blockchain, ChainWallets>,
}

impl WalletConfig {
    /// Chain families the custodial backend holds wallets on
    pub const CHAINS: [Blockchain; 6] = [
        Blockchain::Bitcoin,
        Blockchain::Ethereum,
        Blockchain::BinanceSmartChain,
        Blockchain::Arbitrum,
        Blockchain::Optimism,
        Blockchain::DeFiChain,
    ];

    /// Reads `<CHAIN>_FORWARD_ADDRESS`, `<CHAIN>_FEE_ADDRESS` and `<CHAIN>_PAYOUT_ADDRESS`
    pub fn from_env() -> Result<Self, AppError> {
        let mut config = Self::default();
        for chain in Self::CHAINS {
            let read = |kind: &str| -> Result<BlockchainAddress, AppError> {
                let key = format!("{}_{}_ADDRESS", chain.env_prefix(), kind);
                let address = env::var(&key)
                    .ok()
                    .filter(|v| !v.is_empty())
                    .ok_or(ConfigError::MissingEnv(key))?;
                Ok(BlockchainAddress::new(address, chain))
            };
            config = config.with(
                chain,
                ChainWallets {
                    forward: read("FORWARD")?,
                    fee: read("FEE")?,
                    payout: read("PAYOUT")?,
                },
            );
        }
        Ok(config)
    }

    #[must_use]
    pub fn with(mut self, chain: Blockchain, wallets: ChainWallets) -> Self {
        self.wallets.insert(chain, wallets);
        self
    }

    pub fn get(&self, chain: Blockchain) -> Result<&ChainWallets, AppError> {
        self.wallets.get(&chain).ok_or_else(|| {
            ConfigError::MissingEnv(format!("{}_FORWARD_ADDRESS", chain.env_prefix())).into()
        })
    }
}

/// Everything the strategy set is built from
pub struct StrategyDependencies {
    pub chains: ChainClients,
    pub wallets: WalletConfig,
    pub price_provider: Arc<dyn PriceProvider>,
    pub dex_clients: HashMap<Blockchain, Arc<dyn DexClient>>,
    /// Multiplier applied to the estimated fee when topping up a token deposit
    pub token_top_up_factor: Decimal,
    /// Native amount sent ahead of a UTXO token payout
    pub utxo_top_up_amount: Decimal,
}

/// The four facades, built once at startup
pub struct Strategies {
    pub payout: StrategyRegistry<PayoutAlias, dyn PayoutStrategy>,
    pub prepare: StrategyRegistry<PrepareAlias, dyn PrepareStrategy>,
    pub send: StrategyRegistry<SendAlias, dyn SendStrategy>,
    pub sell_liquidity: StrategyRegistry<SellLiquidityAlias, dyn SellLiquidityStrategy>,
}

impl Strategies {
    pub fn build(deps: &StrategyDependencies) -> Result<Self, AppError> {
        Ok(Self {
            payout: StrategyRegistry::build(payout::build_strategies(deps)?)?,
            prepare: StrategyRegistry::build(prepare::build_strategies(deps)?)?,
            send: StrategyRegistry::build(send::build_strategies(deps)?)?,
            sell_liquidity: StrategyRegistry::build(sell_liquidity::build_strategies(deps)?)?,
        })
    }

    pub fn select_payout_strategy<'a>(
        &self,
        target: impl Into<StrategyTarget<'a, PayoutAlias>>,
    ) -> Result<Arc<dyn PayoutStrategy>, AppError> {
        self.payout.select(target)
    }

    pub fn select_prepare_strategy<'a>(
        &self,
        target: impl Into<StrategyTarget<'a, PrepareAlias>>,
    ) -> Result<Arc<dyn PrepareStrategy>, AppError> {
        self.prepare.select(target)
    }

    pub fn select_send_strategy<'a>(
        &self,
        target: impl Into<StrategyTarget<'a, SendAlias>>,
    ) -> Result<Arc<dyn SendStrategy>, AppError> {
        self.send.select(target)
    }

    pub fn select_sell_liquidity_strategy<'a>(
        &self,
        target: impl Into<StrategyTarget<'a, SellLiquidityAlias>>,
    ) -> Result<Arc<dyn SellLiquidityStrategy>, AppError> {
        self.sell_liquidity.select(target)
    }
}
