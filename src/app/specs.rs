//! Minimum fee / volume rules and their conversion into native units.

use std::env;
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::domain::{
    AppError, Asset, Blockchain, Fiat, MinAmount, Price, PriceProvider, SpecificationRepository,
    TradeCurrency, TransactionDirection, TransactionSpecification, TxSpec,
};

/// Share of the minimum volume an input must exceed to be accepted
const MIN_VOLUME_SHARE: Decimal = Decimal::from_parts(5, 0, 0, false, 1);

/// Significant digits kept when converting into a crypto asset
const CRYPTO_SIGNIFICANT_DIGITS: u32 = 5;

/// Decimal places kept when converting into a fiat currency
const FIAT_DECIMAL_PLACES: u32 = 2;

/// Built-in rule used when nothing in the rule set matches.
///
/// Amounts are in the reference fiat and never zero.
#[derive(Debug, Clone, Copy)]
pub struct SpecificationDefaults {
    pub min_fee: Decimal,
    pub min_volume: Decimal,
}

impl Default for SpecificationDefaults {
    fn default() -> Self {
        Self {
            min_fee: Decimal::from(5),
            min_volume: Decimal::from(25),
        }
    }
}

impl SpecificationDefaults {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            min_fee: positive_or(
                "SPEC_DEFAULT_MIN_FEE",
                env::var("SPEC_DEFAULT_MIN_FEE").ok().as_deref(),
                defaults.min_fee,
            ),
            min_volume: positive_or(
                "SPEC_DEFAULT_MIN_VOLUME",
                env::var("SPEC_DEFAULT_MIN_VOLUME").ok().as_deref(),
                defaults.min_volume,
            ),
        }
    }

    pub fn spec(&self) -> TxSpec {
        TxSpec {
            min_fee: self.min_fee,
            min_volume: self.min_volume,
        }
    }
}

fn positive_or(name: &str, value: Option<&str>, default: Decimal) -> Decimal {
    let Some(raw) = value else {
        return default;
    };
    match Decimal::from_str(raw.trim()) {
        Ok(amount) if amount > Decimal::ZERO => amount,
        _ => {
            warn!(name, value = raw, %default, "Ignoring non-positive default specification");
            default
        }
    }
}

/// Currencies all fee math is anchored to
#[derive(Debug, Clone)]
pub struct ReferenceCurrencies {
    /// Reference fiat specification rules are expressed in
    pub fiat: TradeCurrency,
    /// Base-asset leg of a pay-in's reference amounts
    pub btc: TradeCurrency,
    /// Stable-coin leg of a pay-in's reference amounts
    pub usdt: TradeCurrency,
}

impl Default for ReferenceCurrencies {
    fn default() -> Self {
        Self {
            fiat: Fiat::new(1, "EUR").into(),
            btc: Asset::coin(1, "BTC", Blockchain::Bitcoin).into(),
            usdt: Asset::token(
                2,
                "USDT",
                Blockchain::Ethereum,
                "0xdAC17F958D2ee523a2206206994597C13D831ec7",
            )
            .into(),
        }
    }
}

impl ReferenceCurrencies {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let fiat = env::var("REFERENCE_FIAT")
            .ok()
            .filter(|v| !v.is_empty())
            .map(|name| TradeCurrency::from(Fiat::new(1, &name)))
            .unwrap_or(defaults.fiat);
        let btc_id = env::var("REFERENCE_BTC_ASSET_ID")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(1);
        let usdt_id = env::var("REFERENCE_USDT_ASSET_ID")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(2);
        let usdt_contract = env::var("REFERENCE_USDT_CONTRACT")
            .unwrap_or_else(|_| "0xdAC17F958D2ee523a2206206994597C13D831ec7".to_string());

        Self {
            fiat,
            btc: Asset::coin(btc_id, "BTC", Blockchain::Bitcoin).into(),
            usdt: Asset::token(usdt_id, "USDT", Blockchain::Ethereum, &usdt_contract).into(),
        }
    }
}

/// Both halves of a cross-direction rule, in reference currency
#[derive(Debug, Clone, PartialEq)]
pub struct DefaultSpecs {
    pub min_fee: MinAmount,
    pub min_deposit: MinAmount,
}

/// Convert an amount with a quote, rounding for the target's asset class
pub fn convert(amount: Decimal, price: &Price, is_fiat_target: bool) -> Decimal {
    let target = price.convert(amount);
    if is_fiat_target {
        target.round_dp(FIAT_DECIMAL_PLACES)
    } else {
        target
            .round_sf(CRYPTO_SIGNIFICANT_DIGITS)
            .unwrap_or(target)
            .normalize()
    }
}

fn find_spec<'a>(
    specs: &'a [TransactionSpecification],
    system: &str,
    asset: Option<&str>,
    direction: Option<TransactionDirection>,
) -> Option<&'a TransactionSpecification> {
    specs
        .iter()
        .find(|s| s.system == system && s.asset.as_deref() == asset && s.direction == direction)
}

/// In-memory snapshot of the rule set with four-tier fallback lookup
pub struct SpecificationResolver {
    repository: Arc<dyn SpecificationRepository>,
    snapshot: RwLock<Arc<Vec<TransactionSpecification>>>,
    refresh_lock: Mutex<()>,
    defaults: SpecificationDefaults,
}

impl SpecificationResolver {
    #[must_use]
    pub fn new(
        repository: Arc<dyn SpecificationRepository>,
        defaults: SpecificationDefaults,
    ) -> Self {
        Self {
            repository,
            snapshot: RwLock::new(Arc::new(Vec::new())),
            refresh_lock: Mutex::new(()),
            defaults,
        }
    }

    /// Reload the rule set. Returns `false` when another refresh is already running.
    ///
    /// On failure the previous snapshot stays in place.
    #[instrument(skip(self))]
    pub async fn refresh(&self) -> Result<bool, AppError> {
        let Ok(_guard) = self.refresh_lock.try_lock() else {
            debug!("Specification refresh already running, skipping");
            return Ok(false);
        };

        let specs = self.repository.list_specifications().await.map_err(|e| {
            warn!(error = %e, "Failed to reload transaction specifications");
            e
        })?;
        let count = specs.len();

        match self.snapshot.write() {
            Ok(mut snapshot) => *snapshot = Arc::new(specs),
            Err(poisoned) => *poisoned.into_inner() = Arc::new(specs),
        }

        info!(count, "Transaction specifications reloaded");
        Ok(true)
    }

    /// The last successfully loaded rule set
    pub fn snapshot(&self) -> Arc<Vec<TransactionSpecification>> {
        match self.snapshot.read() {
            Ok(snapshot) => Arc::clone(&snapshot),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Most specific matching rule, or the built-in default
    pub fn resolve(&self, system: &str, asset: &str, direction: TransactionDirection) -> TxSpec {
        let specs = self.snapshot();
        find_spec(&specs, system, Some(asset), Some(direction))
            .or_else(|| find_spec(&specs, system, None, Some(direction)))
            .or_else(|| find_spec(&specs, system, Some(asset), None))
            .or_else(|| find_spec(&specs, system, None, None))
            .map(TransactionSpecification::spec)
            .unwrap_or_else(|| {
                if specs.is_empty() {
                    warn!(
                        system,
                        asset,
                        ?direction,
                        min_fee = %self.defaults.min_fee,
                        min_volume = %self.defaults.min_volume,
                        "No specification rules loaded, quoting built-in defaults"
                    );
                }
                self.defaults.spec()
            })
    }

    /// Combined inbound + outbound rule: fees add up, the larger volume binds
    pub fn default_specs(
        &self,
        from_system: &str,
        from_asset: &str,
        to_system: &str,
        to_asset: &str,
        reference: &str,
    ) -> DefaultSpecs {
        let in_spec = self.resolve(from_system, from_asset, TransactionDirection::In);
        let out_spec = self.resolve(to_system, to_asset, TransactionDirection::Out);

        DefaultSpecs {
            min_fee: MinAmount {
                amount: in_spec.min_fee + out_spec.min_fee,
                asset: reference.to_string(),
            },
            min_deposit: MinAmount {
                amount: in_spec.min_volume.max(out_spec.min_volume),
                asset: reference.to_string(),
            },
        }
    }
}

/// Quoting helpers in the caller's native units
pub struct TransactionHelper {
    resolver: Arc<SpecificationResolver>,
    price_provider: Arc<dyn PriceProvider>,
    reference: TradeCurrency,
}

impl TransactionHelper {
    #[must_use]
    pub fn new(
        resolver: Arc<SpecificationResolver>,
        price_provider: Arc<dyn PriceProvider>,
        reference: TradeCurrency,
    ) -> Self {
        Self {
            resolver,
            price_provider,
            reference,
        }
    }

    pub fn resolver(&self) -> &Arc<SpecificationResolver> {
        &self.resolver
    }

    /// Inbound minimums for `from`, in `from` units
    #[instrument(skip(self), fields(currency = %from.name()))]
    pub async fn get_in_specs(&self, from: &TradeCurrency) -> Result<TxSpec, AppError> {
        let (system, asset) = from.spec_key();
        let spec = self.resolver.resolve(system, asset, TransactionDirection::In);
        self.convert_to_source(from, spec).await
    }

    /// Minimums for a `from` to `to` trade, in `from` units
    #[instrument(skip(self), fields(from = %from.name(), to = %to.name()))]
    pub async fn get_specs(
        &self,
        from: &TradeCurrency,
        to: &TradeCurrency,
    ) -> Result<TxSpec, AppError> {
        let (from_system, from_asset) = from.spec_key();
        let (to_system, to_asset) = to.spec_key();

        let specs = self.get_default_specs(from_system, from_asset, to_system, to_asset);
        let spec = TxSpec {
            min_fee: specs.min_fee.amount,
            min_volume: specs.min_deposit.amount,
        };
        self.convert_to_source(from, spec).await
    }

    /// Combined minimums in the reference currency
    pub fn get_default_specs(
        &self,
        from_system: &str,
        from_asset: &str,
        to_system: &str,
        to_asset: &str,
    ) -> DefaultSpecs {
        self.resolver.default_specs(
            from_system,
            from_asset,
            to_system,
            to_asset,
            self.reference.name(),
        )
    }

    /// Sellable and above half the inbound minimum volume
    pub async fn is_valid_input(
        &self,
        from: &TradeCurrency,
        amount: Decimal,
    ) -> Result<bool, AppError> {
        if !from.is_sellable() {
            return Ok(false);
        }

        let spec = self.get_in_specs(from).await?;
        Ok(amount > spec.min_volume * MIN_VOLUME_SHARE)
    }

    /// Amount of `to` received for `amount` of `from` after fees.
    ///
    /// `fee_percent` is in percent, `min_fee` in `from` units.
    pub async fn get_target_estimation(
        &self,
        amount: Decimal,
        fee_percent: Decimal,
        min_fee: Decimal,
        from: &TradeCurrency,
        to: &TradeCurrency,
    ) -> Result<Decimal, AppError> {
        let price = self.price_provider.get_price(from, to).await?;
        let fee_amount = (amount * fee_percent / Decimal::ONE_HUNDRED).max(min_fee);
        let net = (amount - fee_amount).max(Decimal::ZERO);
        Ok(convert(net, &price, to.is_fiat()))
    }

    async fn convert_to_source(
        &self,
        from: &TradeCurrency,
        spec: TxSpec,
    ) -> Result<TxSpec, AppError> {
        let price = if *from == self.reference {
            Price::new(self.reference.name(), self.reference.name(), Decimal::ONE)
        } else {
            self.price_provider
                .get_price(from, &self.reference)
                .await?
                .invert()?
        };

        Ok(TxSpec {
            min_fee: convert(spec.min_fee, &price, from.is_fiat()),
            min_volume: convert(spec.min_volume, &price, from.is_fiat()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MockPriceProvider, MockSpecificationRepository};

    fn rule(
        id: i64,
        asset: Option<&str>,
        direction: Option<TransactionDirection>,
        min_fee: i64,
    ) -> TransactionSpecification {
        TransactionSpecification {
            id,
            system: "Ethereum".to_string(),
            asset: asset.map(str::to_string),
            direction,
            min_fee: Decimal::from(min_fee),
            min_volume: Decimal::from(min_fee * 10),
        }
    }

    async fn resolver_with(specs: Vec<TransactionSpecification>) -> SpecificationResolver {
        let repo = Arc::new(MockSpecificationRepository::with_specs(specs));
        let resolver = SpecificationResolver::new(repo, SpecificationDefaults::default());
        resolver.refresh().await.unwrap();
        resolver
    }

    #[tokio::test]
    async fn test_four_tier_fallback() {
        let mut specs = vec![
            rule(1, Some("USDT"), Some(TransactionDirection::In), 1),
            rule(2, None, Some(TransactionDirection::In), 2),
            rule(3, Some("USDT"), None, 3),
            rule(4, None, None, 4),
        ];

        for expected in 1..=4 {
            let resolver = resolver_with(specs.clone()).await;
            let spec = resolver.resolve("Ethereum", "USDT", TransactionDirection::In);
            assert_eq!(spec.min_fee, Decimal::from(expected));
            specs.remove(0);
        }

        let resolver = resolver_with(specs).await;
        assert_eq!(
            resolver.resolve("Ethereum", "USDT", TransactionDirection::In),
            SpecificationDefaults::default().spec()
        );
    }

    #[tokio::test]
    async fn test_other_direction_does_not_match() {
        let resolver =
            resolver_with(vec![rule(1, Some("USDT"), Some(TransactionDirection::Out), 9)]).await;
        let spec = resolver.resolve("Ethereum", "USDT", TransactionDirection::In);
        assert_eq!(spec, SpecificationDefaults::default().spec());
    }

    #[tokio::test]
    async fn test_default_specs_sum_fees_and_max_volume() {
        let mut out_rule = rule(2, None, Some(TransactionDirection::Out), 3);
        out_rule.system = "Bitcoin".to_string();
        out_rule.min_volume = Decimal::from(5);
        let in_rule = rule(1, None, Some(TransactionDirection::In), 2);
        let resolver = resolver_with(vec![in_rule, out_rule]).await;

        let specs = resolver.default_specs("Ethereum", "ETH", "Bitcoin", "BTC", "EUR");
        assert_eq!(specs.min_fee.amount, Decimal::from(5));
        assert_eq!(specs.min_deposit.amount, Decimal::from(20));
        assert_eq!(specs.min_fee.asset, "EUR");
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_snapshot() {
        let repo = Arc::new(MockSpecificationRepository::with_specs(vec![rule(1, None, None, 7)]));
        let resolver = SpecificationResolver::new(repo.clone(), SpecificationDefaults::default());
        resolver.refresh().await.unwrap();

        repo.set_failing(true);
        assert!(resolver.refresh().await.is_err());
        assert_eq!(
            resolver.resolve("Ethereum", "ETH", TransactionDirection::In).min_fee,
            Decimal::from(7)
        );
    }

    #[tokio::test]
    async fn test_concurrent_refresh_is_skipped() {
        let repo = Arc::new(MockSpecificationRepository::with_specs(vec![rule(1, None, None, 7)]));
        let resolver = SpecificationResolver::new(repo.clone(), SpecificationDefaults::default());
        assert!(resolver.refresh().await.unwrap());
        let before = resolver.snapshot();

        repo.set_specs(vec![rule(2, None, None, 9)]);
        {
            let _running = resolver.refresh_lock.try_lock().unwrap();
            assert!(!resolver.refresh().await.unwrap());
            assert!(Arc::ptr_eq(&before, &resolver.snapshot()));
            assert_eq!(
                resolver.resolve("Ethereum", "ETH", TransactionDirection::In).min_fee,
                Decimal::from(7)
            );
        }

        assert!(resolver.refresh().await.unwrap());
        assert_eq!(
            resolver.resolve("Ethereum", "ETH", TransactionDirection::In).min_fee,
            Decimal::from(9)
        );
    }

    #[tokio::test]
    async fn test_unloaded_resolver_quotes_non_zero_defaults() {
        let repo = Arc::new(MockSpecificationRepository::new());
        let resolver = SpecificationResolver::new(repo, SpecificationDefaults::default());

        let spec = resolver.resolve("Ethereum", "ETH", TransactionDirection::In);
        assert!(spec.min_fee > Decimal::ZERO);
        assert!(spec.min_volume > Decimal::ZERO);

        let eth = TradeCurrency::from(Asset::coin(1, "ETH", Blockchain::Ethereum));
        let eur = TradeCurrency::from(Fiat::new(1, "EUR"));
        let prices = Arc::new(MockPriceProvider::new());
        prices.set_rate("ETH", "EUR", Decimal::from(2000));
        let helper = TransactionHelper::new(Arc::new(resolver), prices, eur);

        assert!(!helper.is_valid_input(&eth, Decimal::new(1, 6)).await.unwrap());
        assert!(helper.is_valid_input(&eth, Decimal::ONE).await.unwrap());
    }

    #[test]
    fn test_non_positive_default_is_rejected() {
        let fallback = Decimal::from(5);
        assert_eq!(positive_or("MIN", Some("0"), fallback), fallback);
        assert_eq!(positive_or("MIN", Some("-1"), fallback), fallback);
        assert_eq!(positive_or("MIN", Some("many"), fallback), fallback);
        assert_eq!(positive_or("MIN", None, fallback), fallback);
        assert_eq!(positive_or("MIN", Some("2.5"), fallback), Decimal::new(25, 1));
    }

    #[test]
    fn test_convert_rounding() {
        let price = Price::new("EUR", "ETH", Decimal::new(1, 0) / Decimal::from(3));
        assert_eq!(convert(Decimal::from(10), &price, false), Decimal::new(33333, 4));

        let price = Price::new("EUR", "CHF", Decimal::new(93456, 5));
        assert_eq!(convert(Decimal::from(10), &price, true), Decimal::new(935, 2));
    }

    #[tokio::test]
    async fn test_in_specs_converted_into_asset_units() {
        let eth = TradeCurrency::from(Asset::coin(1, "ETH", Blockchain::Ethereum));
        let eur = TradeCurrency::from(Fiat::new(1, "EUR"));
        let prices = Arc::new(MockPriceProvider::new());
        prices.set_rate("ETH", "EUR", Decimal::from(2000));

        let resolver = Arc::new(resolver_with(vec![rule(1, None, None, 4)]).await);
        let helper = TransactionHelper::new(resolver, prices, eur);

        let spec = helper.get_in_specs(&eth).await.unwrap();
        assert_eq!(spec.min_fee, Decimal::new(2, 3));
        assert_eq!(spec.min_volume, Decimal::new(2, 2));

        assert!(helper.is_valid_input(&eth, Decimal::new(11, 3)).await.unwrap());
        assert!(!helper.is_valid_input(&eth, Decimal::new(1, 2)).await.unwrap());
    }

    #[tokio::test]
    async fn test_target_estimation_never_negative() {
        let eth = TradeCurrency::from(Asset::coin(1, "ETH", Blockchain::Ethereum));
        let eur = TradeCurrency::from(Fiat::new(1, "EUR"));
        let prices = Arc::new(MockPriceProvider::new());
        prices.set_rate("ETH", "EUR", Decimal::from(2000));

        let resolver = Arc::new(resolver_with(Vec::new()).await);
        let helper = TransactionHelper::new(resolver, prices, eur.clone());

        let estimate = helper
            .get_target_estimation(Decimal::ONE, Decimal::ONE, Decimal::ZERO, &eth, &eur)
            .await
            .unwrap();
        assert_eq!(estimate, Decimal::from(1980));

        let estimate = helper
            .get_target_estimation(Decimal::ONE, Decimal::ONE, Decimal::TEN, &eth, &eur)
            .await
            .unwrap();
        assert_eq!(estimate, Decimal::ZERO);
    }
}
