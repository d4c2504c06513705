//! Mock implementations for testing.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::app::{ChainClients, ChainWallets, StrategyDependencies, WalletConfig};
use crate::domain::{
    AppError, Asset, Blockchain, BlockchainAddress, BlockchainError, ChainClient, DatabaseError,
    DexClient, ExternalServiceError, PayIn, PayInClassifier, PayInDecision, PayInIdentity,
    PayInRepository, PayInStatus, Price, PriceProvider, SpecificationRepository, TradeCurrency,
    TransactionSpecification,
};

/// Configuration for mock behavior
#[derive(Debug, Clone, Default)]
pub struct MockConfig {
    pub should_fail: bool,
    pub error_message: Option<String>,
}

impl MockConfig {
    #[must_use]
    pub fn success() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            should_fail: true,
            error_message: Some(message.into()),
        }
    }

    fn message(&self) -> String {
        self.error_message
            .clone()
            .unwrap_or_else(|| "Mock error".to_string())
    }
}

/// In-memory pay-in repository
pub struct MockPayInRepository {
    storage: Arc<Mutex<HashMap<String, PayIn>>>,
    config: MockConfig,
    failing_saves: Mutex<HashMap<(String, PayInStatus), u32>>,
    is_healthy: AtomicBool,
}

impl MockPayInRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(MockConfig::success())
    }

    #[must_use]
    pub fn with_config(config: MockConfig) -> Self {
        Self {
            storage: Arc::new(Mutex::new(HashMap::new())),
            config,
            failing_saves: Mutex::new(HashMap::new()),
            is_healthy: AtomicBool::new(true),
        }
    }

    #[must_use]
    pub fn failing(message: impl Into<String>) -> Self {
        Self::with_config(MockConfig::failure(message))
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.is_healthy.store(healthy, Ordering::Relaxed);
    }

    /// Make the next `times` saves of one record in `status` fail
    pub fn fail_saves_in(&self, id: &str, status: PayInStatus, times: u32) {
        self.failing_saves
            .lock()
            .unwrap()
            .insert((id.to_string(), status), times);
    }

    /// Get all stored pay-ins, oldest first (for testing)
    pub fn get_all_items(&self) -> Vec<PayIn> {
        let mut items: Vec<PayIn> = self.storage.lock().unwrap().values().cloned().collect();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        items
    }

    /// Store a record as-is, bypassing identity checks (for testing)
    pub fn insert(&self, pay_in: PayIn) {
        self.storage
            .lock()
            .unwrap()
            .insert(pay_in.id.clone(), pay_in);
    }

    fn check_should_fail(&self) -> Result<(), AppError> {
        if self.config.should_fail {
            return Err(AppError::Database(DatabaseError::Query(
                self.config.message(),
            )));
        }
        Ok(())
    }

    fn take_injected_failure(&self, pay_ins: &[PayIn]) -> Result<(), AppError> {
        let mut failing = self.failing_saves.lock().unwrap();
        for pay_in in pay_ins {
            let key = (pay_in.id.clone(), pay_in.status);
            if let Some(remaining) = failing.get_mut(&key) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(AppError::Database(DatabaseError::Query(format!(
                        "Mock save of {} failed",
                        pay_in.id
                    ))));
                }
            }
        }
        Ok(())
    }

    fn select(&self, filter: impl Fn(&PayIn) -> bool) -> Vec<PayIn> {
        self.get_all_items().into_iter().filter(filter).collect()
    }
}

impl Default for MockPayInRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PayInRepository for MockPayInRepository {
    async fn health_check(&self) -> Result<(), AppError> {
        if !self.is_healthy.load(Ordering::Relaxed) {
            return Err(AppError::Database(DatabaseError::Connection(
                "Mock unhealthy".to_string(),
            )));
        }
        self.check_should_fail()
    }

    async fn create_pay_in(&self, pay_in: &PayIn) -> Result<PayIn, AppError> {
        self.check_should_fail()?;
        let mut storage = self.storage.lock().unwrap();
        let identity = pay_in.identity();
        if let Some(existing) = storage.values().find(|p| p.identity() == identity) {
            return Ok(existing.clone());
        }
        storage.insert(pay_in.id.clone(), pay_in.clone());
        Ok(pay_in.clone())
    }

    async fn find_by_identity(
        &self,
        identity: &PayInIdentity,
    ) -> Result<Option<PayIn>, AppError> {
        self.check_should_fail()?;
        Ok(self.select(|p| &p.identity() == identity).into_iter().next())
    }

    async fn get_pay_in(&self, id: &str) -> Result<Option<PayIn>, AppError> {
        self.check_should_fail()?;
        Ok(self.storage.lock().unwrap().get(id).cloned())
    }

    async fn find_by_status(&self, statuses: &[PayInStatus]) -> Result<Vec<PayIn>, AppError> {
        self.check_should_fail()?;
        Ok(self.select(|p| statuses.contains(&p.status)))
    }

    async fn find_unconfirmed(&self) -> Result<Vec<PayIn>, AppError> {
        self.check_should_fail()?;
        Ok(self.select(|p| {
            !p.is_confirmed && !matches!(p.status, PayInStatus::Failed | PayInStatus::Ignored)
        }))
    }

    async fn save_pay_in(&self, pay_in: &PayIn) -> Result<(), AppError> {
        self.save_pay_ins(std::slice::from_ref(pay_in)).await
    }

    /// All or nothing, like a database transaction
    async fn save_pay_ins(&self, pay_ins: &[PayIn]) -> Result<(), AppError> {
        self.check_should_fail()?;
        self.take_injected_failure(pay_ins)?;

        let mut storage = self.storage.lock().unwrap();
        if let Some(missing) = pay_ins.iter().find(|p| !storage.contains_key(&p.id)) {
            return Err(AppError::Database(DatabaseError::NotFound(
                missing.id.clone(),
            )));
        }
        for pay_in in pay_ins {
            storage.insert(pay_in.id.clone(), pay_in.clone());
        }
        Ok(())
    }
}

/// In-memory specification rule set
#[derive(Default)]
pub struct MockSpecificationRepository {
    specs: Mutex<Vec<TransactionSpecification>>,
    failing: AtomicBool,
}

impl MockSpecificationRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_specs(specs: Vec<TransactionSpecification>) -> Self {
        Self {
            specs: Mutex::new(specs),
            failing: AtomicBool::new(false),
        }
    }

    pub fn set_specs(&self, specs: Vec<TransactionSpecification>) {
        *self.specs.lock().unwrap() = specs;
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }
}

#[async_trait]
impl SpecificationRepository for MockSpecificationRepository {
    async fn list_specifications(&self) -> Result<Vec<TransactionSpecification>, AppError> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(AppError::Database(DatabaseError::Connection(
                "Mock specification store unavailable".to_string(),
            )));
        }
        Ok(self.specs.lock().unwrap().clone())
    }
}

/// Price table keyed by currency name. Identical names quote 1, a missing
/// pair falls back to the inverse of the reverse pair.
#[derive(Default)]
pub struct MockPriceProvider {
    rates: Mutex<HashMap<(String, String), Decimal>>,
    failing: AtomicBool,
}

impl MockPriceProvider {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_rate(&self, source: &str, target: &str, rate: Decimal) {
        self.rates
            .lock()
            .unwrap()
            .insert((source.to_string(), target.to_string()), rate);
    }

    pub fn remove_rate(&self, source: &str, target: &str) {
        self.rates
            .lock()
            .unwrap()
            .remove(&(source.to_string(), target.to_string()));
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }
}

#[async_trait]
impl PriceProvider for MockPriceProvider {
    async fn get_price(
        &self,
        from: &TradeCurrency,
        to: &TradeCurrency,
    ) -> Result<Price, AppError> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(AppError::ExternalService(ExternalServiceError::Network(
                "Mock price service down".to_string(),
            )));
        }
        let (source, target) = (from.name(), to.name());
        if source == target {
            return Ok(Price::new(source, target, Decimal::ONE));
        }

        let rates = self.rates.lock().unwrap();
        if let Some(rate) = rates.get(&(source.to_string(), target.to_string())) {
            return Ok(Price::new(source, target, *rate));
        }
        if let Some(rate) = rates.get(&(target.to_string(), source.to_string())) {
            return Price::new(target, source, *rate).invert();
        }
        Err(AppError::ExternalService(
            ExternalServiceError::PriceUnavailable(format!("{}/{}", source, target)),
        ))
    }
}

/// A transfer broadcast through [`MockChainClient`]
#[derive(Debug, Clone, PartialEq)]
pub struct SentTransfer {
    pub tx_id: String,
    pub from: String,
    pub to: String,
    /// `None` for native coin transfers
    pub asset: Option<String>,
    pub amount: Decimal,
}

/// Node client for one chain family. Transactions are complete by default.
pub struct MockChainClient {
    blockchain: Blockchain,
    config: MockConfig,
    fee: Mutex<Option<Decimal>>,
    balances: Mutex<HashMap<String, Decimal>>,
    sent: Mutex<Vec<SentTransfer>>,
    pending: Mutex<HashSet<String>>,
    complete_by_default: AtomicBool,
    sends_fail: AtomicBool,
    send_delay_ms: AtomicU64,
    is_healthy: AtomicBool,
    counter: AtomicU64,
}

impl MockChainClient {
    #[must_use]
    pub fn new(blockchain: Blockchain) -> Self {
        Self::with_config(blockchain, MockConfig::success())
    }

    #[must_use]
    pub fn with_config(blockchain: Blockchain, config: MockConfig) -> Self {
        Self {
            blockchain,
            config,
            fee: Mutex::new(Some(Decimal::new(1, 4))),
            balances: Mutex::new(HashMap::new()),
            sent: Mutex::new(Vec::new()),
            pending: Mutex::new(HashSet::new()),
            complete_by_default: AtomicBool::new(true),
            sends_fail: AtomicBool::new(false),
            send_delay_ms: AtomicU64::new(0),
            is_healthy: AtomicBool::new(true),
            counter: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn failing(blockchain: Blockchain, message: impl Into<String>) -> Self {
        Self::with_config(blockchain, MockConfig::failure(message))
    }

    /// Fee returned by `estimate_native_fee`
    pub fn set_fee(&self, fee: Option<Decimal>) {
        *self.fee.lock().unwrap() = fee;
    }

    pub fn set_balance(&self, address: &str, balance: Decimal) {
        self.balances
            .lock()
            .unwrap()
            .insert(address.to_string(), balance);
    }

    /// Mark one transaction as not yet complete (or complete again)
    pub fn set_tx_complete(&self, tx_id: &str, complete: bool) {
        let mut pending = self.pending.lock().unwrap();
        if complete {
            pending.remove(tx_id);
        } else {
            pending.insert(tx_id.to_string());
        }
    }

    /// Whether transactions not explicitly marked are complete
    pub fn set_complete_by_default(&self, complete: bool) {
        self.complete_by_default.store(complete, Ordering::Relaxed);
    }

    /// Make broadcasts fail with a connection error
    pub fn set_sends_failing(&self, failing: bool) {
        self.sends_fail.store(failing, Ordering::Relaxed);
    }

    /// Hold every broadcast for `delay` before it goes out
    pub fn set_send_delay(&self, delay: Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.send_delay_ms.store(millis, Ordering::Relaxed);
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.is_healthy.store(healthy, Ordering::Relaxed);
    }

    /// Get all broadcast transfers (for testing)
    pub fn sent(&self) -> Vec<SentTransfer> {
        self.sent.lock().unwrap().clone()
    }

    fn check_should_fail(&self) -> Result<(), AppError> {
        if self.config.should_fail {
            return Err(AppError::Blockchain(BlockchainError::Connection(
                self.config.message(),
            )));
        }
        Ok(())
    }

    async fn wait_before_send(&self) {
        let millis = self.send_delay_ms.load(Ordering::Relaxed);
        if millis > 0 {
            tokio::time::sleep(Duration::from_millis(millis)).await;
        }
    }

    fn broadcast(
        &self,
        from: &str,
        to: &str,
        asset: Option<String>,
        amount: Decimal,
    ) -> Result<String, AppError> {
        self.check_should_fail()?;
        if self.sends_fail.load(Ordering::Relaxed) {
            return Err(AppError::Blockchain(BlockchainError::Connection(
                "Mock broadcast failed".to_string(),
            )));
        }
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        let tx_id = format!("{}-tx-{}", self.blockchain.as_str().to_lowercase(), n);
        self.sent.lock().unwrap().push(SentTransfer {
            tx_id: tx_id.clone(),
            from: from.to_string(),
            to: to.to_string(),
            asset,
            amount,
        });
        Ok(tx_id)
    }
}

#[async_trait]
impl ChainClient for MockChainClient {
    fn blockchain(&self) -> Blockchain {
        self.blockchain
    }

    async fn health_check(&self) -> Result<(), AppError> {
        if !self.is_healthy.load(Ordering::Relaxed) {
            return Err(AppError::Blockchain(BlockchainError::Connection(
                "Mock unhealthy".to_string(),
            )));
        }
        self.check_should_fail()
    }

    async fn get_native_balance(&self, address: &str) -> Result<Decimal, AppError> {
        self.check_should_fail()?;
        Ok(self
            .balances
            .lock()
            .unwrap()
            .get(address)
            .copied()
            .unwrap_or_default())
    }

    async fn get_token_balance(&self, address: &str, _asset: &Asset) -> Result<Decimal, AppError> {
        self.get_native_balance(address).await
    }

    async fn send_native(
        &self,
        from_address: &str,
        to_address: &str,
        amount: Decimal,
    ) -> Result<String, AppError> {
        self.wait_before_send().await;
        self.broadcast(from_address, to_address, None, amount)
    }

    async fn send_token(
        &self,
        from_address: &str,
        to_address: &str,
        asset: &Asset,
        amount: Decimal,
    ) -> Result<String, AppError> {
        self.wait_before_send().await;
        self.broadcast(from_address, to_address, Some(asset.name.clone()), amount)
    }

    async fn is_tx_complete(&self, tx_id: &str) -> Result<bool, AppError> {
        self.check_should_fail()?;
        if self.pending.lock().unwrap().contains(tx_id) {
            return Ok(false);
        }
        Ok(self.complete_by_default.load(Ordering::Relaxed))
    }

    async fn estimate_native_fee(&self, _asset: &Asset) -> Result<Option<Decimal>, AppError> {
        self.check_should_fail()?;
        Ok(*self.fee.lock().unwrap())
    }
}

/// Liquidity venue recording every sale
pub struct MockDexClient {
    blockchain: Blockchain,
    sales: Mutex<Vec<(String, Decimal)>>,
}

impl MockDexClient {
    #[must_use]
    pub fn new(blockchain: Blockchain) -> Self {
        Self {
            blockchain,
            sales: Mutex::new(Vec::new()),
        }
    }

    /// Asset name and amount of every sale (for testing)
    pub fn sales(&self) -> Vec<(String, Decimal)> {
        self.sales.lock().unwrap().clone()
    }
}

#[async_trait]
impl DexClient for MockDexClient {
    fn blockchain(&self) -> Blockchain {
        self.blockchain
    }

    async fn sell_liquidity(&self, asset: &Asset, amount: Decimal) -> Result<String, AppError> {
        let mut sales = self.sales.lock().unwrap();
        sales.push((asset.name.clone(), amount));
        Ok(format!("dex-{}-{}", self.blockchain.as_str().to_lowercase(), sales.len()))
    }
}

/// Classifier returning a fixed decision, optionally per deposit address
pub struct MockClassifier {
    default: Mutex<PayInDecision>,
    by_address: Mutex<HashMap<String, PayInDecision>>,
    config: MockConfig,
}

impl MockClassifier {
    #[must_use]
    pub fn new(decision: PayInDecision) -> Self {
        Self {
            default: Mutex::new(decision),
            by_address: Mutex::new(HashMap::new()),
            config: MockConfig::success(),
        }
    }

    /// Classification fails with a routing service outage
    #[must_use]
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            config: MockConfig::failure(message),
            ..Self::new(PayInDecision::Defer)
        }
    }

    pub fn set_decision(&self, decision: PayInDecision) {
        *self.default.lock().unwrap() = decision;
    }

    pub fn set_decision_for(&self, address: &str, decision: PayInDecision) {
        self.by_address
            .lock()
            .unwrap()
            .insert(address.to_string(), decision);
    }
}

#[async_trait]
impl PayInClassifier for MockClassifier {
    async fn classify(&self, pay_in: &PayIn) -> Result<PayInDecision, AppError> {
        if self.config.should_fail {
            return Err(AppError::ExternalService(ExternalServiceError::Network(
                self.config.message(),
            )));
        }
        if let Some(decision) = self.by_address.lock().unwrap().get(&pay_in.address.address) {
            return Ok(decision.clone());
        }
        Ok(self.default.lock().unwrap().clone())
    }
}

/// Mock clients for every chain family a strategy set needs
pub struct MockChains {
    pub clients: HashMap<Blockchain, Arc<MockChainClient>>,
    pub dex: HashMap<Blockchain, Arc<MockDexClient>>,
}

impl MockChains {
    #[must_use]
    pub fn new() -> Self {
        let clients = WalletConfig::CHAINS
            .into_iter()
            .map(|chain| (chain, Arc::new(MockChainClient::new(chain))))
            .collect();
        let dex = [Blockchain::Ethereum, Blockchain::BinanceSmartChain]
            .into_iter()
            .map(|chain| (chain, Arc::new(MockDexClient::new(chain))))
            .collect();
        Self { clients, dex }
    }

    pub fn client(&self, chain: Blockchain) -> &Arc<MockChainClient> {
        &self.clients[&chain]
    }

    /// Wallet names follow `<chain>-forward`, `<chain>-fee`, `<chain>-payout`
    pub fn wallets(&self) -> WalletConfig {
        WalletConfig::CHAINS
            .into_iter()
            .fold(WalletConfig::default(), |config, chain| {
                config.with(chain, mock_wallets(chain))
            })
    }

    pub fn dependencies(&self, price_provider: Arc<dyn PriceProvider>) -> StrategyDependencies {
        let chains = self
            .clients
            .values()
            .fold(ChainClients::new(), |chains, client| {
                chains.with(Arc::clone(client) as Arc<dyn ChainClient>)
            });
        let dex_clients = self
            .dex
            .iter()
            .map(|(chain, dex)| (*chain, Arc::clone(dex) as Arc<dyn DexClient>))
            .collect();

        StrategyDependencies {
            chains,
            wallets: self.wallets(),
            price_provider,
            dex_clients,
            token_top_up_factor: Decimal::new(15, 1),
            utxo_top_up_amount: Decimal::new(1, 2),
        }
    }
}

impl Default for MockChains {
    fn default() -> Self {
        Self::new()
    }
}

/// Wallet set used by [`MockChains`]
pub fn mock_wallets(chain: Blockchain) -> ChainWallets {
    let name = chain.as_str().to_lowercase();
    ChainWallets {
        forward: BlockchainAddress::new(format!("{}-forward", name), chain),
        fee: BlockchainAddress::new(format!("{}-fee", name), chain),
        payout: BlockchainAddress::new(format!("{}-payout", name), chain),
    }
}
