//! Application entry point.

use std::collections::HashMap;
use std::env;
use std::sync::Arc;

use anyhow::{Context, Result};
use dotenvy::dotenv;
use secrecy::SecretString;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use payin_relay::app::{
    AppDependencies, AppState, ChainClients, PayInConfig, ReferenceCurrencies,
    SpecificationDefaults, StrategyDependencies, WalletConfig, WorkerConfig, spawn_payin_worker,
    spawn_spec_refresh,
};
use payin_relay::domain::{Blockchain, ChainClient, DexClient};
use payin_relay::infra::{
    GatewayConfig, HttpChainGateway, HttpDexGateway, HttpPriceProvider, HttpRouteClassifier,
    PostgresClient, PostgresConfig,
};

/// Chain families with a DEX liquidity venue
const DEX_CHAINS: [Blockchain; 2] = [Blockchain::Ethereum, Blockchain::BinanceSmartChain];

/// Application configuration
struct Config {
    database_url: String,
    /// Price service base URL (optional - uses default if not set)
    price_api_url: Option<String>,
    price_api_key: Option<SecretString>,
    /// Routing service base URL (optional - uses default if not set)
    routing_api_url: Option<String>,
    routing_api_key: Option<SecretString>,
    chain_gateway_url: String,
    json_logs: bool,
    payin_config: PayInConfig,
    worker_config: WorkerConfig,
    spec_defaults: SpecificationDefaults,
    references: ReferenceCurrencies,
    wallets: WalletConfig,
}

impl Config {
    fn from_env() -> Result<Self> {
        let database_url = env::var("DATABASE_URL").context("DATABASE_URL not set")?;
        let price_api_url = env::var("PRICE_API_URL").ok().filter(|u| !u.is_empty());
        let price_api_key = env::var("PRICE_API_KEY")
            .ok()
            .filter(|k| !k.is_empty())
            .map(SecretString::from);
        let routing_api_url = env::var("ROUTING_API_URL").ok().filter(|u| !u.is_empty());
        let routing_api_key = env::var("ROUTING_API_KEY")
            .ok()
            .filter(|k| !k.is_empty())
            .map(SecretString::from);
        let chain_gateway_url = env::var("CHAIN_GATEWAY_URL")
            .unwrap_or_else(|_| "http://localhost:8545".to_string());

        let wallets = WalletConfig::from_env().context("Wallet addresses incomplete")?;

        Ok(Self {
            database_url,
            price_api_url,
            price_api_key,
            routing_api_url,
            routing_api_key,
            chain_gateway_url,
            json_logs: env::var("LOG_FORMAT").map(|v| v == "json").unwrap_or(false),
            payin_config: PayInConfig::from_env(),
            worker_config: WorkerConfig::from_env(),
            spec_defaults: SpecificationDefaults::from_env(),
            references: ReferenceCurrencies::from_env(),
            wallets,
        })
    }
}

fn init_tracing(json: bool) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn"));

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let config = Config::from_env()?;
    init_tracing(config.json_logs);

    info!("🏗️  Pay-in relay v{}", env!("CARGO_PKG_VERSION"));
    info!("📦 Initializing infrastructure...");

    let postgres_client =
        Arc::new(PostgresClient::new(&config.database_url, PostgresConfig::default()).await?);
    postgres_client.run_migrations().await?;
    info!("   ✓ Database connected and migrations applied");

    if config.price_api_key.is_none() {
        warn!("   ⚠ PRICE_API_KEY not set, calling price service unauthenticated");
    }
    let price_provider = Arc::new(HttpPriceProvider::new(
        config.price_api_key.clone(),
        config.price_api_url.clone(),
    )?);
    info!("   ✓ Price provider created");

    let classifier = Arc::new(HttpRouteClassifier::new(
        config.routing_api_key.clone(),
        config.routing_api_url.clone(),
    )?);
    info!("   ✓ Routing classifier created");

    let mut chains = ChainClients::new();
    for chain in WalletConfig::CHAINS {
        let client: Arc<dyn ChainClient> = Arc::new(HttpChainGateway::new(
            chain,
            &config.chain_gateway_url,
            GatewayConfig::default(),
        )?);
        chains = chains.with(client);
    }
    let mut dex_clients: HashMap<Blockchain, Arc<dyn DexClient>> = HashMap::new();
    for chain in DEX_CHAINS {
        dex_clients.insert(
            chain,
            Arc::new(HttpDexGateway::new(
                chain,
                &config.chain_gateway_url,
                GatewayConfig::default(),
            )?),
        );
    }
    info!(
        "   ✓ Chain gateway clients created ({} chains, {} DEX venues)",
        WalletConfig::CHAINS.len(),
        dex_clients.len()
    );

    let deps = AppDependencies {
        pay_in_repository: postgres_client.clone(),
        specification_repository: postgres_client,
        price_provider: price_provider.clone(),
        classifier,
        strategies: StrategyDependencies {
            chains,
            wallets: config.wallets,
            price_provider,
            dex_clients,
            token_top_up_factor: config.payin_config.token_top_up_factor,
            utxo_top_up_amount: config.payin_config.utxo_top_up_amount,
        },
    };

    let app_state = AppState::new(
        deps,
        config.references,
        &config.payin_config,
        config.spec_defaults,
    )
    .context("Failed to build strategy registries")?;
    info!(
        "   ✓ Strategies registered (payout: {}, prepare: {}, send: {}, sell liquidity: {})",
        app_state.strategies.payout.len(),
        app_state.strategies.prepare.len(),
        app_state.strategies.send.len(),
        app_state.strategies.sell_liquidity.len()
    );

    if let Err(e) = app_state.spec_resolver.refresh().await {
        warn!(error = %e, "   ⚠ Initial specification load failed, using defaults");
    }

    let mut workers = Vec::new();
    if config.worker_config.enabled {
        workers.push(spawn_spec_refresh(
            Arc::clone(&app_state.spec_resolver),
            &config.worker_config,
        ));
        workers.push(spawn_payin_worker(
            Arc::clone(&app_state.payin_service),
            &config.worker_config,
        ));
        info!(
            "   ✓ Background workers started (sweep: {}s, spec refresh: {}s)",
            config.worker_config.sweep_interval.as_secs(),
            config.worker_config.spec_refresh_interval.as_secs()
        );
    } else {
        info!("   ○ Background workers disabled");
    }

    info!("🚀 Pay-in relay running");
    shutdown_signal().await;

    for (handle, shutdown_tx) in workers {
        let _ = shutdown_tx.send(true);
        if let Err(e) = handle.await {
            warn!(error = %e, "Worker did not shut down cleanly");
        }
    }

    info!("Shutdown complete");
    Ok(())
}
