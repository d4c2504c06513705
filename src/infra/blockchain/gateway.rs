//! HTTP chain gateway client.
//!
//! One node gateway serves every chain family under `{base}/{chain}`. Reads are
//! retried on transport errors; broadcasts are sent exactly once.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use crate::domain::{AppError, Asset, Blockchain, BlockchainError, ChainClient, DexClient};

/// Configuration for the gateway client
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_delay: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TxStatusResponse {
    complete: bool,
}

#[derive(Debug, Deserialize)]
struct BalanceResponse {
    balance: Decimal,
}

#[derive(Debug, Deserialize)]
struct FeeResponse {
    fee: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
struct TxResponse {
    tx_id: String,
}

#[derive(Debug, Serialize)]
struct SendRequest<'a> {
    from: &'a str,
    to: &'a str,
    amount: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    contract: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct SellRequest<'a> {
    asset: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    contract: Option<&'a str>,
    amount: Decimal,
}

/// Shared HTTP plumbing for the chain and DEX clients
#[derive(Debug, Clone)]
struct GatewayTransport {
    http_client: Client,
    chain_url: String,
    config: GatewayConfig,
}

impl GatewayTransport {
    fn new(
        base_url: &str,
        blockchain: Blockchain,
        config: GatewayConfig,
    ) -> Result<Self, AppError> {
        let http_client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| AppError::Blockchain(BlockchainError::Connection(e.to_string())))?;

        Ok(Self {
            http_client,
            chain_url: format!("{}/{}", base_url.trim_end_matches('/'), blockchain.as_str()),
            config,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.chain_url, path)
    }

    async fn execute<R: DeserializeOwned + Send>(
        &self,
        request: RequestBuilder,
    ) -> Result<R, AppError> {
        let response = request.send().await.map_err(|e| {
            error!(error = %e, "Gateway request failed");
            if e.is_timeout() {
                AppError::Blockchain(BlockchainError::Timeout(e.to_string()))
            } else {
                AppError::Blockchain(BlockchainError::Connection(e.to_string()))
            }
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "Gateway returned error");
            let message = format!("{}: {}", status.as_u16(), body);
            return Err(AppError::Blockchain(if status.is_server_error() {
                BlockchainError::Connection(message)
            } else {
                BlockchainError::TransactionFailed(message)
            }));
        }

        response.json().await.map_err(|e| {
            error!(error = %e, "Failed to parse gateway response");
            AppError::Blockchain(BlockchainError::InvalidResponse(e.to_string()))
        })
    }

    /// GET with retries on connection-level failures
    async fn get<R: DeserializeOwned + Send>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<R, AppError> {
        let url = self.url(path);
        let mut last_error = None;
        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                tokio::time::sleep(self.config.retry_delay).await;
            }
            debug!(url = %url, attempt = attempt, "Gateway GET");
            match self.execute(self.http_client.get(&url).query(query)).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() => {
                    warn!(attempt = attempt, error = %e, url = %url, "Gateway read failed");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or_else(|| {
            AppError::Blockchain(BlockchainError::Connection("No attempts made".to_string()))
        }))
    }

    /// POST without retries
    async fn post<B: Serialize + Sync + ?Sized, R: DeserializeOwned + Send>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R, AppError> {
        let url = self.url(path);
        debug!(url = %url, "Gateway POST");
        self.execute(self.http_client.post(&url).json(body)).await
    }
}

/// [`ChainClient`] backed by the node gateway
#[derive(Debug, Clone)]
pub struct HttpChainGateway {
    blockchain: Blockchain,
    transport: GatewayTransport,
}

impl HttpChainGateway {
    pub fn new(
        blockchain: Blockchain,
        base_url: &str,
        config: GatewayConfig,
    ) -> Result<Self, AppError> {
        Ok(Self {
            blockchain,
            transport: GatewayTransport::new(base_url, blockchain, config)?,
        })
    }

    pub fn with_defaults(blockchain: Blockchain, base_url: &str) -> Result<Self, AppError> {
        Self::new(blockchain, base_url, GatewayConfig::default())
    }
}

#[async_trait]
impl ChainClient for HttpChainGateway {
    fn blockchain(&self) -> Blockchain {
        self.blockchain
    }

    #[instrument(skip(self), fields(chain = %self.blockchain))]
    async fn health_check(&self) -> Result<(), AppError> {
        let _: serde_json::Value = self.transport.get("/health", &[]).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(chain = %self.blockchain))]
    async fn get_native_balance(&self, address: &str) -> Result<Decimal, AppError> {
        let response: BalanceResponse = self
            .transport
            .get(&format!("/addresses/{}/balance", address), &[])
            .await?;
        Ok(response.balance)
    }

    #[instrument(skip(self, asset), fields(chain = %self.blockchain, asset = %asset.name))]
    async fn get_token_balance(&self, address: &str, asset: &Asset) -> Result<Decimal, AppError> {
        let contract = asset.chain_id.as_deref().unwrap_or_default();
        let response: BalanceResponse = self
            .transport
            .get(
                &format!("/addresses/{}/balance", address),
                &[("contract", contract)],
            )
            .await?;
        Ok(response.balance)
    }

    #[instrument(skip(self), fields(chain = %self.blockchain))]
    async fn send_native(
        &self,
        from_address: &str,
        to_address: &str,
        amount: Decimal,
    ) -> Result<String, AppError> {
        let request = SendRequest {
            from: from_address,
            to: to_address,
            amount,
            contract: None,
        };
        let response: TxResponse = self.transport.post("/transactions/native", &request).await?;
        info!(tx_id = %response.tx_id, "Native transfer broadcast");
        Ok(response.tx_id)
    }

    #[instrument(skip(self, asset), fields(chain = %self.blockchain, asset = %asset.name))]
    async fn send_token(
        &self,
        from_address: &str,
        to_address: &str,
        asset: &Asset,
        amount: Decimal,
    ) -> Result<String, AppError> {
        let contract = asset.chain_id.as_deref().ok_or_else(|| {
            AppError::Blockchain(BlockchainError::TransactionFailed(format!(
                "Token {} has no contract address",
                asset.name
            )))
        })?;
        let request = SendRequest {
            from: from_address,
            to: to_address,
            amount,
            contract: Some(contract),
        };
        let response: TxResponse = self.transport.post("/transactions/token", &request).await?;
        info!(tx_id = %response.tx_id, "Token transfer broadcast");
        Ok(response.tx_id)
    }

    #[instrument(skip(self), fields(chain = %self.blockchain))]
    async fn is_tx_complete(&self, tx_id: &str) -> Result<bool, AppError> {
        let response: TxStatusResponse = self
            .transport
            .get(&format!("/transactions/{}", tx_id), &[])
            .await?;
        Ok(response.complete)
    }

    #[instrument(skip(self, asset), fields(chain = %self.blockchain, asset = %asset.name))]
    async fn estimate_native_fee(&self, asset: &Asset) -> Result<Option<Decimal>, AppError> {
        let contract = asset.chain_id.as_deref().unwrap_or_default();
        let response: FeeResponse = self
            .transport
            .get(
                "/fees/native",
                &[("asset_type", asset.asset_type.as_str()), ("contract", contract)],
            )
            .await?;
        Ok(response.fee)
    }
}

/// [`DexClient`] backed by the node gateway's swap endpoint
#[derive(Debug, Clone)]
pub struct HttpDexGateway {
    blockchain: Blockchain,
    transport: GatewayTransport,
}

impl HttpDexGateway {
    pub fn new(
        blockchain: Blockchain,
        base_url: &str,
        config: GatewayConfig,
    ) -> Result<Self, AppError> {
        Ok(Self {
            blockchain,
            transport: GatewayTransport::new(base_url, blockchain, config)?,
        })
    }
}

#[async_trait]
impl DexClient for HttpDexGateway {
    fn blockchain(&self) -> Blockchain {
        self.blockchain
    }

    #[instrument(skip(self, asset), fields(chain = %self.blockchain, asset = %asset.name))]
    async fn sell_liquidity(&self, asset: &Asset, amount: Decimal) -> Result<String, AppError> {
        let request = SellRequest {
            asset: &asset.dex_name,
            contract: asset.chain_id.as_deref(),
            amount,
        };
        let response: TxResponse = self.transport.post("/dex/sell", &request).await?;
        info!(tx_id = %response.tx_id, "Liquidity sold");
        Ok(response.tx_id)
    }
}
