//! HTTP price service client.
//!
//! Quotes are requested by currency name: `GET {base}/price?from=ETH&to=EUR`
//! answers `{"source": "ETH", "target": "EUR", "price": "2000"}`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{debug, error, instrument};

use crate::domain::{AppError, ExternalServiceError, Price, PriceProvider, TradeCurrency};

/// Default price service base URL
pub const DEFAULT_PRICE_API_URL: &str = "http://localhost:3010/v1";

#[derive(Debug, Deserialize)]
struct PriceResponse {
    source: String,
    target: String,
    price: Option<Decimal>,
}

/// Price provider backed by the internal pricing service
#[derive(Debug, Clone)]
pub struct HttpPriceProvider {
    http_client: Client,
    api_key: Option<SecretString>,
    base_url: String,
}

impl HttpPriceProvider {
    /// Create a new price provider
    ///
    /// # Arguments
    /// * `api_key` - Optional bearer token for the price service
    /// * `base_url` - Optional custom base URL. Defaults to [`DEFAULT_PRICE_API_URL`].
    pub fn new(api_key: Option<SecretString>, base_url: Option<String>) -> Result<Self, AppError> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| {
                AppError::ExternalService(ExternalServiceError::Configuration(e.to_string()))
            })?;

        Ok(Self {
            http_client,
            api_key,
            base_url: base_url
                .unwrap_or_else(|| DEFAULT_PRICE_API_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
        })
    }

    async fn fetch_price(&self, from: &str, to: &str) -> Result<Price, AppError> {
        let url = format!("{}/price", self.base_url);
        debug!(url = %url, from = %from, to = %to, "Requesting price");

        let mut request = self
            .http_client
            .get(&url)
            .query(&[("from", from), ("to", to)]);
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {}", key.expose_secret()));
        }

        let response = request.send().await.map_err(|e| {
            error!(error = %e, "Price service request failed");
            AppError::ExternalService(ExternalServiceError::Network(e.to_string()))
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "Price service returned error");
            return Err(AppError::ExternalService(ExternalServiceError::ApiError {
                status_code: status.as_u16(),
                message: body,
            }));
        }

        let body: PriceResponse = response.json().await.map_err(|e| {
            error!(error = %e, "Failed to parse price service response");
            AppError::ExternalService(ExternalServiceError::ParseError(e.to_string()))
        })?;

        match body.price {
            Some(rate) if rate > Decimal::ZERO => Ok(Price::new(body.source, body.target, rate)),
            _ => Err(AppError::ExternalService(
                ExternalServiceError::PriceUnavailable(format!("{}/{}", from, to)),
            )),
        }
    }
}

#[async_trait]
impl PriceProvider for HttpPriceProvider {
    #[instrument(skip(self, from, to), fields(from = %from.name(), to = %to.name()))]
    async fn get_price(
        &self,
        from: &TradeCurrency,
        to: &TradeCurrency,
    ) -> Result<Price, AppError> {
        if from.name() == to.name() {
            return Ok(Price::new(from.name(), to.name(), Decimal::ONE));
        }
        self.fetch_price(from.name(), to.name()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Asset, Blockchain, Fiat};

    #[test]
    fn test_trailing_slash_trimmed() {
        let provider =
            HttpPriceProvider::new(None, Some("http://prices.local/v1/".to_string())).unwrap();
        assert_eq!(provider.base_url, "http://prices.local/v1");
    }

    #[tokio::test]
    async fn test_identity_quote_is_local() {
        // Unroutable URL: any request would fail
        let provider =
            HttpPriceProvider::new(None, Some("http://127.0.0.1:1".to_string())).unwrap();
        let eth = TradeCurrency::from(Asset::coin(1, "ETH", Blockchain::Ethereum));
        let price = provider.get_price(&eth, &eth).await.unwrap();
        assert_eq!(price.rate, Decimal::ONE);

        let eur = TradeCurrency::from(Fiat::new(1, "EUR"));
        assert!(provider.get_price(&eth, &eur).await.is_err());
    }
}
