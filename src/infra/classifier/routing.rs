//! Routing service classifier.
//!
//! Asks the routing service which deposit route a pay-in belongs to and what
//! should happen to it. The service owns route matching and AML screening;
//! this client only maps its answer onto a [`PayInDecision`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use crate::domain::{
    AmlCheck, AppError, BlockchainAddress, DepositRoute, DepositRouteType, ExternalServiceError,
    PayIn, PayInClassifier, PayInDecision, PayInPurpose,
};

/// Default routing service base URL
pub const DEFAULT_ROUTING_API_URL: &str = "http://localhost:3020/v1";

/// Action returned by the routing service
#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum RoutingAction {
    Acknowledge,
    Return,
    Ignore,
    Fail,
    Defer,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct RouteInfo {
    pub id: i64,
    #[serde(rename = "type")]
    pub route_type: DepositRouteType,
}

/// Response from the routing service
#[derive(Debug, Deserialize)]
pub struct RoutingResponse {
    pub action: RoutingAction,
    #[serde(default)]
    pub purpose: Option<PayInPurpose>,
    #[serde(default)]
    pub route: Option<RouteInfo>,
    #[serde(default)]
    pub aml_check: Option<AmlCheck>,
    /// Sender address funds go back to (return action only)
    #[serde(default)]
    pub return_address: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
struct RoutingRequest<'a> {
    in_tx_id: &'a str,
    address: &'a str,
    blockchain: &'a str,
    asset: Option<&'a str>,
    amount: Decimal,
}

/// Classifier backed by the routing service
#[derive(Debug, Clone)]
pub struct HttpRouteClassifier {
    http_client: Client,
    api_key: Option<SecretString>,
    base_url: String,
}

impl HttpRouteClassifier {
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
                .unwrap_or_else(|| DEFAULT_ROUTING_API_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
        })
    }

    async fn fetch_routing(&self, pay_in: &PayIn) -> Result<RoutingResponse, AppError> {
        let url = format!("{}/routes/classify", self.base_url);
        let request = RoutingRequest {
            in_tx_id: &pay_in.in_tx_id,
            address: &pay_in.address.address,
            blockchain: pay_in.address.blockchain.as_str(),
            asset: pay_in.asset.as_ref().map(|a| a.dex_name.as_str()),
            amount: pay_in.amount,
        };

        debug!(url = %url, pay_in_id = %pay_in.id, "Calling routing service");

        let mut builder = self.http_client.post(&url).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", key.expose_secret()));
        }

        let response = builder.send().await.map_err(|e| {
            error!(error = %e, "Routing service request failed");
            AppError::ExternalService(ExternalServiceError::Network(e.to_string()))
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "Routing service returned error");
            return Err(AppError::ExternalService(ExternalServiceError::ApiError {
                status_code: status.as_u16(),
                message: body,
            }));
        }

        response.json().await.map_err(|e| {
            error!(error = %e, "Failed to parse routing service response");
            AppError::ExternalService(ExternalServiceError::ParseError(e.to_string()))
        })
    }

    /// Map a routing answer onto a decision for `pay_in`
    fn evaluate(
        &self,
        pay_in: &PayIn,
        response: RoutingResponse,
    ) -> Result<PayInDecision, AppError> {
        let incomplete = |field: &str| {
            AppError::ExternalService(ExternalServiceError::ParseError(format!(
                "Routing response for {:?} is missing '{}'",
                response.action, field
            )))
        };
        let route = response.route.clone().map(|r| DepositRoute {
            id: r.id,
            route_type: r.route_type,
            deposit: pay_in.address.clone(),
        });

        let decision = match response.action {
            RoutingAction::Acknowledge => PayInDecision::Acknowledge {
                purpose: response.purpose.ok_or_else(|| incomplete("purpose"))?,
                route: route.ok_or_else(|| incomplete("route"))?,
                aml_check: response.aml_check.unwrap_or(AmlCheck::Pending),
            },
            RoutingAction::Return => PayInDecision::Return {
                purpose: response.purpose.ok_or_else(|| incomplete("purpose"))?,
                return_address: BlockchainAddress::new(
                    response
                        .return_address
                        .clone()
                        .ok_or_else(|| incomplete("return_address"))?,
                    pay_in.address.blockchain,
                ),
                route: route.ok_or_else(|| incomplete("route"))?,
                aml_check: response.aml_check.unwrap_or(AmlCheck::Fail),
            },
            RoutingAction::Ignore => PayInDecision::Ignore {
                purpose: response.purpose.ok_or_else(|| incomplete("purpose"))?,
                route: route.ok_or_else(|| incomplete("route"))?,
            },
            RoutingAction::Fail => PayInDecision::Fail {
                purpose: response.purpose,
                reason: response
                    .reason
                    .clone()
                    .unwrap_or_else(|| "Rejected by routing".to_string()),
            },
            RoutingAction::Defer => PayInDecision::Defer,
            RoutingAction::Unknown => {
                warn!(pay_in_id = %pay_in.id, "Unknown routing action, deferring");
                PayInDecision::Defer
            }
        };
        Ok(decision)
    }
}

#[async_trait]
impl PayInClassifier for HttpRouteClassifier {
    #[instrument(skip(self, pay_in), fields(pay_in_id = %pay_in.id, address = %pay_in.address))]
    async fn classify(&self, pay_in: &PayIn) -> Result<PayInDecision, AppError> {
        let response = self.fetch_routing(pay_in).await?;
        info!(action = ?response.action, "Routing decision received");
        self.evaluate(pay_in, response)
    }
}
