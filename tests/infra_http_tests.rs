//! HTTP-based integration tests for the price service, routing service and
//! chain gateway clients.
//!
//! Uses `wiremock` to stand in for the remote services.

use std::time::Duration;

use rust_decimal::Decimal;
use secrecy::SecretString;
use serde_json::json;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{body_partial_json, header, method, path, query_param},
};

use payin_relay::domain::{
    AppError, Asset, Blockchain, BlockchainError, ChainClient, DexClient, ExternalServiceError,
    Fiat, TradeCurrency,
};
use payin_relay::infra::{GatewayConfig, HttpChainGateway, HttpDexGateway, HttpPriceProvider};

fn eth() -> TradeCurrency {
    TradeCurrency::from(Asset::coin(1, "ETH", Blockchain::Ethereum))
}

fn eur() -> TradeCurrency {
    TradeCurrency::from(Fiat::new(1, "EUR"))
}

// ============================================================================
// PRICE SERVICE TESTS
// ============================================================================

mod price_service_tests {
    use super::*;
    use payin_relay::domain::PriceProvider;

    fn provider(server: &MockServer, key: Option<&str>) -> HttpPriceProvider {
        HttpPriceProvider::new(
            key.map(|k| SecretString::from(k.to_string())),
            Some(server.uri()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_price_valid_response() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/price"))
            .and(query_param("from", "ETH"))
            .and(query_param("to", "EUR"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "source": "ETH",
                "target": "EUR",
                "price": "2000.5"
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let price = provider(&mock_server, None)
            .get_price(&eth(), &eur())
            .await
            .unwrap();
        assert_eq!(price.source, "ETH");
        assert_eq!(price.target, "EUR");
        assert_eq!(price.rate, Decimal::new(20005, 1));
    }

    #[tokio::test]
    async fn test_price_sends_bearer_token() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/price"))
            .and(header("Authorization", "Bearer price-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "source": "ETH",
                "target": "EUR",
                "price": "1"
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        assert!(
            provider(&mock_server, Some("price-key"))
                .get_price(&eth(), &eur())
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_price_api_error_500() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500).set_body_string("Internal Server Error"))
            .mount(&mock_server)
            .await;

        let err = provider(&mock_server, None)
            .get_price(&eth(), &eur())
            .await
            .unwrap_err();
        match err {
            AppError::ExternalService(ExternalServiceError::ApiError {
                status_code,
                message,
            }) => {
                assert_eq!(status_code, 500);
                assert_eq!(message, "Internal Server Error");
            }
            other => panic!("Expected ApiError, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_price_invalid_json() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not valid json"))
            .mount(&mock_server)
            .await;

        let err = provider(&mock_server, None)
            .get_price(&eth(), &eur())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::ExternalService(ExternalServiceError::ParseError(_))
        ));
    }

    #[tokio::test]
    async fn test_price_missing_quote_is_unavailable() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "source": "ETH",
                "target": "EUR",
                "price": null
            })))
            .mount(&mock_server)
            .await;

        let err = provider(&mock_server, None)
            .get_price(&eth(), &eur())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::ExternalService(ExternalServiceError::PriceUnavailable(_))
        ));
        assert!(err.is_transient());
    }
}

// ============================================================================
// CHAIN GATEWAY TESTS
// ============================================================================

mod chain_gateway_tests {
    use super::*;

    fn fast_config() -> GatewayConfig {
        GatewayConfig {
            timeout: Duration::from_secs(5),
            max_retries: 2,
            retry_delay: Duration::from_millis(10),
        }
    }

    fn gateway(server: &MockServer) -> HttpChainGateway {
        HttpChainGateway::new(Blockchain::Ethereum, &server.uri(), fast_config()).unwrap()
    }

    fn usdt() -> Asset {
        Asset::token(2, "USDT", Blockchain::Ethereum, "0xdac17f")
    }

    #[tokio::test]
    async fn test_send_native_posts_transfer() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/Ethereum/transactions/native"))
            .and(body_partial_json(json!({
                "from": "0xdeposit",
                "to": "0xforward",
                "amount": "0.9997"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"tx_id": "0xout"})))
            .expect(1)
            .mount(&mock_server)
            .await;

        let tx_id = gateway(&mock_server)
            .send_native("0xdeposit", "0xforward", Decimal::new(9997, 4))
            .await
            .unwrap();
        assert_eq!(tx_id, "0xout");
    }

    #[tokio::test]
    async fn test_send_token_includes_contract() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/Ethereum/transactions/token"))
            .and(body_partial_json(json!({"contract": "0xdac17f"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"tx_id": "0xtoken"})))
            .expect(1)
            .mount(&mock_server)
            .await;

        let tx_id = gateway(&mock_server)
            .send_token("0xdeposit", "0xforward", &usdt(), Decimal::from(100))
            .await
            .unwrap();
        assert_eq!(tx_id, "0xtoken");
    }

    #[tokio::test]
    async fn test_broadcast_is_not_retried() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("Unavailable"))
            .expect(1)
            .mount(&mock_server)
            .await;

        let err = gateway(&mock_server)
            .send_native("0xa", "0xb", Decimal::ONE)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::Blockchain(BlockchainError::Connection(_))
        ));
    }

    #[tokio::test]
    async fn test_reads_are_retried_on_server_errors() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/Ethereum/transactions/0xslow"))
            .respond_with(ResponseTemplate::new(502))
            .expect(3)
            .mount(&mock_server)
            .await;

        let err = gateway(&mock_server)
            .is_tx_complete("0xslow")
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/Ethereum/transactions/0xbad"))
            .respond_with(ResponseTemplate::new(404).set_body_string("unknown tx"))
            .expect(1)
            .mount(&mock_server)
            .await;

        let err = gateway(&mock_server)
            .is_tx_complete("0xbad")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::Blockchain(BlockchainError::TransactionFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_tx_status() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/Ethereum/transactions/0xdone"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"complete": true})))
            .mount(&mock_server)
            .await;

        assert!(gateway(&mock_server).is_tx_complete("0xdone").await.unwrap());
    }

    #[tokio::test]
    async fn test_fee_estimate() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/Ethereum/fees/native"))
            .and(query_param("asset_type", "Token"))
            .and(query_param("contract", "0xdac17f"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"fee": "0.0003"})))
            .mount(&mock_server)
            .await;

        let fee = gateway(&mock_server)
            .estimate_native_fee(&usdt())
            .await
            .unwrap();
        assert_eq!(fee, Some(Decimal::new(3, 4)));
    }

    #[tokio::test]
    async fn test_fee_estimate_unavailable() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/Ethereum/fees/native"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"fee": null})))
            .mount(&mock_server)
            .await;

        let fee = gateway(&mock_server)
            .estimate_native_fee(&Asset::coin(1, "ETH", Blockchain::Ethereum))
            .await
            .unwrap();
        assert_eq!(fee, None);
    }

    #[tokio::test]
    async fn test_balance() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/Ethereum/addresses/0xdeposit/balance"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"balance": "1.25"})))
            .mount(&mock_server)
            .await;

        let balance = gateway(&mock_server)
            .get_native_balance("0xdeposit")
            .await
            .unwrap();
        assert_eq!(balance, Decimal::new(125, 2));
    }

    #[tokio::test]
    async fn test_dex_sell() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/BinanceSmartChain/dex/sell"))
            .and(body_partial_json(json!({"asset": "BNB", "amount": "2"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"tx_id": "0xswap"})))
            .expect(1)
            .mount(&mock_server)
            .await;

        let dex =
            HttpDexGateway::new(Blockchain::BinanceSmartChain, &mock_server.uri(), fast_config())
                .unwrap();
        let tx_id = dex
            .sell_liquidity(
                &Asset::coin(7, "BNB", Blockchain::BinanceSmartChain),
                Decimal::from(2),
            )
            .await
            .unwrap();
        assert_eq!(tx_id, "0xswap");
    }
}

// ============================================================================
// ROUTING SERVICE TESTS
// ============================================================================

mod routing_service_tests {
    use super::*;
    use payin_relay::domain::{
        BlockchainAddress, DetectedTransfer, PayIn, PayInClassifier, PayInDecision,
        PayInPurpose,
    };
    use payin_relay::infra::HttpRouteClassifier;

    fn pay_in() -> PayIn {
        PayIn::create(
            DetectedTransfer {
                address: BlockchainAddress::new("0xdeposit", Blockchain::Ethereum),
                tx_id: "0xin".to_string(),
                tx_type: None,
                tx_sequence: None,
                block_height: Some(1),
                amount: Decimal::ONE,
                asset: Some(Asset::coin(1, "ETH", Blockchain::Ethereum)),
            },
            Some(Decimal::ONE),
            Some(Decimal::ONE),
        )
    }

    #[tokio::test]
    async fn test_classify_return() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/routes/classify"))
            .and(body_partial_json(json!({"address": "0xdeposit", "asset": "ETH"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "action": "return",
                "purpose": "BuyFiat",
                "route": {"id": 3, "type": "Sell"},
                "return_address": "0xsender"
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let classifier = HttpRouteClassifier::new(None, Some(mock_server.uri())).unwrap();
        match classifier.classify(&pay_in()).await.unwrap() {
            PayInDecision::Return {
                purpose,
                return_address,
                route,
                ..
            } => {
                assert_eq!(purpose, PayInPurpose::BuyFiat);
                assert_eq!(return_address.address, "0xsender");
                assert_eq!(route.id, 3);
            }
            other => panic!("Expected return, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_classify_outage_is_transient() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&mock_server)
            .await;

        let classifier = HttpRouteClassifier::new(None, Some(mock_server.uri())).unwrap();
        let err = classifier.classify(&pay_in()).await.unwrap_err();
        assert!(err.is_transient());
    }
}
