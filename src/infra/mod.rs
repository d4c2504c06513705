//! Infrastructure layer implementations.

pub mod blockchain;
pub mod classifier;
pub mod database;
pub mod pricing;

pub use blockchain::{GatewayConfig, HttpChainGateway, HttpDexGateway};
pub use classifier::HttpRouteClassifier;
pub use database::{PostgresClient, PostgresConfig};
pub use pricing::HttpPriceProvider;
