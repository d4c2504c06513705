//! Chain node and liquidity venue clients.

pub mod gateway;

pub use gateway::{GatewayConfig, HttpChainGateway, HttpDexGateway};
