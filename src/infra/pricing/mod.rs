//! Price provider implementations.

pub mod http;

pub use http::{DEFAULT_PRICE_API_URL, HttpPriceProvider};
