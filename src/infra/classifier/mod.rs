//! Pay-in classifier implementations.

pub mod routing;

pub use routing::{DEFAULT_ROUTING_API_URL, HttpRouteClassifier};
