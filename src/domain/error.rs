//! Application error taxonomy.

use rust_decimal::Decimal;
use thiserror::Error;

/// Top-level application error
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Blockchain error: {0}")]
    Blockchain(#[from] BlockchainError),

    #[error("External service error: {0}")]
    ExternalService(#[from] ExternalServiceError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Estimated network fee exceeds the forward fee policy
    #[error("Forward fee is too high ({fee}, {percent:.1}%)")]
    FeeLimitExceeded { fee: Decimal, percent: Decimal },

    /// Fee estimation missing or amount to move is zero
    #[error("Fee check failed: {0}")]
    FeeCheck(String),

    #[error("Pay-in {id}: cannot {action} from status {from}")]
    InvalidTransition {
        id: String,
        from: String,
        action: &'static str,
    },

    #[error("No {facade} found. Alias: {alias}")]
    StrategyNotFound { facade: &'static str, alias: String },

    #[error("Not supported: {0}")]
    NotSupported(String),
}

impl AppError {
    /// Errors that should leave a record untouched for the next sweep
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ExternalService(_)
                | Self::Blockchain(BlockchainError::Connection(_))
                | Self::Blockchain(BlockchainError::Timeout(_))
                | Self::Database(DatabaseError::Connection(_))
        )
    }

    /// A broadcast that failed this way may still have reached the chain
    #[must_use]
    pub fn broadcast_outcome_unknown(&self) -> bool {
        matches!(
            self,
            Self::Blockchain(
                BlockchainError::Connection(_)
                    | BlockchainError::Timeout(_)
                    | BlockchainError::InvalidResponse(_)
            )
        )
    }
}

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

#[derive(Debug, Error)]
pub enum BlockchainError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Transaction failed: {0}")]
    TransactionFailed(String),

    #[error("Fee estimation failed: {0}")]
    FeeEstimation(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    /// The node answered with a success status but an unreadable body
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Error)]
pub enum ExternalServiceError {
    #[error("Configuration: {0}")]
    Configuration(String),

    #[error("Network: {0}")]
    Network(String),

    #[error("API error ({status_code}): {message}")]
    ApiError { status_code: u16, message: String },

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Price unavailable: {0}")]
    PriceUnavailable(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnv(String),

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("{facade}: no strategy registered for alias {alias}")]
    MissingStrategy { facade: &'static str, alias: String },

    #[error("{facade}: alias {alias} registered more than once")]
    DuplicateStrategy { facade: &'static str, alias: String },
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("{0}")]
    Multiple(String),
}
