//! Domain layer containing core business types, traits, and error definitions.

pub mod error;
pub mod payin;
pub mod traits;
pub mod types;

pub use error::{
    AppError, BlockchainError, ConfigError, DatabaseError, ExternalServiceError, ValidationError,
};
pub use payin::{
    DetectedTransfer, PayIn, PayInDecision, PayInIdentity, PayInPurpose, PayInSendType,
    PayInStatus,
};
pub use traits::{
    ChainClient, DexClient, PayInClassifier, PayInRepository, PriceProvider,
    SpecificationRepository,
};
pub use types::{
    AmlCheck, Asset, AssetType, Blockchain, BlockchainAddress, DepositRoute, DepositRouteType,
    FIAT_SYSTEM, Fiat, MinAmount, PayoutOrder, Price, TradeCurrency, TransactionDirection,
    TransactionSpecification, TxSpec,
};
