//! Test doubles for every domain trait.

pub mod mocks;

pub use mocks::{
    MockChainClient, MockChains, MockClassifier, MockConfig, MockDexClient, MockPayInRepository,
    MockPriceProvider, MockSpecificationRepository, SentTransfer, mock_wallets,
};
