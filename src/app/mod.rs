//! Application layer containing business logic and shared state.

pub mod dispatch;
pub mod fee_gate;
pub mod lock;
pub mod payin_service;
pub mod specs;
pub mod state;
pub mod worker;

pub use dispatch::{
    ChainClients, ChainWallets, SendGroup, Strategies, StrategyDependencies, StrategyTarget,
    WalletConfig,
};
pub use fee_gate::FeeGate;
pub use lock::GroupLocks;
pub use payin_service::{BroadcastResolution, PayInConfig, PayInService, SweepReport};
pub use specs::{
    ReferenceCurrencies, SpecificationDefaults, SpecificationResolver, TransactionHelper, convert,
};
pub use state::{AppDependencies, AppState};
pub use worker::{WorkerConfig, spawn_payin_worker, spawn_spec_refresh};
