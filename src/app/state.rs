//! Application state management.

use std::sync::Arc;

use crate::domain::{
    AppError, PayInClassifier, PayInRepository, PriceProvider, SpecificationRepository,
};

use super::dispatch::{Strategies, StrategyDependencies};
use super::payin_service::{PayInConfig, PayInService};
use super::specs::{
    ReferenceCurrencies, SpecificationDefaults, SpecificationResolver, TransactionHelper,
};

/// External collaborators the application is wired from
pub struct AppDependencies {
    pub pay_in_repository: Arc<dyn PayInRepository>,
    pub specification_repository: Arc<dyn SpecificationRepository>,
    pub price_provider: Arc<dyn PriceProvider>,
    pub classifier: Arc<dyn PayInClassifier>,
    pub strategies: StrategyDependencies,
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub payin_service: Arc<PayInService>,
    pub spec_resolver: Arc<SpecificationResolver>,
    pub transaction_helper: Arc<TransactionHelper>,
    pub strategies: Arc<Strategies>,
    pub pay_in_repository: Arc<dyn PayInRepository>,
}

impl AppState {
    /// Build the strategy registries and services.
    ///
    /// Fails when a strategy alias has no implementation.
    pub fn new(
        deps: AppDependencies,
        references: ReferenceCurrencies,
        payin_config: &PayInConfig,
        spec_defaults: SpecificationDefaults,
    ) -> Result<Self, AppError> {
        let strategies = Arc::new(Strategies::build(&deps.strategies)?);
        let spec_resolver = Arc::new(SpecificationResolver::new(
            deps.specification_repository,
            spec_defaults,
        ));
        let transaction_helper = Arc::new(TransactionHelper::new(
            Arc::clone(&spec_resolver),
            Arc::clone(&deps.price_provider),
            references.fiat.clone(),
        ));
        let payin_service = Arc::new(PayInService::new(
            Arc::clone(&deps.pay_in_repository),
            deps.price_provider,
            deps.classifier,
            Arc::clone(&strategies),
            Arc::clone(&transaction_helper),
            references,
            payin_config,
        ));

        Ok(Self {
            payin_service,
            spec_resolver,
            transaction_helper,
            strategies,
            pay_in_repository: deps.pay_in_repository,
        })
    }
}
