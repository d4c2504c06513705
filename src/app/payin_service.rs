//! Pay-in processing: registration of detected transfers and the periodic sweep.

use std::env;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};
use validator::Validate;

use super::dispatch::{SendGroup, SendStrategy, Strategies};
use super::fee_gate::FeeGate;
use super::lock::GroupLocks;
use super::specs::{ReferenceCurrencies, TransactionHelper};
use crate::domain::{
    AppError, Asset, DatabaseError, DetectedTransfer, PayIn, PayInClassifier, PayInDecision,
    PayInRepository, PayInSendType, PayInStatus, PriceProvider, TradeCurrency, TxSpec,
    ValidationError,
};

/// Statuses handled by the send stage
const SENDABLE_STATUSES: [PayInStatus; 4] = [
    PayInStatus::Acknowledged,
    PayInStatus::ToReturn,
    PayInStatus::Preparing,
    PayInStatus::Prepared,
];

/// Attempts at storing the result of a broadcast
const BROADCAST_SAVE_ATTEMPTS: u32 = 3;
const BROADCAST_SAVE_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Pay-in policy configuration
#[derive(Debug, Clone)]
pub struct PayInConfig {
    /// Maximum network fee as a fraction of the amount moved
    pub forward_fee_limit: Decimal,
    /// Multiplier on the estimated fee for token top-ups
    pub token_top_up_factor: Decimal,
    /// Native amount sent ahead of a UTXO token payout
    pub utxo_top_up_amount: Decimal,
}

impl Default for PayInConfig {
    fn default() -> Self {
        Self {
            forward_fee_limit: Decimal::new(5, 2),
            token_top_up_factor: Decimal::new(15, 1),
            utxo_top_up_amount: Decimal::new(1, 2),
        }
    }
}

impl PayInConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let decimal = |key: &str, default: Decimal| {
            env::var(key)
                .ok()
                .and_then(|v| Decimal::from_str(&v).ok())
                .unwrap_or(default)
        };

        Self {
            forward_fee_limit: decimal("PAYIN_FORWARD_FEE_LIMIT", defaults.forward_fee_limit),
            token_top_up_factor: decimal("PAYIN_TOKEN_TOP_UP_FACTOR", defaults.token_top_up_factor),
            utxo_top_up_amount: decimal("PAYIN_UTXO_TOP_UP_AMOUNT", defaults.utxo_top_up_amount),
        }
    }
}

/// What one sweep did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Another sweep was running, nothing was done
    pub skipped: bool,
    pub references_resolved: usize,
    pub classified: usize,
    pub confirmed: usize,
    pub groups_prepared: usize,
    pub groups_marked_prepared: usize,
    pub groups_sent: usize,
    /// Groups left in place for the next sweep (policy rejection, transient error, busy lock)
    pub groups_deferred: usize,
    /// Records whose last broadcast has no stored outcome, left for reconciliation
    pub broadcasts_held: usize,
    pub completed: usize,
}

/// What an operator found on chain for a held broadcast
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BroadcastResolution {
    /// Nothing went out; the record is processed again by the next sweep
    NotBroadcast,
    /// The transaction is on chain under this id
    Broadcast { tx_id: String },
}

/// What happened to one send group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GroupOutcome {
    Prepared,
    MarkedPrepared,
    Sent,
    Waiting,
}

/// Owns every pay-in state change
pub struct PayInService {
    repository: Arc<dyn PayInRepository>,
    price_provider: Arc<dyn PriceProvider>,
    classifier: Arc<dyn PayInClassifier>,
    strategies: Arc<Strategies>,
    transaction_helper: Arc<TransactionHelper>,
    references: ReferenceCurrencies,
    fee_gate: FeeGate,
    group_locks: GroupLocks,
    sweep_lock: Mutex<()>,
}

impl PayInService {
    #[must_use]
    pub fn new(
        repository: Arc<dyn PayInRepository>,
        price_provider: Arc<dyn PriceProvider>,
        classifier: Arc<dyn PayInClassifier>,
        strategies: Arc<Strategies>,
        transaction_helper: Arc<TransactionHelper>,
        references: ReferenceCurrencies,
        config: &PayInConfig,
    ) -> Self {
        Self {
            repository,
            price_provider,
            classifier,
            strategies,
            transaction_helper,
            references,
            fee_gate: FeeGate::new(config.forward_fee_limit),
            group_locks: GroupLocks::new(),
            sweep_lock: Mutex::new(()),
        }
    }

    pub fn strategies(&self) -> &Arc<Strategies> {
        &self.strategies
    }

    pub fn transaction_helper(&self) -> &Arc<TransactionHelper> {
        &self.transaction_helper
    }

    /// Minimums for a `from` to `to` trade, in `from` units
    pub async fn get_specs(
        &self,
        from: &TradeCurrency,
        to: &TradeCurrency,
    ) -> Result<TxSpec, AppError> {
        self.transaction_helper.get_specs(from, to).await
    }

    /// Inbound minimums for `asset`, in `asset` units
    pub async fn get_in_specs(&self, asset: &TradeCurrency) -> Result<TxSpec, AppError> {
        self.transaction_helper.get_in_specs(asset).await
    }

    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), AppError> {
        self.repository.health_check().await
    }

    /// Record a transfer seen by a chain scan. A transfer already on record
    /// resolves to the existing pay-in.
    #[instrument(skip(self, transfer), fields(tx_id = %transfer.tx_id, address = %transfer.address))]
    pub async fn register_detected_transfer(
        &self,
        transfer: DetectedTransfer,
    ) -> Result<PayIn, AppError> {
        transfer.validate().map_err(|e| {
            warn!(error = %e, "Detected transfer failed validation");
            AppError::Validation(ValidationError::Multiple(e.to_string()))
        })?;

        let (btc_amount, usdt_amount) = self
            .reference_amounts(transfer.asset.as_ref(), transfer.amount)
            .await;
        let pay_in = PayIn::create(transfer, btc_amount, usdt_amount);

        if let Some(existing) = self.repository.find_by_identity(&pay_in.identity()).await? {
            debug!(pay_in_id = %existing.id, "Transfer already registered");
            return Ok(existing);
        }

        let stored = self.repository.create_pay_in(&pay_in).await?;
        info!(pay_in_id = %stored.id, status = %stored.status, "Pay-in registered");
        Ok(stored)
    }

    /// Run one processing pass over all non-terminal pay-ins.
    ///
    /// Returns immediately with `skipped` set when a pass is already running.
    #[instrument(skip(self))]
    pub async fn process_pay_ins(&self) -> Result<SweepReport, AppError> {
        let Ok(_guard) = self.sweep_lock.try_lock() else {
            debug!("Pay-in sweep already running, skipping");
            return Ok(SweepReport {
                skipped: true,
                ..SweepReport::default()
            });
        };

        let mut report = SweepReport {
            references_resolved: self.retry_price_references().await?,
            classified: self.classify_created().await?,
            confirmed: self.confirm_inbound().await?,
            ..SweepReport::default()
        };
        self.process_send_groups(&mut report).await?;
        report.completed = self.complete_forwarded().await?;

        self.group_locks.prune();

        info!(
            references = report.references_resolved,
            classified = report.classified,
            confirmed = report.confirmed,
            prepared = report.groups_prepared,
            sent = report.groups_sent,
            deferred = report.groups_deferred,
            held = report.broadcasts_held,
            completed = report.completed,
            "Pay-in sweep finished"
        );
        Ok(report)
    }

    /// Settle a held broadcast after checking the chain by hand.
    ///
    /// Takes the group lock, so it never races a sweep working on the same group.
    #[instrument(skip(self))]
    pub async fn resolve_broadcast(
        &self,
        pay_in_id: &str,
        resolution: BroadcastResolution,
    ) -> Result<PayIn, AppError> {
        let pay_in = self.load(pay_in_id).await?;
        let key = SendGroup::key_of(&pay_in).ok_or_else(|| {
            AppError::Validation(ValidationError::InvalidField {
                field: "send_type".to_string(),
                message: format!("Pay-in {} is not part of a send group", pay_in_id),
            })
        })?;
        let _guard = self.group_locks.acquire(&key).await;

        let mut pay_in = self.load(pay_in_id).await?;
        if !pay_in.has_pending_broadcast() {
            return Err(AppError::Validation(ValidationError::InvalidField {
                field: "broadcast_started_at".to_string(),
                message: format!("Pay-in {} has no broadcast in flight", pay_in_id),
            }));
        }

        match resolution {
            BroadcastResolution::NotBroadcast => pay_in.abort_broadcast(),
            BroadcastResolution::Broadcast { tx_id } => match (pay_in.status, pay_in.send_type) {
                (PayInStatus::Acknowledged | PayInStatus::ToReturn, _) => {
                    let fee = pay_in.forward_fee_amount.unwrap_or_default();
                    pay_in.preparing(Some(tx_id), fee)?;
                }
                (PayInStatus::Prepared, Some(PayInSendType::Forward)) => {
                    pay_in.forward(tx_id, None)?;
                }
                (PayInStatus::Prepared, Some(PayInSendType::Return)) => {
                    pay_in.returned(tx_id)?;
                }
                (status, _) => {
                    return Err(AppError::NotSupported(format!(
                        "Resolving a broadcast in status {}",
                        status
                    )));
                }
            },
        }

        self.repository.save_pay_in(&pay_in).await?;
        info!(pay_in_id = %pay_in.id, status = %pay_in.status, "Held broadcast resolved");
        Ok(pay_in)
    }

    // --- SWEEP STAGES --- //

    async fn retry_price_references(&self) -> Result<usize, AppError> {
        let waiting = self
            .repository
            .find_by_status(&[PayInStatus::WaitingForPriceReference])
            .await?;
        let mut resolved = 0;

        for mut pay_in in waiting {
            let (btc_amount, usdt_amount) = self
                .reference_amounts(pay_in.asset.as_ref(), pay_in.amount)
                .await;
            pay_in.add_reference_amounts(btc_amount, usdt_amount)?;

            if pay_in.status == PayInStatus::Created {
                self.repository.save_pay_in(&pay_in).await?;
                info!(pay_in_id = %pay_in.id, "Price reference resolved");
                resolved += 1;
            }
        }

        Ok(resolved)
    }

    async fn classify_created(&self) -> Result<usize, AppError> {
        let created = self
            .repository
            .find_by_status(&[PayInStatus::Created])
            .await?;
        let mut classified = 0;

        for mut pay_in in created {
            match self.classify(&mut pay_in).await {
                Ok(true) => {
                    self.repository.save_pay_in(&pay_in).await?;
                    info!(pay_in_id = %pay_in.id, status = %pay_in.status, "Pay-in classified");
                    classified += 1;
                }
                Ok(false) => {}
                Err(e) if e.is_transient() => {
                    warn!(pay_in_id = %pay_in.id, error = %e, "Classification deferred");
                }
                Err(e) => {
                    error!(pay_in_id = %pay_in.id, error = %e, "Classification failed");
                    pay_in.fail(pay_in.purpose, &e.to_string())?;
                    self.repository.save_pay_in(&pay_in).await?;
                    classified += 1;
                }
            }
        }

        Ok(classified)
    }

    /// Apply the classifier's decision. Returns whether the record changed.
    async fn classify(&self, pay_in: &mut PayIn) -> Result<bool, AppError> {
        let decision = self.classifier.classify(pay_in).await?;

        match decision {
            PayInDecision::Defer => Ok(false),
            PayInDecision::Fail { purpose, reason } => {
                pay_in.fail(purpose, &reason)?;
                Ok(true)
            }
            PayInDecision::Ignore { purpose, route } => {
                pay_in.ignore(purpose, route)?;
                Ok(true)
            }
            PayInDecision::Return {
                purpose,
                return_address,
                route,
                aml_check,
            } => {
                self.send_strategy_for(pay_in)?;
                pay_in.trigger_return(purpose, return_address, route, aml_check)?;
                Ok(true)
            }
            PayInDecision::Acknowledge {
                purpose,
                route,
                aml_check,
            } => {
                let strategy = self.send_strategy_for(pay_in)?;
                let asset = self.asset_of(pay_in)?;
                let currency = TradeCurrency::Asset(asset.clone());

                if !self
                    .transaction_helper
                    .is_valid_input(&currency, pay_in.amount)
                    .await?
                {
                    info!(pay_in_id = %pay_in.id, amount = %pay_in.amount, "Pay-in below minimum volume, ignoring");
                    pay_in.ignore(purpose, route)?;
                    return Ok(true);
                }

                pay_in.acknowledge(purpose, route, aml_check)?;
                pay_in.designate_forward(strategy.forward_address().clone())?;
                Ok(true)
            }
        }
    }

    async fn confirm_inbound(&self) -> Result<usize, AppError> {
        let unconfirmed = self.repository.find_unconfirmed().await?;
        let mut confirmed = 0;

        for mut pay_in in unconfirmed {
            let Ok(strategy) = self.send_strategy_for(&pay_in) else {
                continue;
            };
            match strategy.is_confirmed(&pay_in).await {
                Ok(true) => {
                    pay_in.confirm();
                    self.repository.save_pay_in(&pay_in).await?;
                    confirmed += 1;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(pay_in_id = %pay_in.id, error = %e, "Confirmation check failed");
                }
            }
        }

        Ok(confirmed)
    }

    async fn process_send_groups(&self, report: &mut SweepReport) -> Result<(), AppError> {
        let pay_ins = self.repository.find_by_status(&SENDABLE_STATUSES).await?;
        let (in_flight, ready): (Vec<PayIn>, Vec<PayIn>) =
            pay_ins.into_iter().partition(PayIn::has_pending_broadcast);

        for pay_in in &in_flight {
            error!(
                pay_in_id = %pay_in.id,
                status = %pay_in.status,
                started_at = ?pay_in.broadcast_started_at,
                "Broadcast outcome unknown, holding until reconciled"
            );
        }
        report.broadcasts_held = in_flight.len();

        for group in SendGroup::group(ready) {
            let key = group.key();
            let Some(_guard) = self.group_locks.try_acquire(&key) else {
                debug!(group = %key, "Send group busy, skipping");
                report.groups_deferred += 1;
                continue;
            };

            match self.process_group(group).await {
                Ok(GroupOutcome::Prepared) => report.groups_prepared += 1,
                Ok(GroupOutcome::MarkedPrepared) => report.groups_marked_prepared += 1,
                Ok(GroupOutcome::Sent) => report.groups_sent += 1,
                Ok(GroupOutcome::Waiting) => {}
                Err(e @ (AppError::FeeLimitExceeded { .. } | AppError::FeeCheck(_))) => {
                    warn!(group = %key, error = %e, "Send rejected by fee policy");
                    report.groups_deferred += 1;
                }
                Err(e) => {
                    error!(group = %key, error = %e, "Send group processing failed");
                    report.groups_deferred += 1;
                }
            }
        }

        Ok(())
    }

    /// Advance one group a single step
    #[instrument(skip(self, group), fields(group = %group.key(), status = %group.status, members = group.pay_ins.len()))]
    async fn process_group(&self, mut group: SendGroup) -> Result<GroupOutcome, AppError> {
        let strategy = self.strategies.select_send_strategy(&group.asset)?;

        match group.status {
            PayInStatus::Acknowledged | PayInStatus::ToReturn => {
                let native_fee = self.verify_group_fee(strategy.as_ref(), &group).await?;
                if !strategy.broadcasts_on_prepare() {
                    strategy.prepare_send(&mut group, native_fee).await?;
                    self.repository.save_pay_ins(&group.pay_ins).await?;
                    return Ok(GroupOutcome::Prepared);
                }

                let fee_share = group.fee_share(native_fee);
                self.begin_broadcast(&mut group, Some(fee_share)).await?;
                let prepared = strategy.prepare_send(&mut group, native_fee).await;
                if let Err(e) = prepared {
                    return Err(self.broadcast_failed(&mut group, e).await);
                }
                let tx_ids = group.prepare_tx_ids().join(",");
                self.store_broadcast(&group, &tx_ids).await?;
                Ok(GroupOutcome::Prepared)
            }
            PayInStatus::Preparing => {
                if !strategy.check_preparation(&group).await? {
                    return Ok(GroupOutcome::Waiting);
                }
                for pay_in in &mut group.pay_ins {
                    pay_in.prepared()?;
                }
                self.repository.save_pay_ins(&group.pay_ins).await?;
                Ok(GroupOutcome::MarkedPrepared)
            }
            PayInStatus::Prepared => {
                if let Some(tx_id) = group.recorded_send_tx() {
                    warn!(tx_id = %tx_id, "Send already recorded on a member, not resubmitting");
                    Self::apply_send(&mut group, &tx_id)?;
                    self.repository.save_pay_ins(&group.pay_ins).await?;
                    return Ok(GroupOutcome::Sent);
                }

                self.begin_broadcast(&mut group, None).await?;
                let dispatched = strategy
                    .dispatch_send(&group, group.total_forward_fee())
                    .await;
                let tx_id = match dispatched {
                    Ok(tx_id) => tx_id,
                    Err(e) => return Err(self.broadcast_failed(&mut group, e).await),
                };

                Self::apply_send(&mut group, &tx_id)?;
                self.store_broadcast(&group, &tx_id).await?;
                info!(tx_id = %tx_id, send_type = group.send_type.as_str(), "Send group dispatched");
                Ok(GroupOutcome::Sent)
            }
            other => Err(AppError::NotSupported(format!(
                "Send group in status {}",
                other
            ))),
        }
    }

    fn apply_send(group: &mut SendGroup, tx_id: &str) -> Result<(), AppError> {
        for pay_in in &mut group.pay_ins {
            match group.send_type {
                PayInSendType::Forward => pay_in.forward(tx_id.to_string(), None)?,
                PayInSendType::Return => pay_in.returned(tx_id.to_string())?,
            }
        }
        Ok(())
    }

    /// Persist the in-flight marker on every member before anything goes out
    async fn begin_broadcast(
        &self,
        group: &mut SendGroup,
        fee_share: Option<Decimal>,
    ) -> Result<(), AppError> {
        for pay_in in &mut group.pay_ins {
            pay_in.begin_broadcast(fee_share)?;
        }
        if let Err(e) = self.repository.save_pay_ins(&group.pay_ins).await {
            // nothing was sent, undo whatever part of the marker got stored
            self.clear_broadcast(group).await;
            return Err(e);
        }
        Ok(())
    }

    async fn clear_broadcast(&self, group: &mut SendGroup) {
        for pay_in in &mut group.pay_ins {
            pay_in.abort_broadcast();
        }
        if let Err(e) = self.repository.save_pay_ins(&group.pay_ins).await {
            error!(group = %group.key(), error = %e, "Failed to clear broadcast marker");
        }
    }

    /// A failed broadcast keeps its marker unless the chain surely rejected it
    async fn broadcast_failed(&self, group: &mut SendGroup, e: AppError) -> AppError {
        if e.broadcast_outcome_unknown() {
            error!(group = %group.key(), error = %e, "Broadcast outcome unknown, holding group");
        } else {
            self.clear_broadcast(group).await;
        }
        e
    }

    /// Store the members after a broadcast went out, retrying on failure
    async fn store_broadcast(&self, group: &SendGroup, tx_id: &str) -> Result<(), AppError> {
        let mut attempt = 1;
        loop {
            match self.repository.save_pay_ins(&group.pay_ins).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < BROADCAST_SAVE_ATTEMPTS => {
                    warn!(tx_id = %tx_id, attempt, error = %e, "Storing broadcast failed, retrying");
                    tokio::time::sleep(BROADCAST_SAVE_RETRY_DELAY * attempt).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(tx_id = %tx_id, error = %e, "Broadcast not stored, members held until reconciled");
                    return Err(e);
                }
            }
        }
    }

    /// Fee safety check, once per group. Returns the native fee to prepare with.
    async fn verify_group_fee(
        &self,
        strategy: &dyn SendStrategy,
        group: &SendGroup,
    ) -> Result<Decimal, AppError> {
        let native_fee = strategy.estimate_native_fee(&group.asset).await?;
        let fee_in_asset = match native_fee {
            Some(fee) => Some(strategy.fee_in_asset(&group.asset, fee).await?),
            None => None,
        };
        let min_input_fee = self
            .transaction_helper
            .get_in_specs(&TradeCurrency::Asset(group.asset.clone()))
            .await?
            .min_fee;

        self.fee_gate
            .verify(fee_in_asset, min_input_fee, group.total_amount())?;

        native_fee.ok_or_else(|| AppError::FeeCheck("No fee estimation provided".to_string()))
    }

    async fn complete_forwarded(&self) -> Result<usize, AppError> {
        let forwarded = self
            .repository
            .find_by_status(&[PayInStatus::Forwarded])
            .await?;
        let mut completed = 0;

        for mut pay_in in forwarded {
            let Ok(strategy) = self.send_strategy_for(&pay_in) else {
                continue;
            };
            match strategy.check_completion(&pay_in).await {
                Ok(true) => {
                    pay_in.completed()?;
                    self.repository.save_pay_in(&pay_in).await?;
                    info!(pay_in_id = %pay_in.id, "Pay-in completed");
                    completed += 1;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(pay_in_id = %pay_in.id, error = %e, "Completion check failed");
                }
            }
        }

        Ok(completed)
    }

    // --- HELPERS --- //

    async fn load(&self, id: &str) -> Result<PayIn, AppError> {
        self.repository
            .get_pay_in(id)
            .await?
            .ok_or_else(|| AppError::Database(DatabaseError::NotFound(id.to_string())))
    }

    fn asset_of<'a>(&self, pay_in: &'a PayIn) -> Result<&'a Asset, AppError> {
        pay_in.asset.as_ref().ok_or_else(|| {
            AppError::Validation(ValidationError::InvalidField {
                field: "asset".to_string(),
                message: format!("Pay-in {} has no asset", pay_in.id),
            })
        })
    }

    fn send_strategy_for(&self, pay_in: &PayIn) -> Result<Arc<dyn SendStrategy>, AppError> {
        let asset = self.asset_of(pay_in)?;
        self.strategies.select_send_strategy(asset)
    }

    /// Base-asset and stable-coin value of `amount`. A failed lookup leaves the leg empty.
    async fn reference_amounts(
        &self,
        asset: Option<&Asset>,
        amount: Decimal,
    ) -> (Option<Decimal>, Option<Decimal>) {
        let Some(asset) = asset else {
            return (None, None);
        };
        let from = TradeCurrency::Asset(asset.clone());

        let btc = self.reference_amount(&from, &self.references.btc, amount).await;
        let usdt = self.reference_amount(&from, &self.references.usdt, amount).await;
        (btc, usdt)
    }

    async fn reference_amount(
        &self,
        from: &TradeCurrency,
        to: &TradeCurrency,
        amount: Decimal,
    ) -> Option<Decimal> {
        match self.price_provider.get_price(from, to).await {
            Ok(price) => Some(price.convert(amount)),
            Err(e) => {
                warn!(from = %from.name(), to = %to.name(), error = %e, "Reference price unavailable");
                None
            }
        }
    }
}
