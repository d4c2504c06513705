//! The pay-in entity: one detected inbound transfer and its lifecycle.
//!
//! Every mutation goes through a named transition. Each transition checks the
//! current status first and fails with [`AppError::InvalidTransition`] when it
//! is not legal, so terminal records can never be moved again.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use super::error::AppError;
use super::types::{AmlCheck, Asset, BlockchainAddress, DepositRoute};

/// Status of a pay-in
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum PayInStatus {
    Created,
    WaitingForPriceReference,
    Failed,
    Ignored,
    ToReturn,
    Returned,
    Acknowledged,
    Preparing,
    Prepared,
    Forwarded,
    Completed,
}

impl PayInStatus {
    pub const ALL: [PayInStatus; 11] = [
        Self::Created,
        Self::WaitingForPriceReference,
        Self::Failed,
        Self::Ignored,
        Self::ToReturn,
        Self::Returned,
        Self::Acknowledged,
        Self::Preparing,
        Self::Prepared,
        Self::Forwarded,
        Self::Completed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "Created",
            Self::WaitingForPriceReference => "WaitingForPriceReference",
            Self::Failed => "Failed",
            Self::Ignored => "Ignored",
            Self::ToReturn => "ToReturn",
            Self::Returned => "Returned",
            Self::Acknowledged => "Acknowledged",
            Self::Preparing => "Preparing",
            Self::Prepared => "Prepared",
            Self::Forwarded => "Forwarded",
            Self::Completed => "Completed",
        }
    }

    /// No transition leaves a terminal status
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Returned | Self::Failed | Self::Ignored
        )
    }
}

impl std::str::FromStr for PayInStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("Invalid pay-in status: {}", s))
    }
}

impl std::fmt::Display for PayInStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Business purpose assigned during classification
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PayInPurpose {
    Staking,
    BuyFiat,
    BuyCrypto,
}

impl PayInPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Staking => "Staking",
            Self::BuyFiat => "BuyFiat",
            Self::BuyCrypto => "BuyCrypto",
        }
    }
}

impl std::str::FromStr for PayInPurpose {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Staking" => Ok(Self::Staking),
            "BuyFiat" => Ok(Self::BuyFiat),
            "BuyCrypto" => Ok(Self::BuyCrypto),
            _ => Err(format!("Invalid pay-in purpose: {}", s)),
        }
    }
}

/// Whether funds move on to the operating wallet or back to the sender
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum PayInSendType {
    Forward,
    Return,
}

impl PayInSendType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Forward => "Forward",
            Self::Return => "Return",
        }
    }
}

impl std::str::FromStr for PayInSendType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Forward" => Ok(Self::Forward),
            "Return" => Ok(Self::Return),
            _ => Err(format!("Invalid send type: {}", s)),
        }
    }
}

/// A transfer observed by a chain scan, before it becomes a [`PayIn`]
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct DetectedTransfer {
    pub address: BlockchainAddress,
    #[validate(length(min = 1, message = "Inbound transaction id is required"))]
    pub tx_id: String,
    pub tx_type: Option<String>,
    pub tx_sequence: Option<i32>,
    pub block_height: Option<i64>,
    #[validate(custom(function = "validate_positive_amount"))]
    pub amount: Decimal,
    /// `None` when the scanner could not map the transfer to a known asset
    pub asset: Option<Asset>,
}

fn validate_positive_amount(amount: &Decimal) -> Result<(), validator::ValidationError> {
    if amount.is_sign_negative() {
        return Err(validator::ValidationError::new("negative_amount"));
    }
    Ok(())
}

/// Natural key of a pay-in: the same physical transfer maps to one record
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PayInIdentity {
    pub in_tx_id: String,
    pub asset_id: Option<i64>,
    pub address: String,
    pub blockchain: String,
}

/// Classification result for a created pay-in
#[derive(Debug, Clone, PartialEq)]
pub enum PayInDecision {
    Acknowledge {
        purpose: PayInPurpose,
        route: DepositRoute,
        aml_check: AmlCheck,
    },
    Return {
        purpose: PayInPurpose,
        return_address: BlockchainAddress,
        route: DepositRoute,
        aml_check: AmlCheck,
    },
    Ignore {
        purpose: PayInPurpose,
        route: DepositRoute,
    },
    Fail {
        purpose: Option<PayInPurpose>,
        reason: String,
    },
    /// Not decidable yet (e.g. route still being set up)
    Defer,
}

/// Inbound transfer record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PayIn {
    pub id: String,
    pub status: PayInStatus,
    pub in_tx_id: String,
    pub tx_type: Option<String>,
    pub tx_sequence: Option<i32>,
    pub block_height: Option<i64>,
    /// Deposit address the transfer arrived on
    pub address: BlockchainAddress,
    pub destination_address: Option<BlockchainAddress>,
    pub amount: Decimal,
    pub asset: Option<Asset>,
    pub btc_amount: Option<Decimal>,
    pub usdt_amount: Option<Decimal>,
    pub purpose: Option<PayInPurpose>,
    pub route: Option<DepositRoute>,
    pub aml_check: Option<AmlCheck>,
    pub send_type: Option<PayInSendType>,
    pub prepare_tx_id: Option<String>,
    pub out_tx_id: Option<String>,
    pub return_tx_id: Option<String>,
    pub forward_fee_amount: Option<Decimal>,
    pub is_confirmed: bool,
    /// Set while a prepare or send transaction for this record is on its way
    /// to the chain, cleared once its transaction id is stored
    pub broadcast_started_at: Option<DateTime<Utc>>,
    /// Human-readable reason for failed or ignored records
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PayIn {
    /// Build a pay-in from a detected transfer and its reference amounts.
    ///
    /// Missing reference legs park the record in `WaitingForPriceReference`;
    /// a missing asset fails it immediately.
    #[must_use]
    pub fn create(
        transfer: DetectedTransfer,
        btc_amount: Option<Decimal>,
        usdt_amount: Option<Decimal>,
    ) -> Self {
        let now = Utc::now();
        let mut pay_in = Self {
            id: Uuid::now_v7().to_string(),
            status: PayInStatus::Created,
            in_tx_id: transfer.tx_id,
            tx_type: transfer.tx_type,
            tx_sequence: transfer.tx_sequence,
            block_height: transfer.block_height,
            address: transfer.address,
            destination_address: None,
            amount: transfer.amount,
            asset: transfer.asset,
            btc_amount: None,
            usdt_amount: None,
            purpose: None,
            route: None,
            aml_check: None,
            send_type: None,
            prepare_tx_id: None,
            out_tx_id: None,
            return_tx_id: None,
            forward_fee_amount: None,
            is_confirmed: false,
            broadcast_started_at: None,
            comment: None,
            created_at: now,
            updated_at: now,
        };

        pay_in.apply_reference_amounts(btc_amount, usdt_amount);

        if pay_in.asset.is_none() {
            pay_in.status = PayInStatus::Failed;
            pay_in.comment = Some("Unknown asset".to_string());
        }

        pay_in
    }

    pub fn identity(&self) -> PayInIdentity {
        PayInIdentity {
            in_tx_id: self.in_tx_id.clone(),
            asset_id: self.asset.as_ref().map(|a| a.id),
            address: self.address.address.clone(),
            blockchain: self.address.blockchain.as_str().to_string(),
        }
    }

    /// Both reference legs present (the stable leg is optional on Bitcoin-family chains)
    pub fn has_reference_amounts(&self) -> bool {
        self.btc_amount.is_some()
            && (self.usdt_amount.is_some() || !self.address.blockchain.requires_stable_reference())
    }

    // --- TRANSITIONS --- //

    /// Attach reference amounts; retried while waiting for price data
    pub fn add_reference_amounts(
        &mut self,
        btc_amount: Option<Decimal>,
        usdt_amount: Option<Decimal>,
    ) -> Result<(), AppError> {
        self.ensure(
            "add reference amounts",
            &[PayInStatus::Created, PayInStatus::WaitingForPriceReference],
        )?;
        self.apply_reference_amounts(btc_amount, usdt_amount);
        self.touch();
        Ok(())
    }

    pub fn acknowledge(
        &mut self,
        purpose: PayInPurpose,
        route: DepositRoute,
        aml_check: AmlCheck,
    ) -> Result<(), AppError> {
        self.ensure_classifiable("acknowledge")?;
        self.purpose = Some(purpose);
        self.route = Some(route);
        self.aml_check = Some(aml_check);
        self.status = PayInStatus::Acknowledged;
        self.send_type = Some(PayInSendType::Forward);
        self.touch();
        Ok(())
    }

    pub fn fail(&mut self, purpose: Option<PayInPurpose>, reason: &str) -> Result<(), AppError> {
        self.ensure(
            "fail",
            &[PayInStatus::Created, PayInStatus::WaitingForPriceReference],
        )?;
        self.purpose = purpose;
        self.comment = Some(reason.to_string());
        self.status = PayInStatus::Failed;
        self.touch();
        Ok(())
    }

    pub fn ignore(&mut self, purpose: PayInPurpose, route: DepositRoute) -> Result<(), AppError> {
        self.ensure_classifiable("ignore")?;
        self.purpose = Some(purpose);
        self.route = Some(route);
        self.status = PayInStatus::Ignored;
        self.touch();
        Ok(())
    }

    /// The return address is only ever assigned here
    pub fn trigger_return(
        &mut self,
        purpose: PayInPurpose,
        return_address: BlockchainAddress,
        route: DepositRoute,
        aml_check: AmlCheck,
    ) -> Result<(), AppError> {
        self.ensure_classifiable("trigger return")?;
        self.purpose = Some(purpose);
        self.route = Some(route);
        self.aml_check = Some(aml_check);
        self.status = PayInStatus::ToReturn;
        self.send_type = Some(PayInSendType::Return);
        self.destination_address = Some(return_address);
        self.touch();
        Ok(())
    }

    pub fn designate_forward(
        &mut self,
        forward_address: BlockchainAddress,
    ) -> Result<(), AppError> {
        self.ensure("designate forward", &[PayInStatus::Acknowledged])?;
        self.destination_address = Some(forward_address);
        self.touch();
        Ok(())
    }

    /// Record the fee top-up. Re-applying the same prepare id is a no-op.
    pub fn preparing(
        &mut self,
        prepare_tx_id: Option<String>,
        forward_fee_amount: Decimal,
    ) -> Result<(), AppError> {
        if self.status == PayInStatus::Preparing && self.prepare_tx_id == prepare_tx_id {
            return Ok(());
        }
        self.ensure(
            "start preparing",
            &[PayInStatus::Acknowledged, PayInStatus::ToReturn],
        )?;
        self.prepare_tx_id = prepare_tx_id;
        self.forward_fee_amount = Some(forward_fee_amount);
        self.broadcast_started_at = None;
        self.status = PayInStatus::Preparing;
        self.touch();
        Ok(())
    }

    pub fn prepared(&mut self) -> Result<(), AppError> {
        self.ensure("mark prepared", &[PayInStatus::Preparing])?;
        self.status = PayInStatus::Prepared;
        self.touch();
        Ok(())
    }

    /// Re-applying the same outbound id is a no-op
    pub fn forward(
        &mut self,
        out_tx_id: String,
        forward_fee_amount: Option<Decimal>,
    ) -> Result<(), AppError> {
        if self.status == PayInStatus::Forwarded && self.out_tx_id.as_ref() == Some(&out_tx_id) {
            return Ok(());
        }
        self.ensure("forward", &[PayInStatus::Prepared])?;
        self.ensure_send_type("forward", PayInSendType::Forward)?;
        self.out_tx_id = Some(out_tx_id);
        if let Some(fee) = forward_fee_amount {
            self.forward_fee_amount = Some(fee);
        }
        self.broadcast_started_at = None;
        self.status = PayInStatus::Forwarded;
        self.touch();
        Ok(())
    }

    /// Funds sent back to the depositor. Re-applying the same id is a no-op.
    pub fn returned(&mut self, return_tx_id: String) -> Result<(), AppError> {
        if self.status == PayInStatus::Returned && self.return_tx_id.as_ref() == Some(&return_tx_id)
        {
            return Ok(());
        }
        self.ensure("return", &[PayInStatus::Prepared, PayInStatus::ToReturn])?;
        self.ensure_send_type("return", PayInSendType::Return)?;
        self.return_tx_id = Some(return_tx_id);
        self.broadcast_started_at = None;
        self.status = PayInStatus::Returned;
        self.touch();
        Ok(())
    }

    pub fn completed(&mut self) -> Result<(), AppError> {
        self.ensure("complete", &[PayInStatus::Forwarded])?;
        self.status = PayInStatus::Completed;
        self.send_type = None;
        self.touch();
        Ok(())
    }

    /// Mark a prepare or send broadcast as in flight. The fee share is stamped
    /// up front when the broadcast is a fee top-up.
    pub fn begin_broadcast(
        &mut self,
        forward_fee_amount: Option<Decimal>,
    ) -> Result<(), AppError> {
        self.ensure(
            "begin broadcast",
            &[
                PayInStatus::Acknowledged,
                PayInStatus::ToReturn,
                PayInStatus::Prepared,
            ],
        )?;
        if self.broadcast_started_at.is_some() {
            return Err(self.invalid("begin broadcast"));
        }
        if forward_fee_amount.is_some() {
            self.forward_fee_amount = forward_fee_amount;
        }
        self.broadcast_started_at = Some(Utc::now());
        self.touch();
        Ok(())
    }

    /// The marked broadcast is known not to have reached the chain
    pub fn abort_broadcast(&mut self) {
        self.broadcast_started_at = None;
        self.touch();
    }

    pub fn has_pending_broadcast(&self) -> bool {
        self.broadcast_started_at.is_some()
    }

    /// Inbound transaction reached confirmation depth. Never touches `status`.
    pub fn confirm(&mut self) {
        self.is_confirmed = true;
        self.touch();
    }

    // --- HELPERS --- //

    fn apply_reference_amounts(
        &mut self,
        btc_amount: Option<Decimal>,
        usdt_amount: Option<Decimal>,
    ) {
        let stable_missing =
            usdt_amount.is_none() && self.address.blockchain.requires_stable_reference();
        if btc_amount.is_none() || stable_missing {
            self.status = PayInStatus::WaitingForPriceReference;
            return;
        }

        self.btc_amount = btc_amount;
        self.usdt_amount = usdt_amount;
        self.status = PayInStatus::Created;
    }

    fn ensure(&self, action: &'static str, allowed: &[PayInStatus]) -> Result<(), AppError> {
        if self.status.is_terminal() || !allowed.contains(&self.status) {
            return Err(self.invalid(action));
        }
        Ok(())
    }

    fn ensure_classifiable(&self, action: &'static str) -> Result<(), AppError> {
        self.ensure(action, &[PayInStatus::Created])?;
        if self.asset.is_none() || !self.has_reference_amounts() {
            return Err(self.invalid(action));
        }
        Ok(())
    }

    fn ensure_send_type(
        &self,
        action: &'static str,
        expected: PayInSendType,
    ) -> Result<(), AppError> {
        if self.send_type != Some(expected) {
            return Err(self.invalid(action));
        }
        Ok(())
    }

    fn invalid(&self, action: &'static str) -> AppError {
        AppError::InvalidTransition {
            id: self.id.clone(),
            from: self.status.to_string(),
            action,
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
