use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::pricing::Money;
use crate::types::{DriverId, PassengerId, PaymentMethod, RideId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementStatus {
    PendingGateway,
    Settled,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementKind {
    Trip,
    Cancellation,
}

/// How a finished ride's cost was apportioned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementRecord {
    pub ride_id: RideId,
    pub passenger_id: PassengerId,
    pub driver_id: Option<DriverId>,
    pub payment_method: PaymentMethod,
    pub kind: SettlementKind,
    pub total: Money,
    pub wallet_applied: Money,
    /// Remainder the gateway must collect.
    pub gateway_due: Money,
    /// Amount the gateway confirmed; `None` until the webhook arrives.
    pub gateway_charged: Option<Money>,
    pub gateway_reference: String,
    pub redirect_url: Option<String>,
    pub commission: Money,
    /// Commission added to the driver's debt ledger (cash trips).
    pub driver_debt_delta: Money,
    pub status: SettlementStatus,
    pub charge_attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
    pub version: u64,
}

impl SettlementRecord {
    /// A charge still has to be created at the gateway.
    pub fn needs_charge(&self) -> bool {
        self.status == SettlementStatus::PendingGateway && self.redirect_url.is_none()
    }
}

/// What the store must apply atomically when a settlement is opened.
#[derive(Debug, Clone, PartialEq)]
pub struct SettlementPlan {
    pub record: SettlementRecord,
    pub wallet_debit: Money,
    pub driver_debt: Option<(DriverId, Money)>,
}

/// Result of opening a settlement.
#[derive(Debug, Clone, PartialEq)]
pub enum SettlementOpen {
    Created(SettlementRecord),
    Existing(SettlementRecord),
}

impl SettlementOpen {
    pub fn into_record(self) -> SettlementRecord {
        match self {
            SettlementOpen::Created(record) | SettlementOpen::Existing(record) => record,
        }
    }
}
