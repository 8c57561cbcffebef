//! Settlement of finished rides.
//!
//! The amount owed is split between the passenger's wallet, the payment
//! gateway and, for cash trips, the driver's commission debt. Opening a
//! settlement is a single store operation keyed by ride, so repeated calls
//! (and duplicate webhooks) never debit or charge twice. Gateway calls happen
//! after the record is stored and never under a store lock; a failed charge
//! leaves the record `pending_gateway` for the reconciliation sweep.

pub mod gateway;
pub mod record;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::SettlementConfig;
use crate::error::{DispatchError, DispatchResult, RideStateRejection, StoreError};
use crate::pricing::{round_money, Money};
use crate::retry::retry_with_backoff;
use crate::ride::{CancelReason, Ride, RideStatus};
use crate::store::Store;
use crate::telemetry::{bump, DispatchTelemetry};
use crate::types::{PaymentMethod, RideId};

pub use gateway::{ChargeHandle, GatewayError, PaymentGateway};
pub use record::{
    SettlementKind, SettlementOpen, SettlementPlan, SettlementRecord, SettlementStatus,
};

/// Update attempts on a contended settlement record.
const MAX_UPDATE_ATTEMPTS: usize = 4;

/// What one reconciliation sweep did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub charges_retried: usize,
    pub charges_created: usize,
    pub marked_failed: usize,
    pub rides_settled: usize,
}

/// Stable gateway reference for a ride's settlement.
pub fn gateway_reference(ride_id: RideId) -> String {
    format!("ride-{ride_id}")
}

/// Amount the passenger owes for a terminal ride under its frozen tariff.
pub fn amount_due(ride: &Ride) -> (SettlementKind, Money) {
    match ride.status {
        RideStatus::Completed => (
            SettlementKind::Trip,
            ride.actual_fare.unwrap_or(ride.estimated_fare),
        ),
        _ => (SettlementKind::Cancellation, cancellation_fee(ride)),
    }
}

/// Driver and system cancellations are free. A passenger pays nothing before
/// the driver has arrived, the flat fee while the driver waits at pickup and
/// the metered fare so far (never less than the fee) once the trip started.
fn cancellation_fee(ride: &Ride) -> Money {
    if !matches!(ride.cancel_reason, Some(CancelReason::Passenger(_))) {
        return Money::ZERO;
    }
    let tariff = &ride.tariff;
    match ride.cancelled_from {
        Some(RideStatus::DriverArrived) => tariff.cancellation_fee,
        Some(RideStatus::InProgress) => {
            let elapsed_s = match (ride.started_at, ride.finished_at) {
                (Some(started), Some(finished)) => {
                    (finished - started).num_milliseconds().max(0) as f64 / 1000.0
                }
                _ => 0.0,
            };
            // Distance covered is prorated from the estimate by elapsed time.
            let progress = if ride.estimated_duration_s > 0.0 {
                (elapsed_s / ride.estimated_duration_s).min(1.0)
            } else {
                0.0
            };
            let travelled_m = ride.estimated_distance_m * progress;
            let so_far = tariff.base_fare + tariff.metered(travelled_m, elapsed_s);
            round_money(so_far.max(tariff.cancellation_fee))
        }
        _ => Money::ZERO,
    }
}

/// Apportions `total` given the passenger's current wallet balance.
fn plan(
    ride: &Ride,
    kind: SettlementKind,
    total: Money,
    balance: Money,
    now: DateTime<Utc>,
) -> SettlementPlan {
    let commission = if kind == SettlementKind::Trip {
        ride.tariff.commission(total)
    } else {
        Money::ZERO
    };
    // Cash is only ever handed over for a completed trip; cancellation fees go
    // through the wallet and gateway like an online payment.
    let cash_trip = ride.payment_method == PaymentMethod::Cash && kind == SettlementKind::Trip;

    let (wallet_applied, gateway_due, driver_debt) = if cash_trip {
        let debt = ride
            .driver_id
            .filter(|_| !commission.is_zero())
            .map(|driver| (driver, commission));
        (Money::ZERO, Money::ZERO, debt)
    } else {
        let wallet = total.min(balance.max(Money::ZERO));
        (wallet, total - wallet, None)
    };

    let settled = gateway_due.is_zero();
    let record = SettlementRecord {
        ride_id: ride.id,
        passenger_id: ride.passenger_id,
        driver_id: ride.driver_id,
        payment_method: ride.payment_method,
        kind,
        total,
        wallet_applied,
        gateway_due,
        gateway_charged: None,
        gateway_reference: gateway_reference(ride.id),
        redirect_url: None,
        commission,
        driver_debt_delta: driver_debt.map(|(_, amount)| amount).unwrap_or_default(),
        status: if settled {
            SettlementStatus::Settled
        } else {
            SettlementStatus::PendingGateway
        },
        charge_attempts: 0,
        last_error: None,
        created_at: now,
        updated_at: now,
        settled_at: settled.then_some(now),
        version: 0,
    };
    SettlementPlan {
        record,
        wallet_debit: wallet_applied,
        driver_debt,
    }
}

pub struct SettlementEngine {
    store: Arc<dyn Store>,
    gateway: Arc<dyn PaymentGateway>,
    clock: Arc<dyn Clock>,
    telemetry: Arc<DispatchTelemetry>,
    config: SettlementConfig,
}

impl SettlementEngine {
    pub fn new(
        store: Arc<dyn Store>,
        gateway: Arc<dyn PaymentGateway>,
        clock: Arc<dyn Clock>,
        telemetry: Arc<DispatchTelemetry>,
        config: SettlementConfig,
    ) -> Self {
        Self {
            store,
            gateway,
            clock,
            telemetry,
            config,
        }
    }

    pub fn settlement(&self, ride_id: RideId) -> DispatchResult<Option<SettlementRecord>> {
        Ok(self.store.settlement(ride_id)?)
    }

    /// Settles a terminal ride. Calling it again returns the stored record
    /// untouched.
    pub fn settle(&self, ride_id: RideId) -> DispatchResult<SettlementRecord> {
        let ride = self.store.ride(ride_id)?;
        if !ride.status.is_terminal() {
            return Err(DispatchError::InvalidRideState {
                ride_id,
                reason: RideStateRejection::NotTerminal(ride.status),
            });
        }

        let (kind, total) = amount_due(&ride);
        let now = self.clock.now();
        let opened = self
            .store
            .create_settlement(ride.id, ride.passenger_id, &mut |balance| {
                plan(&ride, kind, total, balance, now)
            })?;

        let record = match opened {
            SettlementOpen::Existing(record) => {
                debug!(ride_id = %ride_id, status = ?record.status, "settlement already open");
                return Ok(record);
            }
            SettlementOpen::Created(record) => record,
        };

        bump(&self.telemetry.settlements_created);
        info!(
            ride_id = %ride_id,
            total = %record.total,
            wallet = %record.wallet_applied,
            gateway = %record.gateway_due,
            debt = %record.driver_debt_delta,
            kind = ?record.kind,
            "settlement opened"
        );
        if record.status == SettlementStatus::Settled {
            bump(&self.telemetry.settlements_settled);
            return Ok(record);
        }
        self.request_charge(record)
    }

    /// Gateway webhook: the charge for `reference` was paid.
    pub fn confirm_payment(
        &self,
        reference: &str,
        amount: Money,
    ) -> DispatchResult<SettlementRecord> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut record = self
                .store
                .settlement_by_reference(reference)?
                .ok_or_else(|| StoreError::not_found("settlement", reference))?;

            if record.status == SettlementStatus::Settled {
                debug!(reference, "duplicate payment confirmation");
                return Ok(record);
            }
            if amount < record.gateway_due {
                warn!(
                    reference,
                    expected = %record.gateway_due,
                    received = %amount,
                    "payment confirmation below amount due"
                );
                return Err(DispatchError::PaymentMismatch {
                    reference: reference.to_string(),
                    expected: record.gateway_due,
                    received: amount,
                });
            }

            let now = self.clock.now();
            record.status = SettlementStatus::Settled;
            record.gateway_charged = Some(amount);
            record.last_error = None;
            record.settled_at = Some(now);
            record.updated_at = now;
            match self.store.update_settlement(record) {
                Ok(record) => {
                    bump(&self.telemetry.settlements_settled);
                    info!(ride_id = %record.ride_id, amount = %amount, "settlement confirmed");
                    return Ok(record);
                }
                Err(StoreError::VersionConflict { .. }) if attempt < MAX_UPDATE_ATTEMPTS => {
                    debug!(reference, attempt, "settlement changed, re-reading");
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Retries failed charges and settles terminal rides that slipped through
    /// without a record.
    pub fn reconcile(&self) -> DispatchResult<ReconcileReport> {
        let mut report = ReconcileReport::default();

        for record in self
            .store
            .settlements_with_status(SettlementStatus::PendingGateway)?
        {
            if !record.needs_charge() {
                continue;
            }
            report.charges_retried += 1;
            let ride_id = record.ride_id;
            match self.request_charge(record) {
                Ok(_) => report.charges_created += 1,
                Err(err) => {
                    if let Ok(Some(current)) = self.store.settlement(ride_id) {
                        if current.status == SettlementStatus::Failed {
                            report.marked_failed += 1;
                        }
                    }
                    debug!(ride_id = %ride_id, error = %err, "charge retry failed");
                }
            }
        }

        for ride in self.store.unsettled_terminal_rides()? {
            match self.settle(ride.id) {
                Ok(_) => report.rides_settled += 1,
                // The record exists now; its charge is retried next sweep.
                Err(DispatchError::SettlementFailed { .. }) => report.rides_settled += 1,
                Err(err) => warn!(ride_id = %ride.id, error = %err, "settling missed ride failed"),
            }
        }

        if report != ReconcileReport::default() {
            info!(?report, "settlement reconciliation");
        }
        Ok(report)
    }

    /// Creates the gateway charge for a pending record and stores the
    /// outcome.
    fn request_charge(&self, mut record: SettlementRecord) -> DispatchResult<SettlementRecord> {
        let ride_id = record.ride_id;
        let outcome = retry_with_backoff(
            &self.config.retry,
            "gateway_charge",
            || {
                self.gateway
                    .create_charge(record.gateway_due, &record.gateway_reference)
            },
            GatewayError::is_transient,
        );

        record.charge_attempts += 1;
        record.updated_at = self.clock.now();
        let failure = match outcome {
            Ok(handle) => {
                record.redirect_url = Some(handle.redirect_url);
                record.last_error = None;
                None
            }
            Err(err) => {
                let reason = err.to_string();
                record.last_error = Some(reason.clone());
                if record.charge_attempts >= self.config.max_charge_attempts {
                    record.status = SettlementStatus::Failed;
                    bump(&self.telemetry.settlements_failed);
                    warn!(
                        ride_id = %ride_id,
                        attempts = record.charge_attempts,
                        error = %err,
                        "settlement failed, giving up on gateway"
                    );
                } else {
                    warn!(ride_id = %ride_id, attempts = record.charge_attempts, error = %err, "gateway charge failed");
                }
                Some(reason)
            }
        };

        let stored = match self.store.update_settlement(record) {
            Ok(stored) => stored,
            // A webhook or another sweep got there first; theirs wins.
            Err(StoreError::VersionConflict { .. }) => self
                .store
                .settlement(ride_id)?
                .ok_or_else(|| StoreError::not_found("settlement", ride_id))?,
            Err(err) => return Err(err.into()),
        };

        match failure {
            Some(reason) => Err(DispatchError::SettlementFailed { ride_id, reason }),
            None => {
                debug!(ride_id = %ride_id, "gateway charge created");
                Ok(stored)
            }
        }
    }
}
