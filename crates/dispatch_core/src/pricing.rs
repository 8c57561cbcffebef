//! Tariffs and fare calculation.
//!
//! Fares are `base + distance_km * per_km + duration_min * per_minute`,
//! floored at the tariff's minimum fare and rounded to cents. A ride copies the
//! tariff in effect when it is created, so later edits to the tariff book
//! never reprice a ride that is already underway.

use std::collections::HashMap;
use std::sync::RwLock;

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::types::VehicleClass;

pub type Money = Decimal;

/// Rates for one vehicle class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tariff {
    pub vehicle_class: VehicleClass,
    pub base_fare: Money,
    pub per_km: Money,
    pub per_minute: Money,
    pub minimum_fare: Money,
    pub cancellation_fee: Money,
    /// Platform share of a fare, e.g. `0.15`.
    pub commission_rate: Decimal,
}

impl Tariff {
    /// Distance and time component only; used for fare deltas when a route
    /// changes mid-trip.
    pub fn metered(&self, distance_m: f64, duration_s: f64) -> Money {
        let km = decimal_from_f64(distance_m.max(0.0) / 1000.0);
        let minutes = decimal_from_f64(duration_s.max(0.0) / 60.0);
        round_money(km * self.per_km + minutes * self.per_minute)
    }

    /// Full fare for a trip of the given length.
    pub fn trip_fare(&self, distance_m: f64, duration_s: f64) -> Money {
        let fare = self.base_fare + self.metered(distance_m, duration_s);
        round_money(fare.max(self.minimum_fare))
    }

    pub fn commission(&self, total: Money) -> Money {
        round_money(total * self.commission_rate)
    }
}

/// Rounds half-up to cents.
pub fn round_money(value: Decimal) -> Money {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

fn decimal_from_f64(value: f64) -> Decimal {
    Decimal::from_f64(value)
        .unwrap_or_default()
        .round_dp(4)
}

pub fn money_to_f64(value: Money) -> f64 {
    value.to_f64().unwrap_or_default()
}

/// Read access to the tariff in effect for a vehicle class.
pub trait TariffSource: Send + Sync {
    fn tariff_for(&self, class: &VehicleClass) -> Option<Tariff>;
}

/// In-memory tariff table. Edits take effect for rides created afterwards.
#[derive(Debug, Default)]
pub struct TariffBook {
    tariffs: RwLock<HashMap<VehicleClass, Tariff>>,
}

impl TariffBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tariff(self, tariff: Tariff) -> Self {
        self.set_tariff(tariff);
        self
    }

    pub fn set_tariff(&self, tariff: Tariff) {
        let mut tariffs = self
            .tariffs
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        tariffs.insert(tariff.vehicle_class.clone(), tariff);
    }
}

impl TariffSource for TariffBook {
    fn tariff_for(&self, class: &VehicleClass) -> Option<Tariff> {
        let tariffs = self
            .tariffs
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        tariffs.get(class).cloned()
    }
}
