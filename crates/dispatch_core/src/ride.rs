//! Ride records: the request a passenger submits, the authoritative trip and
//! its ordered stops.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::geo::GeoPoint;
use crate::pricing::{Money, Tariff};
use crate::types::{
    DriverId, PassengerId, PaymentMethod, RequestId, RideId, RideKind, VehicleClass,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RideStatus {
    Searching,
    DriverAssigned,
    DriverArriving,
    DriverArrived,
    InProgress,
    Completed,
    CancelledByPassenger,
    CancelledByDriver,
    Cancelled,
}

impl RideStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RideStatus::Completed
                | RideStatus::CancelledByPassenger
                | RideStatus::CancelledByDriver
                | RideStatus::Cancelled
        )
    }

    pub fn is_cancelled(self) -> bool {
        matches!(
            self,
            RideStatus::CancelledByPassenger | RideStatus::CancelledByDriver | RideStatus::Cancelled
        )
    }

    /// Statuses in which a driver is committed to the ride.
    pub fn holds_driver(self) -> bool {
        matches!(
            self,
            RideStatus::DriverAssigned
                | RideStatus::DriverArriving
                | RideStatus::DriverArrived
                | RideStatus::InProgress
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RideStatus::Searching => "searching",
            RideStatus::DriverAssigned => "driver_assigned",
            RideStatus::DriverArriving => "driver_arriving",
            RideStatus::DriverArrived => "driver_arrived",
            RideStatus::InProgress => "in_progress",
            RideStatus::Completed => "completed",
            RideStatus::CancelledByPassenger => "cancelled_by_passenger",
            RideStatus::CancelledByDriver => "cancelled_by_driver",
            RideStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RideStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason", content = "note")]
pub enum CancelReason {
    NoDriversFound,
    Passenger(Option<String>),
    Driver(Option<String>),
    Timeout,
}

/// One intermediate stop. Completed stops always form a prefix of the list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stop {
    pub sequence: u32,
    pub address: String,
    pub point: GeoPoint,
    pub completed: bool,
}

/// What a passenger submits. Immutable; superseded by a [`Ride`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RideRequest {
    pub id: RequestId,
    pub passenger_id: PassengerId,
    pub kind: RideKind,
    pub origin: GeoPoint,
    pub destination: Option<GeoPoint>,
    pub vehicle_class: VehicleClass,
    pub payment_method: PaymentMethod,
    pub created_at: DateTime<Utc>,
}

/// Measured trip figures reported by the driver app on completion.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TripActuals {
    pub distance_m: Option<f64>,
    pub duration_s: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ride {
    pub id: RideId,
    pub request_id: RequestId,
    pub kind: RideKind,
    pub status: RideStatus,
    pub passenger_id: PassengerId,
    pub driver_id: Option<DriverId>,
    pub origin: GeoPoint,
    pub destination: Option<GeoPoint>,
    pub stops: Vec<Stop>,
    pub vehicle_class: VehicleClass,
    pub payment_method: PaymentMethod,
    /// Copied from the tariff book at creation.
    pub tariff: Tariff,
    pub estimated_fare: Money,
    pub actual_fare: Option<Money>,
    pub estimated_distance_m: f64,
    pub estimated_duration_s: f64,
    pub actual_distance_m: Option<f64>,
    pub actual_duration_s: Option<f64>,
    pub pickup_pin: String,
    pub cancel_reason: Option<CancelReason>,
    /// Status the ride was in when it was cancelled.
    pub cancelled_from: Option<RideStatus>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Optimistic-lock token; bumped by every committed mutation.
    pub version: u64,
}

impl Ride {
    pub fn completed_stop_count(&self) -> usize {
        self.stops.iter().take_while(|stop| stop.completed).count()
    }

    pub fn pending_stops(&self) -> impl Iterator<Item = &Stop> {
        self.stops.iter().filter(|stop| !stop.completed)
    }

    /// The next place the driver is heading to.
    pub fn next_waypoint(&self) -> Option<GeoPoint> {
        match self.status {
            RideStatus::DriverAssigned | RideStatus::DriverArriving => Some(self.origin),
            RideStatus::InProgress => self
                .pending_stops()
                .next()
                .map(|stop| stop.point)
                .or(self.destination),
            _ => None,
        }
    }

    /// Remaining waypoints of an in-progress trip: pending stops then the
    /// destination.
    pub fn remaining_waypoints(&self) -> Vec<GeoPoint> {
        self.pending_stops()
            .map(|stop| stop.point)
            .chain(self.destination)
            .collect()
    }

    pub fn is_assigned_to(&self, driver_id: DriverId) -> bool {
        self.driver_id == Some(driver_id)
    }
}

/// Who asked for a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "id")]
pub enum Actor {
    Passenger(PassengerId),
    Driver(DriverId),
    System,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub ride_id: RideId,
    pub from: Option<RideStatus>,
    pub to: RideStatus,
    pub actor: Actor,
    pub at: DateTime<Utc>,
    pub note: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(RideStatus::Completed.is_terminal());
        assert!(RideStatus::Cancelled.is_terminal());
        assert!(RideStatus::CancelledByDriver.is_terminal());
        assert!(!RideStatus::InProgress.is_terminal());
        assert!(!RideStatus::Searching.is_terminal());
    }

    #[test]
    fn status_serializes_as_snake_case() {
        let json = serde_json::to_string(&RideStatus::CancelledByPassenger).expect("json");
        assert_eq!(json, "\"cancelled_by_passenger\"");
        assert_eq!(RideStatus::DriverArrived.to_string(), "driver_arrived");
    }
}
