//! Error signals returned by every engine operation.

use std::fmt;

use crate::pricing::Money;
use crate::ride::RideStatus;
use crate::types::{DriverId, OfferId, PassengerId, RideId};

/// Failures of the authoritative store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("{entity} {id} was modified concurrently")]
    VersionConflict { entity: &'static str, id: String },
    #[error("{entity} {id} already exists")]
    Duplicate { entity: &'static str, id: String },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl fmt::Display) -> Self {
        StoreError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn conflict(entity: &'static str, id: impl fmt::Display) -> Self {
        StoreError::VersionConflict {
            entity,
            id: id.to_string(),
        }
    }
}

/// The event a caller attempted against a ride.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RideEventKind {
    AssignDriver,
    DriverApproaching,
    DriverArrived,
    StartTrip,
    FinishTrip,
    CompleteStop,
    PassengerCancel,
    DriverCancel,
    SystemCancel,
}

impl fmt::Display for RideEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RideEventKind::AssignDriver => "assign_driver",
            RideEventKind::DriverApproaching => "driver_approaching",
            RideEventKind::DriverArrived => "driver_arrived",
            RideEventKind::StartTrip => "start_trip",
            RideEventKind::FinishTrip => "finish_trip",
            RideEventKind::CompleteStop => "complete_stop",
            RideEventKind::PassengerCancel => "passenger_cancel",
            RideEventKind::DriverCancel => "driver_cancel",
            RideEventKind::SystemCancel => "system_cancel",
        };
        f.write_str(name)
    }
}

/// Why a transition guard refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionGuard {
    /// The event is not legal from the current status.
    Status,
    NotRideOwner,
    NotAssignedDriver,
    DriverAlreadyAssigned,
    TooFarFromPickup { distance_m: u32 },
    PickupPinMismatch,
    NoPendingStop,
}

impl fmt::Display for TransitionGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransitionGuard::Status => f.write_str("not allowed from current status"),
            TransitionGuard::NotRideOwner => f.write_str("caller does not own the ride"),
            TransitionGuard::NotAssignedDriver => f.write_str("caller is not the assigned driver"),
            TransitionGuard::DriverAlreadyAssigned => f.write_str("ride already has a driver"),
            TransitionGuard::TooFarFromPickup { distance_m } => {
                write!(f, "driver is {distance_m} m from pickup")
            }
            TransitionGuard::PickupPinMismatch => f.write_str("pickup pin mismatch"),
            TransitionGuard::NoPendingStop => f.write_str("no pending stop"),
        }
    }
}

/// Why a ride mutation (e.g. adding a stop) was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RideStateRejection {
    Status(RideStatus),
    NotRideOwner(PassengerId),
    UnresolvableStop(String),
    TooManyStops { max: usize },
    NotTerminal(RideStatus),
}

impl fmt::Display for RideStateRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RideStateRejection::Status(status) => write!(f, "ride is {status}"),
            RideStateRejection::NotRideOwner(passenger) => {
                write!(f, "passenger {passenger} does not own the ride")
            }
            RideStateRejection::UnresolvableStop(address) => {
                write!(f, "stop '{address}' could not be geocoded")
            }
            RideStateRejection::TooManyStops { max } => write!(f, "ride already has {max} stops"),
            RideStateRejection::NotTerminal(status) => {
                write!(f, "ride is {status}, settlement needs a terminal ride")
            }
        }
    }
}

/// Why a location sample was judged implausible.
#[derive(Debug, Clone, PartialEq)]
pub enum LocationRejection {
    InvalidCoordinates,
    FromTheFuture { skew_s: i64 },
    TooFast { speed_kmh: f64 },
}

impl fmt::Display for LocationRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocationRejection::InvalidCoordinates => f.write_str("coordinates out of range"),
            LocationRejection::FromTheFuture { skew_s } => {
                write!(f, "timestamp {skew_s}s in the future")
            }
            LocationRejection::TooFast { speed_kmh } => {
                write!(f, "implied speed {speed_kmh:.0} km/h")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DispatchError {
    #[error("{event} rejected for ride {ride_id} in status {status}: {guard}")]
    InvalidTransition {
        ride_id: RideId,
        status: RideStatus,
        event: RideEventKind,
        guard: TransitionGuard,
    },
    #[error("offer {offer_id} was already taken")]
    AlreadyTaken { offer_id: OfferId },
    #[error("no drivers available for ride {ride_id}")]
    NoDriversAvailable { ride_id: RideId },
    #[error("implausible location from driver {driver_id}: {reason}")]
    ImplausibleLocation {
        driver_id: DriverId,
        reason: LocationRejection,
    },
    #[error("stale location from driver {driver_id}")]
    StaleLocation { driver_id: DriverId },
    #[error("route unavailable: {0}")]
    RouteUnavailable(String),
    #[error("ride {ride_id} cannot be modified: {reason}")]
    InvalidRideState {
        ride_id: RideId,
        reason: RideStateRejection,
    },
    #[error("settlement of ride {ride_id} failed: {reason}")]
    SettlementFailed { ride_id: RideId, reason: String },
    #[error("payment {reference} confirmed {received}, expected {expected}")]
    PaymentMismatch {
        reference: String,
        expected: Money,
        received: Money,
    },
    #[error("offer {offer_id} has expired")]
    OfferExpired { offer_id: OfferId },
    #[error("driver {driver_id} is not a candidate for offer {offer_id}")]
    NotACandidate {
        offer_id: OfferId,
        driver_id: DriverId,
    },
    #[error("driver {driver_id} is not available")]
    DriverUnavailable { driver_id: DriverId },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Storage(#[from] StoreError),
}

impl DispatchError {
    /// Stable code for mapping onto HTTP or RPC errors.
    pub fn code(&self) -> &'static str {
        match self {
            DispatchError::InvalidTransition { .. } => "invalid_transition",
            DispatchError::AlreadyTaken { .. } => "already_taken",
            DispatchError::NoDriversAvailable { .. } => "no_drivers_available",
            DispatchError::ImplausibleLocation { .. } => "implausible_location",
            DispatchError::StaleLocation { .. } => "stale_location",
            DispatchError::RouteUnavailable(_) => "route_unavailable",
            DispatchError::InvalidRideState { .. } => "invalid_ride_state",
            DispatchError::SettlementFailed { .. } => "settlement_failed",
            DispatchError::PaymentMismatch { .. } => "payment_mismatch",
            DispatchError::OfferExpired { .. } => "offer_expired",
            DispatchError::NotACandidate { .. } => "not_a_candidate",
            DispatchError::DriverUnavailable { .. } => "driver_unavailable",
            DispatchError::InvalidRequest(_) => "invalid_request",
            DispatchError::Storage(StoreError::NotFound { .. }) => "not_found",
            DispatchError::Storage(StoreError::VersionConflict { .. }) => "conflict",
            DispatchError::Storage(_) => "storage",
        }
    }

    /// Whether the caller can act on the error (refresh and retry, rejoin the
    /// pool, degrade) rather than treat it as an outage.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            DispatchError::NoDriversAvailable { .. }
                | DispatchError::Storage(StoreError::Unavailable(_))
        )
    }
}

pub type DispatchResult<T> = Result<T, DispatchError>;
