use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::geo::GeoPoint;
use crate::types::{Availability, DriverId, OfferId, RideId, VehicleDescriptor};

/// One position report. Only the latest accepted sample per driver is kept.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocationSample {
    pub driver_id: DriverId,
    pub point: GeoPoint,
    /// Degrees clockwise from north, when the device reports one.
    pub heading: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverState {
    pub driver_id: DriverId,
    pub availability: Availability,
    pub last_location: Option<LocationSample>,
    pub vehicle: VehicleDescriptor,
    /// Set while the driver is a live candidate of an open offer; such a
    /// driver is not offered another ride.
    pub pending_offer: Option<OfferId>,
    pub current_ride: Option<RideId>,
}

impl DriverState {
    pub fn new(driver_id: DriverId, vehicle: VehicleDescriptor) -> Self {
        Self {
            driver_id,
            availability: Availability::Offline,
            last_location: None,
            vehicle,
            pending_offer: None,
            current_ride: None,
        }
    }

    /// Free to receive a new offer.
    pub fn is_dispatchable(&self) -> bool {
        self.availability == Availability::Available
            && self.pending_offer.is_none()
            && self.last_location.is_some()
    }

    pub fn position(&self) -> Option<GeoPoint> {
        self.last_location.map(|sample| sample.point)
    }
}
