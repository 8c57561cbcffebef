//! Mid-trip stop insertion.
//!
//! A new stop goes right after the last completed one, so completed stops
//! stay a prefix of the list. The remaining route is recomputed from the
//! driver's position and the fare moves by the metered difference between
//! the old and new remaining routes, priced with the ride's frozen tariff.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::clock::Clock;
use crate::config::TripConfig;
use crate::error::{DispatchError, DispatchResult, RideStateRejection, StoreError};
use crate::events::{EventBus, RideEvent};
use crate::geo::GeoPoint;
use crate::pricing::{round_money, Money};
use crate::ride::{Actor, AuditEntry, Ride, RideStatus, Stop};
use crate::routing::{RouteEstimate, RouteEstimator, RouteSource};
use crate::store::{RideCommit, Store};
use crate::telemetry::{bump, DispatchTelemetry};
use crate::types::{PassengerId, RideId};

const MAX_CAS_ATTEMPTS: usize = 4;

/// Resolves a free-text address to coordinates.
pub trait Geocoder: Send + Sync {
    fn geocode(&self, address: &str) -> Option<GeoPoint>;
}

/// What a passenger submits to add a stop. Coordinates, when present, win
/// over the address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopRequest {
    pub address: String,
    pub point: Option<GeoPoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpdatedRide {
    pub ride: Ride,
    /// Remaining route: driver position, pending stops, destination.
    pub route: RouteEstimate,
    pub fare_delta: Money,
}

pub struct StopPlanner {
    store: Arc<dyn Store>,
    estimator: Arc<RouteEstimator>,
    geocoder: Option<Arc<dyn Geocoder>>,
    clock: Arc<dyn Clock>,
    events: Arc<EventBus>,
    telemetry: Arc<DispatchTelemetry>,
    config: TripConfig,
}

impl StopPlanner {
    pub fn new(
        store: Arc<dyn Store>,
        estimator: Arc<RouteEstimator>,
        geocoder: Option<Arc<dyn Geocoder>>,
        clock: Arc<dyn Clock>,
        events: Arc<EventBus>,
        telemetry: Arc<DispatchTelemetry>,
        config: TripConfig,
    ) -> Self {
        Self {
            store,
            estimator,
            geocoder,
            clock,
            events,
            telemetry,
            config,
        }
    }

    pub fn add_stop(
        &self,
        ride_id: RideId,
        passenger_id: PassengerId,
        request: StopRequest,
    ) -> DispatchResult<UpdatedRide> {
        let ride = self.store.ride(ride_id)?;
        self.check(&ride, passenger_id)?;
        let point = self.resolve(ride_id, &request)?;

        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let current = if attempt == 1 {
                ride.clone()
            } else {
                let fresh = self.store.ride(ride_id)?;
                self.check(&fresh, passenger_id)?;
                fresh
            };

            let driver_at = match current.driver_id {
                Some(driver_id) => self.store.driver(driver_id)?.position(),
                None => None,
            }
            .unwrap_or(current.origin);

            let mut before = vec![driver_at];
            before.extend(current.remaining_waypoints());
            let mut after = vec![driver_at, point];
            after.extend(current.remaining_waypoints());

            let old_route = self.remaining_route(&before)?;
            let new_route = self.remaining_route(&after)?;
            let tariff = &current.tariff;
            let fare_delta = round_money(
                (tariff.metered(new_route.distance_m, new_route.duration_s)
                    - tariff.metered(old_route.distance_m, old_route.duration_s))
                .max(Money::ZERO),
            );

            let now = self.clock.now();
            let mut next = current.clone();
            let insert_at = next.completed_stop_count();
            next.stops.insert(
                insert_at,
                Stop {
                    sequence: 0,
                    address: request.address.clone(),
                    point,
                    completed: false,
                },
            );
            for (position, stop) in next.stops.iter_mut().enumerate() {
                stop.sequence = position as u32 + 1;
            }
            next.estimated_fare = round_money(next.estimated_fare + fare_delta);
            next.estimated_distance_m +=
                (new_route.distance_m - old_route.distance_m).max(0.0);
            next.estimated_duration_s +=
                (new_route.duration_s - old_route.duration_s).max(0.0);
            next.updated_at = now;

            let commit = RideCommit {
                ride: next,
                expected_version: current.version,
                driver_update: None,
                audit: Some(AuditEntry {
                    ride_id,
                    from: Some(RideStatus::InProgress),
                    to: RideStatus::InProgress,
                    actor: Actor::Passenger(passenger_id),
                    at: now,
                    note: Some(format!("stop added: {}", request.address)),
                }),
            };
            match self.store.commit_ride(commit) {
                Ok(ride) => {
                    bump(&self.telemetry.stops_added);
                    info!(%ride_id, stops = ride.stops.len(), %fare_delta, "stop added");
                    self.events.publish_ride(
                        ride_id,
                        RideEvent::RouteChanged {
                            ride_id,
                            stop_count: ride.stops.len(),
                            estimated_fare: ride.estimated_fare,
                            polyline: new_route.polyline.clone(),
                        },
                    );
                    return Ok(UpdatedRide {
                        ride,
                        route: new_route,
                        fare_delta,
                    });
                }
                Err(StoreError::VersionConflict { .. }) => {
                    debug!(%ride_id, attempt, "ride changed while adding a stop, retrying");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(StoreError::conflict("ride", ride_id).into())
    }

    fn check(&self, ride: &Ride, passenger_id: PassengerId) -> DispatchResult<()> {
        let reject = |reason| DispatchError::InvalidRideState {
            ride_id: ride.id,
            reason,
        };
        if ride.passenger_id != passenger_id {
            return Err(reject(RideStateRejection::NotRideOwner(passenger_id)));
        }
        if ride.status != RideStatus::InProgress {
            return Err(reject(RideStateRejection::Status(ride.status)));
        }
        if ride.stops.len() >= self.config.max_stops {
            return Err(reject(RideStateRejection::TooManyStops {
                max: self.config.max_stops,
            }));
        }
        Ok(())
    }

    fn resolve(&self, ride_id: RideId, request: &StopRequest) -> DispatchResult<GeoPoint> {
        let resolved = match request.point {
            Some(point) => Some(point),
            None => self
                .geocoder
                .as_ref()
                .and_then(|geocoder| geocoder.geocode(&request.address)),
        };
        resolved
            .filter(GeoPoint::is_valid)
            .ok_or_else(|| DispatchError::InvalidRideState {
                ride_id,
                reason: RideStateRejection::UnresolvableStop(request.address.clone()),
            })
    }

    fn remaining_route(&self, points: &[GeoPoint]) -> DispatchResult<RouteEstimate> {
        if points.len() < 2 {
            return Ok(RouteEstimate {
                distance_m: 0.0,
                duration_s: 0.0,
                polyline: String::new(),
                source: RouteSource::StraightLine,
            });
        }
        self.estimator.estimate_or_fallback(points)
    }
}
