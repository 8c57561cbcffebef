//! Ride lifecycle.
//!
//! ```text
//! searching -> driver_assigned -> driver_arriving -> driver_arrived -> in_progress -> completed
//!      \______________\_________________\__________________\_______________\
//!                                   cancelled_by_passenger | cancelled_by_driver | cancelled
//! ```
//!
//! Every transition reads the ride, evaluates its guard against that
//! snapshot and commits with a compare-and-swap on the ride version. A lost
//! race re-reads and re-evaluates the guard, so two concurrent requests can
//! never both apply against the same prior state. Transitions that end a
//! ride release the driver in the same commit.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::clock::Clock;
use crate::config::TripConfig;
use crate::error::{
    DispatchError, DispatchResult, RideEventKind, StoreError, TransitionGuard,
};
use crate::events::{DriverEvent, EventBus, RideEvent};
use crate::geo::{haversine_m, GeoPoint};
use crate::matching::offer::Offer;
use crate::ride::{Actor, AuditEntry, CancelReason, Ride, RideStatus, TripActuals};
use crate::spatial::GeoIndex;
use crate::store::{ClaimRejection, DriverUpdate, OfferClaim, RideCommit, Store};
use crate::telemetry::{bump, DispatchTelemetry};
use crate::types::{Availability, DriverId, PassengerId, RideId};

/// Compare-and-swap attempts before a contended ride surfaces a conflict.
const MAX_CAS_ATTEMPTS: usize = 4;

/// The ride as it should look after an event, plus side effects to commit
/// alongside it.
struct Transition {
    ride: Ride,
    release_driver: Option<DriverId>,
    note: Option<String>,
}

impl Transition {
    fn to(ride: Ride) -> Self {
        Self {
            ride,
            release_driver: None,
            note: None,
        }
    }
}

pub struct RideStateMachine {
    store: Arc<dyn Store>,
    index: Arc<GeoIndex>,
    clock: Arc<dyn Clock>,
    events: Arc<EventBus>,
    telemetry: Arc<DispatchTelemetry>,
    config: TripConfig,
}

impl RideStateMachine {
    pub fn new(
        store: Arc<dyn Store>,
        index: Arc<GeoIndex>,
        clock: Arc<dyn Clock>,
        events: Arc<EventBus>,
        telemetry: Arc<DispatchTelemetry>,
        config: TripConfig,
    ) -> Self {
        Self {
            store,
            index,
            clock,
            events,
            telemetry,
            config,
        }
    }

    pub fn ride(&self, ride_id: RideId) -> DispatchResult<Ride> {
        Ok(self.store.ride(ride_id)?)
    }

    pub fn audit_log(&self, ride_id: RideId) -> DispatchResult<Vec<AuditEntry>> {
        Ok(self.store.audit_log(ride_id)?)
    }

    /// Stores a freshly created `searching` ride.
    pub fn create(&self, ride: Ride) -> DispatchResult<Ride> {
        if ride.status != RideStatus::Searching || ride.driver_id.is_some() {
            return Err(DispatchError::InvalidRequest(
                "new rides start searching without a driver".into(),
            ));
        }
        let audit = AuditEntry {
            ride_id: ride.id,
            from: None,
            to: RideStatus::Searching,
            actor: Actor::Passenger(ride.passenger_id),
            at: ride.created_at,
            note: None,
        };
        self.store.insert_ride(ride.clone(), audit)?;
        info!(ride_id = %ride.id, passenger_id = %ride.passenger_id, kind = ?ride.kind, "ride created");
        self.events.publish_ride(
            ride.id,
            RideEvent::StatusChanged {
                ride_id: ride.id,
                from: None,
                to: RideStatus::Searching,
                at: ride.created_at,
            },
        );
        Ok(ride)
    }

    /// `searching -> driver_assigned` through an offer claim. At most one
    /// caller per offer gets `Ok`; the rest see `AlreadyTaken`.
    pub fn accept_offer(&self, offer: &Offer, driver_id: DriverId) -> DispatchResult<Ride> {
        let offer_id = offer.id;
        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self.store.ride(offer.ride_id)?;
            if let Some(err) = self.claim_lost(offer, &current, driver_id) {
                return Err(err);
            }

            let now = self.clock.now();
            let mut assigned = current.clone();
            assigned.status = RideStatus::DriverAssigned;
            assigned.driver_id = Some(driver_id);
            assigned.assigned_at = Some(now);
            assigned.updated_at = now;

            let claim = OfferClaim {
                offer_id,
                driver_id,
                now,
                ride: assigned,
                expected_version: current.version,
                audit: AuditEntry {
                    ride_id: current.id,
                    from: Some(RideStatus::Searching),
                    to: RideStatus::DriverAssigned,
                    actor: Actor::Driver(driver_id),
                    at: now,
                    note: Some(format!("offer {offer_id}")),
                },
            };
            match self.store.claim_offer(claim)? {
                Ok(ride) => {
                    self.index.set_availability(driver_id, Availability::OnTrip);
                    info!(ride_id = %ride.id, %driver_id, %offer_id, "driver assigned");
                    self.publish_status(&ride, RideStatus::Searching, now);
                    self.events
                        .publish_driver(driver_id, DriverEvent::RideAssigned { ride_id: ride.id });
                    return Ok(ride);
                }
                Err(ClaimRejection::AlreadyTaken) => {
                    // Either another driver won, or the ride moved on for a
                    // different reason; re-read to tell which.
                    let latest = self.store.ride(offer.ride_id)?;
                    let offer_now = self.store.offer(offer_id)?;
                    if let Some(err) = self.claim_lost(&offer_now, &latest, driver_id) {
                        return Err(err);
                    }
                }
                Err(ClaimRejection::Expired) => {
                    return Err(DispatchError::OfferExpired { offer_id })
                }
                Err(ClaimRejection::NotACandidate) => {
                    return Err(DispatchError::NotACandidate {
                        offer_id,
                        driver_id,
                    })
                }
                Err(ClaimRejection::DriverUnavailable) => {
                    return Err(DispatchError::DriverUnavailable { driver_id })
                }
            }
        }
        Err(StoreError::conflict("ride", offer.ride_id).into())
    }

    /// Why a claim on `offer` can no longer succeed given the ride as read,
    /// or `None` if it is still worth attempting.
    fn claim_lost(&self, offer: &Offer, ride: &Ride, driver_id: DriverId) -> Option<DispatchError> {
        let offer_id = offer.id;
        if offer.winner.is_some() || ride.driver_id.is_some() {
            bump(&self.telemetry.accepts_lost);
            debug!(%offer_id, %driver_id, "lost the accept race");
            return Some(DispatchError::AlreadyTaken { offer_id });
        }
        if ride.status != RideStatus::Searching {
            // Cancelled before anyone accepted.
            return Some(DispatchError::OfferExpired { offer_id });
        }
        None
    }

    /// `driver_assigned -> driver_arriving`.
    pub fn mark_approaching(&self, ride_id: RideId, driver_id: DriverId) -> DispatchResult<Ride> {
        self.apply(
            ride_id,
            RideEventKind::DriverApproaching,
            Actor::Driver(driver_id),
            |ride, now| {
                require_driver(ride, driver_id)?;
                require_status(ride, &[RideStatus::DriverAssigned])?;
                let mut next = ride.clone();
                next.status = RideStatus::DriverArriving;
                next.updated_at = now;
                Ok(Transition::to(next))
            },
        )
    }

    /// `driver_arriving -> driver_arrived`, optionally checking the driver's
    /// last reported position against the pickup point.
    pub fn mark_arrived(&self, ride_id: RideId, driver_id: DriverId) -> DispatchResult<Ride> {
        let position = self.store.driver(driver_id)?.position();
        let proximity = self.config.arrival_proximity_m;
        self.apply(
            ride_id,
            RideEventKind::DriverArrived,
            Actor::Driver(driver_id),
            |ride, now| {
                require_driver(ride, driver_id)?;
                require_status(ride, &[RideStatus::DriverArriving])?;
                if let (Some(max_m), Some(at)) = (proximity, position) {
                    check_proximity(ride.origin, at, max_m)?;
                }
                let mut next = ride.clone();
                next.status = RideStatus::DriverArrived;
                next.updated_at = now;
                Ok(Transition::to(next))
            },
        )
    }

    /// `driver_arrived -> in_progress`. With `require_pickup_pin` the driver
    /// must present the PIN the passenger was shown.
    pub fn start_trip(
        &self,
        ride_id: RideId,
        driver_id: DriverId,
        pickup_pin: Option<&str>,
    ) -> DispatchResult<Ride> {
        let require_pin = self.config.require_pickup_pin;
        self.apply(
            ride_id,
            RideEventKind::StartTrip,
            Actor::Driver(driver_id),
            |ride, now| {
                require_driver(ride, driver_id)?;
                require_status(ride, &[RideStatus::DriverArrived])?;
                if require_pin && pickup_pin != Some(ride.pickup_pin.as_str()) {
                    return Err(TransitionGuard::PickupPinMismatch);
                }
                let mut next = ride.clone();
                next.status = RideStatus::InProgress;
                next.started_at = Some(now);
                next.updated_at = now;
                Ok(Transition::to(next))
            },
        )
    }

    /// `in_progress -> completed`. Prices the trip from the frozen tariff
    /// using measured figures when given, else the estimated distance and the
    /// elapsed time.
    pub fn finish_trip(
        &self,
        ride_id: RideId,
        driver_id: DriverId,
        actuals: TripActuals,
    ) -> DispatchResult<Ride> {
        let ride = self.apply(
            ride_id,
            RideEventKind::FinishTrip,
            Actor::Driver(driver_id),
            |ride, now| {
                require_driver(ride, driver_id)?;
                require_status(ride, &[RideStatus::InProgress])?;
                let distance_m = actuals
                    .distance_m
                    .filter(|m| m.is_finite() && *m >= 0.0)
                    .unwrap_or(ride.estimated_distance_m);
                let duration_s = actuals
                    .duration_s
                    .filter(|s| s.is_finite() && *s >= 0.0)
                    .unwrap_or_else(|| elapsed_secs(ride.started_at, now));
                let mut next = ride.clone();
                next.status = RideStatus::Completed;
                next.actual_distance_m = Some(distance_m);
                next.actual_duration_s = Some(duration_s);
                next.actual_fare = Some(ride.tariff.trip_fare(distance_m, duration_s));
                next.finished_at = Some(now);
                next.updated_at = now;
                Ok(Transition {
                    ride: next,
                    release_driver: Some(driver_id),
                    note: None,
                })
            },
        )?;
        bump(&self.telemetry.rides_completed);
        Ok(ride)
    }

    /// Marks the first pending stop of an in-progress trip as completed.
    pub fn complete_next_stop(&self, ride_id: RideId, driver_id: DriverId) -> DispatchResult<Ride> {
        self.apply(
            ride_id,
            RideEventKind::CompleteStop,
            Actor::Driver(driver_id),
            |ride, now| {
                require_driver(ride, driver_id)?;
                require_status(ride, &[RideStatus::InProgress])?;
                let index = ride.completed_stop_count();
                if index >= ride.stops.len() {
                    return Err(TransitionGuard::NoPendingStop);
                }
                let note = format!("stop {} completed", ride.stops[index].sequence);
                let mut next = ride.clone();
                next.stops[index].completed = true;
                next.updated_at = now;
                Ok(Transition {
                    note: Some(note),
                    ..Transition::to(next)
                })
            },
        )
    }

    pub fn cancel_by_passenger(
        &self,
        ride_id: RideId,
        passenger_id: PassengerId,
        note: Option<String>,
    ) -> DispatchResult<Ride> {
        self.cancel(
            ride_id,
            RideEventKind::PassengerCancel,
            Actor::Passenger(passenger_id),
            RideStatus::CancelledByPassenger,
            CancelReason::Passenger(note),
            |ride| {
                if ride.passenger_id != passenger_id {
                    return Err(TransitionGuard::NotRideOwner);
                }
                Ok(())
            },
        )
    }

    pub fn cancel_by_driver(
        &self,
        ride_id: RideId,
        driver_id: DriverId,
        note: Option<String>,
    ) -> DispatchResult<Ride> {
        self.cancel(
            ride_id,
            RideEventKind::DriverCancel,
            Actor::Driver(driver_id),
            RideStatus::CancelledByDriver,
            CancelReason::Driver(note),
            |ride| require_driver(ride, driver_id),
        )
    }

    pub fn cancel_by_system(&self, ride_id: RideId, reason: CancelReason) -> DispatchResult<Ride> {
        self.cancel(
            ride_id,
            RideEventKind::SystemCancel,
            Actor::System,
            RideStatus::Cancelled,
            reason,
            |_| Ok(()),
        )
    }

    /// `searching -> cancelled` with `no_drivers_found`. Refused once a
    /// driver has been assigned.
    pub fn cancel_unmatched(&self, ride_id: RideId) -> DispatchResult<Ride> {
        self.cancel(
            ride_id,
            RideEventKind::SystemCancel,
            Actor::System,
            RideStatus::Cancelled,
            CancelReason::NoDriversFound,
            |ride| {
                if ride.driver_id.is_some() {
                    return Err(TransitionGuard::DriverAlreadyAssigned);
                }
                require_status(ride, &[RideStatus::Searching])
            },
        )
    }

    fn cancel<G>(
        &self,
        ride_id: RideId,
        event: RideEventKind,
        actor: Actor,
        to: RideStatus,
        reason: CancelReason,
        guard: G,
    ) -> DispatchResult<Ride>
    where
        G: Fn(&Ride) -> Result<(), TransitionGuard>,
    {
        let ride = self.apply(ride_id, event, actor, |ride, now| {
            guard(ride)?;
            let mut next = ride.clone();
            next.status = to;
            next.cancel_reason = Some(reason.clone());
            next.cancelled_from = Some(ride.status);
            next.finished_at = Some(now);
            next.updated_at = now;
            let release_driver = ride.driver_id.filter(|_| ride.status.holds_driver());
            Ok(Transition {
                ride: next,
                release_driver,
                note: Some(format!("{reason:?}")),
            })
        })?;
        bump(&self.telemetry.rides_cancelled);
        Ok(ride)
    }

    /// Read, guard, compare-and-swap; retried on version conflicts only.
    fn apply<F>(
        &self,
        ride_id: RideId,
        event: RideEventKind,
        actor: Actor,
        decide: F,
    ) -> DispatchResult<Ride>
    where
        F: Fn(&Ride, DateTime<Utc>) -> Result<Transition, TransitionGuard>,
    {
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let current = self.store.ride(ride_id)?;
            let now = self.clock.now();
            let rejected = |guard| DispatchError::InvalidTransition {
                ride_id,
                status: current.status,
                event,
                guard,
            };
            if current.status.is_terminal() {
                return Err(rejected(TransitionGuard::Status));
            }
            let transition = decide(&current, now).map_err(rejected)?;

            let from = current.status;
            let to = transition.ride.status;
            let driver_update = transition.release_driver.map(|driver_id| DriverUpdate {
                driver_id,
                availability: Availability::Available,
                current_ride: None,
            });
            let commit = RideCommit {
                ride: transition.ride,
                expected_version: current.version,
                driver_update,
                audit: Some(AuditEntry {
                    ride_id,
                    from: Some(from),
                    to,
                    actor,
                    at: now,
                    note: transition.note,
                }),
            };

            match self.store.commit_ride(commit) {
                Ok(ride) => {
                    if let Some(update) = driver_update {
                        self.index
                            .set_availability(update.driver_id, Availability::Available);
                        self.events.publish_driver(
                            update.driver_id,
                            DriverEvent::RideClosed {
                                ride_id,
                                status: ride.status,
                            },
                        );
                    }
                    if from != to {
                        info!(%ride_id, %from, %to, ?actor, "ride transition");
                        self.publish_status(&ride, from, now);
                        if to.is_terminal() {
                            self.events.close_ride(ride_id);
                        }
                    }
                    return Ok(ride);
                }
                Err(StoreError::VersionConflict { .. }) => {
                    debug!(%ride_id, %event, attempt, "ride changed concurrently, re-evaluating");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(StoreError::conflict("ride", ride_id).into())
    }

    fn publish_status(&self, ride: &Ride, from: RideStatus, at: DateTime<Utc>) {
        self.events.publish_ride(
            ride.id,
            RideEvent::StatusChanged {
                ride_id: ride.id,
                from: Some(from),
                to: ride.status,
                at,
            },
        );
    }
}

fn require_status(ride: &Ride, allowed: &[RideStatus]) -> Result<(), TransitionGuard> {
    if allowed.contains(&ride.status) {
        Ok(())
    } else {
        Err(TransitionGuard::Status)
    }
}

fn require_driver(ride: &Ride, driver_id: DriverId) -> Result<(), TransitionGuard> {
    if ride.is_assigned_to(driver_id) {
        Ok(())
    } else {
        Err(TransitionGuard::NotAssignedDriver)
    }
}

fn check_proximity(pickup: GeoPoint, at: GeoPoint, max_m: f64) -> Result<(), TransitionGuard> {
    let distance_m = haversine_m(pickup, at);
    if distance_m > max_m {
        return Err(TransitionGuard::TooFarFromPickup {
            distance_m: distance_m.round() as u32,
        });
    }
    Ok(())
}

fn elapsed_secs(since: Option<DateTime<Utc>>, now: DateTime<Utc>) -> f64 {
    since
        .map(|start| (now - start).num_milliseconds().max(0) as f64 / 1000.0)
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use crate::test_helpers::{assigned_ride, online_driver, TEST_ORIGIN};
    use rust_decimal::Decimal;

    struct Fixture {
        machine: RideStateMachine,
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
    }

    fn fixture(config: TripConfig) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::default());
        let machine = RideStateMachine::new(
            store.clone(),
            Arc::new(GeoIndex::default()),
            clock.clone(),
            Arc::new(EventBus::new()),
            Arc::new(DispatchTelemetry::default()),
            config,
        );
        Fixture {
            machine,
            store,
            clock,
        }
    }

    /// Stores a driver on trip and a ride assigned to them.
    fn seed(f: &Fixture, status: RideStatus) -> (Ride, DriverId) {
        let mut driver = online_driver(TEST_ORIGIN, f.clock.now());
        let ride = assigned_ride(driver.driver_id, status, f.clock.now());
        driver.availability = Availability::OnTrip;
        driver.current_ride = Some(ride.id);
        let driver_id = driver.driver_id;
        f.store.upsert_driver(driver).expect("driver");
        f.store
            .insert_ride(
                ride.clone(),
                AuditEntry {
                    ride_id: ride.id,
                    from: None,
                    to: status,
                    actor: Actor::System,
                    at: ride.created_at,
                    note: None,
                },
            )
            .expect("ride");
        (ride, driver_id)
    }

    #[test]
    fn full_lifecycle_releases_driver_on_completion() {
        let f = fixture(TripConfig::default());
        let (ride, driver) = seed(&f, RideStatus::DriverAssigned);

        f.machine.mark_approaching(ride.id, driver).expect("approaching");
        f.machine.mark_arrived(ride.id, driver).expect("arrived");
        f.machine.start_trip(ride.id, driver, None).expect("started");
        f.clock.advance_secs(600);
        let done = f
            .machine
            .finish_trip(
                ride.id,
                driver,
                TripActuals {
                    distance_m: Some(5_000.0),
                    duration_s: None,
                },
            )
            .expect("finished");

        assert_eq!(done.status, RideStatus::Completed);
        assert_eq!(done.actual_duration_s, Some(600.0));
        // 3.50 + 5 km * 1.20 + 10 min * 0.40
        assert_eq!(done.actual_fare, Some(Decimal::new(1350, 2)));
        let stored = f.store.driver(driver).expect("driver");
        assert_eq!(stored.availability, Availability::Available);
        assert_eq!(stored.current_ride, None);

        let log = f.store.audit_log(ride.id).expect("audit");
        let path: Vec<_> = log.iter().map(|entry| entry.to).collect();
        assert_eq!(
            path,
            vec![
                RideStatus::DriverAssigned,
                RideStatus::DriverArriving,
                RideStatus::DriverArrived,
                RideStatus::InProgress,
                RideStatus::Completed,
            ]
        );
    }

    #[test]
    fn completing_an_assigned_ride_is_rejected_without_side_effects() {
        let f = fixture(TripConfig::default());
        let (ride, driver) = seed(&f, RideStatus::DriverAssigned);

        let err = f
            .machine
            .finish_trip(ride.id, driver, TripActuals::default())
            .unwrap_err();
        assert!(matches!(
            err,
            DispatchError::InvalidTransition {
                status: RideStatus::DriverAssigned,
                event: RideEventKind::FinishTrip,
                guard: TransitionGuard::Status,
                ..
            }
        ));
        let stored = f.store.ride(ride.id).expect("ride");
        assert_eq!(stored.status, RideStatus::DriverAssigned);
        assert_eq!(stored.version, ride.version);
        assert_eq!(
            f.store.driver(driver).expect("driver").availability,
            Availability::OnTrip
        );
    }

    #[test]
    fn terminal_rides_reject_everything() {
        let f = fixture(TripConfig::default());
        let (ride, driver) = seed(&f, RideStatus::InProgress);
        f.machine
            .cancel_by_driver(ride.id, driver, Some("flat tyre".into()))
            .expect("cancelled");

        let passenger = ride.passenger_id;
        assert!(f.machine.cancel_by_passenger(ride.id, passenger, None).is_err());
        assert!(f
            .machine
            .cancel_by_system(ride.id, CancelReason::Timeout)
            .is_err());
        assert!(f
            .machine
            .finish_trip(ride.id, driver, TripActuals::default())
            .is_err());
        let stored = f.store.ride(ride.id).expect("ride");
        assert_eq!(stored.status, RideStatus::CancelledByDriver);
        assert_eq!(stored.cancelled_from, Some(RideStatus::InProgress));
    }

    #[test]
    fn only_the_owner_may_cancel_as_passenger() {
        let f = fixture(TripConfig::default());
        let (ride, _) = seed(&f, RideStatus::DriverArriving);
        let err = f
            .machine
            .cancel_by_passenger(ride.id, PassengerId::new(), None)
            .unwrap_err();
        assert!(matches!(
            err,
            DispatchError::InvalidTransition {
                guard: TransitionGuard::NotRideOwner,
                ..
            }
        ));
    }

    #[test]
    fn another_driver_cannot_drive_the_ride() {
        let f = fixture(TripConfig::default());
        let (ride, _) = seed(&f, RideStatus::DriverAssigned);
        let err = f
            .machine
            .mark_approaching(ride.id, DriverId::new())
            .unwrap_err();
        assert!(matches!(
            err,
            DispatchError::InvalidTransition {
                guard: TransitionGuard::NotAssignedDriver,
                ..
            }
        ));
    }

    #[test]
    fn arrival_far_from_pickup_is_refused() {
        let f = fixture(TripConfig::default());
        let (ride, driver) = seed(&f, RideStatus::DriverArriving);
        f.clock.advance_secs(1);
        let mut state = f.store.driver(driver).expect("driver");
        if let Some(sample) = state.last_location.as_mut() {
            sample.point = GeoPoint::new(TEST_ORIGIN.lat + 0.01, TEST_ORIGIN.lng);
        }
        f.store.upsert_driver(state).expect("driver");

        let err = f.machine.mark_arrived(ride.id, driver).unwrap_err();
        assert!(matches!(
            err,
            DispatchError::InvalidTransition {
                guard: TransitionGuard::TooFarFromPickup { .. },
                ..
            }
        ));
    }

    #[test]
    fn pickup_pin_is_checked_when_required() {
        let f = fixture(TripConfig {
            require_pickup_pin: true,
            ..TripConfig::default()
        });
        let (ride, driver) = seed(&f, RideStatus::DriverArrived);

        let err = f.machine.start_trip(ride.id, driver, Some("0000x")).unwrap_err();
        assert!(matches!(
            err,
            DispatchError::InvalidTransition {
                guard: TransitionGuard::PickupPinMismatch,
                ..
            }
        ));
        let started = f
            .machine
            .start_trip(ride.id, driver, Some(ride.pickup_pin.as_str()))
            .expect("started");
        assert_eq!(started.status, RideStatus::InProgress);
    }

    #[test]
    fn concurrent_cancel_and_finish_apply_exactly_one() {
        let f = fixture(TripConfig::default());
        let (ride, driver) = seed(&f, RideStatus::InProgress);
        let barrier = std::sync::Barrier::new(2);

        let (finish, cancel) = std::thread::scope(|scope| {
            let finish = scope.spawn(|| {
                barrier.wait();
                f.machine.finish_trip(ride.id, driver, TripActuals::default())
            });
            let cancel = scope.spawn(|| {
                barrier.wait();
                f.machine.cancel_by_passenger(ride.id, ride.passenger_id, None)
            });
            (
                finish.join().expect("finish thread"),
                cancel.join().expect("cancel thread"),
            )
        });

        assert_ne!(finish.is_ok(), cancel.is_ok());
        let stored = f.store.ride(ride.id).expect("ride");
        assert!(stored.status.is_terminal());
        assert_eq!(f.store.audit_log(ride.id).expect("audit").len(), 2);
    }
}
