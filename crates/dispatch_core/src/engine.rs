//! The engine facade: one entry point per operation exposed to the service
//! layer, wired from the components in this crate.
//!
//! Besides forwarding, the facade owns the cross-component follow-ups:
//! a location report from a driver on a ride publishes the position,
//! detects approach to pickup and refreshes the ETA; a ride that ends is
//! settled; a passenger cancelling a searching ride withdraws its offer.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::{secs, EngineConfig};
use crate::driver::DriverState;
use crate::error::{DispatchError, DispatchResult, StoreError};
use crate::events::{DriverEvent, EventBus, RideEvent};
use crate::geo::{haversine_m, GeoPoint};
use crate::location::LocationIngest;
use crate::matching::{
    CandidateRanking, DispatchMatcher, DistanceRanking, EtaRanking, ExpirySweep, Offer,
};
use crate::pricing::{Money, TariffSource};
use crate::ride::{AuditEntry, CancelReason, Ride, RideRequest, RideStatus, TripActuals};
use crate::routing::{RouteEstimate, RouteEstimator, RouteProvider, StraightLineRouteProvider};
use crate::settlement::{PaymentGateway, ReconcileReport, SettlementEngine, SettlementRecord};
use crate::spatial::GeoIndex;
use crate::state_machine::RideStateMachine;
use crate::stops::{Geocoder, StopPlanner, StopRequest, UpdatedRide};
use crate::store::{MemoryStore, Store};
use crate::telemetry::{DispatchTelemetry, TelemetrySnapshot};
use crate::types::{Availability, DriverId, OfferId, PassengerId, RideId, VehicleDescriptor};

/// A ride that reached a terminal status, with its settlement if one could be
/// opened right away.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClosedRide {
    pub ride: Ride,
    pub settlement: Option<SettlementRecord>,
}

/// What one maintenance pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub expiry: ExpirySweep,
    pub stale_searches_cancelled: usize,
    pub offers_purged: usize,
    pub reconcile: ReconcileReport,
}

pub struct EngineBuilder {
    config: EngineConfig,
    tariffs: Arc<dyn TariffSource>,
    gateway: Arc<dyn PaymentGateway>,
    store: Option<Arc<dyn Store>>,
    clock: Option<Arc<dyn Clock>>,
    route_provider: Option<Arc<dyn RouteProvider>>,
    geocoder: Option<Arc<dyn Geocoder>>,
    road_ranking: bool,
}

impl EngineBuilder {
    pub fn new(tariffs: Arc<dyn TariffSource>, gateway: Arc<dyn PaymentGateway>) -> Self {
        Self {
            config: EngineConfig::default(),
            tariffs,
            gateway,
            store: None,
            clock: None,
            route_provider: None,
            geocoder: None,
            road_ranking: true,
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn route_provider(mut self, provider: Arc<dyn RouteProvider>) -> Self {
        self.route_provider = Some(provider);
        self
    }

    pub fn geocoder(mut self, geocoder: Arc<dyn Geocoder>) -> Self {
        self.geocoder = Some(geocoder);
        self
    }

    /// Rank candidates by straight-line distance instead of road ETA.
    pub fn distance_ranking(mut self) -> Self {
        self.road_ranking = false;
        self
    }

    pub fn build(self) -> DispatchEngine {
        let config = self.config;
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()) as Arc<dyn Store>);
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock) as Arc<dyn Clock>);
        let provider = self.route_provider.unwrap_or_else(|| {
            Arc::new(StraightLineRouteProvider {
                speed_kmh: config.routing.fallback_speed_kmh,
            }) as Arc<dyn RouteProvider>
        });
        let index = Arc::new(GeoIndex::with_resolution(config.dispatch.h3_resolution));
        let events = Arc::new(EventBus::new());
        let telemetry = Arc::new(DispatchTelemetry::default());

        let estimator = Arc::new(RouteEstimator::new(
            provider,
            clock.clone(),
            telemetry.clone(),
            config.routing.clone(),
        ));
        let ranking: Arc<dyn CandidateRanking> = if self.road_ranking {
            Arc::new(EtaRanking::new(estimator.clone()))
        } else {
            Arc::new(DistanceRanking)
        };
        let locations = LocationIngest::new(
            store.clone(),
            index.clone(),
            clock.clone(),
            telemetry.clone(),
            config.location.clone(),
        );
        let rides = Arc::new(RideStateMachine::new(
            store.clone(),
            index.clone(),
            clock.clone(),
            events.clone(),
            telemetry.clone(),
            config.trip.clone(),
        ));
        let matcher = DispatchMatcher::new(
            store.clone(),
            index.clone(),
            rides.clone(),
            ranking,
            estimator.clone(),
            self.tariffs,
            clock.clone(),
            events.clone(),
            telemetry.clone(),
            config.dispatch.clone(),
        );
        let stops = StopPlanner::new(
            store.clone(),
            estimator.clone(),
            self.geocoder,
            clock.clone(),
            events.clone(),
            telemetry.clone(),
            config.trip.clone(),
        );
        let settlement = SettlementEngine::new(
            store.clone(),
            self.gateway,
            clock.clone(),
            telemetry.clone(),
            config.settlement.clone(),
        );

        DispatchEngine {
            store,
            index,
            clock,
            events,
            telemetry,
            estimator,
            locations,
            rides,
            matcher,
            stops,
            settlement,
            last_reconcile: Mutex::new(None),
            config,
        }
    }
}

pub struct DispatchEngine {
    store: Arc<dyn Store>,
    index: Arc<GeoIndex>,
    clock: Arc<dyn Clock>,
    events: Arc<EventBus>,
    telemetry: Arc<DispatchTelemetry>,
    estimator: Arc<RouteEstimator>,
    locations: LocationIngest,
    rides: Arc<RideStateMachine>,
    matcher: DispatchMatcher,
    stops: StopPlanner,
    settlement: SettlementEngine,
    last_reconcile: Mutex<Option<DateTime<Utc>>>,
    config: EngineConfig,
}

impl DispatchEngine {
    pub fn builder(
        tariffs: Arc<dyn TariffSource>,
        gateway: Arc<dyn PaymentGateway>,
    ) -> EngineBuilder {
        EngineBuilder::new(tariffs, gateway)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // Drivers

    /// Registers a driver as offline. Registering a known driver returns the
    /// stored row untouched.
    pub fn register_driver(
        &self,
        driver_id: DriverId,
        vehicle: VehicleDescriptor,
    ) -> DispatchResult<DriverState> {
        match self.store.driver(driver_id) {
            Ok(existing) => return Ok(existing),
            Err(StoreError::NotFound { .. }) => {}
            Err(err) => return Err(err.into()),
        }
        let driver = DriverState::new(driver_id, vehicle);
        self.store.upsert_driver(driver.clone())?;
        info!(%driver_id, class = %driver.vehicle.class, "driver registered");
        Ok(driver)
    }

    pub fn driver(&self, driver_id: DriverId) -> DispatchResult<DriverState> {
        Ok(self.store.driver(driver_id)?)
    }

    pub fn go_online(&self, driver_id: DriverId) -> DispatchResult<DriverState> {
        let current = self.store.driver(driver_id)?;
        if current.availability == Availability::Available {
            return Ok(current);
        }
        let driver = self
            .store
            .set_availability(driver_id, Availability::Offline, Availability::Available)
            .map_err(|err| unavailable_on_conflict(err, driver_id))?;
        if let Some(sample) = driver.last_location {
            self.index
                .upsert(driver_id, sample.point, Availability::Available, sample.timestamp);
        }
        info!(%driver_id, "driver online");
        Ok(driver)
    }

    /// Refused while the driver is on a trip or holds a pending offer.
    pub fn go_offline(&self, driver_id: DriverId) -> DispatchResult<DriverState> {
        let current = self.store.driver(driver_id)?;
        if current.availability == Availability::Offline {
            return Ok(current);
        }
        let driver = self
            .store
            .set_availability(driver_id, Availability::Available, Availability::Offline)
            .map_err(|err| unavailable_on_conflict(err, driver_id))?;
        self.index.remove(driver_id);
        self.estimator.forget_driver(driver_id);
        info!(%driver_id, "driver offline");
        Ok(driver)
    }

    /// Applies a position report, then updates the ride the driver serves.
    ///
    /// Follow-up failures (publishing, ETA, approach detection) are logged;
    /// the sample itself has been accepted by then.
    pub fn report_location(
        &self,
        driver_id: DriverId,
        point: GeoPoint,
        heading: Option<f64>,
        timestamp: DateTime<Utc>,
    ) -> DispatchResult<DriverState> {
        let driver = self.locations.report(driver_id, point, heading, timestamp)?;
        if let Some(ride_id) = driver.current_ride {
            if let Err(err) = self.follow_ride(ride_id, driver_id, point, heading, timestamp) {
                warn!(%ride_id, %driver_id, error = %err, "ride update after location report failed");
            }
        }
        Ok(driver)
    }

    fn follow_ride(
        &self,
        ride_id: RideId,
        driver_id: DriverId,
        point: GeoPoint,
        heading: Option<f64>,
        at: DateTime<Utc>,
    ) -> DispatchResult<()> {
        let mut ride = self.store.ride(ride_id)?;
        if !ride.is_assigned_to(driver_id) || !ride.status.holds_driver() {
            return Ok(());
        }
        self.events.publish_ride(
            ride_id,
            RideEvent::DriverLocation {
                ride_id,
                driver_id,
                point,
                heading,
                at,
            },
        );

        if ride.status == RideStatus::DriverAssigned
            && haversine_m(point, ride.origin) <= self.config.location.approach_radius_m
        {
            match self.rides.mark_approaching(ride_id, driver_id) {
                Ok(updated) => ride = updated,
                Err(DispatchError::InvalidTransition { status, .. }) => {
                    debug!(%ride_id, %status, "approach already recorded");
                }
                Err(err) => return Err(err),
            }
        }

        let Some(target) = ride.next_waypoint() else {
            return Ok(());
        };
        if !self.estimator.try_begin_refresh(driver_id) {
            return Ok(());
        }
        let estimate = self.estimator.estimate_or_fallback(&[point, target])?;
        self.events.publish_ride(
            ride_id,
            RideEvent::EtaUpdated {
                ride_id,
                eta_s: estimate.duration_s,
                distance_m: estimate.distance_m,
                at: self.clock.now(),
            },
        );
        Ok(())
    }

    /// Repopulates the geo index from stored driver rows, e.g. after a
    /// restart.
    pub fn rebuild_geo_index(&self) -> DispatchResult<usize> {
        let drivers = self.store.drivers()?;
        let indexed = self.index.rebuild(drivers.iter());
        info!(indexed, "geo index rebuilt");
        Ok(indexed)
    }

    // Matching

    pub fn request_ride(&self, request: RideRequest) -> DispatchResult<Offer> {
        self.matcher.dispatch(request)
    }

    pub fn accept_offer(&self, offer_id: OfferId, driver_id: DriverId) -> DispatchResult<Ride> {
        self.matcher.accept(offer_id, driver_id)
    }

    pub fn decline_offer(&self, offer_id: OfferId, driver_id: DriverId) -> DispatchResult<Offer> {
        self.matcher.decline(offer_id, driver_id)
    }

    pub fn offer(&self, offer_id: OfferId) -> DispatchResult<Offer> {
        Ok(self.store.offer(offer_id)?)
    }

    /// Route figures for display; degrades to a straight line.
    pub fn estimate_route(&self, points: &[GeoPoint]) -> DispatchResult<RouteEstimate> {
        self.estimator.estimate_or_fallback(points)
    }

    // Ride lifecycle

    pub fn ride(&self, ride_id: RideId) -> DispatchResult<Ride> {
        self.rides.ride(ride_id)
    }

    pub fn audit_log(&self, ride_id: RideId) -> DispatchResult<Vec<AuditEntry>> {
        self.rides.audit_log(ride_id)
    }

    pub fn mark_approaching(&self, ride_id: RideId, driver_id: DriverId) -> DispatchResult<Ride> {
        self.rides.mark_approaching(ride_id, driver_id)
    }

    pub fn mark_arrived(&self, ride_id: RideId, driver_id: DriverId) -> DispatchResult<Ride> {
        self.rides.mark_arrived(ride_id, driver_id)
    }

    pub fn start_trip(
        &self,
        ride_id: RideId,
        driver_id: DriverId,
        pickup_pin: Option<&str>,
    ) -> DispatchResult<Ride> {
        self.rides.start_trip(ride_id, driver_id, pickup_pin)
    }

    pub fn complete_next_stop(&self, ride_id: RideId, driver_id: DriverId) -> DispatchResult<Ride> {
        self.rides.complete_next_stop(ride_id, driver_id)
    }

    pub fn finish_trip(
        &self,
        ride_id: RideId,
        driver_id: DriverId,
        actuals: TripActuals,
    ) -> DispatchResult<ClosedRide> {
        let ride = self.rides.finish_trip(ride_id, driver_id, actuals)?;
        Ok(self.close(ride))
    }

    pub fn cancel_by_passenger(
        &self,
        ride_id: RideId,
        passenger_id: PassengerId,
        note: Option<String>,
    ) -> DispatchResult<ClosedRide> {
        let ride = self.rides.cancel_by_passenger(ride_id, passenger_id, note)?;
        Ok(self.close(ride))
    }

    pub fn cancel_by_driver(
        &self,
        ride_id: RideId,
        driver_id: DriverId,
        note: Option<String>,
    ) -> DispatchResult<ClosedRide> {
        let ride = self.rides.cancel_by_driver(ride_id, driver_id, note)?;
        Ok(self.close(ride))
    }

    pub fn cancel_by_system(
        &self,
        ride_id: RideId,
        reason: CancelReason,
    ) -> DispatchResult<ClosedRide> {
        let ride = self.rides.cancel_by_system(ride_id, reason)?;
        Ok(self.close(ride))
    }

    /// Follow-ups once a ride is terminal. Settlement failures leave the
    /// record for the reconciliation sweep.
    fn close(&self, ride: Ride) -> ClosedRide {
        if ride.cancelled_from == Some(RideStatus::Searching) {
            if let Err(err) = self.matcher.abandon_search(ride.id) {
                warn!(ride_id = %ride.id, error = %err, "withdrawing offers of cancelled ride failed");
            }
        }
        if let Some(driver_id) = ride.driver_id {
            self.estimator.forget_driver(driver_id);
        }
        let settlement = match self.settlement.settle(ride.id) {
            Ok(record) => Some(record),
            Err(err) => {
                warn!(ride_id = %ride.id, error = %err, "settlement deferred to reconciliation");
                self.settlement.settlement(ride.id).ok().flatten()
            }
        };
        ClosedRide { ride, settlement }
    }

    pub fn add_stop(
        &self,
        ride_id: RideId,
        passenger_id: PassengerId,
        request: StopRequest,
    ) -> DispatchResult<UpdatedRide> {
        self.stops.add_stop(ride_id, passenger_id, request)
    }

    // Money

    pub fn settle(&self, ride_id: RideId) -> DispatchResult<SettlementRecord> {
        self.settlement.settle(ride_id)
    }

    pub fn settlement(&self, ride_id: RideId) -> DispatchResult<Option<SettlementRecord>> {
        self.settlement.settlement(ride_id)
    }

    /// Gateway webhook.
    pub fn confirm_payment(
        &self,
        reference: &str,
        amount: Money,
    ) -> DispatchResult<SettlementRecord> {
        self.settlement.confirm_payment(reference, amount)
    }

    pub fn top_up_wallet(&self, passenger_id: PassengerId, amount: Money) -> DispatchResult<Money> {
        if amount <= Money::ZERO {
            return Err(DispatchError::InvalidRequest(format!(
                "top-up amount must be positive, got {amount}"
            )));
        }
        Ok(self.store.credit_wallet(passenger_id, amount)?)
    }

    pub fn wallet_balance(&self, passenger_id: PassengerId) -> DispatchResult<Money> {
        Ok(self.store.wallet_balance(passenger_id)?)
    }

    pub fn driver_debt(&self, driver_id: DriverId) -> DispatchResult<Money> {
        Ok(self.store.driver_debt(driver_id)?)
    }

    // Realtime and operations

    pub fn subscribe_ride(&self, ride_id: RideId) -> broadcast::Receiver<RideEvent> {
        self.events.subscribe_ride(ride_id)
    }

    pub fn subscribe_driver(&self, driver_id: DriverId) -> broadcast::Receiver<DriverEvent> {
        self.events.subscribe_driver(driver_id)
    }

    pub fn telemetry(&self) -> TelemetrySnapshot {
        self.telemetry.snapshot()
    }

    /// Offer expiry, search timeouts and offer purge on every call;
    /// settlement reconciliation at most once per reconcile interval. Meant
    /// to run every few seconds.
    pub fn run_maintenance(&self) -> DispatchResult<MaintenanceReport> {
        let mut report = MaintenanceReport {
            expiry: self.matcher.expire_offers()?,
            stale_searches_cancelled: self.matcher.cancel_stale_searches()?,
            offers_purged: self.matcher.purge_resolved_offers()?,
            ..MaintenanceReport::default()
        };
        if self.reconcile_due() {
            report.reconcile = self.settlement.reconcile()?;
        }
        if report != MaintenanceReport::default() {
            debug!(?report, "maintenance pass");
        }
        Ok(report)
    }
}

impl DispatchEngine {
    fn reconcile_due(&self) -> bool {
        let now = self.clock.now();
        let mut last = self
            .last_reconcile
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let interval = secs(self.config.settlement.reconcile_interval_secs);
        match *last {
            Some(previous) if now - previous < interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

fn unavailable_on_conflict(err: StoreError, driver_id: DriverId) -> DispatchError {
    match err {
        StoreError::VersionConflict { .. } => DispatchError::DriverUnavailable { driver_id },
        other => other.into(),
    }
}
