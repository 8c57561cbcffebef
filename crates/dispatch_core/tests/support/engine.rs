use std::sync::Arc;

use chrono::{DateTime, Utc};
use dispatch_core::clock::{Clock, ManualClock};
use dispatch_core::config::{
    DispatchConfig, EngineConfig, RetryConfig, RouteConfig, SettlementConfig,
    TripConfig,
};
use dispatch_core::geo::GeoPoint;
use dispatch_core::matching::Offer;
use dispatch_core::pricing::{Tariff, TariffBook};
use dispatch_core::ride::{Ride, RideRequest, RideStatus, TripActuals};
use dispatch_core::store::MemoryStore;
use dispatch_core::test_helpers::{
    standard_tariff, test_request, test_vehicle, RecordingGateway, ScriptedRouteProvider,
    StaticGeocoder, TEST_ORIGIN,
};
use dispatch_core::types::{DriverId, PassengerId};
use dispatch_core::DispatchEngine;

/// A point `metres` north of the test pickup.
pub fn north_of_origin(metres: f64) -> GeoPoint {
    GeoPoint::new(TEST_ORIGIN.lat + metres / 111_000.0, TEST_ORIGIN.lng)
}

/// Builder for engines wired to in-memory and scripted collaborators.
#[derive(Debug, Clone)]
pub struct TestEngineBuilder {
    config: EngineConfig,
    tariff: Tariff,
    geocoder: StaticGeocoder,
}

impl Default for TestEngineBuilder {
    fn default() -> Self {
        Self {
            config: EngineConfig::default()
                .with_routing(RouteConfig {
                    retry: RetryConfig::none(),
                    ..RouteConfig::default()
                })
                .with_trip(TripConfig {
                    arrival_proximity_m: None,
                    ..TripConfig::default()
                }),
            tariff: standard_tariff(),
            geocoder: StaticGeocoder::default(),
        }
    }
}

impl TestEngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dispatch(mut self, dispatch: DispatchConfig) -> Self {
        self.config.dispatch = dispatch;
        self
    }

    pub fn with_trip(mut self, trip: TripConfig) -> Self {
        self.config.trip = trip;
        self
    }

    pub fn with_settlement(mut self, settlement: SettlementConfig) -> Self {
        self.config.settlement = settlement;
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_tariff(mut self, tariff: Tariff) -> Self {
        self.tariff = tariff;
        self
    }

    pub fn with_geocoder(mut self, geocoder: StaticGeocoder) -> Self {
        self.geocoder = geocoder;
        self
    }

    pub fn build(self) -> TestEngine {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(MemoryStore::new());
        let routes = Arc::new(ScriptedRouteProvider::default());
        let gateway = Arc::new(RecordingGateway::default());
        let tariffs = Arc::new(TariffBook::new().with_tariff(self.tariff));
        let engine = DispatchEngine::builder(tariffs.clone(), gateway.clone())
            .config(self.config)
            .store(store.clone())
            .clock(clock.clone())
            .route_provider(routes.clone())
            .geocoder(Arc::new(self.geocoder))
            .build();
        TestEngine {
            engine,
            clock,
            store,
            routes,
            gateway,
            tariffs,
        }
    }
}

pub struct TestEngine {
    pub engine: DispatchEngine,
    pub clock: Arc<ManualClock>,
    pub store: Arc<MemoryStore>,
    pub routes: Arc<ScriptedRouteProvider>,
    pub gateway: Arc<RecordingGateway>,
    pub tariffs: Arc<TariffBook>,
}

impl TestEngine {
    pub fn new() -> Self {
        TestEngineBuilder::default().build()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn advance_secs(&self, secs: i64) {
        self.clock.advance_secs(secs);
    }

    /// Registers a driver, brings them online and reports `point` now.
    pub fn online_driver_at(&self, point: GeoPoint) -> DriverId {
        let driver_id = DriverId::new();
        self.engine
            .register_driver(driver_id, test_vehicle())
            .expect("register");
        self.engine.go_online(driver_id).expect("online");
        self.engine
            .report_location(driver_id, point, None, self.now())
            .expect("first location");
        driver_id
    }

    pub fn request(&self, passenger_id: PassengerId) -> RideRequest {
        test_request(passenger_id, self.now())
    }

    /// Requests a ride for a new passenger; the offer goes out to whoever is
    /// online.
    pub fn dispatch(&self) -> (PassengerId, Offer) {
        let passenger_id = PassengerId::new();
        let offer = self
            .engine
            .request_ride(self.request(passenger_id))
            .expect("offer");
        (passenger_id, offer)
    }

    /// One driver at the pickup, a dispatched ride accepted by them.
    pub fn assigned_ride(&self) -> (Ride, DriverId) {
        let driver_id = self.online_driver_at(north_of_origin(200.0));
        let (_, offer) = self.dispatch();
        let ride = self
            .engine
            .accept_offer(offer.id, driver_id)
            .expect("accept");
        assert_eq!(ride.status, RideStatus::DriverAssigned);
        (ride, driver_id)
    }

    /// Drives an assigned ride up to `in_progress`.
    pub fn start(&self, ride: &Ride, driver_id: DriverId) -> Ride {
        self.engine
            .mark_approaching(ride.id, driver_id)
            .expect("approaching");
        self.engine.mark_arrived(ride.id, driver_id).expect("arrived");
        self.engine
            .start_trip(ride.id, driver_id, Some(ride.pickup_pin.as_str()))
            .expect("started")
    }

    pub fn finish(&self, ride: &Ride, driver_id: DriverId, distance_m: f64, duration_s: f64) -> Ride {
        self.engine
            .finish_trip(
                ride.id,
                driver_id,
                TripActuals {
                    distance_m: Some(distance_m),
                    duration_s: Some(duration_s),
                },
            )
            .expect("finished")
            .ride
    }
}
