//! Fixtures and fake collaborators shared by unit tests, integration tests
//! and benchmarks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::driver::{DriverState, LocationSample};
use crate::geo::GeoPoint;
use crate::pricing::{Money, Tariff};
use crate::ride::{Ride, RideRequest, RideStatus};
use crate::routing::{straight_line, RouteError, RouteLeg, RouteProvider};
use crate::settlement::{ChargeHandle, GatewayError, PaymentGateway};
use crate::stops::Geocoder;
use crate::types::{
    Availability, DriverId, PassengerId, PaymentMethod, RequestId, RideId, RideKind,
    VehicleClass, VehicleDescriptor,
};

/// Alexanderplatz.
pub const TEST_ORIGIN: GeoPoint = GeoPoint::new(52.5200, 13.4050);
/// Treptower Park, roughly 4 km south-east.
pub const TEST_DESTINATION: GeoPoint = GeoPoint::new(52.5000, 13.4500);

pub const TEST_CLASS: &str = "standard";

/// 3.50 base, 1.20/km, 0.40/min, 5.00 minimum, 4.00 cancellation, 15%.
pub fn standard_tariff() -> Tariff {
    Tariff {
        vehicle_class: VehicleClass::new(TEST_CLASS),
        base_fare: Decimal::new(350, 2),
        per_km: Decimal::new(120, 2),
        per_minute: Decimal::new(40, 2),
        minimum_fare: Decimal::new(500, 2),
        cancellation_fee: Decimal::new(400, 2),
        commission_rate: Decimal::new(15, 2),
    }
}

pub fn test_vehicle() -> VehicleDescriptor {
    VehicleDescriptor {
        class: VehicleClass::new(TEST_CLASS),
        plate: "B-RH 1024".to_string(),
        model: "Skoda Octavia".to_string(),
    }
}

/// An available driver whose last sample is `point` at `now`.
pub fn online_driver(point: GeoPoint, now: DateTime<Utc>) -> DriverState {
    let driver_id = DriverId::new();
    let mut driver = DriverState::new(driver_id, test_vehicle());
    driver.availability = Availability::Available;
    driver.last_location = Some(LocationSample {
        driver_id,
        point,
        heading: None,
        timestamp: now,
    });
    driver
}

pub fn test_request(passenger_id: PassengerId, now: DateTime<Utc>) -> RideRequest {
    RideRequest {
        id: RequestId::new(),
        passenger_id,
        kind: RideKind::Now,
        origin: TEST_ORIGIN,
        destination: Some(TEST_DESTINATION),
        vehicle_class: VehicleClass::new(TEST_CLASS),
        payment_method: PaymentMethod::Online,
        created_at: now,
    }
}

/// A ride from [`TEST_ORIGIN`] to [`TEST_DESTINATION`] already held by
/// `driver_id` in `status`, estimated at 4 km and 10 minutes.
pub fn assigned_ride(driver_id: DriverId, status: RideStatus, now: DateTime<Utc>) -> Ride {
    let tariff = standard_tariff();
    let estimated_distance_m = 4_000.0;
    let estimated_duration_s = 600.0;
    Ride {
        id: RideId::new(),
        request_id: RequestId::new(),
        kind: RideKind::Now,
        status,
        passenger_id: PassengerId::new(),
        driver_id: Some(driver_id),
        origin: TEST_ORIGIN,
        destination: Some(TEST_DESTINATION),
        stops: Vec::new(),
        vehicle_class: tariff.vehicle_class.clone(),
        payment_method: PaymentMethod::Online,
        estimated_fare: tariff.trip_fare(estimated_distance_m, estimated_duration_s),
        tariff,
        actual_fare: None,
        estimated_distance_m,
        estimated_duration_s,
        actual_distance_m: None,
        actual_duration_s: None,
        pickup_pin: "4711".to_string(),
        cancel_reason: None,
        cancelled_from: None,
        created_at: now,
        updated_at: now,
        assigned_at: Some(now),
        started_at: (status == RideStatus::InProgress).then_some(now),
        finished_at: None,
        version: 0,
    }
}

type RouteKey = Vec<(i64, i64)>;

fn route_key(points: &[GeoPoint]) -> RouteKey {
    points.iter().map(|point| point.rounded_key(6)).collect()
}

/// Route provider answering from a script. Unscripted routes are straight
/// lines at 40 km/h unless told to fail.
#[derive(Debug, Default)]
pub struct ScriptedRouteProvider {
    routes: Mutex<HashMap<RouteKey, RouteLeg>>,
    fail_unscripted: AtomicBool,
    fail_all: AtomicBool,
    calls: AtomicUsize,
}

impl ScriptedRouteProvider {
    pub fn script(&self, points: &[GeoPoint], distance_m: f64, duration_s: f64) {
        let leg = RouteLeg {
            distance_m,
            duration_s,
            polyline: crate::geo::encode_polyline(points),
        };
        self.routes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(route_key(points), leg);
    }

    pub fn fail_unscripted(&self, fail: bool) {
        self.fail_unscripted.store(fail, Ordering::SeqCst);
    }

    /// Every call fails with a transport error, as if the provider were down.
    pub fn fail_all(&self, fail: bool) {
        self.fail_all.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl RouteProvider for ScriptedRouteProvider {
    fn route(&self, points: &[GeoPoint]) -> Result<RouteLeg, RouteError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_all.load(Ordering::SeqCst) {
            return Err(RouteError::Transport("provider down".to_string()));
        }
        let scripted = self
            .routes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&route_key(points))
            .cloned();
        match scripted {
            Some(leg) => Ok(leg),
            None if self.fail_unscripted.load(Ordering::SeqCst) => Err(RouteError::NoRoute),
            None => Ok(straight_line(points, 40.0)),
        }
    }
}

/// Gateway that records every charge request.
#[derive(Debug, Default)]
pub struct RecordingGateway {
    charges: Mutex<Vec<(Money, String)>>,
    failing: AtomicBool,
}

impl RecordingGateway {
    /// While set, every charge fails with a transport error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Successful charges as `(amount, reference)`.
    pub fn charges(&self) -> Vec<(Money, String)> {
        self.charges
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl PaymentGateway for RecordingGateway {
    fn create_charge(&self, amount: Money, reference: &str) -> Result<ChargeHandle, GatewayError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(GatewayError::Transport("connection reset".to_string()));
        }
        self.charges
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((amount, reference.to_string()));
        Ok(ChargeHandle {
            reference: reference.to_string(),
            redirect_url: format!("https://pay.example.test/checkout/{reference}"),
        })
    }
}

/// Geocoder backed by a fixed address table.
#[derive(Debug, Default, Clone)]
pub struct StaticGeocoder {
    places: HashMap<String, GeoPoint>,
}

impl StaticGeocoder {
    pub fn with(mut self, address: &str, point: GeoPoint) -> Self {
        self.places.insert(address.to_lowercase(), point);
        self
    }
}

impl Geocoder for StaticGeocoder {
    fn geocode(&self, address: &str) -> Option<GeoPoint> {
        self.places.get(&address.trim().to_lowercase()).copied()
    }
}
