mod support;

use std::sync::Barrier;
use std::thread;

use chrono::Duration;
use dispatch_core::error::LocationRejection;
use dispatch_core::geo::GeoPoint;
use dispatch_core::test_helpers::test_vehicle;
use dispatch_core::types::{Availability, DriverId};
use dispatch_core::{DispatchError, StoreError};
use support::engine::{north_of_origin, TestEngine};

#[test]
fn older_sample_never_replaces_a_newer_one() {
    let t = TestEngine::new();
    let driver = t.online_driver_at(north_of_origin(100.0));
    let t0 = t.now();

    t.engine
        .report_location(driver, north_of_origin(150.0), None, t0 + Duration::seconds(10))
        .expect("newer sample");
    let err = t
        .engine
        .report_location(driver, north_of_origin(120.0), None, t0 + Duration::seconds(5))
        .unwrap_err();
    assert!(matches!(err, DispatchError::StaleLocation { driver_id } if driver_id == driver));

    let sample = t
        .engine
        .driver(driver)
        .expect("driver")
        .last_location
        .expect("location");
    assert_eq!(sample.timestamp, t0 + Duration::seconds(10));
    assert_eq!(sample.point, north_of_origin(150.0));
    assert_eq!(t.engine.telemetry().samples_stale, 1);
}

#[test]
fn repeated_timestamp_is_stale() {
    let t = TestEngine::new();
    let driver = t.online_driver_at(north_of_origin(100.0));
    let err = t
        .engine
        .report_location(driver, north_of_origin(110.0), None, t.now())
        .unwrap_err();
    assert!(matches!(err, DispatchError::StaleLocation { .. }));
}

#[test]
fn concurrent_reports_settle_on_the_latest_timestamp() {
    let t = TestEngine::new();
    let driver = t.online_driver_at(north_of_origin(100.0));
    let t0 = t.now();
    let offsets: Vec<i64> = (1..=8).rev().collect();
    let barrier = Barrier::new(offsets.len());

    thread::scope(|scope| {
        for offset in &offsets {
            let barrier = &barrier;
            let engine = &t.engine;
            let at = t0 + Duration::seconds(*offset);
            let point = north_of_origin(100.0 + *offset as f64);
            scope.spawn(move || {
                barrier.wait();
                // Losing the race is fine; the sample is just stale.
                let _ = engine.report_location(driver, point, None, at);
            });
        }
    });

    let sample = t
        .engine
        .driver(driver)
        .expect("driver")
        .last_location
        .expect("location");
    assert_eq!(sample.timestamp, t0 + Duration::seconds(8));
    assert_eq!(sample.point, north_of_origin(108.0));
}

#[test]
fn teleporting_driver_is_rejected() {
    let t = TestEngine::new();
    let driver = t.online_driver_at(north_of_origin(100.0));
    t.advance_secs(10);

    // 10 km in 10 s.
    let err = t
        .engine
        .report_location(driver, north_of_origin(10_100.0), None, t.now())
        .unwrap_err();
    assert!(matches!(
        err,
        DispatchError::ImplausibleLocation {
            reason: LocationRejection::TooFast { .. },
            ..
        }
    ));
    assert_eq!(
        t.engine.driver(driver).expect("driver").position(),
        Some(north_of_origin(100.0))
    );
    assert_eq!(t.engine.telemetry().samples_implausible, 1);
}

#[test]
fn invalid_coordinates_and_future_samples_are_rejected() {
    let t = TestEngine::new();
    let driver = t.online_driver_at(north_of_origin(100.0));

    let err = t
        .engine
        .report_location(driver, GeoPoint::new(95.0, 13.4), None, t.now() + Duration::seconds(1))
        .unwrap_err();
    assert!(matches!(
        err,
        DispatchError::ImplausibleLocation {
            reason: LocationRejection::InvalidCoordinates,
            ..
        }
    ));

    let err = t
        .engine
        .report_location(driver, north_of_origin(100.0), None, t.now() + Duration::minutes(5))
        .unwrap_err();
    assert!(matches!(
        err,
        DispatchError::ImplausibleLocation {
            reason: LocationRejection::FromTheFuture { .. },
            ..
        }
    ));
}

#[test]
fn unknown_driver_cannot_report() {
    let t = TestEngine::new();
    let err = t
        .engine
        .report_location(DriverId::new(), north_of_origin(100.0), None, t.now())
        .unwrap_err();
    assert!(matches!(
        err,
        DispatchError::Storage(StoreError::NotFound { .. })
    ));
}

#[test]
fn geo_index_is_rebuilt_from_stored_drivers() {
    let t = TestEngine::new();
    t.online_driver_at(north_of_origin(100.0));
    t.online_driver_at(north_of_origin(300.0));
    let resting = t.online_driver_at(north_of_origin(500.0));
    t.engine.go_offline(resting).expect("offline");

    // Registered but never reported a position.
    let silent = DriverId::new();
    t.engine
        .register_driver(silent, test_vehicle())
        .expect("register");
    t.engine.go_online(silent).expect("online");

    assert_eq!(t.engine.rebuild_geo_index().expect("rebuild"), 2);
    assert_eq!(
        t.engine.driver(resting).expect("driver").availability,
        Availability::Offline
    );
    let (_, offer) = t.dispatch();
    assert_eq!(offer.candidates.len(), 2);
}
