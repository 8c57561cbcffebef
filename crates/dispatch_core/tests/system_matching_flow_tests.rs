mod support;

use std::sync::Barrier;
use std::thread;

use dispatch_core::config::DispatchConfig;
use dispatch_core::matching::OfferStatus;
use dispatch_core::pricing::Tariff;
use dispatch_core::ride::{CancelReason, RideStatus};
use dispatch_core::store::{SearchWrite, Store};
use dispatch_core::test_helpers::{standard_tariff, test_vehicle};
use dispatch_core::types::{Availability, DriverId, PassengerId, VehicleClass, VehicleDescriptor};
use dispatch_core::DispatchError;
use support::engine::{north_of_origin, TestEngine, TestEngineBuilder};

#[test]
fn concurrent_accepts_have_exactly_one_winner() {
    let t = TestEngine::new();
    let drivers = [
        t.online_driver_at(north_of_origin(150.0)),
        t.online_driver_at(north_of_origin(400.0)),
        t.online_driver_at(north_of_origin(900.0)),
    ];
    let (_, offer) = t.dispatch();
    assert_eq!(offer.candidates.len(), 3);

    let racers = [drivers[0], drivers[1]];
    let barrier = Barrier::new(racers.len());
    let results: Vec<_> = thread::scope(|scope| {
        let handles: Vec<_> = racers
            .iter()
            .map(|driver_id| {
                let barrier = &barrier;
                let engine = &t.engine;
                let offer_id = offer.id;
                let driver_id = *driver_id;
                scope.spawn(move || {
                    barrier.wait();
                    (driver_id, engine.accept_offer(offer_id, driver_id))
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("racer thread"))
            .collect()
    });

    let winners: Vec<_> = results.iter().filter(|(_, result)| result.is_ok()).collect();
    assert_eq!(winners.len(), 1);
    let winner = winners[0].0;
    let (loser, lost) = results
        .iter()
        .find(|(driver_id, _)| *driver_id != winner)
        .expect("loser");
    assert!(matches!(lost, Err(DispatchError::AlreadyTaken { .. })));

    let ride = t.engine.ride(offer.ride_id).expect("ride");
    assert_eq!(ride.status, RideStatus::DriverAssigned);
    assert_eq!(ride.driver_id, Some(winner));

    let loser_state = t.engine.driver(*loser).expect("loser");
    assert_eq!(loser_state.availability, Availability::Available);
    assert_eq!(loser_state.pending_offer, None);
    let bystander = t.engine.driver(drivers[2]).expect("bystander");
    assert_eq!(bystander.availability, Availability::Available);
    assert_eq!(bystander.pending_offer, None);
    assert_eq!(
        t.engine.driver(winner).expect("winner").availability,
        Availability::OnTrip
    );

    let telemetry = t.engine.telemetry();
    assert_eq!(telemetry.accepts_won, 1);
    assert_eq!(telemetry.accepts_lost, 1);
}

#[test]
fn late_accept_after_resolution_is_already_taken() {
    let t = TestEngine::new();
    let first = t.online_driver_at(north_of_origin(150.0));
    let second = t.online_driver_at(north_of_origin(300.0));
    let (_, offer) = t.dispatch();

    t.engine.accept_offer(offer.id, first).expect("first accept");
    let err = t.engine.accept_offer(offer.id, second).unwrap_err();
    assert!(matches!(err, DispatchError::AlreadyTaken { .. }));
    assert_eq!(
        t.engine.offer(offer.id).expect("offer").status,
        OfferStatus::Accepted
    );
}

#[test]
fn non_candidate_cannot_accept() {
    let t = TestEngine::new();
    t.online_driver_at(north_of_origin(150.0));
    let (_, offer) = t.dispatch();
    // Came online after the broadcast.
    let outsider = t.online_driver_at(north_of_origin(100.0));

    let err = t.engine.accept_offer(offer.id, outsider).unwrap_err();
    assert!(matches!(err, DispatchError::NotACandidate { .. }));
}

#[test]
fn decline_moves_the_ride_to_the_next_driver() {
    let t = TestEngineBuilder::new()
        .with_dispatch(DispatchConfig::default().with_candidates_per_round(1))
        .build();
    let near = t.online_driver_at(north_of_origin(200.0));
    let far = t.online_driver_at(north_of_origin(800.0));

    let (_, offer) = t.dispatch();
    assert_eq!(offer.candidates, vec![near]);

    t.engine.decline_offer(offer.id, near).expect("decline");
    assert_eq!(
        t.engine.offer(offer.id).expect("offer").status,
        OfferStatus::Expired
    );

    let search = t
        .store
        .search(offer.ride_id)
        .expect("search")
        .expect("still searching");
    assert_eq!(search.round, 2);
    assert!(search.excluded.contains(&near));
    let next = t
        .engine
        .offer(search.current_offer.expect("next offer"))
        .expect("offer");
    assert_eq!(next.candidates, vec![far]);

    let ride = t.engine.accept_offer(next.id, far).expect("accept");
    assert_eq!(ride.driver_id, Some(far));
    assert_eq!(t.engine.telemetry().offers_declined, 1);
}

#[test]
fn unanswered_rounds_end_in_no_drivers_found() {
    let t = TestEngineBuilder::new()
        .with_dispatch(DispatchConfig::default().with_candidates_per_round(1))
        .build();
    for metres in [200.0, 500.0, 900.0] {
        t.online_driver_at(north_of_origin(metres));
    }
    let (_, offer) = t.dispatch();
    let ride_id = offer.ride_id;

    // Windows are 18 s, 22 s and 26 s.
    for (round, window) in [(1u32, 18), (2, 22), (3, 26)] {
        let search = t.store.search(ride_id).expect("search").expect("searching");
        assert_eq!(search.round, round);
        t.advance_secs(window);
        let report = t.engine.run_maintenance().expect("maintenance");
        assert_eq!(report.expiry.offers_expired, 1);
    }

    let ride = t.engine.ride(ride_id).expect("ride");
    assert_eq!(ride.status, RideStatus::Cancelled);
    assert_eq!(ride.cancel_reason, Some(CancelReason::NoDriversFound));
    assert_eq!(ride.driver_id, None);
    assert_eq!(t.store.search(ride_id).expect("search"), None);
    assert_eq!(t.engine.telemetry().no_driver_cancellations, 1);
}

#[test]
fn request_with_nobody_online_is_cancelled_immediately() {
    let t = TestEngine::new();
    let err = t
        .engine
        .request_ride(t.request(PassengerId::new()))
        .unwrap_err();
    let DispatchError::NoDriversAvailable { ride_id } = err else {
        panic!("expected NoDriversAvailable, got {err:?}");
    };
    let ride = t.engine.ride(ride_id).expect("ride");
    assert_eq!(ride.status, RideStatus::Cancelled);
    assert_eq!(ride.cancel_reason, Some(CancelReason::NoDriversFound));
}

#[test]
fn drivers_beyond_the_first_radius_are_reached_in_later_rounds() {
    let t = TestEngine::new();
    // Outside 3 km, inside the 4.5 km second round.
    let distant = t.online_driver_at(north_of_origin(4_000.0));
    let (_, offer) = t.dispatch();
    assert_eq!(offer.round, 2);
    assert_eq!(offer.candidates, vec![distant]);
}

#[test]
fn driver_with_pending_offer_cannot_go_offline() {
    let t = TestEngine::new();
    let driver = t.online_driver_at(north_of_origin(200.0));
    let (_, offer) = t.dispatch();
    assert!(matches!(
        t.engine.go_offline(driver),
        Err(DispatchError::DriverUnavailable { .. })
    ));

    t.engine.decline_offer(offer.id, driver).expect("decline");
    let state = t.engine.go_offline(driver).expect("offline");
    assert_eq!(state.availability, Availability::Offline);
}

#[test]
fn passenger_cancel_while_searching_withdraws_the_offer() {
    let t = TestEngine::new();
    let driver = t.online_driver_at(north_of_origin(200.0));
    let (passenger, offer) = t.dispatch();

    let closed = t
        .engine
        .cancel_by_passenger(offer.ride_id, passenger, Some("changed plans".into()))
        .expect("cancel");
    assert_eq!(closed.ride.status, RideStatus::CancelledByPassenger);
    assert_eq!(
        t.engine.offer(offer.id).expect("offer").status,
        OfferStatus::Withdrawn
    );
    assert_eq!(t.engine.driver(driver).expect("driver").pending_offer, None);
    let settlement = closed.settlement.expect("settlement");
    assert!(settlement.total.is_zero());

    let err = t.engine.accept_offer(offer.id, driver).unwrap_err();
    assert!(matches!(err, DispatchError::OfferExpired { .. }));
}

/// Fills the candidate pool with drivers within 200 m of the pickup.
fn crowd_pickup(t: &TestEngine) -> Vec<DriverId> {
    (1..=15)
        .map(|step| t.online_driver_at(north_of_origin(12.0 * step as f64)))
        .collect()
}

#[test]
fn drivers_holding_offers_do_not_crowd_out_a_free_driver() {
    let t = TestEngine::new();
    let crowd = crowd_pickup(&t);
    for _ in 0..3 {
        t.dispatch();
    }
    assert!(crowd
        .iter()
        .all(|driver| t.engine.driver(*driver).expect("driver").pending_offer.is_some()));

    let free = t.online_driver_at(north_of_origin(1_000.0));
    let (_, offer) = t.dispatch();
    assert_eq!(offer.round, 1);
    assert_eq!(offer.candidates, vec![free]);
    assert_eq!(
        t.engine.driver(free).expect("driver").pending_offer,
        Some(offer.id)
    );
}

#[test]
fn drivers_of_another_class_do_not_crowd_out_a_match() {
    let t = TestEngine::new();
    let premium_class = VehicleClass::new("premium");
    t.tariffs.set_tariff(Tariff {
        vehicle_class: premium_class.clone(),
        ..standard_tariff()
    });
    crowd_pickup(&t);

    let premium = DriverId::new();
    t.engine
        .register_driver(
            premium,
            VehicleDescriptor {
                class: premium_class.clone(),
                ..test_vehicle()
            },
        )
        .expect("register");
    t.engine.go_online(premium).expect("online");
    t.engine
        .report_location(premium, north_of_origin(1_000.0), None, t.now())
        .expect("location");

    let mut request = t.request(PassengerId::new());
    request.vehicle_class = premium_class;
    let offer = t.engine.request_ride(request).expect("offer");
    assert_eq!(offer.candidates, vec![premium]);
}

#[test]
fn stale_search_snapshot_cannot_overwrite_a_newer_round() {
    let t = TestEngineBuilder::new()
        .with_dispatch(DispatchConfig::default().with_candidates_per_round(1))
        .build();
    let near = t.online_driver_at(north_of_origin(200.0));
    let far = t.online_driver_at(north_of_origin(800.0));
    let (_, first) = t.dispatch();
    let ride_id = first.ride_id;
    let mut snapshot = t.store.search(ride_id).expect("search").expect("searching");
    assert_eq!(snapshot.current_offer, Some(first.id));

    t.advance_secs(18);
    let report = t.engine.run_maintenance().expect("maintenance");
    assert_eq!(report.expiry.rebroadcasts, 1);
    let current = t.store.search(ride_id).expect("search").expect("searching");
    assert_eq!(current.round, 2);
    assert!(current.version > snapshot.version);

    snapshot.excluded.insert(near);
    assert_eq!(
        t.store.update_search(snapshot).expect("write"),
        SearchWrite::Conflict
    );
    assert_eq!(t.store.search(ride_id).expect("search"), Some(current.clone()));

    // The second round still expires into the next step.
    let second = t
        .engine
        .offer(current.current_offer.expect("second offer"))
        .expect("offer");
    assert_eq!(second.candidates, vec![far]);
    t.advance_secs(22);
    let report = t.engine.run_maintenance().expect("maintenance");
    assert_eq!(report.expiry.rides_cancelled, 1);
    assert_eq!(
        t.engine.ride(ride_id).expect("ride").cancel_reason,
        Some(CancelReason::NoDriversFound)
    );
}

#[test]
fn search_state_is_not_written_back_once_the_ride_is_matched() {
    let t = TestEngine::new();
    let first = t.online_driver_at(north_of_origin(200.0));
    let second = t.online_driver_at(north_of_origin(400.0));
    let (_, offer) = t.dispatch();
    let snapshot = t
        .store
        .search(offer.ride_id)
        .expect("search")
        .expect("searching");

    // A decline leaves the search state alone while the round is open.
    t.engine.decline_offer(offer.id, second).expect("decline");
    assert_eq!(
        t.store.search(offer.ride_id).expect("search"),
        Some(snapshot.clone())
    );

    t.engine.accept_offer(offer.id, first).expect("accept");
    assert_eq!(
        t.store.update_search(snapshot).expect("write"),
        SearchWrite::Closed
    );
    assert_eq!(t.store.search(offer.ride_id).expect("search"), None);
}
