//! Driver matching: candidate search, offer broadcast, accept races and
//! re-broadcast rounds.
//!
//! A ride request becomes a `searching` ride and then a sequence of offer
//! rounds. Each round pre-filters drivers from the geo index, ranks them by
//! road ETA and offers the ride to the best few at once. The first driver to
//! claim the offer wins; everyone else gets `AlreadyTaken`. A round that
//! expires, or that every candidate declines, is followed by a wider one
//! that excludes those drivers. After the last round the ride is cancelled
//! with `no_drivers_found`.

pub mod offer;
pub mod ranking;

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::{secs, DispatchConfig};
use crate::error::{DispatchError, DispatchResult, RideStateRejection};
use crate::events::{DriverEvent, EventBus};
use crate::pricing::TariffSource;
use crate::ride::{Ride, RideRequest, RideStatus};
use crate::routing::RouteEstimator;
use crate::spatial::GeoIndex;
use crate::state_machine::RideStateMachine;
use crate::store::{SearchWrite, Store};
use crate::telemetry::{bump, DispatchTelemetry};
use crate::types::{DriverId, OfferId, RideId};

pub use offer::{Offer, OfferStatus, SearchState};
pub use ranking::{CandidateRanking, DistanceRanking, EtaRanking, RankedCandidate};

/// What happened to a ride after one of its offers closed unanswered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RoundOutcome {
    Rebroadcast,
    Cancelled,
    /// Nothing to do: the ride moved on or a newer round is running.
    Idle,
}

/// Result of running offer rounds for a ride.
#[derive(Debug, Clone, PartialEq)]
enum RoundRun {
    Broadcast(Offer),
    Exhausted,
    /// The search state changed underneath us or the ride left `searching`;
    /// the offer we created has been withdrawn.
    Superseded,
}

/// What one expiry sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExpirySweep {
    pub offers_expired: usize,
    pub rebroadcasts: usize,
    pub rides_cancelled: usize,
}

pub struct DispatchMatcher {
    store: Arc<dyn Store>,
    index: Arc<GeoIndex>,
    rides: Arc<RideStateMachine>,
    ranking: Arc<dyn CandidateRanking>,
    estimator: Arc<RouteEstimator>,
    tariffs: Arc<dyn TariffSource>,
    clock: Arc<dyn Clock>,
    events: Arc<EventBus>,
    telemetry: Arc<DispatchTelemetry>,
    config: DispatchConfig,
}

impl DispatchMatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        index: Arc<GeoIndex>,
        rides: Arc<RideStateMachine>,
        ranking: Arc<dyn CandidateRanking>,
        estimator: Arc<RouteEstimator>,
        tariffs: Arc<dyn TariffSource>,
        clock: Arc<dyn Clock>,
        events: Arc<EventBus>,
        telemetry: Arc<DispatchTelemetry>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            store,
            index,
            rides,
            ranking,
            estimator,
            tariffs,
            clock,
            events,
            telemetry,
            config,
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Creates the ride and broadcasts the first offer round.
    ///
    /// Rounds with no eligible driver advance immediately. If every round is
    /// empty the ride is cancelled and `NoDriversAvailable` returned.
    pub fn dispatch(&self, request: RideRequest) -> DispatchResult<Offer> {
        let ride = self.open_ride(request)?;
        bump(&self.telemetry.rides_requested);

        let search = SearchState::new(ride.id, ride.created_at);
        match self.broadcast_next_round(&ride, search)? {
            RoundRun::Broadcast(offer) => Ok(offer),
            RoundRun::Exhausted => {
                self.give_up(ride.id)?;
                Err(DispatchError::NoDriversAvailable { ride_id: ride.id })
            }
            RoundRun::Superseded => {
                // Cancelled before the first offer was recorded.
                let current = self.store.ride(ride.id)?;
                Err(DispatchError::InvalidRideState {
                    ride_id: ride.id,
                    reason: RideStateRejection::Status(current.status),
                })
            }
        }
    }

    fn open_ride(&self, request: RideRequest) -> DispatchResult<Ride> {
        if !request.origin.is_valid() {
            return Err(DispatchError::InvalidRequest("invalid pickup coordinates".into()));
        }
        if request.kind.requires_destination() && request.destination.is_none() {
            return Err(DispatchError::InvalidRequest(format!(
                "{:?} rides need a destination",
                request.kind
            )));
        }
        if request.destination.is_some_and(|point| !point.is_valid()) {
            return Err(DispatchError::InvalidRequest(
                "invalid destination coordinates".into(),
            ));
        }
        let tariff = self
            .tariffs
            .tariff_for(&request.vehicle_class)
            .ok_or_else(|| {
                DispatchError::InvalidRequest(format!(
                    "no tariff for vehicle class {}",
                    request.vehicle_class
                ))
            })?;

        let (distance_m, duration_s) = match request.destination {
            Some(destination) => {
                let estimate = self
                    .estimator
                    .estimate_or_fallback(&[request.origin, destination])?;
                (estimate.distance_m, estimate.duration_s)
            }
            None => (0.0, 0.0),
        };

        let now = self.clock.now();
        let ride = Ride {
            id: RideId::new(),
            request_id: request.id,
            kind: request.kind,
            status: RideStatus::Searching,
            passenger_id: request.passenger_id,
            driver_id: None,
            origin: request.origin,
            destination: request.destination,
            stops: Vec::new(),
            vehicle_class: request.vehicle_class,
            payment_method: request.payment_method,
            estimated_fare: tariff.trip_fare(distance_m, duration_s),
            tariff,
            actual_fare: None,
            estimated_distance_m: distance_m,
            estimated_duration_s: duration_s,
            actual_distance_m: None,
            actual_duration_s: None,
            pickup_pin: format!("{:04}", rand::thread_rng().gen_range(0..10_000)),
            cancel_reason: None,
            cancelled_from: None,
            created_at: now,
            updated_at: now,
            assigned_at: None,
            started_at: None,
            finished_at: None,
            version: 0,
        };
        self.rides.create(ride)
    }

    /// Runs rounds until one produces an offer with at least one candidate,
    /// then stores the search state with a version check.
    fn broadcast_next_round(
        &self,
        ride: &Ride,
        mut search: SearchState,
    ) -> DispatchResult<RoundRun> {
        while search.round < self.config.max_rounds {
            search.round += 1;
            search.radius_km = self.config.radius_for_round(search.round);
            search.current_offer = None;

            let candidates = self.select_candidates(ride, &search);
            if candidates.is_empty() {
                debug!(ride_id = %ride.id, round = search.round, radius_km = search.radius_km, "no candidates in round");
                continue;
            }

            let now = self.clock.now();
            let offer = self.store.create_offer(Offer {
                id: OfferId::new(),
                ride_id: ride.id,
                request_id: ride.request_id,
                round: search.round,
                radius_km: search.radius_km,
                candidates,
                declined: Vec::new(),
                created_at: now,
                expires_at: now + self.config.window_for_round(search.round),
                winner: None,
                status: OfferStatus::Open,
                resolved_at: None,
            })?;
            if offer.candidates.is_empty() {
                // Every candidate was taken by a concurrent offer.
                continue;
            }

            search.current_offer = Some(offer.id);
            match self.store.update_search(search)? {
                SearchWrite::Applied(_) => {}
                SearchWrite::Conflict | SearchWrite::Closed => {
                    debug!(ride_id = %ride.id, offer_id = %offer.id, "search moved on, withdrawing offer");
                    self.store.close_offer(offer.id, OfferStatus::Withdrawn, now)?;
                    return Ok(RoundRun::Superseded);
                }
            }
            bump(&self.telemetry.offers_broadcast);
            info!(
                ride_id = %ride.id,
                offer_id = %offer.id,
                round = offer.round,
                radius_km = offer.radius_km,
                candidates = offer.candidates.len(),
                "offer broadcast"
            );
            for driver_id in &offer.candidates {
                self.events.publish_driver(
                    *driver_id,
                    DriverEvent::OfferReceived {
                        offer_id: offer.id,
                        ride_id: ride.id,
                        pickup: ride.origin,
                        expires_at: offer.expires_at,
                    },
                );
            }
            return Ok(RoundRun::Broadcast(offer));
        }
        Ok(RoundRun::Exhausted)
    }

    /// Eligibility is checked before the pool limit, so drivers busy with
    /// other offers or of another class never crowd out a free one.
    fn select_candidates(&self, ride: &Ride, search: &SearchState) -> Vec<DriverId> {
        let nearby = self.index.nearest_matching(
            ride.origin,
            search.radius_km,
            self.config.candidate_pool,
            |driver_id| {
                !search.excluded.contains(&driver_id)
                    && self.store.driver(driver_id).is_ok_and(|driver| {
                        driver.is_dispatchable() && driver.vehicle.class == ride.vehicle_class
                    })
            },
        );
        if nearby.is_empty() {
            return Vec::new();
        }
        self.ranking
            .rank(ride.origin, &nearby)
            .into_iter()
            .take(self.config.candidates_per_round)
            .map(|candidate| candidate.driver_id)
            .collect()
    }

    /// Claims the offer for `driver_id`. Exactly one caller per offer wins.
    pub fn accept(&self, offer_id: OfferId, driver_id: DriverId) -> DispatchResult<Ride> {
        let offer = self.store.offer(offer_id)?;
        let ride = self.rides.accept_offer(&offer, driver_id)?;
        bump(&self.telemetry.accepts_won);
        self.store.remove_search(ride.id)?;
        for other in offer.live_candidates().filter(|id| *id != driver_id) {
            self.events
                .publish_driver(other, DriverEvent::OfferWithdrawn { offer_id });
        }
        Ok(ride)
    }

    /// Records a decline. When the last live candidate declines, the next
    /// round starts right away. The decliner joins the ride's exclusions
    /// when the round closes.
    pub fn decline(&self, offer_id: OfferId, driver_id: DriverId) -> DispatchResult<Offer> {
        let offer = self.store.offer(offer_id)?;
        if !offer.has_candidate(driver_id) {
            return Err(DispatchError::NotACandidate {
                offer_id,
                driver_id,
            });
        }
        if offer.winner.is_some() {
            return Err(DispatchError::AlreadyTaken { offer_id });
        }
        if !offer.is_open() || offer.is_expired(self.clock.now()) {
            return Err(DispatchError::OfferExpired { offer_id });
        }

        let updated = self.store.decline_offer(offer_id, driver_id)?;
        bump(&self.telemetry.offers_declined);
        debug!(%offer_id, %driver_id, "offer declined");

        if updated.all_declined() {
            if let Some(closed) =
                self.store
                    .close_offer(offer_id, OfferStatus::Expired, self.clock.now())?
            {
                self.advance(&closed)?;
            }
        }
        Ok(updated)
    }

    /// Closes offers past their window and moves their rides to the next
    /// round, or cancels them when the rounds are exhausted.
    pub fn expire_offers(&self) -> DispatchResult<ExpirySweep> {
        let now = self.clock.now();
        let mut sweep = ExpirySweep::default();
        for offer in self.store.open_offers()? {
            if !offer.is_expired(now) {
                continue;
            }
            // Another sweeper or a decline may have closed it first.
            let Some(closed) = self.store.close_offer(offer.id, OfferStatus::Expired, now)? else {
                continue;
            };
            sweep.offers_expired += 1;
            bump(&self.telemetry.offers_expired);
            for driver_id in closed.live_candidates() {
                self.events.publish_driver(
                    driver_id,
                    DriverEvent::OfferWithdrawn { offer_id: closed.id },
                );
            }
            match self.advance(&closed)? {
                RoundOutcome::Rebroadcast => sweep.rebroadcasts += 1,
                RoundOutcome::Cancelled => sweep.rides_cancelled += 1,
                RoundOutcome::Idle => {}
            }
        }
        Ok(sweep)
    }

    /// Next round after `closed` resolved without a winner.
    fn advance(&self, closed: &Offer) -> DispatchResult<RoundOutcome> {
        let ride = self.store.ride(closed.ride_id)?;
        if ride.status != RideStatus::Searching {
            self.store.remove_search(ride.id)?;
            return Ok(RoundOutcome::Idle);
        }
        let mut search = self
            .store
            .search(ride.id)?
            .unwrap_or_else(|| SearchState {
                round: closed.round,
                ..SearchState::new(ride.id, ride.created_at)
            });
        if search.current_offer.is_some_and(|current| current != closed.id) {
            return Ok(RoundOutcome::Idle);
        }
        search.excluded.extend(closed.candidates.iter().copied());

        if self.clock.now() - search.started_at >= secs(self.config.max_search_wait_secs) {
            return self.give_up_outcome(ride.id);
        }
        match self.broadcast_next_round(&ride, search)? {
            RoundRun::Broadcast(_) => Ok(RoundOutcome::Rebroadcast),
            RoundRun::Exhausted => self.give_up_outcome(ride.id),
            RoundRun::Superseded => Ok(RoundOutcome::Idle),
        }
    }

    fn give_up_outcome(&self, ride_id: RideId) -> DispatchResult<RoundOutcome> {
        Ok(if self.give_up(ride_id)? {
            RoundOutcome::Cancelled
        } else {
            RoundOutcome::Idle
        })
    }

    /// Cancels rides that have been searching for longer than the maximum
    /// wait, whatever their round state.
    pub fn cancel_stale_searches(&self) -> DispatchResult<usize> {
        let now = self.clock.now();
        let limit = secs(self.config.max_search_wait_secs);
        let mut cancelled = 0;
        for ride in self.store.rides_with_status(RideStatus::Searching)? {
            if now - ride.created_at < limit {
                continue;
            }
            self.withdraw_current_offer(ride.id, now)?;
            if self.give_up(ride.id)? {
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    /// Stops matching for a ride that left `searching` for another reason,
    /// e.g. a passenger cancellation.
    pub fn abandon_search(&self, ride_id: RideId) -> DispatchResult<()> {
        self.withdraw_current_offer(ride_id, self.clock.now())?;
        self.store.remove_search(ride_id)?;
        Ok(())
    }

    fn withdraw_current_offer(&self, ride_id: RideId, now: DateTime<Utc>) -> DispatchResult<()> {
        let Some(offer_id) = self
            .store
            .search(ride_id)?
            .and_then(|search| search.current_offer)
        else {
            return Ok(());
        };
        if let Some(closed) = self.store.close_offer(offer_id, OfferStatus::Withdrawn, now)? {
            let notified: HashSet<DriverId> = closed.live_candidates().collect();
            for driver_id in notified {
                self.events
                    .publish_driver(driver_id, DriverEvent::OfferWithdrawn { offer_id });
            }
        }
        Ok(())
    }

    /// Drops resolved offers older than the retention window.
    pub fn purge_resolved_offers(&self) -> DispatchResult<usize> {
        let cutoff = self.clock.now() - secs(self.config.offer_retention_secs);
        Ok(self.store.purge_offers(cutoff)?)
    }

    /// Cancels a ride with `no_drivers_found`. Returns `false` if the ride
    /// had already left `searching`.
    fn give_up(&self, ride_id: RideId) -> DispatchResult<bool> {
        self.store.remove_search(ride_id)?;
        match self.rides.cancel_unmatched(ride_id) {
            Ok(_) => {
                bump(&self.telemetry.no_driver_cancellations);
                warn!(%ride_id, "no driver found, ride cancelled");
                Ok(true)
            }
            Err(DispatchError::InvalidTransition { status, .. }) => {
                debug!(%ride_id, %status, "ride left searching before cancellation");
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }
}
