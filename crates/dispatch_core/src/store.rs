//! Authoritative storage for rides, drivers, offers and money.
//!
//! Every mutation that needs strong consistency is a single conditional
//! write: ride transitions compare-and-swap on the ride `version`, offer
//! claims check "no winner yet and ride still unmatched", location writes
//! check the per-driver timestamp, search-state writes compare-and-swap on
//! their own version. Callers never hold a store lock across
//! their own work, so a database-backed implementation can serve several
//! engine instances behind a load balancer.
//!
//! [`MemoryStore`] keeps everything in process. Its tables are locked
//! independently and multi-table operations always acquire them in the same
//! order (offers, rides, drivers, audit, searches; settlements, wallets,
//! debts).

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};

use crate::driver::{DriverState, LocationSample};
use crate::error::StoreError;
use crate::matching::offer::{Offer, OfferStatus, SearchState};
use crate::pricing::Money;
use crate::ride::{AuditEntry, Ride, RideStatus};
use crate::settlement::record::{SettlementOpen, SettlementPlan, SettlementRecord, SettlementStatus};
use crate::types::{Availability, DriverId, OfferId, PassengerId, RideId};

pub type StoreResult<T> = Result<T, StoreError>;

/// Availability change applied in the same step as a ride commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverUpdate {
    pub driver_id: DriverId,
    pub availability: Availability,
    pub current_ride: Option<RideId>,
}

/// A ride mutation guarded by the version the caller read.
#[derive(Debug, Clone)]
pub struct RideCommit {
    pub ride: Ride,
    pub expected_version: u64,
    pub driver_update: Option<DriverUpdate>,
    pub audit: Option<AuditEntry>,
}

/// Attempt by one driver to win an offer.
#[derive(Debug, Clone)]
pub struct OfferClaim {
    pub offer_id: OfferId,
    pub driver_id: DriverId,
    pub now: DateTime<Utc>,
    /// Ride as it should look once assigned.
    pub ride: Ride,
    pub expected_version: u64,
    pub audit: AuditEntry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimRejection {
    AlreadyTaken,
    Expired,
    NotACandidate,
    DriverUnavailable,
}

/// Outcome of a search-state write.
#[derive(Debug, Clone, PartialEq)]
pub enum SearchWrite {
    /// Stored with the next version.
    Applied(SearchState),
    /// Someone else wrote or removed the state since it was read.
    Conflict,
    /// The ride is no longer `searching`; nothing was stored.
    Closed,
}

/// Outcome of a location write.
#[derive(Debug, Clone, PartialEq)]
pub enum LocationWrite {
    Applied(DriverState),
    /// The stored sample is as new or newer; nothing changed.
    Stale(DriverState),
}

pub trait Store: Send + Sync {
    fn insert_ride(&self, ride: Ride, audit: AuditEntry) -> StoreResult<()>;
    fn ride(&self, id: RideId) -> StoreResult<Ride>;
    fn rides_with_status(&self, status: RideStatus) -> StoreResult<Vec<Ride>>;
    /// Applies the commit only if the stored version still equals
    /// `expected_version`; the driver update lands in the same step.
    fn commit_ride(&self, commit: RideCommit) -> StoreResult<Ride>;
    fn audit_log(&self, id: RideId) -> StoreResult<Vec<AuditEntry>>;

    fn upsert_driver(&self, driver: DriverState) -> StoreResult<()>;
    fn driver(&self, id: DriverId) -> StoreResult<DriverState>;
    fn drivers(&self) -> StoreResult<Vec<DriverState>>;
    /// Stores the sample only if it is strictly newer than the current one.
    fn record_location(&self, sample: LocationSample) -> StoreResult<LocationWrite>;
    /// Changes availability only if it equals `expected` and the driver holds
    /// no pending offer.
    fn set_availability(
        &self,
        id: DriverId,
        expected: Availability,
        to: Availability,
    ) -> StoreResult<DriverState>;

    /// Flags every still-dispatchable candidate with the offer and stores it.
    /// Candidates that are no longer free are dropped from the returned offer;
    /// an offer left without candidates is not stored.
    fn create_offer(&self, offer: Offer) -> StoreResult<Offer>;
    fn offer(&self, id: OfferId) -> StoreResult<Offer>;
    fn open_offers(&self) -> StoreResult<Vec<Offer>>;
    fn claim_offer(&self, claim: OfferClaim) -> StoreResult<Result<Ride, ClaimRejection>>;
    fn decline_offer(&self, id: OfferId, driver_id: DriverId) -> StoreResult<Offer>;
    /// Closes an open offer and clears its candidates' pending flags.
    /// Returns `None` if the offer was already resolved.
    fn close_offer(
        &self,
        id: OfferId,
        status: OfferStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Offer>>;
    fn purge_offers(&self, resolved_before: DateTime<Utc>) -> StoreResult<usize>;

    fn search(&self, ride_id: RideId) -> StoreResult<Option<SearchState>>;
    /// Stores `search` only if the stored version still equals
    /// `search.version` (version 0 creates it) and the ride is still
    /// `searching`.
    fn update_search(&self, search: SearchState) -> StoreResult<SearchWrite>;
    fn remove_search(&self, ride_id: RideId) -> StoreResult<()>;

    fn wallet_balance(&self, passenger: PassengerId) -> StoreResult<Money>;
    fn credit_wallet(&self, passenger: PassengerId, amount: Money) -> StoreResult<Money>;
    fn driver_debt(&self, driver: DriverId) -> StoreResult<Money>;
    /// Opens the settlement for a ride exactly once. `plan` receives the
    /// passenger's wallet balance; the record, wallet debit and debt accrual it
    /// returns are applied together. If a record exists it is returned as is.
    fn create_settlement(
        &self,
        ride_id: RideId,
        passenger: PassengerId,
        plan: &mut dyn FnMut(Money) -> SettlementPlan,
    ) -> StoreResult<SettlementOpen>;
    fn settlement(&self, ride_id: RideId) -> StoreResult<Option<SettlementRecord>>;
    fn settlement_by_reference(&self, reference: &str) -> StoreResult<Option<SettlementRecord>>;
    fn update_settlement(&self, record: SettlementRecord) -> StoreResult<SettlementRecord>;
    fn settlements_with_status(&self, status: SettlementStatus)
        -> StoreResult<Vec<SettlementRecord>>;
    fn unsettled_terminal_rides(&self) -> StoreResult<Vec<Ride>>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    offers: RwLock<HashMap<OfferId, Offer>>,
    rides: RwLock<HashMap<RideId, Ride>>,
    drivers: RwLock<HashMap<DriverId, DriverState>>,
    audit: Mutex<HashMap<RideId, Vec<AuditEntry>>>,
    searches: Mutex<HashMap<RideId, SearchState>>,
    settlements: Mutex<HashMap<RideId, SettlementRecord>>,
    wallets: Mutex<HashMap<PassengerId, Money>>,
    debts: Mutex<HashMap<DriverId, Money>>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn release_pending(drivers: &mut HashMap<DriverId, DriverState>, offer: &Offer) {
    for candidate in &offer.candidates {
        if let Some(driver) = drivers.get_mut(candidate) {
            if driver.pending_offer == Some(offer.id) {
                driver.pending_offer = None;
            }
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn insert_ride(&self, ride: Ride, audit: AuditEntry) -> StoreResult<()> {
        let mut rides = write(&self.rides);
        if rides.contains_key(&ride.id) {
            return Err(StoreError::Duplicate {
                entity: "ride",
                id: ride.id.to_string(),
            });
        }
        let id = ride.id;
        rides.insert(id, ride);
        lock(&self.audit).entry(id).or_default().push(audit);
        Ok(())
    }

    fn ride(&self, id: RideId) -> StoreResult<Ride> {
        read(&self.rides)
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("ride", id))
    }

    fn rides_with_status(&self, status: RideStatus) -> StoreResult<Vec<Ride>> {
        Ok(read(&self.rides)
            .values()
            .filter(|ride| ride.status == status)
            .cloned()
            .collect())
    }

    fn commit_ride(&self, commit: RideCommit) -> StoreResult<Ride> {
        let RideCommit {
            mut ride,
            expected_version,
            driver_update,
            audit,
        } = commit;

        let mut rides = write(&self.rides);
        let current = rides
            .get(&ride.id)
            .ok_or_else(|| StoreError::not_found("ride", ride.id))?;
        if current.version != expected_version {
            return Err(StoreError::conflict("ride", ride.id));
        }

        let mut drivers = write(&self.drivers);
        if let Some(update) = driver_update {
            let driver = drivers
                .get_mut(&update.driver_id)
                .ok_or_else(|| StoreError::not_found("driver", update.driver_id))?;
            driver.availability = update.availability;
            driver.current_ride = update.current_ride;
        }

        ride.version = expected_version + 1;
        rides.insert(ride.id, ride.clone());
        if let Some(entry) = audit {
            lock(&self.audit).entry(ride.id).or_default().push(entry);
        }
        Ok(ride)
    }

    fn audit_log(&self, id: RideId) -> StoreResult<Vec<AuditEntry>> {
        Ok(lock(&self.audit).get(&id).cloned().unwrap_or_default())
    }

    fn upsert_driver(&self, driver: DriverState) -> StoreResult<()> {
        write(&self.drivers).insert(driver.driver_id, driver);
        Ok(())
    }

    fn driver(&self, id: DriverId) -> StoreResult<DriverState> {
        read(&self.drivers)
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("driver", id))
    }

    fn drivers(&self) -> StoreResult<Vec<DriverState>> {
        Ok(read(&self.drivers).values().cloned().collect())
    }

    fn record_location(&self, sample: LocationSample) -> StoreResult<LocationWrite> {
        let mut drivers = write(&self.drivers);
        let driver = drivers
            .get_mut(&sample.driver_id)
            .ok_or_else(|| StoreError::not_found("driver", sample.driver_id))?;
        if let Some(previous) = driver.last_location {
            if previous.timestamp >= sample.timestamp {
                return Ok(LocationWrite::Stale(driver.clone()));
            }
        }
        driver.last_location = Some(sample);
        Ok(LocationWrite::Applied(driver.clone()))
    }

    fn set_availability(
        &self,
        id: DriverId,
        expected: Availability,
        to: Availability,
    ) -> StoreResult<DriverState> {
        let mut drivers = write(&self.drivers);
        let driver = drivers
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("driver", id))?;
        if driver.availability != expected || driver.pending_offer.is_some() {
            return Err(StoreError::conflict("driver", id));
        }
        driver.availability = to;
        Ok(driver.clone())
    }

    fn create_offer(&self, mut offer: Offer) -> StoreResult<Offer> {
        let mut offers = write(&self.offers);
        let mut drivers = write(&self.drivers);
        offer.candidates.retain(|candidate| {
            drivers
                .get(candidate)
                .is_some_and(DriverState::is_dispatchable)
        });
        if offer.candidates.is_empty() {
            return Ok(offer);
        }
        for candidate in &offer.candidates {
            if let Some(driver) = drivers.get_mut(candidate) {
                driver.pending_offer = Some(offer.id);
            }
        }
        offers.insert(offer.id, offer.clone());
        Ok(offer)
    }

    fn offer(&self, id: OfferId) -> StoreResult<Offer> {
        read(&self.offers)
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("offer", id))
    }

    fn open_offers(&self) -> StoreResult<Vec<Offer>> {
        Ok(read(&self.offers)
            .values()
            .filter(|offer| offer.is_open())
            .cloned()
            .collect())
    }

    fn claim_offer(&self, claim: OfferClaim) -> StoreResult<Result<Ride, ClaimRejection>> {
        let OfferClaim {
            offer_id,
            driver_id,
            now,
            mut ride,
            expected_version,
            audit,
        } = claim;

        let mut offers = write(&self.offers);
        let offer = offers
            .get_mut(&offer_id)
            .ok_or_else(|| StoreError::not_found("offer", offer_id))?;
        if offer.winner.is_some() || offer.status == OfferStatus::Accepted {
            return Ok(Err(ClaimRejection::AlreadyTaken));
        }
        if !offer.has_candidate(driver_id) || offer.has_declined(driver_id) {
            return Ok(Err(ClaimRejection::NotACandidate));
        }
        if !offer.is_open() || offer.is_expired(now) {
            return Ok(Err(ClaimRejection::Expired));
        }

        let mut rides = write(&self.rides);
        let current = rides
            .get(&ride.id)
            .ok_or_else(|| StoreError::not_found("ride", ride.id))?;
        if current.version != expected_version
            || current.status != RideStatus::Searching
            || current.driver_id.is_some()
        {
            return Ok(Err(ClaimRejection::AlreadyTaken));
        }

        let mut drivers = write(&self.drivers);
        let available = drivers
            .get(&driver_id)
            .is_some_and(|driver| driver.availability == Availability::Available);
        if !available {
            return Ok(Err(ClaimRejection::DriverUnavailable));
        }

        offer.winner = Some(driver_id);
        offer.status = OfferStatus::Accepted;
        offer.resolved_at = Some(now);
        release_pending(&mut drivers, offer);
        if let Some(driver) = drivers.get_mut(&driver_id) {
            driver.availability = Availability::OnTrip;
            driver.current_ride = Some(ride.id);
        }

        ride.version = expected_version + 1;
        rides.insert(ride.id, ride.clone());
        lock(&self.audit).entry(ride.id).or_default().push(audit);
        Ok(Ok(ride))
    }

    fn decline_offer(&self, id: OfferId, driver_id: DriverId) -> StoreResult<Offer> {
        let mut offers = write(&self.offers);
        let offer = offers
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("offer", id))?;
        if offer.is_open() && offer.has_candidate(driver_id) && !offer.has_declined(driver_id) {
            offer.declined.push(driver_id);
            let mut drivers = write(&self.drivers);
            if let Some(driver) = drivers.get_mut(&driver_id) {
                if driver.pending_offer == Some(id) {
                    driver.pending_offer = None;
                }
            }
        }
        Ok(offer.clone())
    }

    fn close_offer(
        &self,
        id: OfferId,
        status: OfferStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Offer>> {
        let mut offers = write(&self.offers);
        let offer = offers
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("offer", id))?;
        if !offer.is_open() {
            return Ok(None);
        }
        offer.status = status;
        offer.resolved_at = Some(now);
        release_pending(&mut write(&self.drivers), offer);
        Ok(Some(offer.clone()))
    }

    fn purge_offers(&self, resolved_before: DateTime<Utc>) -> StoreResult<usize> {
        let mut offers = write(&self.offers);
        let before = offers.len();
        offers.retain(|_, offer| {
            offer
                .resolved_at
                .map_or(true, |resolved| resolved >= resolved_before)
        });
        Ok(before - offers.len())
    }

    fn search(&self, ride_id: RideId) -> StoreResult<Option<SearchState>> {
        Ok(lock(&self.searches).get(&ride_id).cloned())
    }

    fn update_search(&self, mut search: SearchState) -> StoreResult<SearchWrite> {
        let rides = read(&self.rides);
        let searching = rides
            .get(&search.ride_id)
            .is_some_and(|ride| ride.status == RideStatus::Searching);
        if !searching {
            return Ok(SearchWrite::Closed);
        }
        let mut searches = lock(&self.searches);
        let stored_version = searches.get(&search.ride_id).map(|stored| stored.version);
        match stored_version {
            Some(version) if version == search.version => {}
            None if search.version == 0 => {}
            _ => return Ok(SearchWrite::Conflict),
        }
        search.version += 1;
        searches.insert(search.ride_id, search.clone());
        Ok(SearchWrite::Applied(search))
    }

    fn remove_search(&self, ride_id: RideId) -> StoreResult<()> {
        lock(&self.searches).remove(&ride_id);
        Ok(())
    }

    fn wallet_balance(&self, passenger: PassengerId) -> StoreResult<Money> {
        Ok(lock(&self.wallets)
            .get(&passenger)
            .copied()
            .unwrap_or_default())
    }

    fn credit_wallet(&self, passenger: PassengerId, amount: Money) -> StoreResult<Money> {
        let mut wallets = lock(&self.wallets);
        let balance = wallets.entry(passenger).or_default();
        *balance += amount;
        Ok(*balance)
    }

    fn driver_debt(&self, driver: DriverId) -> StoreResult<Money> {
        Ok(lock(&self.debts).get(&driver).copied().unwrap_or_default())
    }

    fn create_settlement(
        &self,
        ride_id: RideId,
        passenger: PassengerId,
        plan: &mut dyn FnMut(Money) -> SettlementPlan,
    ) -> StoreResult<SettlementOpen> {
        let mut settlements = lock(&self.settlements);
        if let Some(existing) = settlements.get(&ride_id) {
            return Ok(SettlementOpen::Existing(existing.clone()));
        }

        let mut wallets = lock(&self.wallets);
        let balance = wallets.get(&passenger).copied().unwrap_or_default();
        let SettlementPlan {
            record,
            wallet_debit,
            driver_debt,
        } = plan(balance);
        if wallet_debit > balance {
            return Err(StoreError::conflict("wallet", passenger));
        }

        if !wallet_debit.is_zero() {
            wallets.insert(passenger, balance - wallet_debit);
        }
        if let Some((driver, amount)) = driver_debt {
            *lock(&self.debts).entry(driver).or_default() += amount;
        }
        settlements.insert(ride_id, record.clone());
        Ok(SettlementOpen::Created(record))
    }

    fn settlement(&self, ride_id: RideId) -> StoreResult<Option<SettlementRecord>> {
        Ok(lock(&self.settlements).get(&ride_id).cloned())
    }

    fn settlement_by_reference(&self, reference: &str) -> StoreResult<Option<SettlementRecord>> {
        Ok(lock(&self.settlements)
            .values()
            .find(|record| record.gateway_reference == reference)
            .cloned())
    }

    fn update_settlement(&self, mut record: SettlementRecord) -> StoreResult<SettlementRecord> {
        let mut settlements = lock(&self.settlements);
        let current = settlements
            .get(&record.ride_id)
            .ok_or_else(|| StoreError::not_found("settlement", record.ride_id))?;
        if current.version != record.version {
            return Err(StoreError::conflict("settlement", record.ride_id));
        }
        record.version += 1;
        settlements.insert(record.ride_id, record.clone());
        Ok(record)
    }

    fn settlements_with_status(
        &self,
        status: SettlementStatus,
    ) -> StoreResult<Vec<SettlementRecord>> {
        Ok(lock(&self.settlements)
            .values()
            .filter(|record| record.status == status)
            .cloned()
            .collect())
    }

    fn unsettled_terminal_rides(&self) -> StoreResult<Vec<Ride>> {
        let rides = read(&self.rides);
        let settlements = lock(&self.settlements);
        Ok(rides
            .values()
            .filter(|ride| ride.status.is_terminal() && !settlements.contains_key(&ride.id))
            .cloned()
            .collect())
    }
}
