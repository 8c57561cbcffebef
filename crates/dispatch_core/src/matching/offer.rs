use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{DriverId, OfferId, RequestId, RideId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfferStatus {
    Open,
    Accepted,
    Expired,
    /// Closed without a winner for another reason (ride cancelled, every
    /// candidate declined).
    Withdrawn,
}

/// One broadcast round of a ride to a set of candidate drivers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub id: OfferId,
    pub ride_id: RideId,
    pub request_id: RequestId,
    pub round: u32,
    pub radius_km: f64,
    pub candidates: Vec<DriverId>,
    pub declined: Vec<DriverId>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub winner: Option<DriverId>,
    pub status: OfferStatus,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Offer {
    pub fn is_open(&self) -> bool {
        self.status == OfferStatus::Open
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn has_candidate(&self, driver_id: DriverId) -> bool {
        self.candidates.contains(&driver_id)
    }

    pub fn has_declined(&self, driver_id: DriverId) -> bool {
        self.declined.contains(&driver_id)
    }

    /// Candidates that have not declined.
    pub fn live_candidates(&self) -> impl Iterator<Item = DriverId> + '_ {
        self.candidates
            .iter()
            .copied()
            .filter(|driver| !self.declined.contains(driver))
    }

    pub fn all_declined(&self) -> bool {
        self.live_candidates().next().is_none()
    }
}

/// Matching progress for a ride still in `searching`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchState {
    pub ride_id: RideId,
    pub round: u32,
    pub radius_km: f64,
    /// Drivers who declined or let an offer for this ride time out.
    pub excluded: BTreeSet<DriverId>,
    pub current_offer: Option<OfferId>,
    pub started_at: DateTime<Utc>,
    /// Bumped by the store on every write; a write carrying an older
    /// version is rejected.
    #[serde(default)]
    pub version: u64,
}

impl SearchState {
    pub fn new(ride_id: RideId, started_at: DateTime<Utc>) -> Self {
        Self {
            ride_id,
            round: 0,
            radius_km: 0.0,
            excluded: BTreeSet::new(),
            current_offer: None,
            started_at,
            version: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn live_candidates_skip_decliners() {
        let a = DriverId::new();
        let b = DriverId::new();
        let now = Utc::now();
        let mut offer = Offer {
            id: OfferId::new(),
            ride_id: RideId::new(),
            request_id: RequestId::new(),
            round: 1,
            radius_km: 3.0,
            candidates: vec![a, b],
            declined: vec![a],
            created_at: now,
            expires_at: now + chrono::Duration::seconds(18),
            winner: None,
            status: OfferStatus::Open,
            resolved_at: None,
        };
        assert_eq!(offer.live_candidates().collect::<Vec<_>>(), vec![b]);
        assert!(!offer.all_declined());

        offer.declined.push(b);
        assert!(offer.all_declined());
        assert!(!offer.is_expired(now));
        assert!(offer.is_expired(now + chrono::Duration::seconds(18)));
    }
}
