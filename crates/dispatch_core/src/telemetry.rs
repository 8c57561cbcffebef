//! Operational counters for the dispatch engine.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Monotonic counters, safe to bump from any worker.
#[derive(Debug, Default)]
pub struct DispatchTelemetry {
    pub rides_requested: AtomicU64,
    pub offers_broadcast: AtomicU64,
    pub offers_expired: AtomicU64,
    pub accepts_won: AtomicU64,
    pub accepts_lost: AtomicU64,
    pub offers_declined: AtomicU64,
    pub no_driver_cancellations: AtomicU64,
    pub samples_accepted: AtomicU64,
    pub samples_stale: AtomicU64,
    pub samples_implausible: AtomicU64,
    pub rides_completed: AtomicU64,
    pub rides_cancelled: AtomicU64,
    pub stops_added: AtomicU64,
    pub route_cache_hits: AtomicU64,
    pub route_stale_served: AtomicU64,
    pub route_fallbacks: AtomicU64,
    pub settlements_created: AtomicU64,
    pub settlements_settled: AtomicU64,
    pub settlements_failed: AtomicU64,
}

/// Point-in-time copy of [`DispatchTelemetry`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TelemetrySnapshot {
    pub rides_requested: u64,
    pub offers_broadcast: u64,
    pub offers_expired: u64,
    pub accepts_won: u64,
    pub accepts_lost: u64,
    pub offers_declined: u64,
    pub no_driver_cancellations: u64,
    pub samples_accepted: u64,
    pub samples_stale: u64,
    pub samples_implausible: u64,
    pub rides_completed: u64,
    pub rides_cancelled: u64,
    pub stops_added: u64,
    pub route_cache_hits: u64,
    pub route_stale_served: u64,
    pub route_fallbacks: u64,
    pub settlements_created: u64,
    pub settlements_settled: u64,
    pub settlements_failed: u64,
}

pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl DispatchTelemetry {
    pub fn snapshot(&self) -> TelemetrySnapshot {
        let get = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        TelemetrySnapshot {
            rides_requested: get(&self.rides_requested),
            offers_broadcast: get(&self.offers_broadcast),
            offers_expired: get(&self.offers_expired),
            accepts_won: get(&self.accepts_won),
            accepts_lost: get(&self.accepts_lost),
            offers_declined: get(&self.offers_declined),
            no_driver_cancellations: get(&self.no_driver_cancellations),
            samples_accepted: get(&self.samples_accepted),
            samples_stale: get(&self.samples_stale),
            samples_implausible: get(&self.samples_implausible),
            rides_completed: get(&self.rides_completed),
            rides_cancelled: get(&self.rides_cancelled),
            stops_added: get(&self.stops_added),
            route_cache_hits: get(&self.route_cache_hits),
            route_stale_served: get(&self.route_stale_served),
            route_fallbacks: get(&self.route_fallbacks),
            settlements_created: get(&self.settlements_created),
            settlements_settled: get(&self.settlements_settled),
            settlements_failed: get(&self.settlements_failed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let telemetry = DispatchTelemetry::default();
        bump(&telemetry.accepts_won);
        bump(&telemetry.accepts_lost);
        bump(&telemetry.accepts_lost);
        let snapshot = telemetry.snapshot();
        assert_eq!(snapshot.accepts_won, 1);
        assert_eq!(snapshot.accepts_lost, 2);
        assert_eq!(snapshot.rides_completed, 0);
    }
}
