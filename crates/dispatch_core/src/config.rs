//! Engine configuration.
//!
//! Every section deserializes from JSON with per-field defaults, so a config
//! file only needs to name what it overrides.

use chrono::Duration;
use serde::{Deserialize, Serialize};

/// Sample validation for driver location reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocationConfig {
    /// Samples implying a faster move than this are dropped as GPS glitches.
    pub max_speed_kmh: f64,
    /// Samples older than this (relative to now) are stale on arrival.
    pub max_sample_age_secs: u64,
    /// Tolerated device clock skew into the future.
    pub max_future_skew_secs: u64,
    /// Distance from pickup at which an assigned driver counts as arriving.
    pub approach_radius_m: f64,
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            max_speed_kmh: 180.0,
            max_sample_age_secs: 120,
            max_future_skew_secs: 30,
            approach_radius_m: 500.0,
        }
    }
}

/// Offer broadcast and re-broadcast policy.
///
/// Round `n` (1-based) searches `initial_radius_km * radius_growth^(n-1)`,
/// capped at `max_radius_km`, and stays open for
/// `offer_window_secs + offer_window_growth_secs * (n-1)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub initial_radius_km: f64,
    pub radius_growth: f64,
    pub max_radius_km: f64,
    /// Drivers each offer is broadcast to.
    pub candidates_per_round: usize,
    /// Straight-line pre-filter size before road ranking.
    pub candidate_pool: usize,
    pub offer_window_secs: u64,
    pub offer_window_growth_secs: u64,
    pub max_rounds: u32,
    /// Rides still searching after this long are cancelled.
    pub max_search_wait_secs: u64,
    /// Resolved offers are kept this long so late acceptors get `AlreadyTaken`.
    pub offer_retention_secs: u64,
    /// H3 resolution of the geo index grid.
    pub h3_resolution: u8,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            initial_radius_km: 3.0,
            radius_growth: 1.5,
            max_radius_km: 10.0,
            candidates_per_round: 5,
            candidate_pool: 15,
            offer_window_secs: 18,
            offer_window_growth_secs: 4,
            max_rounds: 3,
            max_search_wait_secs: 240,
            offer_retention_secs: 120,
            h3_resolution: 9,
        }
    }
}

impl DispatchConfig {
    pub fn radius_for_round(&self, round: u32) -> f64 {
        let exponent = round.saturating_sub(1) as i32;
        (self.initial_radius_km * self.radius_growth.powi(exponent)).min(self.max_radius_km)
    }

    pub fn window_for_round(&self, round: u32) -> Duration {
        let growth = self
            .offer_window_growth_secs
            .saturating_mul(u64::from(round.saturating_sub(1)));
        secs(self.offer_window_secs.saturating_add(growth))
    }

    pub fn with_max_rounds(mut self, rounds: u32) -> Self {
        self.max_rounds = rounds;
        self
    }

    pub fn with_offer_window_secs(mut self, secs: u64) -> Self {
        self.offer_window_secs = secs;
        self
    }

    pub fn with_initial_radius_km(mut self, radius_km: f64) -> Self {
        self.initial_radius_km = radius_km;
        self
    }

    pub fn with_candidates_per_round(mut self, count: usize) -> Self {
        self.candidates_per_round = count;
        self
    }
}

/// Transient-failure retry policy at a component boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay_ms: 200,
            max_delay_ms: 2_000,
        }
    }
}

impl RetryConfig {
    /// Single attempt, no sleeping. Handy in tests.
    pub fn none() -> Self {
        Self {
            attempts: 1,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteConfig {
    /// Fresh cache hits within this window skip the provider entirely.
    pub cache_ttl_secs: u64,
    /// Oldest cached estimate that may be served when the provider fails.
    pub staleness_secs: u64,
    /// Decimal places coordinates are rounded to for cache keys.
    pub coordinate_precision: u32,
    /// Minimum spacing of live ETA recomputations per driver.
    pub driver_debounce_secs: u64,
    pub cache_capacity: usize,
    /// Average speed assumed by the straight-line fallback.
    pub fallback_speed_kmh: f64,
    pub retry: RetryConfig,
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 15,
            staleness_secs: 60,
            coordinate_precision: 4,
            driver_debounce_secs: 25,
            cache_capacity: 10_000,
            fallback_speed_kmh: 40.0,
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TripConfig {
    /// When set, a driver may only mark arrival within this distance of pickup.
    pub arrival_proximity_m: Option<f64>,
    pub require_pickup_pin: bool,
    pub max_stops: usize,
}

impl Default for TripConfig {
    fn default() -> Self {
        Self {
            arrival_proximity_m: Some(150.0),
            require_pickup_pin: false,
            max_stops: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettlementConfig {
    pub reconcile_interval_secs: u64,
    /// Charge creations attempted before a settlement is marked failed.
    pub max_charge_attempts: u32,
    pub retry: RetryConfig,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            reconcile_interval_secs: 60,
            max_charge_attempts: 5,
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub location: LocationConfig,
    pub dispatch: DispatchConfig,
    pub routing: RouteConfig,
    pub trip: TripConfig,
    pub settlement: SettlementConfig,
}

impl EngineConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn with_dispatch(mut self, dispatch: DispatchConfig) -> Self {
        self.dispatch = dispatch;
        self
    }

    pub fn with_trip(mut self, trip: TripConfig) -> Self {
        self.trip = trip;
        self
    }

    pub fn with_routing(mut self, routing: RouteConfig) -> Self {
        self.routing = routing;
        self
    }

    pub fn with_location(mut self, location: LocationConfig) -> Self {
        self.location = location;
        self
    }

    pub fn with_settlement(mut self, settlement: SettlementConfig) -> Self {
        self.settlement = settlement;
        self
    }
}

pub(crate) fn secs(value: u64) -> Duration {
    Duration::seconds(i64::try_from(value).unwrap_or(i64::MAX / 1_000))
}
