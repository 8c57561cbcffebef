//! Road distance, duration and geometry between ordered points.
//!
//! Providers implement [`RouteProvider`]:
//!
//! - **`StraightLineRouteProvider`**: haversine legs at a fixed average
//!   speed. No dependencies, never fails.
//! - **`OsrmRouteProvider`** (feature `osrm`): calls an OSRM HTTP endpoint.
//!
//! [`RouteEstimator`] sits in front of a provider. It caches answers by
//! rounded coordinates, retries transient provider failures, serves a recent
//! cached answer when the provider is down, and rate-limits live ETA
//! recomputation per driver.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config::{secs, RouteConfig};
use crate::error::{DispatchError, DispatchResult};
use crate::geo::{encode_polyline, path_length_km, GeoPoint};
use crate::retry::retry_with_backoff;
use crate::telemetry::{bump, DispatchTelemetry};
use crate::types::DriverId;

#[cfg(feature = "osrm")]
pub mod osrm;

/// What a provider answers for an ordered list of points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteLeg {
    pub distance_m: f64,
    pub duration_s: f64,
    /// Encoded polyline, precision 5.
    pub polyline: String,
}

/// Where an estimate came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteSource {
    Provider,
    /// Fresh cache hit; the provider was not called.
    Cache,
    /// Provider failed; a cached answer younger than the staleness limit
    /// was served instead.
    Stale,
    /// Provider failed with nothing usable cached; haversine figures.
    StraightLine,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteEstimate {
    pub distance_m: f64,
    pub duration_s: f64,
    pub polyline: String,
    pub source: RouteSource,
}

impl RouteEstimate {
    fn from_leg(leg: RouteLeg, source: RouteSource) -> Self {
        Self {
            distance_m: leg.distance_m,
            duration_s: leg.duration_s,
            polyline: leg.polyline,
            source,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("provider unreachable: {0}")]
    Transport(String),
    #[error("malformed provider response: {0}")]
    Malformed(String),
    #[error("provider rejected the request: {0}")]
    Rejected(String),
    #[error("no route between the given points")]
    NoRoute,
}

impl RouteError {
    /// Worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, RouteError::Transport(_))
    }
}

pub trait RouteProvider: Send + Sync {
    /// Route through `points` in order. Callers pass at least two points.
    fn route(&self, points: &[GeoPoint]) -> Result<RouteLeg, RouteError>;
}

/// Haversine legs at a fixed average speed.
#[derive(Debug, Clone, Copy)]
pub struct StraightLineRouteProvider {
    pub speed_kmh: f64,
}

impl Default for StraightLineRouteProvider {
    fn default() -> Self {
        Self { speed_kmh: 40.0 }
    }
}

impl RouteProvider for StraightLineRouteProvider {
    fn route(&self, points: &[GeoPoint]) -> Result<RouteLeg, RouteError> {
        Ok(straight_line(points, self.speed_kmh))
    }
}

pub fn straight_line(points: &[GeoPoint], speed_kmh: f64) -> RouteLeg {
    let distance_km = path_length_km(points);
    let duration_s = if distance_km > 0.0 && speed_kmh > 0.0 {
        distance_km / speed_kmh * 3600.0
    } else {
        0.0
    };
    RouteLeg {
        distance_m: distance_km * 1000.0,
        duration_s,
        polyline: encode_polyline(points),
    }
}

/// Which backend to build.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum RouteProviderKind {
    #[default]
    StraightLine,
    #[cfg(feature = "osrm")]
    Osrm { endpoint: String },
}

pub fn build_route_provider(
    kind: &RouteProviderKind,
    config: &RouteConfig,
) -> Result<Arc<dyn RouteProvider>, RouteError> {
    match kind {
        RouteProviderKind::StraightLine => Ok(Arc::new(StraightLineRouteProvider {
            speed_kmh: config.fallback_speed_kmh,
        })),
        #[cfg(feature = "osrm")]
        RouteProviderKind::Osrm { endpoint } => {
            Ok(Arc::new(osrm::OsrmRouteProvider::new(endpoint)?))
        }
    }
}

type RouteKey = Vec<(i64, i64)>;

#[derive(Debug, Clone)]
struct CachedRoute {
    leg: RouteLeg,
    computed_at: DateTime<Utc>,
}

pub struct RouteEstimator {
    provider: Arc<dyn RouteProvider>,
    clock: Arc<dyn Clock>,
    telemetry: Arc<DispatchTelemetry>,
    config: RouteConfig,
    cache: Mutex<LruCache<RouteKey, CachedRoute>>,
    last_refresh: Mutex<HashMap<DriverId, DateTime<Utc>>>,
}

impl RouteEstimator {
    pub fn new(
        provider: Arc<dyn RouteProvider>,
        clock: Arc<dyn Clock>,
        telemetry: Arc<DispatchTelemetry>,
        config: RouteConfig,
    ) -> Self {
        let capacity = NonZeroUsize::new(config.cache_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            provider,
            clock,
            telemetry,
            config,
            cache: Mutex::new(LruCache::new(capacity)),
            last_refresh: Mutex::new(HashMap::new()),
        }
    }

    fn key(&self, points: &[GeoPoint]) -> RouteKey {
        points
            .iter()
            .map(|point| point.rounded_key(self.config.coordinate_precision))
            .collect()
    }

    fn cached(&self, key: &RouteKey) -> Option<CachedRoute> {
        let mut cache = self.cache.lock().ok()?;
        cache.get(key).cloned()
    }

    fn remember(&self, key: RouteKey, leg: &RouteLeg, computed_at: DateTime<Utc>) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.put(
                key,
                CachedRoute {
                    leg: leg.clone(),
                    computed_at,
                },
            );
        }
    }

    /// Distance, duration and polyline through `points`.
    ///
    /// Fails with `RouteUnavailable` only when the provider is down and no
    /// cached answer is younger than the staleness limit.
    pub fn estimate(&self, points: &[GeoPoint]) -> DispatchResult<RouteEstimate> {
        if points.len() < 2 {
            return Err(DispatchError::InvalidRequest(
                "a route needs at least two points".into(),
            ));
        }
        if let Some(bad) = points.iter().find(|point| !point.is_valid()) {
            return Err(DispatchError::InvalidRequest(format!(
                "invalid coordinates {},{}",
                bad.lat, bad.lng
            )));
        }

        let key = self.key(points);
        let now = self.clock.now();
        let cached = self.cached(&key);
        if let Some(hit) = &cached {
            if now - hit.computed_at <= secs(self.config.cache_ttl_secs) {
                bump(&self.telemetry.route_cache_hits);
                return Ok(RouteEstimate::from_leg(hit.leg.clone(), RouteSource::Cache));
            }
        }

        let outcome = retry_with_backoff(
            &self.config.retry,
            "route",
            || self.provider.route(points),
            RouteError::is_transient,
        );
        match outcome {
            Ok(leg) => {
                self.remember(key, &leg, self.clock.now());
                Ok(RouteEstimate::from_leg(leg, RouteSource::Provider))
            }
            Err(err) => match cached {
                Some(hit) if now - hit.computed_at <= secs(self.config.staleness_secs) => {
                    bump(&self.telemetry.route_stale_served);
                    debug!(error = %err, "route provider failed, serving cached estimate");
                    Ok(RouteEstimate::from_leg(hit.leg, RouteSource::Stale))
                }
                _ => {
                    warn!(error = %err, "route provider failed with no usable cache");
                    Err(DispatchError::RouteUnavailable(err.to_string()))
                }
            },
        }
    }

    /// Like [`estimate`](Self::estimate) but degrades to straight-line
    /// figures instead of failing when the provider is unavailable.
    pub fn estimate_or_fallback(&self, points: &[GeoPoint]) -> DispatchResult<RouteEstimate> {
        match self.estimate(points) {
            Err(DispatchError::RouteUnavailable(_)) => {
                bump(&self.telemetry.route_fallbacks);
                Ok(RouteEstimate::from_leg(
                    straight_line(points, self.config.fallback_speed_kmh),
                    RouteSource::StraightLine,
                ))
            }
            other => other,
        }
    }

    /// Claims the next live ETA recomputation slot for a driver. Returns
    /// `false` while the previous one is younger than the debounce window.
    pub fn try_begin_refresh(&self, driver_id: DriverId) -> bool {
        let now = self.clock.now();
        let mut last = self
            .last_refresh
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match last.get(&driver_id) {
            Some(previous) if now - *previous < secs(self.config.driver_debounce_secs) => false,
            _ => {
                last.insert(driver_id, now);
                true
            }
        }
    }

    /// Drops a driver's debounce slot, e.g. when their ride ends.
    pub fn forget_driver(&self, driver_id: DriverId) {
        self.last_refresh
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&driver_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::RetryConfig;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Answers a fixed leg until told to fail.
    struct Flaky {
        failing: AtomicBool,
        calls: AtomicUsize,
    }

    impl Flaky {
        fn new() -> Self {
            Self {
                failing: AtomicBool::new(false),
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl RouteProvider for Flaky {
        fn route(&self, points: &[GeoPoint]) -> Result<RouteLeg, RouteError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(RouteError::Transport("connection refused".into()));
            }
            Ok(RouteLeg {
                distance_m: 5_000.0,
                duration_s: 600.0,
                polyline: encode_polyline(points),
            })
        }
    }

    const A: GeoPoint = GeoPoint::new(52.5200, 13.4050);
    const B: GeoPoint = GeoPoint::new(52.5000, 13.4500);

    fn estimator(provider: Arc<Flaky>, clock: Arc<ManualClock>) -> RouteEstimator {
        let config = RouteConfig {
            retry: RetryConfig::none(),
            ..RouteConfig::default()
        };
        RouteEstimator::new(
            provider,
            clock,
            Arc::new(DispatchTelemetry::default()),
            config,
        )
    }

    #[test]
    fn fresh_cache_skips_the_provider() {
        let provider = Arc::new(Flaky::new());
        let clock = Arc::new(ManualClock::default());
        let estimator = estimator(provider.clone(), clock.clone());

        let first = estimator.estimate(&[A, B]).expect("estimate");
        assert_eq!(first.source, RouteSource::Provider);
        clock.advance_secs(5);
        // Sub-metre jitter rounds to the same key.
        let jittered = GeoPoint::new(A.lat + 0.00001, A.lng);
        let second = estimator.estimate(&[jittered, B]).expect("estimate");
        assert_eq!(second.source, RouteSource::Cache);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn provider_failure_serves_recent_cache() {
        let provider = Arc::new(Flaky::new());
        let clock = Arc::new(ManualClock::default());
        let estimator = estimator(provider.clone(), clock.clone());

        estimator.estimate(&[A, B]).expect("estimate");
        provider.failing.store(true, Ordering::SeqCst);
        clock.advance_secs(30);
        let stale = estimator.estimate(&[A, B]).expect("stale estimate");
        assert_eq!(stale.source, RouteSource::Stale);
        assert_eq!(stale.distance_m, 5_000.0);

        clock.advance_secs(60);
        let err = estimator.estimate(&[A, B]).unwrap_err();
        assert!(matches!(err, DispatchError::RouteUnavailable(_)));
    }

    #[test]
    fn fallback_uses_straight_line() {
        let provider = Arc::new(Flaky::new());
        provider.failing.store(true, Ordering::SeqCst);
        let estimator = estimator(provider, Arc::new(ManualClock::default()));

        let estimate = estimator.estimate_or_fallback(&[A, B]).expect("fallback");
        assert_eq!(estimate.source, RouteSource::StraightLine);
        assert!(estimate.distance_m > 3_000.0 && estimate.distance_m < 4_000.0);
        assert!(estimate.duration_s > 0.0);
    }

    #[test]
    fn single_point_is_rejected() {
        let estimator = estimator(Arc::new(Flaky::new()), Arc::new(ManualClock::default()));
        let err = estimator.estimate(&[A]).unwrap_err();
        assert!(matches!(err, DispatchError::InvalidRequest(_)));
    }

    #[test]
    fn refresh_is_debounced_per_driver() {
        let clock = Arc::new(ManualClock::default());
        let estimator = estimator(Arc::new(Flaky::new()), clock.clone());
        let driver = DriverId::new();
        let other = DriverId::new();

        assert!(estimator.try_begin_refresh(driver));
        assert!(!estimator.try_begin_refresh(driver));
        assert!(estimator.try_begin_refresh(other));
        clock.advance_secs(25);
        assert!(estimator.try_begin_refresh(driver));
    }
}
