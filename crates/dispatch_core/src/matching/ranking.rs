use std::sync::Arc;

use serde::Serialize;

use crate::geo::GeoPoint;
use crate::routing::{RouteEstimator, RouteSource};
use crate::spatial::NearbyDriver;
use crate::types::DriverId;

/// Average speed for straight-line pickup ETAs (km/h).
const AVG_SPEED_KMH: f64 = 40.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RankedCandidate {
    pub driver_id: DriverId,
    pub distance_km: f64,
    pub pickup_eta_s: f64,
    pub source: RouteSource,
}

/// Orders pre-filtered drivers for an offer, best first.
pub trait CandidateRanking: Send + Sync {
    fn rank(&self, pickup: GeoPoint, nearby: &[NearbyDriver]) -> Vec<RankedCandidate>;
}

/// Straight-line distance at a fixed average speed.
#[derive(Debug, Default, Clone, Copy)]
pub struct DistanceRanking;

impl CandidateRanking for DistanceRanking {
    fn rank(&self, _pickup: GeoPoint, nearby: &[NearbyDriver]) -> Vec<RankedCandidate> {
        let mut ranked: Vec<_> = nearby
            .iter()
            .map(|driver| RankedCandidate {
                driver_id: driver.driver_id,
                distance_km: driver.distance_km,
                pickup_eta_s: straight_line_eta_s(driver.distance_km),
                source: RouteSource::StraightLine,
            })
            .collect();
        sort_by_eta(&mut ranked);
        ranked
    }
}

/// Road ETA from the route estimator, falling back to straight-line figures
/// for any driver the estimator cannot route.
pub struct EtaRanking {
    estimator: Arc<RouteEstimator>,
}

impl EtaRanking {
    pub fn new(estimator: Arc<RouteEstimator>) -> Self {
        Self { estimator }
    }
}

impl CandidateRanking for EtaRanking {
    fn rank(&self, pickup: GeoPoint, nearby: &[NearbyDriver]) -> Vec<RankedCandidate> {
        let mut ranked: Vec<_> = nearby
            .iter()
            .map(|driver| {
                match self.estimator.estimate_or_fallback(&[driver.point, pickup]) {
                    Ok(estimate) => RankedCandidate {
                        driver_id: driver.driver_id,
                        distance_km: estimate.distance_m / 1000.0,
                        pickup_eta_s: estimate.duration_s,
                        source: estimate.source,
                    },
                    Err(_) => RankedCandidate {
                        driver_id: driver.driver_id,
                        distance_km: driver.distance_km,
                        pickup_eta_s: straight_line_eta_s(driver.distance_km),
                        source: RouteSource::StraightLine,
                    },
                }
            })
            .collect();
        sort_by_eta(&mut ranked);
        ranked
    }
}

fn straight_line_eta_s(distance_km: f64) -> f64 {
    (distance_km.max(0.0) / AVG_SPEED_KMH) * 3600.0
}

fn sort_by_eta(ranked: &mut [RankedCandidate]) {
    ranked.sort_by(|a, b| {
        a.pickup_eta_s
            .total_cmp(&b.pickup_eta_s)
            .then_with(|| a.distance_km.total_cmp(&b.distance_km))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{RetryConfig, RouteConfig};
    use crate::telemetry::DispatchTelemetry;
    use crate::test_helpers::{ScriptedRouteProvider, TEST_ORIGIN};

    fn nearby(distance_km: f64) -> NearbyDriver {
        NearbyDriver {
            driver_id: DriverId::new(),
            point: GeoPoint::new(TEST_ORIGIN.lat, TEST_ORIGIN.lng + distance_km / 67.8),
            distance_km,
        }
    }

    #[test]
    fn distance_ranking_prefers_closer_driver() {
        let far = nearby(2.0);
        let close = nearby(0.5);
        let ranked = DistanceRanking.rank(TEST_ORIGIN, &[far, close]);
        assert_eq!(ranked[0].driver_id, close.driver_id);
        assert!((ranked[0].pickup_eta_s - 45.0).abs() < 1e-6);
    }

    #[test]
    fn road_eta_can_reorder_straight_line_order() {
        let across_river = nearby(0.5);
        let down_the_road = nearby(1.0);
        let provider = Arc::new(ScriptedRouteProvider::default());
        // The closer driver has to detour over a bridge.
        provider.script(&[across_river.point, TEST_ORIGIN], 4_000.0, 480.0);
        provider.script(&[down_the_road.point, TEST_ORIGIN], 1_200.0, 150.0);
        let estimator = Arc::new(RouteEstimator::new(
            provider,
            Arc::new(ManualClock::default()),
            Arc::new(DispatchTelemetry::default()),
            RouteConfig {
                retry: RetryConfig::none(),
                ..RouteConfig::default()
            },
        ));

        let ranked = EtaRanking::new(estimator).rank(TEST_ORIGIN, &[across_river, down_the_road]);
        assert_eq!(ranked[0].driver_id, down_the_road.driver_id);
        assert_eq!(ranked[0].source, RouteSource::Provider);
    }

    #[test]
    fn unroutable_driver_falls_back_to_straight_line() {
        let driver = nearby(1.0);
        let provider = Arc::new(ScriptedRouteProvider::default());
        provider.fail_unscripted(true);
        let estimator = Arc::new(RouteEstimator::new(
            provider,
            Arc::new(ManualClock::default()),
            Arc::new(DispatchTelemetry::default()),
            RouteConfig {
                retry: RetryConfig::none(),
                ..RouteConfig::default()
            },
        ));
        let ranked = EtaRanking::new(estimator).rank(TEST_ORIGIN, &[driver]);
        assert_eq!(ranked[0].source, RouteSource::StraightLine);
    }
}
