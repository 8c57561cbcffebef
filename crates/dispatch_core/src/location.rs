//! Driver position reports: validation, persistence, index refresh.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config::{secs, LocationConfig};
use crate::driver::{DriverState, LocationSample};
use crate::error::{DispatchError, DispatchResult, LocationRejection};
use crate::geo::{haversine_km, GeoPoint};
use crate::spatial::GeoIndex;
use crate::store::{LocationWrite, Store};
use crate::telemetry::{bump, DispatchTelemetry};
use crate::types::DriverId;

pub struct LocationIngest {
    store: Arc<dyn Store>,
    index: Arc<GeoIndex>,
    clock: Arc<dyn Clock>,
    telemetry: Arc<DispatchTelemetry>,
    config: LocationConfig,
}

impl LocationIngest {
    pub fn new(
        store: Arc<dyn Store>,
        index: Arc<GeoIndex>,
        clock: Arc<dyn Clock>,
        telemetry: Arc<DispatchTelemetry>,
        config: LocationConfig,
    ) -> Self {
        Self {
            store,
            index,
            clock,
            telemetry,
            config,
        }
    }

    /// Validates and applies one sample. Returns the driver row as stored.
    ///
    /// Out-of-order samples fail with `StaleLocation`; glitches (bad
    /// coordinates, clock skew, teleporting) fail with `ImplausibleLocation`.
    /// Neither changes any state.
    pub fn report(
        &self,
        driver_id: DriverId,
        point: GeoPoint,
        heading: Option<f64>,
        timestamp: DateTime<Utc>,
    ) -> DispatchResult<DriverState> {
        let now = self.clock.now();
        let current = self.store.driver(driver_id)?;
        let sample = LocationSample {
            driver_id,
            point,
            heading: heading.filter(|h| h.is_finite()).map(|h| h.rem_euclid(360.0)),
            timestamp,
        };

        if let Err(err) = self.check(&current, &sample, now) {
            self.note_rejection(&err);
            return Err(err);
        }

        match self.store.record_location(sample)? {
            LocationWrite::Applied(state) => {
                self.index
                    .upsert(driver_id, point, state.availability, timestamp);
                bump(&self.telemetry.samples_accepted);
                Ok(state)
            }
            LocationWrite::Stale(_) => {
                // A newer sample landed between our read and the write.
                let err = DispatchError::StaleLocation { driver_id };
                self.note_rejection(&err);
                Err(err)
            }
        }
    }

    fn check(
        &self,
        current: &DriverState,
        sample: &LocationSample,
        now: DateTime<Utc>,
    ) -> DispatchResult<()> {
        let driver_id = sample.driver_id;
        let implausible = |reason| DispatchError::ImplausibleLocation { driver_id, reason };

        if !sample.point.is_valid() {
            return Err(implausible(LocationRejection::InvalidCoordinates));
        }
        let skew = sample.timestamp - now;
        if skew > secs(self.config.max_future_skew_secs) {
            return Err(implausible(LocationRejection::FromTheFuture {
                skew_s: skew.num_seconds(),
            }));
        }
        if now - sample.timestamp > secs(self.config.max_sample_age_secs) {
            return Err(DispatchError::StaleLocation { driver_id });
        }

        let Some(previous) = current.last_location else {
            return Ok(());
        };
        if previous.timestamp >= sample.timestamp {
            return Err(DispatchError::StaleLocation { driver_id });
        }
        let elapsed_h = (sample.timestamp - previous.timestamp).num_milliseconds() as f64
            / 3_600_000.0;
        let speed_kmh = haversine_km(previous.point, sample.point) / elapsed_h;
        if speed_kmh > self.config.max_speed_kmh {
            return Err(implausible(LocationRejection::TooFast { speed_kmh }));
        }
        Ok(())
    }

    fn note_rejection(&self, err: &DispatchError) {
        match err {
            DispatchError::StaleLocation { driver_id } => {
                bump(&self.telemetry.samples_stale);
                debug!(%driver_id, "dropped out-of-order location sample");
            }
            DispatchError::ImplausibleLocation { driver_id, reason } => {
                bump(&self.telemetry.samples_implausible);
                warn!(%driver_id, %reason, "dropped implausible location sample");
            }
            _ => {}
        }
    }
}
