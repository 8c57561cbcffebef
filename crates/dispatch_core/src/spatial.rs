//! H3-backed spatial index of online drivers.
//!
//! Each driver sits in exactly one resolution-9 cell (by default). Queries
//! expand a grid disk around the query point large enough to cover the radius,
//! then filter and sort by haversine distance. A single `RwLock` guards both
//! the cell buckets and the per-driver entries, so a reader never sees a
//! driver in two cells at once.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use h3o::{CellIndex, Resolution};
use lru::LruCache;
use serde::Serialize;

use crate::driver::DriverState;
use crate::geo::{haversine_km, GeoPoint};
use crate::types::{Availability, DriverId};

const DISK_CACHE_CAPACITY: usize = 1_000;
/// Upper bound on grid-disk rings; keeps pathological radii bounded.
const MAX_RING: u32 = 200;

#[derive(Debug, Clone, Copy, PartialEq)]
struct IndexedDriver {
    cell: CellIndex,
    point: GeoPoint,
    availability: Availability,
    updated_at: DateTime<Utc>,
}

/// A query hit, nearest first.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct NearbyDriver {
    pub driver_id: DriverId,
    pub point: GeoPoint,
    pub distance_km: f64,
}

#[derive(Debug, Default)]
struct IndexTables {
    by_cell: HashMap<CellIndex, Vec<DriverId>>,
    entries: HashMap<DriverId, IndexedDriver>,
}

impl IndexTables {
    fn detach(&mut self, driver_id: DriverId, cell: CellIndex) {
        if let Some(bucket) = self.by_cell.get_mut(&cell) {
            bucket.retain(|&id| id != driver_id);
            if bucket.is_empty() {
                self.by_cell.remove(&cell);
            }
        }
    }
}

pub struct GeoIndex {
    resolution: Resolution,
    tables: RwLock<IndexTables>,
    disk_cache: Mutex<LruCache<(CellIndex, u32), Vec<CellIndex>>>,
}

impl GeoIndex {
    pub fn new(resolution: Resolution) -> Self {
        Self {
            resolution,
            tables: RwLock::new(IndexTables::default()),
            disk_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(DISK_CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN),
            )),
        }
    }

    /// Index at the given H3 resolution; out-of-range values fall back to 9.
    pub fn with_resolution(resolution: u8) -> Self {
        Self::new(Resolution::try_from(resolution).unwrap_or(Resolution::Nine))
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    fn read(&self) -> RwLockReadGuard<'_, IndexTables> {
        self.tables
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, IndexTables> {
        self.tables
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Places or moves a driver. Offline drivers are removed instead.
    /// Returns `false` when the point is invalid or older than the indexed one.
    ///
    /// `availability` only applies to a driver not yet indexed. Moving an
    /// indexed driver keeps the availability the index already holds, which
    /// only [`GeoIndex::set_availability`] changes.
    pub fn upsert(
        &self,
        driver_id: DriverId,
        point: GeoPoint,
        availability: Availability,
        at: DateTime<Utc>,
    ) -> bool {
        if availability == Availability::Offline {
            self.remove(driver_id);
            return true;
        }
        let Some(cell) = point.to_cell(self.resolution) else {
            return false;
        };

        let mut tables = self.write();
        let availability = match tables.entries.get(&driver_id).copied() {
            Some(existing) => {
                if existing.updated_at > at {
                    return false;
                }
                if existing.cell != cell {
                    tables.detach(driver_id, existing.cell);
                    tables.by_cell.entry(cell).or_default().push(driver_id);
                }
                existing.availability
            }
            None => {
                tables.by_cell.entry(cell).or_default().push(driver_id);
                availability
            }
        };
        tables.entries.insert(
            driver_id,
            IndexedDriver {
                cell,
                point,
                availability,
                updated_at: at,
            },
        );
        true
    }

    /// Changes availability without moving the driver. No-op if not indexed.
    pub fn set_availability(&self, driver_id: DriverId, availability: Availability) {
        if availability == Availability::Offline {
            self.remove(driver_id);
            return;
        }
        if let Some(entry) = self.write().entries.get_mut(&driver_id) {
            entry.availability = availability;
        }
    }

    pub fn remove(&self, driver_id: DriverId) {
        let mut tables = self.write();
        if let Some(entry) = tables.entries.remove(&driver_id) {
            tables.detach(driver_id, entry.cell);
        }
    }

    pub fn position(&self, driver_id: DriverId) -> Option<GeoPoint> {
        self.read().entries.get(&driver_id).map(|entry| entry.point)
    }

    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Up to `limit` available drivers within `radius_km`, nearest first.
    pub fn nearest_available(
        &self,
        point: GeoPoint,
        radius_km: f64,
        limit: usize,
    ) -> Vec<NearbyDriver> {
        self.nearest_matching(point, radius_km, limit, |_| true)
    }

    /// Like [`GeoIndex::nearest_available`], but `eligible` is asked about
    /// drivers nearest first and the limit counts only the ones it accepts.
    /// It runs after the index lock is released, so it may consult the store.
    pub fn nearest_matching(
        &self,
        point: GeoPoint,
        radius_km: f64,
        limit: usize,
        mut eligible: impl FnMut(DriverId) -> bool,
    ) -> Vec<NearbyDriver> {
        if limit == 0 || radius_km <= 0.0 {
            return Vec::new();
        }
        let Some(origin) = point.to_cell(self.resolution) else {
            return Vec::new();
        };
        let cells = self.disk(origin, self.rings_for(radius_km));

        let tables = self.read();
        let mut hits: Vec<NearbyDriver> = cells
            .iter()
            .filter_map(|cell| tables.by_cell.get(cell))
            .flatten()
            .filter_map(|driver_id| {
                let entry = tables.entries.get(driver_id)?;
                if entry.availability != Availability::Available {
                    return None;
                }
                let distance_km = haversine_km(point, entry.point);
                (distance_km <= radius_km).then_some(NearbyDriver {
                    driver_id: *driver_id,
                    point: entry.point,
                    distance_km,
                })
            })
            .collect();
        drop(tables);

        hits.sort_by(|a, b| {
            a.distance_km
                .total_cmp(&b.distance_km)
                .then_with(|| a.driver_id.0.cmp(&b.driver_id.0))
        });
        hits.into_iter()
            .filter(|hit| eligible(hit.driver_id))
            .take(limit)
            .collect()
    }

    /// Replaces the whole index with the positions stored on driver rows.
    pub fn rebuild<'a>(&self, drivers: impl IntoIterator<Item = &'a DriverState>) -> usize {
        let mut fresh = IndexTables::default();
        for driver in drivers {
            if driver.availability == Availability::Offline {
                continue;
            }
            let Some(sample) = driver.last_location else {
                continue;
            };
            let Some(cell) = sample.point.to_cell(self.resolution) else {
                continue;
            };
            fresh.by_cell.entry(cell).or_default().push(driver.driver_id);
            fresh.entries.insert(
                driver.driver_id,
                IndexedDriver {
                    cell,
                    point: sample.point,
                    availability: driver.availability,
                    updated_at: sample.timestamp,
                },
            );
        }
        let count = fresh.entries.len();
        *self.write() = fresh;
        count
    }

    /// Grid distance `k` whose disk covers `radius_km` around any point of the
    /// origin cell.
    fn rings_for(&self, radius_km: f64) -> u32 {
        let spacing_km = self.resolution.edge_length_km() * 3f64.sqrt();
        let rings = (radius_km / spacing_km).ceil() as u32 + 1;
        rings.min(MAX_RING)
    }

    fn disk(&self, origin: CellIndex, k: u32) -> Vec<CellIndex> {
        let mut cache = match self.disk_cache.lock() {
            Ok(guard) => guard,
            Err(_) => return origin.grid_disk::<Vec<_>>(k),
        };
        cache
            .get_or_insert((origin, k), || origin.grid_disk::<Vec<_>>(k))
            .clone()
    }
}

impl Default for GeoIndex {
    fn default() -> Self {
        Self::new(Resolution::Nine)
    }
}

impl std::fmt::Debug for GeoIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeoIndex")
            .field("resolution", &self.resolution)
            .field("drivers", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::LocationSample;
    use crate::types::{VehicleClass, VehicleDescriptor};

    const CENTER: GeoPoint = GeoPoint::new(52.5200, 13.4050);

    fn east_of(km: f64) -> GeoPoint {
        // One degree of longitude at 52.52N is roughly 67.8 km.
        GeoPoint::new(CENTER.lat, CENTER.lng + km / 67.8)
    }

    #[test]
    fn returns_available_drivers_nearest_first() {
        let index = GeoIndex::default();
        let now = Utc::now();
        let far = DriverId::new();
        let near = DriverId::new();
        let busy = DriverId::new();
        index.upsert(far, east_of(2.0), Availability::Available, now);
        index.upsert(near, east_of(0.5), Availability::Available, now);
        index.upsert(busy, east_of(0.2), Availability::OnTrip, now);

        let hits = index.nearest_available(CENTER, 3.0, 10);
        let ids: Vec<_> = hits.iter().map(|hit| hit.driver_id).collect();
        assert_eq!(ids, vec![near, far]);
        assert!(hits[0].distance_km < hits[1].distance_km);
    }

    #[test]
    fn radius_and_limit_are_respected() {
        let index = GeoIndex::default();
        let now = Utc::now();
        for km in [0.3, 0.6, 0.9, 5.0] {
            index.upsert(DriverId::new(), east_of(km), Availability::Available, now);
        }
        assert_eq!(index.nearest_available(CENTER, 1.0, 10).len(), 3);
        assert_eq!(index.nearest_available(CENTER, 1.0, 2).len(), 2);
        assert_eq!(index.nearest_available(CENTER, 6.0, 10).len(), 4);
    }

    #[test]
    fn moving_a_driver_leaves_one_entry() {
        let index = GeoIndex::default();
        let driver = DriverId::new();
        let now = Utc::now();
        index.upsert(driver, east_of(4.0), Availability::Available, now);
        index.upsert(
            driver,
            east_of(0.1),
            Availability::Available,
            now + chrono::Duration::seconds(5),
        );

        assert_eq!(index.len(), 1);
        let hits = index.nearest_available(CENTER, 10.0, 10);
        assert_eq!(hits.len(), 1);
        assert!(hits[0].distance_km < 0.2);
    }

    #[test]
    fn older_positions_do_not_overwrite_newer_ones() {
        let index = GeoIndex::default();
        let driver = DriverId::new();
        let now = Utc::now();
        index.upsert(driver, east_of(0.1), Availability::Available, now);
        let applied = index.upsert(
            driver,
            east_of(3.0),
            Availability::Available,
            now - chrono::Duration::seconds(10),
        );
        assert!(!applied);
        assert_eq!(index.position(driver), Some(east_of(0.1)));
    }

    #[test]
    fn limit_counts_only_eligible_drivers() {
        let index = GeoIndex::default();
        let now = Utc::now();
        let crowd: Vec<_> = (1..=5)
            .map(|step| {
                let driver = DriverId::new();
                index.upsert(driver, east_of(0.05 * step as f64), Availability::Available, now);
                driver
            })
            .collect();
        let free = DriverId::new();
        index.upsert(free, east_of(1.0), Availability::Available, now);

        let hits = index.nearest_matching(CENTER, 3.0, 2, |driver| !crowd.contains(&driver));
        let ids: Vec<_> = hits.iter().map(|hit| hit.driver_id).collect();
        assert_eq!(ids, vec![free]);
    }

    #[test]
    fn moving_keeps_the_indexed_availability() {
        let index = GeoIndex::default();
        let driver = DriverId::new();
        let now = Utc::now();
        index.upsert(driver, east_of(0.1), Availability::Available, now);
        index.set_availability(driver, Availability::OnTrip);

        // Availability read before the driver was put on a trip.
        assert!(index.upsert(
            driver,
            east_of(0.2),
            Availability::Available,
            now + chrono::Duration::seconds(5),
        ));
        assert_eq!(index.position(driver), Some(east_of(0.2)));
        assert!(index.nearest_available(CENTER, 3.0, 10).is_empty());
    }

    #[test]
    fn offline_removes_driver() {
        let index = GeoIndex::default();
        let driver = DriverId::new();
        index.upsert(driver, east_of(0.1), Availability::Available, Utc::now());
        index.set_availability(driver, Availability::Offline);
        assert!(index.is_empty());
        assert!(index.nearest_available(CENTER, 5.0, 5).is_empty());
    }

    #[test]
    fn rebuild_uses_stored_positions() {
        let index = GeoIndex::default();
        index.upsert(DriverId::new(), east_of(0.1), Availability::Available, Utc::now());

        let vehicle = VehicleDescriptor {
            class: VehicleClass::new("standard"),
            plate: "B-XY 123".into(),
            model: "Prius".into(),
        };
        let mut online = DriverState::new(DriverId::new(), vehicle.clone());
        online.availability = Availability::Available;
        online.last_location = Some(LocationSample {
            driver_id: online.driver_id,
            point: east_of(0.4),
            heading: None,
            timestamp: Utc::now(),
        });
        let offline = DriverState::new(DriverId::new(), vehicle);

        assert_eq!(index.rebuild([&online, &offline]), 1);
        assert_eq!(index.position(online.driver_id), Some(east_of(0.4)));
        assert_eq!(index.len(), 1);
    }
}
