//! Realtime fan-out. One broadcast topic per ride and per driver; the
//! transport that delivers them to apps subscribes here.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::geo::GeoPoint;
use crate::pricing::Money;
use crate::ride::RideStatus;
use crate::types::{DriverId, OfferId, RideId};

const TOPIC_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum RideEvent {
    StatusChanged {
        ride_id: RideId,
        from: Option<RideStatus>,
        to: RideStatus,
        at: DateTime<Utc>,
    },
    DriverLocation {
        ride_id: RideId,
        driver_id: DriverId,
        point: GeoPoint,
        heading: Option<f64>,
        at: DateTime<Utc>,
    },
    EtaUpdated {
        ride_id: RideId,
        eta_s: f64,
        distance_m: f64,
        at: DateTime<Utc>,
    },
    RouteChanged {
        ride_id: RideId,
        stop_count: usize,
        estimated_fare: Money,
        polyline: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum DriverEvent {
    OfferReceived {
        offer_id: OfferId,
        ride_id: RideId,
        pickup: GeoPoint,
        expires_at: DateTime<Utc>,
    },
    OfferWithdrawn {
        offer_id: OfferId,
    },
    RideAssigned {
        ride_id: RideId,
    },
    RideClosed {
        ride_id: RideId,
        status: RideStatus,
    },
}

struct Topics<K, E> {
    senders: Mutex<HashMap<K, broadcast::Sender<E>>>,
}

impl<K: Eq + Hash + Copy, E: Clone> Topics<K, E> {
    fn new() -> Self {
        Self {
            senders: Mutex::new(HashMap::new()),
        }
    }

    fn subscribe(&self, key: K) -> broadcast::Receiver<E> {
        let mut senders = self
            .senders
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        senders
            .entry(key)
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .subscribe()
    }

    /// Returns the number of subscribers reached.
    fn publish(&self, key: K, event: E) -> usize {
        let mut senders = self
            .senders
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(sender) = senders.get(&key) else {
            return 0;
        };
        match sender.send(event) {
            Ok(reached) => reached,
            Err(_) => {
                // Every receiver is gone.
                senders.remove(&key);
                0
            }
        }
    }

    fn close(&self, key: K) {
        let mut senders = self
            .senders
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        senders.remove(&key);
    }
}

pub struct EventBus {
    rides: Topics<RideId, RideEvent>,
    drivers: Topics<DriverId, DriverEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            rides: Topics::new(),
            drivers: Topics::new(),
        }
    }

    pub fn subscribe_ride(&self, ride_id: RideId) -> broadcast::Receiver<RideEvent> {
        self.rides.subscribe(ride_id)
    }

    pub fn subscribe_driver(&self, driver_id: DriverId) -> broadcast::Receiver<DriverEvent> {
        self.drivers.subscribe(driver_id)
    }

    pub fn publish_ride(&self, ride_id: RideId, event: RideEvent) -> usize {
        self.rides.publish(ride_id, event)
    }

    pub fn publish_driver(&self, driver_id: DriverId, event: DriverEvent) -> usize {
        self.drivers.publish(driver_id, event)
    }

    /// Drops the ride topic; existing receivers see the channel close.
    pub fn close_ride(&self, ride_id: RideId) {
        self.rides.close(ride_id);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribers_receive_events_for_their_topic_only() {
        let bus = EventBus::new();
        let ride_a = RideId::new();
        let ride_b = RideId::new();
        let mut rx_a = bus.subscribe_ride(ride_a);

        let event = RideEvent::StatusChanged {
            ride_id: ride_a,
            from: Some(RideStatus::Searching),
            to: RideStatus::DriverAssigned,
            at: Utc::now(),
        };
        assert_eq!(bus.publish_ride(ride_a, event.clone()), 1);
        assert_eq!(bus.publish_ride(ride_b, event.clone()), 0);
        assert_eq!(rx_a.try_recv().expect("event"), event);
        assert!(rx_a.try_recv().is_err());
    }

    #[test]
    fn publishing_without_subscribers_is_not_an_error() {
        let bus = EventBus::new();
        let driver = DriverId::new();
        let reached = bus.publish_driver(
            driver,
            DriverEvent::OfferWithdrawn {
                offer_id: OfferId::new(),
            },
        );
        assert_eq!(reached, 0);
    }
}
