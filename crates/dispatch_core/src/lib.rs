//! Ride lifecycle and dispatch engine: driver matching, the trip state
//! machine, live location and ETA, mid-trip stops and settlement.
//!
//! [`engine::DispatchEngine`] is the entry point; the modules below are its
//! components and can be used on their own.

pub mod clock;
pub mod config;
pub mod driver;
pub mod engine;
pub mod error;
pub mod events;
pub mod geo;
pub mod location;
pub mod matching;
pub mod pricing;
pub mod retry;
pub mod ride;
pub mod routing;
pub mod settlement;
pub mod spatial;
pub mod state_machine;
pub mod stops;
pub mod store;
pub mod telemetry;
pub mod types;

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers;

pub use engine::{ClosedRide, DispatchEngine, EngineBuilder, MaintenanceReport};
pub use error::{DispatchError, DispatchResult, StoreError};
