//! OSRM `/route` backend.
//!
//! Blocking HTTP client with a short timeout. Transport failures and 5xx
//! answers are transient; 4xx, malformed bodies and non-`Ok` codes are not.

mod client;
mod error;
mod parser;
mod response;

#[cfg(test)]
mod tests;

pub use client::OsrmRouteProvider;
pub use error::OsrmError;
