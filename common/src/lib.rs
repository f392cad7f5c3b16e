//! Provides types and functions that are common to the proxy and its clients.
#![deny(missing_docs)]
#[cfg(feature = "telemetry")]
pub mod telemetry;
