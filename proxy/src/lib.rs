//! Admission and lifecycle tracking of distributed load tests running on K8s.
#![warn(missing_docs)]

/// Admission of new load tests.
pub mod admission;
/// HTTP surface.
pub mod api;
/// Backends building the workload of each load generation tool.
pub mod backend;
/// Access to the cluster state.
pub mod cluster;
/// Command line configuration.
pub mod config;
/// Errors of the proxy.
pub mod error;
/// Labels module for managing resource labels.
pub(crate) mod labels;
/// Derivation of load test phases.
pub mod lifecycle;
/// The load test resource and its operations.
pub mod loadtest;
/// Report storage.
pub mod report;
/// Utils module for shared utility functions.
pub mod utils;

/// A list of constants used in various K8s resources
const CONTROLLER_NAME: &str = "stampede";
