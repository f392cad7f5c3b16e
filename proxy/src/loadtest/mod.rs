//! LoadTest is the k8s custom resource recording a requested load test, and the operations
//! clients run against it.
mod spec;
pub use spec::*;

pub(crate) mod service;

pub use service::{create, delete, get, list, logs, persist_report, show_report, ListFilter};
