//! Utils is shared functions and constants for the proxy
use std::sync::{Arc, Mutex};


use anyhow::Result;
use k8s_openapi::chrono::{DateTime, Utc};
use rand::{rngs::StdRng, thread_rng, RngCore, SeedableRng};

use crate::{backend::Registry, cluster::ClusterState, config::Limits, report::ReportStore};

const ID_PREFIX: &str = "loadtest-";
const ID_LEN: usize = 10;
const ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Proxy Context
pub struct Context<S, R, C> {
    /// Accessor of the cluster state
    pub cluster: S,
    /// Registered backends
    pub registry: Registry,
    /// Admission and listing limits
    pub limits: Limits,
    /// Store of finished reports
    pub reports: Arc<dyn ReportStore>,
    /// Random number generator
    pub rng: Mutex<R>,
    /// Clock that provide the current time
    pub clock: C,
}

impl<S> Context<S, StdRng, UtcClock> {
    /// Create new context
    pub fn new(
        cluster: S,
        registry: Registry,
        limits: Limits,
        reports: Arc<dyn ReportStore>,
    ) -> Result<Self>
    where
        S: ClusterState,
    {
        Ok(Context {
            cluster,
            registry,
            limits,
            reports,
            rng: Mutex::new(StdRng::from_rng(thread_rng())?),
            clock: UtcClock,
        })
    }
}

/// Provides the current time.
pub trait Clock: Send + Sync {
    /// Report the current time.
    fn now(&self) -> DateTime<Utc>;
}

/// Provides the current time using real time.
pub struct UtcClock;
impl Clock for UtcClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Generate a random identifier for a new load test.
///
/// Identifiers are valid k8s object names and label values.
pub fn generate_id(cx: &Context<impl ClusterState, impl RngCore, impl Clock>) -> String {
    let mut bytes = [0u8; ID_LEN];
    let mut rng = cx.rng.lock().expect("should be able to acquire lock");
    rng.fill_bytes(&mut bytes);
    ID_PREFIX
        .chars()
        .chain(
            bytes
                .iter()
                .map(|b| ID_ALPHABET[*b as usize % ID_ALPHABET.len()] as char),
        )
        .collect()
}
