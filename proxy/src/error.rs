//! Errors produced while admitting, building and tracking load tests.

/// Result type used across the proxy library.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors produced by the load test operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The request violates policy: unknown backend, disallowed image, out of range workers.
    #[error("validation error: {0}")]
    Validation(String),
    /// A backend could not build a workload from the spec.
    #[error("invalid spec: {0}")]
    InvalidSpec(String),
    /// No backend is registered with the identifier.
    #[error("unknown backend: {0}")]
    UnknownBackend(String),
    /// A backend with the identifier was already registered.
    #[error("duplicate backend: {0}")]
    DuplicateBackend(String),
    /// Too many load tests are pending or running.
    #[error("capacity exceeded: {active} load tests active, limit is {max}")]
    CapacityExceeded {
        /// Number of active load tests observed.
        active: usize,
        /// Configured limit.
        max: usize,
    },
    /// The load test or one of its units does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// Kube error
    #[error("Kube error: {source}")]
    Kube {
        /// Underlying error
        #[from]
        source: kube::Error,
    },
    /// IO error
    #[error("IO error: {source}")]
    Io {
        /// Underlying error
        #[from]
        source: std::io::Error,
    },
    /// App error
    #[error("App error: {source}")]
    App {
        /// Underlying error
        #[from]
        source: anyhow::Error,
    },
}

impl Error {
    /// Reports whether the error is caused by the request itself rather than the system.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::Validation(_) | Error::InvalidSpec(_) | Error::UnknownBackend(_)
        )
    }
}
