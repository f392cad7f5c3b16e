//! Backends translate a load test spec into the units of a distributed workload.
//!
//! Each supported load generation tool has a different topology, a single process or a master
//! coordinating a fan out of workers. The [`Backend`] trait hides that difference from admission
//! and lifecycle tracking, and the [`Registry`] maps a backend identifier to its strategy.
pub(crate) mod fake;
pub(crate) mod ghz;
pub(crate) mod jmeter;
pub(crate) mod k6;
pub(crate) mod locust;

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    ops::RangeInclusive,
    sync::Arc,
};

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use tracing::{info, warn};

use crate::{
    config::WorkerBounds,
    error::{Error, Result},
    labels::{load_test_labels, ROLE_LABEL, WORKER_INDEX_LABEL},
    loadtest::{LoadTestSpec, ResourcesConfig},
};

/// Path where test files are mounted inside every unit.
pub const FILES_MOUNT_PATH: &str = "/data";
/// File name of the auxiliary test data.
pub const TEST_DATA_FILE_NAME: &str = "testdata.csv";

/// Role a unit plays in a distributed workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Role {
    /// Coordinates the run and aggregates results.
    Master,
    /// Generates load, identified by its index.
    Worker(u32),
}

impl Role {
    /// Value of the role label.
    pub fn label(&self) -> &'static str {
        match self {
            Role::Master => "master",
            Role::Worker(_) => "worker",
        }
    }

    /// Name of the unit playing this role in the load test.
    pub fn unit_name(&self, load_test: &str) -> String {
        match self {
            Role::Master => format!("{load_test}-master"),
            Role::Worker(index) => format!("{load_test}-worker-{index}"),
        }
    }

    /// Parse a role from unit labels.
    pub fn from_labels(labels: &BTreeMap<String, String>) -> Option<Self> {
        match labels.get(ROLE_LABEL).map(String::as_str) {
            Some("master") => Some(Role::Master),
            Some("worker") => labels
                .get(WORKER_INDEX_LABEL)
                .and_then(|index| index.parse().ok())
                .map(Role::Worker),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Master => f.write_str("master"),
            Role::Worker(index) => write!(f, "worker {index}"),
        }
    }
}

/// Describes one schedulable unit of a workload.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitSpec {
    /// Name of the unit, unique in the namespace.
    pub name: String,
    /// Role of the unit.
    pub role: Role,
    /// Resolved container image.
    pub image: String,
    /// Entrypoint override, empty to use the image default.
    pub command: Vec<String>,
    /// Arguments passed to the entrypoint.
    pub args: Vec<String>,
    /// Environment of the unit.
    pub env: BTreeMap<String, String>,
    /// Labels tagging the unit with its load test.
    pub labels: BTreeMap<String, String>,
    /// Resource requests.
    pub resources: BTreeMap<String, Quantity>,
}

/// Cluster independent description of a workload, produced by a backend.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkloadDescription {
    /// Load test the workload belongs to.
    pub load_test: String,
    /// Files made available to every unit under [`FILES_MOUNT_PATH`].
    pub files: BTreeMap<String, String>,
    /// Named ports of the master that workers connect to.
    pub master_ports: Vec<(String, i32)>,
    /// Named ports of the workers that the master connects to. When set, every worker is
    /// reachable at [`worker_host`].
    pub worker_ports: Vec<(String, i32)>,
    /// The coordinating unit.
    pub master: UnitSpec,
    /// Load generating units ordered by index.
    pub workers: Vec<UnitSpec>,
}

impl WorkloadDescription {
    /// Iterate over all units, master first.
    pub fn units(&self) -> impl Iterator<Item = &UnitSpec> {
        std::iter::once(&self.master).chain(self.workers.iter())
    }
}

/// Name of the headless service giving the workers of a load test stable host names.
pub fn worker_service_name(load_test: &str) -> String {
    format!("{load_test}-workers")
}

/// Host name of a worker, resolvable inside the namespace.
pub fn worker_host(load_test: &str, role: Role) -> String {
    format!(
        "{}.{}",
        role.unit_name(load_test),
        worker_service_name(load_test)
    )
}

/// Strategy building the workload of one load generation tool.
pub trait Backend: Send + Sync {
    /// Build the workload for a load test.
    fn build(&self, id: &str, spec: &LoadTestSpec) -> Result<WorkloadDescription>;

    /// Number of worker units the workload has for the spec.
    fn worker_units(&self, spec: &LoadTestSpec) -> u32;
}

/// Registration entry of a backend.
#[derive(Clone)]
pub struct BackendDescriptor {
    /// Identifier clients request the backend by.
    pub id: String,
    /// Smallest supported worker count.
    pub min_workers: u32,
    /// Largest supported worker count.
    pub max_workers: u32,
    /// Workload building strategy.
    pub backend: Arc<dyn Backend>,
}

impl fmt::Debug for BackendDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendDescriptor")
            .field("id", &self.id)
            .field("min_workers", &self.min_workers)
            .field("max_workers", &self.max_workers)
            .finish()
    }
}

impl BackendDescriptor {
    /// Create a descriptor.
    pub fn new(id: &str, workers: RangeInclusive<u32>, backend: impl Backend + 'static) -> Self {
        Self {
            id: id.to_owned(),
            min_workers: *workers.start(),
            max_workers: *workers.end(),
            backend: Arc::new(backend),
        }
    }

    /// Supported worker range.
    pub fn workers(&self) -> RangeInclusive<u32> {
        self.min_workers..=self.max_workers
    }

    /// Build the workload, enforcing the declared worker range.
    pub fn build(&self, id: &str, spec: &LoadTestSpec) -> Result<WorkloadDescription> {
        if !self.workers().contains(&spec.workers) {
            return Err(Error::InvalidSpec(format!(
                "backend {} supports {} to {} workers, got {}",
                self.id, self.min_workers, self.max_workers, spec.workers
            )));
        }
        self.backend.build(id, spec)
    }
}

/// Maps backend identifiers to their descriptors.
///
/// Populated once at startup and only read afterwards.
#[derive(Debug, Default)]
pub struct Registry {
    backends: HashMap<String, BackendDescriptor>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry of the compiled in backends.
    ///
    /// When `enabled` is not empty only the named backends are registered. Bounds narrow the
    /// worker range of a backend, they never widen it.
    pub fn with_defaults(enabled: &[String], bounds: &[WorkerBounds]) -> Result<Self> {
        let defaults = vec![
            BackendDescriptor::new(fake::ID, 1..=5, fake::Fake),
            BackendDescriptor::new(jmeter::ID, 1..=100, jmeter::JMeter),
            BackendDescriptor::new(locust::ID, 1..=100, locust::Locust),
            BackendDescriptor::new(k6::ID, 1..=1, k6::K6),
            BackendDescriptor::new(ghz::ID, 1..=1, ghz::Ghz),
        ];
        if let Some(unknown) = enabled
            .iter()
            .find(|id| !defaults.iter().any(|d| &d.id == *id))
        {
            return Err(Error::UnknownBackend(unknown.to_owned()));
        }

        let mut registry = Self::new();
        for mut descriptor in defaults {
            if !enabled.is_empty() && !enabled.contains(&descriptor.id) {
                continue;
            }
            if let Some(bound) = bounds.iter().find(|b| b.backend == descriptor.id) {
                let min = bound.min.max(descriptor.min_workers);
                let max = bound.max.min(descriptor.max_workers);
                if min != bound.min || max != bound.max {
                    warn!(
                        backend = %descriptor.id,
                        min, max, "worker bounds clamped to supported range"
                    );
                }
                descriptor.min_workers = min;
                descriptor.max_workers = max.max(min);
            }
            info!(
                backend = %descriptor.id,
                min_workers = descriptor.min_workers,
                max_workers = descriptor.max_workers,
                "registered backend"
            );
            registry.register(descriptor)?;
        }
        Ok(registry)
    }

    /// Register a backend, failing if the identifier is taken.
    pub fn register(&mut self, descriptor: BackendDescriptor) -> Result<()> {
        if self.backends.contains_key(&descriptor.id) {
            return Err(Error::DuplicateBackend(descriptor.id));
        }
        self.backends.insert(descriptor.id.clone(), descriptor);
        Ok(())
    }

    /// Find the descriptor registered under an identifier.
    pub fn resolve(&self, id: &str) -> Result<&BackendDescriptor> {
        self.backends
            .get(id)
            .ok_or_else(|| Error::UnknownBackend(id.to_owned()))
    }

    /// Identifiers of all registered backends, sorted.
    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.backends.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}

/// Default images of a backend.
pub(crate) struct Images {
    pub master: &'static str,
    pub worker: &'static str,
}

/// Assemble a unit carrying the labels, environment and resources shared by every backend.
pub(crate) fn unit(
    id: &str,
    role: Role,
    spec: &LoadTestSpec,
    images: &Images,
    command: Vec<String>,
    args: Vec<String>,
    mut env: BTreeMap<String, String>,
) -> UnitSpec {
    let image = match role {
        Role::Master => spec.master_image.as_deref().unwrap_or(images.master),
        Role::Worker(_) => spec.worker_image.as_deref().unwrap_or(images.worker),
    };

    let mut labels = spec.tags.clone();
    labels.extend(load_test_labels(id));
    labels.insert(ROLE_LABEL.to_owned(), role.label().to_owned());
    if let Role::Worker(index) = role {
        labels.insert(WORKER_INDEX_LABEL.to_owned(), index.to_string());
    }

    env.insert("LOAD_TEST_ID".to_owned(), id.to_owned());
    env.insert("DURATION".to_owned(), spec.duration_secs().to_string());
    if let Some(target) = &spec.target_url {
        env.insert("TARGET_URL".to_owned(), target.to_owned());
    }
    env.extend(spec.env.clone());

    let resources = match role {
        Role::Master => default_master_resources(),
        Role::Worker(_) => {
            ResourcesConfig::from_spec(spec.resources.as_ref(), default_worker_resources())
        }
    };

    UnitSpec {
        name: role.unit_name(id),
        role,
        image: image.to_owned(),
        command,
        args,
        env,
        labels,
        resources: resources.into(),
    }
}

fn default_master_resources() -> ResourcesConfig {
    ResourcesConfig {
        cpu: Quantity("250m".to_owned()),
        memory: Quantity("256Mi".to_owned()),
    }
}

fn default_worker_resources() -> ResourcesConfig {
    ResourcesConfig {
        cpu: Quantity("1".to_owned()),
        memory: Quantity("1Gi".to_owned()),
    }
}

/// Collect the test files of a spec, failing if the script is required but missing.
pub(crate) fn files(
    backend: &str,
    spec: &LoadTestSpec,
    test_file_name: &str,
    require_test_file: bool,
) -> Result<BTreeMap<String, String>> {
    let mut files = BTreeMap::new();
    match &spec.test_file {
        Some(content) if !content.trim().is_empty() => {
            files.insert(test_file_name.to_owned(), content.to_owned());
        }
        _ if require_test_file => {
            return Err(Error::InvalidSpec(format!(
                "backend {backend} requires a test file"
            )))
        }
        _ => {}
    }
    if let Some(data) = &spec.test_data {
        files.insert(TEST_DATA_FILE_NAME.to_owned(), data.to_owned());
    }
    Ok(files)
}

/// Path of a mounted file.
pub(crate) fn mounted(file_name: &str) -> String {
    format!("{FILES_MOUNT_PATH}/{file_name}")
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;
    impl Backend for Noop {
        fn build(&self, _id: &str, _spec: &LoadTestSpec) -> Result<WorkloadDescription> {
            Err(Error::InvalidSpec("noop".to_owned()))
        }
        fn worker_units(&self, _spec: &LoadTestSpec) -> u32 {
            0
        }
    }

    #[test]
    fn register_duplicate_fails() {
        let mut registry = Registry::new();
        registry
            .register(BackendDescriptor::new("noop", 1..=1, Noop))
            .unwrap();
        let err = registry
            .register(BackendDescriptor::new("noop", 1..=2, Noop))
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateBackend(id) if id == "noop"));
    }

    #[test]
    fn resolve_unknown_fails() {
        let registry = Registry::with_defaults(&[], &[]).unwrap();
        assert!(matches!(
            registry.resolve("gatling"),
            Err(Error::UnknownBackend(id)) if id == "gatling"
        ));
        assert_eq!(registry.ids(), vec!["fake", "ghz", "jmeter", "k6", "locust"]);
    }

    #[test]
    fn enabled_subset() {
        let registry =
            Registry::with_defaults(&["fake".to_owned(), "k6".to_owned()], &[]).unwrap();
        assert_eq!(registry.ids(), vec!["fake", "k6"]);
    }

    #[test]
    fn enabled_unknown_fails() {
        let err = Registry::with_defaults(&["gatling".to_owned()], &[]).unwrap_err();
        assert!(matches!(err, Error::UnknownBackend(id) if id == "gatling"));
    }

    #[test]
    fn bounds_only_narrow() {
        let bounds = vec![
            WorkerBounds {
                backend: "jmeter".to_owned(),
                min: 2,
                max: 10,
            },
            WorkerBounds {
                backend: "fake".to_owned(),
                min: 0,
                max: 50,
            },
        ];
        let registry = Registry::with_defaults(&[], &bounds).unwrap();
        assert_eq!(registry.resolve("jmeter").unwrap().workers(), 2..=10);
        assert_eq!(registry.resolve("fake").unwrap().workers(), 1..=5);
    }

    #[test]
    fn build_enforces_range() {
        let registry = Registry::with_defaults(&[], &[]).unwrap();
        let spec = LoadTestSpec {
            backend: "fake".to_owned(),
            workers: 10,
            ..Default::default()
        };
        let err = registry
            .resolve("fake")
            .unwrap()
            .build("loadtest-a", &spec)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidSpec(_)));
    }

    #[test]
    fn role_round_trips_through_labels() {
        let spec = LoadTestSpec::default();
        let images = Images {
            master: "m",
            worker: "w",
        };
        for role in [Role::Master, Role::Worker(3)] {
            let unit = unit("lt", role, &spec, &images, vec![], vec![], BTreeMap::new());
            assert_eq!(Role::from_labels(&unit.labels), Some(role));
        }
    }

    #[test]
    fn unit_applies_overrides() {
        let spec = LoadTestSpec {
            worker_image: Some("custom/worker:1".to_owned()),
            tags: BTreeMap::from_iter([("team".to_owned(), "perf".to_owned())]),
            env: BTreeMap::from_iter([("DURATION".to_owned(), "5".to_owned())]),
            ..Default::default()
        };
        let images = Images {
            master: "m",
            worker: "w",
        };
        let worker = unit(
            "lt",
            Role::Worker(0),
            &spec,
            &images,
            vec![],
            vec![],
            BTreeMap::new(),
        );
        assert_eq!(worker.name, "lt-worker-0");
        assert_eq!(worker.image, "custom/worker:1");
        assert_eq!(worker.env["DURATION"], "5");
        assert_eq!(worker.labels["team"], "perf");
        assert_eq!(worker.labels["stampede.io/worker-index"], "0");
        let master = unit("lt", Role::Master, &spec, &images, vec![], vec![], BTreeMap::new());
        assert_eq!(master.image, "m");
    }
}
