use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Default run time of a load test in seconds.
pub const DEFAULT_DURATION_SECS: u64 = 60;

/// Primary CRD recording a load test.
///
/// The resource only records what was requested. Its phase is never stored, it is derived
/// from the units labeled with the resource name whenever it is read.
#[derive(CustomResource, Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "stampede.io",
    version = "v1alpha1",
    kind = "LoadTest",
    plural = "loadtests",
    derive = "PartialEq",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct LoadTestSpec {
    /// Identifier of the backend that runs the load test.
    pub backend: String,
    /// Number of distributed workers requested.
    pub workers: u32,
    /// Content of the test script.
    pub test_file: Option<String>,
    /// Content of an auxiliary data file made available next to the script.
    pub test_data: Option<String>,
    /// System under test.
    pub target_url: Option<String>,
    /// Time in seconds to run the load test.
    pub duration: Option<u64>,
    /// Image override for the master unit.
    pub master_image: Option<String>,
    /// Image override for worker units.
    pub worker_image: Option<String>,
    /// Tags copied onto every unit as labels.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// Environment overrides applied on top of the backend defaults.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Resource requests for worker units.
    pub resources: Option<ResourcesSpec>,
}

impl LoadTestSpec {
    /// Run time of the load test in seconds.
    pub fn duration_secs(&self) -> u64 {
        self.duration.unwrap_or(DEFAULT_DURATION_SECS)
    }

    /// Image overrides present on the spec.
    pub fn image_overrides(&self) -> impl Iterator<Item = &str> {
        self.master_image
            .iter()
            .chain(self.worker_image.iter())
            .map(String::as_str)
    }
}

/// Resource requests a client may override.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourcesSpec {
    /// Cpu resource request
    pub cpu: Option<Quantity>,
    /// Memory resource request
    pub memory: Option<Quantity>,
}

/// Resource requests of a unit.
#[derive(Debug, PartialEq, Clone)]
pub struct ResourcesConfig {
    /// Cpu resource request
    pub cpu: Quantity,
    /// Memory resource request
    pub memory: Quantity,
}

impl ResourcesConfig {
    /// Resolve resources from an optional spec, falling back to defaults.
    pub fn from_spec(spec: Option<&ResourcesSpec>, defaults: Self) -> Self {
        if let Some(spec) = spec {
            Self {
                cpu: spec.cpu.clone().unwrap_or(defaults.cpu),
                memory: spec.memory.clone().unwrap_or(defaults.memory),
            }
        } else {
            defaults
        }
    }
}

impl From<ResourcesConfig> for BTreeMap<String, Quantity> {
    fn from(value: ResourcesConfig) -> Self {
        BTreeMap::from_iter([
            ("cpu".to_owned(), value.cpu),
            ("memory".to_owned(), value.memory),
        ])
    }
}

impl LoadTest {
    /// Identifier of the load test.
    pub fn id(&self) -> String {
        self.name_any()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_defaults_missing_fields() {
        let spec: LoadTestSpec =
            serde_json::from_str(r#"{"backend":"fake","workers":2}"#).unwrap();
        assert_eq!(spec.backend, "fake");
        assert_eq!(spec.workers, 2);
        assert!(spec.tags.is_empty());
        assert_eq!(spec.duration_secs(), DEFAULT_DURATION_SECS);
        assert_eq!(spec.image_overrides().count(), 0);
    }

    #[test]
    fn resources_fall_back_to_defaults() {
        let defaults = ResourcesConfig {
            cpu: Quantity("1".to_owned()),
            memory: Quantity("1Gi".to_owned()),
        };
        let spec = ResourcesSpec {
            cpu: Some(Quantity("2".to_owned())),
            memory: None,
        };
        let resources = ResourcesConfig::from_spec(Some(&spec), defaults.clone());
        assert_eq!(resources.cpu, Quantity("2".to_owned()));
        assert_eq!(resources.memory, Quantity("1Gi".to_owned()));
        assert_eq!(ResourcesConfig::from_spec(None, defaults.clone()), defaults);
    }
}
