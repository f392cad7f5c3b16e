use std::{collections::BTreeMap, io};

use async_trait::async_trait;
use k8s_openapi::{
    api::{
        batch::v1::{Job, JobSpec, JobStatus},
        core::v1::{
            ConfigMap, ConfigMapVolumeSource, Container, EnvVar, Pod, PodSpec, PodTemplateSpec,
            ResourceRequirements, Service, ServicePort, ServiceSpec, Volume, VolumeMount,
        },
    },
    apimachinery::pkg::apis::meta::v1::OwnerReference,
    chrono::{DateTime, Utc},
};
use kube::{
    api::{DeleteParams, ListParams, LogParams, Patch, PatchParams, PostParams},
    client::Client,
    core::ObjectMeta,
    Api, Resource, ResourceExt,
};
use stampede_common::load_test::UnitState;
use tracing::{debug, warn};

use crate::{
    backend::{worker_service_name, Role, UnitSpec, WorkloadDescription, FILES_MOUNT_PATH},
    cluster::{forward_logs, log_channel, ClusterState, LogStream, Unit},
    error::Result,
    labels::{
        load_test_labels, load_test_selector, managed_labels_extend, LOAD_TEST_LABEL,
        MANAGED_BY_LABEL_SELECTOR, ROLE_LABEL, WORKER_INDEX_LABEL,
    },
    loadtest::{LoadTest, LoadTestSpec},
    CONTROLLER_NAME,
};

const FILES_VOLUME_NAME: &str = "test-files";

/// Name of the config map holding the test files of a load test.
pub fn files_config_map_name(id: &str) -> String {
    format!("{id}-files")
}

/// Cluster state kept in Kubernetes.
///
/// Records are `LoadTest` custom resources, units are Jobs. Everything lives in one namespace.
#[derive(Clone)]
pub struct KubeClusterState {
    client: Client,
    namespace: String,
}

impl KubeClusterState {
    /// Create an accessor for the namespace.
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            client,
            namespace: namespace.to_owned(),
        }
    }

    fn api<K>(&self) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    async fn apply_job(
        &self,
        orefs: Vec<OwnerReference>,
        unit: &UnitSpec,
        files: Option<&str>,
        subdomain: Option<&str>,
    ) -> Result<Option<JobStatus>, kube::Error> {
        let serverside = PatchParams::apply(CONTROLLER_NAME);
        let jobs: Api<Job> = self.api();

        // Server-side apply job
        let job = Job {
            metadata: ObjectMeta {
                name: Some(unit.name.to_owned()),
                owner_references: Some(orefs),
                labels: Some(unit.labels.clone()),
                ..ObjectMeta::default()
            },
            spec: Some(job_spec(unit, files, subdomain)),
            ..Default::default()
        };
        let job = jobs.patch(&unit.name, &serverside, &Patch::Apply(job)).await?;
        Ok(job.status)
    }

    async fn apply_config_map(
        &self,
        orefs: Vec<OwnerReference>,
        name: &str,
        labels: BTreeMap<String, String>,
        data: BTreeMap<String, String>,
    ) -> Result<(), kube::Error> {
        let serverside = PatchParams::apply(CONTROLLER_NAME);
        let config_maps: Api<ConfigMap> = self.api();
        let map_data = ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_owned()),
                owner_references: Some(orefs),
                labels: Some(labels),
                ..ObjectMeta::default()
            },
            data: Some(data),
            ..Default::default()
        };
        config_maps
            .patch(name, &serverside, &Patch::Apply(map_data))
            .await?;
        Ok(())
    }

    async fn apply_service(
        &self,
        orefs: Vec<OwnerReference>,
        name: &str,
        labels: BTreeMap<String, String>,
        spec: ServiceSpec,
    ) -> Result<(), kube::Error> {
        let serverside = PatchParams::apply(CONTROLLER_NAME);
        let services: Api<Service> = self.api();
        let service = Service {
            metadata: ObjectMeta {
                name: Some(name.to_owned()),
                owner_references: Some(orefs),
                labels: Some(labels),
                ..ObjectMeta::default()
            },
            spec: Some(spec),
            ..Default::default()
        };
        services
            .patch(name, &serverside, &Patch::Apply(service))
            .await?;
        Ok(())
    }

    async fn delete_service(&self, name: &str) -> Result<(), kube::Error> {
        let services: Api<Service> = self.api();
        match services.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(err)) if err.reason == "NotFound" => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn units(&self, selector: &str) -> Result<Vec<Unit>> {
        let jobs: Api<Job> = self.api();
        let jobs = jobs.list(&ListParams::default().labels(selector)).await?;
        Ok(jobs.items.iter().filter_map(unit_from_job).collect())
    }
}

#[async_trait]
impl ClusterState for KubeClusterState {
    async fn create_load_test(&self, id: &str, spec: &LoadTestSpec) -> Result<LoadTest> {
        let load_tests: Api<LoadTest> = self.api();
        let mut record = LoadTest::new(id, spec.clone());
        record.metadata.labels = Some(managed_labels_extend(spec.tags.clone()));
        Ok(load_tests.create(&PostParams::default(), &record).await?)
    }

    async fn get_load_test(&self, id: &str) -> Result<Option<LoadTest>> {
        let load_tests: Api<LoadTest> = self.api();
        Ok(load_tests.get_opt(id).await?)
    }

    async fn list_load_tests(&self) -> Result<Vec<LoadTest>> {
        let load_tests: Api<LoadTest> = self.api();
        let list = load_tests
            .list(&ListParams::default().labels(MANAGED_BY_LABEL_SELECTOR))
            .await?;
        Ok(list.items)
    }

    async fn delete_load_test(&self, id: &str) -> Result<()> {
        let load_tests: Api<LoadTest> = self.api();
        match load_tests.delete(id, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(err)) if err.reason == "NotFound" => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_units(&self, owner: &LoadTest, workload: &WorkloadDescription) -> Result<()> {
        let id = &workload.load_test;
        let orefs: Vec<OwnerReference> = owner.controller_owner_ref(&()).into_iter().collect();

        let files = if workload.files.is_empty() {
            None
        } else {
            let name = files_config_map_name(id);
            self.apply_config_map(
                orefs.clone(),
                &name,
                load_test_labels(id),
                workload.files.clone(),
            )
            .await?;
            Some(name)
        };

        if !workload.master_ports.is_empty() {
            let spec = ServiceSpec {
                selector: Some(role_selector(id, Role::Master)),
                ports: Some(service_ports(&workload.master_ports)),
                ..Default::default()
            };
            self.apply_service(
                orefs.clone(),
                &workload.master.name,
                load_test_labels(id),
                spec,
            )
            .await?;
        }

        // Workers register under a headless service so the master can resolve each of them.
        let worker_service = if workload.worker_ports.is_empty() {
            None
        } else {
            let name = worker_service_name(id);
            let spec = ServiceSpec {
                selector: Some(role_selector(id, Role::Worker(0))),
                ports: Some(service_ports(&workload.worker_ports)),
                cluster_ip: Some("None".to_owned()),
                publish_not_ready_addresses: Some(true),
                ..Default::default()
            };
            self.apply_service(orefs.clone(), &name, load_test_labels(id), spec)
                .await?;
            Some(name)
        };

        for unit in workload.units() {
            debug!(load_test = %id, unit = %unit.name, "applying unit");
            let subdomain = match unit.role {
                Role::Worker(_) => worker_service.as_deref(),
                Role::Master => None,
            };
            self.apply_job(orefs.clone(), unit, files.as_deref(), subdomain)
                .await?;
        }
        Ok(())
    }

    async fn list_units(&self) -> Result<Vec<Unit>> {
        self.units(&format!("{MANAGED_BY_LABEL_SELECTOR},{LOAD_TEST_LABEL}"))
            .await
    }

    async fn load_test_units(&self, id: &str) -> Result<Vec<Unit>> {
        self.units(&load_test_selector(id)).await
    }

    async fn delete_units(&self, id: &str) -> Result<()> {
        let selector = ListParams::default().labels(&load_test_selector(id));
        let jobs: Api<Job> = self.api();
        jobs.delete_collection(&DeleteParams::background(), &selector)
            .await?;
        let config_maps: Api<ConfigMap> = self.api();
        config_maps
            .delete_collection(&DeleteParams::default(), &selector)
            .await?;
        self.delete_service(&Role::Master.unit_name(id)).await?;
        self.delete_service(&worker_service_name(id)).await?;
        Ok(())
    }

    async fn unit_logs(&self, id: &str, role: Role) -> Result<Option<LogStream>> {
        let mut selector = format!("{},{ROLE_LABEL}={}", load_test_selector(id), role.label());
        if let Role::Worker(index) = role {
            selector.push_str(&format!(",{WORKER_INDEX_LABEL}={index}"));
        }
        let pods: Api<Pod> = self.api();
        let list = pods.list(&ListParams::default().labels(&selector)).await?;
        let Some(pod) = latest_started_pod(list.items) else {
            debug!(load_test = %id, %role, "no scheduled pod");
            return Ok(None);
        };
        Ok(Some(stream_logs(pods, pod.name_any())))
    }
}

/// Follow the logs of a pod from a spawned task.
fn stream_logs(pods: Api<Pod>, name: String) -> LogStream {
    let (tx, stream) = log_channel();
    tokio::spawn(async move {
        let params = LogParams {
            follow: true,
            ..Default::default()
        };
        match pods.log_stream(&name, &params).await {
            Ok(reader) => forward_logs(reader, tx).await,
            Err(err) => {
                warn!(pod = %name, %err, "failed to open log stream");
                let _ = tx.send(Err(io::Error::new(io::ErrorKind::Other, err))).await;
            }
        }
        debug!(pod = %name, "log stream done");
    });
    stream
}

/// Selector of the pods playing a role in a load test.
fn role_selector(id: &str, role: Role) -> BTreeMap<String, String> {
    let mut selector = load_test_labels(id);
    selector.insert(ROLE_LABEL.to_owned(), role.label().to_owned());
    selector
}

fn service_ports(ports: &[(String, i32)]) -> Vec<ServicePort> {
    ports
        .iter()
        .map(|(name, port)| ServicePort {
            name: Some(name.to_owned()),
            port: *port,
            protocol: Some("TCP".to_owned()),
            ..Default::default()
        })
        .collect()
}

/// Most recently created pod that has left the pending phase.
fn latest_started_pod(pods: Vec<Pod>) -> Option<Pod> {
    pods.into_iter()
        .filter(|pod| {
            matches!(
                pod.status.as_ref().and_then(|status| status.phase.as_deref()),
                Some("Running" | "Succeeded" | "Failed")
            )
        })
        .max_by(|a, b| a.creation_timestamp().cmp(&b.creation_timestamp()))
}

fn unit_from_job(job: &Job) -> Option<Unit> {
    let labels = job.metadata.labels.as_ref()?;
    Some(Unit {
        name: job.name_any(),
        load_test: labels.get(LOAD_TEST_LABEL)?.to_owned(),
        role: Role::from_labels(labels)?,
        state: unit_state(job.status.as_ref()),
        created: job.creation_timestamp().map(|time| time.0),
        finished: finished_at(job.status.as_ref()),
    })
}

/// When a job completed or failed.
fn finished_at(status: Option<&JobStatus>) -> Option<DateTime<Utc>> {
    let status = status?;
    status.completion_time.as_ref().map(|time| time.0).or_else(|| {
        status
            .conditions
            .iter()
            .flatten()
            .filter(|c| (c.type_ == "Complete" || c.type_ == "Failed") && c.status == "True")
            .find_map(|c| c.last_transition_time.as_ref().map(|time| time.0))
    })
}

/// Map the status of a job to the state of its unit.
pub fn unit_state(status: Option<&JobStatus>) -> UnitState {
    let Some(status) = status else {
        return UnitState::Pending;
    };
    let condition = |kind: &str| {
        status
            .conditions
            .iter()
            .flatten()
            .any(|c| c.type_ == kind && c.status == "True")
    };
    if condition("Complete") || status.succeeded.unwrap_or(0) > 0 {
        UnitState::Succeeded
    } else if condition("Failed") || status.failed.unwrap_or(0) > 0 {
        UnitState::Failed
    } else if status.ready.unwrap_or(0) > 0
        || (status.ready.is_none() && status.active.unwrap_or(0) > 0)
    {
        UnitState::Running
    } else {
        UnitState::Pending
    }
}

fn job_spec(unit: &UnitSpec, files: Option<&str>, subdomain: Option<&str>) -> JobSpec {
    let env = unit
        .env
        .iter()
        .map(|(name, value)| EnvVar {
            name: name.to_owned(),
            value: Some(value.to_owned()),
            ..Default::default()
        })
        .collect();
    let (volume_mounts, volumes) = match files {
        Some(config_map) => (
            Some(vec![VolumeMount {
                mount_path: FILES_MOUNT_PATH.to_owned(),
                name: FILES_VOLUME_NAME.to_owned(),
                read_only: Some(true),
                ..Default::default()
            }]),
            Some(vec![Volume {
                config_map: Some(ConfigMapVolumeSource {
                    name: Some(config_map.to_owned()),
                    ..Default::default()
                }),
                name: FILES_VOLUME_NAME.to_owned(),
                ..Default::default()
            }]),
        ),
        None => (None, None),
    };

    JobSpec {
        backoff_limit: Some(0),
        template: PodTemplateSpec {
            metadata: Some(ObjectMeta {
                labels: Some(unit.labels.clone()),
                ..Default::default()
            }),
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: unit.role.label().to_owned(),
                    image: Some(unit.image.to_owned()),
                    command: (!unit.command.is_empty()).then(|| unit.command.clone()),
                    args: (!unit.args.is_empty()).then(|| unit.args.clone()),
                    env: Some(env),
                    resources: Some(ResourceRequirements {
                        requests: Some(unit.resources.clone()),
                        ..Default::default()
                    }),
                    volume_mounts,
                    ..Default::default()
                }],
                volumes,
                restart_policy: Some("Never".to_owned()),
                hostname: subdomain.map(|_| unit.name.to_owned()),
                subdomain: subdomain.map(str::to_owned),
                ..Default::default()
            }),
        },
        ..Default::default()
    }
}
