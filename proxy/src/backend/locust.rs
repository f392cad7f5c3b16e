//! Locust runs a master that workers connect to over its coordination port.
use std::collections::BTreeMap;

use crate::{
    backend::{files, mounted, unit, Backend, Images, Role, WorkloadDescription},
    error::{Error, Result},
    loadtest::LoadTestSpec,
};

pub const ID: &str = "locust";

const IMAGES: Images = Images {
    master: "locustio/locust:2.15.1",
    worker: "locustio/locust:2.15.1",
};
const LOCUSTFILE: &str = "locustfile.py";
const MASTER_PORT: i32 = 5557;

pub struct Locust;

impl Backend for Locust {
    fn build(&self, id: &str, spec: &LoadTestSpec) -> Result<WorkloadDescription> {
        let files = files(ID, spec, LOCUSTFILE, true)?;
        let target = spec
            .target_url
            .as_deref()
            .ok_or_else(|| Error::InvalidSpec(format!("backend {ID} requires a target url")))?;
        let workers = self.worker_units(spec);

        let master = unit(
            id,
            Role::Master,
            spec,
            &IMAGES,
            vec![],
            vec![
                "-f".to_owned(),
                mounted(LOCUSTFILE),
                "--master".to_owned(),
                "--expect-workers".to_owned(),
                workers.to_string(),
                "--headless".to_owned(),
                "--run-time".to_owned(),
                format!("{}s", spec.duration_secs()),
                "-H".to_owned(),
                target.to_owned(),
            ],
            BTreeMap::new(),
        );
        let master_host = Role::Master.unit_name(id);
        let workers = (0..workers)
            .map(|i| {
                unit(
                    id,
                    Role::Worker(i),
                    spec,
                    &IMAGES,
                    vec![],
                    vec![
                        "-f".to_owned(),
                        mounted(LOCUSTFILE),
                        "--worker".to_owned(),
                        "--master-host".to_owned(),
                        master_host.clone(),
                        "--master-port".to_owned(),
                        MASTER_PORT.to_string(),
                    ],
                    BTreeMap::new(),
                )
            })
            .collect();

        Ok(WorkloadDescription {
            load_test: id.to_owned(),
            files,
            master_ports: vec![("master".to_owned(), MASTER_PORT)],
            worker_ports: vec![],
            master,
            workers,
        })
    }

    fn worker_units(&self, spec: &LoadTestSpec) -> u32 {
        spec.workers
    }
}
