//! JMeter runs a master driving a set of remote workers.
use std::collections::BTreeMap;

use crate::{
    backend::{
        files, mounted, unit, worker_host, Backend, Images, Role, WorkloadDescription,
        TEST_DATA_FILE_NAME,
    },
    error::Result,
    loadtest::LoadTestSpec,
};

pub const ID: &str = "jmeter";

const IMAGES: Images = Images {
    master: "hellofresh/kangal-jmeter-master:latest",
    worker: "hellofresh/kangal-jmeter-worker:latest",
};
const TEST_PLAN: &str = "test.jmx";
const RMI_PORT: i32 = 1099;

pub struct JMeter;

impl Backend for JMeter {
    fn build(&self, id: &str, spec: &LoadTestSpec) -> Result<WorkloadDescription> {
        let files = files(ID, spec, TEST_PLAN, true)?;
        let worker_roles: Vec<Role> = (0..self.worker_units(spec)).map(Role::Worker).collect();

        let mut master_env = BTreeMap::from_iter([
            ("TEST_FILE".to_owned(), mounted(TEST_PLAN)),
            ("USE_WORKERS".to_owned(), "true".to_owned()),
            (
                "WORKER_HOSTS".to_owned(),
                worker_roles
                    .iter()
                    .map(|role| worker_host(id, *role))
                    .collect::<Vec<_>>()
                    .join(","),
            ),
        ]);
        if files.contains_key(TEST_DATA_FILE_NAME) {
            master_env.insert("TEST_DATA".to_owned(), mounted(TEST_DATA_FILE_NAME));
        }
        let master = unit(id, Role::Master, spec, &IMAGES, vec![], vec![], master_env);

        let workers = worker_roles
            .into_iter()
            .map(|role| {
                unit(
                    id,
                    role,
                    spec,
                    &IMAGES,
                    vec![],
                    vec![],
                    BTreeMap::from_iter([("RMI_PORT".to_owned(), RMI_PORT.to_string())]),
                )
            })
            .collect();

        Ok(WorkloadDescription {
            load_test: id.to_owned(),
            files,
            master_ports: vec![],
            worker_ports: vec![("rmi".to_owned(), RMI_PORT)],
            master,
            workers,
        })
    }

    fn worker_units(&self, spec: &LoadTestSpec) -> u32 {
        spec.workers
    }
}
