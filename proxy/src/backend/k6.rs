//! k6 runs the whole test in a single process.
use std::collections::BTreeMap;

use crate::{
    backend::{files, mounted, unit, Backend, Images, Role, WorkloadDescription},
    error::Result,
    loadtest::LoadTestSpec,
};

pub const ID: &str = "k6";

const IMAGES: Images = Images {
    master: "grafana/k6:0.45.0",
    worker: "grafana/k6:0.45.0",
};
const SCRIPT: &str = "script.js";

pub struct K6;

impl Backend for K6 {
    fn build(&self, id: &str, spec: &LoadTestSpec) -> Result<WorkloadDescription> {
        let files = files(ID, spec, SCRIPT, true)?;
        let master = unit(
            id,
            Role::Master,
            spec,
            &IMAGES,
            vec![],
            vec![
                "run".to_owned(),
                "--duration".to_owned(),
                format!("{}s", spec.duration_secs()),
                mounted(SCRIPT),
            ],
            BTreeMap::from_iter([("K6_NO_USAGE_REPORT".to_owned(), "true".to_owned())]),
        );
        Ok(WorkloadDescription {
            load_test: id.to_owned(),
            files,
            master_ports: vec![],
            worker_ports: vec![],
            master,
            workers: vec![],
        })
    }

    fn worker_units(&self, _spec: &LoadTestSpec) -> u32 {
        0
    }
}
