//! ghz load tests gRPC services from a single process.
use std::collections::BTreeMap;

use crate::{
    backend::{files, mounted, unit, Backend, Images, Role, WorkloadDescription},
    error::Result,
    loadtest::LoadTestSpec,
};

pub const ID: &str = "ghz";

const IMAGES: Images = Images {
    master: "hellofresh/kangal-ghz:latest",
    worker: "hellofresh/kangal-ghz:latest",
};
const CONFIG: &str = "config.json";

pub struct Ghz;

impl Backend for Ghz {
    fn build(&self, id: &str, spec: &LoadTestSpec) -> Result<WorkloadDescription> {
        let files = files(ID, spec, CONFIG, true)?;
        let mut args = vec![
            "--config".to_owned(),
            mounted(CONFIG),
            "-z".to_owned(),
            format!("{}s", spec.duration_secs()),
        ];
        if let Some(target) = &spec.target_url {
            args.push(target.to_owned());
        }
        let master = unit(id, Role::Master, spec, &IMAGES, vec![], args, BTreeMap::new());
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
