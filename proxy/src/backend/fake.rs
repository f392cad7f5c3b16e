//! A backend that generates no load, useful to exercise the lifecycle end to end.
use std::collections::BTreeMap;

use crate::{
    backend::{files, unit, Backend, Images, Role, WorkloadDescription},
    error::Result,
    loadtest::LoadTestSpec,
};

pub const ID: &str = "fake";

const IMAGES: Images = Images {
    master: "alpine:3",
    worker: "alpine:3",
};

/// Master and workers only sleep for the duration of the test.
pub struct Fake;

impl Backend for Fake {
    fn build(&self, id: &str, spec: &LoadTestSpec) -> Result<WorkloadDescription> {
        let sleep = |role| {
            unit(
                id,
                role,
                spec,
                &IMAGES,
                vec!["/bin/sh".to_owned(), "-c".to_owned()],
                vec![format!("sleep {}", spec.duration_secs())],
                BTreeMap::new(),
            )
        };
        Ok(WorkloadDescription {
            load_test: id.to_owned(),
            files: files(ID, spec, "test.txt", false)?,
            master_ports: vec![],
            worker_ports: vec![],
            master: sleep(Role::Master),
            workers: (0..self.worker_units(spec)).map(|i| sleep(Role::Worker(i))).collect(),
        })
    }

    fn worker_units(&self, spec: &LoadTestSpec) -> u32 {
        spec.workers
    }
}

#[cfg(test)]
mod tests {
    use expect_test::expect;

    use super::*;

    #[test]
    fn one_worker_per_requested_worker() {
        let spec = LoadTestSpec {
            backend: ID.to_owned(),
            workers: 2,
            duration: Some(5),
            ..Default::default()
        };
        let workload = Fake.build("loadtest-a", &spec).unwrap();
        let names: Vec<&str> = workload.units().map(|u| u.name.as_str()).collect();
        expect![[r#"
            [
                "loadtest-a-master",
                "loadtest-a-worker-0",
                "loadtest-a-worker-1",
            ]
        "#]]
        .assert_debug_eq(&names);
        assert_eq!(workload.master.args, vec!["sleep 5".to_owned()]);
        assert!(workload.files.is_empty());
    }
}
