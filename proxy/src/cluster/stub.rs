use std::{collections::HashMap, sync::Mutex};

use async_trait::async_trait;
use futures::{future, stream, StreamExt};
use k8s_openapi::{
    apimachinery::pkg::apis::meta::v1::Time,
    chrono::{DateTime, Duration, Utc},
};
use kube::{core::ObjectMeta, Resource};
use stampede_common::load_test::UnitState;

use crate::{
    backend::{Role, WorkloadDescription},
    cluster::{ClusterState, LogStream, Unit},
    error::{Error, Result},
    loadtest::{LoadTest, LoadTestSpec},
    utils::test::epoch,
};

#[derive(Default)]
struct State {
    records: Vec<LoadTest>,
    units: Vec<Unit>,
    logs: HashMap<String, Vec<u8>>,
    fail_units_after: Option<usize>,
}

/// In memory cluster. Records are stamped one second apart starting at the test epoch.
pub struct StubCluster {
    start: DateTime<Utc>,
    state: Mutex<State>,
}

impl Default for StubCluster {
    fn default() -> Self {
        Self {
            start: epoch(),
            state: Mutex::new(State::default()),
        }
    }
}

impl StubCluster {
    /// Set the state of one unit.
    pub fn set_state(&self, id: &str, role: Role, state: UnitState) {
        let mut s = self.state.lock().unwrap();
        for unit in s.units.iter_mut() {
            if unit.load_test == id && unit.role == role {
                unit.state = state;
            }
        }
    }

    /// Set the state of every unit of a load test.
    pub fn set_all(&self, id: &str, state: UnitState) {
        let mut s = self.state.lock().unwrap();
        for unit in s.units.iter_mut().filter(|unit| unit.load_test == id) {
            unit.state = state;
        }
    }

    /// Set the output of a unit.
    pub fn set_logs(&self, id: &str, role: Role, logs: &[u8]) {
        let mut s = self.state.lock().unwrap();
        s.logs.insert(role.unit_name(id), logs.to_vec());
    }

    /// Remove a unit, as if it was deleted out of band.
    pub fn remove_unit(&self, id: &str, role: Role) {
        let mut s = self.state.lock().unwrap();
        s.units.retain(|unit| !(unit.load_test == id && unit.role == role));
    }

    /// Fail unit creation after `n` units were created.
    pub fn fail_units_after(&self, n: usize) {
        self.state.lock().unwrap().fail_units_after = Some(n);
    }

    /// Number of units of a load test.
    pub fn unit_count(&self, id: &str) -> usize {
        let s = self.state.lock().unwrap();
        s.units.iter().filter(|unit| unit.load_test == id).count()
    }

    /// Number of records.
    pub fn record_count(&self) -> usize {
        self.state.lock().unwrap().records.len()
    }
}

#[async_trait]
impl ClusterState for StubCluster {
    async fn create_load_test(&self, id: &str, spec: &LoadTestSpec) -> Result<LoadTest> {
        let mut s = self.state.lock().unwrap();
        if s.records.iter().any(|record| record.id() == id) {
            return Err(Error::App {
                source: anyhow::anyhow!("load test {id} already exists"),
            });
        }
        let created = self.start + Duration::seconds(s.records.len() as i64);
        let mut record = LoadTest::new(id, spec.clone());
        record.metadata = ObjectMeta {
            name: Some(id.to_owned()),
            namespace: Some("test".to_owned()),
            uid: Some(format!("uid-{id}")),
            creation_timestamp: Some(Time(created)),
            ..Default::default()
        };
        s.records.push(record.clone());
        Ok(record)
    }

    async fn get_load_test(&self, id: &str) -> Result<Option<LoadTest>> {
        let s = self.state.lock().unwrap();
        Ok(s.records.iter().find(|record| record.id() == id).cloned())
    }

    async fn list_load_tests(&self) -> Result<Vec<LoadTest>> {
        Ok(self.state.lock().unwrap().records.clone())
    }

    async fn delete_load_test(&self, id: &str) -> Result<()> {
        let mut s = self.state.lock().unwrap();
        s.records.retain(|record| record.id() != id);
        Ok(())
    }

    async fn create_units(&self, owner: &LoadTest, workload: &WorkloadDescription) -> Result<()> {
        let mut s = self.state.lock().unwrap();
        let created = owner.meta().creation_timestamp.as_ref().map(|time| time.0);
        for (count, unit) in workload.units().enumerate() {
            if s.fail_units_after == Some(count) {
                return Err(Error::App {
                    source: anyhow::anyhow!("quota exceeded creating {}", unit.name),
                });
            }
            s.units.push(Unit {
                name: unit.name.clone(),
                load_test: owner.id(),
                role: unit.role,
                state: UnitState::Pending,
                created,
                finished: None,
            });
        }
        Ok(())
    }

    async fn list_units(&self) -> Result<Vec<Unit>> {
        Ok(self.state.lock().unwrap().units.clone())
    }

    async fn load_test_units(&self, id: &str) -> Result<Vec<Unit>> {
        let s = self.state.lock().unwrap();
        Ok(s.units
            .iter()
            .filter(|unit| unit.load_test == id)
            .cloned()
            .collect())
    }

    async fn delete_units(&self, id: &str) -> Result<()> {
        let mut s = self.state.lock().unwrap();
        s.units.retain(|unit| unit.load_test != id);
        Ok(())
    }

    async fn unit_logs(&self, id: &str, role: Role) -> Result<Option<LogStream>> {
        let s = self.state.lock().unwrap();
        let scheduled = s.units.iter().any(|unit| {
            unit.load_test == id && unit.role == role && unit.state != UnitState::Pending
        });
        if !scheduled {
            return Ok(None);
        }
        Ok(Some(match s.logs.get(&role.unit_name(id)) {
            Some(logs) => stream::once(future::ready(Ok(logs.clone()))).boxed(),
            None => stream::empty().boxed(),
        }))
    }
}
