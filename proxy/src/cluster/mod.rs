//! Access to the cluster state backing load tests.
//!
//! The proxy keeps no state of its own. Records and units live in the cluster and are read back
//! on every request through [`ClusterState`].
mod k8s;
#[cfg(test)]
pub(crate) mod stub;

pub use self::k8s::KubeClusterState;

use std::{collections::HashMap, io};

use async_trait::async_trait;
use futures::{pin_mut, stream::BoxStream, AsyncRead, AsyncReadExt, StreamExt};
use k8s_openapi::chrono::{DateTime, Utc};
use stampede_common::load_test::UnitState;
use tokio::sync::mpsc;

use crate::{
    backend::{Role, WorkloadDescription},
    error::Result,
    loadtest::{LoadTest, LoadTestSpec},
};

/// Output of a unit, forwarded verbatim.
pub type LogStream = BoxStream<'static, io::Result<Vec<u8>>>;

const LOG_CHANNEL_CAPACITY: usize = 16;
const LOG_CHUNK_SIZE: usize = 8 * 1024;

/// A unit observed in the cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct Unit {
    /// Name of the unit.
    pub name: String,
    /// Load test the unit belongs to.
    pub load_test: String,
    /// Role of the unit in the workload.
    pub role: Role,
    /// Observed state.
    pub state: UnitState,
    /// When the unit was created, if known.
    pub created: Option<DateTime<Utc>>,
    /// When the unit reached a terminal state, if it did and the time is known.
    pub finished: Option<DateTime<Utc>>,
}

/// Reads and mutates the cluster objects of load tests.
#[async_trait]
pub trait ClusterState: Send + Sync {
    /// Create the record of a load test.
    async fn create_load_test(&self, id: &str, spec: &LoadTestSpec) -> Result<LoadTest>;
    /// Fetch the record of a load test, if it exists.
    async fn get_load_test(&self, id: &str) -> Result<Option<LoadTest>>;
    /// Fetch all load test records.
    async fn list_load_tests(&self) -> Result<Vec<LoadTest>>;
    /// Delete the record of a load test. Deleting a missing record succeeds.
    async fn delete_load_test(&self, id: &str) -> Result<()>;
    /// Create the units of a workload, owned by the record.
    async fn create_units(&self, owner: &LoadTest, workload: &WorkloadDescription) -> Result<()>;
    /// Observe every unit of every load test.
    async fn list_units(&self) -> Result<Vec<Unit>>;
    /// Observe the units of one load test.
    async fn load_test_units(&self, id: &str) -> Result<Vec<Unit>>;
    /// Delete every unit labeled with the load test. Deleting nothing succeeds.
    async fn delete_units(&self, id: &str) -> Result<()>;
    /// Stream the output of a unit, or `None` when it has not been scheduled.
    async fn unit_logs(&self, id: &str, role: Role) -> Result<Option<LogStream>>;
}

/// Copy chunks from a reader into the channel until the reader ends or the receiver is dropped.
pub(crate) async fn forward_logs<R>(reader: R, tx: mpsc::Sender<io::Result<Vec<u8>>>)
where
    R: AsyncRead,
{
    pin_mut!(reader);
    let mut buf = vec![0u8; LOG_CHUNK_SIZE];
    loop {
        let read = tokio::select! {
            _ = tx.closed() => return,
            read = reader.read(&mut buf) => read,
        };
        let chunk = match read {
            Ok(0) => return,
            Ok(n) => Ok(buf[..n].to_vec()),
            Err(err) => Err(err),
        };
        let failed = chunk.is_err();
        if tx.send(chunk).await.is_err() || failed {
            return;
        }
    }
}

/// Channel pair feeding a [`LogStream`].
pub(crate) fn log_channel() -> (mpsc::Sender<io::Result<Vec<u8>>>, LogStream) {
    let (tx, rx) = mpsc::channel(LOG_CHANNEL_CAPACITY);
    let stream = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|chunk| (chunk, rx))
    })
    .boxed();
    (tx, stream)
}

/// Collect a log stream, used where the whole output is needed at once.
pub async fn collect_logs(stream: LogStream) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut stream = stream;
    while let Some(chunk) = stream.next().await {
        out.extend(chunk?);
    }
    Ok(out)
}

/// Group observed units by the load test they belong to.
pub fn by_load_test(units: Vec<Unit>) -> HashMap<String, Vec<Unit>> {
    let mut grouped: HashMap<String, Vec<Unit>> = HashMap::new();
    for unit in units {
        grouped.entry(unit.load_test.clone()).or_default().push(unit);
    }
    grouped
}
