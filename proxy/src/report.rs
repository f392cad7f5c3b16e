//! Storage of load test reports.
use std::{io, path::PathBuf};

use async_trait::async_trait;
use tracing::debug;

use crate::{
    error::{Error, Result},
    labels::is_valid_label_value,
};

/// Stores the report of a load test as opaque bytes.
#[async_trait]
pub trait ReportStore: Send + Sync {
    /// Store the report, replacing any previous one.
    async fn persist(&self, id: &str, report: Vec<u8>) -> Result<()>;
    /// Fetch the report, if one was stored.
    async fn show(&self, id: &str) -> Result<Option<Vec<u8>>>;
}

/// Report store writing one file per load test into a directory.
#[derive(Debug, Clone)]
pub struct FsReportStore {
    dir: PathBuf,
}

impl FsReportStore {
    /// Create a store in the directory. The directory is created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, id: &str) -> Result<PathBuf> {
        // Ids are label values, which can never escape the directory.
        if !is_valid_label_value(id) {
            return Err(Error::NotFound(format!("report of load test {id}")));
        }
        Ok(self.dir.join(id))
    }
}

#[async_trait]
impl ReportStore for FsReportStore {
    async fn persist(&self, id: &str, report: Vec<u8>) -> Result<()> {
        let path = self.path(id)?;
        tokio::fs::create_dir_all(&self.dir).await?;
        debug!(load_test = id, path = %path.display(), bytes = report.len(), "writing report");
        tokio::fs::write(path, report).await?;
        Ok(())
    }

    async fn show(&self, id: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path(id)?;
        match tokio::fs::read(path).await {
            Ok(report) => Ok(Some(report)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
pub use tests::MemoryReportStore;
