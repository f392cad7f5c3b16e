use std::{collections::BTreeMap, sync::Arc};

use k8s_openapi::chrono::{DateTime, SecondsFormat, Utc};
use opentelemetry::{global, KeyValue};
use rand::RngCore;
use stampede_common::load_test::{
    CreatedLoadTest, LoadTestList, LoadTestStatus, LoadTestView, Phase,
};
use tracing::{debug, error, info};

use crate::{
    admission::admit,
    backend::Role,
    cluster::{by_load_test, ClusterState, LogStream, Unit},
    error::{Error, Result},
    lifecycle::derive_status,
    loadtest::{LoadTest, LoadTestSpec},
    utils::{generate_id, Clock, Context},
};

/// Filters applied to a list.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ListFilter {
    /// Tags a load test must carry, all of them.
    pub tags: BTreeMap<String, String>,
    /// Phase a load test must be in.
    pub phase: Option<Phase>,
}

/// Admit and create a load test, returning its identifier.
///
/// Units are created after the record. A failure part way is returned to the caller and left in
/// place, the derived phase of the load test turns errored once the grace window passes.
pub async fn create(
    cx: Arc<Context<impl ClusterState, impl RngCore, impl Clock>>,
    spec: LoadTestSpec,
) -> Result<CreatedLoadTest> {
    let creates = global::meter("stampede")
        .u64_counter("loadtest_create_count")
        .with_description("Number of load test creates")
        .init();

    match create_(cx, spec).await {
        Ok(created) => {
            creates.add(1, &[KeyValue::new("result", "ok")]);
            Ok(created)
        }
        Err(err) => {
            creates.add(1, &[KeyValue::new("result", "err")]);
            Err(err)
        }
    }
}

async fn create_(
    cx: Arc<Context<impl ClusterState, impl RngCore, impl Clock>>,
    spec: LoadTestSpec,
) -> Result<CreatedLoadTest> {
    let descriptor = admit(&cx, &spec).await?;
    let id = generate_id(&cx);
    let workload = descriptor.build(&id, &spec)?;

    let record = cx.cluster.create_load_test(&id, &spec).await?;
    if let Err(err) = cx.cluster.create_units(&record, &workload).await {
        error!(load_test = %id, %err, "failed to create units");
        return Err(err);
    }
    info!(
        load_test = %id,
        backend = %descriptor.id,
        workers = spec.workers,
        units = workload.units().count(),
        "load test created"
    );
    Ok(CreatedLoadTest {
        id,
        phase: Phase::Pending,
    })
}

/// Fetch a load test with its derived status.
pub async fn get(
    cx: Arc<Context<impl ClusterState, impl RngCore, impl Clock>>,
    id: &str,
) -> Result<LoadTestView> {
    let record = find(&cx, id).await?;
    let units = cx.cluster.load_test_units(id).await?;
    Ok(view(&cx, &record, &units))
}

/// List load tests in creation order.
///
/// `limit` is clamped to the configured maximum, zero or absent means the maximum. The page
/// token is the opaque cursor returned by the previous page.
pub async fn list(
    cx: Arc<Context<impl ClusterState, impl RngCore, impl Clock>>,
    page_token: Option<&str>,
    limit: Option<usize>,
    filter: &ListFilter,
) -> Result<LoadTestList> {
    let max = cx.limits.max_list_limit.max(1);
    let limit = match limit {
        None | Some(0) => max,
        Some(limit) => limit.min(max),
    };
    let after = page_token
        .filter(|token| !token.is_empty())
        .map(Cursor::decode)
        .transpose()?;

    let mut records = cx.cluster.list_load_tests().await?;
    records.sort_by_cached_key(Cursor::of);
    let units = by_load_test(cx.cluster.list_units().await?);

    let mut items: Vec<LoadTestView> = Vec::with_capacity(limit);
    let mut last = None;
    let mut next_page_token = None;
    for record in records {
        let cursor = Cursor::of(&record);
        if after.as_ref().is_some_and(|after| &cursor <= after) {
            continue;
        }
        if !filter
            .tags
            .iter()
            .all(|(key, value)| record.spec.tags.get(key) == Some(value))
        {
            continue;
        }
        let units = units
            .get(&record.id())
            .map(Vec::as_slice)
            .unwrap_or_default();
        let view = view(&cx, &record, units);
        if filter
            .phase
            .is_some_and(|phase| view.status.phase != phase)
        {
            continue;
        }
        if items.len() == limit {
            next_page_token = last.take().map(|cursor: Cursor| cursor.encode());
            break;
        }
        items.push(view);
        last = Some(cursor);
    }
    debug!(items = items.len(), limit, more = next_page_token.is_some(), "listed load tests");

    Ok(LoadTestList {
        items,
        next_page_token,
    })
}

/// Delete the units and the record of a load test. Deleting a missing load test succeeds.
pub async fn delete(
    cx: Arc<Context<impl ClusterState, impl RngCore, impl Clock>>,
    id: &str,
) -> Result<()> {
    cx.cluster.delete_units(id).await?;
    cx.cluster.delete_load_test(id).await?;
    info!(load_test = %id, "load test deleted");
    Ok(())
}

/// Stream the output of the master, or of a worker when `worker` is given.
pub async fn logs(
    cx: Arc<Context<impl ClusterState, impl RngCore, impl Clock>>,
    id: &str,
    worker: Option<u32>,
) -> Result<LogStream> {
    let record = find(&cx, id).await?;
    let role = match worker {
        None => Role::Master,
        Some(index) => {
            let worker_units = cx
                .registry
                .resolve(&record.spec.backend)
                .map(|descriptor| descriptor.backend.worker_units(&record.spec))
                .unwrap_or(record.spec.workers);
            if index >= worker_units {
                return Err(Error::NotFound(format!(
                    "load test {id} has no worker {index}"
                )));
            }
            Role::Worker(index)
        }
    };
    cx.cluster
        .unit_logs(id, role)
        .await?
        .ok_or_else(|| Error::NotFound(format!("{role} of load test {id} is not scheduled")))
}

/// Store the report of an existing load test.
pub async fn persist_report(
    cx: Arc<Context<impl ClusterState, impl RngCore, impl Clock>>,
    id: &str,
    report: Vec<u8>,
) -> Result<()> {
    find(&cx, id).await?;
    cx.reports.persist(id, report).await
}

/// Fetch the stored report of a load test.
pub async fn show_report(
    cx: Arc<Context<impl ClusterState, impl RngCore, impl Clock>>,
    id: &str,
) -> Result<Vec<u8>> {
    cx.reports
        .show(id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("report of load test {id}")))
}

async fn find(
    cx: &Context<impl ClusterState, impl RngCore, impl Clock>,
    id: &str,
) -> Result<LoadTest> {
    cx.cluster
        .get_load_test(id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("load test {id}")))
}

/// Derive the status of a record from its units.
pub(crate) fn status_of(
    cx: &Context<impl ClusterState, impl RngCore, impl Clock>,
    record: &LoadTest,
    units: &[Unit],
) -> LoadTestStatus {
    let expected_workers = cx
        .registry
        .resolve(&record.spec.backend)
        .ok()
        .map(|descriptor| descriptor.backend.worker_units(&record.spec));
    derive_status(
        created_at(record),
        cx.clock.now(),
        expected_workers,
        units,
        &cx.limits,
    )
}

fn view(
    cx: &Context<impl ClusterState, impl RngCore, impl Clock>,
    record: &LoadTest,
    units: &[Unit],
) -> LoadTestView {
    let spec = &record.spec;
    LoadTestView {
        id: record.id(),
        backend: spec.backend.clone(),
        workers: spec.workers,
        tags: spec.tags.clone(),
        target_url: spec.target_url.clone(),
        duration: Some(spec.duration_secs()),
        created_at: created_at(record).map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true)),
        has_test_file: spec.test_file.is_some(),
        has_test_data: spec.test_data.is_some(),
        status: status_of(cx, record, units),
    }
}

fn created_at(record: &LoadTest) -> Option<DateTime<Utc>> {
    record
        .metadata
        .creation_timestamp
        .as_ref()
        .map(|time| time.0)
}

/// Position of a record in the list order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct Cursor {
    created: Option<DateTime<Utc>>,
    id: String,
}

impl Cursor {
    fn of(record: &LoadTest) -> Self {
        Self {
            created: created_at(record),
            id: record.id(),
        }
    }

    fn encode(&self) -> String {
        let created = self
            .created
            .map(|t| t.to_rfc3339_opts(SecondsFormat::Nanos, true))
            .unwrap_or_default();
        hex::encode(format!("{created}|{}", self.id))
    }

    fn decode(token: &str) -> Result<Self> {
        let invalid = || Error::Validation(format!("invalid page token {token}"));
        let raw = hex::decode(token).map_err(|_| invalid())?;
        let raw = String::from_utf8(raw).map_err(|_| invalid())?;
        let (created, id) = raw.split_once('|').ok_or_else(invalid)?;
        let created = if created.is_empty() {
            None
        } else {
            Some(
                DateTime::parse_from_rfc3339(created)
                    .map_err(|_| invalid())?
                    .with_timezone(&Utc),
            )
        };
        Ok(Self {
            created,
            id: id.to_owned(),
        })
    }
}
