//! Derives the phase of a load test from the units observed in the cluster.
//!
//! Nothing here is stored. The same observation always yields the same status, which keeps the
//! phase consistent across proxy instances and with units deleted out of band.
use std::time::Duration;

use k8s_openapi::chrono::{DateTime, Utc};
use stampede_common::load_test::{LoadTestStatus, Phase, UnitState, WorkerStatus};

use crate::{backend::Role, cluster::Unit, config::Limits};

/// Derive the status of a load test.
///
/// `created` is the creation time of the record, `expected_workers` the number of worker units
/// the backend topology has, when the backend is still registered.
pub fn derive_status<'a>(
    created: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    expected_workers: Option<u32>,
    units: impl IntoIterator<Item = &'a Unit>,
    limits: &Limits,
) -> LoadTestStatus {
    let units: Vec<&Unit> = units.into_iter().collect();
    let master = units
        .iter()
        .find(|unit| unit.role == Role::Master)
        .map(|unit| unit.state);
    let mut workers: Vec<WorkerStatus> = units
        .iter()
        .filter_map(|unit| match unit.role {
            Role::Worker(index) => Some(WorkerStatus {
                index,
                state: unit.state,
            }),
            Role::Master => None,
        })
        .collect();
    workers.sort_by_key(|worker| worker.index);

    let phase = phase(
        &units,
        master,
        workers.len(),
        expected_workers,
        Window { created, limits },
        now,
    );

    LoadTestStatus {
        phase,
        master,
        workers,
    }
}

/// Measures instants against the creation time of a record.
#[derive(Clone, Copy)]
struct Window<'a> {
    created: Option<DateTime<Utc>>,
    limits: &'a Limits,
}

impl Window<'_> {
    fn elapsed(&self, at: DateTime<Utc>) -> Duration {
        self.created
            .and_then(|created| (at - created).to_std().ok())
            .unwrap_or_default()
    }

    fn within_grace(&self, at: DateTime<Utc>) -> bool {
        self.elapsed(at) <= self.limits.scheduling_grace
    }

    fn within_deadline(&self, at: DateTime<Utc>) -> bool {
        self.elapsed(at) <= self.limits.run_deadline
    }
}

fn phase(
    units: &[&Unit],
    master: Option<UnitState>,
    observed_workers: usize,
    expected_workers: Option<u32>,
    window: Window<'_>,
    now: DateTime<Utc>,
) -> Phase {
    let scheduling = if window.within_grace(now) {
        Phase::Pending
    } else {
        Phase::Errored
    };

    if units.is_empty() {
        return scheduling;
    }
    if units.iter().any(|unit| unit.state == UnitState::Failed) {
        return Phase::Errored;
    }
    // A unit showing up after the grace window means the test was already incomplete past it.
    if units
        .iter()
        .filter_map(|unit| unit.created)
        .any(|created| !window.within_grace(created))
    {
        return Phase::Errored;
    }
    let missing_workers =
        expected_workers.is_some_and(|expected| observed_workers < expected as usize);
    if master.is_none() || missing_workers {
        return scheduling;
    }
    if units.iter().all(|unit| unit.state == UnitState::Succeeded) {
        // Units without a known finish time count as done on time.
        return if units
            .iter()
            .filter_map(|unit| unit.finished)
            .all(|finished| window.within_deadline(finished))
        {
            Phase::Finished
        } else {
            Phase::Errored
        };
    }
    if !window.within_deadline(now) {
        return Phase::Errored;
    }
    match master {
        Some(UnitState::Running | UnitState::Succeeded) => Phase::Running,
        _ => Phase::Pending,
    }
}
