//! Admission gates a create on policy and on the number of active load tests.
use opentelemetry::{global, KeyValue};
use rand::RngCore;
use tracing::{debug, info};

use crate::{
    backend::BackendDescriptor,
    cluster::{by_load_test, ClusterState},
    error::{Error, Result},
    labels::is_valid_label_value,
    loadtest::{service::status_of, LoadTestSpec},
    utils::{Clock, Context},
};

/// Check a spec against policy and capacity, returning the backend it resolves to.
///
/// Gates run in order and the first failure wins. Nothing is created or changed.
pub async fn admit<'a>(
    cx: &'a Context<impl ClusterState, impl RngCore, impl Clock>,
    spec: &LoadTestSpec,
) -> Result<&'a BackendDescriptor> {
    match admit_(cx, spec).await {
        Ok(descriptor) => Ok(descriptor),
        Err(err) => {
            let reason = match &err {
                Error::CapacityExceeded { .. } => "capacity",
                e if e.is_client_error() => "validation",
                _ => "error",
            };
            global::meter("stampede")
                .u64_counter("loadtest_admission_rejected_count")
                .with_description("Number of load tests rejected by admission")
                .init()
                .add(1, &[KeyValue::new("reason", reason)]);
            info!(backend = %spec.backend, reason, %err, "load test rejected");
            Err(err)
        }
    }
}

async fn admit_<'a>(
    cx: &'a Context<impl ClusterState, impl RngCore, impl Clock>,
    spec: &LoadTestSpec,
) -> Result<&'a BackendDescriptor> {
    let descriptor = cx.registry.resolve(&spec.backend).map_err(|_| {
        Error::Validation(format!(
            "unknown backend {}, available backends are {}",
            spec.backend,
            cx.registry.ids().join(", ")
        ))
    })?;

    if !descriptor.workers().contains(&spec.workers) {
        return Err(Error::Validation(format!(
            "backend {} supports {} to {} workers, got {}",
            descriptor.id, descriptor.min_workers, descriptor.max_workers, spec.workers
        )));
    }

    if let Some(image) = spec
        .image_overrides()
        .find(|image| !cx.limits.allowed_custom_images.contains(*image))
    {
        return Err(Error::Validation(format!("image {image} is not allowed")));
    }

    if let Some((key, value)) = spec
        .tags
        .iter()
        .find(|(key, value)| !is_valid_label_value(key) || !is_valid_label_value(value))
    {
        return Err(Error::Validation(format!("invalid tag {key}={value}")));
    }

    let active = active_count(cx).await?;
    debug!(active, max = cx.limits.max_load_tests_run, "admission capacity");
    if active >= cx.limits.max_load_tests_run {
        return Err(Error::CapacityExceeded {
            active,
            max: cx.limits.max_load_tests_run,
        });
    }
    Ok(descriptor)
}

/// Count load tests whose derived phase is pending or running.
///
/// Counted from the cluster on every call so that every proxy instance and any out of band
/// deletion is accounted for.
pub async fn active_count(
    cx: &Context<impl ClusterState, impl RngCore, impl Clock>,
) -> Result<usize> {
    let records = cx.cluster.list_load_tests().await?;
    let units = by_load_test(cx.cluster.list_units().await?);
    Ok(records
        .iter()
        .filter(|record| {
            let units = units.get(&record.id()).map(Vec::as_slice).unwrap_or_default();
            status_of(cx, record, units).phase.is_active()
        })
        .count())
}
