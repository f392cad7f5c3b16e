//! Provides helper functions for initializing telemetry collection and publication.
use anyhow::Result;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{metrics::MeterProvider, runtime, Resource};
use prometheus::{Encoder, TextEncoder};
use tracing_subscriber::{filter::LevelFilter, prelude::*, EnvFilter, Registry};

/// Handle to the metrics pipeline.
///
/// Metrics recorded through the global meter are collected into a prometheus registry
/// and rendered on demand in the text exposition format.
pub struct Metrics {
    registry: prometheus::Registry,
    provider: MeterProvider,
}

impl Metrics {
    /// Render all collected metrics in the prometheus text format.
    pub fn encode(&self) -> Result<String> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        Ok(String::from_utf8(buf)?)
    }

    /// Flush traces and stop collecting metrics.
    pub fn shutdown(&self) -> Result<()> {
        global::shutdown_tracer_provider();
        self.provider.shutdown()?;
        Ok(())
    }
}

fn resource(service_name: &str) -> Resource {
    Resource::new(vec![
        KeyValue::new(
            "hostname",
            gethostname::gethostname().to_string_lossy().into_owned(),
        ),
        KeyValue::new("service.name", service_name.to_owned()),
    ])
}

/// Initialize tracing and metrics.
///
/// Logs are always written to stdout. Traces are exported over OTLP only when an endpoint is
/// given.
pub async fn init(service_name: &str, otlp_endpoint: Option<String>) -> Result<Metrics> {
    let metrics = metrics(service_name)?;
    global::set_meter_provider(metrics.provider.clone());

    // Setup filters
    // Default to INFO if no env is specified
    let log_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env()?;

    let telemetry = match otlp_endpoint {
        Some(endpoint) => {
            let tracer = opentelemetry_otlp::new_pipeline()
                .tracing()
                .with_exporter(
                    opentelemetry_otlp::new_exporter()
                        .tonic()
                        .with_endpoint(endpoint),
                )
                .with_trace_config(
                    opentelemetry_sdk::trace::config().with_resource(resource(service_name)),
                )
                .install_batch(runtime::Tokio)?;
            let otlp_filter = EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?;
            Some(
                tracing_opentelemetry::layer()
                    .with_tracer(tracer)
                    .with_filter(otlp_filter),
            )
        }
        None => None,
    };
    let logger = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .compact()
        .with_filter(log_filter);

    let collector = Registry::default().with(telemetry).with(logger);

    #[cfg(feature = "tokio-console")]
    let collector = {
        let console_filter = EnvFilter::builder().parse("tokio=trace,runtime=trace")?;
        let console_layer = console_subscriber::spawn().with_filter(console_filter);
        collector.with(console_layer)
    };

    tracing::subscriber::set_global_default(collector)?;

    Ok(metrics)
}

fn metrics(service_name: &str) -> Result<Metrics> {
    let registry = prometheus::Registry::new();
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .build()?;
    let provider = MeterProvider::builder()
        .with_reader(exporter)
        .with_resource(resource(service_name))
        .build();
    Ok(Metrics { registry, provider })
}
