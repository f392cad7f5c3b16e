//! Stampede proxy admits load tests and tracks them on K8s
#![deny(missing_docs)]

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use kube::Client;
use stampede_common::telemetry;
use stampede_proxy::{
    api,
    backend::Registry,
    cluster::KubeClusterState,
    config::{Limits, Opts},
    report::FsReportStore,
    utils::Context,
};
use tokio::net::TcpListener;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    opts: Opts,

    #[arg(long, env = "STAMPEDE_OTLP_ENDPOINT")]
    otlp_endpoint: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    let metrics = Arc::new(telemetry::init("stampede-proxy", args.otlp_endpoint.clone()).await?);

    info!(?args.opts, ?args.otlp_endpoint, "starting proxy");
    let registry =
        Registry::with_defaults(&args.opts.enabled_backends, &args.opts.backend_workers)?;
    let k_client = Client::try_default().await?;
    let cluster = KubeClusterState::new(k_client, &args.opts.namespace);
    let reports = Arc::new(FsReportStore::new(args.opts.report_dir.clone()));
    let cx = Arc::new(Context::new(
        cluster,
        registry,
        Limits::from(&args.opts),
        reports,
    )?);

    let app = api::router(cx, Some(metrics.clone()));
    let listener = TcpListener::bind(("0.0.0.0", args.opts.http_port)).await?;
    info!(address = %listener.local_addr()?, "serving load test API");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Flush traces and metrics before shutdown
    metrics.shutdown()?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(%err, "failed to listen for shutdown signal");
    }
    info!("shutting down");
}
