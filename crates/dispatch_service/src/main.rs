mod api;
mod config;
mod maintenance;

use std::sync::Arc;

use anyhow::{Context, Result};
use config::ServiceConfig;
use dispatch_core::pricing::TariffBook;
use dispatch_core::routing::osrm::OsrmRouteProvider;
use dispatch_core::settlement::gateway::http::HttpPaymentGateway;
use dispatch_core::DispatchEngine;
use tracing::{info, warn};

fn main() -> Result<()> {
    let config = ServiceConfig::load()?;

    tracing_subscriber::fmt()
        .with_env_filter(&config.log_level)
        .init();

    info!("Starting dispatch service...");

    // The HTTP collaborators use blocking clients, which must be built and
    // dropped outside the async runtime.
    let engine = Arc::new(build_engine(&config)?);
    let indexed = engine.rebuild_geo_index()?;
    info!(indexed, "geo index ready");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;
    runtime.block_on(serve(engine.clone(), &config))?;
    drop(runtime);

    info!("dispatch service stopped");
    Ok(())
}

fn build_engine(config: &ServiceConfig) -> Result<DispatchEngine> {
    let tariffs = config
        .tariffs
        .iter()
        .cloned()
        .fold(TariffBook::new(), TariffBook::with_tariff);
    if config.tariffs.is_empty() {
        warn!("no tariffs loaded; every ride request will be rejected");
    }
    let gateway = HttpPaymentGateway::new(&config.gateway_endpoint)
        .context("building payment gateway client")?;

    let mut builder = DispatchEngine::builder(Arc::new(tariffs), Arc::new(gateway))
        .config(config.engine.clone());
    match &config.osrm_endpoint {
        Some(endpoint) => {
            let provider =
                OsrmRouteProvider::new(endpoint).context("building OSRM client")?;
            builder = builder.route_provider(Arc::new(provider));
            info!(%endpoint, "routing via OSRM");
        }
        None => warn!("OSRM_ENDPOINT unset; using straight-line estimates"),
    }
    Ok(builder.build())
}

async fn serve(engine: Arc<DispatchEngine>, config: &ServiceConfig) -> Result<()> {
    let sweeps = tokio::spawn(maintenance::run(
        engine.clone(),
        config.maintenance_interval,
    ));

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "listening");

    axum::serve(listener, api::router(engine))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await
        .context("http server")?;

    sweeps.abort();
    Ok(())
}
