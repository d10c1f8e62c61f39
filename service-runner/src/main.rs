//! Run one service instance: an HTTP component with probes, registered with
//! the configured registry until a shutdown signal arrives.
use std::sync::Arc;

use anyhow::Context;
use envconfig::Envconfig;
use lifecycle::{probe_router, App, HttpServer};
use registry::Registry;
use tracing::level_filters::LevelFilter;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::Config;

mod config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(
        EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy(),
    );
    tracing_subscriber::registry().with(log_layer).init();

    let config = Config::init_from_env().context("invalid configuration")?;

    let mut builder = App::builder(&config.service_name, &config.service_version)
        .with_endpoints(config.endpoints())
        .with_signals(config.shutdown_signals.0.clone())
        .with_component_timeout(config.component_timeout())
        .with_registry_timeout(config.registry.timeout());
    if !config.service_id.is_empty() {
        builder = builder.with_id(config.service_id.clone());
    }

    if config.enable_registry {
        let registry = Registry::connect(&config.registry)
            .await
            .context("failed to connect to registry")?;
        info!(kind = %registry.kind(), "registry connected");
        builder = builder.with_registrar(Arc::new(registry));
    }

    if config.enable_http {
        let bind = config.bind().context("invalid bind address")?;
        let router = probe_router(builder.readiness_handler());
        builder = builder.with_component("http", Arc::new(HttpServer::new(bind, router)));
    }

    let app = builder.build();
    app.run().await?;

    Ok(())
}
