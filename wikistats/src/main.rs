use anyhow::{Context, Result};
use health::HealthRegistry;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use wikistats::config::Config;
use wikistats::server::{router, serve};
use wikistats::service::StatsService;

fn start_server(config: &Config, liveness: HealthRegistry) -> Result<JoinHandle<()>> {
    let metrics = if config.export_prometheus {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .context("Failed to install metrics recorder")?;
        Some(handle)
    } else {
        None
    };

    let router = router(liveness, metrics);
    let bind = config.bind_address();

    Ok(tokio::task::spawn(async move {
        if let Err(e) = serve(router, &bind).await {
            error!("Failed to serve health and metrics on {bind}: {e:#}");
        }
    }))
}

async fn shutdown_signal() {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            warn!("Failed to install SIGTERM handler, only SIGINT will stop the service: {e:#}");
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for SIGINT: {e:#}");
            }
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::init_with_defaults()
        .context("Failed to load configuration from environment variables")?;

    let log_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_level(true)
        .with_filter(EnvFilter::from_default_env())
        .boxed();
    tracing_subscriber::registry().with(log_layer).init();

    info!("Starting wikistats service");
    info!("Configuration loaded: {:?}", config);
    config.validate().context("Invalid configuration")?;

    let liveness = HealthRegistry::new("liveness");

    let server_handle = start_server(&config, liveness.clone())?;
    info!("Started health and metrics server on {}", config.bind_address());

    let service = StatsService::new(config, liveness)
        .await
        .context("Failed to create stats service")?;

    let result = service.run_with_shutdown(shutdown_signal()).await;

    server_handle.abort();

    result
}
