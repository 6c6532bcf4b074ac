use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cronus::{cluster::KubeProvider, config::Config, server::Server, service::CronusService};

/// Operational view of CronJobs, their Jobs, Pods and logs.
#[derive(Debug, Parser)]
#[command(name = "cronus", version, about)]
struct Cli {
    /// Address to listen on (overrides SERVER_ADDR)
    #[arg(long)]
    addr: Option<String>,
    /// Namespace to watch; all namespaces when omitted (overrides WATCH_NAMESPACE)
    #[arg(long)]
    namespace: Option<String>,
    /// Seconds to wait for the initial CronJob listing
    #[arg(long)]
    sync_timeout_secs: Option<u64>,
    /// Per-request deadline in seconds
    #[arg(long)]
    request_timeout_secs: Option<u64>,
}

impl Cli {
    fn apply(self, config: &mut Config) {
        if let Some(addr) = self.addr {
            config.server.addr = addr;
        }
        if let Some(namespace) = self.namespace {
            config.kube.namespace = Some(namespace).filter(|ns| !ns.is_empty());
        }
        if let Some(secs) = self.sync_timeout_secs {
            config.cache.sync_timeout_secs = secs;
        }
        if let Some(secs) = self.request_timeout_secs {
            config.request.timeout_secs = secs;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration
    let cli = Cli::parse();
    let mut config = Config::load().context("failed to load configuration")?;
    cli.apply(&mut config);
    config.validate().context("invalid configuration")?;
    info!("Loaded configuration: {:?}", config);

    let provider = Arc::new(
        KubeProvider::try_default()
            .await
            .context("failed to connect to the Kubernetes API")?,
    );

    let shutdown = CancellationToken::new();
    let service = Arc::new(CronusService::from_config(
        provider,
        &config,
        shutdown.clone(),
    ));
    service
        .cache()
        .initialize(config.sync_timeout())
        .await
        .context("CronJob cache did not sync")?;

    let server = Server::new(service.clone());
    info!("Starting server on {}", config.server.addr);
    let served = server.start(&config.server.addr, shutdown_signal()).await;

    // Already cancelled on a clean stop; covers the server failing instead.
    shutdown.cancel();
    service.cache().shutdown().await;
    served.context("server failed")?;

    info!("Shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal");
}
