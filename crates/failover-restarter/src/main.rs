use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use kube::Client;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use failover_restarter::config::RestarterConfig;
use failover_restarter::control::ControlLoop;
use failover_restarter::health::{run_health_server, HealthState};
use failover_restarter::leader::{LeaderElection, LeaderElectionConfig};
use failover_restarter::sentinel::SentinelWatcher;
use failover_restarter::workload::KubeWorkloads;

#[tokio::main]
async fn main() -> Result<()> {
    // JSON lines for the cluster log pipeline
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false),
        )
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("failover-restarter starting");

    let config = RestarterConfig::from_env().context("Failed to load configuration")?;
    let leader_config =
        LeaderElectionConfig::from_env().context("Failed to load leader election config")?;

    info!(
        sentinel = %format!("{}:{}", config.sentinel.host, config.sentinel.port),
        master_set = %config.sentinel.master_set,
        deployments = ?config.restart.deployments,
        statefulsets = ?config.restart.statefulsets,
        dynamic_selectors = config.restart.dynamic.len(),
        leader_election = leader_config.is_some(),
        "Loaded configuration"
    );

    let kube_client = build_kube_client(config.kube_timeout).await?;
    info!("Connected to Kubernetes cluster");

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone())?;

    let health = Arc::new(HealthState::new());
    let health_server = tokio::spawn(run_health_server(health.clone(), config.health_port));
    tokio::spawn(async move {
        match health_server.await {
            Ok(Err(e)) => error!(error = %e, "Health check server failed"),
            Err(e) => error!(error = %e, "Health check server task failed"),
            Ok(Ok(())) => {}
        }
    });

    let renewal = if let Some(leader_config) = &leader_config {
        let election = LeaderElection::new(kube_client.clone(), leader_config);
        if !election.acquire(&shutdown).await {
            info!("Shutdown requested before leadership was acquired");
            return Ok(());
        }
        Some(election.spawn_renewal_task(shutdown.clone()))
    } else {
        None
    };

    let watcher =
        SentinelWatcher::new(config.sentinel.clone()).context("Invalid Sentinel address")?;
    let workloads = Arc::new(KubeWorkloads::new(kube_client, config.kube_timeout));

    ControlLoop::new(watcher, workloads, config.restart, config.poll)
        .with_concurrency(config.restart_concurrency)
        .with_health(health)
        .run(shutdown)
        .await;

    if let Some(renewal) = renewal {
        if renewal.await.context("Lease renewal task failed")? {
            bail!("Leadership lost, exiting so a standby can take over");
        }
    }

    info!("Shutdown complete");
    Ok(())
}

/// Build a Kubernetes client whose calls cannot hang indefinitely
async fn build_kube_client(timeout: Duration) -> Result<Client> {
    let mut kube_config = kube::Config::infer()
        .await
        .context("Failed to infer Kubernetes config")?;

    kube_config.connect_timeout = Some(timeout);
    kube_config.read_timeout = Some(timeout);
    kube_config.write_timeout = Some(timeout);

    Client::try_from(kube_config).context("Failed to create Kubernetes client")
}

fn spawn_signal_handler(shutdown: CancellationToken) -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to setup SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to setup SIGINT handler")?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully"),
            _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully"),
            _ = shutdown.cancelled() => return,
        }
        shutdown.cancel();
    });

    Ok(())
}
