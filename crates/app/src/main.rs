//! `dark`: keeps Grafana dashboards in sync with GrafanaDashboard resources.

#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use dark_controller::{Controller, ControllerConfig, Reconciler};
use dark_kubehub::{KubeEventRecorder, KubeStatusWriter};
use dark_provision::FileProvisioner;
use dark_store::{DashboardStore, HasSynced};
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "dark", version, about = "GrafanaDashboard controller")]
struct Cli {
    /// Namespace to watch (default: all namespaces)
    #[arg(long = "namespace", env = "DARK_NAMESPACE")]
    namespace: Option<String>,

    /// Number of concurrent workers
    #[arg(long = "workers", env = "DARK_WORKERS", default_value_t = 2)]
    workers: usize,

    /// Seconds to wait for the informer cache before giving up
    #[arg(long = "cache-sync-timeout-secs", env = "DARK_CACHE_SYNC_TIMEOUT_SECS", default_value_t = 60)]
    cache_sync_timeout_secs: u64,

    /// Period of full cache replays; 0 disables them
    #[arg(long = "resync-secs", env = "DARK_RESYNC_SECS", default_value_t = 300)]
    resync_secs: u64,

    /// Retries allowed per dashboard when failures are requeued
    #[arg(long = "max-requeues", env = "DARK_MAX_REQUEUES", default_value_t = 15)]
    max_requeues: u32,

    /// Directory Grafana's file provider reads dashboards from
    #[arg(long = "provision-dir", env = "DARK_PROVISION_DIR")]
    provision_dir: PathBuf,

    /// Retry dashboards whose creation failed, with backoff
    #[arg(long = "requeue-failures", env = "DARK_REQUEUE_FAILURES", action = ArgAction::SetTrue)]
    requeue_failures: bool,
}

fn init_tracing() {
    let env = std::env::var("DARK_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("DARK_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid DARK_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let client = kube::Client::try_default().await.context("building kube client")?;
    let store = Arc::new(DashboardStore::new());

    let reconciler = Reconciler::new(
        store.clone(),
        Arc::new(FileProvisioner::new(&cli.provision_dir)),
        Arc::new(KubeStatusWriter::new(client.clone())),
        Arc::new(KubeEventRecorder::new(client.clone())),
    )
    .requeue_on_creator_failure(cli.requeue_failures);
    let config = ControllerConfig {
        cache_sync_timeout: Duration::from_secs(cli.cache_sync_timeout_secs),
        max_requeues: cli.max_requeues,
    };
    let synced = vec![store.clone() as Arc<dyn HasSynced>];
    let controller = Arc::new(Controller::new(config, reconciler, synced));
    store.add_handler(controller.enqueuer());

    let resync = Some(Duration::from_secs(cli.resync_secs));
    let informer = {
        let store = store.clone();
        let namespace = cli.namespace.clone();
        tokio::spawn(async move {
            if let Err(e) = dark_kubehub::run_informer(client, namespace.as_deref(), store, resync).await {
                error!(error = %e, "informer failed");
            }
        })
    };

    info!(provision_dir = %cli.provision_dir.display(), ns = ?cli.namespace, "starting controller");
    let shutdown = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl-C");
        }
        info!("Ctrl-C received; shutting down");
    };
    let result = controller.run(cli.workers, shutdown).await;
    informer.abort();
    result.context("running controller")?;
    info!("controller stopped");
    Ok(())
}
