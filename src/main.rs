mod collectors;
mod config;
mod docker;
mod http;
mod metrics;
mod model;
mod network;
mod orchestrator;
mod state;
mod store;
#[cfg(test)]
mod test_support;
mod wol;

use axum::serve;
use clap::Parser;
use collectors::checks::HealthChecker;
use collectors::containers::StatsCollector;
use config::Config;
use metrics::Metrics;
use network::NetworkTools;
use orchestrator::Orchestrator;
use std::net::SocketAddr;
use std::sync::Arc;
use store::MemoryStore;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "labwatch")]
#[command(version)]
struct Cli {
    #[arg(long, default_value = "./config.yaml")]
    config: String,
    #[arg(long)]
    print_default_config: bool,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return;
    }

    let cfg = match Config::load_from_file(&cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(error = %err, "failed to load configuration");
            std::process::exit(1);
        }
    };

    let metrics = match Metrics::new() {
        Ok(m) => m,
        Err(err) => {
            error!(error = %err, "failed to initialise metrics");
            std::process::exit(1);
        }
    };

    let store = match MemoryStore::from_inventory(&cfg.inventory) {
        Ok(store) => Arc::new(store),
        Err(err) => {
            error!(error = %err, "invalid inventory");
            std::process::exit(1);
        }
    };

    let checker = match HealthChecker::new(&cfg.probe, metrics.clone()) {
        Ok(checker) => Arc::new(checker),
        Err(err) => {
            error!(error = %err, "failed to build http client");
            std::process::exit(1);
        }
    };

    let network = match NetworkTools::new(&cfg.network, &cfg.probe.user_agent) {
        Ok(tools) => Arc::new(tools),
        Err(err) => {
            error!(error = %err, "failed to build http client");
            std::process::exit(1);
        }
    };

    let stats = Arc::new(StatsCollector::connect(&cfg.stats, metrics.clone()).await);

    info!(
        listen = %cfg.listen,
        devices = cfg.inventory.devices.len(),
        services = cfg.inventory.services.len(),
        containers = stats.runtime_available(),
        "starting labwatch"
    );

    let engine = Arc::new(Orchestrator::new(
        store,
        checker,
        stats.clone(),
        metrics.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let http_task = {
        let listen = cfg.listen.clone();
        let push_interval = cfg.stats.push_interval();
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let app = http::build_router(metrics, engine, network, push_interval);
            let addr: SocketAddr = match listen.parse() {
                Ok(addr) => addr,
                Err(err) => {
                    error!(error = %err, listen = %listen, "invalid listen address");
                    return;
                }
            };

            let listener = match TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(err) => {
                    error!(error = %err, "failed to start http server");
                    return;
                }
            };

            let server = serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            });

            if let Err(err) = server.await {
                error!(error = %err, "http server error");
            }
        })
    };

    let sampler_task = tokio::spawn(stats.run_history_sampler(shutdown_rx));

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to wait for ctrl+c");
    }
    info!("ctrl+c received, shutting down");

    let _ = shutdown_tx.send(true);

    let _ = sampler_task.await;
    let _ = http_task.await;
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
