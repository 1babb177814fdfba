mod config;
mod identity;
mod metrics;
mod probes;
mod report;
mod scheduler;
mod security;
mod state;
mod transport;
mod tunnel;
mod update;

use config::{Config, DEFAULT_CONFIG_PATH};
use log::info;
use metrics::MetricsCollector;
use scheduler::Scheduler;
use state::AgentState;
use std::sync::Arc;
use tokio::signal;

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "-v") {
        println!("kaginawa-agent {}", AGENT_VERSION);
        return;
    }

    env_logger::init();

    let config_path = flag_value(&args, "-c").unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let debug_print = args.iter().any(|a| a == "-d");

    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    let state = AgentState::new();
    let metrics = Arc::new(MetricsCollector::new());

    if let Some(port) = std::env::var("METRICS_PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
    {
        let metrics = Arc::clone(&metrics);
        tokio::spawn(async move {
            if let Err(e) = start_metrics_server(metrics, port).await {
                log::warn!("metrics server failed: {}", e);
            }
        });
        info!("metrics server enabled on port {}", port);
    }

    info!("starting kaginawa-agent {}", AGENT_VERSION);
    let scheduler = Scheduler::new(config, state, metrics, AGENT_VERSION, debug_print);

    tokio::select! {
        _ = scheduler.run() => {}
        _ = shutdown_signal() => {
            info!("shutdown signal received, exiting");
        }
    }
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}

fn flag_value(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

#[cfg(feature = "metrics")]
async fn start_metrics_server(metrics: Arc<MetricsCollector>, port: u16) -> anyhow::Result<()> {
    use warp::Filter;

    let metrics_route = warp::path("metrics").map(move || {
        warp::reply::with_header(
            metrics.export_prometheus(),
            "content-type",
            "text/plain; version=0.0.4",
        )
    });

    let health_route =
        warp::path("health").map(|| warp::reply::with_status("OK", warp::http::StatusCode::OK));

    let routes = metrics_route.or(health_route);

    info!("starting metrics server on 0.0.0.0:{}", port);
    warp::serve(routes).run(([0, 0, 0, 0], port)).await;

    Ok(())
}

#[cfg(not(feature = "metrics"))]
async fn start_metrics_server(_metrics: Arc<MetricsCollector>, _port: u16) -> anyhow::Result<()> {
    log::warn!("metrics feature not enabled, skipping metrics server");
    Ok(())
}
