mod cluster;
mod config;
mod error;
mod export;
mod http;
mod kafka;
mod offsets;
#[cfg(test)]
mod test_strategies;

use crate::cluster::ClusterManager;
use crate::config::Config;
use crate::export::{BatchSettings, Importer, InfluxClient, RunningImporter};
use crate::http::server::HttpServer;
use crate::offsets::pipeline::run_pipeline;
use crate::offsets::OffsetAggregator;
use clap::Parser;
use std::time::Duration;
use tokio::signal;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "klag-importer")]
#[command(about = "Kafka consumer group lag aggregator with InfluxDB export")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);

    info!("Starting klag-importer");

    let config = Config::load(Some(&args.config))?;
    info!(
        clusters = config.clusters.len(),
        poll_interval = ?config.importer.poll_interval,
        influxdb = config.influxdb.enable,
        "Configuration loaded"
    );

    // A failed CREATE DATABASE aborts startup
    let importer = start_importer(&config).await?;
    let stats = importer.as_ref().map(RunningImporter::stats);

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let (events_tx, events_rx) = mpsc::channel(config.importer.channel_capacity);

    let pipeline_handle = tokio::spawn(run_pipeline(
        OffsetAggregator::new(),
        events_rx,
        importer,
    ));

    let mut handles = Vec::new();
    for cluster_config in &config.clusters {
        let manager = match ClusterManager::new(cluster_config, &config.importer) {
            Ok(m) => m,
            Err(e) => {
                error!(
                    cluster = %cluster_config.name,
                    error = %e,
                    "Failed to create cluster manager"
                );
                continue;
            }
        };

        let shutdown_rx = shutdown_tx.subscribe();
        let events = events_tx.clone();
        handles.push(tokio::spawn(manager.run(shutdown_rx, events)));
    }
    // Managers hold the remaining senders; the pipeline ends when they are gone
    drop(events_tx);

    if handles.is_empty() {
        warn!("No cluster manager is running");
    }

    let http_server = HttpServer::new(
        &config.importer.http_host,
        config.importer.http_port,
        stats,
    );
    let shutdown_rx = shutdown_tx.subscribe();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = http_server.run(shutdown_rx).await {
            error!(error = %e, "HTTP server error");
        }
    });

    shutdown_signal().await;
    info!("Shutdown signal received, stopping...");

    let _ = shutdown_tx.send(());

    let shutdown_timeout = tokio::time::timeout(
        Duration::from_secs(10),
        futures::future::join_all(handles.iter_mut()),
    );
    match shutdown_timeout.await {
        Ok(_) => info!("All cluster managers stopped"),
        Err(_) => {
            error!("Timeout waiting for cluster managers to stop");
            for handle in &handles {
                handle.abort();
            }
        }
    }

    match pipeline_handle.await {
        Ok(aggregator) => info!(
            topics = aggregator.topic_count(),
            groups = aggregator.group_count(),
            "Pipeline drained"
        ),
        Err(e) => error!(error = %e, "Pipeline task failed"),
    }

    let _ = server_handle.await;

    info!("klag-importer stopped");
    Ok(())
}

async fn start_importer(config: &Config) -> anyhow::Result<Option<RunningImporter>> {
    if !config.influxdb.enable {
        info!("InfluxDB export disabled, records will only be logged");
        return Ok(None);
    }

    let store = InfluxClient::new(&config.influxdb)?;
    let settings = BatchSettings::from_config(&config.importer, &config.influxdb);
    let importer = Importer::new(settings, store).start().await?;
    Ok(Some(importer))
}

fn init_logging(level: &str) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
