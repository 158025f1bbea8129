//! Pothole edge device
//!
//! Fuses vibration, ultrasonic and vision signals into confirmed pothole
//! events and relays them to the backend through a durable store-and-forward
//! queue.
//!
//! Module structure:
//! - `domain/` - Sensor types and the pothole event model
//! - `io/` - External boundaries (backend HTTP, event store, sensors, detector, replay, Prometheus)
//! - `services/` - Fusion engine, auth session, delivery worker, orchestrator
//! - `infra/` - Infrastructure (Config, Metrics)

use clap::Parser;
use pothole_edge::infra::{Config, Metrics};
use pothole_edge::io::backend::HttpBackend;
use pothole_edge::io::replay::ReplaySource;
use pothole_edge::io::store::EventStore;
use pothole_edge::services::Orchestrator;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// Pothole detection edge device
#[derive(Parser, Debug)]
#[command(name = "pothole-edge", version, about)]
struct Args {
    /// Path to TOML configuration file (default: $CONFIG_FILE or config/dev.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Feed a JSONL script of readings and detections instead of hardware
    #[arg(long, value_name = "FILE")]
    replay: Option<String>,

    /// Print dead-lettered events and exit
    #[arg(long)]
    list_dead_letter: bool,

    /// Move a dead-lettered event back to the pending queue and exit
    #[arg(long, value_name = "EVENT_ID")]
    requeue: Option<Uuid>,

    /// Delete a dead-lettered event and exit
    #[arg(long, value_name = "EVENT_ID")]
    purge: Option<Uuid>,
}

/// Operator commands against the store; returns true if one ran
fn run_store_command(args: &Args, config: &Config, metrics: Arc<Metrics>) -> anyhow::Result<bool> {
    if !args.list_dead_letter && args.requeue.is_none() && args.purge.is_none() {
        return Ok(false);
    }
    let store = EventStore::open(config, metrics)?;

    if args.list_dead_letter {
        for record in store.list_dead_letter() {
            println!(
                "{} {} attempts={} last_error={}",
                record.event.id,
                record.event.timestamp.to_rfc3339(),
                record.attempt_count,
                record.last_error.as_deref().unwrap_or("-")
            );
        }
    }
    if let Some(id) = args.requeue {
        let found = store.requeue_dead_letter(id)?;
        println!("requeue {}: {}", id, if found { "ok" } else { "not found" });
    }
    if let Some(id) = args.purge {
        let found = store.purge_dead_letter(id)?;
        println!("purge {}: {}", id, if found { "ok" } else { "not found" });
    }
    Ok(true)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize structured logging with configurable level via RUST_LOG env var
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    let args = Args::parse();
    let config_path = args.config.clone().unwrap_or_else(|| Config::resolve_config_path(&[]));
    let config = Config::load_from_path(&config_path);
    let metrics = Arc::new(Metrics::new());

    if run_store_command(&args, &config, metrics.clone())? {
        return Ok(());
    }

    info!(version = %env!("CARGO_PKG_VERSION"), git_hash = %env!("GIT_HASH"), "pothole-edge starting");
    info!(
        config_file = %config.config_file(),
        device_id = %config.device_id(),
        backend_url = %config.backend_url(),
        store_dir = %config.store_dir(),
        window_timeout_ms = %config.window_timeout().as_millis(),
        cooldown_ms = %config.cooldown().as_millis(),
        vision_high_confidence = %config.vision_high_confidence(),
        max_attempts = %config.max_attempts(),
        prometheus_port = %config.prometheus_port(),
        "config_loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let backend = Arc::new(HttpBackend::new(&config)?);
    let orchestrator = Orchestrator::new(config.clone(), backend, metrics.clone())?;

    // Scripted input in place of hardware
    if let Some(path) = &args.replay {
        let replay = ReplaySource::from_file(path)?;
        let tx = orchestrator.input_sender();
        let replay_metrics = metrics.clone();
        let replay_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            replay.run(tx, replay_metrics, replay_shutdown).await;
        });
    } else {
        info!("no_input_sources: delivering queued events only");
    }

    // Start Prometheus metrics HTTP server (if port > 0)
    let prometheus_port = config.prometheus_port();
    if prometheus_port > 0 {
        let prom_metrics = metrics.clone();
        let status = orchestrator.status_sources();
        let prom_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = pothole_edge::io::prometheus::start_metrics_server(
                prometheus_port,
                prom_metrics,
                status,
                prom_shutdown,
            )
            .await
            {
                tracing::error!(error = %e, "Prometheus metrics server error");
            }
        });
    }

    // Start metrics reporter
    let metrics_clone = metrics.clone();
    let metrics_interval = config.metrics_interval_secs().max(1);
    let mut reporter_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(metrics_interval));
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => metrics_clone.report().log(),
                _ = reporter_shutdown.changed() => break,
            }
        }
    });

    // Handle shutdown on Ctrl+C
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = shutdown_tx.send(true);
    });

    orchestrator.run(shutdown_rx).await;

    metrics.report().log();
    info!("pothole-edge shutdown complete");
    Ok(())
}
