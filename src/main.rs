//! Race timer - two-lane race timing core
//!
//! Module structure:
//! - `domain/` - Core race types and outbound events
//! - `io/` - External interfaces (serial device, simulator, HTTP, MQTT)
//! - `services/` - Sensor gate, state machine, dispatcher, broadcaster
//! - `infra/` - Infrastructure (Config, Metrics)

use anyhow::Context;
use clap::Parser;
use race_timer::infra::{Config, HardwareMode, Metrics};
use race_timer::io::{
    start_http_server, EventLogger, Hardware, HttpContext, MqttPublisher, SerialLink,
    SimulatedHardware,
};
use race_timer::services::{Broadcaster, CommandDispatcher, RaceController, SensorGate};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Race timer - two-lane timing with start/finish gates
#[derive(Parser, Debug)]
#[command(name = "race-timer", version, about)]
struct Args {
    /// Path to TOML configuration file (default: $CONFIG_FILE or config/dev.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

fn init_logging(json: bool) {
    // Default: INFO, use RUST_LOG=debug for per-trigger visibility
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.log_json);

    info!(version = %env!("CARGO_PKG_VERSION"), git_hash = %env!("GIT_HASH"), "race_timer_starting");

    let config_path = args.config.unwrap_or_else(|| Config::resolve_config_path(&[]));
    let config = Config::load_from_path(&config_path);
    info!(
        config_file = %config.config_file(),
        site = %config.site_id(),
        hardware = %config.hardware_mode().as_str(),
        serial_device = %config.serial_device(),
        debounce_ms = %config.debounce_ms(),
        tie_tolerance_ms = %config.tie_tolerance_ms(),
        max_race_ms = %config.max_race_ms(),
        ack_timeout_ms = %config.ack_timeout().as_millis(),
        http_port = %config.http_port(),
        mqtt_enabled = %config.mqtt_enabled(),
        "config_loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics = Arc::new(Metrics::new());

    // Single ordered queue into the race controller (bounded for backpressure)
    let (input_tx, input_rx) = mpsc::channel(config.queue_capacity());

    let gate = SensorGate::new(input_tx.clone(), config.timing().debounce, metrics.clone());
    let broadcaster = Broadcaster::new(config.subscriber_capacity(), metrics.clone());
    let controller =
        RaceController::new(config.timing(), gate.clone(), broadcaster.clone(), metrics.clone());
    let snapshots = controller.subscribe_snapshot();

    let hardware: Arc<dyn Hardware> = match config.hardware_mode() {
        HardwareMode::Serial => Arc::new(SerialLink::open(
            config.serial_device(),
            config.serial_baud(),
            gate.clone(),
            shutdown_rx.clone(),
        )
        .with_context(|| format!("Failed to open serial device {}", config.serial_device()))?),
        HardwareMode::Sim => Arc::new(SimulatedHardware::new(gate.clone(), config.sim())),
    };
    info!(hardware = %hardware.name(), "hardware_ready");

    let dispatcher = Arc::new(CommandDispatcher::new(
        input_tx,
        hardware,
        gate.clone(),
        config.ack_timeout(),
        metrics.clone(),
    ));

    // Observers
    let logger = EventLogger::new(broadcaster.subscribe("log"));
    tokio::spawn(logger.run(shutdown_rx.clone()));

    if config.mqtt_enabled() {
        let publisher = MqttPublisher::new(&config, broadcaster.subscribe("mqtt"));
        tokio::spawn(publisher.run(shutdown_rx.clone()));
    }

    let http_port = config.http_port();
    if http_port > 0 {
        let ctx = HttpContext {
            dispatcher,
            gate,
            snapshots,
            broadcaster: broadcaster.clone(),
            metrics: metrics.clone(),
            site_id: Arc::from(config.site_id()),
        };
        let http_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = start_http_server(http_port, ctx, http_shutdown).await {
                error!(error = %e, "http_server_error");
            }
        });
    }

    // Periodic metrics summary
    let metrics_clone = metrics.clone();
    let metrics_interval = config.metrics_interval_secs();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(metrics_interval));
        loop {
            interval.tick().await;
            metrics_clone.report().log();
        }
    });

    let shutdown_signal = shutdown_tx;
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = shutdown_signal.send(true);
    });

    // Runs until shutdown
    controller.run(input_rx, shutdown_rx).await;
    broadcaster.close();

    info!("race-timer shutdown complete");
    Ok(())
}
