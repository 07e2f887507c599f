use aerotask_bridge::{open_feed, run_feed, websocket, WsSink};
use aerotask_core::{logging, NodeConfig};
use aerotask_fleet::{FleetRuntime, LogSink, Scheduler, TelemetrySink};
use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const NODE_PROTOCOL_VERSION: u32 = 1;
const NODE_RUNTIME_VERSION: u32 = 1;

#[derive(Debug, Serialize)]
struct NodeVersionHandshake {
    version: &'static str,
    runtime_version: u32,
    protocol_version: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|arg| arg == "--version-json") {
        let handshake = NodeVersionHandshake {
            version: env!("CARGO_PKG_VERSION"),
            runtime_version: NODE_RUNTIME_VERSION,
            protocol_version: NODE_PROTOCOL_VERSION,
        };
        println!("{}", serde_json::to_string(&handshake)?);
        return Ok(());
    }

    let config_path = parse_config_path(&args)?;
    let mut config = NodeConfig::from_file(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    config.apply_env_overrides()?;
    config.validate()?;
    logging::init_from_config(&config.service)?;

    info!(
        service = %config.service.name,
        version = env!("CARGO_PKG_VERSION"),
        vehicles = config.vehicles.len(),
        "Starting AeroTask node"
    );

    let cancel = CancellationToken::new();
    let mut sinks: Vec<Arc<dyn TelemetrySink>> = vec![Arc::new(LogSink)];
    let mut background: Vec<JoinHandle<()>> = Vec::new();

    if let Some(addr) = &config.bridge.ws_addr {
        let listener = websocket::bind(addr)
            .await
            .with_context(|| format!("binding telemetry WebSocket on {addr}"))?;
        let sink = Arc::new(WsSink::new(config.telemetry.sink_buffer));
        sinks.push(sink.clone());
        background.push(tokio::spawn(websocket::serve(listener, sink, cancel.child_token())));
    }

    let runtime = FleetRuntime::start(&config, sinks)
        .await
        .context("starting fleet runtime")?;
    let scheduler = runtime.scheduler().clone();

    if let Some(mut feed) = open_feed(&config.bridge.feed).await.context("opening task feed")? {
        let scheduler = scheduler.clone();
        let cancel = cancel.child_token();
        background.push(tokio::spawn(async move {
            run_feed(feed.as_mut(), &scheduler, &cancel).await;
        }));
    }

    background.push(spawn_metrics_log(
        scheduler.clone(),
        Duration::from_secs(config.service.metrics_interval_secs.max(1)),
        cancel.child_token(),
    ));

    info!("AeroTask node running, Ctrl-C to stop");
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Unable to listen for shutdown signal");
    }

    info!("Shutdown requested, draining vehicles");
    cancel.cancel();
    let report = runtime.shutdown().await;
    for handle in background {
        if let Err(e) = handle.await {
            warn!(error = %e, "Background task ended abnormally");
        }
    }
    info!(
        vehicles = report.vehicles,
        forced = ?report.forced,
        elapsed_ms = report.elapsed.as_millis() as u64,
        "AeroTask node stopped"
    );
    Ok(())
}

fn spawn_metrics_log(scheduler: Arc<Scheduler>, period: Duration, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // First tick fires immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match serde_json::to_string(&scheduler.metrics()) {
                        Ok(metrics) => info!(metrics = %metrics, "Fleet metrics"),
                        Err(e) => warn!(error = %e, "Metrics snapshot not serializable"),
                    }
                }
            }
        }
    })
}

fn parse_config_path(args: &[String]) -> Result<PathBuf> {
    let mut args_iter = args.iter();
    while let Some(arg) = args_iter.next() {
        if arg == "--config" {
            if let Some(path) = args_iter.next() {
                return Ok(PathBuf::from(path));
            }
            bail!("--config was provided without a path");
        }
    }

    bail!("missing required --config <path> argument")
}
