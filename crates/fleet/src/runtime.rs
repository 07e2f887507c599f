//! Fleet runtime: wires configuration into a running engine

use aerotask_core::NodeConfig;
use aerotask_gateway::Gateway;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::FleetError;
use crate::safety::{SafetyMonitor, SafetyPolicy};
use crate::scheduler::{Scheduler, ShutdownReport};
use crate::telemetry::{TelemetryPublisher, TelemetrySink};

/// How often terminal tasks past retention are purged
const PURGE_PERIOD: Duration = Duration::from_secs(60);

/// Running scheduler, safety monitor and telemetry loops
pub struct FleetRuntime {
    scheduler: Arc<Scheduler>,
    safety: Arc<SafetyMonitor>,
    publisher: Arc<TelemetryPublisher>,
    cancel: CancellationToken,
    background: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for FleetRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FleetRuntime")
            .field("scheduler", &self.scheduler)
            .field("background", &self.background.len())
            .finish()
    }
}

impl FleetRuntime {
    /// Connect every configured vehicle and start the engine
    pub async fn start(config: &NodeConfig, sinks: Vec<Arc<dyn TelemetrySink>>) -> Result<Self, FleetError> {
        let mut gateways = Vec::with_capacity(config.vehicles.len());
        for vehicle in &config.vehicles {
            let gateway = Gateway::connect(&vehicle.id, &vehicle.connection, config.gateway.clone()).await?;
            gateways.push(Arc::new(gateway));
        }
        Self::start_with_gateways(config, gateways, sinks)
    }

    /// Start the engine over gateways that are already open, one per
    /// configured vehicle, in configuration order
    pub fn start_with_gateways(
        config: &NodeConfig,
        gateways: Vec<Arc<Gateway>>,
        sinks: Vec<Arc<dyn TelemetrySink>>,
    ) -> Result<Self, FleetError> {
        config.validate()?;
        let scheduler = Arc::new(Scheduler::new(config.scheduler.clone(), config.executor.clone()));
        for (vehicle, gateway) in config.vehicles.iter().zip(gateways) {
            scheduler.register_vehicle(vehicle.id.clone(), vehicle.capabilities.clone(), gateway)?;
        }

        let safety = Arc::new(SafetyMonitor::new(
            SafetyPolicy::from_config(&config.safety)?,
            scheduler.clone(),
        ));
        let publisher = sinks.into_iter().fold(
            TelemetryPublisher::new(
                config.telemetry.clone(),
                scheduler.registry().clone(),
                scheduler.fleet_metrics().clone(),
            )
            .with_safety(safety.clone())
            .with_reconnect_interval(config.gateway.reconnect_interval()),
            |publisher, sink| publisher.with_sink(sink),
        );
        let publisher = Arc::new(publisher);

        let cancel = CancellationToken::new();
        let mut background = publisher.spawn_all(&cancel);
        background.push(spawn_purge(scheduler.clone(), cancel.child_token()));

        info!(
            vehicles = scheduler.registry().len(),
            "Fleet runtime started"
        );
        Ok(Self {
            scheduler,
            safety,
            publisher,
            cancel,
            background,
        })
    }

    /// Task scheduler
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Safety monitor
    pub fn safety(&self) -> &Arc<SafetyMonitor> {
        &self.safety
    }

    /// Telemetry publisher
    pub fn publisher(&self) -> &Arc<TelemetryPublisher> {
        &self.publisher
    }

    /// Drain the scheduler, then stop telemetry and housekeeping
    pub async fn shutdown(self) -> ShutdownReport {
        let report = self.scheduler.shutdown().await;
        self.cancel.cancel();
        for handle in self.background {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background loop ended abnormally");
            }
        }
        report
    }
}

fn spawn_purge(scheduler: Arc<Scheduler>, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(PURGE_PERIOD);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    scheduler.purge_terminal();
                }
            }
        }
    })
}
