//! Telemetry Publisher
//!
//! One polling loop per vehicle with three independent timers: the position
//! cadence (which also refreshes the snapshot and runs the safety check), the
//! status cadence, and the background reconnect interval. Sinks are
//! non-blocking; an event a sink cannot take right now is dropped and counted.

use aerotask_core::{TelemetryConfig, TelemetrySnapshot};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::PublishError;
use crate::metrics::FleetMetrics;
use crate::phase::VehiclePhase;
use crate::registry::{DroneRegistry, VehicleEntry};
use crate::safety::SafetyMonitor;

/// Outbound telemetry event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TelemetryEvent {
    /// Position cadence
    Position {
        /// Vehicle identifier
        vehicle_id: String,
        /// Snapshot the position was taken from
        snapshot: TelemetrySnapshot,
    },
    /// System-status cadence
    Status {
        /// Vehicle identifier
        vehicle_id: String,
        /// Latest snapshot
        snapshot: TelemetrySnapshot,
        /// Control phase
        phase: VehiclePhase,
        /// Task attached to the vehicle
        task_id: Option<String>,
    },
}

impl TelemetryEvent {
    /// Vehicle the event describes
    pub fn vehicle_id(&self) -> &str {
        match self {
            TelemetryEvent::Position { vehicle_id, .. } | TelemetryEvent::Status { vehicle_id, .. } => {
                vehicle_id
            }
        }
    }

    /// Snapshot the event carries
    pub fn snapshot(&self) -> &TelemetrySnapshot {
        match self {
            TelemetryEvent::Position { snapshot, .. } | TelemetryEvent::Status { snapshot, .. } => {
                snapshot
            }
        }
    }
}

/// Destination for telemetry events. Must not block.
pub trait TelemetrySink: Send + Sync {
    /// Hand over an event, or refuse it immediately
    fn try_publish(&self, event: TelemetryEvent) -> Result<(), PublishError>;

    /// Name for logs
    fn name(&self) -> &str;
}

/// Sink backed by a bounded channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    name: String,
    tx: mpsc::Sender<TelemetryEvent>,
}

impl ChannelSink {
    /// Create a sink and the receiver its events arrive on
    pub fn new(name: impl Into<String>, capacity: usize) -> (Self, mpsc::Receiver<TelemetryEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                name: name.into(),
                tx,
            },
            rx,
        )
    }
}

impl TelemetrySink for ChannelSink {
    fn try_publish(&self, event: TelemetryEvent) -> Result<(), PublishError> {
        self.tx.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => PublishError::Full,
            mpsc::error::TrySendError::Closed(_) => PublishError::Closed,
        })
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Sink that writes events to the trace log
#[derive(Debug, Default, Clone)]
pub struct LogSink;

impl TelemetrySink for LogSink {
    fn try_publish(&self, event: TelemetryEvent) -> Result<(), PublishError> {
        let snapshot = event.snapshot();
        match &event {
            TelemetryEvent::Position { vehicle_id, .. } => trace!(
                vehicle_id = %vehicle_id,
                lat = snapshot.position.lat,
                lon = snapshot.position.lon,
                alt = snapshot.position.alt,
                "position"
            ),
            TelemetryEvent::Status { vehicle_id, phase, .. } => debug!(
                vehicle_id = %vehicle_id,
                battery_pct = snapshot.battery_pct,
                mode = %snapshot.mode,
                armed = snapshot.armed,
                ?phase,
                "status"
            ),
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "log"
    }
}

/// Polls vehicles and fans events out to sinks
pub struct TelemetryPublisher {
    config: TelemetryConfig,
    reconnect_interval: Duration,
    registry: Arc<DroneRegistry>,
    metrics: Arc<FleetMetrics>,
    sinks: Vec<Arc<dyn TelemetrySink>>,
    safety: Option<Arc<SafetyMonitor>>,
}

impl std::fmt::Debug for TelemetryPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryPublisher")
            .field("config", &self.config)
            .field("sinks", &self.sinks.iter().map(|s| s.name().to_string()).collect::<Vec<_>>())
            .field("safety", &self.safety.is_some())
            .finish()
    }
}

impl TelemetryPublisher {
    /// Publisher with no sinks and no safety monitor
    pub fn new(config: TelemetryConfig, registry: Arc<DroneRegistry>, metrics: Arc<FleetMetrics>) -> Self {
        Self {
            config,
            reconnect_interval: Duration::from_secs(5),
            registry,
            metrics,
            sinks: Vec::new(),
            safety: None,
        }
    }

    /// Add a sink
    pub fn with_sink(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Run the safety check on every position cycle
    pub fn with_safety(mut self, monitor: Arc<SafetyMonitor>) -> Self {
        self.safety = Some(monitor);
        self
    }

    /// Background reconnect period for degraded links
    pub fn with_reconnect_interval(mut self, period: Duration) -> Self {
        self.reconnect_interval = period;
        self
    }

    /// Fan an event out to every sink
    pub fn publish(&self, event: TelemetryEvent) {
        for sink in &self.sinks {
            match sink.try_publish(event.clone()) {
                Ok(()) => self.metrics.telemetry_published(),
                Err(e) => {
                    self.metrics.telemetry_dropped();
                    trace!(sink = sink.name(), vehicle_id = %event.vehicle_id(), error = %e, "Telemetry event dropped");
                }
            }
        }
    }

    /// Start a loop for every vehicle registered now
    pub fn spawn_all(self: &Arc<Self>, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        self.registry
            .all()
            .into_iter()
            .map(|entry| self.spawn_vehicle(entry, cancel.child_token()))
            .collect()
    }

    /// Start the loop for one vehicle. It ends on cancellation or once the
    /// vehicle is deregistered.
    pub fn spawn_vehicle(self: &Arc<Self>, entry: Arc<VehicleEntry>, cancel: CancellationToken) -> JoinHandle<()> {
        let publisher = Arc::clone(self);
        tokio::spawn(async move { publisher.run_vehicle(entry, cancel).await })
    }

    async fn run_vehicle(&self, entry: Arc<VehicleEntry>, cancel: CancellationToken) {
        let mut position = interval(self.config.position_period());
        position.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut status = interval(self.config.status_period());
        status.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut reconnect = interval_at(Instant::now() + self.reconnect_interval, self.reconnect_interval);
        reconnect.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(vehicle_id = %entry.id(), "Telemetry loop started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = position.tick() => self.poll(&entry).await,
                _ = status.tick() => {
                    if self.registry.lookup(entry.id()).is_err() {
                        break;
                    }
                    if let Some(snapshot) = entry.latest_snapshot() {
                        self.publish(TelemetryEvent::Status {
                            vehicle_id: entry.id().to_string(),
                            snapshot,
                            phase: entry.phase(),
                            task_id: entry.current_task(),
                        });
                    }
                }
                _ = reconnect.tick() => self.reconnect(&entry).await,
            }
        }
        info!(vehicle_id = %entry.id(), "Telemetry loop stopped");
    }

    /// Refresh the snapshot, publish it, run the safety check
    async fn poll(&self, entry: &VehicleEntry) {
        match entry.gateway().query_state().await {
            Ok(snapshot) => {
                if entry.update_snapshot(snapshot) {
                    self.publish(TelemetryEvent::Position {
                        vehicle_id: entry.id().to_string(),
                        snapshot,
                    });
                }
            }
            Err(e) => debug!(vehicle_id = %entry.id(), error = %e, "State query failed"),
        }
        if let Some(monitor) = &self.safety {
            monitor.check(entry);
        }
    }

    async fn reconnect(&self, entry: &VehicleEntry) {
        let gateway = entry.gateway();
        if !gateway.connection_state().needs_reconnect() {
            return;
        }
        match gateway.reconnect().await {
            Ok(()) => info!(vehicle_id = %entry.id(), "Link re-established"),
            Err(e) => warn!(vehicle_id = %entry.id(), error = %e, "Reconnect failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aerotask_core::{Coordinate, GatewayConfig};
    use aerotask_gateway::{Gateway, SimLink};

    fn registry_with(id: &str) -> (Arc<DroneRegistry>, Arc<SimLink>) {
        let registry = Arc::new(DroneRegistry::new());
        let sim = Arc::new(SimLink::at(id, Coordinate::new(45.0, -122.0, 0.0)));
        let gateway = Arc::new(Gateway::with_link(id, sim.clone(), GatewayConfig::default()));
        registry
            .register(VehicleEntry::new(id, Default::default(), gateway, 8))
            .unwrap();
        (registry, sim)
    }

    #[tokio::test]
    async fn test_channel_sink_drops_when_full() {
        let (sink, mut rx) = ChannelSink::new("test", 1);
        let snapshot = SimLink::at("x", Coordinate::new(0.0, 0.0, 0.0)).peek();
        let event = TelemetryEvent::Position {
            vehicle_id: "x".into(),
            snapshot,
        };
        assert!(sink.try_publish(event.clone()).is_ok());
        assert_eq!(sink.try_publish(event.clone()), Err(PublishError::Full));
        assert_eq!(rx.recv().await.unwrap(), event);
        drop(rx);
        assert_eq!(sink.try_publish(event), Err(PublishError::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cadences() {
        let (registry, _sim) = registry_with("uav-1");
        let metrics = Arc::new(FleetMetrics::default());
        let (sink, mut rx) = ChannelSink::new("test", 1024);
        let publisher = Arc::new(
            TelemetryPublisher::new(TelemetryConfig::default(), registry, metrics).with_sink(Arc::new(sink)),
        );
        let cancel = CancellationToken::new();
        let loops = publisher.spawn_all(&cancel);

        tokio::time::sleep(Duration::from_millis(2_100)).await;
        cancel.cancel();
        for handle in loops {
            handle.await.unwrap();
        }

        let (mut positions, mut statuses) = (0, 0);
        while let Ok(event) = rx.try_recv() {
            match event {
                TelemetryEvent::Position { .. } => positions += 1,
                TelemetryEvent::Status { .. } => statuses += 1,
            }
        }
        // Ticks at 0, 250, ..., 2000ms and 0, 1000, 2000ms; the first status
        // tick can race the first poll
        assert_eq!(positions, 9);
        assert!((2..=3).contains(&statuses), "statuses = {statuses}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_sink_is_counted_not_awaited() {
        let (registry, _sim) = registry_with("uav-1");
        let metrics = Arc::new(FleetMetrics::default());
        let (sink, _rx) = ChannelSink::new("tiny", 1);
        let publisher = Arc::new(
            TelemetryPublisher::new(TelemetryConfig::default(), registry, metrics.clone())
                .with_sink(Arc::new(sink)),
        );
        let cancel = CancellationToken::new();
        let loops = publisher.spawn_all(&cancel);
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();
        for handle in loops {
            handle.await.unwrap();
        }
        assert!(metrics.dropped_events() >= 3);
    }
}
