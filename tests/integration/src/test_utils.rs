//! Test utilities for fleet integration tests

use aerotask_core::{Coordinate, GatewayConfig, NodeConfig, TaskType, VehicleConfig};
use aerotask_fleet::{
    ChannelSink, FleetRuntime, Scheduler, TaskAssignment, TaskStatus, TaskUpdate, TelemetryEvent,
    TelemetrySink,
};
use aerotask_gateway::{FlightLink, Gateway, LinkError, LinkOp, LinkRequest, LinkResponse, SimLink};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Duration;

/// Home position shared by every test vehicle
pub const HOME: Coordinate = Coordinate {
    lat: 45.0,
    lon: -122.0,
    alt: 0.0,
};

/// Route test logs through `RUST_LOG` when set
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Node configuration for vehicles with the given capabilities
pub fn node_config(vehicles: &[(&str, &[TaskType])]) -> NodeConfig {
    NodeConfig {
        vehicles: vehicles
            .iter()
            .map(|(id, caps)| VehicleConfig {
                id: id.to_string(),
                connection: format!("sim://{id}?lat={}&lon={}", HOME.lat, HOME.lon),
                capabilities: caps.iter().copied().collect(),
            })
            .collect(),
        ..NodeConfig::default()
    }
}

/// Relay assignment a short hop north of home
pub fn relay(task_id: &str, vehicle: &str, duration_s: u64) -> TaskAssignment {
    TaskAssignment {
        task_id: task_id.into(),
        task_type: TaskType::Relay,
        target_vehicle_id: vehicle.into(),
        parameters: json!({
            "relay_position": {"lat": HOME.lat + 0.0002, "lon": HOME.lon},
            "altitude": 20.0,
            "duration": duration_s
        }),
    }
}

/// Running fleet over simulated vehicles with a channel sink attached
pub struct TestFleet {
    /// Engine under test
    pub runtime: FleetRuntime,
    /// Simulators by vehicle id
    pub sims: HashMap<String, Arc<SimLink>>,
    /// Everything the publisher emitted
    pub telemetry: mpsc::Receiver<TelemetryEvent>,
}

impl TestFleet {
    /// Start a fleet; must be called inside a tokio runtime
    pub fn start(vehicles: &[(&str, &[TaskType])]) -> Self {
        Self::start_with(node_config(vehicles), Vec::new())
    }

    /// Start a fleet from explicit configuration plus extra sinks
    pub fn start_with(config: NodeConfig, mut sinks: Vec<Arc<dyn TelemetrySink>>) -> Self {
        let (sink, telemetry) = ChannelSink::new("test", 4_096);
        sinks.push(Arc::new(sink));

        let mut sims = HashMap::new();
        let gateways = config
            .vehicles
            .iter()
            .map(|v| {
                let sim = Arc::new(SimLink::at(v.id.clone(), HOME));
                sims.insert(v.id.clone(), sim.clone());
                Arc::new(Gateway::with_link(v.id.clone(), sim, config.gateway.clone()))
            })
            .collect();
        let runtime = FleetRuntime::start_with_gateways(&config, gateways, sinks)
            .expect("fleet runtime starts");
        Self {
            runtime,
            sims,
            telemetry,
        }
    }

    /// Scheduler of the running engine
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        self.runtime.scheduler()
    }

    /// Simulator behind `vehicle_id`
    pub fn sim(&self, vehicle_id: &str) -> &Arc<SimLink> {
        &self.sims[vehicle_id]
    }

    /// Every telemetry event emitted so far
    pub fn drain_telemetry(&mut self) -> Vec<TelemetryEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.telemetry.try_recv() {
            events.push(event);
        }
        events
    }
}

/// Wait for `task_id` to reach a terminal status
pub async fn wait_terminal(
    updates: &mut broadcast::Receiver<TaskUpdate>,
    task_id: &str,
    limit: Duration,
) -> TaskUpdate {
    tokio::time::timeout(limit, async {
        loop {
            match updates.recv().await {
                Ok(update) if update.task_id == task_id && update.status.is_terminal() => {
                    return update
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("update stream closed"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("{task_id} did not finish within {limit:?}"))
}

/// Current status of a task
pub fn status_of(scheduler: &Scheduler, task_id: &str) -> TaskStatus {
    scheduler.task(task_id).expect("task recorded").status
}

/// Flight-controller bridge stand-in: serves the JSON-lines link protocol
/// on a local port, answering from a simulated vehicle
pub async fn spawn_sim_bridge(sim: Arc<SimLink>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind bridge");
    let addr = listener.local_addr().expect("bridge addr").to_string();
    serve_sim_bridge(listener, sim);
    addr
}

/// Serve the bridge stand-in on an already-bound listener
pub fn serve_sim_bridge(listener: TcpListener, sim: Arc<SimLink>) {
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let sim = sim.clone();
            tokio::spawn(async move {
                let (read, mut write) = stream.into_split();
                let mut lines = BufReader::new(read).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let request: LinkRequest = match serde_json::from_str(&line) {
                        Ok(r) => r,
                        Err(_) => continue,
                    };
                    let response = answer(&sim, request).await;
                    let mut out = serde_json::to_string(&response).expect("encode response");
                    out.push('\n');
                    if write.write_all(out.as_bytes()).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
}

async fn answer(sim: &SimLink, request: LinkRequest) -> LinkResponse {
    let result = match request.op {
        LinkOp::Command { command } => sim.send(&command).await.map(|_| None),
        LinkOp::Query => sim.query_state().await.map(Some),
    };
    match result {
        Ok(state) => LinkResponse {
            seq: request.seq,
            ok: true,
            state,
            error: None,
            retry: false,
        },
        Err(e) => LinkResponse {
            seq: request.seq,
            ok: false,
            state: None,
            retry: !matches!(e, LinkError::Rejected(_)),
            error: Some(e.to_string()),
        },
    }
}

/// Gateway settings that tolerate a real loopback socket
pub fn loopback_gateway() -> GatewayConfig {
    GatewayConfig {
        command_timeout_ms: 1_000,
        query_timeout_ms: 1_000,
        ..GatewayConfig::default()
    }
}
