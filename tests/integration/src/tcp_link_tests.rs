//! TCP flight link against a bridge stand-in, in real time

use aerotask_core::{Coordinate, TaskType};
use aerotask_fleet::{FleetRuntime, TaskStatus};
use aerotask_gateway::{ConnectionState, FlightCommand, Gateway, SimLink};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::time::{Duration, Instant};

use crate::test_utils::{
    loopback_gateway, node_config, relay, serve_sim_bridge, spawn_sim_bridge, wait_terminal, HOME,
};

#[tokio::test]
async fn test_tcp_vehicle_runs_relay() {
    let sim = Arc::new(SimLink::at("uav-tcp", HOME));
    let addr = spawn_sim_bridge(sim.clone()).await;

    let mut config = node_config(&[("uav-tcp", &[TaskType::Relay])]);
    config.vehicles[0].connection = format!("tcp://{addr}");
    config.gateway = loopback_gateway();

    let runtime = FleetRuntime::start(&config, Vec::new()).await.unwrap();
    let scheduler = runtime.scheduler().clone();
    let mut updates = scheduler.subscribe_updates();

    let mut task = relay("relay-tcp", "uav-tcp", 1);
    // Hover over home so the real-time run stays short
    task.parameters["relay_position"] = serde_json::json!({"lat": HOME.lat, "lon": HOME.lon});
    task.parameters["altitude"] = serde_json::json!(10.0);
    scheduler.assign(task).unwrap();

    let done = wait_terminal(&mut updates, "relay-tcp", Duration::from_secs(30)).await;
    assert_eq!(done.status, TaskStatus::Completed);

    let commands = sim.commands();
    assert!(commands.contains(&FlightCommand::Arm));
    assert!(commands
        .iter()
        .any(|c| matches!(c, FlightCommand::Takeoff { altitude_m } if *altitude_m == 10.0)));

    let gateway = scheduler.registry().lookup("uav-tcp").unwrap().gateway().clone();
    assert_eq!(gateway.endpoint(), format!("tcp://{addr}"));
    assert!(gateway.stats().commands_acknowledged >= 2);

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_refusal_crosses_the_wire_as_rejection() {
    let sim = Arc::new(SimLink::at("uav-tcp", Coordinate::new(HOME.lat, HOME.lon, 0.0)));
    sim.reject_commands(Some("geofence locked".into()));
    let addr = spawn_sim_bridge(sim.clone()).await;

    let gateway = Gateway::connect("uav-tcp", &format!("tcp://{addr}"), loopback_gateway())
        .await
        .unwrap();
    let err = gateway.arm().await.unwrap_err();
    assert!(err.to_string().contains("geofence locked"), "{err}");
    assert_eq!(gateway.stats().commands_rejected, 1);
    assert_eq!(gateway.stats().retries, 0);

    // Queries still answer
    let state = gateway.query_state().await.unwrap();
    assert!(!state.armed);
}

#[tokio::test]
async fn test_unreachable_vehicle_does_not_block_fleet() {
    // A port nothing listens on yet
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let mut config = node_config(&[("uav-1", &[TaskType::Relay]), ("uav-2", &[TaskType::Relay])]);
    config.vehicles[1].connection = format!("tcp://{addr}");
    config.gateway = loopback_gateway();
    config.gateway.retry_base_delay_ms = 10;
    config.gateway.reconnect_interval_secs = 1;

    let runtime = FleetRuntime::start(&config, Vec::new()).await.unwrap();
    let scheduler = runtime.scheduler().clone();
    let mut updates = scheduler.subscribe_updates();

    let offline = scheduler.registry().lookup("uav-2").unwrap().gateway().clone();
    assert_eq!(offline.connection_state(), ConnectionState::Disconnected);

    let mut task = relay("relay-sim", "uav-1", 1);
    task.parameters["relay_position"] = serde_json::json!({"lat": HOME.lat, "lon": HOME.lon});
    task.parameters["altitude"] = serde_json::json!(10.0);
    scheduler.assign(task).unwrap();
    let done = wait_terminal(&mut updates, "relay-sim", Duration::from_secs(30)).await;
    assert_eq!(done.status, TaskStatus::Completed);

    // The reconnect interval picks the vehicle up once its bridge appears
    let sim = Arc::new(SimLink::at("uav-2", HOME));
    serve_sim_bridge(TcpListener::bind(addr).await.unwrap(), sim);
    let deadline = Instant::now() + Duration::from_secs(10);
    while offline.connection_state() != ConnectionState::Connected {
        assert!(Instant::now() < deadline, "uav-2 never reconnected");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(offline.query_state().await.is_ok());
    assert!(offline.stats().reconnects >= 1);

    runtime.shutdown().await;
}
