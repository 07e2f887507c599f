//! End-to-end fleet scenarios against simulated vehicles

use aerotask_core::geo::METERS_PER_DEGREE_LAT;
use aerotask_core::{Coordinate, GatewayConfig, NodeConfig, TaskType, VehicleConfig};
use aerotask_fleet::{
    FailureReason, FleetRuntime, PreemptReason, Scheduler, SchedulerError, TaskAssignment,
    TaskStatus, VehiclePhase,
};
use aerotask_gateway::{FlightCommand, Gateway, SimLink};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

const HOME: (f64, f64) = (45.0, -122.0);

fn sim_vehicle(id: &str, config: GatewayConfig) -> (Arc<SimLink>, Arc<Gateway>) {
    let sim = Arc::new(SimLink::at(id, Coordinate::new(HOME.0, HOME.1, 0.0)));
    let gateway = Arc::new(Gateway::with_link(id, sim.clone(), config));
    (sim, gateway)
}

fn scheduler_with(id: &str, caps: &[TaskType], config: GatewayConfig) -> (Arc<Scheduler>, Arc<SimLink>) {
    let node = NodeConfig::default();
    let scheduler = Arc::new(Scheduler::new(node.scheduler, node.executor));
    let (sim, gateway) = sim_vehicle(id, config);
    scheduler
        .register_vehicle(id, caps.iter().copied().collect(), gateway)
        .unwrap();
    (scheduler, sim)
}

fn relay(task_id: &str, vehicle: &str, duration: u64) -> TaskAssignment {
    TaskAssignment {
        task_id: task_id.into(),
        task_type: TaskType::Relay,
        target_vehicle_id: vehicle.into(),
        parameters: json!({"relay_position": [45.0003, -122.0], "altitude": 20.0, "duration": duration}),
    }
}

async fn wait_terminal(scheduler: &Scheduler, task_id: &str, limit: Duration) -> TaskStatus {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        let status = scheduler.task(task_id).map(|r| r.status).unwrap();
        if status.is_terminal() || tokio::time::Instant::now() >= deadline {
            return status;
        }
        sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_survey_flies_planned_lawnmower() {
    let (scheduler, sim) = scheduler_with("uav-1", &[TaskType::Survey], GatewayConfig::default());
    let assignment = TaskAssignment {
        task_id: "survey-1".into(),
        task_type: TaskType::Survey,
        target_vehicle_id: "uav-1".into(),
        parameters: json!({
            "area_center": {"lat": HOME.0, "lon": HOME.1},
            "area_size": {"width": 100.0, "height": 100.0},
            "altitude": 50.0,
            "overlap": 0.8,
            "camera_fov": 30.0
        }),
    };
    assert_eq!(scheduler.assign(assignment).unwrap(), TaskStatus::Pending);
    assert_eq!(
        wait_terminal(&scheduler, "survey-1", Duration::from_secs(1_800)).await,
        TaskStatus::Completed
    );

    let waypoints: Vec<Coordinate> = sim
        .commands()
        .into_iter()
        .filter_map(|c| match c {
            FlightCommand::Goto { waypoint } => Some(waypoint),
            _ => None,
        })
        .collect();
    assert_eq!(waypoints.len(), 34);
    assert_eq!(sim.captures(), 34);

    let lon_scale = METERS_PER_DEGREE_LAT * HOME.0.to_radians().cos();
    for (lane, pair) in waypoints.chunks(2).enumerate() {
        let east = -47.0 + 6.0 * lane as f64;
        let (first, second) = if lane % 2 == 0 { (-50.0, 50.0) } else { (50.0, -50.0) };
        for (point, north) in pair.iter().zip([first, second]) {
            assert!((point.lon - (HOME.1 + east / lon_scale)).abs() < 1e-9, "lane {lane}");
            assert!((point.lat - (HOME.0 + north / METERS_PER_DEGREE_LAT)).abs() < 1e-9);
            assert_eq!(point.alt, 50.0);
        }
    }
    assert_eq!(scheduler.task("survey-1").unwrap().progress, 1.0);
}

#[tokio::test(start_paused = true)]
async fn test_low_battery_preempts_to_launch() {
    let config = NodeConfig {
        vehicles: vec![VehicleConfig {
            id: "uav-1".into(),
            connection: "sim://uav-1".into(),
            capabilities: TaskType::ALL.into_iter().collect(),
        }],
        ..NodeConfig::default()
    };
    let (sim, gateway) = sim_vehicle("uav-1", config.gateway.clone());
    let runtime = FleetRuntime::start_with_gateways(&config, vec![gateway], Vec::new()).unwrap();
    let scheduler = runtime.scheduler().clone();

    scheduler.assign(relay("relay-1", "uav-1", 600)).unwrap();
    sleep(Duration::from_secs(30)).await;
    assert_eq!(scheduler.task("relay-1").unwrap().status, TaskStatus::Active);

    sim.set_battery(15.0);
    sleep(Duration::from_secs(2)).await;

    let record = scheduler.task("relay-1").unwrap();
    assert_eq!(record.status, TaskStatus::Aborted);
    assert_eq!(record.reason, Some(FailureReason::SafetyPreempted));
    assert!(sim.commands().contains(&FlightCommand::ReturnToLaunch));

    let entry = scheduler.registry().lookup("uav-1").unwrap();
    assert_eq!(entry.phase(), VehiclePhase::Idle);
    assert!(matches!(entry.safety_hold(), Some(PreemptReason::LowBattery { .. })));

    let metrics = scheduler.metrics();
    assert_eq!(metrics.safety_preemptions, 1);
    assert_eq!(metrics.preempt_budget_violations, 0);
    assert!(metrics.last_preempt_ms < 500.0);

    // Held vehicles refuse new work
    assert_eq!(
        scheduler.assign(relay("relay-2", "uav-1", 10)).unwrap_err(),
        SchedulerError::SafetyHold("uav-1".into())
    );
    runtime.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_capability_mismatch_issues_no_commands() {
    let (scheduler, sim) = scheduler_with(
        "uav-1",
        &[TaskType::Survey, TaskType::Relay],
        GatewayConfig::default(),
    );
    let assignment = TaskAssignment {
        task_id: "drop-1".into(),
        task_type: TaskType::Delivery,
        target_vehicle_id: "uav-1".into(),
        parameters: json!({"drop_locations": [[45.001, -122.0]]}),
    };
    assert!(matches!(
        scheduler.assign(assignment),
        Err(SchedulerError::CapabilityMismatch { task_type: TaskType::Delivery, .. })
    ));
    sleep(Duration::from_secs(1)).await;

    let record = scheduler.task("drop-1").unwrap();
    assert_eq!(record.status, TaskStatus::Failed);
    assert_eq!(record.reason, Some(FailureReason::CapabilityMismatch));
    assert_eq!(sim.command_count(), 0);
    assert_eq!(scheduler.metrics().tasks_rejected, 1);
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_assignment_runs_once() {
    let (scheduler, sim) = scheduler_with("uav-1", &[TaskType::Relay], GatewayConfig::default());
    assert_eq!(scheduler.assign(relay("relay-1", "uav-1", 5)).unwrap(), TaskStatus::Pending);
    sleep(Duration::from_millis(10)).await;
    let again = scheduler.assign(relay("relay-1", "uav-1", 5)).unwrap();
    assert!(matches!(again, TaskStatus::Pending | TaskStatus::Active));

    assert_eq!(
        wait_terminal(&scheduler, "relay-1", Duration::from_secs(300)).await,
        TaskStatus::Completed
    );
    // A late duplicate reports the final status and starts nothing
    assert_eq!(scheduler.assign(relay("relay-1", "uav-1", 5)).unwrap(), TaskStatus::Completed);
    sleep(Duration::from_secs(1)).await;

    let commands = sim.commands();
    assert_eq!(commands.iter().filter(|c| **c == FlightCommand::Arm).count(), 1);
    assert_eq!(
        commands
            .iter()
            .filter(|c| matches!(c, FlightCommand::Takeoff { .. }))
            .count(),
        1
    );
    assert_eq!(scheduler.metrics().tasks_duplicate, 2);
}

#[tokio::test(start_paused = true)]
async fn test_slow_link_times_out_command() {
    let (scheduler, sim) = scheduler_with("uav-1", &[TaskType::Relay], GatewayConfig::default());
    sim.set_command_delay(Some(Duration::from_secs(1)));

    scheduler.assign(relay("relay-1", "uav-1", 60)).unwrap();
    assert_eq!(
        wait_terminal(&scheduler, "relay-1", Duration::from_secs(30)).await,
        TaskStatus::Failed
    );
    let record = scheduler.task("relay-1").unwrap();
    assert_eq!(record.reason, Some(FailureReason::CommandTimeout));
    assert!(scheduler.metrics().gateway.command_timeouts >= 1);

    sleep(Duration::from_secs(1)).await;
    let entry = scheduler.registry().lookup("uav-1").unwrap();
    assert_eq!(entry.phase(), VehiclePhase::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_stuck_executor_is_torn_down() {
    let config = GatewayConfig {
        command_timeout_ms: 5_000,
        ..GatewayConfig::default()
    };
    let (scheduler, sim) = scheduler_with("uav-1", &[TaskType::Relay], config);
    sim.set_command_delay(Some(Duration::from_secs(2)));

    scheduler.assign(relay("relay-1", "uav-1", 60)).unwrap();
    // Executor is now inside its first slow command
    sleep(Duration::from_millis(10)).await;
    assert_eq!(scheduler.task("relay-1").unwrap().status, TaskStatus::Active);

    let report = scheduler
        .preempt_and_wait("uav-1", PreemptReason::Operator { note: "abort".into() })
        .await
        .unwrap()
        .unwrap();
    assert!(report.forced);
    assert_eq!(report.aborted_task.as_deref(), Some("relay-1"));
    assert!(report.rtl_acknowledged);
    assert!(report.elapsed >= Duration::from_millis(500));

    let record = scheduler.task("relay-1").unwrap();
    assert_eq!(record.status, TaskStatus::Aborted);
    assert_eq!(record.reason, Some(FailureReason::Preempted));

    let metrics = scheduler.metrics();
    assert_eq!(metrics.forced_teardowns, 1);
    assert_eq!(metrics.preempt_budget_violations, 1);
    assert_eq!(
        scheduler.registry().lookup("uav-1").unwrap().phase(),
        VehiclePhase::Idle
    );
}

#[tokio::test(start_paused = true)]
async fn test_preempt_latency_within_budget() {
    let (scheduler, sim) = scheduler_with("uav-1", &[TaskType::Relay], GatewayConfig::default());
    scheduler.assign(relay("relay-1", "uav-1", 600)).unwrap();
    sleep(Duration::from_secs(30)).await;

    let started = tokio::time::Instant::now();
    let report = scheduler
        .preempt_and_wait("uav-1", PreemptReason::LinkStale { age_ms: 3_500 })
        .await
        .unwrap()
        .unwrap();
    assert!(started.elapsed() < Duration::from_millis(500));
    assert!(!report.forced);
    assert!(report.rtl_acknowledged);
    assert_eq!(scheduler.task("relay-1").unwrap().reason, Some(FailureReason::SafetyPreempted));
    assert_eq!(sim.commands().last(), Some(&FlightCommand::ReturnToLaunch));
}
