//! Feed to scheduler to gateway to sink

use aerotask_bridge::{run_feed, ChannelFeed, Envelope, FeedRecord, TelemetryRecord};
use aerotask_core::TaskType;
use aerotask_fleet::{FailureReason, TaskStatus, TelemetryEvent, VehiclePhase};
use aerotask_gateway::FlightCommand;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

use crate::test_utils::{init_tracing, relay, status_of, wait_terminal, TestFleet};

#[tokio::test(start_paused = true)]
async fn test_feed_assignment_flies_and_reports() {
    init_tracing();
    let mut fleet = TestFleet::start(&[("uav-1", &[TaskType::Relay])]);
    let scheduler = fleet.scheduler().clone();
    let mut updates = scheduler.subscribe_updates();

    let (tx, mut feed) = ChannelFeed::new(8);
    let cancel = CancellationToken::new();
    let feed_scheduler = scheduler.clone();
    let feed_cancel = cancel.clone();
    let pump = tokio::spawn(async move { run_feed(&mut feed, &feed_scheduler, &feed_cancel).await });

    tx.send(FeedRecord::Assign(relay("relay-1", "uav-1", 5))).await.unwrap();
    // Re-delivery of the same record is harmless
    tx.send(FeedRecord::Assign(relay("relay-1", "uav-1", 5))).await.unwrap();

    let done = wait_terminal(&mut updates, "relay-1", Duration::from_secs(300)).await;
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.progress, 1.0);

    drop(tx);
    let stats = pump.await.unwrap();
    assert_eq!(stats.assigned, 2);
    assert_eq!(stats.rejected, 0);

    let commands = fleet.sim("uav-1").commands();
    assert_eq!(commands.iter().filter(|c| **c == FlightCommand::Arm).count(), 1);
    assert!(commands.iter().any(|c| matches!(c, FlightCommand::Goto { .. })));

    let events = fleet.drain_telemetry();
    let positions = events
        .iter()
        .filter(|e| matches!(e, TelemetryEvent::Position { .. }))
        .count();
    let statuses = events
        .iter()
        .filter(|e| matches!(e, TelemetryEvent::Status { .. }))
        .count();
    assert!(positions > statuses, "{positions} positions vs {statuses} statuses");
    assert!(statuses > 0);

    let executing = events.iter().any(|e| {
        matches!(
            e,
            TelemetryEvent::Status { phase: VehiclePhase::Executing, task_id: Some(t), .. } if t == "relay-1"
        )
    });
    assert!(executing);

    match Envelope::from(&events[0]).record {
        TelemetryRecord::Position(p) => assert_eq!(p.entity_id, "uav-1"),
        TelemetryRecord::Status(s) => assert_eq!(s.entity_id, "uav-1"),
    }
    fleet.runtime.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_feed_cancel_returns_vehicle_home() {
    let fleet = TestFleet::start(&[("uav-1", &[TaskType::Relay])]);
    let scheduler = fleet.scheduler().clone();
    let mut updates = scheduler.subscribe_updates();

    let (tx, mut feed) = ChannelFeed::new(8);
    let feed_scheduler = scheduler.clone();
    let pump = tokio::spawn(async move {
        run_feed(&mut feed, &feed_scheduler, &CancellationToken::new()).await
    });

    tx.send(FeedRecord::Assign(relay("relay-1", "uav-1", 600))).await.unwrap();
    sleep(Duration::from_secs(20)).await;
    assert_eq!(status_of(&scheduler, "relay-1"), TaskStatus::Active);

    tx.send(FeedRecord::Cancel { task_id: "relay-1".into() }).await.unwrap();
    let done = wait_terminal(&mut updates, "relay-1", Duration::from_secs(5)).await;
    assert_eq!(done.status, TaskStatus::Aborted);
    assert_eq!(done.reason, Some(FailureReason::Cancelled));
    assert!(fleet.sim("uav-1").commands().contains(&FlightCommand::ReturnToLaunch));

    drop(tx);
    assert_eq!(pump.await.unwrap().cancelled, 1);
    fleet.runtime.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_stalled_link_does_not_block_other_vehicles() {
    let fleet = TestFleet::start(&[
        ("uav-1", &[TaskType::Relay]),
        ("uav-2", &[TaskType::Relay]),
    ]);
    let scheduler = fleet.scheduler().clone();
    let mut updates = scheduler.subscribe_updates();

    fleet.sim("uav-2").set_query_delay(Some(Duration::from_secs(30)));
    scheduler.assign(relay("stuck", "uav-2", 600)).unwrap();
    scheduler.assign(relay("healthy", "uav-1", 5)).unwrap();

    let done = wait_terminal(&mut updates, "healthy", Duration::from_secs(120)).await;
    assert_eq!(done.status, TaskStatus::Completed);

    sleep(Duration::from_secs(10)).await;
    let stuck = scheduler.task("stuck").unwrap();
    assert!(stuck.status.is_terminal());
    assert_ne!(stuck.status, TaskStatus::Completed);

    let uav2 = scheduler.registry().lookup("uav-2").unwrap();
    assert!(uav2.safety_hold().is_some());
    assert_eq!(scheduler.registry().lookup("uav-1").unwrap().phase(), VehiclePhase::Idle);
    fleet.runtime.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_drains_running_tasks() {
    let fleet = TestFleet::start(&[
        ("uav-1", &[TaskType::Relay]),
        ("uav-2", &[TaskType::Relay]),
    ]);
    let scheduler = fleet.scheduler().clone();
    scheduler.assign(relay("r1", "uav-1", 600)).unwrap();
    scheduler.assign(relay("r2", "uav-2", 600)).unwrap();
    sleep(Duration::from_secs(20)).await;

    let report = fleet.runtime.shutdown().await;
    assert_eq!(report.vehicles, 2);
    assert!(report.forced.is_empty());
    assert!(report.elapsed < Duration::from_secs(5));

    for (task, vehicle) in [("r1", "uav-1"), ("r2", "uav-2")] {
        let record = scheduler.task(task).unwrap();
        assert_eq!(record.status, TaskStatus::Aborted);
        assert_eq!(record.reason, Some(FailureReason::Shutdown));
        assert!(fleet.sims[vehicle].commands().contains(&FlightCommand::ReturnToLaunch));
    }
}
