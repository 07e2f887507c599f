//! Task Scheduler
//!
//! Accepts assignments, validates them against the target vehicle and hands
//! them to that vehicle's control loop (see [`controller`]). Everything that
//! can be decided without touching the vehicle is decided here, so rejected
//! tasks become Failed records without a single command being issued.
//!
//! Preemption bypasses the assignment queue: requests go through an
//! unbounded channel the control loop always drains first.

mod controller;

use aerotask_core::{now_ns, CapabilitySet, ExecutorConfig, SchedulerConfig};
use aerotask_gateway::Gateway;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{RegistryError, SchedulerError};
use crate::executor::{Executor, ExecutorStatus};
use crate::metrics::{FleetMetrics, MetricsSnapshot};
use crate::registry::{DroneRegistry, VehicleEntry, VehicleStatus};
use crate::task::{FailureReason, Insert, TaskAssignment, TaskBook, TaskRecord, TaskStatus, TaskUpdate};
use controller::{Assignment, ControllerHandle, PreemptRequest};

/// Why a vehicle is being preempted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PreemptReason {
    /// Battery below the configured floor
    LowBattery {
        /// Reported charge
        battery_pct: f64,
    },
    /// Position outside the geofence
    GeofenceBreach {
        /// Reported latitude
        lat: f64,
        /// Reported longitude
        lon: f64,
    },
    /// No fresh telemetry within the stale timeout
    LinkStale {
        /// Time since the last accepted snapshot
        age_ms: u64,
    },
    /// Flight controller reports the link lost
    LinkLost,
    /// Mission platform cancelled the running task
    Cancelled {
        /// Cancelled task
        task_id: String,
    },
    /// Process shutdown
    Shutdown,
    /// Manual preemption
    Operator {
        /// Free-form note
        note: String,
    },
}

impl PreemptReason {
    /// Raised by the safety monitor; sets the vehicle's safety hold
    pub fn is_safety(&self) -> bool {
        matches!(
            self,
            PreemptReason::LowBattery { .. }
                | PreemptReason::GeofenceBreach { .. }
                | PreemptReason::LinkStale { .. }
                | PreemptReason::LinkLost
        )
    }

    /// Reason code recorded on an interrupted task
    pub fn failure_reason(&self) -> FailureReason {
        match self {
            PreemptReason::Cancelled { .. } => FailureReason::Cancelled,
            PreemptReason::Shutdown => FailureReason::Shutdown,
            PreemptReason::Operator { .. } => FailureReason::Preempted,
            _ => FailureReason::SafetyPreempted,
        }
    }
}

impl fmt::Display for PreemptReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PreemptReason::LowBattery { battery_pct } => write!(f, "battery low ({battery_pct:.1}%)"),
            PreemptReason::GeofenceBreach { lat, lon } => {
                write!(f, "geofence breach at ({lat:.6}, {lon:.6})")
            }
            PreemptReason::LinkStale { age_ms } => write!(f, "telemetry stale for {age_ms}ms"),
            PreemptReason::LinkLost => f.write_str("link lost"),
            PreemptReason::Cancelled { task_id } => write!(f, "task {task_id} cancelled"),
            PreemptReason::Shutdown => f.write_str("shutdown"),
            PreemptReason::Operator { note } => write!(f, "operator: {note}"),
        }
    }
}

/// What a completed preemption did
#[derive(Debug, Clone, PartialEq)]
pub struct PreemptReport {
    /// Preempted vehicle
    pub vehicle_id: String,
    /// Request reason
    pub reason: PreemptReason,
    /// Task that was running, if any
    pub aborted_task: Option<String>,
    /// Executor missed the deadline and was torn down
    pub forced: bool,
    /// Return-to-launch was acknowledged
    pub rtl_acknowledged: bool,
    /// Request to Idle
    pub elapsed: Duration,
}

/// Result of draining the scheduler
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShutdownReport {
    /// Control loops drained
    pub vehicles: usize,
    /// Vehicles whose loop missed the grace period
    pub forced: Vec<String>,
    /// Total drain time
    pub elapsed: Duration,
}

/// Task scheduler and owner of the per-vehicle control loops
pub struct Scheduler {
    config: SchedulerConfig,
    limits: Arc<ExecutorConfig>,
    registry: Arc<DroneRegistry>,
    tasks: Arc<TaskBook>,
    metrics: Arc<FleetMetrics>,
    controllers: Mutex<HashMap<String, ControllerHandle>>,
    shutting_down: AtomicBool,
    shutdown: CancellationToken,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("vehicles", &self.registry.len())
            .field("tasks", &self.tasks.len())
            .field("shutting_down", &self.shutting_down.load(Ordering::Relaxed))
            .finish()
    }
}

impl Scheduler {
    /// Create a scheduler with an empty registry
    pub fn new(config: SchedulerConfig, limits: ExecutorConfig) -> Self {
        Self {
            config,
            limits: Arc::new(limits),
            registry: Arc::new(DroneRegistry::new()),
            tasks: Arc::new(TaskBook::default()),
            metrics: Arc::new(FleetMetrics::default()),
            controllers: Mutex::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    fn controllers(&self) -> MutexGuard<'_, HashMap<String, ControllerHandle>> {
        self.controllers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a vehicle and start its control loop
    pub fn register_vehicle(
        &self,
        vehicle_id: impl Into<String>,
        capabilities: CapabilitySet,
        gateway: Arc<Gateway>,
    ) -> Result<Arc<VehicleEntry>, RegistryError> {
        let vehicle_id = vehicle_id.into();
        if self.is_shutting_down() {
            return Err(RegistryError::PreconditionFailed {
                vehicle_id,
                reason: "scheduler shutting down".into(),
            });
        }
        let entry = self.registry.register(VehicleEntry::new(
            vehicle_id.clone(),
            capabilities,
            gateway,
            self.config.phase_history,
        ))?;
        let handle = controller::spawn(
            entry.clone(),
            self.tasks.clone(),
            self.metrics.clone(),
            self.config.clone(),
            self.limits.clone(),
            self.shutdown.child_token(),
        );
        self.controllers().insert(vehicle_id.clone(), handle);
        info!(vehicle_id = %vehicle_id, capabilities = ?entry.capabilities(), "Vehicle registered");
        Ok(entry)
    }

    /// Remove an idle vehicle and stop its control loop
    pub fn deregister_vehicle(&self, vehicle_id: &str) -> Result<Arc<VehicleEntry>, RegistryError> {
        let entry = self.registry.deregister(vehicle_id)?;
        // Dropping the senders ends the loop once its queue is drained
        if let Some(handle) = self.controllers().remove(vehicle_id) {
            drop(handle.assign_tx);
            drop(handle.preempt_tx);
        }
        info!(vehicle_id, "Vehicle deregistered");
        Ok(entry)
    }

    /// Accept a task for its target vehicle.
    ///
    /// Returns the status the task has after the call: Pending when queued
    /// for the vehicle, or the existing status when the identifier is already
    /// known. Rejections after the vehicle lookup leave a Failed record.
    pub fn assign(&self, assignment: TaskAssignment) -> Result<TaskStatus, SchedulerError> {
        let entry = self
            .registry
            .lookup(&assignment.target_vehicle_id)
            .map_err(|_| SchedulerError::UnknownVehicle(assignment.target_vehicle_id.clone()))?;

        let record = TaskRecord::from_assignment(&assignment, now_ns());
        if let Insert::Existing(status) = self.tasks.insert_if_absent(record) {
            self.metrics.task_duplicate();
            debug!(task_id = %assignment.task_id, ?status, "Duplicate assignment ignored");
            return Ok(status);
        }

        let outcome = self
            .admit(&entry, &assignment)
            .and_then(|executor| self.enqueue(&assignment, executor));
        match outcome {
            Ok(()) => {
                self.metrics.task_assigned();
                info!(
                    vehicle_id = %assignment.target_vehicle_id,
                    task_id = %assignment.task_id,
                    task_type = %assignment.task_type,
                    "Task accepted"
                );
                Ok(TaskStatus::Pending)
            }
            Err(e) => {
                self.reject(&assignment, &e);
                Err(e)
            }
        }
    }

    fn admit(&self, entry: &VehicleEntry, assignment: &TaskAssignment) -> Result<Executor, SchedulerError> {
        if self.is_shutting_down() {
            return Err(SchedulerError::ShuttingDown);
        }
        if !entry.supports(assignment.task_type) {
            return Err(SchedulerError::CapabilityMismatch {
                vehicle_id: entry.id().to_string(),
                task_type: assignment.task_type,
            });
        }
        let executor = Executor::prepare(assignment.task_type, &assignment.parameters, &self.limits)?;
        if entry.safety_hold().is_some() {
            return Err(SchedulerError::SafetyHold(entry.id().to_string()));
        }
        Ok(executor)
    }

    fn enqueue(&self, assignment: &TaskAssignment, executor: Executor) -> Result<(), SchedulerError> {
        let controllers = self.controllers();
        let unavailable = |reason: &str| SchedulerError::VehicleUnavailable {
            vehicle_id: assignment.target_vehicle_id.clone(),
            reason: reason.to_string(),
        };
        let handle = controllers
            .get(&assignment.target_vehicle_id)
            .ok_or_else(|| unavailable("no control loop"))?;
        handle
            .assign_tx
            .try_send(Assignment {
                task_id: assignment.task_id.clone(),
                executor,
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => unavailable("assignment queue full"),
                mpsc::error::TrySendError::Closed(_) => unavailable("control loop stopped"),
            })
    }

    fn reject(&self, assignment: &TaskAssignment, error: &SchedulerError) {
        let reason = match error {
            SchedulerError::CapabilityMismatch { .. } => FailureReason::CapabilityMismatch,
            SchedulerError::TaskValidation(_) => FailureReason::ValidationFailed,
            SchedulerError::SafetyHold(_) => FailureReason::SafetyHold,
            SchedulerError::ShuttingDown => FailureReason::Shutdown,
            _ => FailureReason::VehicleUnavailable,
        };
        self.metrics.task_rejected();
        warn!(
            vehicle_id = %assignment.target_vehicle_id,
            task_id = %assignment.task_id,
            error = %error,
            "Task rejected"
        );
        if let Err(e) = self.tasks.transition(
            &assignment.task_id,
            TaskStatus::Failed,
            Some(reason),
            Some(error.to_string()),
        ) {
            warn!(task_id = %assignment.task_id, error = %e, "Could not record rejection");
        }
    }

    fn send_preempt(
        &self,
        entry: &VehicleEntry,
        reason: PreemptReason,
        done: Option<oneshot::Sender<PreemptReport>>,
    ) -> Result<bool, SchedulerError> {
        if !entry.request_preempt(&reason) {
            debug!(vehicle_id = %entry.id(), %reason, "Preempt already in progress");
            return Ok(false);
        }
        if reason.is_safety() {
            self.metrics.safety_preemption();
        }
        let sent = self
            .controllers()
            .get(entry.id())
            .map(|h| h.preempt_tx.send(PreemptRequest { reason, done }).is_ok())
            .unwrap_or(false);
        if !sent {
            entry.finish_preempt();
            return Err(SchedulerError::VehicleUnavailable {
                vehicle_id: entry.id().to_string(),
                reason: "control loop stopped".into(),
            });
        }
        Ok(true)
    }

    /// Request preemption. Returns false when the vehicle is already being
    /// preempted, or is held and the reason is another safety violation.
    pub fn preempt(&self, vehicle_id: &str, reason: PreemptReason) -> Result<bool, SchedulerError> {
        let entry = self
            .registry
            .lookup(vehicle_id)
            .map_err(|_| SchedulerError::UnknownVehicle(vehicle_id.to_string()))?;
        self.send_preempt(&entry, reason, None)
    }

    /// Preempt and wait until the vehicle is Idle again.
    /// `None` when the request was a no-op.
    pub async fn preempt_and_wait(
        &self,
        vehicle_id: &str,
        reason: PreemptReason,
    ) -> Result<Option<PreemptReport>, SchedulerError> {
        let entry = self
            .registry
            .lookup(vehicle_id)
            .map_err(|_| SchedulerError::UnknownVehicle(vehicle_id.to_string()))?;
        let (done_tx, done_rx) = oneshot::channel();
        if !self.send_preempt(&entry, reason, Some(done_tx))? {
            return Ok(None);
        }
        done_rx
            .await
            .map(Some)
            .map_err(|_| SchedulerError::VehicleUnavailable {
                vehicle_id: vehicle_id.to_string(),
                reason: "control loop dropped the preemption".into(),
            })
    }

    /// Cancel a task. A queued task is Aborted before it starts; the running
    /// task is preempted with reason `Cancelled`. Terminal tasks, and a task
    /// already being switched out, are left as they are. Returns the status
    /// after the call.
    pub fn cancel(&self, task_id: &str) -> Result<TaskStatus, SchedulerError> {
        let record = self
            .tasks
            .get(task_id)
            .ok_or_else(|| SchedulerError::UnknownTask(task_id.to_string()))?;
        if record.status.is_terminal() {
            return Ok(record.status);
        }
        // Already being stopped in favour of the next task
        if record.status == TaskStatus::Switching {
            debug!(task_id, vehicle_id = %record.vehicle_id, "Cancel of a switching task ignored");
            return Ok(record.status);
        }

        if record.status == TaskStatus::Pending {
            match self.tasks.transition(
                task_id,
                TaskStatus::Aborted,
                Some(FailureReason::Cancelled),
                Some("cancelled before start".into()),
            ) {
                Ok(updated) => {
                    info!(task_id, vehicle_id = %record.vehicle_id, "Queued task cancelled");
                    return Ok(updated.status);
                }
                // Started in the meantime; fall through to preemption
                Err(e) => debug!(task_id, error = %e, "Task left Pending during cancel"),
            }
        }

        let entry = self
            .registry
            .lookup(&record.vehicle_id)
            .map_err(|_| SchedulerError::UnknownVehicle(record.vehicle_id.clone()))?;
        if entry.current_task().as_deref() == Some(task_id) {
            self.send_preempt(
                &entry,
                PreemptReason::Cancelled {
                    task_id: task_id.to_string(),
                },
                None,
            )?;
        }
        Ok(self.tasks.status(task_id).unwrap_or(record.status))
    }

    /// Task record; running tasks carry live executor progress
    pub fn task(&self, task_id: &str) -> Option<TaskRecord> {
        let mut record = self.tasks.get(task_id)?;
        if record.status.is_running() {
            if let Ok(entry) = self.registry.lookup(&record.vehicle_id) {
                if entry.current_task().as_deref() == Some(task_id) {
                    if let Some(status) = entry.executor_status() {
                        record.progress = status.progress;
                    }
                }
            }
        }
        Some(record)
    }

    /// Every task record for a vehicle, oldest first
    pub fn tasks_for_vehicle(&self, vehicle_id: &str) -> Vec<TaskRecord> {
        self.tasks.for_vehicle(vehicle_id)
    }

    /// Progress of the executor running on a vehicle
    pub fn executor_status(&self, vehicle_id: &str) -> Option<ExecutorStatus> {
        self.registry.lookup(vehicle_id).ok()?.executor_status()
    }

    /// Serializable view of a vehicle
    pub fn vehicle_status(&self, vehicle_id: &str) -> Option<VehicleStatus> {
        self.registry.lookup(vehicle_id).ok().map(|e| e.status())
    }

    /// Task status change stream
    pub fn subscribe_updates(&self) -> broadcast::Receiver<TaskUpdate> {
        self.tasks.subscribe()
    }

    /// Drop terminal tasks older than the retention period
    pub fn purge_terminal(&self) -> usize {
        let retention = self.config.task_retention().as_nanos() as u64;
        let purged = self.tasks.purge_terminal(now_ns().saturating_sub(retention));
        if purged > 0 {
            debug!(purged, "Purged terminal tasks");
        }
        purged
    }

    /// Vehicle directory shared with the publisher and safety monitor
    pub fn registry(&self) -> &Arc<DroneRegistry> {
        &self.registry
    }

    /// Task book
    pub fn tasks(&self) -> &Arc<TaskBook> {
        &self.tasks
    }

    /// Shared counters
    pub fn fleet_metrics(&self) -> &Arc<FleetMetrics> {
        &self.metrics
    }

    /// Metrics snapshot
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot(&self.registry, &self.tasks)
    }

    /// Scheduler configuration
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Draining or drained
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Drain every control loop: preempt each vehicle with `Shutdown`, wait
    /// up to the grace period, then tear down what is left and send those
    /// vehicles home directly.
    pub async fn shutdown(&self) -> ShutdownReport {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return ShutdownReport::default();
        }
        let started = Instant::now();
        self.shutdown.cancel();

        let handles: Vec<(String, ControllerHandle)> = self.controllers().drain().collect();
        info!(vehicles = handles.len(), "Draining vehicle control loops");

        let mut loops = Vec::with_capacity(handles.len());
        for (vehicle_id, handle) in handles {
            if let Ok(entry) = self.registry.lookup(&vehicle_id) {
                if entry.request_preempt(&PreemptReason::Shutdown)
                    && handle
                        .preempt_tx
                        .send(PreemptRequest {
                            reason: PreemptReason::Shutdown,
                            done: None,
                        })
                        .is_err()
                {
                    entry.finish_preempt();
                }
            }
            let ControllerHandle { join, .. } = handle;
            loops.push((vehicle_id, join));
        }

        let grace = self.config.shutdown_grace();
        let drained = tokio::time::timeout(grace, join_all(loops.iter_mut().map(|(_, join)| join))).await;

        let mut forced = Vec::new();
        if drained.is_err() {
            for (vehicle_id, join) in &loops {
                if join.is_finished() {
                    continue;
                }
                join.abort();
                warn!(vehicle_id = %vehicle_id, grace_ms = grace.as_millis() as u64, "Control loop missed shutdown grace, forcing teardown");
                self.force_teardown(vehicle_id).await;
                forced.push(vehicle_id.clone());
            }
        }

        let report = ShutdownReport {
            vehicles: loops.len(),
            forced,
            elapsed: started.elapsed(),
        };
        info!(
            vehicles = report.vehicles,
            forced = report.forced.len(),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Scheduler drained"
        );
        report
    }

    async fn force_teardown(&self, vehicle_id: &str) {
        let Ok(entry) = self.registry.lookup(vehicle_id) else {
            return;
        };
        if let Some(task_id) = entry.current_task() {
            if self.tasks.status(&task_id).is_some_and(|s| s.is_running()) {
                let _ = self.tasks.transition(
                    &task_id,
                    TaskStatus::Aborted,
                    Some(FailureReason::Shutdown),
                    Some("forced teardown at shutdown".into()),
                );
            }
        }
        // Queued assignments died with the loop
        for record in self.tasks.for_vehicle(vehicle_id) {
            if record.status == TaskStatus::Pending {
                let _ = self.tasks.transition(
                    &record.task_id,
                    TaskStatus::Aborted,
                    Some(FailureReason::Shutdown),
                    None,
                );
            }
        }
        entry.detach_task();
        if let Err(e) = entry.gateway().return_to_launch().await {
            self.metrics.rtl_failure();
            warn!(vehicle_id, error = %e, "Return-to-launch failed during teardown");
        }
        entry.force_idle();
        entry.finish_preempt();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aerotask_core::{Coordinate, GatewayConfig, TaskType};
    use aerotask_gateway::{FlightCommand, SimLink};
    use serde_json::json;

    fn scheduler() -> Scheduler {
        Scheduler::new(SchedulerConfig::default(), ExecutorConfig::default())
    }

    fn add_vehicle(scheduler: &Scheduler, id: &str, caps: &[TaskType]) -> Arc<SimLink> {
        let sim = Arc::new(SimLink::at(id, Coordinate::new(45.0, -122.0, 0.0)));
        let gateway = Arc::new(Gateway::with_link(id, sim.clone(), GatewayConfig::default()));
        scheduler
            .register_vehicle(id, caps.iter().copied().collect(), gateway)
            .unwrap();
        sim
    }

    fn relay(task_id: &str, vehicle: &str, duration: u64) -> TaskAssignment {
        TaskAssignment {
            task_id: task_id.into(),
            task_type: TaskType::Relay,
            target_vehicle_id: vehicle.into(),
            parameters: json!({"relay_position": [45.0003, -122.0], "altitude": 20.0, "duration": duration}),
        }
    }

    #[test]
    fn test_preempt_reason_classification() {
        assert!(PreemptReason::LowBattery { battery_pct: 10.0 }.is_safety());
        assert!(PreemptReason::LinkLost.is_safety());
        assert!(!PreemptReason::Shutdown.is_safety());
        assert_eq!(
            PreemptReason::Cancelled { task_id: "t".into() }.failure_reason(),
            FailureReason::Cancelled
        );
        assert_eq!(PreemptReason::LinkLost.failure_reason(), FailureReason::SafetyPreempted);
        assert_eq!(PreemptReason::Shutdown.to_string(), "shutdown");
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_vehicle_creates_no_record() {
        let scheduler = scheduler();
        let err = scheduler.assign(relay("t1", "ghost", 10)).unwrap_err();
        assert_eq!(err, SchedulerError::UnknownVehicle("ghost".into()));
        assert!(scheduler.task("t1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_validation_failure_is_recorded() {
        let scheduler = scheduler();
        let sim = add_vehicle(&scheduler, "uav-1", &[TaskType::Relay]);
        let mut bad = relay("t1", "uav-1", 10);
        bad.parameters = json!({"relay_position": [45.0, -122.0], "altitude": 900.0});

        assert!(matches!(scheduler.assign(bad), Err(SchedulerError::TaskValidation(_))));
        let record = scheduler.task("t1").unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        assert_eq!(record.reason, Some(FailureReason::ValidationFailed));
        assert_eq!(sim.command_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_assign_runs_to_completion() {
        let scheduler = scheduler();
        add_vehicle(&scheduler, "uav-1", &[TaskType::Relay]);
        let mut updates = scheduler.subscribe_updates();

        assert_eq!(scheduler.assign(relay("t1", "uav-1", 5)).unwrap(), TaskStatus::Pending);
        let mut seen = Vec::new();
        while let Ok(update) = updates.recv().await {
            seen.push(update.status);
            if update.status.is_terminal() {
                break;
            }
        }
        assert_eq!(
            seen,
            vec![TaskStatus::Pending, TaskStatus::Active, TaskStatus::Completed]
        );
        let entry = scheduler.registry().lookup("uav-1").unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(entry.phase(), crate::phase::VehiclePhase::Idle);
        assert!(entry.current_task().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_switch_supersedes_running_task() {
        let scheduler = scheduler();
        add_vehicle(&scheduler, "uav-1", &[TaskType::Relay]);
        scheduler.assign(relay("t1", "uav-1", 600)).unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(scheduler.task("t1").unwrap().status, TaskStatus::Active);

        scheduler.assign(relay("t2", "uav-1", 600)).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        let old = scheduler.task("t1").unwrap();
        assert_eq!(old.status, TaskStatus::Aborted);
        assert_eq!(old.reason, Some(FailureReason::Superseded));
        let statuses: Vec<_> = old.transitions.iter().map(|t| t.to).collect();
        assert_eq!(statuses, vec![TaskStatus::Active, TaskStatus::Switching, TaskStatus::Aborted]);
        assert_eq!(scheduler.task("t2").unwrap().status, TaskStatus::Active);
        assert_eq!(scheduler.metrics().switches, 1);
        assert_eq!(scheduler.metrics().switch_budget_violations, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_preempt_aborts_and_returns_home() {
        let scheduler = scheduler();
        let sim = add_vehicle(&scheduler, "uav-1", &[TaskType::Relay]);
        scheduler.assign(relay("t1", "uav-1", 600)).unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;

        let report = scheduler
            .preempt_and_wait("uav-1", PreemptReason::Operator { note: "test".into() })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.aborted_task.as_deref(), Some("t1"));
        assert!(!report.forced);
        assert!(report.rtl_acknowledged);
        assert!(report.elapsed < Duration::from_millis(500));

        let record = scheduler.task("t1").unwrap();
        assert_eq!(record.status, TaskStatus::Aborted);
        assert_eq!(record.reason, Some(FailureReason::Preempted));
        assert!(sim.commands().contains(&FlightCommand::ReturnToLaunch));
        let entry = scheduler.registry().lookup("uav-1").unwrap();
        assert_eq!(entry.phase(), crate::phase::VehiclePhase::Idle);
        assert!(entry.safety_hold().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_safety_hold_refuses_new_work() {
        let scheduler = scheduler();
        add_vehicle(&scheduler, "uav-1", &[TaskType::Relay]);
        let reason = PreemptReason::LowBattery { battery_pct: 15.0 };
        assert!(scheduler.preempt_and_wait("uav-1", reason.clone()).await.unwrap().is_some());
        // Repeated violation while held is a no-op
        assert!(!scheduler.preempt("uav-1", reason).unwrap());

        let err = scheduler.assign(relay("t1", "uav-1", 5)).unwrap_err();
        assert_eq!(err, SchedulerError::SafetyHold("uav-1".into()));
        assert_eq!(scheduler.task("t1").unwrap().reason, Some(FailureReason::SafetyHold));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_queued_and_running() {
        let scheduler = scheduler();
        add_vehicle(&scheduler, "uav-1", &[TaskType::Relay]);
        scheduler.assign(relay("t1", "uav-1", 600)).unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;

        scheduler.cancel("t1").unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        let record = scheduler.task("t1").unwrap();
        assert_eq!(record.status, TaskStatus::Aborted);
        assert_eq!(record.reason, Some(FailureReason::Cancelled));
        // Terminal: no-op
        assert_eq!(scheduler.cancel("t1").unwrap(), TaskStatus::Aborted);
        assert!(matches!(scheduler.cancel("nope"), Err(SchedulerError::UnknownTask(_))));
    }

    /// t1 running, t2 queued behind it, and the vehicle answering commands
    /// slowly so the switch stays open long enough to interfere with
    async fn mid_switch(scheduler: &Scheduler) -> Arc<SimLink> {
        let sim = add_vehicle(scheduler, "uav-1", &[TaskType::Relay]);
        scheduler.assign(relay("t1", "uav-1", 600)).unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        sim.set_command_delay(Some(Duration::from_millis(80)));

        scheduler.assign(relay("t2", "uav-1", 600)).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(scheduler.task("t1").unwrap().status, TaskStatus::Switching);
        sim
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_switch_spares_incoming_task() {
        let scheduler = scheduler();
        let sim = mid_switch(&scheduler).await;

        assert_eq!(scheduler.cancel("t1").unwrap(), TaskStatus::Switching);
        tokio::time::sleep(Duration::from_secs(2)).await;

        let old = scheduler.task("t1").unwrap();
        assert_eq!(old.status, TaskStatus::Aborted);
        assert_eq!(old.reason, Some(FailureReason::Superseded));
        assert_eq!(scheduler.task("t2").unwrap().status, TaskStatus::Active);
        assert!(!sim.commands().contains(&FlightCommand::ReturnToLaunch));
    }

    #[tokio::test(start_paused = true)]
    async fn test_operator_preempt_during_switch_runs_queued_task_after() {
        let scheduler = scheduler();
        let sim = mid_switch(&scheduler).await;

        assert!(scheduler
            .preempt("uav-1", PreemptReason::Operator { note: "reposition".into() })
            .unwrap());
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(scheduler.task("t1").unwrap().reason, Some(FailureReason::Superseded));
        assert_eq!(scheduler.task("t2").unwrap().status, TaskStatus::Active);
        let commands = sim.commands();
        let rtl = commands
            .iter()
            .position(|c| *c == FlightCommand::ReturnToLaunch)
            .expect("preempt sent the vehicle home");
        assert!(commands[rtl..].iter().any(|c| matches!(c, FlightCommand::Goto { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_safety_preempt_during_switch_holds_queued_task() {
        let scheduler = scheduler();
        mid_switch(&scheduler).await;

        assert!(scheduler
            .preempt("uav-1", PreemptReason::LowBattery { battery_pct: 12.0 })
            .unwrap());
        tokio::time::sleep(Duration::from_secs(2)).await;

        let queued = scheduler.task("t2").unwrap();
        assert_eq!(queued.status, TaskStatus::Aborted);
        assert_eq!(queued.reason, Some(FailureReason::SafetyPreempted));
        let entry = scheduler.registry().lookup("uav-1").unwrap();
        assert_eq!(entry.phase(), crate::phase::VehiclePhase::Idle);
        assert!(entry.current_task().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_drains_and_refuses_work() {
        let scheduler = scheduler();
        add_vehicle(&scheduler, "uav-1", &[TaskType::Relay]);
        add_vehicle(&scheduler, "uav-2", &[TaskType::Relay]);
        scheduler.assign(relay("t1", "uav-1", 600)).unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;

        let report = scheduler.shutdown().await;
        assert_eq!(report.vehicles, 2);
        assert!(report.forced.is_empty());
        let record = scheduler.task("t1").unwrap();
        assert_eq!(record.status, TaskStatus::Aborted);
        assert_eq!(record.reason, Some(FailureReason::Shutdown));

        assert_eq!(
            scheduler.assign(relay("t2", "uav-2", 5)).unwrap_err(),
            SchedulerError::ShuttingDown
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_deregister_requires_idle() {
        let scheduler = scheduler();
        add_vehicle(&scheduler, "uav-1", &[TaskType::Relay]);
        scheduler.assign(relay("t1", "uav-1", 600)).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(matches!(
            scheduler.deregister_vehicle("uav-1"),
            Err(RegistryError::PreconditionFailed { .. })
        ));
        scheduler.preempt_and_wait("uav-1", PreemptReason::Operator { note: "done".into() }).await.unwrap();
        assert!(scheduler.deregister_vehicle("uav-1").is_ok());
        assert!(scheduler.registry().is_empty());
    }
}
