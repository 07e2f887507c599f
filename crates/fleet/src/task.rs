//! Task model and task book
//!
//! Tasks are created on assignment, mutated only by the scheduler and kept
//! read-only after reaching a terminal status until purged.

use aerotask_core::{now_ns, TaskType};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};
use tokio::sync::broadcast;

use crate::error::TransitionError;

/// Task lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Accepted, not yet started
    Pending,
    /// Executor running
    Active,
    /// Being stopped in favor of another task
    Switching,
    /// Finished successfully
    Completed,
    /// Finished unsuccessfully
    Failed,
    /// Stopped by preemption, cancellation or a task switch
    Aborted,
}

impl TaskStatus {
    /// Every status
    pub const ALL: [TaskStatus; 6] = [
        TaskStatus::Pending,
        TaskStatus::Active,
        TaskStatus::Switching,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Aborted,
    ];

    /// Check if status is terminal
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Aborted
        )
    }

    /// Occupies its vehicle
    pub fn is_running(&self) -> bool {
        matches!(self, TaskStatus::Active | TaskStatus::Switching)
    }

    /// Check if transition to new status is valid
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            // From Pending
            (Pending, Active) | (Pending, Failed) | (Pending, Aborted) => true,
            // From Active
            (Active, Switching) | (Active, Completed) | (Active, Failed) | (Active, Aborted) => {
                true
            }
            // From Switching
            (Switching, Aborted) | (Switching, Completed) | (Switching, Failed) => true,
            // Terminal statuses cannot transition
            _ => false,
        }
    }

    /// Stable lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Active => "active",
            TaskStatus::Switching => "switching",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Aborted => "aborted",
        }
    }
}

/// Structured reason attached to Failed and Aborted tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Vehicle lacks the task's capability
    CapabilityMismatch,
    /// Parameters rejected before any command
    ValidationFailed,
    /// Vehicle held after a safety preemption
    SafetyHold,
    /// Pre-flight checks failed
    PreflightFailed,
    /// A command was not acknowledged in time
    CommandTimeout,
    /// Flight controller refused a command
    CommandRejected,
    /// Link lost after retries
    ConnectionLost,
    /// Waypoint not reached in time
    WaypointTimeout,
    /// Every delivery drop was skipped
    AllDropsSkipped,
    /// Executor or control loop panicked
    ExecutorFault,
    /// Preempted by the safety monitor
    SafetyPreempted,
    /// Preempted by an operator
    Preempted,
    /// Cancelled by the mission platform
    Cancelled,
    /// Replaced by a newer assignment
    Superseded,
    /// Process shutdown
    Shutdown,
    /// Vehicle control loop could not take the task
    VehicleUnavailable,
}

/// Inbound task assignment record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAssignment {
    /// Task identifier, unique across the mission
    pub task_id: String,
    /// Requested capability
    pub task_type: TaskType,
    /// Vehicle that should run the task
    pub target_vehicle_id: String,
    /// Type-specific parameters
    #[serde(default)]
    pub parameters: serde_json::Value,
}

/// Recorded status change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskTransition {
    /// Previous status
    pub from: TaskStatus,
    /// New status
    pub to: TaskStatus,
    /// Transition timestamp (nanoseconds since epoch)
    pub timestamp_ns: u64,
}

/// Task with its audit trail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Task identifier
    pub task_id: String,
    /// Task type
    pub task_type: TaskType,
    /// Target vehicle
    pub vehicle_id: String,
    /// Parameters as received
    pub parameters: serde_json::Value,
    /// Current status
    pub status: TaskStatus,
    /// Last reported progress (0.0 to 1.0)
    pub progress: f64,
    /// Reason code for Failed and Aborted
    pub reason: Option<FailureReason>,
    /// Human-readable detail for the reason
    pub detail: Option<String>,
    /// Creation timestamp
    pub created_at_ns: u64,
    /// Last update timestamp
    pub updated_at_ns: u64,
    /// Status history
    pub transitions: Vec<TaskTransition>,
}

impl TaskRecord {
    /// New Pending record for an assignment
    pub fn from_assignment(assignment: &TaskAssignment, timestamp_ns: u64) -> Self {
        Self {
            task_id: assignment.task_id.clone(),
            task_type: assignment.task_type,
            vehicle_id: assignment.target_vehicle_id.clone(),
            parameters: assignment.parameters.clone(),
            status: TaskStatus::Pending,
            progress: 0.0,
            reason: None,
            detail: None,
            created_at_ns: timestamp_ns,
            updated_at_ns: timestamp_ns,
            transitions: Vec::new(),
        }
    }

    /// Apply a status change if the edge is legal
    pub fn transition(&mut self, next: TaskStatus, timestamp_ns: u64) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError::Task {
                task_id: self.task_id.clone(),
                from: self.status,
                to: next,
            });
        }
        self.transitions.push(TaskTransition {
            from: self.status,
            to: next,
            timestamp_ns,
        });
        self.status = next;
        self.updated_at_ns = timestamp_ns;
        if next == TaskStatus::Completed {
            self.progress = 1.0;
        }
        Ok(())
    }
}

/// Task status change published to subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskUpdate {
    /// Task identifier
    pub task_id: String,
    /// Vehicle identifier
    pub vehicle_id: String,
    /// New status
    pub status: TaskStatus,
    /// Progress at the time of the change
    pub progress: f64,
    /// Reason code, for Failed and Aborted
    pub reason: Option<FailureReason>,
    /// Reason detail
    pub detail: Option<String>,
    /// Change timestamp
    pub timestamp_ns: u64,
}

impl From<&TaskRecord> for TaskUpdate {
    fn from(record: &TaskRecord) -> Self {
        Self {
            task_id: record.task_id.clone(),
            vehicle_id: record.vehicle_id.clone(),
            status: record.status,
            progress: record.progress,
            reason: record.reason,
            detail: record.detail.clone(),
            timestamp_ns: record.updated_at_ns,
        }
    }
}

/// Outcome of inserting a record
#[derive(Debug, Clone, PartialEq)]
pub enum Insert {
    /// Record stored
    Inserted,
    /// Identifier already known; carries its current status
    Existing(TaskStatus),
}

/// Concurrency-safe store of every task the scheduler has seen
pub struct TaskBook {
    tasks: RwLock<HashMap<String, TaskRecord>>,
    updates: broadcast::Sender<TaskUpdate>,
}

impl TaskBook {
    /// Create an empty book whose update stream buffers `capacity` events
    pub fn new(capacity: usize) -> Self {
        let (updates, _) = broadcast::channel(capacity.max(1));
        Self {
            tasks: RwLock::new(HashMap::new()),
            updates,
        }
    }

    /// Subscribe to status changes
    pub fn subscribe(&self) -> broadcast::Receiver<TaskUpdate> {
        self.updates.subscribe()
    }

    fn publish(&self, record: &TaskRecord) {
        // No subscribers is not an error
        let _ = self.updates.send(TaskUpdate::from(record));
    }

    /// Store a new record unless the identifier is already known
    pub fn insert_if_absent(&self, record: TaskRecord) -> Insert {
        let mut tasks = self.tasks.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = tasks.get(&record.task_id) {
            return Insert::Existing(existing.status);
        }
        self.publish(&record);
        tasks.insert(record.task_id.clone(), record);
        Insert::Inserted
    }

    /// Copy of a record
    pub fn get(&self, task_id: &str) -> Option<TaskRecord> {
        self.tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(task_id)
            .cloned()
    }

    /// Current status of a task
    pub fn status(&self, task_id: &str) -> Option<TaskStatus> {
        self.tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(task_id)
            .map(|r| r.status)
    }

    /// Move a task to `next`, recording `reason` for Failed and Aborted.
    ///
    /// Moving to Active fails if another task of the same vehicle is Active
    /// or Switching.
    pub fn transition(
        &self,
        task_id: &str,
        next: TaskStatus,
        reason: Option<FailureReason>,
        detail: Option<String>,
    ) -> Result<TaskRecord, TransitionError> {
        let mut tasks = self.tasks.write().unwrap_or_else(PoisonError::into_inner);

        if next == TaskStatus::Active {
            let vehicle_id = tasks
                .get(task_id)
                .map(|r| r.vehicle_id.clone())
                .ok_or_else(|| TransitionError::UnknownTask(task_id.to_string()))?;
            if let Some(running) = tasks
                .values()
                .find(|r| r.vehicle_id == vehicle_id && r.status.is_running() && r.task_id != task_id)
            {
                return Err(TransitionError::VehicleBusy {
                    vehicle_id,
                    running: running.task_id.clone(),
                });
            }
        }

        let record = tasks
            .get_mut(task_id)
            .ok_or_else(|| TransitionError::UnknownTask(task_id.to_string()))?;
        record.transition(next, now_ns())?;
        if reason.is_some() {
            record.reason = reason;
        }
        if detail.is_some() {
            record.detail = detail;
        }
        let snapshot = record.clone();
        self.publish(&snapshot);
        Ok(snapshot)
    }

    /// Record progress without changing status
    pub fn set_progress(&self, task_id: &str, progress: f64) {
        if let Some(record) = self
            .tasks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(task_id)
        {
            record.progress = progress.clamp(0.0, 1.0);
        }
    }

    /// Every record targeting a vehicle, oldest first
    pub fn for_vehicle(&self, vehicle_id: &str) -> Vec<TaskRecord> {
        let mut records: Vec<_> = self
            .tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|r| r.vehicle_id == vehicle_id)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.created_at_ns);
        records
    }

    /// Tasks currently Active or Switching on a vehicle
    pub fn running_count(&self, vehicle_id: &str) -> usize {
        self.tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|r| r.vehicle_id == vehicle_id && r.status.is_running())
            .count()
    }

    /// Task counts keyed by status name
    pub fn counts_by_status(&self) -> BTreeMap<String, usize> {
        let mut counts: BTreeMap<String, usize> = TaskStatus::ALL
            .iter()
            .map(|s| (s.as_str().to_string(), 0))
            .collect();
        for record in self
            .tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
        {
            *counts.entry(record.status.as_str().to_string()).or_default() += 1;
        }
        counts
    }

    /// Drop terminal records last updated before `cutoff_ns`
    pub fn purge_terminal(&self, cutoff_ns: u64) -> usize {
        let mut tasks = self.tasks.write().unwrap_or_else(PoisonError::into_inner);
        let before = tasks.len();
        tasks.retain(|_, r| !(r.status.is_terminal() && r.updated_at_ns < cutoff_ns));
        before - tasks.len()
    }

    /// Number of records held
    pub fn len(&self) -> usize {
        self.tasks.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Book holds no records
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TaskBook {
    fn default() -> Self {
        Self::new(256)
    }
}
