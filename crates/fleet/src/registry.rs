//! Drone registry
//!
//! Concurrency-safe directory of known vehicles and their command gateways.
//! The directory lock is held only to find or insert an entry; each entry
//! carries its own locks so vehicles never contend with one another, and no
//! lock here is held across vehicle I/O.
//!
//! Each entry has two independent sections:
//! - control state (phase, current task, abort and safety flags), written
//!   only by the vehicle's scheduler controller;
//! - the latest telemetry snapshot, written only by the telemetry publisher.

use aerotask_core::{now_ns, CapabilitySet, TaskType, TelemetrySnapshot};
use aerotask_gateway::{ConnectionState, Gateway};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::{RegistryError, TransitionError};
use crate::executor::ExecutorStatus;
use crate::phase::{PhaseTransition, VehiclePhase};
use crate::scheduler::PreemptReason;

#[derive(Debug)]
struct ControlState {
    phase: VehiclePhase,
    current_task: Option<String>,
    aborting: bool,
    safety_hold: Option<PreemptReason>,
    faulted: bool,
    history: VecDeque<PhaseTransition>,
    progress: Option<watch::Receiver<ExecutorStatus>>,
}

#[derive(Debug)]
struct SnapshotSlot {
    latest: Option<TelemetrySnapshot>,
    received_at: Instant,
}

/// A registered vehicle
pub struct VehicleEntry {
    id: String,
    capabilities: CapabilitySet,
    gateway: Arc<Gateway>,
    history_limit: usize,
    control: Mutex<ControlState>,
    snapshot: RwLock<SnapshotSlot>,
}

impl std::fmt::Debug for VehicleEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VehicleEntry")
            .field("id", &self.id)
            .field("capabilities", &self.capabilities)
            .field("phase", &self.phase())
            .finish()
    }
}

/// Serializable view of a vehicle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleStatus {
    /// Vehicle identifier
    pub vehicle_id: String,
    /// Declared capabilities
    pub capabilities: CapabilitySet,
    /// Control phase
    pub phase: VehiclePhase,
    /// Task currently attached
    pub current_task: Option<String>,
    /// Link connection state
    pub connection: ConnectionState,
    /// Link or control loop unhealthy
    pub degraded: bool,
    /// Refusing work after a safety preemption
    pub safety_hold: bool,
    /// Latest telemetry, if any
    pub snapshot: Option<TelemetrySnapshot>,
}

impl VehicleEntry {
    /// New entry in the Idle phase
    pub fn new(
        id: impl Into<String>,
        capabilities: CapabilitySet,
        gateway: Arc<Gateway>,
        history_limit: usize,
    ) -> Self {
        Self {
            id: id.into(),
            capabilities,
            gateway,
            history_limit: history_limit.max(1),
            control: Mutex::new(ControlState {
                phase: VehiclePhase::Idle,
                current_task: None,
                aborting: false,
                safety_hold: None,
                faulted: false,
                history: VecDeque::new(),
                progress: None,
            }),
            snapshot: RwLock::new(SnapshotSlot {
                latest: None,
                received_at: Instant::now(),
            }),
        }
    }

    fn control(&self) -> MutexGuard<'_, ControlState> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Vehicle identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Declared capabilities
    pub fn capabilities(&self) -> &CapabilitySet {
        &self.capabilities
    }

    /// Vehicle can run tasks of this type
    pub fn supports(&self, task_type: TaskType) -> bool {
        self.capabilities.contains(&task_type)
    }

    /// Command gateway handle
    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    /// Current control phase
    pub fn phase(&self) -> VehiclePhase {
        self.control().phase
    }

    /// Task currently attached
    pub fn current_task(&self) -> Option<String> {
        self.control().current_task.clone()
    }

    /// Preemption requested and not yet finished
    pub fn is_aborting(&self) -> bool {
        self.control().aborting
    }

    /// Safety condition that put the vehicle on hold, if any
    pub fn safety_hold(&self) -> Option<PreemptReason> {
        self.control().safety_hold.clone()
    }

    /// Link unhealthy or control loop faulted
    pub fn is_degraded(&self) -> bool {
        self.control().faulted || self.gateway.connection_state() != ConnectionState::Connected
    }

    /// Bounded phase history, oldest first
    pub fn phase_history(&self) -> Vec<PhaseTransition> {
        self.control().history.iter().cloned().collect()
    }

    /// Progress of the running executor
    pub fn executor_status(&self) -> Option<ExecutorStatus> {
        self.control().progress.as_ref().map(|rx| *rx.borrow())
    }

    pub(crate) fn set_phase(&self, next: VehiclePhase) -> Result<(), TransitionError> {
        let mut control = self.control();
        if !control.phase.can_transition_to(next) {
            return Err(TransitionError::Phase {
                vehicle_id: self.id.clone(),
                from: control.phase,
                to: next,
            });
        }
        let transition = PhaseTransition {
            from: control.phase,
            to: next,
            timestamp_ns: now_ns(),
        };
        control.phase = next;
        if control.history.len() >= self.history_limit {
            control.history.pop_front();
        }
        control.history.push_back(transition);
        Ok(())
    }

    /// Walk the phase table back to Idle from wherever the vehicle is
    pub(crate) fn force_idle(&self) {
        let path: &[VehiclePhase] = match self.phase() {
            VehiclePhase::Idle => &[],
            VehiclePhase::Assigned | VehiclePhase::Executing => {
                &[VehiclePhase::Failed, VehiclePhase::Idle]
            }
            VehiclePhase::Switching
            | VehiclePhase::Aborting
            | VehiclePhase::Completed
            | VehiclePhase::Failed => &[VehiclePhase::Idle],
        };
        for next in path {
            // Only the owning control loop moves phases, so the walk cannot race
            let _ = self.set_phase(*next);
        }
    }

    pub(crate) fn attach_task(
        &self,
        task_id: String,
        progress: watch::Receiver<ExecutorStatus>,
    ) {
        let mut control = self.control();
        control.current_task = Some(task_id);
        control.progress = Some(progress);
    }

    pub(crate) fn detach_task(&self) {
        let mut control = self.control();
        control.current_task = None;
        control.progress = None;
    }

    /// Flag a preemption as in progress.
    ///
    /// Returns `false` when the request is a no-op: a preemption is already
    /// running, or a safety preemption arrives for a vehicle already held.
    pub(crate) fn request_preempt(&self, reason: &PreemptReason) -> bool {
        let mut control = self.control();
        if control.aborting {
            return false;
        }
        if reason.is_safety() {
            if control.safety_hold.is_some() {
                return false;
            }
            control.safety_hold = Some(reason.clone());
        }
        control.aborting = true;
        true
    }

    pub(crate) fn finish_preempt(&self) {
        self.control().aborting = false;
    }

    /// Lift the safety hold; returns whether one was set
    pub fn clear_safety_hold(&self) -> bool {
        self.control().safety_hold.take().is_some()
    }

    pub(crate) fn mark_faulted(&self) {
        self.control().faulted = true;
    }

    /// Store a snapshot if it is strictly newer than the current one
    pub fn update_snapshot(&self, snapshot: TelemetrySnapshot) -> bool {
        let mut slot = self.snapshot.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(current) = &slot.latest {
            if !snapshot.is_newer_than(current) {
                return false;
            }
        }
        slot.latest = Some(snapshot);
        slot.received_at = Instant::now();
        true
    }

    /// Latest snapshot
    pub fn latest_snapshot(&self) -> Option<TelemetrySnapshot> {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .latest
    }

    /// Time since the last accepted snapshot (or since registration)
    pub fn snapshot_age(&self) -> Duration {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .received_at
            .elapsed()
    }

    /// Serializable view
    pub fn status(&self) -> VehicleStatus {
        let control = self.control();
        VehicleStatus {
            vehicle_id: self.id.clone(),
            capabilities: self.capabilities.clone(),
            phase: control.phase,
            current_task: control.current_task.clone(),
            connection: self.gateway.connection_state(),
            degraded: control.faulted
                || self.gateway.connection_state() != ConnectionState::Connected,
            safety_hold: control.safety_hold.is_some(),
            snapshot: self.latest_snapshot(),
        }
    }
}

/// Directory of registered vehicles
#[derive(Debug, Default)]
pub struct DroneRegistry {
    vehicles: RwLock<HashMap<String, Arc<VehicleEntry>>>,
}

impl DroneRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a vehicle; fails if the identifier exists
    pub fn register(&self, entry: VehicleEntry) -> Result<Arc<VehicleEntry>, RegistryError> {
        let mut vehicles = self.vehicles.write().unwrap_or_else(PoisonError::into_inner);
        if vehicles.contains_key(entry.id()) {
            return Err(RegistryError::DuplicateVehicle(entry.id().to_string()));
        }
        let entry = Arc::new(entry);
        vehicles.insert(entry.id().to_string(), entry.clone());
        Ok(entry)
    }

    /// Find a vehicle
    pub fn lookup(&self, vehicle_id: &str) -> Result<Arc<VehicleEntry>, RegistryError> {
        self.vehicles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(vehicle_id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(vehicle_id.to_string()))
    }

    /// Remove a vehicle with no running task
    pub fn deregister(&self, vehicle_id: &str) -> Result<Arc<VehicleEntry>, RegistryError> {
        let mut vehicles = self.vehicles.write().unwrap_or_else(PoisonError::into_inner);
        let entry = vehicles
            .get(vehicle_id)
            .ok_or_else(|| RegistryError::NotFound(vehicle_id.to_string()))?;
        if let Some(task) = entry.current_task() {
            return Err(RegistryError::PreconditionFailed {
                vehicle_id: vehicle_id.to_string(),
                reason: format!("task {task} is still running"),
            });
        }
        if entry.phase() != VehiclePhase::Idle {
            return Err(RegistryError::PreconditionFailed {
                vehicle_id: vehicle_id.to_string(),
                reason: format!("vehicle is {:?}", entry.phase()),
            });
        }
        vehicles
            .remove(vehicle_id)
            .ok_or_else(|| RegistryError::NotFound(vehicle_id.to_string()))
    }

    /// Every registered vehicle
    pub fn all(&self) -> Vec<Arc<VehicleEntry>> {
        self.vehicles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Registered identifiers, sorted
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self
            .vehicles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Number of registered vehicles
    pub fn len(&self) -> usize {
        self.vehicles.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// No vehicles registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
