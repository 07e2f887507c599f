//! Fleet error types

use aerotask_core::{CoreError, TaskType};
use aerotask_gateway::GatewayError;
use thiserror::Error;

use crate::phase::VehiclePhase;
use crate::task::{FailureReason, TaskStatus};

/// Drone registry errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RegistryError {
    /// Identifier already registered
    #[error("Vehicle already registered: {0}")]
    DuplicateVehicle(String),

    /// Identifier not registered
    #[error("Vehicle not found: {0}")]
    NotFound(String),

    /// Operation not allowed in the vehicle's current state
    #[error("Precondition failed for {vehicle_id}: {reason}")]
    PreconditionFailed {
        /// Vehicle identifier
        vehicle_id: String,
        /// What blocked the operation
        reason: String,
    },
}

/// Task parameter validation failures
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    /// Parameters could not be decoded
    #[error("Malformed parameters: {0}")]
    Malformed(String),

    /// Coordinate outside WGS84 bounds
    #[error("Invalid coordinate for {field}")]
    InvalidCoordinate {
        /// Parameter name
        field: &'static str,
    },

    /// Survey area width or height not positive
    #[error("Area must be positive, got {width_m}x{height_m}m")]
    NonPositiveArea {
        /// Requested width
        width_m: f64,
        /// Requested height
        height_m: f64,
    },

    /// Altitude outside the configured safe band
    #[error("Altitude {altitude_m}m outside safe band {min_m}..={max_m}m")]
    AltitudeOutOfBand {
        /// Requested altitude
        altitude_m: f64,
        /// Lowest accepted
        min_m: f64,
        /// Highest accepted
        max_m: f64,
    },

    /// Overlap fraction outside (0, 1)
    #[error("Overlap must be within (0, 1), got {0}")]
    OverlapOutOfRange(f64),

    /// Camera footprint not positive
    #[error("Footprint must be positive, got {0}m")]
    InvalidFootprint(f64),

    /// Plan would exceed the waypoint limit
    #[error("Plan needs {count} waypoints, limit is {max}")]
    TooManyWaypoints {
        /// Waypoints required
        count: usize,
        /// Limit
        max: usize,
    },

    /// Hold duration outside limits
    #[error("Duration {duration_s}s outside 1..={max_s}s")]
    DurationOutOfRange {
        /// Requested duration
        duration_s: u64,
        /// Longest accepted
        max_s: u64,
    },

    /// Tolerance not positive
    #[error("Tolerance must be positive, got {0}m")]
    InvalidTolerance(f64),

    /// Delivery without drop points
    #[error("At least one drop point is required")]
    NoDropPoints,

    /// Delivery with too many drop points
    #[error("{count} drop points exceeds limit of {max}")]
    TooManyDropPoints {
        /// Points requested
        count: usize,
        /// Limit
        max: usize,
    },

    /// Drop altitude not below approach altitude
    #[error("Drop altitude {drop_m}m must be below approach altitude {approach_m}m")]
    DropAltitudeNotBelowApproach {
        /// Drop altitude
        drop_m: f64,
        /// Approach altitude
        approach_m: f64,
    },
}

/// Why an executor stopped before finishing its task
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExecutorError {
    /// Cancellation observed
    #[error("Executor cancelled")]
    Cancelled,

    /// Unrecoverable error
    #[error("Executor failed ({reason:?}): {detail}")]
    Failed {
        /// Reason code recorded on the task
        reason: FailureReason,
        /// Detail for operators
        detail: String,
    },
}

impl ExecutorError {
    /// Failure with a reason code
    pub fn failed(reason: FailureReason, detail: impl Into<String>) -> Self {
        ExecutorError::Failed {
            reason,
            detail: detail.into(),
        }
    }
}

impl From<GatewayError> for ExecutorError {
    fn from(error: GatewayError) -> Self {
        let reason = match &error {
            GatewayError::CommandTimeout { .. } => FailureReason::CommandTimeout,
            GatewayError::CommandRejected { .. } => FailureReason::CommandRejected,
            GatewayError::Connection { .. }
            | GatewayError::Link { .. }
            | GatewayError::InvalidDescriptor(_) => FailureReason::ConnectionLost,
        };
        ExecutorError::failed(reason, error.to_string())
    }
}

/// Illegal state-machine edge
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransitionError {
    /// Task status edge not in the table
    #[error("Invalid task transition {from:?} -> {to:?} for {task_id}")]
    Task {
        /// Task identifier
        task_id: String,
        /// Current status
        from: TaskStatus,
        /// Requested status
        to: TaskStatus,
    },

    /// Vehicle phase edge not in the table
    #[error("Invalid phase transition {from:?} -> {to:?} for {vehicle_id}")]
    Phase {
        /// Vehicle identifier
        vehicle_id: String,
        /// Current phase
        from: VehiclePhase,
        /// Requested phase
        to: VehiclePhase,
    },

    /// Another task already occupies the vehicle
    #[error("Vehicle {vehicle_id} already running {running}")]
    VehicleBusy {
        /// Vehicle identifier
        vehicle_id: String,
        /// Task currently Active or Switching
        running: String,
    },

    /// Task not in the book
    #[error("Unknown task {0}")]
    UnknownTask(String),
}

/// Scheduler errors surfaced to callers of `assign`, `preempt` and `cancel`
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SchedulerError {
    /// Vehicle not registered
    #[error("Unknown vehicle: {0}")]
    UnknownVehicle(String),

    /// Task type not in the vehicle's capability set
    #[error("Vehicle {vehicle_id} lacks capability {task_type}")]
    CapabilityMismatch {
        /// Vehicle identifier
        vehicle_id: String,
        /// Requested task type
        task_type: TaskType,
    },

    /// Parameters rejected before any command was issued
    #[error("Task validation failed: {0}")]
    TaskValidation(#[from] ValidationError),

    /// Vehicle refuses work until its safety condition clears
    #[error("Vehicle {0} is held after a safety preemption")]
    SafetyHold(String),

    /// Vehicle control loop is not accepting work
    #[error("Vehicle {vehicle_id} unavailable: {reason}")]
    VehicleUnavailable {
        /// Vehicle identifier
        vehicle_id: String,
        /// Why
        reason: String,
    },

    /// Scheduler is draining
    #[error("Scheduler is shutting down")]
    ShuttingDown,

    /// Task identifier not known
    #[error("Unknown task: {0}")]
    UnknownTask(String),

    /// Task book refused an edge
    #[error(transparent)]
    Transition(#[from] TransitionError),
}

/// Telemetry sink refused an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PublishError {
    /// Sink buffer full; event dropped
    #[error("Telemetry sink full")]
    Full,

    /// Sink consumer gone
    #[error("Telemetry sink closed")]
    Closed,
}

/// Fleet runtime startup errors
#[derive(Debug, Error)]
pub enum FleetError {
    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(#[from] CoreError),

    /// Registration failed
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Vehicle link could not be opened
    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),
}
