//! AeroTask Fleet
//!
//! Task orchestration for a fleet of unmanned aircraft.
//!
//! This crate provides:
//! - Drone registry with per-vehicle phase tracking
//! - Task scheduler with one control loop per vehicle
//! - Survey, relay and delivery executors
//! - Safety monitor (battery floor, geofence, link staleness)
//! - Telemetry publisher with pluggable sinks

#![warn(missing_docs)]

pub mod error;
pub mod executor;
pub mod metrics;
pub mod phase;
pub mod registry;
pub mod runtime;
pub mod safety;
pub mod scheduler;
pub mod task;
pub mod telemetry;

pub use error::{
    ExecutorError, FleetError, PublishError, RegistryError, SchedulerError, TransitionError,
    ValidationError,
};
pub use executor::{AbortAck, Executor, ExecutorHandle, ExecutorOutcome, ExecutorState, ExecutorStatus};
pub use metrics::{FleetMetrics, MetricsSnapshot};
pub use phase::{PhaseTransition, VehiclePhase};
pub use registry::{DroneRegistry, VehicleEntry, VehicleStatus};
pub use runtime::FleetRuntime;
pub use safety::{SafetyMonitor, SafetyPolicy, SafetyViolation};
pub use scheduler::{PreemptReason, PreemptReport, Scheduler, ShutdownReport};
pub use task::{FailureReason, TaskAssignment, TaskBook, TaskRecord, TaskStatus, TaskUpdate};
pub use telemetry::{ChannelSink, LogSink, TelemetryEvent, TelemetryPublisher, TelemetrySink};
