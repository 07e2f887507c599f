//! Core functionality for the AeroTask fleet control engine.
//!
//! This crate provides the fundamental types, configuration, geodesy helpers
//! and logging bootstrap used across the AeroTask workspace.

pub mod config;
pub mod error;
pub mod geo;
pub mod logging;
pub mod types;

pub use config::{
    BridgeConfig, DeliveryDefaults, ExecutorConfig, FeedSource, GatewayConfig, GeofenceConfig,
    LogFormat, NodeConfig, RelayDefaults, SafetyConfig, SchedulerConfig, ServiceConfig,
    TelemetryConfig, VehicleConfig,
};
pub use error::{CoreError, Result};
pub use geo::{Geofence, LocalOffset};
pub use types::{
    now_ns, CapabilitySet, Coordinate, FlightMode, GpsFix, LinkHealth, TaskType,
    TelemetrySnapshot,
};
