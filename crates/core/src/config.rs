//! Configuration management for AeroTask.
//!
//! A node is configured from a single TOML file. Every section has defaults so
//! a minimal file only needs to list its vehicles. A handful of settings can be
//! overridden from the environment for container deployments.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{CoreError, Result};
use crate::geo::Geofence;
use crate::types::{CapabilitySet, Coordinate, TaskType};

/// Environment variable overriding `service.log_level`
pub const ENV_LOG_LEVEL: &str = "AEROTASK_LOG_LEVEL";
/// Environment variable overriding `service.log_format`
pub const ENV_LOG_FORMAT: &str = "AEROTASK_LOG_FORMAT";
/// Environment variable overriding `bridge.ws_addr`
pub const ENV_WS_ADDR: &str = "AEROTASK_WS_ADDR";

/// Top-level node configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Process-level settings
    pub service: ServiceConfig,
    /// Vehicles connected at startup
    pub vehicles: Vec<VehicleConfig>,
    /// Command gateway timing
    pub gateway: GatewayConfig,
    /// Scheduler budgets
    pub scheduler: SchedulerConfig,
    /// Executor tuning
    pub executor: ExecutorConfig,
    /// Safety policy
    pub safety: SafetyConfig,
    /// Telemetry cadences
    pub telemetry: TelemetryConfig,
    /// Mission-command boundary
    pub bridge: BridgeConfig,
}

impl NodeConfig {
    /// Load configuration from a TOML file, apply environment overrides and
    /// validate the result.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config = Self::from_toml_str(&content)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from TOML text without environment overrides
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Apply `AEROTASK_*` environment overrides
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(level) = env::var(ENV_LOG_LEVEL) {
            self.service.log_level = level;
        }
        if let Ok(format) = env::var(ENV_LOG_FORMAT) {
            self.service.log_format = format.parse()?;
        }
        if let Ok(addr) = env::var(ENV_WS_ADDR) {
            self.bridge.ws_addr = if addr.trim().is_empty() {
                None
            } else {
                Some(addr)
            };
        }
        Ok(())
    }

    /// Reject semantically inconsistent configuration
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for vehicle in &self.vehicles {
            if vehicle.id.trim().is_empty() {
                return Err(CoreError::Config("vehicle id must not be empty".into()));
            }
            if vehicle.connection.trim().is_empty() {
                return Err(CoreError::Config(format!(
                    "vehicle {} has no connection descriptor",
                    vehicle.id
                )));
            }
            if !seen.insert(vehicle.id.as_str()) {
                return Err(CoreError::Config(format!(
                    "duplicate vehicle id: {}",
                    vehicle.id
                )));
            }
        }

        if self.gateway.command_timeout_ms == 0
            || self.gateway.query_timeout_ms == 0
            || self.gateway.connect_timeout_ms == 0
        {
            return Err(CoreError::Config("gateway timeouts must be positive".into()));
        }
        if self.gateway.retry_attempts == 0 {
            return Err(CoreError::Config(
                "gateway.retry_attempts must be at least 1".into(),
            ));
        }

        if self.executor.check_interval_ms == 0
            || self.executor.check_interval_ms > self.scheduler.switch_budget_ms
        {
            return Err(CoreError::Config(format!(
                "executor.check_interval_ms ({}) must be in 1..={} (scheduler.switch_budget_ms)",
                self.executor.check_interval_ms, self.scheduler.switch_budget_ms
            )));
        }
        if self.executor.min_altitude_m >= self.executor.max_altitude_m {
            return Err(CoreError::Config(
                "executor altitude band is empty".into(),
            ));
        }
        if self.executor.delivery.drop_altitude_m >= self.executor.delivery.approach_altitude_m {
            return Err(CoreError::Config(
                "delivery drop altitude must be below approach altitude".into(),
            ));
        }

        if self.scheduler.assign_queue_depth == 0 {
            return Err(CoreError::Config(
                "scheduler.assign_queue_depth must be positive".into(),
            ));
        }

        if !(self.telemetry.position_rate_hz > 0.0) || !(self.telemetry.status_rate_hz > 0.0) {
            return Err(CoreError::Config("telemetry rates must be positive".into()));
        }
        if self.telemetry.sink_buffer == 0 {
            return Err(CoreError::Config(
                "telemetry.sink_buffer must be positive".into(),
            ));
        }

        if !(0.0..=100.0).contains(&self.safety.battery_floor_pct) {
            return Err(CoreError::Config(
                "safety.battery_floor_pct must be within 0..=100".into(),
            ));
        }
        if let Some(fence) = &self.safety.geofence {
            fence.to_geofence()?;
        }

        Ok(())
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable output
    #[default]
    Pretty,
    /// One JSON object per line
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(CoreError::UnknownValue {
                kind: "log format",
                value: other.to_string(),
            }),
        }
    }
}

/// Process-level settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Service name attached to startup logs
    pub name: String,
    /// Default `EnvFilter` directive when `RUST_LOG` is unset
    pub log_level: String,
    /// Output format
    pub log_format: LogFormat,
    /// Period of the metrics snapshot log line
    pub metrics_interval_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "aerotask-node".to_string(),
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_interval_secs: 30,
        }
    }
}

/// One vehicle known at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VehicleConfig {
    /// Vehicle identifier, also the external entity id
    pub id: String,
    /// Flight-link connection descriptor (`sim://...` or `tcp://...`)
    pub connection: String,
    /// Declared capabilities (all task types when omitted)
    #[serde(default = "all_capabilities")]
    pub capabilities: CapabilitySet,
}

fn all_capabilities() -> CapabilitySet {
    TaskType::ALL.into_iter().collect()
}

/// Command gateway timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Per-attempt acknowledgement budget for flight commands
    pub command_timeout_ms: u64,
    /// Per-attempt budget for state queries
    pub query_timeout_ms: u64,
    /// Attempts per call for transient link failures
    pub retry_attempts: u32,
    /// First backoff delay; doubled per attempt
    pub retry_base_delay_ms: u64,
    /// Background reconnection period for degraded vehicles
    pub reconnect_interval_secs: u64,
    /// Budget for opening or re-opening a link
    pub connect_timeout_ms: u64,
}

impl GatewayConfig {
    /// Command timeout as a `Duration`
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    /// Query timeout as a `Duration`
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    /// Backoff base as a `Duration`
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    /// Reconnect period as a `Duration`
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_secs)
    }

    /// Connect budget as a `Duration`
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            command_timeout_ms: 100,
            query_timeout_ms: 200,
            retry_attempts: 3,
            retry_base_delay_ms: 20,
            reconnect_interval_secs: 5,
            connect_timeout_ms: 1_000,
        }
    }
}

/// Scheduler budgets
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// End-to-end task switch budget
    pub switch_budget_ms: u64,
    /// Executor stop deadline during preemption
    pub preempt_deadline_ms: u64,
    /// Shutdown drain grace period
    pub shutdown_grace_ms: u64,
    /// Terminal tasks older than this are eligible for purge
    pub task_retention_secs: u64,
    /// Pending assignments buffered per vehicle
    pub assign_queue_depth: usize,
    /// Phase transitions retained per vehicle
    pub phase_history: usize,
}

impl SchedulerConfig {
    /// Switch budget as a `Duration`
    pub fn switch_budget(&self) -> Duration {
        Duration::from_millis(self.switch_budget_ms)
    }

    /// Preempt deadline as a `Duration`
    pub fn preempt_deadline(&self) -> Duration {
        Duration::from_millis(self.preempt_deadline_ms)
    }

    /// Shutdown grace as a `Duration`
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Retention as a `Duration`
    pub fn task_retention(&self) -> Duration {
        Duration::from_secs(self.task_retention_secs)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            switch_budget_ms: 500,
            preempt_deadline_ms: 500,
            shutdown_grace_ms: 5_000,
            task_retention_secs: 3_600,
            assign_queue_depth: 16,
            phase_history: 64,
        }
    }
}

/// Relay executor defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayDefaults {
    /// Hold altitude when the task omits one
    pub altitude_m: f64,
    /// Hold duration when the task omits one
    pub duration_s: u64,
    /// Longest accepted hold
    pub max_duration_s: u64,
    /// Drift radius before a correction is issued
    pub tolerance_m: f64,
    /// Drift check period
    pub correction_interval_ms: u64,
}

impl Default for RelayDefaults {
    fn default() -> Self {
        Self {
            altitude_m: 100.0,
            duration_s: 300,
            max_duration_s: 1_800,
            tolerance_m: 5.0,
            correction_interval_ms: 5_000,
        }
    }
}

/// Delivery executor defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryDefaults {
    /// Most drop points accepted in one task
    pub max_drop_points: usize,
    /// Transit altitude between drop points
    pub approach_altitude_m: f64,
    /// Release altitude
    pub drop_altitude_m: f64,
    /// Settle time at release altitude before checking conditions
    pub stabilise_ms: u64,
}

impl Default for DeliveryDefaults {
    fn default() -> Self {
        Self {
            max_drop_points: 5,
            approach_altitude_m: 50.0,
            drop_altitude_m: 10.0,
            stabilise_ms: 3_000,
        }
    }
}

/// Executor tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Lowest accepted task altitude
    pub min_altitude_m: f64,
    /// Highest accepted task altitude
    pub max_altitude_m: f64,
    /// Waypoint counts as reached inside this radius
    pub reach_tolerance_m: f64,
    /// Cancellation and arrival polling period
    pub check_interval_ms: u64,
    /// Give up on a single waypoint after this long
    pub waypoint_timeout_secs: u64,
    /// Give up on takeoff after this long
    pub takeoff_timeout_secs: u64,
    /// Camera ground footprint width for surveys
    pub default_footprint_m: f64,
    /// Largest survey plan accepted
    pub max_survey_waypoints: usize,
    /// Relay defaults
    pub relay: RelayDefaults,
    /// Delivery defaults
    pub delivery: DeliveryDefaults,
}

impl ExecutorConfig {
    /// Polling period as a `Duration`
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    /// Per-waypoint timeout as a `Duration`
    pub fn waypoint_timeout(&self) -> Duration {
        Duration::from_secs(self.waypoint_timeout_secs)
    }

    /// Takeoff timeout as a `Duration`
    pub fn takeoff_timeout(&self) -> Duration {
        Duration::from_secs(self.takeoff_timeout_secs)
    }

    /// Altitude lies within the safe band
    pub fn altitude_in_band(&self, alt: f64) -> bool {
        alt.is_finite() && alt >= self.min_altitude_m && alt <= self.max_altitude_m
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            min_altitude_m: 5.0,
            max_altitude_m: 120.0,
            reach_tolerance_m: 2.0,
            check_interval_ms: 200,
            waypoint_timeout_secs: 120,
            takeoff_timeout_secs: 60,
            default_footprint_m: 30.0,
            max_survey_waypoints: 2_000,
            relay: RelayDefaults::default(),
            delivery: DeliveryDefaults::default(),
        }
    }
}

/// Geofence as written in configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GeofenceConfig {
    /// Circle around a point
    Circle {
        /// Center latitude
        lat: f64,
        /// Center longitude
        lon: f64,
        /// Radius in meters
        radius_m: f64,
    },
    /// Polygon of `[lat, lon]` vertices
    Polygon {
        /// Vertices in order
        vertices: Vec<[f64; 2]>,
    },
}

impl GeofenceConfig {
    /// Build the runtime boundary, rejecting degenerate shapes
    pub fn to_geofence(&self) -> Result<Geofence> {
        match self {
            GeofenceConfig::Circle { lat, lon, radius_m } => {
                let center = Coordinate::new(*lat, *lon, 0.0);
                if !center.is_valid() || !(*radius_m > 0.0) {
                    return Err(CoreError::Config("invalid circular geofence".into()));
                }
                Ok(Geofence::Circle {
                    center,
                    radius_m: *radius_m,
                })
            }
            GeofenceConfig::Polygon { vertices } => {
                if vertices.len() < 3 {
                    return Err(CoreError::Config(
                        "geofence polygon needs at least 3 vertices".into(),
                    ));
                }
                Ok(Geofence::Polygon(
                    vertices.iter().map(|[lat, lon]| (*lat, *lon)).collect(),
                ))
            }
        }
    }
}

/// Safety policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    /// Battery percentage below which tasks are preempted
    pub battery_floor_pct: f64,
    /// Link considered lost after this long without a fresh snapshot
    pub link_stale_timeout_ms: u64,
    /// Operating boundary, unrestricted when absent
    pub geofence: Option<GeofenceConfig>,
}

impl SafetyConfig {
    /// Stale timeout as a `Duration`
    pub fn link_stale_timeout(&self) -> Duration {
        Duration::from_millis(self.link_stale_timeout_ms)
    }
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            battery_floor_pct: 20.0,
            link_stale_timeout_ms: 3_000,
            geofence: None,
        }
    }
}

/// Telemetry cadences
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Position record rate
    pub position_rate_hz: f64,
    /// Status record rate
    pub status_rate_hz: f64,
    /// Outbound buffer before events are dropped
    pub sink_buffer: usize,
}

impl TelemetryConfig {
    /// Position period as a `Duration`
    pub fn position_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.position_rate_hz)
    }

    /// Status period as a `Duration`
    pub fn status_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.status_rate_hz)
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            position_rate_hz: 4.0,
            status_rate_hz: 1.0,
            sink_buffer: 256,
        }
    }
}

/// Where task assignment records come from
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FeedSource {
    /// No inbound feed; tasks are submitted in-process
    #[default]
    None,
    /// JSON lines on standard input
    Stdin,
    /// JSON lines from a file
    File {
        /// File to read
        path: PathBuf,
    },
}

/// Mission-command boundary
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Task feed
    pub feed: FeedSource,
    /// WebSocket telemetry listen address, disabled when absent
    pub ws_addr: Option<String>,
}
