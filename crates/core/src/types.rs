//! Core types
//!
//! Vehicle state vocabulary shared by the gateway, the fleet engine and the
//! mission-command bridge.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::CoreError;
use crate::geo;

/// Current wall-clock time in nanoseconds since the Unix epoch.
pub fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Task type, also used as a vehicle capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// Area survey flown as a lawn-mower imaging pattern
    #[serde(alias = "mapping")]
    Survey,
    /// Communication relay position hold
    Relay,
    /// Payload delivery to one or more drop points
    #[serde(alias = "dropping")]
    Delivery,
}

impl TaskType {
    /// Every task type, in declaration order
    pub const ALL: [TaskType; 3] = [TaskType::Survey, TaskType::Relay, TaskType::Delivery];

    /// Stable lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Survey => "survey",
            TaskType::Relay => "relay",
            TaskType::Delivery => "delivery",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "survey" | "mapping" => Ok(TaskType::Survey),
            "relay" => Ok(TaskType::Relay),
            "delivery" | "dropping" => Ok(TaskType::Delivery),
            other => Err(CoreError::UnknownValue {
                kind: "task type",
                value: other.to_string(),
            }),
        }
    }
}

/// Set of task types a vehicle is declared able to perform
pub type CapabilitySet = BTreeSet<TaskType>;

/// Geographic position (WGS84 degrees, altitude in meters above launch)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    /// Latitude in decimal degrees
    pub lat: f64,
    /// Longitude in decimal degrees
    pub lon: f64,
    /// Altitude in meters AGL
    #[serde(default)]
    pub alt: f64,
}

impl Coordinate {
    /// Create a coordinate
    pub fn new(lat: f64, lon: f64, alt: f64) -> Self {
        Self { lat, lon, alt }
    }

    /// Same horizontal position at a different altitude
    pub fn with_alt(self, alt: f64) -> Self {
        Self { alt, ..self }
    }

    /// Latitude/longitude within WGS84 bounds and finite
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && self.alt.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lon)
    }

    /// Great-circle ground distance in meters
    pub fn horizontal_distance_m(&self, other: &Coordinate) -> f64 {
        geo::haversine_m(self.lat, self.lon, other.lat, other.lon)
    }

    /// Straight-line distance in meters including the altitude difference
    pub fn distance_m(&self, other: &Coordinate) -> f64 {
        let ground = self.horizontal_distance_m(other);
        let vertical = self.alt - other.alt;
        (ground * ground + vertical * vertical).sqrt()
    }
}

/// GPS fix quality as reported by the autopilot
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GpsFix {
    /// No GPS receiver connected
    NoGps = 0,
    /// Receiver present, no position
    NoFix = 1,
    /// Horizontal fix only
    Fix2d = 2,
    /// Full 3D fix (minimum for flight)
    Fix3d = 3,
    /// Differential GPS
    Dgps = 4,
    /// RTK float solution
    RtkFloat = 5,
    /// RTK fixed solution
    RtkFixed = 6,
}

impl GpsFix {
    /// Fix is good enough to fly autonomously
    pub fn has_3d_fix(&self) -> bool {
        *self >= GpsFix::Fix3d
    }
}

/// Autopilot flight mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlightMode {
    /// Mode not yet reported
    Unknown,
    /// Hold current position
    Hold,
    /// Accept externally commanded waypoints
    Guided,
    /// Climbing to takeoff altitude
    Takeoff,
    /// Descending to land
    Land,
    /// Autonomous return to the launch point
    ReturnToLaunch,
}

impl FlightMode {
    /// Uppercase label used in outbound status records
    pub fn label(&self) -> &'static str {
        match self {
            FlightMode::Unknown => "UNKNOWN",
            FlightMode::Hold => "HOLD",
            FlightMode::Guided => "GUIDED",
            FlightMode::Takeoff => "TAKEOFF",
            FlightMode::Land => "LAND",
            FlightMode::ReturnToLaunch => "RTL",
        }
    }
}

impl fmt::Display for FlightMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Link health indicator derived by the flight-controller link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkHealth {
    /// Messages arriving at the expected rate
    Healthy,
    /// Intermittent loss
    Degraded,
    /// No traffic from the vehicle
    Lost,
}

/// Point-in-time vehicle state.
///
/// Snapshots are immutable; a vehicle's snapshot sequence is strictly
/// increasing in `timestamp_ns`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    /// Current position
    pub position: Coordinate,
    /// Remaining battery (0-100)
    pub battery_pct: f64,
    /// Motors armed
    pub armed: bool,
    /// Current autopilot mode
    pub mode: FlightMode,
    /// GPS fix quality
    pub gps_fix: GpsFix,
    /// Link health indicator
    pub link_health: LinkHealth,
    /// Capture timestamp in nanoseconds since epoch
    pub timestamp_ns: u64,
}

impl TelemetrySnapshot {
    /// Altitude above which the vehicle is considered airborne
    pub const AIRBORNE_ALT_M: f64 = 1.0;

    /// Vehicle is off the ground
    pub fn is_airborne(&self) -> bool {
        self.position.alt > Self::AIRBORNE_ALT_M
    }

    /// Strictly newer than `other`
    pub fn is_newer_than(&self, other: &TelemetrySnapshot) -> bool {
        self.timestamp_ns > other.timestamp_ns
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_type_aliases() {
        assert_eq!("mapping".parse::<TaskType>().unwrap(), TaskType::Survey);
        assert_eq!("Dropping".parse::<TaskType>().unwrap(), TaskType::Delivery);
        assert_eq!("relay".parse::<TaskType>().unwrap(), TaskType::Relay);
        assert!("strike".parse::<TaskType>().is_err());

        let parsed: TaskType = serde_json::from_str("\"mapping\"").unwrap();
        assert_eq!(parsed, TaskType::Survey);
        assert_eq!(serde_json::to_string(&TaskType::Delivery).unwrap(), "\"delivery\"");
    }

    #[test]
    fn test_gps_fix_ordering() {
        assert!(!GpsFix::Fix2d.has_3d_fix());
        assert!(GpsFix::Fix3d.has_3d_fix());
        assert!(GpsFix::RtkFixed.has_3d_fix());
        assert!(GpsFix::NoGps < GpsFix::NoFix);
    }

    #[test]
    fn test_coordinate_validity() {
        assert!(Coordinate::new(45.0, -122.0, 10.0).is_valid());
        assert!(!Coordinate::new(91.0, 0.0, 0.0).is_valid());
        assert!(!Coordinate::new(0.0, f64::NAN, 0.0).is_valid());
    }

    #[test]
    fn test_distance_includes_altitude() {
        let a = Coordinate::new(45.0, -122.0, 0.0);
        let b = a.with_alt(30.0);
        assert!((a.distance_m(&b) - 30.0).abs() < 1e-9);
        assert!(a.horizontal_distance_m(&b) < 1e-9);
    }

    #[test]
    fn test_snapshot_ordering() {
        let base = TelemetrySnapshot {
            position: Coordinate::new(45.0, -122.0, 0.5),
            battery_pct: 90.0,
            armed: false,
            mode: FlightMode::Hold,
            gps_fix: GpsFix::Fix3d,
            link_health: LinkHealth::Healthy,
            timestamp_ns: 10,
        };
        let later = TelemetrySnapshot {
            timestamp_ns: 11,
            ..base
        };
        assert!(later.is_newer_than(&base));
        assert!(!base.is_newer_than(&base));
        assert!(!base.is_airborne());
    }
}
