//! Flight command definitions
//!
//! The discrete command set a flight controller accepts, plus the two payload
//! actions the executors need (camera trigger and payload release).

#![warn(missing_docs)]

use aerotask_core::{Coordinate, FlightMode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Single vehicle command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlightCommand {
    /// Arm motors
    Arm,
    /// Disarm motors
    Disarm,
    /// Switch autopilot mode
    SetMode {
        /// Requested mode
        mode: FlightMode,
    },
    /// Fly to a waypoint
    Goto {
        /// Target position, altitude included
        waypoint: Coordinate,
    },
    /// Climb to altitude from the ground
    Takeoff {
        /// Target altitude in meters
        altitude_m: f64,
    },
    /// Land at the current position
    Land,
    /// Return to the launch point and land
    ReturnToLaunch,
    /// Trigger the imaging payload
    Capture,
    /// Release one payload item
    ReleasePayload,
}

impl FlightCommand {
    /// Short name used in logs, errors and metrics
    pub fn name(&self) -> &'static str {
        match self {
            FlightCommand::Arm => "arm",
            FlightCommand::Disarm => "disarm",
            FlightCommand::SetMode { .. } => "set_mode",
            FlightCommand::Goto { .. } => "goto",
            FlightCommand::Takeoff { .. } => "takeoff",
            FlightCommand::Land => "land",
            FlightCommand::ReturnToLaunch => "return_to_launch",
            FlightCommand::Capture => "capture",
            FlightCommand::ReleasePayload => "release_payload",
        }
    }

    /// Payload action rather than a flight command
    pub fn is_payload_action(&self) -> bool {
        matches!(self, FlightCommand::Capture | FlightCommand::ReleasePayload)
    }
}

/// Acknowledgement of a command by the flight controller
#[derive(Debug, Clone, PartialEq)]
pub struct Acknowledged {
    /// Command name
    pub command: &'static str,
    /// Attempts used, including the successful one
    pub attempts: u32,
    /// Time from first send to acknowledgement
    pub latency: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_wire_shape() {
        let cmd = FlightCommand::Goto {
            waypoint: Coordinate::new(45.0, -122.0, 50.0),
        };
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["type"], "goto");
        assert_eq!(json["waypoint"]["alt"], 50.0);

        let mode: FlightCommand =
            serde_json::from_str(r#"{"type":"set_mode","mode":"hold"}"#).unwrap();
        assert_eq!(
            mode,
            FlightCommand::SetMode {
                mode: FlightMode::Hold
            }
        );
    }

    #[test]
    fn test_payload_actions() {
        assert!(FlightCommand::Capture.is_payload_action());
        assert!(FlightCommand::ReleasePayload.is_payload_action());
        assert!(!FlightCommand::ReturnToLaunch.is_payload_action());
        assert_eq!(FlightCommand::ReturnToLaunch.name(), "return_to_launch");
    }
}
