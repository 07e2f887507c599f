//! External record contract
//!
//! Records exchanged with the mission-command platform. Outbound telemetry is
//! wrapped in an [`Envelope`] carrying [`SCHEMA_VERSION`]; inbound feed lines
//! are [`FeedRecord`]s.

use aerotask_core::{FlightMode, GpsFix};
use aerotask_fleet::{TaskAssignment, TelemetryEvent};
use serde::{Deserialize, Serialize};

/// Version of the outbound record layout
pub const SCHEMA_VERSION: u32 = 1;

/// Position record, published at the position cadence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionRecord {
    /// Vehicle identifier
    pub entity_id: String,
    /// Latitude in degrees
    pub lat: f64,
    /// Longitude in degrees
    pub lon: f64,
    /// Altitude above home in meters
    pub alt: f64,
    /// Snapshot time (nanoseconds since epoch)
    pub timestamp: u64,
}

/// Status record, published at the status cadence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    /// Vehicle identifier
    pub entity_id: String,
    /// Battery charge percentage
    pub battery_pct: f64,
    /// Autopilot mode
    pub mode: FlightMode,
    /// Motors armed
    pub armed: bool,
    /// GPS fix quality
    pub gps_fix: GpsFix,
    /// Snapshot time (nanoseconds since epoch)
    pub timestamp: u64,
}

/// Outbound telemetry record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum TelemetryRecord {
    /// Position
    Position(PositionRecord),
    /// Status
    Status(StatusRecord),
}

impl From<&TelemetryEvent> for TelemetryRecord {
    fn from(event: &TelemetryEvent) -> Self {
        let snapshot = event.snapshot();
        match event {
            TelemetryEvent::Position { vehicle_id, .. } => TelemetryRecord::Position(PositionRecord {
                entity_id: vehicle_id.clone(),
                lat: snapshot.position.lat,
                lon: snapshot.position.lon,
                alt: snapshot.position.alt,
                timestamp: snapshot.timestamp_ns,
            }),
            TelemetryEvent::Status { vehicle_id, .. } => TelemetryRecord::Status(StatusRecord {
                entity_id: vehicle_id.clone(),
                battery_pct: snapshot.battery_pct,
                mode: snapshot.mode,
                armed: snapshot.armed,
                gps_fix: snapshot.gps_fix,
                timestamp: snapshot.timestamp_ns,
            }),
        }
    }
}

/// Versioned wire wrapper for a telemetry record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Record layout version
    pub schema_version: u32,
    /// Payload
    #[serde(flatten)]
    pub record: TelemetryRecord,
}

impl Envelope {
    /// Wrap a record at the current schema version
    pub fn new(record: TelemetryRecord) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            record,
        }
    }

    /// Encode as one JSON text
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl From<&TelemetryEvent> for Envelope {
    fn from(event: &TelemetryEvent) -> Self {
        Envelope::new(event.into())
    }
}

/// Inbound record from the mission-command platform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum FeedRecord {
    /// Run a task
    Assign(TaskAssignment),
    /// Stop a task
    Cancel {
        /// Task to stop
        task_id: String,
    },
}

impl FeedRecord {
    /// Decode one feed line.
    ///
    /// Lines without an `op` field are read as bare assignments.
    pub fn parse(line: &str) -> serde_json::Result<Self> {
        let value: serde_json::Value = serde_json::from_str(line)?;
        if value.get("op").is_some() {
            serde_json::from_value(value)
        } else {
            serde_json::from_value(value).map(FeedRecord::Assign)
        }
    }

    /// Task the record refers to
    pub fn task_id(&self) -> &str {
        match self {
            FeedRecord::Assign(assignment) => &assignment.task_id,
            FeedRecord::Cancel { task_id } => task_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aerotask_core::{Coordinate, LinkHealth, TaskType, TelemetrySnapshot};
    use aerotask_fleet::VehiclePhase;
    use serde_json::json;

    fn snapshot() -> TelemetrySnapshot {
        TelemetrySnapshot {
            position: Coordinate::new(45.0, -122.0, 30.0),
            battery_pct: 77.5,
            armed: true,
            mode: FlightMode::Guided,
            gps_fix: GpsFix::Fix3d,
            link_health: LinkHealth::Healthy,
            timestamp_ns: 1_700_000_000_000_000_000,
        }
    }

    #[test]
    fn test_position_record_layout() {
        let event = TelemetryEvent::Position {
            vehicle_id: "uav-1".into(),
            snapshot: snapshot(),
        };
        let value = serde_json::to_value(Envelope::from(&event)).unwrap();
        assert_eq!(
            value,
            json!({
                "schema_version": 1,
                "record": "position",
                "entity_id": "uav-1",
                "lat": 45.0,
                "lon": -122.0,
                "alt": 30.0,
                "timestamp": 1_700_000_000_000_000_000u64
            })
        );
    }

    #[test]
    fn test_status_record_layout() {
        let event = TelemetryEvent::Status {
            vehicle_id: "uav-1".into(),
            snapshot: snapshot(),
            phase: VehiclePhase::Executing,
            task_id: Some("t1".into()),
        };
        let envelope = Envelope::from(&event);
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["record"], "status");
        assert_eq!(value["battery_pct"], 77.5);
        assert_eq!(value["mode"], "guided");
        assert_eq!(value["gps_fix"], "fix3d");
        assert_eq!(value["armed"], true);

        let back: Envelope = serde_json::from_value(value).unwrap();
        assert_eq!(back, envelope);
    }

    #[test]
    fn test_feed_record_forms() {
        let tagged = FeedRecord::parse(
            r#"{"op":"assign","task_id":"t1","task_type":"survey","target_vehicle_id":"uav-1","parameters":{}}"#,
        )
        .unwrap();
        let bare = FeedRecord::parse(
            r#"{"task_id":"t1","task_type":"survey","target_vehicle_id":"uav-1","parameters":{}}"#,
        )
        .unwrap();
        assert_eq!(tagged, bare);
        match &bare {
            FeedRecord::Assign(a) => assert_eq!(a.task_type, TaskType::Survey),
            other => panic!("unexpected {other:?}"),
        }

        let cancel = FeedRecord::parse(r#"{"op":"cancel","task_id":"t1"}"#).unwrap();
        assert_eq!(cancel.task_id(), "t1");
        assert!(FeedRecord::parse(r#"{"op":"launch"}"#).is_err());
    }
}
