//! Safety Monitor
//!
//! Evaluated on every telemetry cycle, whether or not the cycle produced a
//! fresh snapshot. Any violation preempts the vehicle; there is no switch to
//! turn this off. Repeated violations are absorbed by the vehicle's safety
//! hold and aborting flag, so a held or aborting vehicle sees no-ops.

use aerotask_core::{CoreError, Geofence, LinkHealth, SafetyConfig, TelemetrySnapshot};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::registry::VehicleEntry;
use crate::scheduler::{PreemptReason, Scheduler};

/// A safety condition that forces preemption
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SafetyViolation {
    /// Battery below the floor
    LowBattery {
        /// Reported charge
        battery_pct: f64,
    },
    /// Outside the geofence
    GeofenceBreach {
        /// Reported latitude
        lat: f64,
        /// Reported longitude
        lon: f64,
    },
    /// No accepted snapshot within the stale timeout
    LinkStale {
        /// Snapshot age
        age_ms: u64,
    },
    /// Flight controller reports the link lost
    LinkLost,
}

impl From<SafetyViolation> for PreemptReason {
    fn from(violation: SafetyViolation) -> Self {
        match violation {
            SafetyViolation::LowBattery { battery_pct } => PreemptReason::LowBattery { battery_pct },
            SafetyViolation::GeofenceBreach { lat, lon } => PreemptReason::GeofenceBreach { lat, lon },
            SafetyViolation::LinkStale { age_ms } => PreemptReason::LinkStale { age_ms },
            SafetyViolation::LinkLost => PreemptReason::LinkLost,
        }
    }
}

/// Static safety policy
#[derive(Debug, Clone)]
pub struct SafetyPolicy {
    battery_floor_pct: f64,
    stale_timeout: Duration,
    geofence: Option<Geofence>,
}

impl SafetyPolicy {
    /// Build from configuration
    pub fn from_config(config: &SafetyConfig) -> Result<Self, CoreError> {
        Ok(Self {
            battery_floor_pct: config.battery_floor_pct,
            stale_timeout: config.link_stale_timeout(),
            geofence: config.geofence.as_ref().map(|g| g.to_geofence()).transpose()?,
        })
    }

    /// Violations for a vehicle's latest snapshot and its age.
    ///
    /// Battery comes first, then geofence, then link.
    pub fn evaluate(&self, snapshot: Option<&TelemetrySnapshot>, age: Duration) -> Vec<SafetyViolation> {
        let mut violations = Vec::new();
        if let Some(snapshot) = snapshot {
            if snapshot.battery_pct < self.battery_floor_pct {
                violations.push(SafetyViolation::LowBattery {
                    battery_pct: snapshot.battery_pct,
                });
            }
            if let Some(fence) = &self.geofence {
                if !fence.contains(&snapshot.position) {
                    violations.push(SafetyViolation::GeofenceBreach {
                        lat: snapshot.position.lat,
                        lon: snapshot.position.lon,
                    });
                }
            }
            if snapshot.link_health == LinkHealth::Lost {
                violations.push(SafetyViolation::LinkLost);
            }
        }
        if age > self.stale_timeout {
            violations.push(SafetyViolation::LinkStale {
                age_ms: age.as_millis() as u64,
            });
        }
        violations
    }
}

/// Applies the policy to registered vehicles
#[derive(Debug)]
pub struct SafetyMonitor {
    policy: SafetyPolicy,
    scheduler: Arc<Scheduler>,
}

impl SafetyMonitor {
    /// Create a monitor that preempts through `scheduler`
    pub fn new(policy: SafetyPolicy, scheduler: Arc<Scheduler>) -> Self {
        Self { policy, scheduler }
    }

    /// Policy in force
    pub fn policy(&self) -> &SafetyPolicy {
        &self.policy
    }

    /// Evaluate one vehicle. Preempts on the first violation; clears the
    /// safety hold once a cycle comes back clean.
    pub fn check(&self, entry: &VehicleEntry) -> Option<SafetyViolation> {
        let snapshot = entry.latest_snapshot();
        let violations = self.policy.evaluate(snapshot.as_ref(), entry.snapshot_age());

        let Some(violation) = violations.into_iter().next() else {
            if entry.safety_hold().is_some() && !entry.is_aborting() && entry.clear_safety_hold() {
                info!(vehicle_id = %entry.id(), "Safety hold cleared");
            }
            return None;
        };

        match self.scheduler.preempt(entry.id(), violation.clone().into()) {
            Ok(true) => warn!(vehicle_id = %entry.id(), ?violation, "Safety violation, vehicle preempted"),
            Ok(false) => debug!(vehicle_id = %entry.id(), ?violation, "Safety violation, already handled"),
            Err(e) => warn!(vehicle_id = %entry.id(), ?violation, error = %e, "Safety preemption failed"),
        }
        Some(violation)
    }
}
