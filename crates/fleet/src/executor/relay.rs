//! Relay position hold
//!
//! Fly to the relay point and stay there for the requested duration, sending
//! a correction goto whenever the vehicle drifts outside the tolerance.

use aerotask_core::{Coordinate, ExecutorConfig};
use serde::Deserialize;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use super::{check_altitude, decode, preflight, ExecutorContext, GroundPoint, MAX_QUERY_FAILURES};
use crate::error::{ExecutorError, ValidationError};

#[derive(Debug, Deserialize)]
struct RawRelayParams {
    #[serde(alias = "position")]
    relay_position: GroundPoint,
    #[serde(alias = "altitude_m")]
    altitude: Option<f64>,
    #[serde(alias = "duration_s")]
    duration: Option<u64>,
    tolerance_m: Option<f64>,
}

/// Validated relay parameters
#[derive(Debug, Clone, PartialEq)]
pub struct RelayParams {
    /// Hold point at hold altitude
    pub position: Coordinate,
    /// Time on station once the point is reached
    pub duration: Duration,
    /// Drift radius before a correction is sent
    pub tolerance_m: f64,
}

impl RelayParams {
    /// Decode and validate against `limits`
    pub fn from_value(
        parameters: &serde_json::Value,
        limits: &ExecutorConfig,
    ) -> Result<Self, ValidationError> {
        let raw: RawRelayParams = decode(parameters)?;
        let altitude = raw.altitude.unwrap_or(limits.relay.altitude_m);
        check_altitude(altitude, limits)?;

        let duration_s = raw.duration.unwrap_or(limits.relay.duration_s);
        if duration_s == 0 || duration_s > limits.relay.max_duration_s {
            return Err(ValidationError::DurationOutOfRange {
                duration_s,
                max_s: limits.relay.max_duration_s,
            });
        }

        let tolerance_m = raw.tolerance_m.unwrap_or(limits.relay.tolerance_m);
        if !(tolerance_m.is_finite() && tolerance_m > 0.0) {
            return Err(ValidationError::InvalidTolerance(tolerance_m));
        }

        Ok(Self {
            position: raw.relay_position.at(altitude, "relay_position")?,
            duration: Duration::from_secs(duration_s),
            tolerance_m,
        })
    }
}

/// Relay executor
#[derive(Debug, Clone)]
pub struct RelayExecutor {
    params: RelayParams,
    correction_interval: Duration,
}

impl RelayExecutor {
    /// Validate parameters
    pub fn prepare(
        parameters: &serde_json::Value,
        limits: &ExecutorConfig,
    ) -> Result<Self, ValidationError> {
        Ok(Self {
            params: RelayParams::from_value(parameters, limits)?,
            correction_interval: Duration::from_millis(limits.relay.correction_interval_ms),
        })
    }

    /// Validated parameters
    pub fn params(&self) -> &RelayParams {
        &self.params
    }

    pub(crate) async fn run(&self, ctx: &ExecutorContext) -> Result<(), ExecutorError> {
        let target = self.params.position;
        preflight::launch(ctx, target.alt).await?;
        ctx.fly_to(target).await?;
        info!(
            vehicle_id = %ctx.vehicle_id,
            duration_s = self.params.duration.as_secs(),
            "On relay station"
        );

        let started = Instant::now();
        let mut failures = 0;
        loop {
            let elapsed = started.elapsed();
            ctx.report(elapsed.as_secs_f64() / self.params.duration.as_secs_f64());
            if elapsed >= self.params.duration {
                return Ok(());
            }
            let remaining = self.params.duration - elapsed;
            ctx.pause(self.correction_interval.min(remaining)).await?;

            match ctx.query().await {
                Ok(state) => {
                    failures = 0;
                    let drift = state.position.distance_m(&target);
                    if drift > self.params.tolerance_m {
                        debug!(vehicle_id = %ctx.vehicle_id, drift_m = drift, "Correcting relay drift");
                        ctx.command(ctx.gateway.goto(target)).await?;
                    }
                }
                Err(e) => {
                    failures += 1;
                    if failures >= MAX_QUERY_FAILURES {
                        return Err(e);
                    }
                }
            }
        }
    }
}
