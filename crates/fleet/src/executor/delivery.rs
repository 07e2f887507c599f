//! Payload delivery
//!
//! Drop points are visited in the order given. At each one the vehicle
//! descends from the approach altitude, settles, checks release conditions
//! and releases one payload item before climbing back. A point whose
//! conditions fail, or whose release the vehicle refuses, is skipped; the
//! task fails only when every point was skipped.

use aerotask_core::{Coordinate, ExecutorConfig, LinkHealth, TelemetrySnapshot};
use serde::Deserialize;
use std::time::Duration;
use tracing::{info, warn};

use super::{check_altitude, decode, preflight, ExecutorContext, GroundPoint};
use crate::error::{ExecutorError, ValidationError};
use crate::task::FailureReason;

/// Time allowed for the payload to clear before climbing
const RELEASE_CLEAR: Duration = Duration::from_secs(2);

#[derive(Debug, Deserialize)]
struct RawDeliveryParams {
    #[serde(alias = "drop_points")]
    drop_locations: Vec<GroundPoint>,
    #[serde(alias = "approach_altitude_m")]
    approach_altitude: Option<f64>,
    #[serde(alias = "drop_altitude_m")]
    drop_altitude: Option<f64>,
}

/// Validated delivery parameters
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryParams {
    /// Drop points at the approach altitude, in visiting order
    pub drop_points: Vec<Coordinate>,
    /// Transit altitude
    pub approach_altitude_m: f64,
    /// Release altitude
    pub drop_altitude_m: f64,
}

impl DeliveryParams {
    /// Decode and validate against `limits`
    pub fn from_value(
        parameters: &serde_json::Value,
        limits: &ExecutorConfig,
    ) -> Result<Self, ValidationError> {
        let raw: RawDeliveryParams = decode(parameters)?;
        if raw.drop_locations.is_empty() {
            return Err(ValidationError::NoDropPoints);
        }
        let max = limits.delivery.max_drop_points;
        if raw.drop_locations.len() > max {
            return Err(ValidationError::TooManyDropPoints {
                count: raw.drop_locations.len(),
                max,
            });
        }

        let approach = raw
            .approach_altitude
            .unwrap_or(limits.delivery.approach_altitude_m);
        let drop = raw.drop_altitude.unwrap_or(limits.delivery.drop_altitude_m);
        check_altitude(approach, limits)?;
        check_altitude(drop, limits)?;
        if drop >= approach {
            return Err(ValidationError::DropAltitudeNotBelowApproach {
                drop_m: drop,
                approach_m: approach,
            });
        }

        let drop_points = raw
            .drop_locations
            .into_iter()
            .map(|p| p.at(approach, "drop_locations"))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            drop_points,
            approach_altitude_m: approach,
            drop_altitude_m: drop,
        })
    }
}

/// Delivery executor
#[derive(Debug, Clone)]
pub struct DeliveryExecutor {
    params: DeliveryParams,
    stabilise: Duration,
}

/// Conditions at release altitude that allow a drop
fn release_blocker(state: &TelemetrySnapshot) -> Option<&'static str> {
    if !state.gps_fix.has_3d_fix() {
        Some("no 3D fix")
    } else if state.link_health != LinkHealth::Healthy {
        Some("link not healthy")
    } else {
        None
    }
}

impl DeliveryExecutor {
    /// Validate parameters
    pub fn prepare(
        parameters: &serde_json::Value,
        limits: &ExecutorConfig,
    ) -> Result<Self, ValidationError> {
        Ok(Self {
            params: DeliveryParams::from_value(parameters, limits)?,
            stabilise: Duration::from_millis(limits.delivery.stabilise_ms),
        })
    }

    /// Validated parameters
    pub fn params(&self) -> &DeliveryParams {
        &self.params
    }

    /// Attempt one drop; `Ok(false)` when the point is skipped
    async fn drop_at(&self, ctx: &ExecutorContext, point: Coordinate) -> Result<bool, ExecutorError> {
        ctx.fly_to(point).await?;
        ctx.fly_to(point.with_alt(self.params.drop_altitude_m)).await?;
        ctx.pause(self.stabilise).await?;

        let state = ctx.query().await?;
        let delivered = match release_blocker(&state) {
            Some(blocker) => {
                warn!(vehicle_id = %ctx.vehicle_id, blocker, "Skipping drop point");
                false
            }
            None => match ctx.command(ctx.gateway.release_payload()).await {
                Ok(_) => {
                    ctx.pause(RELEASE_CLEAR).await?;
                    true
                }
                Err(ExecutorError::Failed {
                    reason: FailureReason::CommandRejected,
                    detail,
                }) => {
                    warn!(vehicle_id = %ctx.vehicle_id, %detail, "Release refused, skipping drop point");
                    false
                }
                Err(other) => return Err(other),
            },
        };

        ctx.fly_to(point).await?;
        Ok(delivered)
    }

    pub(crate) async fn run(&self, ctx: &ExecutorContext) -> Result<(), ExecutorError> {
        preflight::launch(ctx, self.params.approach_altitude_m).await?;

        let total = self.params.drop_points.len();
        let mut delivered = 0;
        for (index, point) in self.params.drop_points.iter().enumerate() {
            if self.drop_at(ctx, *point).await? {
                delivered += 1;
            }
            ctx.report((index + 1) as f64 / total as f64);
        }

        info!(vehicle_id = %ctx.vehicle_id, delivered, total, "Delivery finished");
        if delivered == 0 {
            return Err(ExecutorError::failed(
                FailureReason::AllDropsSkipped,
                format!("all {total} drop points skipped"),
            ));
        }
        Ok(())
    }
}
