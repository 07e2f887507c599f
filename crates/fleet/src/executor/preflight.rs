//! Shared launch sequence: GPS check, arm, climb

use aerotask_core::TelemetrySnapshot;
use tracing::debug;

use super::ExecutorContext;
use crate::error::ExecutorError;
use crate::task::FailureReason;

/// Get the vehicle armed and at `altitude_m`.
///
/// A vehicle already airborne and armed skips straight to the climb check,
/// which lets a task pick up from wherever the previous one left off.
pub(crate) async fn launch(
    ctx: &ExecutorContext,
    altitude_m: f64,
) -> Result<TelemetrySnapshot, ExecutorError> {
    ctx.checkpoint()?;
    let state = ctx.query().await?;
    if !state.gps_fix.has_3d_fix() {
        return Err(ExecutorError::failed(
            FailureReason::PreflightFailed,
            format!("GPS fix {:?} below 3D", state.gps_fix),
        ));
    }

    if state.armed && state.is_airborne() {
        debug!(vehicle_id = %ctx.vehicle_id, alt = state.position.alt, "Already airborne");
        return Ok(state);
    }

    if !state.armed {
        ctx.command(ctx.gateway.arm()).await?;
        let state = ctx.query().await?;
        if !state.armed {
            return Err(ExecutorError::failed(
                FailureReason::PreflightFailed,
                "vehicle did not arm",
            ));
        }
    }

    ctx.command(ctx.gateway.takeoff(altitude_m)).await?;
    // Treat 95% of the requested height as reached
    let floor = altitude_m * 0.95;
    ctx.wait_until(
        ctx.limits.takeoff_timeout(),
        FailureReason::PreflightFailed,
        "takeoff altitude",
        |s| s.position.alt >= floor,
    )
    .await
}
