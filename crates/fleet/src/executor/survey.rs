//! Lawn-mower area survey
//!
//! The area is a rectangle centred on `area_center`, aligned north/east.
//! Lanes run north-south, spaced by the camera footprint less the overlap,
//! and alternate direction so the vehicle turns once per lane.

use aerotask_core::{Coordinate, ExecutorConfig, LocalOffset};
use serde::Deserialize;
use tracing::{debug, warn};

use super::{check_altitude, decode, preflight, ExecutorContext, GroundPoint};
use crate::error::{ExecutorError, ValidationError};

/// Guards lane counting against spacing that divides the width exactly
const LANE_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, Deserialize)]
struct AreaSize {
    width: f64,
    height: f64,
}

#[derive(Debug, Deserialize)]
struct RawSurveyParams {
    #[serde(alias = "center")]
    area_center: GroundPoint,
    area_size: AreaSize,
    #[serde(default = "default_altitude")]
    altitude: f64,
    #[serde(default = "default_overlap")]
    overlap: f64,
    #[serde(default, alias = "footprint_m")]
    camera_fov: Option<f64>,
}

fn default_altitude() -> f64 {
    50.0
}

fn default_overlap() -> f64 {
    0.8
}

/// Validated survey parameters
#[derive(Debug, Clone, PartialEq)]
pub struct SurveyParams {
    /// Area centre; altitude is the survey altitude
    pub center: Coordinate,
    /// East-west extent in meters
    pub width_m: f64,
    /// North-south extent in meters
    pub height_m: f64,
    /// Overlap fraction between adjacent lanes
    pub overlap: f64,
    /// Ground width covered by one image
    pub footprint_m: f64,
    /// Lanes needed to cover the width
    pub lane_count: usize,
}

/// Lanes of `spacing` needed to cover `width`; `None` when the count does not
/// fit in memory
fn lanes_for(width_m: f64, spacing_m: f64) -> Option<usize> {
    let lanes = ((width_m / spacing_m) - LANE_EPSILON).ceil().max(1.0);
    if !lanes.is_finite() || lanes >= usize::MAX as f64 {
        return None;
    }
    Some(lanes as usize)
}

impl SurveyParams {
    /// Decode and validate against `limits`
    pub fn from_value(
        parameters: &serde_json::Value,
        limits: &ExecutorConfig,
    ) -> Result<Self, ValidationError> {
        let raw: RawSurveyParams = decode(parameters)?;
        let AreaSize { width, height } = raw.area_size;
        if !(width.is_finite() && height.is_finite() && width > 0.0 && height > 0.0) {
            return Err(ValidationError::NonPositiveArea {
                width_m: width,
                height_m: height,
            });
        }
        check_altitude(raw.altitude, limits)?;
        if !(raw.overlap > 0.0 && raw.overlap < 1.0) {
            return Err(ValidationError::OverlapOutOfRange(raw.overlap));
        }
        let footprint_m = raw.camera_fov.unwrap_or(limits.default_footprint_m);
        if !(footprint_m.is_finite() && footprint_m > 0.0) {
            return Err(ValidationError::InvalidFootprint(footprint_m));
        }

        let max = limits.max_survey_waypoints;
        let lane_count = lanes_for(width, footprint_m * (1.0 - raw.overlap));
        let count = lane_count.and_then(|lanes| lanes.checked_mul(2));
        let lane_count = match (lane_count, count) {
            (Some(lanes), Some(count)) if count <= max => lanes,
            _ => {
                return Err(ValidationError::TooManyWaypoints {
                    count: count.unwrap_or(usize::MAX),
                    max,
                })
            }
        };

        Ok(Self {
            center: raw.area_center.at(raw.altitude, "area_center")?,
            width_m: width,
            height_m: height,
            overlap: raw.overlap,
            footprint_m,
            lane_count,
        })
    }

    /// Distance between adjacent lanes
    pub fn lane_spacing_m(&self) -> f64 {
        self.footprint_m * (1.0 - self.overlap)
    }
}

/// Planned survey flight
#[derive(Debug, Clone, PartialEq)]
pub struct SurveyPlan {
    /// Distance between adjacent lanes
    pub lane_spacing_m: f64,
    /// Number of lanes
    pub lane_count: usize,
    /// Waypoint offsets from the area centre, in flight order
    pub offsets: Vec<LocalOffset>,
    /// Waypoints in flight order, all at the survey altitude
    pub waypoints: Vec<Coordinate>,
}

impl SurveyPlan {
    /// Build the boustrophedon pattern from validated parameters
    pub fn plan(params: &SurveyParams) -> Self {
        let spacing = params.lane_spacing_m();
        let lane_count = params.lane_count;
        let west_edge = -params.width_m / 2.0;
        let south = -params.height_m / 2.0;
        let north = params.height_m / 2.0;

        let mut offsets = Vec::with_capacity(lane_count * 2);
        for lane in 0..lane_count {
            let east = west_edge + spacing / 2.0 + lane as f64 * spacing;
            let (start, end) = if lane % 2 == 0 { (south, north) } else { (north, south) };
            offsets.push(LocalOffset::new(east, start));
            offsets.push(LocalOffset::new(east, end));
        }

        let waypoints = offsets
            .iter()
            .map(|o| o.apply(&params.center, params.center.alt))
            .collect();

        Self {
            lane_spacing_m: spacing,
            lane_count,
            offsets,
            waypoints,
        }
    }
}

/// Survey executor, planned at assignment time
#[derive(Debug, Clone)]
pub struct SurveyExecutor {
    params: SurveyParams,
    plan: SurveyPlan,
}

impl SurveyExecutor {
    /// Validate and plan
    pub fn prepare(
        parameters: &serde_json::Value,
        limits: &ExecutorConfig,
    ) -> Result<Self, ValidationError> {
        let params = SurveyParams::from_value(parameters, limits)?;
        let plan = SurveyPlan::plan(&params);
        Ok(Self { params, plan })
    }

    /// Validated parameters
    pub fn params(&self) -> &SurveyParams {
        &self.params
    }

    /// Planned flight
    pub fn plan(&self) -> &SurveyPlan {
        &self.plan
    }

    pub(crate) async fn run(&self, ctx: &ExecutorContext) -> Result<(), ExecutorError> {
        preflight::launch(ctx, self.params.center.alt).await?;

        let total = self.plan.waypoints.len();
        for (index, waypoint) in self.plan.waypoints.iter().enumerate() {
            ctx.fly_to(*waypoint).await?;
            ctx.checkpoint()?;
            if let Err(e) = ctx.gateway.capture().await {
                warn!(vehicle_id = %ctx.vehicle_id, waypoint = index, error = %e, "Capture failed");
            }
            ctx.report((index + 1) as f64 / total as f64);
            debug!(vehicle_id = %ctx.vehicle_id, waypoint = index + 1, total, "Waypoint reached");
        }
        Ok(())
    }
}
