//! Task executors
//!
//! One executor per capability, behind a single closed enum. An executor is
//! built with [`Executor::prepare`], which validates parameters and plans the
//! flight without touching the vehicle, so a rejected task never issues a
//! command. [`Executor::start`] then spawns the flight on the runtime and
//! returns an [`ExecutorHandle`] for progress and abort.
//!
//! Abort is cooperative: executors observe a cancellation token between
//! commands and during every wait. A command already in flight is allowed to
//! finish (it is bounded by the gateway timeout); an executor that does not
//! stop by the abort deadline is torn down by the handle.
//!
//! Executors leave the vehicle holding position when they stop. Return to
//! launch is the scheduler's decision.

pub mod delivery;
mod preflight;
pub mod relay;
pub mod survey;

use aerotask_core::{Coordinate, ExecutorConfig, FlightMode, TaskType, TelemetrySnapshot};
use aerotask_gateway::{Acknowledged, Gateway};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ExecutorError, ValidationError};
use crate::task::FailureReason;

pub use delivery::{DeliveryExecutor, DeliveryParams};
pub use relay::{RelayExecutor, RelayParams};
pub use survey::{SurveyExecutor, SurveyParams, SurveyPlan};

/// Consecutive failed state queries tolerated while waiting on the vehicle
const MAX_QUERY_FAILURES: u32 = 3;

/// Executor lifecycle as seen through its handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorState {
    /// Spawned, not yet running
    Starting,
    /// Flying the task
    Running,
    /// Finished successfully
    Completed,
    /// Finished unsuccessfully
    Failed,
    /// Stopped on request
    Aborted,
}

/// Progress report
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExecutorStatus {
    /// Fraction of the task done (0.0 to 1.0)
    pub progress: f64,
    /// Lifecycle state
    pub state: ExecutorState,
}

impl Default for ExecutorStatus {
    fn default() -> Self {
        Self {
            progress: 0.0,
            state: ExecutorState::Starting,
        }
    }
}

/// How an executor finished
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutorOutcome {
    /// Task done
    Completed,
    /// Unrecoverable error
    Failed {
        /// Reason code
        reason: FailureReason,
        /// Detail for operators
        detail: String,
    },
    /// Stopped by cancellation
    Aborted,
}

/// Answer to an abort request
#[derive(Debug, Clone, PartialEq)]
pub enum AbortAck {
    /// Executor observed cancellation and stopped before the deadline
    Acknowledged(ExecutorOutcome),
    /// Deadline elapsed; the executor was dropped
    Forced,
}

/// Horizontal point as given in task parameters: `{"lat": .., "lon": ..}` or `[lat, lon]`
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(untagged)]
pub(crate) enum GroundPoint {
    Object { lat: f64, lon: f64 },
    Pair([f64; 2]),
}

impl GroundPoint {
    /// Validated coordinate at `alt`
    pub(crate) fn at(self, alt: f64, field: &'static str) -> Result<Coordinate, ValidationError> {
        let (lat, lon) = match self {
            GroundPoint::Object { lat, lon } => (lat, lon),
            GroundPoint::Pair([lat, lon]) => (lat, lon),
        };
        let coordinate = Coordinate::new(lat, lon, alt);
        if coordinate.is_valid() {
            Ok(coordinate)
        } else {
            Err(ValidationError::InvalidCoordinate { field })
        }
    }
}

/// Decode a parameter object
pub(crate) fn decode<T: DeserializeOwned>(parameters: &serde_json::Value) -> Result<T, ValidationError> {
    T::deserialize(parameters).map_err(|e| ValidationError::Malformed(e.to_string()))
}

/// Reject altitudes outside the configured band
pub(crate) fn check_altitude(altitude_m: f64, limits: &ExecutorConfig) -> Result<(), ValidationError> {
    if limits.altitude_in_band(altitude_m) {
        Ok(())
    } else {
        Err(ValidationError::AltitudeOutOfBand {
            altitude_m,
            min_m: limits.min_altitude_m,
            max_m: limits.max_altitude_m,
        })
    }
}

/// What an executor flies against
pub(crate) struct ExecutorContext {
    pub(crate) vehicle_id: String,
    pub(crate) gateway: Arc<Gateway>,
    pub(crate) limits: Arc<ExecutorConfig>,
    cancel: CancellationToken,
    progress: watch::Sender<ExecutorStatus>,
}

impl ExecutorContext {
    /// Stop here if cancellation was requested
    pub(crate) fn checkpoint(&self) -> Result<(), ExecutorError> {
        if self.cancel.is_cancelled() {
            Err(ExecutorError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleep, waking early on cancellation
    pub(crate) async fn pause(&self, duration: Duration) -> Result<(), ExecutorError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(ExecutorError::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    /// Issue a gateway command after a cancellation check
    pub(crate) async fn command<F>(&self, call: F) -> Result<Acknowledged, ExecutorError>
    where
        F: Future<Output = aerotask_gateway::Result<Acknowledged>>,
    {
        self.checkpoint()?;
        Ok(call.await?)
    }

    pub(crate) async fn query(&self) -> Result<TelemetrySnapshot, ExecutorError> {
        Ok(self.gateway.query_state().await?)
    }

    /// Poll vehicle state until `done` holds or `limit` elapses
    pub(crate) async fn wait_until<P>(
        &self,
        limit: Duration,
        on_timeout: FailureReason,
        what: &str,
        done: P,
    ) -> Result<TelemetrySnapshot, ExecutorError>
    where
        P: Fn(&TelemetrySnapshot) -> bool,
    {
        let deadline = Instant::now() + limit;
        let mut failures = 0;
        loop {
            self.checkpoint()?;
            match self.gateway.query_state().await {
                Ok(state) => {
                    failures = 0;
                    if done(&state) {
                        return Ok(state);
                    }
                }
                Err(e) => {
                    failures += 1;
                    if failures >= MAX_QUERY_FAILURES {
                        return Err(e.into());
                    }
                }
            }
            if Instant::now() >= deadline {
                return Err(ExecutorError::failed(
                    on_timeout,
                    format!("{what} not reached within {}s", limit.as_secs()),
                ));
            }
            self.pause(self.limits.check_interval()).await?;
        }
    }

    /// Fly to `target` and wait until within the reach tolerance
    pub(crate) async fn fly_to(&self, target: Coordinate) -> Result<TelemetrySnapshot, ExecutorError> {
        self.command(self.gateway.goto(target)).await?;
        let tolerance = self.limits.reach_tolerance_m;
        self.wait_until(
            self.limits.waypoint_timeout(),
            FailureReason::WaypointTimeout,
            "waypoint",
            |state| state.position.distance_m(&target) <= tolerance,
        )
        .await
    }

    pub(crate) fn report(&self, progress: f64) {
        self.progress.send_modify(|status| {
            status.progress = progress.clamp(0.0, 1.0);
        });
    }

    fn set_state(&self, state: ExecutorState) {
        self.progress.send_modify(|status| status.state = state);
    }

    /// Leave the vehicle holding position; best effort
    async fn hold(&self) {
        if let Err(e) = self.gateway.set_mode(FlightMode::Hold).await {
            warn!(vehicle_id = %self.vehicle_id, error = %e, "Failed to command hold");
        }
    }
}

/// Executor for one task, resolved once at assignment time
#[derive(Debug, Clone)]
pub enum Executor {
    /// Lawn-mower area survey
    Survey(SurveyExecutor),
    /// Relay position hold
    Relay(RelayExecutor),
    /// Payload delivery
    Delivery(DeliveryExecutor),
}

impl Executor {
    /// Validate parameters and plan the task. Issues no commands.
    pub fn prepare(
        task_type: TaskType,
        parameters: &serde_json::Value,
        limits: &ExecutorConfig,
    ) -> Result<Self, ValidationError> {
        match task_type {
            TaskType::Survey => Ok(Executor::Survey(SurveyExecutor::prepare(parameters, limits)?)),
            TaskType::Relay => Ok(Executor::Relay(RelayExecutor::prepare(parameters, limits)?)),
            TaskType::Delivery => Ok(Executor::Delivery(DeliveryExecutor::prepare(
                parameters, limits,
            )?)),
        }
    }

    /// Capability this executor implements
    pub fn task_type(&self) -> TaskType {
        match self {
            Executor::Survey(_) => TaskType::Survey,
            Executor::Relay(_) => TaskType::Relay,
            Executor::Delivery(_) => TaskType::Delivery,
        }
    }

    async fn run(&self, ctx: &ExecutorContext) -> Result<(), ExecutorError> {
        match self {
            Executor::Survey(e) => e.run(ctx).await,
            Executor::Relay(e) => e.run(ctx).await,
            Executor::Delivery(e) => e.run(ctx).await,
        }
    }

    /// Spawn the task against `gateway`
    pub fn start(
        self,
        vehicle_id: impl Into<String>,
        gateway: Arc<Gateway>,
        limits: Arc<ExecutorConfig>,
    ) -> ExecutorHandle {
        let cancel = CancellationToken::new();
        let (progress_tx, progress_rx) = watch::channel(ExecutorStatus::default());
        let task_type = self.task_type();
        let ctx = ExecutorContext {
            vehicle_id: vehicle_id.into(),
            gateway,
            limits,
            cancel: cancel.clone(),
            progress: progress_tx,
        };

        let join = tokio::spawn(async move {
            ctx.set_state(ExecutorState::Running);
            info!(vehicle_id = %ctx.vehicle_id, task_type = %task_type, "Executor started");

            let result = self.run(&ctx).await;
            ctx.hold().await;

            let outcome = match result {
                Ok(()) => {
                    ctx.report(1.0);
                    ctx.set_state(ExecutorState::Completed);
                    ExecutorOutcome::Completed
                }
                Err(ExecutorError::Cancelled) => {
                    ctx.set_state(ExecutorState::Aborted);
                    ExecutorOutcome::Aborted
                }
                Err(ExecutorError::Failed { reason, detail }) => {
                    ctx.set_state(ExecutorState::Failed);
                    ExecutorOutcome::Failed { reason, detail }
                }
            };
            debug!(vehicle_id = %ctx.vehicle_id, task_type = %task_type, ?outcome, "Executor finished");
            outcome
        });

        ExecutorHandle {
            task_type,
            cancel,
            progress: progress_rx,
            join,
        }
    }
}

/// Handle to a running executor.
///
/// Dropping the handle cancels and tears down the executor.
pub struct ExecutorHandle {
    task_type: TaskType,
    cancel: CancellationToken,
    progress: watch::Receiver<ExecutorStatus>,
    join: JoinHandle<ExecutorOutcome>,
}

impl std::fmt::Debug for ExecutorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorHandle")
            .field("task_type", &self.task_type)
            .field("status", &self.status())
            .finish()
    }
}

fn outcome_of(joined: Result<ExecutorOutcome, tokio::task::JoinError>) -> ExecutorOutcome {
    match joined {
        Ok(outcome) => outcome,
        Err(e) if e.is_panic() => ExecutorOutcome::Failed {
            reason: FailureReason::ExecutorFault,
            detail: "executor panicked".into(),
        },
        Err(_) => ExecutorOutcome::Aborted,
    }
}

impl ExecutorHandle {
    /// Capability being executed
    pub fn task_type(&self) -> TaskType {
        self.task_type
    }

    /// Progress and lifecycle state
    pub fn status(&self) -> ExecutorStatus {
        *self.progress.borrow()
    }

    /// Receiver for progress updates
    pub fn subscribe(&self) -> watch::Receiver<ExecutorStatus> {
        self.progress.clone()
    }

    /// Wait for the executor to finish on its own.
    ///
    /// Must not be called again once it has returned.
    pub async fn join(&mut self) -> ExecutorOutcome {
        outcome_of((&mut self.join).await)
    }

    /// Request a stop and wait up to `deadline` for it to be acknowledged.
    /// Past the deadline the executor is torn down.
    pub async fn abort(mut self, deadline: Duration) -> AbortAck {
        self.cancel.cancel();
        match tokio::time::timeout(deadline, &mut self.join).await {
            Ok(joined) => AbortAck::Acknowledged(outcome_of(joined)),
            Err(_) => {
                self.join.abort();
                AbortAck::Forced
            }
        }
    }
}

impl Drop for ExecutorHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.join.abort();
    }
}
