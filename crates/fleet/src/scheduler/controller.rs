//! Per-vehicle control loop
//!
//! Every registered vehicle gets one controller task. It owns the vehicle's
//! running executor and is the only writer of the vehicle's phase, so
//! operations on one vehicle are serialized while vehicles run in parallel.
//!
//! The loop polls, in priority order: preempt requests, the running
//! executor's outcome, then queued assignments. A preempt therefore always
//! runs before any assignment that is waiting behind it.

use aerotask_core::{ExecutorConfig, SchedulerConfig};
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{PreemptReason, PreemptReport};
use crate::executor::{AbortAck, Executor, ExecutorHandle, ExecutorOutcome};
use crate::metrics::FleetMetrics;
use crate::phase::VehiclePhase;
use crate::registry::VehicleEntry;
use crate::task::{FailureReason, TaskBook, TaskStatus};

/// Accepted assignment waiting for the control loop
pub(crate) struct Assignment {
    pub(crate) task_id: String,
    pub(crate) executor: Executor,
}

/// Preempt request; `done` receives the report once the vehicle is Idle
pub(crate) struct PreemptRequest {
    pub(crate) reason: PreemptReason,
    pub(crate) done: Option<oneshot::Sender<PreemptReport>>,
}

/// Scheduler side of a control loop
pub(crate) struct ControllerHandle {
    pub(crate) assign_tx: mpsc::Sender<Assignment>,
    pub(crate) preempt_tx: mpsc::UnboundedSender<PreemptRequest>,
    pub(crate) join: JoinHandle<()>,
}

struct RunningTask {
    task_id: String,
    handle: ExecutorHandle,
}

struct Controller {
    entry: Arc<VehicleEntry>,
    tasks: Arc<TaskBook>,
    metrics: Arc<FleetMetrics>,
    config: SchedulerConfig,
    limits: Arc<ExecutorConfig>,
    shutdown: CancellationToken,
    assign_rx: mpsc::Receiver<Assignment>,
    preempt_rx: mpsc::UnboundedReceiver<PreemptRequest>,
    running: Option<RunningTask>,
}

/// Spawn the control loop for `entry`
pub(crate) fn spawn(
    entry: Arc<VehicleEntry>,
    tasks: Arc<TaskBook>,
    metrics: Arc<FleetMetrics>,
    config: SchedulerConfig,
    limits: Arc<ExecutorConfig>,
    shutdown: CancellationToken,
) -> ControllerHandle {
    let (assign_tx, assign_rx) = mpsc::channel(config.assign_queue_depth.max(1));
    let (preempt_tx, preempt_rx) = mpsc::unbounded_channel();
    let controller = Controller {
        entry,
        tasks,
        metrics,
        config,
        limits,
        shutdown,
        assign_rx,
        preempt_rx,
        running: None,
    };
    ControllerHandle {
        assign_tx,
        preempt_tx,
        join: tokio::spawn(controller.run()),
    }
}

/// Resolves when the running executor finishes; pending while none runs.
/// The finished task is taken out of `running` so it is never polled again.
async fn next_outcome(running: &mut Option<RunningTask>) -> (RunningTask, ExecutorOutcome) {
    let outcome = match running.as_mut() {
        Some(task) => task.handle.join().await,
        None => std::future::pending().await,
    };
    match running.take() {
        Some(task) => (task, outcome),
        None => std::future::pending().await,
    }
}

impl Controller {
    async fn run(mut self) {
        info!(vehicle_id = %self.entry.id(), "Control loop started");
        loop {
            tokio::select! {
                biased;

                request = self.preempt_rx.recv() => match request {
                    Some(request) => {
                        let handled = AssertUnwindSafe(self.on_preempt(request)).catch_unwind().await;
                        if handled.is_err() {
                            self.contain_fault("preempt");
                        }
                    }
                    None => break,
                },

                (task, outcome) = next_outcome(&mut self.running) => {
                    let handled = AssertUnwindSafe(self.on_outcome(task, outcome)).catch_unwind().await;
                    if handled.is_err() {
                        self.contain_fault("outcome");
                    }
                }

                assignment = self.assign_rx.recv() => match assignment {
                    Some(assignment) => {
                        let handled = AssertUnwindSafe(self.on_assign(assignment)).catch_unwind().await;
                        if handled.is_err() {
                            self.contain_fault("assign");
                        }
                    }
                    None => break,
                },
            }
        }
        self.wind_down();
        info!(vehicle_id = %self.entry.id(), "Control loop stopped");
    }

    fn vehicle_id(&self) -> &str {
        self.entry.id()
    }

    fn set_phase(&self, next: VehiclePhase) {
        if let Err(e) = self.entry.set_phase(next) {
            error!(vehicle_id = %self.vehicle_id(), error = %e, "Phase transition refused");
        }
    }

    fn finish_task(&self, task_id: &str, status: TaskStatus, reason: Option<FailureReason>, detail: Option<String>) {
        if let Err(e) = self.tasks.transition(task_id, status, reason, detail) {
            warn!(vehicle_id = %self.vehicle_id(), task_id, error = %e, "Task transition refused");
        }
    }

    /// Terminal status for a task whose executor was asked to stop
    fn record_stop(&self, task_id: &str, ack: AbortAck, reason: FailureReason, detail: &str) -> bool {
        match ack {
            AbortAck::Acknowledged(ExecutorOutcome::Completed) => {
                self.finish_task(task_id, TaskStatus::Completed, None, None);
                false
            }
            AbortAck::Acknowledged(ExecutorOutcome::Failed { reason, detail }) => {
                self.finish_task(task_id, TaskStatus::Failed, Some(reason), Some(detail));
                false
            }
            AbortAck::Acknowledged(ExecutorOutcome::Aborted) => {
                self.finish_task(task_id, TaskStatus::Aborted, Some(reason), Some(detail.to_string()));
                false
            }
            AbortAck::Forced => {
                self.metrics.forced_teardown();
                warn!(vehicle_id = %self.vehicle_id(), task_id, "Executor missed abort deadline, torn down");
                self.finish_task(
                    task_id,
                    TaskStatus::Aborted,
                    Some(reason),
                    Some(format!("{detail} (forced teardown)")),
                );
                true
            }
        }
    }

    async fn on_preempt(&mut self, request: PreemptRequest) {
        let PreemptRequest { reason, done } = request;
        let started = Instant::now();
        let deadline = self.config.preempt_deadline();

        // A cancel only stops the task it names
        if let PreemptReason::Cancelled { task_id } = &reason {
            if self.running.as_ref().map(|r| r.task_id.as_str()) != Some(task_id.as_str()) {
                debug!(vehicle_id = %self.vehicle_id(), task_id = %task_id, "Cancelled task no longer running");
                self.entry.finish_preempt();
                if let Some(done) = done {
                    let _ = done.send(PreemptReport {
                        vehicle_id: self.vehicle_id().to_string(),
                        reason: reason.clone(),
                        aborted_task: None,
                        forced: false,
                        rtl_acknowledged: false,
                        elapsed: started.elapsed(),
                    });
                }
                return;
            }
        }
        warn!(vehicle_id = %self.vehicle_id(), %reason, phase = ?self.entry.phase(), "Preempting");

        self.set_phase(VehiclePhase::Aborting);
        let mut report = PreemptReport {
            vehicle_id: self.vehicle_id().to_string(),
            reason: reason.clone(),
            aborted_task: None,
            forced: false,
            rtl_acknowledged: false,
            elapsed: Duration::ZERO,
        };

        if let Some(RunningTask { task_id, handle }) = self.running.take() {
            let ack = handle.abort(deadline).await;
            self.entry.detach_task();
            report.forced = self.record_stop(&task_id, ack, reason.failure_reason(), &reason.to_string());
            report.aborted_task = Some(task_id);
        }

        match self.entry.gateway().return_to_launch().await {
            Ok(_) => report.rtl_acknowledged = true,
            Err(e) => {
                self.metrics.rtl_failure();
                error!(vehicle_id = %self.vehicle_id(), error = %e, "Return-to-launch failed");
            }
        }

        self.set_phase(VehiclePhase::Idle);
        self.entry.finish_preempt();

        let elapsed = started.elapsed();
        self.metrics.record_preempt(elapsed);
        if elapsed > deadline {
            self.metrics.preempt_budget_violation();
            warn!(
                vehicle_id = %self.vehicle_id(),
                elapsed_ms = elapsed.as_millis() as u64,
                budget_ms = deadline.as_millis() as u64,
                "Preemption exceeded latency budget"
            );
        } else {
            info!(vehicle_id = %self.vehicle_id(), elapsed_ms = elapsed.as_millis() as u64, "Preemption complete");
        }

        report.elapsed = elapsed;
        if let Some(done) = done {
            let _ = done.send(report);
        }
    }

    async fn on_outcome(&mut self, task: RunningTask, outcome: ExecutorOutcome) {
        let RunningTask { task_id, handle } = task;
        self.tasks.set_progress(&task_id, handle.status().progress);
        drop(handle);
        self.entry.detach_task();

        match outcome {
            ExecutorOutcome::Completed => {
                info!(vehicle_id = %self.vehicle_id(), task_id = %task_id, "Task completed");
                self.finish_task(&task_id, TaskStatus::Completed, None, None);
                self.set_phase(VehiclePhase::Completed);
            }
            ExecutorOutcome::Failed { reason, detail } => {
                warn!(vehicle_id = %self.vehicle_id(), task_id = %task_id, ?reason, %detail, "Task failed");
                if reason == FailureReason::ExecutorFault {
                    self.metrics.controller_fault();
                    self.entry.mark_faulted();
                }
                self.finish_task(&task_id, TaskStatus::Failed, Some(reason), Some(detail));
                self.set_phase(VehiclePhase::Failed);
            }
            ExecutorOutcome::Aborted => {
                // Nothing asked it to stop
                warn!(vehicle_id = %self.vehicle_id(), task_id = %task_id, "Executor stopped unexpectedly");
                self.finish_task(
                    &task_id,
                    TaskStatus::Failed,
                    Some(FailureReason::ExecutorFault),
                    Some("executor stopped unexpectedly".into()),
                );
                self.set_phase(VehiclePhase::Failed);
            }
        }
        self.set_phase(VehiclePhase::Idle);
    }

    async fn on_assign(&mut self, assignment: Assignment) {
        let Assignment { task_id, executor } = assignment;
        if self.tasks.status(&task_id) != Some(TaskStatus::Pending) {
            debug!(vehicle_id = %self.vehicle_id(), task_id = %task_id, "Queued task no longer pending");
            return;
        }
        if self.shutdown.is_cancelled() {
            self.finish_task(
                &task_id,
                TaskStatus::Aborted,
                Some(FailureReason::Shutdown),
                Some("scheduler shutting down".into()),
            );
            return;
        }
        if let Some(hold) = self.entry.safety_hold() {
            self.finish_task(
                &task_id,
                TaskStatus::Failed,
                Some(FailureReason::SafetyHold),
                Some(hold.to_string()),
            );
            return;
        }

        let started = Instant::now();
        let switched = match self.running.take() {
            Some(previous) => {
                self.switch_out(previous, &task_id).await;
                true
            }
            None => false,
        };

        // Preempts that arrived during the switch run first; the queued task
        // starts afterwards unless they left the vehicle held or draining
        while let Ok(request) = self.preempt_rx.try_recv() {
            self.on_preempt(request).await;
        }
        if self.tasks.status(&task_id) != Some(TaskStatus::Pending) {
            debug!(vehicle_id = %self.vehicle_id(), task_id = %task_id, "Task cancelled during switch");
            return;
        }
        if self.shutdown.is_cancelled() {
            self.finish_task(
                &task_id,
                TaskStatus::Aborted,
                Some(FailureReason::Shutdown),
                Some("scheduler shutting down".into()),
            );
            return;
        }
        if let Some(hold) = self.entry.safety_hold() {
            self.finish_task(
                &task_id,
                TaskStatus::Aborted,
                Some(hold.failure_reason()),
                Some(hold.to_string()),
            );
            return;
        }

        self.start(task_id, executor);

        if switched {
            let elapsed = started.elapsed();
            let budget = self.config.switch_budget();
            self.metrics.record_switch(elapsed);
            if elapsed > budget {
                self.metrics.switch_budget_violation();
                warn!(
                    vehicle_id = %self.vehicle_id(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    budget_ms = budget.as_millis() as u64,
                    "Task switch exceeded latency budget"
                );
            } else {
                debug!(vehicle_id = %self.vehicle_id(), elapsed_ms = elapsed.as_millis() as u64, "Task switch complete");
            }
        }
    }

    async fn switch_out(&mut self, previous: RunningTask, next_task: &str) {
        let RunningTask { task_id, handle } = previous;
        info!(vehicle_id = %self.vehicle_id(), from = %task_id, to = next_task, "Switching task");
        if let Err(e) = self.tasks.transition(&task_id, TaskStatus::Switching, None, None) {
            warn!(vehicle_id = %self.vehicle_id(), task_id = %task_id, error = %e, "Task transition refused");
        }
        self.set_phase(VehiclePhase::Switching);

        let ack = handle.abort(self.config.switch_budget()).await;
        self.entry.detach_task();
        self.record_stop(
            &task_id,
            ack,
            FailureReason::Superseded,
            &format!("superseded by {next_task}"),
        );
        self.set_phase(VehiclePhase::Idle);
    }

    fn start(&mut self, task_id: String, executor: Executor) {
        self.set_phase(VehiclePhase::Assigned);
        if let Err(e) = self.tasks.transition(&task_id, TaskStatus::Active, None, None) {
            warn!(vehicle_id = %self.vehicle_id(), task_id = %task_id, error = %e, "Could not activate task");
            self.set_phase(VehiclePhase::Failed);
            self.set_phase(VehiclePhase::Idle);
            return;
        }

        let handle = executor.start(
            self.vehicle_id().to_string(),
            self.entry.gateway().clone(),
            self.limits.clone(),
        );
        self.entry.attach_task(task_id.clone(), handle.subscribe());
        self.set_phase(VehiclePhase::Executing);
        info!(
            vehicle_id = %self.vehicle_id(),
            task_id = %task_id,
            task_type = %handle.task_type(),
            "Task started"
        );
        self.running = Some(RunningTask { task_id, handle });
    }

    /// A handler panicked: drop the executor, fail its task, return to Idle
    fn contain_fault(&mut self, handler: &str) {
        error!(vehicle_id = %self.vehicle_id(), handler, "Control handler panicked; vehicle marked degraded");
        self.metrics.controller_fault();
        self.entry.mark_faulted();
        if let Some(RunningTask { task_id, .. }) = self.running.take() {
            self.finish_task(
                &task_id,
                TaskStatus::Failed,
                Some(FailureReason::ExecutorFault),
                Some(format!("{handler} handler panicked")),
            );
        }
        if let Some(task_id) = self.entry.current_task() {
            if self.tasks.status(&task_id).is_some_and(|s| s.is_running()) {
                self.finish_task(
                    &task_id,
                    TaskStatus::Failed,
                    Some(FailureReason::ExecutorFault),
                    Some(format!("{handler} handler panicked")),
                );
            }
        }
        self.entry.detach_task();
        self.entry.force_idle();
        self.entry.finish_preempt();
    }

    /// Channels closed: abort whatever is left
    fn wind_down(&mut self) {
        if let Some(RunningTask { task_id, .. }) = self.running.take() {
            self.finish_task(
                &task_id,
                TaskStatus::Aborted,
                Some(FailureReason::Shutdown),
                Some("control loop stopped".into()),
            );
            self.entry.detach_task();
            self.entry.force_idle();
        }
        self.assign_rx.close();
        while let Ok(Assignment { task_id, .. }) = self.assign_rx.try_recv() {
            if self.tasks.status(&task_id) == Some(TaskStatus::Pending) {
                self.finish_task(
                    &task_id,
                    TaskStatus::Aborted,
                    Some(FailureReason::Shutdown),
                    Some("control loop stopped".into()),
                );
            }
        }
    }
}
