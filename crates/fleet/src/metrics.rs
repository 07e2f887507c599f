//! Fleet counters and the serialisable metrics snapshot

use aerotask_gateway::{ConnectionState, GatewayStatsSnapshot};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::registry::DroneRegistry;
use crate::task::TaskBook;

/// Fleet-wide counters, updated lock-free from every control loop
#[derive(Debug, Default)]
pub struct FleetMetrics {
    tasks_assigned: AtomicU64,
    tasks_rejected: AtomicU64,
    tasks_duplicate: AtomicU64,
    switches: AtomicU64,
    switch_budget_violations: AtomicU64,
    forced_teardowns: AtomicU64,
    preemptions: AtomicU64,
    safety_preemptions: AtomicU64,
    preempt_budget_violations: AtomicU64,
    rtl_failures: AtomicU64,
    controller_faults: AtomicU64,
    telemetry_published: AtomicU64,
    telemetry_dropped: AtomicU64,
    last_switch_us: AtomicU64,
    last_preempt_us: AtomicU64,
}

macro_rules! bump {
    ($name:ident, $field:ident) => {
        pub(crate) fn $name(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }
    };
}

impl FleetMetrics {
    bump!(task_assigned, tasks_assigned);
    bump!(task_rejected, tasks_rejected);
    bump!(task_duplicate, tasks_duplicate);
    bump!(switch_budget_violation, switch_budget_violations);
    bump!(forced_teardown, forced_teardowns);
    bump!(safety_preemption, safety_preemptions);
    bump!(preempt_budget_violation, preempt_budget_violations);
    bump!(rtl_failure, rtl_failures);
    bump!(controller_fault, controller_faults);
    bump!(telemetry_published, telemetry_published);
    bump!(telemetry_dropped, telemetry_dropped);

    pub(crate) fn record_switch(&self, elapsed: Duration) {
        self.switches.fetch_add(1, Ordering::Relaxed);
        self.last_switch_us
            .store(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_preempt(&self, elapsed: Duration) {
        self.preemptions.fetch_add(1, Ordering::Relaxed);
        self.last_preempt_us
            .store(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    /// Telemetry events dropped because a sink was full or closed
    pub fn dropped_events(&self) -> u64 {
        self.telemetry_dropped.load(Ordering::Relaxed)
    }

    /// Combine counters with live registry and task book state
    pub fn snapshot(&self, registry: &DroneRegistry, tasks: &TaskBook) -> MetricsSnapshot {
        let mut gateway = GatewayStatsSnapshot::default();
        let mut vehicles_connected = 0;
        let mut vehicles_degraded = 0;
        let vehicles = registry.all();
        for entry in &vehicles {
            gateway = gateway.merge(&entry.gateway().stats());
            if entry.gateway().connection_state() == ConnectionState::Connected {
                vehicles_connected += 1;
            }
            if entry.is_degraded() {
                vehicles_degraded += 1;
            }
        }

        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            vehicles_total: vehicles.len(),
            vehicles_connected,
            vehicles_degraded,
            tasks_by_status: tasks.counts_by_status(),
            tasks_assigned: load(&self.tasks_assigned),
            tasks_rejected: load(&self.tasks_rejected),
            tasks_duplicate: load(&self.tasks_duplicate),
            switches: load(&self.switches),
            switch_budget_violations: load(&self.switch_budget_violations),
            forced_teardowns: load(&self.forced_teardowns),
            preemptions: load(&self.preemptions),
            safety_preemptions: load(&self.safety_preemptions),
            preempt_budget_violations: load(&self.preempt_budget_violations),
            rtl_failures: load(&self.rtl_failures),
            controller_faults: load(&self.controller_faults),
            telemetry_published: load(&self.telemetry_published),
            telemetry_dropped: load(&self.telemetry_dropped),
            last_switch_ms: load(&self.last_switch_us) as f64 / 1000.0,
            last_preempt_ms: load(&self.last_preempt_us) as f64 / 1000.0,
            gateway,
        }
    }
}

/// Point-in-time metrics for the reporting collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Registered vehicles
    pub vehicles_total: usize,
    /// Vehicles whose link is Connected
    pub vehicles_connected: usize,
    /// Vehicles marked degraded
    pub vehicles_degraded: usize,
    /// Task count per status name
    pub tasks_by_status: BTreeMap<String, usize>,
    /// Assignments accepted
    pub tasks_assigned: u64,
    /// Assignments rejected at assignment time
    pub tasks_rejected: u64,
    /// Assignments answered from an existing record
    pub tasks_duplicate: u64,
    /// Task switches completed
    pub switches: u64,
    /// Switches over the latency budget
    pub switch_budget_violations: u64,
    /// Executors torn down after missing an abort deadline
    pub forced_teardowns: u64,
    /// Preemptions completed
    pub preemptions: u64,
    /// Preemptions requested by the safety monitor
    pub safety_preemptions: u64,
    /// Preemptions over the deadline
    pub preempt_budget_violations: u64,
    /// Return-to-launch commands that failed
    pub rtl_failures: u64,
    /// Panics contained in control loops
    pub controller_faults: u64,
    /// Telemetry events accepted by sinks
    pub telemetry_published: u64,
    /// Telemetry events dropped
    pub telemetry_dropped: u64,
    /// Latency of the most recent switch
    pub last_switch_ms: f64,
    /// Latency of the most recent preemption
    pub last_preempt_ms: f64,
    /// Gateway counters summed over the fleet
    pub gateway: GatewayStatsSnapshot,
}
