//! Per-vehicle control phase

use serde::{Deserialize, Serialize};

/// Vehicle control phase.
///
/// ```text
/// Idle -> Assigned -> Executing -> Switching | Completed | Failed -> Idle
///                      Executing -> Aborting -> Idle
/// ```
///
/// Only `Idle` has no executor attached; `Completed` and `Failed` collapse to
/// `Idle` as soon as the outcome is recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VehiclePhase {
    /// No task
    Idle,
    /// Task accepted, executor not yet started
    Assigned,
    /// Executor running
    Executing,
    /// Stopping the current executor to start another
    Switching,
    /// Executor finished successfully
    Completed,
    /// Executor failed
    Failed,
    /// Preemption in progress
    Aborting,
}

impl VehiclePhase {
    /// Check if transition to `next` follows the phase table
    pub fn can_transition_to(&self, next: VehiclePhase) -> bool {
        use VehiclePhase::*;
        match (self, next) {
            (Idle, Assigned) | (Idle, Aborting) => true,
            (Assigned, Executing) | (Assigned, Failed) | (Assigned, Aborting) => true,
            (Executing, Switching)
            | (Executing, Completed)
            | (Executing, Failed)
            | (Executing, Aborting) => true,
            (Switching, Idle) | (Switching, Aborting) => true,
            (Completed, Idle) | (Failed, Idle) | (Aborting, Idle) => true,
            _ => false,
        }
    }

    /// Phase with an executor attached
    pub fn has_executor(&self) -> bool {
        matches!(
            self,
            VehiclePhase::Executing | VehiclePhase::Switching | VehiclePhase::Aborting
        )
    }
}

/// Recorded phase change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseTransition {
    /// Previous phase
    pub from: VehiclePhase,
    /// New phase
    pub to: VehiclePhase,
    /// Transition time (nanoseconds since epoch)
    pub timestamp_ns: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use VehiclePhase::*;

    const ALL: [VehiclePhase; 7] = [Idle, Assigned, Executing, Switching, Completed, Failed, Aborting];

    #[test]
    fn test_nominal_path() {
        assert!(Idle.can_transition_to(Assigned));
        assert!(Assigned.can_transition_to(Executing));
        assert!(Executing.can_transition_to(Completed));
        assert!(Completed.can_transition_to(Idle));
    }

    #[test]
    fn test_abort_reachable_from_every_busy_phase() {
        for phase in [Idle, Assigned, Executing, Switching] {
            assert!(phase.can_transition_to(Aborting), "{phase:?}");
        }
        assert!(Aborting.can_transition_to(Idle));
    }

    #[test]
    fn test_no_skipping() {
        assert!(!Idle.can_transition_to(Executing));
        assert!(!Assigned.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Executing));
        for phase in ALL {
            assert!(!phase.can_transition_to(phase), "{phase:?} self-loop");
        }
    }
}
