//! Step Gate
//!
//! Pure eligibility checks for starting a pending step. Evaluated against the
//! freshly loaded step list on every call; nothing here is cached.

use crate::models::workflow::{PauseBehavior, StepStatus, VisualStatus, WorkflowStep};

/// Whether the predecessor (if any) has reached the completed bucket.
fn predecessor_done(predecessor: Option<&WorkflowStep>) -> bool {
    predecessor.map_or(true, |p| p.status.visual() == VisualStatus::Completed)
}

/// Ordering constraints shared by manual and automatic starts: the step is
/// pending, nothing else runs, and the predecessor is done.
pub fn dependencies_met(
    step: &WorkflowStep,
    predecessor: Option<&WorkflowStep>,
    any_step_running: bool,
) -> bool {
    step.status == StepStatus::Pending && !any_step_running && predecessor_done(predecessor)
}

/// Whether the user may manually start `step`.
pub fn can_start(
    step: &WorkflowStep,
    predecessor: Option<&WorkflowStep>,
    pause_behavior: PauseBehavior,
    any_step_running: bool,
) -> bool {
    if step.status != StepStatus::Pending || any_step_running {
        return false;
    }
    match pause_behavior {
        PauseBehavior::Continuous => return false,
        PauseBehavior::GatesOnly if !step.step_type.is_gate() => return false,
        PauseBehavior::GatesOnly | PauseBehavior::AutoPause => {}
    }
    predecessor_done(predecessor)
}

/// Whether `step` advances on its own, without a manual start.
pub fn auto_startable(
    step: &WorkflowStep,
    predecessor: Option<&WorkflowStep>,
    pause_behavior: PauseBehavior,
    any_step_running: bool,
) -> bool {
    let allowed = match pause_behavior {
        PauseBehavior::Continuous => true,
        PauseBehavior::GatesOnly => !step.step_type.is_gate(),
        PauseBehavior::AutoPause => false,
    };
    allowed && dependencies_met(step, predecessor, any_step_running)
}

/// Whether any step of the list is in the running family.
pub fn any_running(steps: &[WorkflowStep]) -> bool {
    steps.iter().any(|s| s.status.is_running_family())
}
