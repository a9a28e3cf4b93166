//! Command result evaluation.
//!
//! Telemetry reports one [`ActionState`] per action the robot knows about.
//! [`evaluate`] folds a batch of them into a [`Verdict`]:
//!
//! | Input | Verdict |
//! |---|---|
//! | empty | [`Verdict::InProgress`] |
//! | any action `FAILED` | [`Verdict::Failure`] |
//! | every action `FINISHED` | [`Verdict::Success`] |
//! | otherwise | [`Verdict::InProgress`] |
//!
//! Failure is checked first and wins over everything else.
//!
//! # Example
//!
//! ```
//! use fleetlink_kernel::evaluator::evaluate;
//! use fleetlink_types::{ActionState, ActionStatus, Verdict};
//!
//! let states = vec![
//!     ActionState::new("pick", ActionStatus::Finished),
//!     ActionState::new("drop", ActionStatus::Running),
//! ];
//! assert_eq!(evaluate(&states), Verdict::InProgress);
//! ```

use fleetlink_types::{ActionState, ActionStatus, Verdict};

pub fn evaluate(states: &[ActionState]) -> Verdict {
    evaluate_iter(states.iter())
}

pub(crate) fn evaluate_iter<'a>(mut states: impl Iterator<Item = &'a ActionState> + Clone) -> Verdict {
    let mut seen = false;
    for state in states.clone() {
        seen = true;
        if state.action_status == ActionStatus::Failed {
            return Verdict::Failure;
        }
    }
    if !seen {
        return Verdict::InProgress;
    }
    if states.all(|s| s.action_status == ActionStatus::Finished) {
        Verdict::Success
    } else {
        Verdict::InProgress
    }
}

/// Human-readable reason for a failed batch: the first failed action's
/// result description, or its id when the robot gave none.
pub fn failure_reason<'a>(states: impl IntoIterator<Item = &'a ActionState>) -> Option<String> {
    states
        .into_iter()
        .find(|s| s.action_status == ActionStatus::Failed)
        .map(|s| match &s.result_description {
            Some(description) if !description.is_empty() => {
                format!("action {} failed: {description}", s.action_id)
            }
            _ => format!("action {} failed", s.action_id),
        })
}
