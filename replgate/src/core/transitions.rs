//! Static EFSM transition table.

use crate::core::types::ReplState;

/// States reachable in one step from `from`.
///
/// `Idle -> Complete` covers both explicit final submissions and
/// auto-finalisation after the last permitted iteration.
pub fn allowed_transitions(from: ReplState) -> &'static [ReplState] {
    match from {
        ReplState::Idle => &[ReplState::CodePendingReview, ReplState::Complete],
        ReplState::CodePendingReview => &[ReplState::CodeApproved, ReplState::CodeRejected],
        ReplState::CodeApproved => &[ReplState::Executing],
        ReplState::CodeRejected => &[ReplState::CodePendingReview],
        ReplState::Executing => &[ReplState::Idle],
        ReplState::Complete => &[],
    }
}

pub fn validate_transition(from: ReplState, to: ReplState) -> Result<(), String> {
    if allowed_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(format!("transition {from} -> {to} is not allowed"))
    }
}

/// States from which a new code unit may be submitted.
pub fn accepts_submission(state: ReplState) -> bool {
    matches!(state, ReplState::Idle | ReplState::CodeRejected)
}
