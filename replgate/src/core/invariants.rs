//! Session invariants checked after every controller operation.

use std::collections::BTreeSet;

use crate::core::session::{SessionRecord, SessionReplState};
use crate::core::types::{ReplState, VerdictStatus};

/// What the progress checks need to remember from before an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub iteration: u32,
    pub history_len: usize,
    pub namespace_keys: BTreeSet<String>,
}

impl Checkpoint {
    pub fn capture(state: &SessionReplState) -> Self {
        Self {
            iteration: state.iteration,
            history_len: state.code_history.len(),
            namespace_keys: state.namespace.keys().cloned().collect(),
        }
    }
}

/// Check state-shape invariants:
/// - `pending_code` set iff `CODE_PENDING_REVIEW`
/// - `approved_code` set iff `CODE_APPROVED` or `EXECUTING`
/// - `review_token` only while a unit is pending review
/// - `final_answer` set iff `COMPLETE`
/// - `iteration <= max_iterations`
/// - history indices strictly increasing, executed records carry outcomes
pub fn validate_invariants(state: &SessionReplState) -> Vec<String> {
    let mut errors = Vec::new();

    if state.pending_code.is_some() != (state.state == ReplState::CodePendingReview) {
        errors.push(format!(
            "pending_code presence ({}) does not match state {}",
            state.pending_code.is_some(),
            state.state
        ));
    }

    let approved_expected = matches!(state.state, ReplState::CodeApproved | ReplState::Executing);
    if state.approved_code.is_some() != approved_expected {
        errors.push(format!(
            "approved_code presence ({}) does not match state {}",
            state.approved_code.is_some(),
            state.state
        ));
    }

    if state.review_token.is_some() && state.state != ReplState::CodePendingReview {
        errors.push(format!("review_token present in state {}", state.state));
    }

    errors.extend(validate_shape(
        state.state,
        state.iteration,
        state.max_iterations,
        state.final_answer.is_some(),
    ));
    errors.extend(validate_history(&state.code_history));
    errors
}

/// Check that an operation only moved the session forward:
/// - iteration grows by at most one, and only alongside an executed record
/// - history is append-only
/// - namespace keys only accumulate
pub fn validate_progress(before: &Checkpoint, after: &SessionReplState) -> Vec<String> {
    let mut errors = Vec::new();

    if after.code_history.len() < before.history_len {
        errors.push(format!(
            "code_history shrank from {} to {}",
            before.history_len,
            after.code_history.len()
        ));
    }

    match after.iteration.checked_sub(before.iteration) {
        None => errors.push(format!(
            "iteration decreased from {} to {}",
            before.iteration, after.iteration
        )),
        Some(0) => {}
        Some(1) => {
            let executed = after
                .code_history
                .get(before.history_len..)
                .is_some_and(|added| added.len() == 1 && added[0].is_executed());
            if !executed {
                errors.push("iteration advanced without an executed record".to_string());
            }
        }
        Some(delta) => errors.push(format!("iteration advanced by {delta} in one operation")),
    }

    let missing: Vec<&String> = before
        .namespace_keys
        .iter()
        .filter(|key| !after.namespace.contains_key(*key))
        .collect();
    if !missing.is_empty() {
        errors.push(format!(
            "namespace keys disappeared: {}",
            missing.iter().map(|k| k.as_str()).collect::<Vec<_>>().join(", ")
        ));
    }

    errors
}

/// Invariants that still apply to an archived record.
pub fn validate_record(record: &SessionRecord) -> Vec<String> {
    let mut errors = validate_shape(
        record.state,
        record.iteration,
        record.max_iterations,
        record.final_answer.is_some(),
    );
    errors.extend(validate_history(&record.code_history));
    let executed = record.code_history.iter().filter(|r| r.is_executed()).count();
    if executed != record.iteration as usize {
        errors.push(format!(
            "iteration {} does not match {} executed records",
            record.iteration, executed
        ));
    }
    errors
}

fn validate_shape(state: ReplState, iteration: u32, max_iterations: u32, has_final: bool) -> Vec<String> {
    let mut errors = Vec::new();
    if has_final != (state == ReplState::Complete) {
        errors.push(format!(
            "final_answer presence ({has_final}) does not match state {state}"
        ));
    }
    if iteration > max_iterations {
        errors.push(format!(
            "iteration {iteration} exceeds max_iterations {max_iterations}"
        ));
    }
    errors
}

fn validate_history(history: &[crate::core::types::CodeRecord]) -> Vec<String> {
    let mut errors = Vec::new();
    if !history.windows(2).all(|pair| pair[0].index < pair[1].index) {
        errors.push("code_history indices must be strictly increasing".to_string());
    }
    for record in history {
        let has_outcome = record.outcome.is_some();
        let approved = record.verdict.status == VerdictStatus::Approved;
        if has_outcome != approved {
            errors.push(format!(
                "record {}: outcome presence ({has_outcome}) does not match verdict",
                record.index
            ));
        }
    }
    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{CodeRecord, ExecutionOutcome, RecordedVerdict, SecurityLevel};

    fn fresh() -> SessionReplState {
        SessionReplState::new("s", 2, SecurityLevel::None, false)
    }

    fn executed(index: u32) -> CodeRecord {
        CodeRecord {
            code: "x = 1".to_string(),
            index,
            verdict: RecordedVerdict {
                status: VerdictStatus::Approved,
                reasons: Vec::new(),
                matched_patterns: Vec::new(),
            },
            outcome: Some(ExecutionOutcome {
                stdout: String::new(),
                error: None,
            }),
            timestamp: "2026-01-01T00:00:00Z".to_string(),
        }
    }

    #[test]
    fn fresh_session_is_valid() {
        assert!(validate_invariants(&fresh()).is_empty());
    }

    #[test]
    fn pending_code_outside_review_is_reported() {
        let mut state = fresh();
        state.pending_code = Some("x".to_string());
        let errors = validate_invariants(&state);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("pending_code"));
    }

    #[test]
    fn approved_code_required_while_executing() {
        let mut state = fresh();
        state.state = ReplState::Executing;
        let errors = validate_invariants(&state);
        assert!(errors.iter().any(|e| e.contains("approved_code")));
    }

    #[test]
    fn final_answer_outside_complete_is_reported() {
        let mut state = fresh();
        state.final_answer = Some(serde_json::json!(1));
        assert!(validate_invariants(&state)[0].contains("final_answer"));
    }

    #[test]
    fn iteration_must_follow_execution() {
        let mut state = fresh();
        let before = Checkpoint::capture(&state);
        state.iteration = 1;
        let errors = validate_progress(&before, &state);
        assert!(errors[0].contains("without an executed record"));

        state.code_history.push(executed(1));
        assert!(validate_progress(&before, &state).is_empty());
    }

    #[test]
    fn namespace_keys_must_accumulate() {
        let mut state = fresh();
        state.namespace.insert("x".to_string(), serde_json::json!(1));
        let before = Checkpoint::capture(&state);
        state.namespace.clear();
        let errors = validate_progress(&before, &state);
        assert!(errors[0].contains("namespace keys disappeared: x"));
    }

    #[test]
    fn record_iteration_matches_executed_history() {
        let mut state = fresh();
        state.code_history.push(executed(1));
        let record = state.record();
        let errors = validate_record(&record);
        assert_eq!(errors, vec!["iteration 0 does not match 1 executed records".to_string()]);
    }
}
