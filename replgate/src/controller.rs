//! EFSM controller: drives one session through review, execution and
//! completion.
//!
//! Every operation takes the session's [`SessionSlot`] explicitly, validates
//! each transition against the static table and re-checks the session
//! invariants before returning. An invariant violation is the only fatal
//! outcome and surfaces as [`GateError::Internal`].

use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::{debug, error, info, instrument, warn};

use crate::core::budget;
use crate::core::invariants::{Checkpoint, validate_invariants, validate_progress};
use crate::core::security::{PatternGate, SecurityGate};
use crate::core::session::SessionReplState;
use crate::core::transitions::{accepts_submission, validate_transition};
use crate::core::types::{
    BudgetPolicy, CodeRecord, Decision, ExecutionOutcome, ExecutionResult, RecordedVerdict,
    ReplState, SecurityLevel, SecurityVerdict, VerdictStatus,
};
use crate::error::GateError;
use crate::io::artifacts::ArtifactSink;
use crate::io::config::GateConfig;
use crate::lang::{Value, clean_variable_name};
use crate::store::SessionSlot;

/// Outcome of a submission that was not rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Review {
    /// The unit is in `CODE_APPROVED` and may be executed.
    Approved(SecurityVerdict),
    /// STRICT review: the unit waits for `approve(token)` or `reject(reason)`.
    PendingApproval { token: String },
}

pub struct Controller {
    gate: Arc<dyn SecurityGate>,
    artifacts: Option<Arc<dyn ArtifactSink>>,
    config: GateConfig,
}

impl Controller {
    pub fn new(config: GateConfig) -> Self {
        Self {
            gate: Arc::new(PatternGate),
            artifacts: None,
            config,
        }
    }

    pub fn with_gate(mut self, gate: Arc<dyn SecurityGate>) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_artifacts(mut self, sink: Arc<dyn ArtifactSink>) -> Self {
        self.artifacts = Some(sink);
        self
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    /// `IDLE | CODE_REJECTED -> CODE_PENDING_REVIEW`, then let the gate decide.
    ///
    /// Rejections are returned as [`GateError::SecurityRejected`] after the
    /// session has moved to `CODE_REJECTED` and the record was appended.
    #[instrument(skip_all, fields(session_id = %slot.state.session_id, state = %slot.state.state, iteration = slot.state.iteration))]
    pub fn submit_code(&self, slot: &mut SessionSlot, code: &str) -> Result<Review, GateError> {
        self.guarded(slot, |this, slot| this.submit_inner(&mut slot.state, code))
    }

    /// STRICT approval. The token must match the one issued at submission.
    #[instrument(skip_all, fields(session_id = %slot.state.session_id, state = %slot.state.state))]
    pub fn approve(&self, slot: &mut SessionSlot, token: &str) -> Result<(), GateError> {
        self.guarded(slot, |_, slot| {
            let state = &mut slot.state;
            if state.state != ReplState::CodePendingReview {
                return Err(GateError::invalid_state("approve", state.state, "no unit is pending review"));
            }
            if state.review_token.as_deref() != Some(token) {
                warn!(session_id = %state.session_id, "review token mismatch");
                return Err(GateError::invalid_state("approve", state.state, "token mismatch"));
            }
            transition(state, ReplState::CodeApproved)?;
            state.approved_code = state.pending_code.take();
            state.review_token = None;
            state.review_reasons = vec!["approved by reviewer".to_string()];
            info!(session_id = %state.session_id, index = state.submissions, "unit approved by reviewer");
            Ok(())
        })
    }

    /// STRICT rejection: `CODE_PENDING_REVIEW -> CODE_REJECTED`.
    #[instrument(skip_all, fields(session_id = %slot.state.session_id, state = %slot.state.state))]
    pub fn reject(&self, slot: &mut SessionSlot, reason: &str) -> Result<(), GateError> {
        self.guarded(slot, |this, slot| {
            let state = &mut slot.state;
            if state.state != ReplState::CodePendingReview {
                return Err(GateError::invalid_state("reject", state.state, "no unit is pending review"));
            }
            let reason = match reason.trim() {
                "" => "rejected by reviewer".to_string(),
                text => format!("rejected by reviewer: {text}"),
            };
            this.close_rejected(state, vec![reason], Vec::new())
        })
    }

    /// `CODE_APPROVED -> EXECUTING -> IDLE`, appending the executed record.
    ///
    /// Runtime faults are part of the returned result, not errors.
    #[instrument(skip_all, fields(session_id = %slot.state.session_id, state = %slot.state.state, iteration = slot.state.iteration))]
    pub fn execute(&self, slot: &mut SessionSlot) -> Result<ExecutionResult, GateError> {
        self.guarded(slot, |this, slot| this.execute_inner(slot))
    }

    #[instrument(skip_all, fields(session_id = %slot.state.session_id, state = %slot.state.state))]
    pub fn submit_final_answer(
        &self,
        slot: &mut SessionSlot,
        answer: serde_json::Value,
    ) -> Result<(), GateError> {
        self.guarded(slot, |_, slot| complete(&mut slot.state, "submit_final_answer", answer))
    }

    /// Resolve a binding and make it the final answer.
    #[instrument(skip_all, fields(session_id = %slot.state.session_id, state = %slot.state.state))]
    pub fn submit_final_variable(
        &self,
        slot: &mut SessionSlot,
        name: &str,
    ) -> Result<serde_json::Value, GateError> {
        self.guarded(slot, |_, slot| {
            if slot.state.state != ReplState::Idle {
                return Err(GateError::invalid_state(
                    "submit_final_variable",
                    slot.state.state,
                    "final answers are accepted only in IDLE",
                ));
            }
            let name = clean_variable_name(name);
            let resolved = match slot.interpreter.lookup(name) {
                Some(Value::Capability(_)) | None => {
                    return Err(GateError::UnknownVariable {
                        name: name.to_string(),
                        available: slot.interpreter.variable_names(),
                    });
                }
                Some(value) => value.to_json(),
            };
            complete(&mut slot.state, "submit_final_variable", resolved.clone())?;
            Ok(resolved)
        })
    }

    fn guarded<T>(
        &self,
        slot: &mut SessionSlot,
        op: impl FnOnce(&Self, &mut SessionSlot) -> Result<T, GateError>,
    ) -> Result<T, GateError> {
        let before = Checkpoint::capture(&slot.state);
        let result = op(self, slot);
        enforce_invariants(&before, &slot.state)?;
        result
    }

    fn submit_inner(&self, state: &mut SessionReplState, code: &str) -> Result<Review, GateError> {
        if !accepts_submission(state.state) {
            return Err(GateError::invalid_state(
                "submit_code",
                state.state,
                "a unit is already under review or the session is complete",
            ));
        }
        if !budget::has_budget(state.iteration, state.max_iterations) {
            warn!(session_id = %state.session_id, max_iterations = state.max_iterations, "submission refused; budget exhausted");
            return Err(GateError::BudgetExceeded {
                max_iterations: state.max_iterations,
            });
        }

        transition(state, ReplState::CodePendingReview)?;
        state.submissions += 1;
        state.pending_code = Some(code.to_string());

        let verdict = self.gate.evaluate(code, state.security_level);
        let decision = match (state.security_level, verdict.decision) {
            (SecurityLevel::Strict, Decision::Approve) => Decision::Defer,
            (_, decision) => decision,
        };
        debug!(session_id = %state.session_id, index = state.submissions, ?decision, "gate verdict");

        match decision {
            Decision::Approve => {
                transition(state, ReplState::CodeApproved)?;
                state.approved_code = state.pending_code.take();
                state.review_reasons = verdict.reasons.clone();
                Ok(Review::Approved(verdict))
            }
            Decision::Reject => {
                self.close_rejected(state, verdict.reasons.clone(), verdict.matched_patterns.clone())?;
                Err(GateError::SecurityRejected {
                    reasons: verdict.reasons,
                    matched_patterns: verdict.matched_patterns,
                })
            }
            Decision::Defer => {
                let token = review_token(&state.session_id, state.submissions, code);
                state.review_token = Some(token.clone());
                state.review_reasons = verdict.reasons;
                info!(session_id = %state.session_id, index = state.submissions, "unit awaiting explicit review");
                Ok(Review::PendingApproval { token })
            }
        }
    }

    fn close_rejected(
        &self,
        state: &mut SessionReplState,
        reasons: Vec<String>,
        matched_patterns: Vec<String>,
    ) -> Result<(), GateError> {
        transition(state, ReplState::CodeRejected)?;
        let code = state
            .pending_code
            .take()
            .ok_or_else(|| GateError::Internal("rejected unit has no pending code".to_string()))?;
        state.review_token = None;
        state.review_reasons.clear();
        info!(session_id = %state.session_id, index = state.submissions, ?matched_patterns, "unit rejected");
        let record = CodeRecord {
            code,
            index: state.submissions,
            verdict: RecordedVerdict {
                status: VerdictStatus::Rejected,
                reasons,
                matched_patterns,
            },
            outcome: None,
            timestamp: now_rfc3339(),
        };
        self.append_record(state, record);
        Ok(())
    }

    fn execute_inner(&self, slot: &mut SessionSlot) -> Result<ExecutionResult, GateError> {
        let state = &mut slot.state;
        if state.state != ReplState::CodeApproved {
            return Err(GateError::invalid_state("execute", state.state, "no approved unit to run"));
        }
        transition(state, ReplState::Executing)?;
        let code = state
            .approved_code
            .clone()
            .ok_or_else(|| GateError::Internal("approved unit missing while executing".to_string()))?;

        let limits = self.config.execution_limits();
        let result = slot.interpreter.execute(&code, &limits);

        let state = &mut slot.state;
        let record = CodeRecord {
            code,
            index: state.submissions,
            verdict: RecordedVerdict {
                status: VerdictStatus::Approved,
                reasons: std::mem::take(&mut state.review_reasons),
                matched_patterns: Vec::new(),
            },
            outcome: Some(ExecutionOutcome {
                stdout: result.stdout.clone(),
                error: result.error.clone(),
            }),
            timestamp: now_rfc3339(),
        };
        self.append_record(state, record);
        state.iteration += 1;
        state.approved_code = None;
        state.namespace = slot.interpreter.snapshot();
        state.last_output = result.stdout.clone();
        state.last_error = result.error.as_ref().map(ToString::to_string);
        transition(state, ReplState::Idle)?;
        info!(
            session_id = %state.session_id,
            iteration = state.iteration,
            error = ?result.error.as_ref().map(|e| e.kind),
            duration_ms = result.duration_ms,
            "unit executed"
        );

        if !budget::has_budget(state.iteration, state.max_iterations) {
            state.budget_exhausted = true;
            warn!(session_id = %state.session_id, max_iterations = state.max_iterations, "iteration budget exhausted");
            if self.config.budget_policy == BudgetPolicy::AutoFinalize {
                let answer = auto_final_answer(state);
                complete(state, "auto_finalize", answer)?;
            }
        }
        Ok(result)
    }

    fn append_record(&self, state: &mut SessionReplState, record: CodeRecord) {
        if state.artifact_enabled {
            if let Some(sink) = &self.artifacts {
                sink.store(&state.session_id, &record);
            }
        }
        state.code_history.push(record);
    }
}

/// `IDLE -> COMPLETE` with `answer` as the final answer.
fn complete(
    state: &mut SessionReplState,
    operation: &'static str,
    answer: serde_json::Value,
) -> Result<(), GateError> {
    if state.state != ReplState::Idle {
        return Err(GateError::invalid_state(
            operation,
            state.state,
            "final answers are accepted only in IDLE",
        ));
    }
    transition(state, ReplState::Complete)?;
    state.final_answer = Some(answer);
    info!(session_id = %state.session_id, iteration = state.iteration, operation, "session complete");
    Ok(())
}

/// Final answer synthesized when the budget runs out under `AutoFinalize`.
fn auto_final_answer(state: &SessionReplState) -> serde_json::Value {
    let output = state.last_output.trim();
    let text = match (&state.last_error, output.is_empty()) {
        (Some(error), true) => error.clone(),
        _ => output.to_string(),
    };
    serde_json::Value::String(text)
}

fn transition(state: &mut SessionReplState, to: ReplState) -> Result<(), GateError> {
    validate_transition(state.state, to).map_err(GateError::Internal)?;
    debug!(session_id = %state.session_id, from = %state.state, %to, "transition");
    state.state = to;
    Ok(())
}

fn enforce_invariants(before: &Checkpoint, state: &SessionReplState) -> Result<(), GateError> {
    let mut errors = validate_invariants(state);
    errors.extend(validate_progress(before, state));
    if errors.is_empty() {
        return Ok(());
    }
    let message = errors.join("; ");
    error!(session_id = %state.session_id, state = %state.state, %message, "session invariants violated");
    Err(GateError::Internal(message))
}

/// `hex(sha256(len(session_id) ‖ session_id ‖ submission_index ‖ code))`
///
/// The length prefix keeps the id from bleeding into the index bytes.
pub fn review_token(session_id: &str, submission_index: u32, code: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update((session_id.len() as u64).to_be_bytes());
    hasher.update(session_id.as_bytes());
    hasher.update(submission_index.to_be_bytes());
    hasher.update(code.as_bytes());
    hex::encode(hasher.finalize())
}

pub(crate) fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}
