//! Shared deterministic types for the gate core.
//!
//! These types define stable contracts between the controller, the security
//! gate and the interpreter. They carry no I/O and serialize with stable,
//! lowercase tags so persisted session records stay readable.

use std::fmt;

use serde::{Deserialize, Serialize};

/// EFSM state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplState {
    Idle,
    CodePendingReview,
    CodeApproved,
    CodeRejected,
    Executing,
    Complete,
}

impl ReplState {
    pub fn as_str(self) -> &'static str {
        match self {
            ReplState::Idle => "IDLE",
            ReplState::CodePendingReview => "CODE_PENDING_REVIEW",
            ReplState::CodeApproved => "CODE_APPROVED",
            ReplState::CodeRejected => "CODE_REJECTED",
            ReplState::Executing => "EXECUTING",
            ReplState::Complete => "COMPLETE",
        }
    }
}

impl fmt::Display for ReplState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Strictness applied by the security gate. Fixed for the life of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityLevel {
    /// Every unit is approved.
    None,
    /// Units are scanned against the banned-pattern catalogue.
    #[default]
    Basic,
    /// Units are only parsed; approval comes from an explicit external call.
    Strict,
}

/// What happens once the last permitted iteration has executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetPolicy {
    /// Further submissions fail with `budget_exceeded`; the orchestrator must
    /// still submit a final answer.
    #[default]
    Block,
    /// The last execution's stdout becomes the final answer.
    AutoFinalize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Approve,
    Reject,
    /// Well-formed but awaiting an explicit approve/reject call.
    Defer,
}

/// Output of the security gate for one code unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityVerdict {
    pub decision: Decision,
    pub reasons: Vec<String>,
    /// Identifiers of matched catalogue patterns, in catalogue order.
    pub matched_patterns: Vec<String>,
}

impl SecurityVerdict {
    pub fn approve(reason: impl Into<String>) -> Self {
        Self {
            decision: Decision::Approve,
            reasons: vec![reason.into()],
            matched_patterns: Vec::new(),
        }
    }

    pub fn reject(reasons: Vec<String>, matched_patterns: Vec<String>) -> Self {
        Self {
            decision: Decision::Reject,
            reasons,
            matched_patterns,
        }
    }

    pub fn defer(reason: impl Into<String>) -> Self {
        Self {
            decision: Decision::Defer,
            reasons: vec![reason.into()],
            matched_patterns: Vec::new(),
        }
    }
}

/// Classification of a runtime fault raised while executing a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NameError,
    TypeError,
    ZeroDivision,
    IndexError,
    ValueError,
    SyntaxError,
    /// Step budget or wall-clock deadline exceeded; bindings are discarded.
    Timeout,
    /// A panic caught at the execution boundary.
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::NameError => "name_error",
            ErrorKind::TypeError => "type_error",
            ErrorKind::ZeroDivision => "zero_division",
            ErrorKind::IndexError => "index_error",
            ErrorKind::ValueError => "value_error",
            ErrorKind::SyntaxError => "syntax_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Internal => "internal",
        }
    }
}

/// Runtime fault converted at the execution boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeFault {
    pub kind: ErrorKind,
    pub message: String,
}

impl RuntimeFault {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for RuntimeFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

/// Keys touched by one execution. Bindings are never removed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceDiff {
    pub added: Vec<String>,
    pub changed: Vec<String>,
}

/// Result of running a single code unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub stdout: String,
    pub error: Option<RuntimeFault>,
    pub diff: NamespaceDiff,
    pub duration_ms: u64,
}

/// Terminal verdict stored in the code history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerdictStatus {
    Approved,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedVerdict {
    pub status: VerdictStatus,
    pub reasons: Vec<String>,
    pub matched_patterns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub stdout: String,
    pub error: Option<RuntimeFault>,
}

/// One review cycle that reached a terminal verdict.
///
/// Approved records always carry an outcome; rejected records never do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeRecord {
    pub code: String,
    /// 1-based submission counter within the session.
    pub index: u32,
    pub verdict: RecordedVerdict,
    pub outcome: Option<ExecutionOutcome>,
    /// RFC 3339, UTC.
    pub timestamp: String,
}

impl CodeRecord {
    pub fn is_executed(&self) -> bool {
        self.verdict.status == VerdictStatus::Approved && self.outcome.is_some()
    }
}
