//! Protocol errors returned by controller operations.

use thiserror::Error;

use crate::core::types::ReplState;

/// Recoverable protocol outcomes plus one fatal kind.
///
/// Everything except [`GateError::Internal`] maps onto a tool status and
/// leaves the session usable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GateError {
    #[error("{operation} is not allowed in state {state}: {reason}")]
    InvalidState {
        operation: &'static str,
        state: ReplState,
        reason: String,
    },

    #[error("code rejected by security gate: {}", .reasons.join("; "))]
    SecurityRejected {
        reasons: Vec<String>,
        matched_patterns: Vec<String>,
    },

    #[error("iteration budget exhausted ({max_iterations} of {max_iterations} used)")]
    BudgetExceeded { max_iterations: u32 },

    #[error("variable '{name}' is not defined")]
    UnknownVariable { name: String, available: Vec<String> },

    /// Session invariants were violated. The session must not be used further.
    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl GateError {
    pub(crate) fn invalid_state(operation: &'static str, state: ReplState, reason: impl Into<String>) -> Self {
        Self::InvalidState {
            operation,
            state,
            reason: reason.into(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, GateError::Internal(_))
    }
}
