//! Per-session protocol state and its persisted form.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::types::{CodeRecord, ReplState, SecurityLevel};

/// Everything the controller tracks for one session.
///
/// `pending_code`, `approved_code`, `review_token` and `review_reasons` are
/// transient: they are never persisted and only exist while a unit is moving
/// through review.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionReplState {
    pub session_id: String,
    pub state: ReplState,
    pub iteration: u32,
    pub max_iterations: u32,
    pub security_level: SecurityLevel,
    pub artifact_enabled: bool,
    pub budget_exhausted: bool,
    /// Snapshot of the interpreter namespace after the latest execution.
    pub namespace: BTreeMap<String, serde_json::Value>,
    pub code_history: Vec<CodeRecord>,
    pub pending_code: Option<String>,
    pub approved_code: Option<String>,
    pub review_token: Option<String>,
    /// Gate reasons for the unit under review, recorded with its verdict.
    pub review_reasons: Vec<String>,
    pub final_answer: Option<serde_json::Value>,
    pub last_output: String,
    pub last_error: Option<String>,
    /// Number of `submit_code` calls accepted so far.
    pub submissions: u32,
}

impl SessionReplState {
    pub fn new(
        session_id: impl Into<String>,
        max_iterations: u32,
        security_level: SecurityLevel,
        artifact_enabled: bool,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            state: ReplState::Idle,
            iteration: 0,
            max_iterations,
            security_level,
            artifact_enabled,
            budget_exhausted: false,
            namespace: BTreeMap::new(),
            code_history: Vec::new(),
            pending_code: None,
            approved_code: None,
            review_token: None,
            review_reasons: Vec::new(),
            final_answer: None,
            last_output: String::new(),
            last_error: None,
            submissions: 0,
        }
    }

    pub fn record(&self) -> SessionRecord {
        SessionRecord {
            session_id: self.session_id.clone(),
            state: self.state,
            iteration: self.iteration,
            max_iterations: self.max_iterations,
            security_level: self.security_level,
            artifact_enabled: self.artifact_enabled,
            budget_exhausted: self.budget_exhausted,
            code_history: self.code_history.clone(),
            final_answer: self.final_answer.clone(),
            namespace: self.namespace.clone(),
        }
    }
}

/// Archived per-session record (`<archive_dir>/<session_id>.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub state: ReplState,
    pub iteration: u32,
    pub max_iterations: u32,
    pub security_level: SecurityLevel,
    pub artifact_enabled: bool,
    #[serde(default)]
    pub budget_exhausted: bool,
    pub code_history: Vec<CodeRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_answer: Option<serde_json::Value>,
    pub namespace: BTreeMap<String, serde_json::Value>,
}
