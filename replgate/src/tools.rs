//! Tool-facing surface used by the orchestrating process.
//!
//! Calls are keyed by session id. Each call locks its session, drives the
//! [`Controller`], records the exchange in the audit log and answers with a
//! structured status. Only an unknown session or a fatal invariant violation
//! is returned as `Err`.

use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use serde_json::json;
use tracing::{error, info, warn};

use crate::controller::{Controller, Review, now_rfc3339};
use crate::core::budget;
use crate::core::session::{SessionRecord, SessionReplState};
use crate::core::types::{ErrorKind, ExecutionResult, ReplState, SecurityLevel};
use crate::core::security::SecurityGate;
use crate::error::GateError;
use crate::io::archive::write_session_record;
use crate::io::artifacts::{ArtifactSink, FsArtifactSink};
use crate::io::audit::{AuditEntry, AuditLog, JsonlAuditLog};
use crate::io::config::GateConfig;
use crate::runtime::{Delegate, Interpreter};
use crate::store::{SessionSlot, StateStore};

/// Characters of `last_output` reported by `get_repl_state`.
const OUTPUT_PREVIEW_CHARS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Success,
    Rejected,
    /// The unit ran but raised a runtime fault.
    Error,
    InvalidState,
    BudgetExceeded,
    UnknownVariable,
    PendingApproval,
}

/// Per-session overrides of the configured defaults.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub max_iterations: Option<u32>,
    pub security_level: Option<SecurityLevel>,
    pub artifact_enabled: Option<bool>,
    /// Bound as `context` before the first execution.
    pub context: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecuteResponse {
    pub status: ToolStatus,
    pub state: ReplState,
    pub iteration: u32,
    pub stdout: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub reasons: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub matched_patterns: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub review_token: Option<String>,
    pub variables: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<u64>,
    /// Set when the budget policy finalized the session.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_answer: Option<serde_json::Value>,
}

impl ExecuteResponse {
    fn base(status: ToolStatus, slot: &SessionSlot) -> Self {
        Self {
            status,
            state: slot.state.state,
            iteration: slot.state.iteration,
            stdout: String::new(),
            error: None,
            error_kind: None,
            message: None,
            reasons: Vec::new(),
            matched_patterns: Vec::new(),
            review_token: None,
            variables: slot.interpreter.variable_names(),
            execution_time_ms: None,
            final_answer: slot.state.final_answer.clone(),
        }
    }

    fn executed(result: ExecutionResult, slot: &SessionSlot) -> Self {
        let status = match result.error {
            Some(_) => ToolStatus::Error,
            None => ToolStatus::Success,
        };
        Self {
            stdout: result.stdout,
            error_kind: result.error.as_ref().map(|fault| fault.kind),
            error: result.error.map(|fault| fault.to_string()),
            execution_time_ms: Some(result.duration_ms),
            ..Self::base(status, slot)
        }
    }

    fn refused(err: GateError, slot: &SessionSlot) -> Result<Self> {
        let status = refusal_status(&err)?;
        let message = Some(err.to_string());
        let (reasons, matched_patterns) = match err {
            GateError::SecurityRejected {
                reasons,
                matched_patterns,
            } => (reasons, matched_patterns),
            _ => (Vec::new(), Vec::new()),
        };
        Ok(Self {
            message,
            reasons,
            matched_patterns,
            ..Self::base(status, slot)
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RejectResponse {
    pub status: ToolStatus,
    pub state: ReplState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FinalAnswerResponse {
    pub status: ToolStatus,
    pub state: ReplState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FinalVariableResponse {
    pub status: ToolStatus,
    pub state: ReplState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_value: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub available_variables: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplStateResponse {
    pub state: ReplState,
    pub iteration: u32,
    pub max_iterations: u32,
    pub remaining_iterations: u32,
    pub history_length: usize,
    pub security_level: SecurityLevel,
    pub variables: Vec<String>,
    pub last_output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub budget_exhausted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_answer: Option<serde_json::Value>,
}

/// Multi-session front end over the controller.
pub struct ReplTools {
    store: StateStore,
    controller: Controller,
    delegate: Option<Arc<dyn Delegate>>,
    audit: Option<Arc<dyn AuditLog>>,
}

impl ReplTools {
    /// In-memory tools: no archive, artifact or audit sinks.
    pub fn new(config: GateConfig) -> Self {
        Self {
            store: StateStore::new(),
            controller: Controller::new(config),
            delegate: None,
            audit: None,
        }
    }

    /// Validate `config` and wire the file-backed sinks it names.
    pub fn from_config(config: GateConfig) -> Result<Self> {
        config.validate()?;
        let artifact_dir = config.storage.artifact_dir.clone();
        let audit_log_path = config.storage.audit_log_path.clone();
        let mut tools = Self::new(config);
        if let Some(dir) = artifact_dir {
            let sink = FsArtifactSink::new(dir).context("create artifact sink")?;
            tools = tools.with_artifacts(Arc::new(sink));
        }
        if let Some(path) = audit_log_path {
            tools = tools.with_audit(Arc::new(JsonlAuditLog::open(&path)?));
        }
        Ok(tools)
    }

    pub fn with_delegate(mut self, delegate: Arc<dyn Delegate>) -> Self {
        self.delegate = Some(delegate);
        self
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn with_artifacts(mut self, sink: Arc<dyn ArtifactSink>) -> Self {
        self.controller = self.controller.with_artifacts(sink);
        self
    }

    pub fn with_gate(mut self, gate: Arc<dyn SecurityGate>) -> Self {
        self.controller = self.controller.with_gate(gate);
        self
    }

    pub fn config(&self) -> &GateConfig {
        self.controller.config()
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.store.session_ids()
    }

    pub fn open_session(&self, session_id: &str, options: SessionOptions) -> Result<()> {
        let config = self.controller.config();
        let max_iterations = options.max_iterations.unwrap_or(config.max_iterations);
        if max_iterations == 0 {
            return Err(anyhow!("max_iterations must be > 0"));
        }
        let state = SessionReplState::new(
            session_id,
            max_iterations,
            options.security_level.unwrap_or(config.security_level),
            options.artifact_enabled.unwrap_or(config.artifact_enabled),
        );
        let mut interpreter = Interpreter::new(self.delegate.clone());
        if let Some(context) = &options.context {
            interpreter = interpreter.with_context(context);
        }
        info!(
            session_id,
            max_iterations,
            security_level = ?state.security_level,
            "session opened"
        );
        self.store.insert(SessionSlot::new(state, interpreter))
    }

    /// Remove the session and archive its record when an archive directory
    /// is configured.
    pub fn close_session(&self, session_id: &str) -> Result<SessionRecord> {
        let handle = self
            .store
            .remove(session_id)
            .ok_or_else(|| unknown_session(session_id))?;
        let record = handle.lock().state.record();
        if let Some(dir) = &self.controller.config().storage.archive_dir {
            let path = write_session_record(dir, &record)
                .with_context(|| format!("archive session '{session_id}'"))?;
            info!(session_id, path = %path.display(), "session archived");
        }
        Ok(record)
    }

    pub fn session_record(&self, session_id: &str) -> Result<SessionRecord> {
        self.with_session(session_id, |slot| Ok(slot.state.record()))
    }

    /// Submit a unit for review and, unless review is deferred, run it.
    pub fn execute_code(&self, session_id: &str, code: &str) -> Result<ExecuteResponse> {
        let response = self.with_session(session_id, |slot| {
            match self.controller.submit_code(slot, code) {
                Ok(Review::Approved(_)) => self.run_approved(slot),
                Ok(Review::PendingApproval { token }) => Ok(ExecuteResponse {
                    review_token: Some(token),
                    message: Some("awaiting approve_code or reject_code".to_string()),
                    ..ExecuteResponse::base(ToolStatus::PendingApproval, slot)
                }),
                Err(err) => ExecuteResponse::refused(err, slot),
            }
        });
        self.audited(session_id, "execute_code", json!({ "code": code }), response)
    }

    /// Approve the pending unit with its review token and run it.
    pub fn approve_code(&self, session_id: &str, token: &str) -> Result<ExecuteResponse> {
        let response = self.with_session(session_id, |slot| {
            match self.controller.approve(slot, token) {
                Ok(()) => self.run_approved(slot),
                Err(err) => ExecuteResponse::refused(err, slot),
            }
        });
        self.audited(session_id, "approve_code", json!({ "token": token }), response)
    }

    pub fn reject_code(&self, session_id: &str, reason: &str) -> Result<RejectResponse> {
        let response = self.with_session(session_id, |slot| {
            let (status, message) = match self.controller.reject(slot, reason) {
                Ok(()) => (ToolStatus::Rejected, None),
                Err(err) => (refusal_status(&err)?, Some(err.to_string())),
            };
            let reason = match status {
                ToolStatus::Rejected => slot
                    .state
                    .code_history
                    .last()
                    .and_then(|record| record.verdict.reasons.first().cloned()),
                _ => None,
            };
            Ok(RejectResponse {
                status,
                state: slot.state.state,
                reason,
                message,
            })
        });
        self.audited(session_id, "reject_code", json!({ "reason": reason }), response)
    }

    pub fn submit_final_answer(
        &self,
        session_id: &str,
        answer: serde_json::Value,
    ) -> Result<FinalAnswerResponse> {
        let request = json!({ "answer": answer });
        let response = self.with_session(session_id, |slot| {
            let (status, message) = match self.controller.submit_final_answer(slot, answer) {
                Ok(()) => (ToolStatus::Success, None),
                Err(err) => (refusal_status(&err)?, Some(err.to_string())),
            };
            Ok(FinalAnswerResponse {
                status,
                state: slot.state.state,
                message,
            })
        });
        self.audited(session_id, "submit_final_answer", request, response)
    }

    pub fn submit_final_variable(
        &self,
        session_id: &str,
        name: &str,
    ) -> Result<FinalVariableResponse> {
        let response = self.with_session(session_id, |slot| {
            let mut response = FinalVariableResponse {
                status: ToolStatus::Success,
                state: slot.state.state,
                resolved_value: None,
                available_variables: Vec::new(),
                message: None,
            };
            match self.controller.submit_final_variable(slot, name) {
                Ok(value) => response.resolved_value = Some(value),
                Err(err) => {
                    response.status = refusal_status(&err)?;
                    response.message = Some(err.to_string());
                    if let GateError::UnknownVariable { available, .. } = err {
                        response.available_variables = available;
                    }
                }
            }
            response.state = slot.state.state;
            Ok(response)
        });
        self.audited(session_id, "submit_final_variable", json!({ "name": name }), response)
    }

    pub fn get_repl_state(&self, session_id: &str) -> Result<ReplStateResponse> {
        let response = self.with_session(session_id, |slot| {
            let state = &slot.state;
            Ok(ReplStateResponse {
                state: state.state,
                iteration: state.iteration,
                max_iterations: state.max_iterations,
                remaining_iterations: budget::remaining_iterations(state.iteration, state.max_iterations),
                history_length: state.code_history.len(),
                security_level: state.security_level,
                variables: slot.interpreter.variable_names(),
                last_output: preview(&state.last_output),
                last_error: state.last_error.clone(),
                budget_exhausted: state.budget_exhausted,
                final_answer: state.final_answer.clone(),
            })
        });
        self.audited(session_id, "get_repl_state", json!({}), response)
    }

    fn run_approved(&self, slot: &mut SessionSlot) -> Result<ExecuteResponse> {
        match self.controller.execute(slot) {
            Ok(result) => Ok(ExecuteResponse::executed(result, slot)),
            Err(err) => ExecuteResponse::refused(err, slot),
        }
    }

    fn with_session<T>(
        &self,
        session_id: &str,
        op: impl FnOnce(&mut SessionSlot) -> Result<T>,
    ) -> Result<T> {
        let handle = self
            .store
            .get(session_id)
            .ok_or_else(|| unknown_session(session_id))?;
        let mut slot = handle.lock();
        op(&mut slot)
    }

    /// Record a tool call and its outcome, then hand the outcome back.
    ///
    /// Calls that end in an error are recorded with an `error` response.
    fn audited<T: Serialize>(
        &self,
        session_id: &str,
        operation: &str,
        request: serde_json::Value,
        outcome: Result<T>,
    ) -> Result<T> {
        let Some(audit) = &self.audit else {
            return outcome;
        };
        let response = match &outcome {
            Ok(response) => serde_json::to_value(response)
                .inspect_err(|err| warn!(operation, %err, "audit response could not be serialized"))
                .ok(),
            Err(err) => Some(json!({ "error": format!("{err:#}") })),
        };
        if let Some(response) = response {
            audit.record(&AuditEntry {
                timestamp: now_rfc3339(),
                session_id: session_id.to_string(),
                operation: operation.to_string(),
                request,
                response,
            });
        }
        outcome
    }
}

/// Tool status for a recoverable error; fatal errors propagate.
fn refusal_status(err: &GateError) -> Result<ToolStatus> {
    let status = match err {
        GateError::InvalidState { .. } => ToolStatus::InvalidState,
        GateError::SecurityRejected { .. } => ToolStatus::Rejected,
        GateError::BudgetExceeded { .. } => ToolStatus::BudgetExceeded,
        GateError::UnknownVariable { .. } => ToolStatus::UnknownVariable,
        GateError::Internal(message) => {
            error!(%message, "session corrupted; refusing to answer");
            return Err(anyhow::Error::new(err.clone()));
        }
    };
    Ok(status)
}

fn unknown_session(session_id: &str) -> anyhow::Error {
    anyhow!("unknown session '{session_id}'")
}

fn preview(text: &str) -> String {
    match text.char_indices().nth(OUTPUT_PREVIEW_CHARS) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}
