//! Test-only helpers: scripted delegates, recording sinks and tool builders.

use std::sync::Arc;

use anyhow::{Result, anyhow};
use parking_lot::Mutex;
use tempfile::TempDir;

use crate::core::types::{CodeRecord, ExecutionResult, SecurityLevel};
use crate::io::artifacts::ArtifactSink;
use crate::io::config::GateConfig;
use crate::runtime::{Delegate, DelegateRequest, DelegateScope};
use crate::tools::ReplTools;

/// One observed delegate call.
#[derive(Debug, Clone)]
pub struct DelegateCall {
    pub request: DelegateRequest,
    /// Result of the scripted nested unit, when one was configured.
    pub nested: Option<ExecutionResult>,
    /// Everything the scope captured at its depth before returning.
    pub captured: String,
}

/// Delegate that optionally runs a code unit inside its scope, then answers
/// with a fixed finding.
pub struct ScriptedDelegate {
    code: Option<String>,
    finding: String,
    calls: Mutex<Vec<DelegateCall>>,
}

impl ScriptedDelegate {
    pub fn answering(finding: &str) -> Self {
        Self {
            code: None,
            finding: finding.to_string(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn running(code: &str, finding: &str) -> Self {
        Self {
            code: Some(code.to_string()),
            ..Self::answering(finding)
        }
    }

    pub fn calls(&self) -> Vec<DelegateCall> {
        self.calls.lock().clone()
    }
}

impl Delegate for ScriptedDelegate {
    fn query(&self, request: &DelegateRequest, scope: &mut DelegateScope<'_>) -> Result<String> {
        let nested = self.code.as_deref().map(|code| scope.execute(code));
        self.calls.lock().push(DelegateCall {
            request: request.clone(),
            nested,
            captured: scope.output().to_string(),
        });
        Ok(format!("{} (about: {})", self.finding, request.question))
    }
}

/// Delegate that always fails.
pub struct FailingDelegate;

impl Delegate for FailingDelegate {
    fn query(&self, _request: &DelegateRequest, _scope: &mut DelegateScope<'_>) -> Result<String> {
        Err(anyhow!("upstream unavailable"))
    }
}

/// Artifact sink that keeps every stored record.
#[derive(Default)]
pub struct RecordingArtifacts {
    records: Mutex<Vec<(String, CodeRecord)>>,
}

impl RecordingArtifacts {
    pub fn records(&self) -> Vec<(String, CodeRecord)> {
        self.records.lock().clone()
    }
}

impl ArtifactSink for RecordingArtifacts {
    fn store(&self, session_id: &str, record: &CodeRecord) {
        self.records
            .lock()
            .push((session_id.to_string(), record.clone()));
    }
}

/// Default config with the given level and budget.
pub fn config(security_level: SecurityLevel, max_iterations: u32) -> GateConfig {
    GateConfig {
        max_iterations,
        security_level,
        ..GateConfig::default()
    }
}

/// In-memory tools with one open session named `session_id`.
pub fn tools_with_session(session_id: &str, security_level: SecurityLevel, max_iterations: u32) -> ReplTools {
    let tools = ReplTools::new(config(security_level, max_iterations));
    tools
        .open_session(session_id, Default::default())
        .expect("open session");
    tools
}

/// Tools whose config archives, audits and stores artifacts under a temp dir.
pub fn tools_with_storage(security_level: SecurityLevel, max_iterations: u32) -> (TempDir, ReplTools) {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut cfg = config(security_level, max_iterations);
    cfg.artifact_enabled = true;
    cfg.storage.archive_dir = Some(temp.path().join("archive"));
    cfg.storage.artifact_dir = Some(temp.path().join("artifacts"));
    cfg.storage.audit_log_path = Some(temp.path().join("audit.jsonl"));
    let tools = ReplTools::from_config(cfg).expect("tools from config");
    (temp, tools)
}

/// Wrap a delegate for `ReplTools::with_delegate` while keeping a handle.
pub fn shared<D: Delegate + 'static>(delegate: D) -> (Arc<D>, Arc<dyn Delegate>) {
    let delegate = Arc::new(delegate);
    let erased: Arc<dyn Delegate> = delegate.clone();
    (delegate, erased)
}
