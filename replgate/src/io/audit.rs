//! Audit log of tool calls and their responses.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// One tool call as seen by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// RFC 3339, UTC.
    pub timestamp: String,
    pub session_id: String,
    pub operation: String,
    pub request: serde_json::Value,
    pub response: serde_json::Value,
}

/// Fire-and-forget audit sink.
pub trait AuditLog: Send + Sync {
    fn record(&self, entry: &AuditEntry);
}

/// Appends one JSON object per line.
pub struct JsonlAuditLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlAuditLog {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open audit log {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, entry: &AuditEntry) -> Result<()> {
        let mut line = serde_json::to_string(entry).context("serialize audit entry")?;
        line.push('\n');
        let mut file = self.file.lock();
        file.write_all(line.as_bytes())
            .with_context(|| format!("append audit log {}", self.path.display()))?;
        Ok(())
    }
}

impl AuditLog for JsonlAuditLog {
    fn record(&self, entry: &AuditEntry) {
        if let Err(err) = self.append(entry) {
            warn!(operation = %entry.operation, error = %format!("{err:#}"), "audit write failed");
        }
    }
}

/// Keeps entries in memory; useful for embedding and tests.
#[derive(Default)]
pub struct MemoryAuditLog {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().clone()
    }
}

impl AuditLog for MemoryAuditLog {
    fn record(&self, entry: &AuditEntry) {
        self.entries.lock().push(entry.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(operation: &str) -> AuditEntry {
        AuditEntry {
            timestamp: "2026-10-19T08:00:00+00:00".to_string(),
            session_id: "s-1".to_string(),
            operation: operation.to_string(),
            request: json!({"code": "x = 1"}),
            response: json!({"status": "success"}),
        }
    }

    #[test]
    fn jsonl_appends_one_line_per_entry() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("logs/audit.jsonl");
        let log = JsonlAuditLog::open(&path).expect("open");
        log.record(&entry("execute_code"));
        log.record(&entry("get_repl_state"));

        let contents = fs::read_to_string(&path).expect("read");
        let lines: Vec<AuditEntry> = contents
            .lines()
            .map(|line| serde_json::from_str(line).expect("valid json line"))
            .collect();
        assert_eq!(lines, vec![entry("execute_code"), entry("get_repl_state")]);
    }

    #[test]
    fn reopening_appends() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("audit.jsonl");
        JsonlAuditLog::open(&path).expect("open").record(&entry("a"));
        JsonlAuditLog::open(&path).expect("reopen").record(&entry("b"));
        assert_eq!(fs::read_to_string(&path).expect("read").lines().count(), 2);
    }

    #[test]
    fn memory_log_keeps_order() {
        let log = MemoryAuditLog::new();
        log.record(&entry("first"));
        log.record(&entry("second"));
        let ops: Vec<String> = log.entries().into_iter().map(|e| e.operation).collect();
        assert_eq!(ops, vec!["first", "second"]);
    }
}
