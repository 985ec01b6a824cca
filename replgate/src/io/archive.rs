//! Session archive: one JSON record per finished session.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow};
use jsonschema::{Validator, validator_for};
use serde_json::Value;
use tracing::debug;

use crate::core::invariants::validate_record;
use crate::core::session::SessionRecord;

const SESSION_RECORD_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/../schemas/session_record/v1.schema.json"
));

static VALIDATOR: LazyLock<Result<Validator, String>> = LazyLock::new(|| {
    let schema: Value = serde_json::from_str(SESSION_RECORD_SCHEMA).map_err(|err| err.to_string())?;
    validator_for(&schema).map_err(|err| err.to_string())
});

/// `<archive_dir>/<session_id>.json`
pub fn record_path(archive_dir: &Path, session_id: &str) -> PathBuf {
    archive_dir.join(format!("{session_id}.json"))
}

/// Atomically write the record (temp file + rename). Returns the final path.
pub fn write_session_record(archive_dir: &Path, record: &SessionRecord) -> Result<PathBuf> {
    let path = record_path(archive_dir, &record.session_id);
    debug!(path = %path.display(), session_id = %record.session_id, state = %record.state, "archiving session");
    let mut buf = serde_json::to_string_pretty(record).context("serialize session record")?;
    buf.push('\n');
    super::write_atomic(&path, &buf, "json.tmp")?;
    Ok(path)
}

/// Load an archived record, validating schema and invariants.
pub fn load_session_record(path: &Path) -> Result<SessionRecord> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("read session record {}", path.display()))?;
    let value: Value = serde_json::from_str(&contents)
        .with_context(|| format!("parse session record {}", path.display()))?;
    validate_schema(&value)?;
    let record: SessionRecord = serde_json::from_value(value)
        .with_context(|| format!("deserialize session record {}", path.display()))?;
    let errors = validate_record(&record);
    if !errors.is_empty() {
        return Err(anyhow!(
            "session record invariants failed: {}",
            errors.join("; ")
        ));
    }
    Ok(record)
}

fn validate_schema(record: &Value) -> Result<()> {
    let compiled = VALIDATOR
        .as_ref()
        .map_err(|err| anyhow!("invalid session record schema: {err}"))?;
    if !compiled.is_valid(record) {
        let messages = compiled
            .iter_errors(record)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        return Err(anyhow!(
            "session record schema validation failed: {}",
            messages.join("; ")
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::session::SessionReplState;
    use crate::core::types::{
        CodeRecord, ExecutionOutcome, RecordedVerdict, ReplState, SecurityLevel, VerdictStatus,
    };

    fn finished_record() -> SessionRecord {
        let mut state = SessionReplState::new("s-42", 5, SecurityLevel::Basic, true);
        state.code_history.push(CodeRecord {
            code: "x = 1 + 1".to_string(),
            index: 1,
            verdict: RecordedVerdict {
                status: VerdictStatus::Approved,
                reasons: vec!["no banned patterns matched".to_string()],
                matched_patterns: Vec::new(),
            },
            outcome: Some(ExecutionOutcome {
                stdout: String::new(),
                error: None,
            }),
            timestamp: "2026-10-19T08:00:00+00:00".to_string(),
        });
        state.iteration = 1;
        state.namespace.insert("x".to_string(), serde_json::json!(2));
        state.state = ReplState::Complete;
        state.final_answer = Some(serde_json::json!(2));
        state.record()
    }

    /// Verifies write then load preserves the record.
    #[test]
    fn archive_round_trip() {
        let temp = tempfile::tempdir().expect("tempdir");
        let record = finished_record();
        let path = write_session_record(temp.path(), &record).expect("write");
        assert_eq!(path, temp.path().join("s-42.json"));
        assert!(!temp.path().join("s-42.json.tmp").exists());

        let loaded = load_session_record(&path).expect("load");
        assert_eq!(loaded, record);
    }

    #[test]
    fn schema_rejects_unknown_state() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = write_session_record(temp.path(), &finished_record()).expect("write");
        let tampered = fs::read_to_string(&path)
            .expect("read")
            .replace("\"complete\"", "\"exploded\"");
        fs::write(&path, tampered).expect("write tampered");

        let err = load_session_record(&path).expect_err("must fail");
        assert!(
            err.to_string().contains("schema validation failed"),
            "{err:#}"
        );
    }

    #[test]
    fn invariants_checked_after_schema() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut record = finished_record();
        record.final_answer = None;
        let path = write_session_record(temp.path(), &record).expect("write");

        let err = load_session_record(&path).expect_err("must fail");
        assert!(err.to_string().contains("invariants failed"), "{err:#}");
    }
}
