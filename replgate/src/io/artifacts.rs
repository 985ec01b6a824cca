//! Artifact sink for reviewed code units.
//!
//! Every unit that reaches a terminal verdict (executed or rejected) can be
//! forwarded here. Sinks are fire-and-forget: failures are logged and never
//! affect the protocol.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use tracing::{debug, warn};

use crate::core::types::{CodeRecord, VerdictStatus};

const ARTIFACT_TEMPLATE: &str = include_str!("templates/artifact.txt");

pub trait ArtifactSink: Send + Sync {
    fn store(&self, session_id: &str, record: &CodeRecord);
}

/// Writes `<root>/<session_id>/repl_code_NNNN.txt` per record.
pub struct FsArtifactSink {
    root: PathBuf,
    env: Environment<'static>,
}

impl FsArtifactSink {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("artifact.txt", ARTIFACT_TEMPLATE)
            .context("load artifact template")?;
        Ok(Self {
            root: root.into(),
            env,
        })
    }

    pub fn artifact_path(&self, session_id: &str, index: u32) -> PathBuf {
        self.root
            .join(session_id)
            .join(format!("repl_code_{index:04}.txt"))
    }

    pub fn render(&self, session_id: &str, record: &CodeRecord) -> Result<String> {
        let template = self.env.get_template("artifact.txt")?;
        let verdict = match record.verdict.status {
            VerdictStatus::Approved => "approved",
            VerdictStatus::Rejected => "rejected",
        };
        let mut rendered = template.render(context! {
            session_id => session_id,
            index => record.index,
            verdict => verdict,
            timestamp => &record.timestamp,
            reasons => &record.verdict.reasons,
            matched_patterns => &record.verdict.matched_patterns,
            code => record.code.trim_end(),
            outcome => &record.outcome,
        })?;
        rendered.push('\n');
        Ok(rendered)
    }

    fn write(&self, session_id: &str, record: &CodeRecord) -> Result<PathBuf> {
        let rendered = self.render(session_id, record)?;
        let path = self.artifact_path(session_id, record.index);
        write_file(&path, &rendered)?;
        Ok(path)
    }
}

impl ArtifactSink for FsArtifactSink {
    fn store(&self, session_id: &str, record: &CodeRecord) {
        match self.write(session_id, record) {
            Ok(path) => debug!(path = %path.display(), session_id, index = record.index, "artifact written"),
            Err(err) => warn!(session_id, index = record.index, error = %format!("{err:#}"), "artifact write failed"),
        }
    }
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    }
    fs::write(path, contents).with_context(|| format!("write artifact {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{ErrorKind, ExecutionOutcome, RecordedVerdict, RuntimeFault};

    fn record(status: VerdictStatus, outcome: Option<ExecutionOutcome>) -> CodeRecord {
        CodeRecord {
            code: "x = 1 / 0\n".to_string(),
            index: 7,
            verdict: RecordedVerdict {
                status,
                reasons: vec!["checked".to_string()],
                matched_patterns: Vec::new(),
            },
            outcome,
            timestamp: "2026-10-19T08:00:00+00:00".to_string(),
        }
    }

    #[test]
    fn executed_record_renders_outcome() {
        let sink = FsArtifactSink::new("unused").expect("sink");
        let rendered = sink
            .render(
                "s-1",
                &record(
                    VerdictStatus::Approved,
                    Some(ExecutionOutcome {
                        stdout: "partial".to_string(),
                        error: Some(RuntimeFault::new(ErrorKind::ZeroDivision, "division by zero")),
                    }),
                ),
            )
            .expect("render");
        assert!(rendered.starts_with("# session: s-1\n# submission: 7\n# verdict: approved\n"));
        assert!(rendered.contains("# reason: checked"));
        assert!(rendered.contains("\nx = 1 / 0\n"));
        assert!(rendered.contains("# ---- stdout ----\npartial"));
        assert!(rendered.contains("# zero_division: division by zero"));
    }

    #[test]
    fn rejected_record_has_no_outcome_section() {
        let sink = FsArtifactSink::new("unused").expect("sink");
        let mut rejected = record(VerdictStatus::Rejected, None);
        rejected.verdict.matched_patterns = vec!["process.spawn".to_string(), "net.access".to_string()];
        let rendered = sink.render("s-1", &rejected).expect("render");
        assert!(rendered.contains("# verdict: rejected"));
        assert!(rendered.contains("# matched: process.spawn, net.access"));
        assert!(!rendered.contains("stdout"));
    }

    #[test]
    fn store_writes_numbered_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let sink = FsArtifactSink::new(temp.path()).expect("sink");
        sink.store("s-9", &record(VerdictStatus::Rejected, None));
        let path = temp.path().join("s-9").join("repl_code_0007.txt");
        let contents = fs::read_to_string(path).expect("artifact exists");
        assert!(contents.contains("x = 1 / 0"));
    }
}
