//! Gate configuration stored as TOML.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::budget;
use crate::core::types::{BudgetPolicy, SecurityLevel};
use crate::runtime::ExecutionLimits;

/// Session defaults and execution limits (TOML).
///
/// Intended to be edited by humans. Missing fields take the defaults below;
/// per-session options may override the protocol fields at session start.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GateConfig {
    /// Ceiling on executed code units per session.
    pub max_iterations: u32,

    pub security_level: SecurityLevel,

    /// Forward every terminal review cycle to the artifact sink.
    pub artifact_enabled: bool,

    pub budget_policy: BudgetPolicy,

    pub limits: LimitsConfig,

    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LimitsConfig {
    /// Evaluation steps allowed per execution.
    pub max_steps: u64,

    /// Nesting limit for `llm_query` calls.
    pub max_delegate_depth: usize,

    /// Truncate top-level stdout beyond this many bytes.
    pub output_limit_bytes: usize,

    /// Wall-clock budget per execution. Unset means no deadline.
    pub execution_timeout_ms: Option<u64>,
}

/// Where file-backed collaborators write. Unset paths disable that sink.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StorageConfig {
    pub archive_dir: Option<PathBuf>,
    pub artifact_dir: Option<PathBuf>,
    pub audit_log_path: Option<PathBuf>,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        let limits = ExecutionLimits::default();
        Self {
            max_steps: limits.max_steps,
            max_delegate_depth: limits.max_delegate_depth,
            output_limit_bytes: limits.output_limit_bytes,
            execution_timeout_ms: None,
        }
    }
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            security_level: SecurityLevel::Basic,
            artifact_enabled: false,
            budget_policy: BudgetPolicy::Block,
            limits: LimitsConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl GateConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(anyhow!("max_iterations must be > 0"));
        }
        if self.limits.max_steps == 0 {
            return Err(anyhow!("limits.max_steps must be > 0"));
        }
        if self.limits.output_limit_bytes == 0 {
            return Err(anyhow!("limits.output_limit_bytes must be > 0"));
        }
        if self.limits.execution_timeout_ms == Some(0) {
            return Err(anyhow!("limits.execution_timeout_ms must be > 0 when set"));
        }
        Ok(())
    }

    /// Limits for an execution starting now.
    pub fn execution_limits(&self) -> ExecutionLimits {
        ExecutionLimits {
            max_steps: self.limits.max_steps,
            deadline: budget::deadline_from(self.limits.execution_timeout_ms),
            max_delegate_depth: self.limits.max_delegate_depth,
            output_limit_bytes: self.limits.output_limit_bytes,
        }
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `GateConfig::default()`.
pub fn load_config(path: &Path) -> Result<GateConfig> {
    if !path.exists() {
        let cfg = GateConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: GateConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &GateConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    super::write_atomic(path, &buf, "toml.tmp")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, GateConfig::default());
        assert_eq!(cfg.max_iterations, 20);
        assert_eq!(cfg.limits.max_delegate_depth, 4);
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("nested/gate.toml");
        let cfg = GateConfig {
            security_level: SecurityLevel::Strict,
            budget_policy: BudgetPolicy::AutoFinalize,
            limits: LimitsConfig {
                execution_timeout_ms: Some(2_000),
                ..LimitsConfig::default()
            },
            storage: StorageConfig {
                archive_dir: Some(PathBuf::from("archive")),
                ..StorageConfig::default()
            },
            ..GateConfig::default()
        };
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("gate.toml");
        fs::write(&path, "security_level = \"none\"\n\n[limits]\nmax_steps = 50\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.security_level, SecurityLevel::None);
        assert_eq!(cfg.limits.max_steps, 50);
        assert_eq!(cfg.limits.output_limit_bytes, 100_000);
        assert_eq!(cfg.max_iterations, 20);
    }

    #[test]
    fn zero_iterations_is_invalid() {
        let cfg = GateConfig {
            max_iterations: 0,
            ..GateConfig::default()
        };
        let err = cfg.validate().expect_err("invalid");
        assert!(err.to_string().contains("max_iterations"));
    }

    #[test]
    fn execution_limits_carry_deadline() {
        let mut cfg = GateConfig::default();
        assert!(cfg.execution_limits().deadline.is_none());
        cfg.limits.execution_timeout_ms = Some(1_000);
        assert!(cfg.execution_limits().deadline.is_some());
    }
}
