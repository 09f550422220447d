//! Engine configuration stored under `.checkloop/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use super::write_atomic;
use crate::core::types::DEFAULT_RULE_TIMEOUT_MS;

/// Engine configuration (TOML).
///
/// This file is intended to be edited by humans. Missing fields default to the
/// values below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// `maxIterations` used when a start request does not set one.
    pub default_max_iterations: u32,

    /// Circuit-breaker threshold used when a start request does not set one.
    pub default_circuit_breaker_threshold: u32,

    /// Lifetime of session and auto checkpoints, in seconds.
    pub checkpoint_ttl_secs: u64,

    /// Lifetime of manual pause checkpoints, in seconds.
    pub pause_ttl_secs: u64,

    /// Timeout applied to rules and gates that do not set their own.
    pub default_rule_timeout_ms: u64,

    /// Truncate captured stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,

    /// Quality-gate catalog, relative to the project root.
    pub gate_catalog: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_max_iterations: 10,
            default_circuit_breaker_threshold: 3,
            checkpoint_ttl_secs: 24 * 60 * 60,
            pause_ttl_secs: 7 * 24 * 60 * 60,
            default_rule_timeout_ms: DEFAULT_RULE_TIMEOUT_MS,
            output_limit_bytes: 100_000,
            gate_catalog: PathBuf::from(".checkloop/quality-gates.json"),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.default_max_iterations == 0 {
            return Err(anyhow!("default_max_iterations must be > 0"));
        }
        if self.default_circuit_breaker_threshold == 0 {
            return Err(anyhow!("default_circuit_breaker_threshold must be > 0"));
        }
        if self.checkpoint_ttl_secs == 0 {
            return Err(anyhow!("checkpoint_ttl_secs must be > 0"));
        }
        if self.pause_ttl_secs < self.checkpoint_ttl_secs {
            return Err(anyhow!("pause_ttl_secs must be >= checkpoint_ttl_secs"));
        }
        if self.default_rule_timeout_ms == 0 {
            return Err(anyhow!("default_rule_timeout_ms must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.gate_catalog.as_os_str().is_empty() {
            return Err(anyhow!("gate_catalog must be a non-empty path"));
        }
        Ok(())
    }

    pub fn checkpoint_ttl(&self) -> chrono::Duration {
        secs(self.checkpoint_ttl_secs)
    }

    pub fn pause_ttl(&self) -> chrono::Duration {
        secs(self.pause_ttl_secs)
    }

    pub fn default_rule_timeout(&self) -> Duration {
        Duration::from_millis(self.default_rule_timeout_ms)
    }
}

fn secs(value: u64) -> chrono::Duration {
    i64::try_from(value)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .unwrap_or(chrono::Duration::MAX)
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `EngineConfig::default()`.
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    if !path.exists() {
        let cfg = EngineConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: EngineConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Write config to disk atomically.
pub fn write_config(path: &Path, cfg: &EngineConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, EngineConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("nested/config.toml");
        let cfg = EngineConfig {
            default_max_iterations: 4,
            ..EngineConfig::default()
        };
        write_config(&path, &cfg).expect("write");
        assert_eq!(load_config(&path).expect("load"), cfg);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "default_rule_timeout_ms = 1500\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.default_rule_timeout(), Duration::from_millis(1500));
        assert_eq!(cfg.default_max_iterations, 10);
    }

    #[test]
    fn rejects_pause_ttl_shorter_than_checkpoint_ttl() {
        let cfg = EngineConfig {
            pause_ttl_secs: 10,
            checkpoint_ttl_secs: 20,
            ..EngineConfig::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("pause_ttl_secs"));
    }

    #[test]
    fn rejects_zero_limits() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "output_limit_bytes = 0\n").expect("write");
        let err = load_config(&path).unwrap_err();
        assert!(format!("{err:#}").contains("output_limit_bytes"));
    }
}
