//! Project quality-gate catalog loading (schema + invariants).

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use jsonschema::validator_for;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::invariants::is_valid_id;
use crate::core::types::{RuleKind, ValidationRule};
use crate::error::EngineError;

const GATE_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/../schemas/quality_gates/v1.schema.json"
));

/// One named project-level command check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub command: String,
    #[serde(default)]
    pub expected_exit_code: i32,
    /// Milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

impl GateDefinition {
    /// Gates execute through the same machinery as validation rules.
    pub fn to_rule(&self) -> ValidationRule {
        ValidationRule {
            kind: RuleKind::Command,
            name: self.name.clone(),
            command: self.command.clone(),
            expected_exit_code: self.expected_exit_code,
            timeout_ms: self.timeout,
            working_directory: self.working_directory.clone(),
            env: self.env.clone(),
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateCatalog {
    pub version: String,
    #[serde(default)]
    pub default_gates: Vec<String>,
    #[serde(default)]
    pub gates: BTreeMap<String, GateDefinition>,
}

impl Default for GateCatalog {
    fn default() -> Self {
        Self {
            version: "1".to_string(),
            default_gates: Vec::new(),
            gates: BTreeMap::new(),
        }
    }
}

impl GateCatalog {
    /// Look up gates by name, in the order given, skipping disabled ones.
    ///
    /// An unknown name fails before anything runs.
    pub fn resolve(&self, names: &[String]) -> Result<Vec<&GateDefinition>> {
        let mut resolved = Vec::with_capacity(names.len());
        for name in names {
            let gate = self.gates.get(name).ok_or_else(|| {
                EngineError::ConfigError(format!(
                    "unknown quality gate '{name}'; define it in the catalog or remove it from the task's quality gates"
                ))
            })?;
            if gate.enabled {
                resolved.push(gate);
            }
        }
        Ok(resolved)
    }
}

/// Load the catalog at `path`. A missing file is an empty catalog.
pub fn load_gate_catalog(path: &Path) -> Result<GateCatalog> {
    if !path.exists() {
        return Ok(GateCatalog::default());
    }
    let contents = fs::read_to_string(path)
        .with_context(|| format!("read gate catalog {}", path.display()))?;
    parse_gate_catalog(&contents).with_context(|| format!("load gate catalog {}", path.display()))
}

pub fn parse_gate_catalog(contents: &str) -> Result<GateCatalog> {
    let value: Value = serde_json::from_str(contents)
        .map_err(|err| EngineError::ConfigError(format!("catalog is not valid JSON: {err}")))?;
    validate_schema(&value)?;
    let catalog: GateCatalog = serde_json::from_value(value).context("deserialize gate catalog")?;
    let errors = validate_catalog_invariants(&catalog);
    if !errors.is_empty() {
        return Err(EngineError::ConfigError(format!(
            "catalog invariants failed: {}",
            errors.join("; ")
        ))
        .into());
    }
    Ok(catalog)
}

fn validate_schema(catalog: &Value) -> Result<()> {
    let schema_value: Value = serde_json::from_str(GATE_SCHEMA).context("parse gate schema")?;
    let compiled =
        validator_for(&schema_value).map_err(|err| anyhow!("invalid schema: {}", err))?;
    if !compiled.is_valid(catalog) {
        let messages = compiled
            .iter_errors(catalog)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        return Err(EngineError::ConfigError(format!(
            "catalog schema validation failed: {}",
            messages.join("; ")
        ))
        .into());
    }
    Ok(())
}

fn validate_catalog_invariants(catalog: &GateCatalog) -> Vec<String> {
    let mut errors = Vec::new();
    for (key, gate) in &catalog.gates {
        if key != &gate.name {
            errors.push(format!("gate key '{key}' does not match name '{}'", gate.name));
        }
        if !is_valid_id(key) {
            errors.push(format!("gate name '{key}' must match [A-Za-z0-9][A-Za-z0-9._-]*"));
        }
    }
    let mut seen = HashSet::new();
    for name in &catalog.default_gates {
        if !catalog.gates.contains_key(name) {
            errors.push(format!("default gate '{name}' is not defined"));
        }
        if !seen.insert(name.as_str()) {
            errors.push(format!("default gate '{name}' listed twice"));
        }
    }
    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::engine_error;

    const CATALOG: &str = r#"{
        "version": "1",
        "defaultGates": ["tests"],
        "gates": {
            "tests": { "name": "tests", "description": "unit tests", "command": "cargo test" },
            "lint": { "name": "lint", "command": "cargo clippy", "timeout": 60000, "enabled": false }
        }
    }"#;

    #[test]
    fn parses_valid_catalog() {
        let catalog = parse_gate_catalog(CATALOG).expect("parse");
        assert_eq!(catalog.default_gates, vec!["tests"]);
        let lint = &catalog.gates["lint"];
        assert_eq!(lint.timeout, Some(60_000));
        assert!(!lint.enabled);
        assert_eq!(lint.to_rule().timeout_ms, Some(60_000));
    }

    #[test]
    fn missing_file_is_empty_catalog() {
        let temp = tempfile::tempdir().expect("tempdir");
        let catalog = load_gate_catalog(&temp.path().join("none.json")).expect("load");
        assert!(catalog.gates.is_empty());
        assert!(catalog.default_gates.is_empty());
    }

    #[test]
    fn schema_rejects_unknown_fields() {
        let err = parse_gate_catalog(r#"{"version":"1","gates":{},"extra":true}"#).unwrap_err();
        assert!(matches!(engine_error(&err), Some(EngineError::ConfigError(_))));
    }

    #[test]
    fn invariants_catch_key_mismatch_and_missing_default() {
        let raw = r#"{
            "version": "1",
            "defaultGates": ["build"],
            "gates": { "tests": { "name": "unit", "command": "true" } }
        }"#;
        let err = parse_gate_catalog(raw).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("does not match name"));
        assert!(msg.contains("default gate 'build' is not defined"));
    }

    #[test]
    fn resolve_rejects_unknown_and_skips_disabled_gates() {
        let catalog = parse_gate_catalog(CATALOG).expect("parse");
        let err = catalog.resolve(&["missing".to_string()]).unwrap_err();
        assert!(err.to_string().contains("unknown quality gate 'missing'"));
        let gates = catalog
            .resolve(&["lint".to_string(), "tests".to_string()])
            .expect("resolve");
        assert_eq!(gates.len(), 1);
        assert_eq!(gates[0].command, "cargo test");
    }
}
