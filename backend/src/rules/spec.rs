//! Declarative rule documents: parsing, defaulting, validation.
//!
//! Both the legacy (`id`, `mode`) and canonical (`rule_id`, `category`)
//! schemas are accepted; normalization folds them into the canonical form.

use super::metrics::Selector;
use super::RuleError;
use gatekeeper_shared::Event;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Superset of attributes supported by policy rule YAML.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RuleSpec {
    pub rule_id: String,
    #[serde(rename = "id", skip_serializing_if = "String::is_empty")]
    pub legacy_id: String,
    pub name: String,
    pub category: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub mode: String,
    pub canary: bool,
    pub severity: String,
    pub version: u32,
    pub description: String,
    #[serde(skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub inputs_schema: Vec<InputField>,
    pub expr: String,
    #[serde(skip_serializing_if = "Selector::is_empty")]
    pub metrics_selector: Selector,
    pub on_match: DecisionBlock,
    pub notify: NotifyBlock,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub owners: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub docs_url: String,
    /// Deny-fail-closed vs notify-fail-open on provider errors. Absent means
    /// the evaluator surfaces the error to the caller.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_on_error: Option<bool>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tests: Vec<RuleTest>,
}

/// Documents an individual attribute required by the rule.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct InputField {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
}

/// What to emit when the rule expression evaluates to true.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DecisionBlock {
    pub decision: String,
    pub reason: String,
    #[serde(skip_serializing_if = "serde_json::Map::is_empty")]
    pub details: serde_json::Map<String, serde_json::Value>,
}

/// Downstream notification routing for the rule.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NotifyBlock {
    pub channels: Vec<String>,
}

/// A single example/test case embedded in the rule document.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RuleTest {
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub guid: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub fixture: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub window: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub series: Option<Vec<Event>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<Event>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub want: Option<serde_json::Value>,
}

/// Load a rule spec from disk and normalize it.
pub fn load_rule_yaml(path: impl AsRef<Path>) -> Result<RuleSpec, RuleError> {
    let path = path.as_ref();
    let display = path.display().to_string();
    let raw = std::fs::read_to_string(path).map_err(|source| RuleError::Load {
        path: display.clone(),
        source,
    })?;
    let mut spec: RuleSpec = serde_yaml::from_str(&raw).map_err(|source| RuleError::Yaml {
        path: display.clone(),
        source,
    })?;
    spec.normalize();
    spec.validate(&display)?;
    Ok(spec)
}

/// Parse a rule spec from an in-memory YAML document.
pub fn parse_rule_yaml(raw: &str) -> Result<RuleSpec, RuleError> {
    let mut spec: RuleSpec = serde_yaml::from_str(raw).map_err(|source| RuleError::Yaml {
        path: "<inline>".to_string(),
        source,
    })?;
    spec.normalize();
    spec.validate("<inline>")?;
    Ok(spec)
}

impl RuleSpec {
    /// Fold legacy keys and metadata fallbacks into the canonical fields.
    /// Normalization is a fixed point: applying it twice changes nothing.
    pub fn normalize(&mut self) {
        if self.rule_id.is_empty() {
            self.rule_id = std::mem::take(&mut self.legacy_id);
        } else {
            self.legacy_id.clear();
        }

        if self.name.is_empty() {
            if let Some(summary) = self.metadata_str("summary") {
                self.name = summary;
            } else if let Some(desc) = self.metadata_str("description") {
                self.name = desc;
            } else {
                self.name = self.rule_id.clone();
            }
        }

        if self.category.is_empty() {
            if !self.mode.is_empty() {
                self.category = self.mode.to_lowercase();
            } else if !self.on_match.decision.is_empty() {
                self.category = "enforce".to_string();
            }
        }
        self.category = self.category.to_lowercase();
        self.mode.clear();

        if self.description.is_empty() {
            if let Some(desc) = self.metadata_str("description") {
                self.description = desc;
            }
        }
        if self.severity.is_empty() {
            if let Some(sev) = self.metadata_str("severity") {
                self.severity = sev;
            }
        }
        self.severity = self.severity.to_lowercase();

        if self.version == 0 {
            self.version = self
                .metadata
                .get("version")
                .and_then(|v| v.as_u64())
                .map(|v| v as u32)
                .filter(|v| *v > 0)
                .unwrap_or(1);
        }

        if self.owners.is_empty() {
            if let Some(owners) = self.metadata.get("owners").and_then(|v| v.as_array()) {
                self.owners = owners
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect();
            }
        }

        if self.on_match.decision.is_empty() {
            self.on_match.decision = if self.category == "enforce" {
                "deny".to_string()
            } else {
                "notify".to_string()
            };
        }
        if self.on_match.reason.is_empty() {
            self.on_match.reason = self.rule_id.clone();
        }
    }

    fn validate(&self, path: &str) -> Result<(), RuleError> {
        if self.rule_id.is_empty() {
            return Err(RuleError::MissingId {
                path: path.to_string(),
            });
        }
        if self.expr.is_empty() {
            return Err(RuleError::MissingExpr {
                rule_id: self.rule_id.clone(),
            });
        }
        if !matches!(self.on_match.decision.as_str(), "allow" | "deny" | "notify") {
            return Err(RuleError::BadDecision {
                rule_id: self.rule_id.clone(),
                decision: self.on_match.decision.clone(),
            });
        }
        Ok(())
    }

    fn metadata_str(&self, key: &str) -> Option<String> {
        self.metadata
            .get(key)
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }
}
