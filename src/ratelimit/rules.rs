//! Admission rules and rule files.
//!
//! A [`Rule`] names a gate and fixes its window geometry and QPS ceiling.
//! Rules are validated once, when a gate is built from them.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use super::window::WindowShape;
use crate::error::{GateError, Result};

/// Immutable configuration of one admission gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    /// Name of the gate, used as the registry key and in logs
    pub name: String,
    /// Total length of the rolling window in milliseconds
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Number of buckets the window is split into
    #[serde(default = "default_bucket_count")]
    pub bucket_count: u32,
    /// Admitted requests per second before the gate starts rejecting
    pub limit_qps: u64,
}

fn default_interval_ms() -> u64 {
    1000
}

fn default_bucket_count() -> u32 {
    2
}

impl Default for Rule {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            interval_ms: default_interval_ms(),
            bucket_count: default_bucket_count(),
            limit_qps: 200,
        }
    }
}

impl Rule {
    /// Create a rule. Nothing is checked until [`validate`](Self::validate).
    pub fn new(
        name: impl Into<String>,
        interval_ms: u64,
        bucket_count: u32,
        limit_qps: u64,
    ) -> Self {
        Self {
            name: name.into(),
            interval_ms,
            bucket_count,
            limit_qps,
        }
    }

    /// Check the window geometry and return it.
    pub fn validate(&self) -> Result<WindowShape> {
        WindowShape::new(self.bucket_count, self.interval_ms).map_err(|e| match e {
            GateError::InvalidRule(msg) => {
                GateError::InvalidRule(format!("rule '{}': {}", self.name, msg))
            }
            other => other,
        })
    }

    /// Parse a single rule from YAML.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| GateError::Config(format!("Failed to parse rule: {}", e)))
    }
}

/// A set of rules loaded from a rule file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleSet {
    pub rules: Vec<Rule>,
}

impl RuleSet {
    /// Load rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading admission rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load rules from YAML: a single rule, a bare list, or a `rules:` map.
    /// Every rule is validated.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let document: serde_yaml::Value = serde_yaml::from_str(yaml)
            .map_err(|e| GateError::Config(format!("Failed to parse rule file: {}", e)))?;

        let has_rules_key = document
            .as_mapping()
            .map_or(false, |map| map.contains_key("rules"));

        let set = if document.is_sequence() {
            RuleSet {
                rules: serde_yaml::from_value(document)
                    .map_err(|e| GateError::Config(format!("Failed to parse rule list: {}", e)))?,
            }
        } else if has_rules_key {
            serde_yaml::from_value(document)
                .map_err(|e| GateError::Config(format!("Failed to parse rule file: {}", e)))?
        } else {
            RuleSet {
                rules: vec![serde_yaml::from_value(document)
                    .map_err(|e| GateError::Config(format!("Failed to parse rule: {}", e)))?],
            }
        };

        for rule in &set.rules {
            rule.validate()?;
        }
        Ok(set)
    }

    /// Find a rule by name.
    pub fn get(&self, name: &str) -> Option<&Rule> {
        self.rules.iter().find(|rule| rule.name == name)
    }
}
