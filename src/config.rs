//! Configuration management for qpsgate.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{GateError, Result};
use crate::ratelimit::{Rule, RuleSet};

/// Prefix of environment variables that override file settings,
/// e.g. `QPSGATE__LOGGING__LEVEL=debug`.
const ENV_PREFIX: &str = "QPSGATE";

/// Main configuration for qpsgate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QpsGateConfig {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Admission rules
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Load driver configuration
    #[serde(default)]
    pub load: LoadConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON log lines
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Rule sources.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Path to a separate rule file
    pub rules_path: Option<String>,

    /// Rules declared inline
    #[serde(default)]
    pub rules: Vec<Rule>,
}

/// Settings of the load driver binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadConfig {
    /// Number of concurrent callers
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// How long to drive load, in seconds
    #[serde(default = "default_duration_secs")]
    pub duration_secs: u64,

    /// Upper bound of the simulated work per admitted request
    #[serde(default = "default_max_work_ms")]
    pub max_work_ms: u64,

    /// Interval between statistics reports
    #[serde(default = "default_report_interval_ms")]
    pub report_interval_ms: u64,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            duration_secs: default_duration_secs(),
            max_work_ms: default_max_work_ms(),
            report_interval_ms: default_report_interval_ms(),
        }
    }
}

fn default_workers() -> usize {
    100
}

fn default_duration_secs() -> u64 {
    30
}

fn default_max_work_ms() -> u64 {
    50
}

fn default_report_interval_ms() -> u64 {
    1000
}

impl QpsGateConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: QpsGateConfig =
            serde_yaml::from_str(yaml).map_err(|e| GateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Layer an optional config file under `QPSGATE__*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path).required(true));
        }
        let config: QpsGateConfig = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| GateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Inline rules followed by the rules of `rules_path`, if set.
    pub fn all_rules(&self) -> Result<Vec<Rule>> {
        let mut rules = self.rate_limiting.rules.clone();
        if let Some(path) = &self.rate_limiting.rules_path {
            rules.extend(RuleSet::from_file(path)?.rules);
        }
        Ok(rules)
    }

    fn validate(&self) -> Result<()> {
        for rule in &self.rate_limiting.rules {
            rule.validate()?;
        }
        if self.load.report_interval_ms == 0 {
            return Err(GateError::Config(
                "load.report_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = QpsGateConfig::default();
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.json);
        assert!(config.rate_limiting.rules.is_empty());
        assert_eq!(config.load.workers, 100);
        assert_eq!(config.load.duration_secs, 30);
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
logging:
  level: debug
  json: true
rate_limiting:
  rules:
    - name: rule1
      interval_ms: 1000
      bucket_count: 2
      limit_qps: 200
load:
  workers: 8
"#;
        let config = QpsGateConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.json);
        assert_eq!(config.rate_limiting.rules, vec![Rule::new("rule1", 1000, 2, 200)]);
        assert_eq!(config.load.workers, 8);
        assert_eq!(config.load.max_work_ms, 50);
    }

    #[test]
    fn test_invalid_inline_rule_is_rejected() {
        let yaml = r#"
rate_limiting:
  rules:
    - name: broken
      interval_ms: 1000
      bucket_count: 7
      limit_qps: 1
"#;
        assert!(matches!(
            QpsGateConfig::from_yaml(yaml),
            Err(GateError::InvalidRule(_))
        ));
    }

    #[test]
    fn test_zero_report_interval_is_rejected() {
        let yaml = "load:\n  report_interval_ms: 0\n";
        assert!(matches!(QpsGateConfig::from_yaml(yaml), Err(GateError::Config(_))));
    }

    #[test]
    fn test_load_layered_file() {
        let path =
            std::env::temp_dir().join(format!("qpsgate-config-{}.yaml", std::process::id()));
        std::fs::write(
            &path,
            "rate_limiting:\n  rules:\n    - name: layered\n      limit_qps: 9\n",
        )
        .unwrap();

        let config = QpsGateConfig::load(Some(path.as_path())).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.rate_limiting.rules, vec![Rule::new("layered", 1000, 2, 9)]);
    }

    #[test]
    fn test_all_rules_reads_rule_file() {
        let path = std::env::temp_dir()
            .join(format!("qpsgate-extra-rules-{}.yaml", std::process::id()));
        std::fs::write(&path, "- name: extra\n  limit_qps: 3\n").unwrap();

        let mut config = QpsGateConfig::default();
        config.rate_limiting.rules.push(Rule::new("inline", 1000, 2, 1));
        config.rate_limiting.rules_path = Some(path.display().to_string());

        let rules = config.all_rules().unwrap();
        std::fs::remove_file(&path).unwrap();

        let names: Vec<&str> = rules.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["inline", "extra"]);
    }

    #[test]
    fn test_all_rules_rejects_malformed_rule_file() {
        let path = std::env::temp_dir()
            .join(format!("qpsgate-bad-rules-{}.yaml", std::process::id()));
        std::fs::write(&path, "name: checkout\nlimit_qps: -5\n").unwrap();

        let mut config = QpsGateConfig::default();
        config.rate_limiting.rules_path = Some(path.display().to_string());

        let result = config.all_rules();
        std::fs::remove_file(&path).unwrap();

        assert!(matches!(result, Err(GateError::Config(_))));
    }
}
