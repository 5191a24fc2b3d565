use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use ledger_core::{BudgetPeriod, BudgetRule, BudgetScope, PricingEntry};
use ledger_ingest::{LogFormat, SourceSpec};
use rust_decimal::Decimal;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parse config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level TOML configuration. Validation happens once at load; a rule
/// or source that cannot be validated is fatal at startup, never at
/// evaluation time.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    pub db_path: PathBuf,
    #[serde(default)]
    pub poll_interval_secs: Option<u64>,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub budgets: Vec<BudgetConfig>,
    #[serde(default)]
    pub pricing: Vec<PricingConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    pub path: PathBuf,
    #[serde(default)]
    pub format: Option<LogFormat>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BudgetConfig {
    pub id: String,
    /// Provider name, or absent for a global rule.
    #[serde(default)]
    pub provider: Option<String>,
    /// One of "daily", "weekly", "monthly"; mutually exclusive with
    /// `window_hours`.
    #[serde(default)]
    pub period: Option<String>,
    #[serde(default)]
    pub window_hours: Option<u32>,
    pub limit: Decimal,
    pub thresholds: Vec<Decimal>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PricingConfig {
    pub provider: String,
    pub model: String,
    pub input_per_1m: Decimal,
    #[serde(default)]
    pub cached_input_per_1m: Option<Decimal>,
    pub output_per_1m: Decimal,
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&contents, &path.display().to_string())
    }

    pub fn from_toml(contents: &str, label: &str) -> Result<Self, ConfigError> {
        let config: AppConfig =
            toml::from_str(contents).map_err(|source| ConfigError::Parse {
                path: label.to_string(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for budget in &self.budgets {
            if budget.id.is_empty() {
                return Err(ConfigError::Invalid("budget rule with empty id".into()));
            }
            if !seen.insert(budget.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate budget rule id: {}",
                    budget.id
                )));
            }
            if budget.limit <= Decimal::ZERO {
                return Err(ConfigError::Invalid(format!(
                    "budget {}: limit must be positive",
                    budget.id
                )));
            }
            if budget.thresholds.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "budget {}: at least one threshold required",
                    budget.id
                )));
            }
            for fraction in &budget.thresholds {
                if *fraction <= Decimal::ZERO || *fraction > Decimal::ONE {
                    return Err(ConfigError::Invalid(format!(
                        "budget {}: thresholds must be fractions in (0, 1]",
                        budget.id
                    )));
                }
            }
            budget.period()?;
        }
        for entry in &self.pricing {
            if entry.input_per_1m < Decimal::ZERO
                || entry.output_per_1m < Decimal::ZERO
                || entry.cached_input_per_1m.unwrap_or(Decimal::ZERO) < Decimal::ZERO
            {
                return Err(ConfigError::Invalid(format!(
                    "pricing {}/{}: rates must be non-negative",
                    entry.provider, entry.model
                )));
            }
        }
        Ok(())
    }

    pub fn source_specs(&self) -> Vec<SourceSpec> {
        self.sources
            .iter()
            .map(|source| SourceSpec {
                path: source.path.clone(),
                format_hint: source.format,
            })
            .collect()
    }

    pub fn budget_rules(&self) -> Result<Vec<BudgetRule>, ConfigError> {
        self.budgets.iter().map(BudgetConfig::to_rule).collect()
    }

    pub fn pricing_entries(&self) -> Vec<PricingEntry> {
        self.pricing
            .iter()
            .map(|entry| PricingEntry {
                provider: entry.provider.clone(),
                model_pattern: entry.model.clone(),
                input_per_1m: entry.input_per_1m,
                cached_input_per_1m: entry.cached_input_per_1m.unwrap_or(Decimal::ZERO),
                output_per_1m: entry.output_per_1m,
            })
            .collect()
    }
}

impl BudgetConfig {
    fn period(&self) -> Result<BudgetPeriod, ConfigError> {
        match (self.period.as_deref(), self.window_hours) {
            (Some(_), Some(_)) => Err(ConfigError::Invalid(format!(
                "budget {}: period and window_hours are mutually exclusive",
                self.id
            ))),
            (Some("daily"), None) => Ok(BudgetPeriod::Daily),
            (Some("weekly"), None) => Ok(BudgetPeriod::Weekly),
            (Some("monthly"), None) => Ok(BudgetPeriod::Monthly),
            (Some(other), None) => Err(ConfigError::Invalid(format!(
                "budget {}: unknown period {other:?}",
                self.id
            ))),
            (None, Some(0)) => Err(ConfigError::Invalid(format!(
                "budget {}: window_hours must be positive",
                self.id
            ))),
            (None, Some(hours)) => Ok(BudgetPeriod::Window { hours }),
            (None, None) => Err(ConfigError::Invalid(format!(
                "budget {}: one of period or window_hours required",
                self.id
            ))),
        }
    }

    fn to_rule(&self) -> Result<BudgetRule, ConfigError> {
        let mut thresholds = self.thresholds.clone();
        thresholds.sort();
        thresholds.dedup();
        Ok(BudgetRule {
            id: self.id.clone(),
            scope: match &self.provider {
                Some(name) => BudgetScope::Provider(name.clone()),
                None => BudgetScope::Global,
            },
            period: self.period()?,
            limit: self.limit,
            thresholds,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GOOD: &str = r#"
        db_path = "/tmp/ledger.sqlite"

        [[sources]]
        path = "/logs/sessions"
        format = "session"

        [[budgets]]
        id = "global-monthly"
        period = "monthly"
        limit = "100"
        thresholds = ["0.5", "0.8", "1.0"]

        [[budgets]]
        id = "openai-window"
        provider = "openai"
        window_hours = 6
        limit = "5"
        thresholds = ["1.0"]

        [[pricing]]
        provider = "openai"
        model = "gpt-4o*"
        input_per_1m = "5"
        cached_input_per_1m = "2.5"
        output_per_1m = "15"
    "#;

    #[test]
    fn full_config_parses_and_converts() {
        let config = AppConfig::from_toml(GOOD, "test").expect("parse");
        assert_eq!(config.sources.len(), 1);
        let rules = config.budget_rules().expect("rules");
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].period, BudgetPeriod::Monthly);
        assert_eq!(rules[0].scope, BudgetScope::Global);
        assert_eq!(rules[1].period, BudgetPeriod::Window { hours: 6 });
        assert_eq!(
            rules[1].scope,
            BudgetScope::Provider("openai".to_string())
        );
        let entries = config.pricing_entries();
        assert_eq!(entries[0].cached_input_per_1m, "2.5".parse().expect("rate"));
    }

    #[test]
    fn duplicate_rule_ids_are_rejected() {
        let raw = r#"
            db_path = "/tmp/ledger.sqlite"
            [[budgets]]
            id = "a"
            period = "daily"
            limit = "1"
            thresholds = ["1.0"]
            [[budgets]]
            id = "a"
            period = "weekly"
            limit = "1"
            thresholds = ["1.0"]
        "#;
        let err = AppConfig::from_toml(raw, "test").expect_err("should reject");
        assert!(err.to_string().contains("duplicate budget rule id"));
    }

    #[test]
    fn non_positive_limit_is_rejected() {
        let raw = r#"
            db_path = "/tmp/ledger.sqlite"
            [[budgets]]
            id = "a"
            period = "daily"
            limit = "0"
            thresholds = ["1.0"]
        "#;
        assert!(AppConfig::from_toml(raw, "test").is_err());
    }

    #[test]
    fn period_and_window_are_mutually_exclusive() {
        let raw = r#"
            db_path = "/tmp/ledger.sqlite"
            [[budgets]]
            id = "a"
            period = "daily"
            window_hours = 6
            limit = "1"
            thresholds = ["1.0"]
        "#;
        assert!(AppConfig::from_toml(raw, "test").is_err());
    }

    #[test]
    fn thresholds_are_sorted_and_deduplicated() {
        let raw = r#"
            db_path = "/tmp/ledger.sqlite"
            [[budgets]]
            id = "a"
            period = "daily"
            limit = "10"
            thresholds = ["1.0", "0.5", "0.5", "0.8"]
        "#;
        let config = AppConfig::from_toml(raw, "test").expect("parse");
        let rules = config.budget_rules().expect("rules");
        let expected: Vec<Decimal> = ["0.5", "0.8", "1.0"]
            .iter()
            .map(|raw| raw.parse().expect("fraction"))
            .collect();
        assert_eq!(rules[0].thresholds, expected);
    }

    #[test]
    fn thresholds_above_one_are_rejected() {
        let raw = r#"
            db_path = "/tmp/ledger.sqlite"
            [[budgets]]
            id = "a"
            period = "daily"
            limit = "10"
            thresholds = ["1.5"]
        "#;
        assert!(AppConfig::from_toml(raw, "test").is_err());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let raw = r#"
            db_path = "/tmp/ledger.sqlite"
            surprise = true
        "#;
        assert!(AppConfig::from_toml(raw, "test").is_err());
    }
}
