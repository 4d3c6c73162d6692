//! Runtime configuration.
//!
//! Values are resolved in this order, later sources winning:
//! 1. built-in defaults
//! 2. an optional TOML file (`--config path`)
//! 3. `.env` and `SELFHEAL_*` environment variables
//! 4. CLI flags (applied by the binary)
//!
//! | Variable | Field | Default |
//! |----------|-------|---------|
//! | `SELFHEAL_DATABASE_PATH` | `database_path` | `selfheal-qa.db` |
//! | `SELFHEAL_PROJECT` | `project_name` | `default` |
//! | `SELFHEAL_ENVIRONMENT` | `environment` | `staging` |
//! | `SELFHEAL_AUTO_FIX` | `auto_fix` | `true` |
//! | `SELFHEAL_FIX_THRESHOLD` | `fix_confidence_threshold` | `0.6` |
//! | `SELFHEAL_STEP_TIMEOUT_MS` | `default_step_timeout_ms` | `30000` |
//! | `SELFHEAL_MAX_RETRY_DELAY_MS` | `max_retry_delay_ms` | `5000` |
//! | `SELFHEAL_RECORD_ERRORS` | `record_errors` | `true` |
//! | `SELFHEAL_INCLUDE_SIMILAR` | `include_similar` | `true` |
//! | `SELFHEAL_SIMILARITY_ASYNC` | `similarity_async` | `true` |
//! | `SELFHEAL_LOG_JSON` | `log_json` | `false` |
//! | `SELFHEAL_LOG_DIR` | `log_dir` | unset |

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::engine::healing::DEFAULT_FIX_THRESHOLD;
use crate::error::AppError;

pub const DEFAULT_STEP_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_MAX_RETRY_DELAY_MS: u64 = 5_000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub database_path: PathBuf,
    /// Scope for the error knowledge base.
    pub project_name: String,
    pub environment: String,
    pub auto_fix: bool,
    pub fix_confidence_threshold: f64,
    pub default_step_timeout_ms: u64,
    /// Upper bound for delays suggested by the fix engine (e.g. on HTTP 429).
    pub max_retry_delay_ms: u64,
    pub record_errors: bool,
    pub include_similar: bool,
    pub similarity_async: bool,
    pub log_json: bool,
    pub log_dir: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("selfheal-qa.db"),
            project_name: "default".into(),
            environment: "staging".into(),
            auto_fix: true,
            fix_confidence_threshold: DEFAULT_FIX_THRESHOLD,
            default_step_timeout_ms: DEFAULT_STEP_TIMEOUT_MS,
            max_retry_delay_ms: DEFAULT_MAX_RETRY_DELAY_MS,
            record_errors: true,
            include_similar: true,
            similarity_async: true,
            log_json: false,
            log_dir: None,
        }
    }
}

impl AppConfig {
    /// Load defaults, then the TOML file (if given), then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, AppError> {
        let mut config = match path {
            Some(p) => Self::from_toml_file(p)?,
            None => Self::default(),
        };

        // A missing .env is the common case.
        let _ = dotenvy::dotenv();
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self, AppError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, AppError> {
        Ok(toml::from_str(raw)?)
    }

    /// Override fields from `SELFHEAL_*` variables. Unparseable values are
    /// ignored with a warning.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("SELFHEAL_DATABASE_PATH") {
            self.database_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("SELFHEAL_PROJECT") {
            self.project_name = v;
        }
        if let Some(v) = lookup("SELFHEAL_ENVIRONMENT") {
            self.environment = v;
        }
        if let Some(v) = lookup("SELFHEAL_LOG_DIR") {
            self.log_dir = Some(PathBuf::from(v));
        }
        parse_env(&lookup, "SELFHEAL_AUTO_FIX", &mut self.auto_fix);
        parse_env(&lookup, "SELFHEAL_FIX_THRESHOLD", &mut self.fix_confidence_threshold);
        parse_env(&lookup, "SELFHEAL_STEP_TIMEOUT_MS", &mut self.default_step_timeout_ms);
        parse_env(&lookup, "SELFHEAL_MAX_RETRY_DELAY_MS", &mut self.max_retry_delay_ms);
        parse_env(&lookup, "SELFHEAL_RECORD_ERRORS", &mut self.record_errors);
        parse_env(&lookup, "SELFHEAL_INCLUDE_SIMILAR", &mut self.include_similar);
        parse_env(&lookup, "SELFHEAL_SIMILARITY_ASYNC", &mut self.similarity_async);
        parse_env(&lookup, "SELFHEAL_LOG_JSON", &mut self.log_json);
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if !(0.0..=1.0).contains(&self.fix_confidence_threshold) {
            return Err(AppError::Validation(format!(
                "fix_confidence_threshold must be within [0, 1], got {}",
                self.fix_confidence_threshold
            )));
        }
        if self.default_step_timeout_ms == 0 {
            return Err(AppError::Validation(
                "default_step_timeout_ms must be > 0".into(),
            ));
        }
        if self.project_name.trim().is_empty() {
            return Err(AppError::Validation("project_name cannot be empty".into()));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    target: &mut T,
) {
    if let Some(raw) = lookup(key) {
        match raw.trim().parse::<T>() {
            Ok(value) => *target = value,
            Err(_) => tracing::warn!(key, value = %raw, "Ignoring unparseable environment override"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.fix_confidence_threshold, 0.6);
        assert_eq!(config.default_step_timeout_ms, 30_000);
        assert!(config.similarity_async);
    }

    #[test]
    fn test_toml_partial_uses_defaults() {
        let config = AppConfig::from_toml_str(
            r#"
            project_name = "reno"
            auto_fix = false
            "#,
        )
        .unwrap();
        assert_eq!(config.project_name, "reno");
        assert!(!config.auto_fix);
        assert_eq!(config.environment, "staging");
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("SELFHEAL_PROJECT", "precision"),
            ("SELFHEAL_FIX_THRESHOLD", "0.75"),
            ("SELFHEAL_AUTO_FIX", "false"),
            ("SELFHEAL_STEP_TIMEOUT_MS", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let mut config = AppConfig::default();
        config.apply_env(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(config.project_name, "precision");
        assert_eq!(config.fix_confidence_threshold, 0.75);
        assert!(!config.auto_fix);
        // Bad value leaves the default in place
        assert_eq!(config.default_step_timeout_ms, 30_000);
    }

    #[test]
    fn test_validate_rejects_bad_threshold() {
        let config = AppConfig {
            fix_confidence_threshold: 1.5,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(AppError::Validation(_))));
    }
}
