//! # Configuration Module
//!
//! Loads the CLI configuration: where checkpoints live and the engine
//! settings. Values come from, in increasing priority:
//! - built-in defaults (`EngineConfig::default()`)
//! - a JSON file passed with `--config`
//! - `LEADFLOW_*` environment variables (a `.env` file is loaded first)

use anyhow::{Context, Result};
use serde::Serialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use leadflow_engine::{EngineConfig, StoreConfig};

// =============================================================================
// CONFIGURATION STRUCT
// =============================================================================
/// Effective configuration of the `leadflow` binary.
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// Root directory of the file checkpoint store
    pub data_dir: PathBuf,

    /// zstd-compress checkpoint files
    pub compression: bool,

    /// Engine settings passed to the executor
    pub engine: EngineConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("leadflow-data"),
            compression: false,
            engine: EngineConfig::default(),
        }
    }
}

// =============================================================================
// CONFIGURATION LOADING
// =============================================================================
impl Config {
    /// Load configuration from the environment, on top of `file` if given.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        // Load .env file if it exists (silently ignore if not found)
        let _ = dotenvy::dotenv();

        let mut config = match file {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        Ok(config)
    }

    /// Engine settings from a JSON file; omitted fields keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let engine: EngineConfig = serde_json::from_str(&raw)
            .with_context(|| format!("config file {} is not a valid engine configuration", path.display()))?;
        Ok(Self {
            engine,
            ..Self::default()
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(val) = env::var("LEADFLOW_DATA_DIR") {
            self.data_dir = PathBuf::from(val);
        }
        if let Ok(val) = env::var("LEADFLOW_COMPRESSION") {
            self.compression = parse_flag(&val).context("LEADFLOW_COMPRESSION must be true or false")?;
        }

        let engine = &mut self.engine;
        if let Ok(val) = env::var("LEADFLOW_MAX_VISITS") {
            engine.max_visits = val
                .parse()
                .context("LEADFLOW_MAX_VISITS must be a positive integer")?;
        }
        if let Ok(val) = env::var("LEADFLOW_AGENT_TIMEOUT_SECS") {
            engine.agent_timeout = Duration::from_secs(
                val.parse()
                    .context("LEADFLOW_AGENT_TIMEOUT_SECS must be a whole number of seconds")?,
            );
        }
        if let Ok(val) = env::var("LEADFLOW_PARALLELISM") {
            engine.parallelism = val
                .parse()
                .context("LEADFLOW_PARALLELISM must be a positive integer")?;
        }
        if let Ok(val) = env::var("LEADFLOW_INITIAL_BUDGET") {
            engine.initial_budget = val
                .parse()
                .context("LEADFLOW_INITIAL_BUDGET must be a number (e.g., 0.25)")?;
        }
        if let Ok(val) = env::var("LEADFLOW_MIN_LEAD_SCORE") {
            engine.min_lead_score = val
                .parse()
                .context("LEADFLOW_MIN_LEAD_SCORE must be within 0-100")?;
        }
        if let Ok(val) = env::var("LEADFLOW_APPROVAL_THRESHOLD") {
            engine.approval.auto_approval_threshold = val
                .parse()
                .context("LEADFLOW_APPROVAL_THRESHOLD must be within 0-100")?;
        }
        if let Ok(val) = env::var("LEADFLOW_APPROVAL_TIMEOUT_SECS") {
            engine.approval.timeout = Duration::from_secs(
                val.parse()
                    .context("LEADFLOW_APPROVAL_TIMEOUT_SECS must be a whole number of seconds")?,
            );
        }
        if let Ok(val) = env::var("LEADFLOW_DISABLED_AGENTS") {
            engine.disabled_agents = val
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        Ok(())
    }

    /// Validate the configuration before any instance is touched.
    pub fn validate(&self) -> Result<()> {
        if self.data_dir.as_os_str().is_empty() {
            anyhow::bail!("LEADFLOW_DATA_DIR cannot be empty");
        }
        self.engine
            .validate()
            .context("invalid engine configuration")?;
        Ok(())
    }

    /// Checkpoint store backing the CLI
    pub fn store(&self) -> StoreConfig {
        StoreConfig::File {
            path: self.data_dir.clone(),
            compression: self.compression,
        }
    }
}

fn parse_flag(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => anyhow::bail!("unrecognised flag value: {other}"),
    }
}

// =============================================================================
// UNIT TESTS
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.data_dir, PathBuf::from("leadflow-data"));
        assert!(!config.compression);
        assert_eq!(config.engine.max_visits, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"max_visits": 5, "approval": {{"timeout": "2h"}}}}"#).unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.engine.max_visits, 5);
        assert_eq!(config.engine.approval.timeout, Duration::from_secs(7200));
        assert_eq!(config.engine.approval.auto_approval_threshold, 90);
        assert!((config.engine.initial_budget - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_from_file_rejects_garbage() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(Config::from_file(file.path()).is_err());
    }

    #[test]
    fn test_validation_invalid_threshold() {
        let mut config = Config::default();
        config.engine.approval.auto_approval_threshold = 150;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_flag() {
        assert!(parse_flag("TRUE").unwrap());
        assert!(!parse_flag("0").unwrap());
        assert!(parse_flag("maybe").is_err());
    }
}
