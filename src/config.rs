//! Engine configuration.
//!
//! Sensible defaults, optionally overridden by a TOML file and then by
//! environment variables:
//!
//! ```toml
//! auto_complete_min_days = 7
//! small_sample_threshold = 30
//! weight_tolerance = 0.01
//! database_path = "abtest.db"
//! log_level = "info"
//! ```

use std::env;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{AbTestError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Days a test must have been running before a conversion may
    /// auto-complete it.
    pub auto_complete_min_days: i64,
    /// Participants per variant below which a "grow the sample" hint is added.
    pub small_sample_threshold: u64,
    /// Allowed deviation of the weight sum from 100.
    pub weight_tolerance: f64,
    /// SQLite database used by the CLI.
    pub database_path: String,
    /// Default `tracing` filter when `RUST_LOG` is unset.
    pub log_level: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            auto_complete_min_days: 7,
            small_sample_threshold: 30,
            weight_tolerance: 0.01,
            database_path: "abtest.db".into(),
            log_level: "info".into(),
        }
    }
}

impl EngineConfig {
    /// Parse a TOML document. Missing keys keep their defaults.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let cfg: EngineConfig =
            toml::from_str(s).map_err(|e| AbTestError::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from `path` if it exists, otherwise defaults, then apply
    /// `ABTEST_*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut cfg = match path {
            Some(p) if p.exists() => {
                let raw = std::fs::read_to_string(p)
                    .map_err(|e| AbTestError::Config(format!("{}: {e}", p.display())))?;
                Self::from_toml_str(&raw)?
            }
            Some(p) => {
                tracing::debug!(path = %p.display(), "config file not found, using defaults");
                Self::default()
            }
            None => Self::default(),
        };
        cfg.apply_env();
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env(&mut self) {
        if let Ok(val) = env::var("ABTEST_AUTO_COMPLETE_MIN_DAYS") {
            if let Ok(n) = val.parse() {
                self.auto_complete_min_days = n;
            }
        }
        if let Ok(val) = env::var("ABTEST_SMALL_SAMPLE_THRESHOLD") {
            if let Ok(n) = val.parse() {
                self.small_sample_threshold = n;
            }
        }
        if let Ok(val) = env::var("ABTEST_DB") {
            if !val.trim().is_empty() {
                self.database_path = val;
            }
        }
        if let Ok(val) = env::var("ABTEST_LOG") {
            if !val.trim().is_empty() {
                self.log_level = val;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.auto_complete_min_days < 0 {
            return Err(AbTestError::Config(format!(
                "auto_complete_min_days must be >= 0, got {}",
                self.auto_complete_min_days
            )));
        }
        if !(0.0..1.0).contains(&self.weight_tolerance) {
            return Err(AbTestError::Config(format!(
                "weight_tolerance must be in [0, 1), got {}",
                self.weight_tolerance
            )));
        }
        Ok(())
    }
}
