//! Configuration management for odotrust.
//!
//! Every section has defaults, so a TOML file only needs the keys it
//! overrides. `ODOTRUST_*` environment variables are applied last.

use crate::error::{Error, Result};
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub segmenter: SegmenterConfig,
    pub continuity: ContinuityConfig,
    pub trust: TrustConfig,
    pub verification: VerificationConfig,
    pub pipeline: PipelineConfig,
    pub anchor: AnchorConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub trust_db_path: PathBuf,
    pub batch_db_path: PathBuf,
    pub market_db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            trust_db_path: PathBuf::from("data/trust.db"),
            batch_db_path: PathBuf::from("data/batches.db"),
            market_db_path: PathBuf::from("data/market.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmenterConfig {
    /// Silence after which a trip is closed with "data timeout"
    pub idle_timeout_ms: u64,
    /// Trailing idle points (rpm 0, speed 0) that close a trip with "engine off"
    pub engine_off_points: usize,
    /// Gap between points that breaks a segment
    pub segment_gap_ms: u64,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: 30 * 60 * 1000,
            engine_off_points: 3,
            segment_gap_ms: 30 * 60 * 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContinuityConfig {
    /// Maximum tolerated difference between batch start and last accepted odometer
    pub gap_tolerance: u64,
    /// Distance within a single batch considered unrealistic
    pub jump_threshold: u64,
}

impl Default for ContinuityConfig {
    fn default() -> Self {
        Self {
            gap_tolerance: 100,
            jump_threshold: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustConfig {
    /// Delta applied when a batch passes continuity
    pub positive_delta: i32,
    /// Delta applied when the fraud engine flags a batch
    pub fraud_delta: i32,
    /// Connections kept open by the ledger pool
    pub pool_size: usize,
    /// SQLite busy timeout per connection
    pub busy_timeout_ms: u64,
    pub retry: RetryPolicy,
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            positive_delta: 1,
            fraud_delta: -20,
            pool_size: 4,
            busy_timeout_ms: 50,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    pub min_trust_score: u8,
    /// Maximum age of the latest continuity verdict
    pub continuity_max_age_ms: u64,
    pub require_trust_score: bool,
    pub require_continuity: bool,
    pub require_anchor: bool,
    pub require_storage: bool,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        // Reference policy: only the trust score gates a transfer
        Self {
            min_trust_score: 70,
            continuity_max_age_ms: 30 * 24 * 60 * 60 * 1000,
            require_trust_score: true,
            require_continuity: false,
            require_anchor: false,
            require_storage: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    pub sweep_interval_ms: u64,
    /// Batches taken per submission sweep
    pub sweep_batch_size: usize,
    pub inter_submission_delay_ms: u64,
    pub max_submission_attempts: u32,
    /// In-line retry for the first anchor submission
    pub anchor_retry: RetryPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 1024,
            sweep_interval_ms: 60_000,
            sweep_batch_size: 10,
            inter_submission_delay_ms: 500,
            max_submission_attempts: 5,
            anchor_retry: RetryPolicy::new(2, 200),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnchorConfig {
    pub endpoint: String,
    /// Opaque wallet credential identifier handed to the anchor service
    pub credential_id: String,
    pub timeout_ms: u64,
}

impl Default for AnchorConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8545".to_string(),
            credential_id: "default".to_string(),
            timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `text` or `json`
    pub format: String,
    /// Level for the odotrust crates, or a full filter directive list
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: "text".to_string(),
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load from a TOML file and apply environment overrides
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config = Self::from_toml_str(&content)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `ODOTRUST_*` overrides read through `lookup`
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("ODOTRUST_TRUST_DB") {
            self.storage.trust_db_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("ODOTRUST_BATCH_DB") {
            self.storage.batch_db_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("ODOTRUST_MARKET_DB") {
            self.storage.market_db_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("ODOTRUST_WORKERS") {
            self.pipeline.workers = v
                .parse()
                .map_err(|_| Error::Config(format!("ODOTRUST_WORKERS is not a number: {}", v)))?;
        }
        if let Some(v) = lookup("ODOTRUST_ANCHOR_ENDPOINT") {
            self.anchor.endpoint = v;
        }
        if let Some(v) = lookup("ODOTRUST_LOG_FORMAT") {
            self.logging.format = v;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        if self.pipeline.workers == 0 {
            return Err(Error::Config("pipeline.workers must be at least 1".to_string()));
        }
        if self.segmenter.engine_off_points == 0 {
            return Err(Error::Config(
                "segmenter.engine_off_points must be at least 1".to_string(),
            ));
        }
        if self.trust.pool_size == 0 {
            return Err(Error::Config("trust.pool_size must be at least 1".to_string()));
        }
        if self.verification.min_trust_score > 100 {
            return Err(Error::Config(
                "verification.min_trust_score must be within 0..=100".to_string(),
            ));
        }
        self.logging.format.parse::<crate::logging::LogFormat>()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_reference_values() {
        let config = Config::default();
        assert_eq!(config.segmenter.idle_timeout_ms, 1_800_000);
        assert_eq!(config.continuity.gap_tolerance, 100);
        assert_eq!(config.continuity.jump_threshold, 10_000);
        assert_eq!(config.trust.retry.max_attempts, 3);
        assert!(config.verification.require_trust_score);
        assert!(!config.verification.require_anchor);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_toml_str(
            r#"
            [trust]
            fraud_delta = -35

            [pipeline]
            workers = 8
            "#,
        )
        .unwrap();
        assert_eq!(config.trust.fraud_delta, -35);
        assert_eq!(config.trust.positive_delta, 1);
        assert_eq!(config.pipeline.workers, 8);
        assert_eq!(config.pipeline.sweep_batch_size, 10);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config
            .apply_env(|key| match key {
                "ODOTRUST_WORKERS" => Some("2".to_string()),
                "ODOTRUST_ANCHOR_ENDPOINT" => Some("http://anchor:9000".to_string()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.pipeline.workers, 2);
        assert_eq!(config.anchor.endpoint, "http://anchor:9000");
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(Config::from_toml_str("[pipeline]\nworkers = 0\n").is_err());
        let mut config = Config::default();
        assert!(config
            .apply_env(|key| (key == "ODOTRUST_WORKERS").then(|| "many".to_string()))
            .is_err());
        assert!(Config::from_toml_str("[logging]\nformat = \"xml\"\n").is_err());
    }
}
