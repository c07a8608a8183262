//! Engine configuration.
//!
//! This module provides YAML/JSON configuration support for the sync core's
//! tunables. The values that shape the conservative protocol — the
//! partition latency floor and the inter-thread latencies — are derived
//! from the partitioned graph by the caller and must be identical on every
//! rank of a run.
//!
//! # Configuration File Structure
//!
//! ```yaml
//! threads: 2
//! min_cross_rank_latency: 50
//! inter_thread_latencies: [40, 60]
//! exit_check_period: 100
//! outbox_watermark: 8192
//! log_level: info
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::types::SimTime;

/// Errors that can occur during configuration loading.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unknown file format: {0}")]
    UnknownFormat(String),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Tunables of one rank of the parallel simulation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Worker threads per rank
    #[serde(default = "default_threads")]
    pub threads: u32,

    /// Minimum link latency across any rank boundary of the run.
    /// Floors the spacing of rank-sync epochs.
    #[serde(default = "default_min_cross_rank_latency")]
    pub min_cross_rank_latency: SimTime,

    /// Latency floors of the inter-thread links of this rank.
    /// The minimum bounds the thread-sync epoch period; required when
    /// `threads > 1`.
    #[serde(default)]
    pub inter_thread_latencies: Vec<SimTime>,

    /// Cadence of the termination probe on a single-worker topology
    #[serde(default = "default_exit_check_period")]
    pub exit_check_period: SimTime,

    /// Outbox depth past which the next sync horizon is pulled to the floor
    #[serde(default = "default_outbox_watermark")]
    pub outbox_watermark: usize,

    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_threads() -> u32 {
    1
}

fn default_min_cross_rank_latency() -> SimTime {
    50
}

fn default_exit_check_period() -> SimTime {
    100
}

fn default_outbox_watermark() -> usize {
    8192
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            threads: default_threads(),
            min_cross_rank_latency: default_min_cross_rank_latency(),
            inter_thread_latencies: Vec::new(),
            exit_check_period: default_exit_check_period(),
            outbox_watermark: default_outbox_watermark(),
            log_level: default_log_level(),
        }
    }
}

impl EngineConfig {
    /// A single-threaded configuration with defaults.
    pub fn single_thread() -> Self {
        Self::default()
    }

    /// A multi-threaded configuration with uniform inter-thread latency.
    pub fn threads(count: u32, inter_thread_latency: SimTime) -> Self {
        Self {
            threads: count,
            inter_thread_latencies: vec![inter_thread_latency],
            ..Self::default()
        }
    }

    /// Loads a configuration from a YAML string.
    pub fn from_yaml_str(content: &str) -> ConfigResult<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a configuration from a JSON string.
    pub fn from_json_str(content: &str) -> ConfigResult<Self> {
        let config: Self = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a configuration file, dispatching on the extension.
    pub fn from_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;

        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml_str(&content),
            Some("json") => Self::from_json_str(&content),
            other => Err(ConfigError::UnknownFormat(
                other.unwrap_or("<none>").to_string(),
            )),
        }
    }

    /// Validates the configuration.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.threads == 0 {
            return Err(ConfigError::Validation(
                "threads must be at least 1".to_string(),
            ));
        }
        if self.min_cross_rank_latency == 0 {
            return Err(ConfigError::Validation(
                "min_cross_rank_latency must be positive".to_string(),
            ));
        }
        if self.exit_check_period == 0 {
            return Err(ConfigError::Validation(
                "exit_check_period must be positive".to_string(),
            ));
        }
        if self.outbox_watermark == 0 {
            return Err(ConfigError::Validation(
                "outbox_watermark must be positive".to_string(),
            ));
        }
        if self.threads > 1 {
            if self.inter_thread_latencies.is_empty() {
                return Err(ConfigError::Validation(
                    "a multi-thread rank needs inter_thread_latencies".to_string(),
                ));
            }
            if self.inter_thread_latencies.contains(&0) {
                return Err(ConfigError::Validation(
                    "inter-thread latencies must be positive".to_string(),
                ));
            }
        }
        Ok(())
    }
}
