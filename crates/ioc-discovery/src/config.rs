// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Engine configuration.
//!
//! Supports both programmatic and file-based (TOML) configuration.
//!
//! ```toml
//! name = "lab-fabric"
//!
//! [sweep]
//! mode = "interval"
//! interval_ms = 30000
//! debounce_ms = 100
//!
//! [query]
//! request_timeout_ms = 250
//! request_retries = 2
//! ```

use crate::transport::QueryOptions;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// When sweeps run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepMode {
    /// Port events never start a sweep; explicit rescans still do.
    Disabled,
    /// Sweep after a debounced trigger or an explicit rescan.
    OnDemand,
    /// Like on-demand, and re-arm `interval_ms` after every sweep.
    Interval,
}

/// Sweep scheduling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepConfig {
    #[serde(default = "default_sweep_mode")]
    pub mode: SweepMode,

    /// Period between sweeps in interval mode (milliseconds)
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// Delay between a trigger and the sweep it starts (milliseconds)
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Upper bound of the rescan burst counter
    #[serde(default = "default_max_rescan_burst")]
    pub max_rescan_burst: u32,

    /// Consecutive sweeps a unit may be missing before it is removed
    #[serde(default = "default_missed_sweeps")]
    pub missed_sweeps_before_removal: u32,
}

/// Query timeouts and retry budgets handed to the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    /// Timeout for the units/paths fan-out queries (milliseconds)
    #[serde(default = "default_timeout_ms")]
    pub discovery_timeout_ms: u64,

    #[serde(default = "default_retries")]
    pub discovery_retries: u32,

    /// Timeout for unit/controller/service-entry requests (milliseconds)
    #[serde(default = "default_timeout_ms")]
    pub request_timeout_ms: u64,

    #[serde(default = "default_retries")]
    pub request_retries: u32,
}

/// Record pool limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_max_units")]
    pub max_units: usize,

    #[serde(default = "default_max_paths")]
    pub max_paths: usize,

    #[serde(default = "default_max_controllers")]
    pub max_controllers: usize,
}

/// Discovery engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Engine name (for identification in logs)
    #[serde(default = "default_engine_name")]
    pub name: String,

    #[serde(default)]
    pub sweep: SweepConfig,

    #[serde(default)]
    pub query: QueryConfig,

    #[serde(default)]
    pub pool: PoolConfig,
}

fn default_engine_name() -> String {
    "ioc-discovery".to_string()
}

fn default_sweep_mode() -> SweepMode {
    SweepMode::OnDemand
}

fn default_interval_ms() -> u64 {
    30_000
}

fn default_debounce_ms() -> u64 {
    100
}

fn default_max_rescan_burst() -> u32 {
    4
}

fn default_missed_sweeps() -> u32 {
    1
}

fn default_timeout_ms() -> u64 {
    500
}

fn default_retries() -> u32 {
    3
}

fn default_max_units() -> usize {
    4096
}

fn default_max_paths() -> usize {
    16384
}

fn default_max_controllers() -> usize {
    16384
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            mode: default_sweep_mode(),
            interval_ms: default_interval_ms(),
            debounce_ms: default_debounce_ms(),
            max_rescan_burst: default_max_rescan_burst(),
            missed_sweeps_before_removal: default_missed_sweeps(),
        }
    }
}

impl SweepConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            discovery_timeout_ms: default_timeout_ms(),
            discovery_retries: default_retries(),
            request_timeout_ms: default_timeout_ms(),
            request_retries: default_retries(),
        }
    }
}

impl QueryConfig {
    /// Options for the two per-port fan-out queries.
    pub fn discovery_options(&self) -> QueryOptions {
        QueryOptions {
            timeout: Duration::from_millis(self.discovery_timeout_ms),
            retries: self.discovery_retries,
        }
    }

    /// Options for per-unit request/response exchanges.
    pub fn request_options(&self) -> QueryOptions {
        QueryOptions {
            timeout: Duration::from_millis(self.request_timeout_ms),
            retries: self.request_retries,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_units: default_max_units(),
            max_paths: default_max_paths(),
            max_controllers: default_max_controllers(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: default_engine_name(),
            sweep: SweepConfig::default(),
            query: QueryConfig::default(),
            pool: PoolConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sweep.mode == SweepMode::Interval && self.sweep.interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "interval_ms cannot be 0 in interval mode".into(),
            ));
        }
        if self.sweep.missed_sweeps_before_removal == 0 {
            return Err(ConfigError::Invalid(
                "missed_sweeps_before_removal cannot be 0".into(),
            ));
        }
        if self.query.discovery_timeout_ms == 0 || self.query.request_timeout_ms == 0 {
            return Err(ConfigError::Invalid("query timeouts cannot be 0".into()));
        }
        if self.pool.max_units == 0 || self.pool.max_paths == 0 || self.pool.max_controllers == 0
        {
            return Err(ConfigError::Invalid("pool limits cannot be 0".into()));
        }
        Ok(())
    }
}
