//! Configuration System using Figment
//!
//! This module provides strongly-typed configuration loading for the acquisition
//! scheduler. Configuration is loaded from:
//! 1. `config/ple_daq.toml` (base configuration)
//! 2. Environment variables (prefixed with PLE_DAQ_, sections split on `__`)
//!
//! Every field has a default, so an empty or missing file yields a usable setup.
//!
//! # Example
//! ```no_run
//! use ple_daq::config::DaqConfig;
//!
//! let config = DaqConfig::load()?;
//! println!("Polling every {:?}", config.timing.poll_interval);
//! # Ok::<(), ple_daq::error::DaqError>(())
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::acquisition::plan::SpectralRange;
use crate::error::{AppResult, DaqError};

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DaqConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Polling and settle timing
    #[serde(default)]
    pub timing: TimingConfig,
    /// Tunable source limits
    #[serde(default)]
    pub source: SourceConfig,
    /// Storage backend settings
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
        }
    }
}

/// Timing knobs for polling, timeouts and operator/instrument settle delays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Granularity of every busy-poll
    #[serde(with = "humantime_serde", default = "default_poll_interval")]
    pub poll_interval: Duration,
    /// Duration of one averaging unit on the power meter
    #[serde(with = "humantime_serde", default = "default_sample_period")]
    pub sample_period: Duration,
    /// Continuous monitoring: per-sample deadline in cycle times
    #[serde(default = "default_monitor_timeout_cycles")]
    pub monitor_timeout_cycles: f64,
    /// Tuning curve: per-sample deadline in cycle times
    #[serde(default = "default_sweep_timeout_cycles")]
    pub sweep_timeout_cycles: f64,
    /// Wait between showing an operator instruction and asking for confirmation
    #[serde(with = "humantime_serde", default = "default_prompt_settle")]
    pub prompt_settle: Duration,
    /// Wait for the power meter to stabilize before the spectrum dark reading
    #[serde(with = "humantime_serde", default = "default_meter_stabilization")]
    pub meter_stabilization: Duration,
    /// Wait for the source after the operator re-enables it
    #[serde(with = "humantime_serde", default = "default_source_stabilization")]
    pub source_stabilization: Duration,
    /// Extra settle after each tuning-curve move
    #[serde(with = "humantime_serde", default = "default_move_settle")]
    pub move_settle: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            sample_period: default_sample_period(),
            monitor_timeout_cycles: default_monitor_timeout_cycles(),
            sweep_timeout_cycles: default_sweep_timeout_cycles(),
            prompt_settle: default_prompt_settle(),
            meter_stabilization: default_meter_stabilization(),
            source_stabilization: default_source_stabilization(),
            move_settle: default_move_settle(),
        }
    }
}

impl TimingConfig {
    /// All settle/stabilization waits set to zero, polling left untouched.
    pub fn without_settle_delays(mut self) -> Self {
        self.prompt_settle = Duration::ZERO;
        self.meter_stabilization = Duration::ZERO;
        self.source_stabilization = Duration::ZERO;
        self.move_settle = Duration::ZERO;
        self
    }
}

/// Reachable range of the tunable source, in nm
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Lowest reachable setpoint
    #[serde(default = "default_min_nm")]
    pub min_nm: f64,
    /// Highest reachable setpoint
    #[serde(default = "default_max_nm")]
    pub max_nm: f64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            min_nm: default_min_nm(),
            max_nm: default_max_nm(),
        }
    }
}

impl SourceConfig {
    /// The range as used by plan validation.
    pub fn range(&self) -> SpectralRange {
        SpectralRange::new(self.min_nm, self.max_nm)
    }
}

/// Dataset file format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageFormat {
    /// One pretty-printed JSON document per dataset
    Json,
    /// Comment-prefixed metadata header followed by CSV rows
    Csv,
}

/// Storage backend configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Output directory for data files
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Dataset file format
    #[serde(default = "default_format")]
    pub format: StorageFormat,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            format: default_format(),
        }
    }
}

// Default value functions
fn default_name() -> String {
    "PLE DAQ".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(1)
}

fn default_sample_period() -> Duration {
    Duration::from_millis(10)
}

fn default_monitor_timeout_cycles() -> f64 {
    10.0
}

fn default_sweep_timeout_cycles() -> f64 {
    2.0
}

fn default_prompt_settle() -> Duration {
    Duration::from_secs(3)
}

fn default_meter_stabilization() -> Duration {
    Duration::from_secs(15)
}

fn default_source_stabilization() -> Duration {
    Duration::from_secs(5)
}

fn default_move_settle() -> Duration {
    Duration::from_secs(1)
}

fn default_min_nm() -> f64 {
    420.0
}

fn default_max_nm() -> f64 {
    700.0
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_format() -> StorageFormat {
    StorageFormat::Json
}

impl DaqConfig {
    /// Load configuration from config/ple_daq.toml and environment variables
    ///
    /// Environment variables can override configuration with prefix PLE_DAQ_
    /// Example: PLE_DAQ_APPLICATION__LOG_LEVEL=debug
    pub fn load() -> AppResult<Self> {
        Self::load_from("config/ple_daq.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config: Self = Figment::from(Serialized::defaults(DaqConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("PLE_DAQ_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.timing.poll_interval.is_zero() {
            return Err(DaqError::Configuration(
                "timing.poll_interval must be greater than zero".to_string(),
            ));
        }
        if self.timing.sample_period.is_zero() {
            return Err(DaqError::Configuration(
                "timing.sample_period must be greater than zero".to_string(),
            ));
        }
        for (key, cycles) in [
            ("monitor_timeout_cycles", self.timing.monitor_timeout_cycles),
            ("sweep_timeout_cycles", self.timing.sweep_timeout_cycles),
        ] {
            if !(cycles > 0.0 && cycles.is_finite()) {
                return Err(DaqError::Configuration(format!(
                    "timing.{key} must be a positive number, got {cycles}"
                )));
            }
        }

        if !(self.source.min_nm < self.source.max_nm) {
            return Err(DaqError::Configuration(format!(
                "source.min_nm ({}) must be below source.max_nm ({})",
                self.source.min_nm, self.source.max_nm
            )));
        }

        #[cfg(not(feature = "storage_csv"))]
        if self.storage.format == StorageFormat::Csv {
            return Err(DaqError::Configuration(
                "storage.format = \"csv\" requires the storage_csv feature".to_string(),
            ));
        }

        Ok(())
    }
}
