//! Application configuration using Figment.
//!
//! Configuration is layered:
//! 1. `config/fluor.toml` (or the file passed to [`AppConfig::load_from`])
//! 2. Environment variables prefixed with `FLUOR_DAQ_`, nested keys separated
//!    by a double underscore
//!
//! Every section has defaults, so a missing file yields a usable config.
//!
//! # Example
//! ```no_run
//! use fluor_daq::config::AppConfig;
//!
//! // FLUOR_DAQ_EXPERIMENT__RECORDING_HZ=50000 overrides the file
//! let config = AppConfig::load()?;
//! config.validate()?;
//! println!("Writing to {}", config.storage.output_dir.display());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::acquisition::{DEFAULT_BUFFER_MULTIPLIER, OVERRUN_FACTOR};
use crate::experiment::ExperimentConfig;
use crate::logging::{parse_log_level, OutputFormat};
use crate::orchestrator::OrchestratorOptions;

/// Default configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/fluor.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "FLUOR_DAQ_";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Where run artifacts go
    pub storage: StorageConfig,
    /// Acquisition loop tuning
    pub acquisition: AcquisitionConfig,
    /// Simulated instrument
    pub simulator: SimulatorConfig,
    /// Protocol parameters
    pub experiment: ExperimentConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "fluor-daq".to_string(),
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Output directory for waveforms, metadata and event logs
    pub output_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("data"),
        }
    }
}

/// Acquisition loop configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Analog input channel of the photodiode
    #[serde(default)]
    pub channel: u32,
    /// Sleep between polls when no samples are pending, microseconds
    #[serde(default = "default_idle_wait_us")]
    pub idle_wait_us: u64,
    /// Longest wait for the first sample, milliseconds
    #[serde(default = "default_first_data_timeout_ms")]
    pub first_data_timeout_ms: u64,
    /// Buffer capacity as a multiple of the requested sample count
    #[serde(default = "default_buffer_multiplier")]
    pub buffer_multiplier: usize,
    /// Open and close the shutter once before the run to measure its latency
    #[serde(default)]
    pub diagnostic_shutter_cycle: bool,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            channel: 0,
            idle_wait_us: default_idle_wait_us(),
            first_data_timeout_ms: default_first_data_timeout_ms(),
            buffer_multiplier: default_buffer_multiplier(),
            diagnostic_shutter_cycle: false,
        }
    }
}

/// Simulated instrument configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatorConfig {
    /// Delay between starting the acquisition and the first sample, seconds
    #[serde(default = "default_startup_delay_s")]
    pub startup_delay_s: f64,
    /// Uniform noise amplitude on every sample, volts
    #[serde(default = "default_noise_v")]
    pub noise_v: f64,
    /// Noise seed; random when absent
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            startup_delay_s: default_startup_delay_s(),
            noise_v: default_noise_v(),
            seed: None,
        }
    }
}

// Default value functions
fn default_idle_wait_us() -> u64 {
    1000
}

fn default_first_data_timeout_ms() -> u64 {
    5000
}

fn default_buffer_multiplier() -> usize {
    DEFAULT_BUFFER_MULTIPLIER
}

fn default_startup_delay_s() -> f64 {
    0.05
}

fn default_noise_v() -> f64 {
    0.002
}

impl AppConfig {
    /// Load configuration from `config/fluor.toml` and the environment
    ///
    /// Example: `FLUOR_DAQ_APPLICATION__LOG_LEVEL=debug`
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path and the environment
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Self::figment(path).extract()
    }

    /// The layered provider, for callers that merge further overrides.
    pub fn figment<P: AsRef<Path>>(path: P) -> Figment {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        parse_log_level(&self.application.log_level)?;
        OutputFormat::from_str(&self.application.log_format)?;

        if self.storage.output_dir.as_os_str().is_empty() {
            return Err("storage.output_dir must not be empty".to_string());
        }

        let acquisition = &self.acquisition;
        if acquisition.idle_wait_us > 100_000 {
            return Err(format!(
                "Invalid idle_wait_us {}. Must be at most 100000",
                acquisition.idle_wait_us
            ));
        }
        if acquisition.first_data_timeout_ms == 0 {
            return Err("first_data_timeout_ms must be greater than 0".to_string());
        }
        if acquisition.buffer_multiplier <= OVERRUN_FACTOR {
            return Err(format!(
                "Invalid buffer_multiplier {}. Must be greater than {}",
                acquisition.buffer_multiplier, OVERRUN_FACTOR
            ));
        }

        let simulator = &self.simulator;
        if !(simulator.startup_delay_s.is_finite() && simulator.startup_delay_s >= 0.0) {
            return Err(format!(
                "Invalid startup_delay_s {}. Must be a non-negative number",
                simulator.startup_delay_s
            ));
        }
        if !(simulator.noise_v.is_finite() && simulator.noise_v >= 0.0) {
            return Err(format!(
                "Invalid noise_v {}. Must be a non-negative number",
                simulator.noise_v
            ));
        }

        self.experiment.validate().map_err(|e| e.to_string())
    }
}

impl AcquisitionConfig {
    /// Sleep between idle polls.
    pub fn idle_wait(&self) -> Duration {
        Duration::from_micros(self.idle_wait_us)
    }

    /// Bound on the wait for the first sample.
    pub fn first_data_timeout(&self) -> Duration {
        Duration::from_millis(self.first_data_timeout_ms)
    }

    /// Orchestrator options carrying these settings.
    pub fn options(&self) -> OrchestratorOptions {
        OrchestratorOptions {
            channel: self.channel,
            idle_wait: self.idle_wait(),
            first_data_timeout: self.first_data_timeout(),
            buffer_multiplier: self.buffer_multiplier,
            diagnostic_shutter_cycle: self.diagnostic_shutter_cycle,
        }
    }
}

impl SimulatorConfig {
    /// Start-up delay as a duration; negative or non-finite values become
    /// zero.
    pub fn startup_delay(&self) -> Duration {
        Duration::try_from_secs_f64(self.startup_delay_s).unwrap_or(Duration::ZERO)
    }
}
