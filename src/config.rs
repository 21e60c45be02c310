//! Configuration using Figment
//!
//! Configuration is loaded from:
//! 1. `config/m2sdr.toml` (base configuration, optional)
//! 2. Environment variables prefixed with `M2SDR_`, nested keys separated by
//!    a double underscore (`M2SDR_LOGGING__LEVEL=debug`,
//!    `M2SDR_FRONTEND__RX__GAIN=20`)
//!
//! Every section has defaults, so an empty or missing file yields a usable
//! configuration for `/dev/m2sdr0`.
//!
//! # Example
//! ```no_run
//! use litex_m2sdr::config::M2sdrConfig;
//!
//! let config = M2sdrConfig::load()?;
//! config.validate()?;
//! println!("Device: {}", config.device.path);
//! # Ok::<(), litex_m2sdr::M2sdrError>(())
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::control::{
    self, RegisterMap, BANDWIDTH_RANGE, CLOCK_SOURCES, DEFAULT_BANDWIDTH, DEFAULT_FREQUENCY,
    DEFAULT_REFCLK_HZ, DEFAULT_RX_GAIN, DEFAULT_SAMPLE_RATE, DEFAULT_TX_GAIN, SAMPLE_RATE_RANGE,
};
use crate::dma::simulated::{DEFAULT_BUFFER_COUNT, DEFAULT_BUFFER_SIZE};
use crate::dma::Direction;
use crate::error::{M2sdrError, Result};

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/m2sdr.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "M2SDR_";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct M2sdrConfig {
    /// Device node and simulation settings
    pub device: DeviceConfig,
    /// Logging settings
    pub logging: LoggingConfig,
    /// Streaming defaults for the CLI
    pub stream: StreamConfig,
    /// Front-end defaults loaded into the control-plane caches
    pub frontend: FrontendConfig,
    /// CSR addresses of the front-end settings
    pub registers: RegisterMap,
}

/// Device selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// LitePCIe character device
    pub path: String,
    /// Use the in-process simulated channel instead of the device node
    pub simulate: bool,
    /// Buffer size of the simulated rings in bytes
    pub sim_buffer_size: usize,
    /// Depth of the simulated rings
    pub sim_buffer_count: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            path: "/dev/m2sdr0".to_string(),
            simulate: false,
            sim_buffer_size: DEFAULT_BUFFER_SIZE,
            sim_buffer_count: DEFAULT_BUFFER_COUNT,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error)
    pub level: String,
    /// Output format (pretty, compact, json)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

/// Streaming defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Active channels
    pub channels: Vec<usize>,
    /// Per-call acquire timeout in microseconds
    pub timeout_us: u64,
    /// Route TX back into RX inside the FPGA
    pub loopback: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            channels: vec![0],
            timeout_us: 100_000,
            loopback: false,
        }
    }
}

/// Front-end defaults for one direction
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DirectionConfig {
    /// Center frequency in Hz
    pub frequency: f64,
    /// Gain in dB
    pub gain: f64,
    /// Analog bandwidth in Hz
    pub bandwidth: f64,
    /// Sample rate in Hz
    pub sample_rate: f64,
}

/// Clock configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockConfig {
    /// Clock source (internal, external)
    pub source: String,
    /// Reference clock in Hz
    pub reference_hz: f64,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            source: "internal".to_string(),
            reference_hz: DEFAULT_REFCLK_HZ,
        }
    }
}

/// Front-end defaults for both directions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrontendConfig {
    /// Receive path
    pub rx: DirectionConfig,
    /// Transmit path
    pub tx: DirectionConfig,
    /// Clocking
    pub clock: ClockConfig,
}

impl Default for FrontendConfig {
    fn default() -> Self {
        let base = DirectionConfig {
            frequency: DEFAULT_FREQUENCY,
            gain: DEFAULT_RX_GAIN,
            bandwidth: DEFAULT_BANDWIDTH,
            sample_rate: DEFAULT_SAMPLE_RATE,
        };
        Self {
            rx: base,
            tx: DirectionConfig {
                gain: DEFAULT_TX_GAIN,
                ..base
            },
            clock: ClockConfig::default(),
        }
    }
}

impl M2sdrConfig {
    /// Load configuration from `config/m2sdr.toml` and environment variables
    pub fn load() -> Result<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        Ok(config)
    }

    /// Render the effective configuration as TOML, in the layout
    /// `load_from` reads back.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| invalid(format!("Cannot serialize configuration: {e}")))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(invalid(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            return Err(invalid(format!(
                "Invalid log format '{}'. Must be one of: {}",
                self.logging.format,
                valid_formats.join(", ")
            )));
        }

        if self.device.sim_buffer_count == 0 || self.device.sim_buffer_size == 0 {
            return Err(invalid("Simulated ring must have a non-zero geometry".to_string()));
        }

        let channels = &self.stream.channels;
        let distinct = channels.len() != 2 || channels[0] != channels[1];
        if channels.is_empty()
            || channels.len() > control::NUM_CHANNELS
            || !distinct
            || channels.iter().any(|&c| c >= control::NUM_CHANNELS)
        {
            return Err(invalid(format!("Invalid stream channels {channels:?}")));
        }

        for (direction, dir) in [
            (Direction::Rx, &self.frontend.rx),
            (Direction::Tx, &self.frontend.tx),
        ] {
            let checks = [
                ("frequency", dir.frequency, control::frequency_range(direction)),
                ("gain", dir.gain, control::gain_range(direction)),
                ("bandwidth", dir.bandwidth, BANDWIDTH_RANGE),
                ("sample_rate", dir.sample_rate, SAMPLE_RATE_RANGE),
            ];
            for (name, value, range) in checks {
                if !(range.min..=range.max).contains(&value) {
                    return Err(invalid(format!(
                        "{direction} {name} {value} out of range [{}, {}]",
                        range.min, range.max
                    )));
                }
            }
        }

        if !CLOCK_SOURCES.contains(&self.frontend.clock.source.as_str()) {
            return Err(invalid(format!(
                "Invalid clock source '{}'. Must be one of: {}",
                self.frontend.clock.source,
                CLOCK_SOURCES.join(", ")
            )));
        }

        Ok(())
    }
}

fn invalid(message: String) -> M2sdrError {
    M2sdrError::InvalidConfig { message }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = M2sdrConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.device.path, "/dev/m2sdr0");
        assert_eq!(config.frontend.tx.gain, -20.0);
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = M2sdrConfig::default();
        config.logging.level = "verbose".to_string();
        assert!(matches!(
            config.validate(),
            Err(M2sdrError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_invalid_channels() {
        for channels in [vec![], vec![0, 0], vec![2], vec![0, 1, 0]] {
            let mut config = M2sdrConfig::default();
            config.stream.channels = channels;
            assert!(config.validate().is_err());
        }
    }

    #[test]
    fn test_out_of_range_frontend() {
        let mut config = M2sdrConfig::default();
        config.frontend.rx.frequency = 50e6;
        assert!(config.validate().is_err());

        let mut config = M2sdrConfig::default();
        config.frontend.clock.source = "gps".to_string();
        assert!(config.validate().is_err());
    }
}
