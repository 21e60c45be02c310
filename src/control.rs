//! Control plane: register bus access and cached front-end settings.
//!
//! Front-end settings (gain, frequency, bandwidth, sample rate, antenna and
//! clock source) are written to the register bus and cached so read-back
//! never touches the hardware. The whole control plane lives behind one mutex
//! owned by [`crate::M2sdrDevice`]; the streaming hot path never takes it.
//!
//! Register-bus failures are returned to the caller of the failing accessor
//! and leave the cache untouched.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::config::FrontendConfig;
use crate::dma::Direction;
use crate::error::{M2sdrError, Result};

/// Number of RF channels per direction.
pub const NUM_CHANNELS: usize = 2;

/// Reference clock of the on-board oscillator (Hz).
pub const DEFAULT_REFCLK_HZ: f64 = 38_400_000.0;
/// Default RF sample rate (Hz).
pub const DEFAULT_SAMPLE_RATE: f64 = 30_720_000.0;
/// Default RF bandwidth (Hz).
pub const DEFAULT_BANDWIDTH: f64 = 56_000_000.0;
/// Default center frequency for both directions (Hz).
pub const DEFAULT_FREQUENCY: f64 = 98_200_000.0;
/// Default RX gain (dB).
pub const DEFAULT_RX_GAIN: f64 = 0.0;
/// Default TX gain (dB).
pub const DEFAULT_TX_GAIN: f64 = -20.0;

/// Clock sources selectable with [`ControlPlane::set_clock_source`].
pub const CLOCK_SOURCES: [&str; 2] = ["internal", "external"];
const RX_ANTENNAS: [&str; 2] = ["A_BALANCED", "B_BALANCED"];
const TX_ANTENNAS: [&str; 2] = ["A", "B"];

/// 32-bit register bus of the FPGA.
pub trait RegisterBus: Send + Sync {
    /// Read the register at `addr`.
    fn read(&self, addr: u32) -> Result<u32>;

    /// Write `value` to the register at `addr`.
    fn write(&self, addr: u32, value: u32) -> Result<()>;
}

/// Inclusive range of a front-end setting.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Range {
    /// Lowest accepted value
    pub min: f64,
    /// Highest accepted value
    pub max: f64,
}

impl Range {
    /// Create a range.
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    fn check(&self, setting: &'static str, value: f64) -> Result<()> {
        if value.is_finite() && value >= self.min && value <= self.max {
            Ok(())
        } else {
            Err(M2sdrError::OutOfRange {
                setting,
                value,
                min: self.min,
                max: self.max,
            })
        }
    }
}

/// Center frequency range for `direction`.
pub const fn frequency_range(direction: Direction) -> Range {
    match direction {
        Direction::Rx => Range::new(70e6, 6e9),
        Direction::Tx => Range::new(47e6, 6e9),
    }
}

/// Gain range for `direction` (TX gain is an attenuation, hence negative).
pub const fn gain_range(direction: Direction) -> Range {
    match direction {
        Direction::Rx => Range::new(0.0, 76.0),
        Direction::Tx => Range::new(-89.0, 0.0),
    }
}

/// Sample rate range shared by both directions.
pub const SAMPLE_RATE_RANGE: Range = Range::new(520_833.0, 61_440_000.0);

/// Analog bandwidth range shared by both directions.
pub const BANDWIDTH_RANGE: Range = Range::new(200_000.0, 56_000_000.0);

/// Antenna names for `direction`.
pub fn antennas(direction: Direction) -> &'static [&'static str] {
    match direction {
        Direction::Rx => &RX_ANTENNAS,
        Direction::Tx => &TX_ANTENNAS,
    }
}

/// CSR addresses of the front-end settings.
///
/// Per-channel registers are `stride` bytes apart; TX registers sit
/// `tx_offset` bytes above their RX counterparts. Frequencies occupy two
/// consecutive words (low then high 32 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegisterMap {
    /// Gain in dB, two's complement
    pub gain: u32,
    /// Center frequency in Hz (64-bit, two words)
    pub frequency: u32,
    /// Analog bandwidth in Hz
    pub bandwidth: u32,
    /// Antenna index
    pub antenna: u32,
    /// Sample rate in Hz (per direction)
    pub sample_rate: u32,
    /// Clock source index (device-wide)
    pub clock_source: u32,
    /// Distance between channel 0 and channel 1 registers
    pub stride: u32,
    /// Distance between RX and TX registers
    pub tx_offset: u32,
}

impl Default for RegisterMap {
    fn default() -> Self {
        Self {
            gain: 0x8000,
            frequency: 0x8010,
            bandwidth: 0x8030,
            antenna: 0x8040,
            sample_rate: 0x8050,
            clock_source: 0x8100,
            stride: 0x4,
            tx_offset: 0x200,
        }
    }
}

impl RegisterMap {
    fn channel_reg(&self, base: u32, direction: Direction, channel: usize, words: u32) -> u32 {
        let dir = match direction {
            Direction::Rx => 0,
            Direction::Tx => self.tx_offset,
        };
        base + dir + channel as u32 * self.stride * words
    }

    fn direction_reg(&self, base: u32, direction: Direction) -> u32 {
        match direction {
            Direction::Rx => base,
            Direction::Tx => base + self.tx_offset,
        }
    }
}

/// Cached settings of one RF channel.
#[derive(Debug, Clone, Copy, PartialEq)]
struct ChannelSettings {
    gain: f64,
    frequency: f64,
    bandwidth: f64,
    antenna: usize,
}

/// Register bus plus cached front-end state.
pub struct ControlPlane {
    bus: Arc<dyn RegisterBus>,
    map: RegisterMap,
    channels: [[ChannelSettings; NUM_CHANNELS]; 2],
    sample_rates: [f64; 2],
    clock_source: usize,
    reference_clock: f64,
}

impl ControlPlane {
    /// Create a control plane whose caches start at the given defaults.
    ///
    /// Nothing is written to the bus until a setter is called.
    pub fn new(bus: Arc<dyn RegisterBus>, map: RegisterMap, frontend: &FrontendConfig) -> Self {
        let rx = ChannelSettings {
            gain: frontend.rx.gain,
            frequency: frontend.rx.frequency,
            bandwidth: frontend.rx.bandwidth,
            antenna: 0,
        };
        let tx = ChannelSettings {
            gain: frontend.tx.gain,
            frequency: frontend.tx.frequency,
            bandwidth: frontend.tx.bandwidth,
            antenna: 0,
        };
        let clock_source = CLOCK_SOURCES
            .iter()
            .position(|s| *s == frontend.clock.source)
            .unwrap_or(0);
        Self {
            bus,
            map,
            channels: [[rx; NUM_CHANNELS], [tx; NUM_CHANNELS]],
            sample_rates: [frontend.rx.sample_rate, frontend.tx.sample_rate],
            clock_source,
            reference_clock: frontend.clock.reference_hz,
        }
    }

    /// Raw register read.
    pub fn read_register(&self, addr: u32) -> Result<u32> {
        self.bus.read(addr)
    }

    /// Raw register write.
    pub fn write_register(&self, addr: u32, value: u32) -> Result<()> {
        debug!(addr = format_args!("0x{addr:05x}"), value, "Register write");
        self.bus.write(addr, value)
    }

    fn channel(&self, direction: Direction, channel: usize) -> Result<&ChannelSettings> {
        self.channels[direction.index()]
            .get(channel)
            .ok_or(M2sdrError::InvalidChannel { direction, channel })
    }

    fn channel_mut(&mut self, direction: Direction, channel: usize) -> Result<&mut ChannelSettings> {
        self.channels[direction.index()]
            .get_mut(channel)
            .ok_or(M2sdrError::InvalidChannel { direction, channel })
    }

    /// Cached gain in dB.
    pub fn gain(&self, direction: Direction, channel: usize) -> Result<f64> {
        Ok(self.channel(direction, channel)?.gain)
    }

    /// Set the gain in dB.
    pub fn set_gain(&mut self, direction: Direction, channel: usize, gain: f64) -> Result<()> {
        self.channel(direction, channel)?;
        gain_range(direction).check("gain", gain)?;
        let addr = self.map.channel_reg(self.map.gain, direction, channel, 1);
        self.bus.write(addr, (gain.round() as i32) as u32)?;
        self.channel_mut(direction, channel)?.gain = gain;
        debug!(%direction, channel, gain, "Gain set");
        Ok(())
    }

    /// Cached center frequency in Hz.
    pub fn frequency(&self, direction: Direction, channel: usize) -> Result<f64> {
        Ok(self.channel(direction, channel)?.frequency)
    }

    /// Tune the center frequency in Hz.
    pub fn set_frequency(&mut self, direction: Direction, channel: usize, frequency: f64) -> Result<()> {
        self.channel(direction, channel)?;
        frequency_range(direction).check("frequency", frequency)?;
        let hz = frequency.round() as u64;
        let addr = self.map.channel_reg(self.map.frequency, direction, channel, 2);
        self.bus.write(addr, hz as u32)?;
        self.bus.write(addr + 4, (hz >> 32) as u32)?;
        self.channel_mut(direction, channel)?.frequency = frequency;
        debug!(%direction, channel, frequency, "Frequency set");
        Ok(())
    }

    /// Cached analog bandwidth in Hz.
    pub fn bandwidth(&self, direction: Direction, channel: usize) -> Result<f64> {
        Ok(self.channel(direction, channel)?.bandwidth)
    }

    /// Set the analog bandwidth in Hz.
    pub fn set_bandwidth(&mut self, direction: Direction, channel: usize, bandwidth: f64) -> Result<()> {
        self.channel(direction, channel)?;
        BANDWIDTH_RANGE.check("bandwidth", bandwidth)?;
        let addr = self.map.channel_reg(self.map.bandwidth, direction, channel, 1);
        self.bus.write(addr, bandwidth.round() as u32)?;
        self.channel_mut(direction, channel)?.bandwidth = bandwidth;
        debug!(%direction, channel, bandwidth, "Bandwidth set");
        Ok(())
    }

    /// Selected antenna name.
    pub fn antenna(&self, direction: Direction, channel: usize) -> Result<&'static str> {
        let index = self.channel(direction, channel)?.antenna;
        Ok(antennas(direction)[index])
    }

    /// Select an antenna by name.
    pub fn set_antenna(&mut self, direction: Direction, channel: usize, name: &str) -> Result<()> {
        self.channel(direction, channel)?;
        let index = antennas(direction)
            .iter()
            .position(|a| *a == name)
            .ok_or_else(|| M2sdrError::UnknownName {
                kind: "antenna",
                name: name.to_string(),
            })?;
        let addr = self.map.channel_reg(self.map.antenna, direction, channel, 1);
        self.bus.write(addr, index as u32)?;
        self.channel_mut(direction, channel)?.antenna = index;
        Ok(())
    }

    /// Cached sample rate in Hz.
    pub fn sample_rate(&self, direction: Direction) -> f64 {
        self.sample_rates[direction.index()]
    }

    /// Set the sample rate in Hz.
    pub fn set_sample_rate(&mut self, direction: Direction, rate: f64) -> Result<()> {
        SAMPLE_RATE_RANGE.check("sample rate", rate)?;
        let addr = self.map.direction_reg(self.map.sample_rate, direction);
        self.bus.write(addr, rate.round() as u32)?;
        self.sample_rates[direction.index()] = rate;
        debug!(%direction, rate, "Sample rate set");
        Ok(())
    }

    /// Selected clock source.
    pub fn clock_source(&self) -> &'static str {
        CLOCK_SOURCES[self.clock_source]
    }

    /// Select the clock source by name.
    pub fn set_clock_source(&mut self, name: &str) -> Result<()> {
        let index = CLOCK_SOURCES
            .iter()
            .position(|s| *s == name)
            .ok_or_else(|| M2sdrError::UnknownName {
                kind: "clock source",
                name: name.to_string(),
            })?;
        self.bus.write(self.map.clock_source, index as u32)?;
        self.clock_source = index;
        Ok(())
    }

    /// Reference clock rate in Hz.
    pub fn reference_clock_rate(&self) -> f64 {
        self.reference_clock
    }
}

impl std::fmt::Debug for ControlPlane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlPlane")
            .field("map", &self.map)
            .field("channels", &self.channels)
            .field("sample_rates", &self.sample_rates)
            .field("clock_source", &self.clock_source())
            .finish_non_exhaustive()
    }
}
