//! Native sample encoding.
//!
//! The M2SDR moves hardware-native CS16 samples only: one signed 16-bit
//! integer for I followed by one for Q, 4 bytes per complex sample per
//! channel. With two channels active the DMA buffer interleaves them
//! frame by frame (`ch0.I ch0.Q ch1.I ch1.Q ...`).

use std::fmt;
use std::str::FromStr;

use num_complex::Complex;

use crate::error::M2sdrError;

/// One complex CS16 sample.
pub type Cs16 = Complex<i16>;

/// Full-scale magnitude used for calibration (12-bit converter in 16-bit words).
pub const FULL_SCALE: f64 = 4096.0;

/// Sample encodings understood by the stream API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SampleFormat {
    /// Complex signed 16-bit, I then Q.
    #[default]
    Cs16,
}

impl SampleFormat {
    /// Bytes of one complex sample of one channel.
    pub const fn bytes_per_sample(self) -> usize {
        match self {
            Self::Cs16 => std::mem::size_of::<Cs16>(),
        }
    }

    /// Bytes of one frame, i.e. one sample for each active channel.
    pub const fn frame_bytes(self, n_channels: usize) -> usize {
        self.bytes_per_sample() * n_channels
    }

    /// SoapySDR-style format name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Cs16 => "CS16",
        }
    }
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SampleFormat {
    type Err = M2sdrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CS16" => Ok(Self::Cs16),
            other => Err(M2sdrError::InvalidFormat {
                format: other.to_string(),
            }),
        }
    }
}
