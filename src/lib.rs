//! # LiteX-M2SDR streaming library
//!
//! User-space streaming engine for the LiteX-M2SDR PCIe software-defined
//! radio. The kernel's LitePCIe driver exposes a ring of fixed-size DMA
//! buffers per direction; this crate turns them into RX and TX sample
//! streams with no loss or duplication across buffer boundaries.
//!
//! ## Crate Structure
//!
//! - **`device`**: `M2sdrDevice`, the entry point. Owns the DMA channel, one
//!   stream per direction and the control plane.
//! - **`stream`**: the per-direction state machine, zero-copy buffer access
//!   (`stream::direct`) and arbitrary-length reads and writes
//!   (`stream::remainder`), with overflow and underflow detection.
//! - **`dma`**: the `DmaChannel` trait with the LitePCIe implementation and an
//!   in-process simulated channel for tests and demos.
//! - **`control`**: register bus access and cached front-end settings.
//! - **`format`**: the CS16 sample encoding.
//! - **`config`**: Figment-based configuration (`config/m2sdr.toml` plus
//!   `M2SDR_` environment variables).
//! - **`logging`**: `tracing-subscriber` initialisation.
//! - **`error`**: the `M2sdrError` enum.
//!
//! ## Example
//!
//! ```no_run
//! use std::time::Duration;
//! use litex_m2sdr::{config::M2sdrConfig, Cs16, Direction, M2sdrDevice, StreamFlags};
//!
//! # fn main() -> litex_m2sdr::Result<()> {
//! let device = M2sdrDevice::open(&M2sdrConfig::load()?)?;
//! let rx = device.setup_stream(Direction::Rx, "CS16", &[0], &[])?;
//! device.activate_stream(rx, StreamFlags::empty(), 0, 0)?;
//!
//! let mut samples = vec![Cs16::default(); 4096];
//! let result = device.read_stream(&mut samples, Duration::from_millis(100))?;
//! if result.overflow {
//!     eprintln!("dropped samples before element {:?}", result.overflow_at);
//! }
//!
//! device.deactivate_stream(rx, StreamFlags::empty(), 0)?;
//! device.close_stream(rx)?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod control;
pub mod device;
pub mod dma;
pub mod error;
pub mod format;
pub mod logging;
pub mod stream;

pub use device::M2sdrDevice;
pub use dma::{DmaChannel, Direction, SimulatedChannel};
pub use error::{M2sdrError, Result};
pub use format::{Cs16, SampleFormat};
pub use stream::{
    ReadBuffer, ReadResult, StreamFlags, StreamId, StreamState, StreamStatus, WriteBuffer,
    WriteResult,
};
