//! Hardware DMA channel abstraction.
//!
//! The kernel owns a ring of fixed-size buffers per direction and exposes it
//! through a character device. The streaming engine only needs a handful of
//! primitives from it, captured by the [`DmaChannel`] trait:
//!
//! - a stable base address per ring slot (the mapping lives as long as the
//!   channel)
//! - start/stop of a direction's DMA engine
//! - the hardware and software buffer counters
//! - advancing the software counter (releasing buffers to the hardware)
//! - waiting for readiness with a timeout
//!
//! Two implementations are provided:
//!
//! - [`LitePcieChannel`] - the LitePCIe character device (`/dev/m2sdr0`)
//! - [`SimulatedChannel`] - an in-process ring driven by test code, used by
//!   the test-suite, the benches and `m2sdr_stream --simulate`
//!
//! # Counter semantics
//!
//! ```text
//!  RX (device -> host, "DMA writer")
//!    hw_count: buffers filled by hardware
//!    sw_count: buffers handed back by software
//!
//!  TX (host -> device, "DMA reader")
//!    hw_count: buffers drained by hardware
//!    sw_count: buffers supplied by software
//! ```
//!
//! Both counters are monotonic; ring slot `n % buffer_count` holds buffer `n`.

use std::fmt;
use std::ptr::NonNull;
use std::time::Duration;

use crate::error::Result;

pub mod litepcie;
pub mod simulated;

pub use litepcie::LitePcieChannel;
pub use simulated::SimulatedChannel;

/// Stream direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Receive: hardware fills buffers, software drains them.
    Rx,
    /// Transmit: software fills buffers, hardware drains them.
    Tx,
}

impl Direction {
    /// Both directions, RX first.
    pub const ALL: [Direction; 2] = [Direction::Rx, Direction::Tx];

    /// Position of this direction in per-direction tables.
    pub const fn index(self) -> usize {
        match self {
            Self::Rx => 0,
            Self::Tx => 1,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rx => f.write_str("RX"),
            Self::Tx => f.write_str("TX"),
        }
    }
}

/// Fixed geometry of one direction's ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingGeometry {
    /// Size of each buffer in bytes
    pub buffer_size: usize,
    /// Number of buffers in the ring
    pub buffer_count: usize,
}

impl RingGeometry {
    /// Total bytes spanned by the ring.
    pub const fn total_bytes(&self) -> usize {
        self.buffer_size * self.buffer_count
    }

    /// Ring slot of the absolute buffer sequence number `seq`.
    pub const fn slot(&self, seq: u64) -> usize {
        (seq % self.buffer_count as u64) as usize
    }
}

/// Snapshot of a direction's buffer counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DmaCounters {
    /// Buffers processed by hardware
    pub hw_count: u64,
    /// Buffers released or supplied by software, as recorded by the kernel
    pub sw_count: u64,
}

/// Hardware DMA channel for both directions.
///
/// Implementations must keep every buffer address returned by
/// [`buffer_ptr`](Self::buffer_ptr) valid for the lifetime of the channel.
pub trait DmaChannel: Send + Sync {
    /// Path or name identifying the channel in logs and errors.
    fn name(&self) -> &str;

    /// Ring geometry for `direction`.
    fn geometry(&self, direction: Direction) -> RingGeometry;

    /// Base address of ring slot `index` (`index < buffer_count`).
    fn buffer_ptr(&self, direction: Direction, index: usize) -> NonNull<u8>;

    /// Take exclusive ownership of `direction` and enable its engine.
    ///
    /// Returns the counters observed right after enabling.
    fn start(&self, direction: Direction, loopback: bool) -> Result<DmaCounters>;

    /// Disable `direction` and release exclusive ownership.
    fn stop(&self, direction: Direction) -> Result<()>;

    /// Current counters for `direction`.
    fn counters(&self, direction: Direction) -> Result<DmaCounters>;

    /// Publish the software counter: buffers below `sw_count` are released
    /// (RX) or ready for transmission (TX).
    fn update(&self, direction: Direction, sw_count: u64) -> Result<()>;

    /// Flag TX buffer `seq` as the final, possibly short, buffer of a burst
    /// holding `valid_bytes` bytes of payload.
    ///
    /// Called before the buffer is published with [`update`](Self::update).
    fn mark_end_of_burst(&self, seq: u64, valid_bytes: usize) -> Result<()>;

    /// Wait until `direction` is ready relative to software position
    /// `sw_count`: for RX a buffer beyond `sw_count` is filled, for TX a slot
    /// is free (`sw_count - hw_count < buffer_count`).
    ///
    /// Returns `Ok(false)` when `timeout` elapses first.
    fn wait_ready(&self, direction: Direction, sw_count: u64, timeout: Duration) -> Result<bool>;
}
