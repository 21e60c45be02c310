//! Per-direction stream state and counter bookkeeping.
//!
//! A device owns exactly two [`Stream`]s, one per [`Direction`], each behind
//! its own mutex so RX and TX can be driven from different threads. A stream
//! moves through
//!
//! ```text
//!   Closed --setup--> Opened --activate--> Active
//!     ^                 |  ^                  |
//!     +------close------+  +---deactivate-----+
//! ```
//!
//! Buffers are tracked by absolute sequence number: buffer `seq` lives in
//! ring slot `seq % buffer_count`. `sw_count` is the next sequence number
//! software will acquire; the buffers acquired but not yet released are kept
//! oldest first in `held`, and the kernel is told to release everything below
//! the oldest held buffer.
//!
//! - [`direct`] implements zero-copy acquire/release on top of this state.
//! - [`remainder`] turns block-sized buffers into arbitrary-length reads and
//!   writes.

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use bitflags::bitflags;
use tracing::{debug, info};

use crate::dma::{DmaChannel, Direction, RingGeometry};
use crate::error::{M2sdrError, Result};
use crate::format::SampleFormat;

pub mod direct;
pub mod remainder;

pub use direct::{ReadBuffer, WriteBuffer};

/// Identity of one of the two streams of a device.
pub type StreamId = Direction;

/// Lifecycle state of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamState {
    /// Not set up
    #[default]
    Closed,
    /// Set up, DMA engine stopped
    Opened,
    /// DMA engine running; buffers may be acquired
    Active,
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

bitflags! {
    /// Per-call stream flags (SoapySDR bit values).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct StreamFlags: u32 {
        /// Last buffer of a burst
        const END_BURST = 1 << 1;
        /// `time_ns` is valid
        const HAS_TIME = 1 << 2;
        /// Stream ended abruptly (overflow/underflow)
        const END_ABRUPT = 1 << 3;
        /// Transfer at most one packet
        const ONE_PACKET = 1 << 4;
        /// More fragments of the same packet follow
        const MORE_FRAGMENTS = 1 << 5;
    }
}

/// Options accepted by `setup_stream`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamArgs {
    /// Route TX back into RX inside the FPGA.
    pub loopback: bool,
}

impl StreamArgs {
    /// Parse `key=value` stream options.
    pub fn parse(args: &[(&str, &str)]) -> Result<Self> {
        let mut parsed = Self::default();
        for &(key, value) in args {
            match key {
                "loopback" => {
                    parsed.loopback = parse_bool(value).ok_or_else(|| M2sdrError::InvalidStreamArg {
                        key: key.to_string(),
                        value: value.to_string(),
                    })?;
                }
                _ => {
                    return Err(M2sdrError::UnknownStreamArg {
                        key: key.to_string(),
                    })
                }
            }
        }
        Ok(parsed)
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Running totals for one stream, kept across activations until the next
/// setup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    /// Buffers handed to software
    pub buffers_acquired: u64,
    /// Buffers given back to the hardware
    pub buffers_released: u64,
    /// Overflow events (RX)
    pub overflows: u64,
    /// Underflow events (TX)
    pub underflows: u64,
    /// Buffers discarded by overflow resynchronisation
    pub dropped_buffers: u64,
    /// Elements moved through `read_stream` / `write_stream`
    pub elements: u64,
    /// Completed bursts (TX)
    pub bursts: u64,
}

/// Snapshot of a stream's counters and remainder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamStatus {
    /// Lifecycle state
    pub state: StreamState,
    /// Active channels
    pub channels: Vec<usize>,
    /// Buffers processed by hardware, as last observed
    pub hw_count: u64,
    /// Buffers acquired by software
    pub sw_count: u64,
    /// Buffers fully delivered to / consumed from the caller
    pub user_count: u64,
    /// Buffers acquired and not yet released
    pub held: usize,
    /// Ring slot of the partially consumed buffer
    pub remainder_handle: Option<usize>,
    /// Elements left in the remainder
    pub remainder_samples: usize,
    /// Elements already consumed from the remainder
    pub remainder_offset: usize,
    /// Overflow detected and not yet reported
    pub overflow: bool,
    /// Underflow detected and not yet reported
    pub underflow: bool,
    /// The last released TX buffer ended a burst
    pub burst_end: bool,
    /// Elements in the current (or just ended) burst
    pub burst_samps: u64,
    /// Running totals
    pub stats: StreamStats,
}

/// Outcome of `read_stream`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadResult {
    /// Elements (frames) written to the caller's buffer
    pub elements: usize,
    /// Stream flags for the delivered data
    pub flags: StreamFlags,
    /// Timestamp of the first element (always 0: no hardware time)
    pub time_ns: i64,
    /// The deadline passed before the request was satisfied
    pub timed_out: bool,
    /// Buffers were dropped by the hardware during this call
    pub overflow: bool,
    /// Element offset of the first discontinuity, when `overflow` is set
    pub overflow_at: Option<usize>,
}

/// Outcome of `write_stream`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteResult {
    /// Elements (frames) taken from the caller's buffer
    pub elements: usize,
    /// Stream flags applied
    pub flags: StreamFlags,
    /// The deadline passed before all elements were queued
    pub timed_out: bool,
    /// The hardware ran dry before this call supplied data
    pub underflow: bool,
}

/// Partially consumed buffer retained between calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Remainder {
    pub(crate) seq: u64,
    pub(crate) handle: usize,
    /// Elements already consumed (RX) or filled (TX)
    pub(crate) offset: usize,
    /// Elements left
    pub(crate) samples: usize,
}

/// Buffer handed out by an acquire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Acquired {
    pub(crate) seq: u64,
    pub(crate) handle: usize,
    pub(crate) overflow: bool,
    pub(crate) underflow: bool,
}

/// State of one direction.
#[derive(Debug)]
pub(crate) struct Stream {
    pub(crate) direction: Direction,
    pub(crate) state: StreamState,
    pub(crate) format: SampleFormat,
    pub(crate) channels: Vec<usize>,
    pub(crate) args: StreamArgs,
    pub(crate) geometry: RingGeometry,
    /// Elements per buffer
    pub(crate) mtu: usize,
    /// Bumped on every activate/deactivate so stale buffers are rejected
    pub(crate) generation: u64,
    pub(crate) hw_count: u64,
    pub(crate) sw_count: u64,
    pub(crate) user_count: u64,
    pub(crate) held: VecDeque<u64>,
    pub(crate) remainder: Option<Remainder>,
    pub(crate) overflow: bool,
    pub(crate) underflow: bool,
    pub(crate) last_underflow_hw: u64,
    pub(crate) burst_end: bool,
    pub(crate) burst_samps: u64,
    pub(crate) stats: StreamStats,
}

impl Stream {
    pub(crate) fn new(direction: Direction) -> Self {
        Self {
            direction,
            state: StreamState::Closed,
            format: SampleFormat::Cs16,
            channels: Vec::new(),
            args: StreamArgs::default(),
            geometry: RingGeometry {
                buffer_size: 0,
                buffer_count: 0,
            },
            mtu: 0,
            generation: 0,
            hw_count: 0,
            sw_count: 0,
            user_count: 0,
            held: VecDeque::new(),
            remainder: None,
            overflow: false,
            underflow: false,
            last_underflow_hw: 0,
            burst_end: false,
            burst_samps: 0,
            stats: StreamStats::default(),
        }
    }

    pub(crate) fn ensure(&self, expected: StreamState, operation: &'static str) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(M2sdrError::InvalidState {
                direction: self.direction,
                state: self.state,
                operation,
            })
        }
    }

    /// Bytes per element (one sample for every active channel).
    pub(crate) fn frame_bytes(&self) -> usize {
        self.format.frame_bytes(self.channels.len())
    }

    fn reset_counters(&mut self) {
        self.hw_count = 0;
        self.sw_count = 0;
        self.user_count = 0;
        self.held.clear();
        self.remainder = None;
        self.overflow = false;
        self.underflow = false;
        self.last_underflow_hw = 0;
        self.burst_end = false;
        self.burst_samps = 0;
    }

    pub(crate) fn setup(
        &mut self,
        channel: &dyn DmaChannel,
        format: &str,
        channels: &[usize],
        args: &[(&str, &str)],
    ) -> Result<()> {
        self.ensure(StreamState::Closed, "set up")?;

        let format: SampleFormat = format.parse()?;
        let distinct = channels.len() != 2 || channels[0] != channels[1];
        if channels.is_empty() || channels.len() > 2 || !distinct || channels.iter().any(|&c| c > 1)
        {
            return Err(M2sdrError::InvalidChannelSelection {
                channels: channels.to_vec(),
            });
        }
        let args = StreamArgs::parse(args)?;

        let geometry = channel.geometry(self.direction);
        let frame_bytes = format.frame_bytes(channels.len());
        if geometry.buffer_size == 0 || geometry.buffer_size % frame_bytes != 0 {
            return Err(M2sdrError::FormatMismatch {
                direction: self.direction,
                buffer_bytes: geometry.buffer_size,
                frame_bytes,
            });
        }

        self.format = format;
        self.channels = channels.to_vec();
        self.args = args;
        self.geometry = geometry;
        self.mtu = geometry.buffer_size / frame_bytes;
        self.reset_counters();
        self.stats = StreamStats::default();
        self.state = StreamState::Opened;

        info!(
            direction = %self.direction,
            format = %format,
            channels = ?self.channels,
            buffer_size = geometry.buffer_size,
            buffer_count = geometry.buffer_count,
            mtu = self.mtu,
            "Stream set up"
        );
        Ok(())
    }

    pub(crate) fn activate(&mut self, channel: &dyn DmaChannel) -> Result<()> {
        self.ensure(StreamState::Opened, "activate")?;
        let counters = channel.start(self.direction, self.args.loopback)?;

        self.generation += 1;
        self.hw_count = counters.hw_count;
        self.sw_count = counters.hw_count;
        self.last_underflow_hw = counters.hw_count;
        self.held.clear();
        self.remainder = None;
        self.state = StreamState::Active;

        info!(
            direction = %self.direction,
            hw_count = counters.hw_count,
            loopback = self.args.loopback,
            "Stream activated"
        );
        Ok(())
    }

    pub(crate) fn deactivate(&mut self, channel: &dyn DmaChannel) -> Result<()> {
        self.ensure(StreamState::Active, "deactivate")?;
        channel.stop(self.direction)?;

        if let Some(remainder) = self.remainder.take() {
            debug!(
                direction = %self.direction,
                handle = remainder.handle,
                samples = remainder.samples,
                "Flushed remainder"
            );
        }
        self.held.clear();
        self.generation += 1;
        self.state = StreamState::Opened;

        info!(
            direction = %self.direction,
            sw_count = self.sw_count,
            user_count = self.user_count,
            "Stream deactivated"
        );
        Ok(())
    }

    pub(crate) fn close(&mut self) -> Result<()> {
        self.ensure(StreamState::Opened, "close")?;
        self.reset_counters();
        self.channels.clear();
        self.state = StreamState::Closed;
        info!(direction = %self.direction, "Stream closed");
        Ok(())
    }

    /// Sequence number below which every buffer has been released.
    pub(crate) fn watermark(&self) -> u64 {
        self.held.front().copied().unwrap_or(self.sw_count)
    }

    pub(crate) fn status(&self) -> StreamStatus {
        StreamStatus {
            state: self.state,
            channels: self.channels.clone(),
            hw_count: self.hw_count,
            sw_count: self.sw_count,
            user_count: self.user_count,
            held: self.held.len(),
            remainder_handle: self.remainder.map(|r| r.handle),
            remainder_samples: self.remainder.map_or(0, |r| r.samples),
            remainder_offset: self.remainder.map_or(0, |r| r.offset),
            overflow: self.overflow,
            underflow: self.underflow,
            burst_end: self.burst_end,
            burst_samps: self.burst_samps,
            stats: self.stats,
        }
    }
}

/// Deadline `timeout` from now; `None` when it does not fit in an `Instant`
/// (for example `Duration::MAX`), meaning wait indefinitely.
pub(crate) fn deadline_after(timeout: Duration) -> Option<Instant> {
    Instant::now().checked_add(timeout)
}

/// Time left until `deadline`, zero once it has passed.
pub(crate) fn remaining(deadline: Option<Instant>) -> Duration {
    match deadline {
        Some(deadline) => deadline.saturating_duration_since(Instant::now()),
        None => Duration::MAX,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::SimulatedChannel;

    fn channel(buffer_size: usize) -> SimulatedChannel {
        SimulatedChannel::new(RingGeometry {
            buffer_size,
            buffer_count: 4,
        })
        .unwrap()
    }

    #[test]
    fn test_parse_args() {
        assert!(StreamArgs::parse(&[("loopback", "1")]).unwrap().loopback);
        assert!(!StreamArgs::parse(&[]).unwrap().loopback);
        assert!(matches!(
            StreamArgs::parse(&[("loopback", "maybe")]),
            Err(M2sdrError::InvalidStreamArg { .. })
        ));
        assert!(matches!(
            StreamArgs::parse(&[("bufflen", "4096")]),
            Err(M2sdrError::UnknownStreamArg { .. })
        ));
    }

    #[test]
    fn test_setup_validates_channels() {
        let chan = channel(64);
        let mut stream = Stream::new(Direction::Rx);
        for bad in [&[][..], &[0, 0], &[2], &[0, 1, 1]] {
            let err = stream.setup(&chan, "CS16", bad, &[]).unwrap_err();
            assert!(matches!(err, M2sdrError::InvalidChannelSelection { .. }));
            assert_eq!(stream.state, StreamState::Closed);
        }
        stream.setup(&chan, "CS16", &[1, 0], &[]).unwrap();
        assert_eq!(stream.mtu, 8);
    }

    #[test]
    fn test_setup_rejects_partial_frames() {
        let chan = channel(12);
        let mut stream = Stream::new(Direction::Tx);
        let err = stream.setup(&chan, "CS16", &[0, 1], &[]).unwrap_err();
        assert!(matches!(
            err,
            M2sdrError::FormatMismatch {
                buffer_bytes: 12,
                frame_bytes: 8,
                ..
            }
        ));
        assert!(stream.setup(&chan, "CS16", &[0], &[]).is_ok());
    }

    #[test]
    fn test_lifecycle_transitions() {
        let chan = channel(64);
        let mut stream = Stream::new(Direction::Rx);
        assert!(stream.activate(&chan).unwrap_err().is_invalid_state());
        stream.setup(&chan, "CS16", &[0], &[]).unwrap();
        assert!(stream.setup(&chan, "CS16", &[0], &[]).unwrap_err().is_invalid_state());
        assert!(stream.deactivate(&chan).unwrap_err().is_invalid_state());
        stream.activate(&chan).unwrap();
        assert!(stream.close().unwrap_err().is_invalid_state());
        stream.deactivate(&chan).unwrap();
        stream.close().unwrap();
        assert_eq!(stream.state, StreamState::Closed);
    }

    #[test]
    fn test_failed_start_keeps_opened() {
        let chan = channel(64);
        let mut stream = Stream::new(Direction::Tx);
        stream.setup(&chan, "CS16", &[0], &[]).unwrap();
        chan.fail_next_start(Direction::Tx);
        assert!(stream.activate(&chan).is_err());
        assert_eq!(stream.state, StreamState::Opened);
        assert!(stream.activate(&chan).is_ok());
    }
}
