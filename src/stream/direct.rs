//! Zero-copy direct access to DMA buffers.
//!
//! An acquire hands out one ring slot as a [`ReadBuffer`] or [`WriteBuffer`].
//! Both borrow the device, so the mapping cannot go away underneath them, are
//! not `Clone`, and are consumed by the matching release: once released, a
//! buffer cannot be touched again from safe code.
//!
//! # Overflow (RX)
//!
//! If the hardware filled more than a ring's worth of buffers beyond what
//! software acquired, the oldest ones have been overwritten. The acquire then
//! skips to the newest filled buffer (`sw_count = hw_count - 1`) and reports
//! the overflow on that buffer, once.
//!
//! # Underflow (TX)
//!
//! If the hardware drained past the last buffer software released, the
//! transmitter ran dry. The next acquire reports it, once, and when no buffer
//! is held the software position restarts at the hardware position.

use std::marker::PhantomData;
use std::ptr::NonNull;
use std::time::Duration;

use tracing::{debug, trace, warn};

use super::{Acquired, Stream, StreamFlags, StreamState};
use crate::dma::{DmaChannel, Direction};
use crate::error::{M2sdrError, Result};
use crate::format::Cs16;

/// A filled RX buffer on loan from the hardware ring.
///
/// Release it with [`M2sdrDevice::release_read_buffer`](crate::M2sdrDevice::release_read_buffer).
#[derive(Debug)]
pub struct ReadBuffer<'a> {
    pub(crate) ptr: NonNull<u8>,
    pub(crate) len: usize,
    pub(crate) handle: usize,
    pub(crate) seq: u64,
    pub(crate) generation: u64,
    pub(crate) elements: usize,
    pub(crate) overflow: bool,
    pub(crate) _device: PhantomData<&'a [u8]>,
}

impl ReadBuffer<'_> {
    /// Ring slot of this buffer.
    pub fn handle(&self) -> usize {
        self.handle
    }

    /// Absolute sequence number since activation.
    pub fn sequence(&self) -> u64 {
        self.seq
    }

    /// Elements (frames) held by this buffer.
    pub fn elements(&self) -> usize {
        self.elements
    }

    /// Base address of the buffer in the DMA mapping.
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Raw buffer contents.
    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: the slot is owned by software between acquire and release,
        // and the mapping outlives the borrow of the device.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Buffer contents as interleaved CS16 samples.
    pub fn samples(&self) -> &[Cs16] {
        bytemuck::cast_slice(self.as_bytes())
    }

    /// Flags for this buffer (`END_ABRUPT` after an overflow).
    pub fn flags(&self) -> StreamFlags {
        if self.overflow {
            StreamFlags::END_ABRUPT
        } else {
            StreamFlags::empty()
        }
    }

    /// Hardware timestamp; always 0 since the DMA carries no time.
    pub fn time_ns(&self) -> i64 {
        0
    }

    /// Buffers were dropped right before this one.
    pub fn overflow(&self) -> bool {
        self.overflow
    }
}

/// An empty TX buffer on loan from the hardware ring.
///
/// Fill it and pass it to
/// [`M2sdrDevice::release_write_buffer`](crate::M2sdrDevice::release_write_buffer).
#[derive(Debug)]
pub struct WriteBuffer<'a> {
    pub(crate) ptr: NonNull<u8>,
    pub(crate) len: usize,
    pub(crate) handle: usize,
    pub(crate) seq: u64,
    pub(crate) generation: u64,
    pub(crate) elements: usize,
    pub(crate) underflow: bool,
    pub(crate) _device: PhantomData<&'a mut [u8]>,
}

impl WriteBuffer<'_> {
    /// Ring slot of this buffer.
    pub fn handle(&self) -> usize {
        self.handle
    }

    /// Absolute sequence number since activation.
    pub fn sequence(&self) -> u64 {
        self.seq
    }

    /// Elements (frames) that fit in this buffer.
    pub fn elements(&self) -> usize {
        self.elements
    }

    /// Base address of the buffer in the DMA mapping.
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Raw buffer contents.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: the slot is owned by software between acquire and release;
        // the hardware only reads slots below the published watermark.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Buffer contents as interleaved CS16 samples.
    pub fn samples_mut(&mut self) -> &mut [Cs16] {
        bytemuck::cast_slice_mut(self.as_bytes_mut())
    }

    /// The transmitter ran dry before this buffer was acquired.
    pub fn underflow(&self) -> bool {
        self.underflow
    }
}

impl Stream {
    fn holds_slot(&self, handle: usize) -> bool {
        self.held.iter().any(|&seq| self.geometry.slot(seq) == handle)
    }

    fn take_held(&mut self, seq: u64, generation: u64) -> Result<()> {
        let position = (generation == self.generation)
            .then(|| self.held.iter().position(|&s| s == seq))
            .flatten()
            .ok_or(M2sdrError::InvalidHandle {
                direction: self.direction,
                handle: self.geometry.slot(seq),
            })?;
        self.held.remove(position);
        Ok(())
    }

    /// Acquire the next filled RX buffer, waiting up to `timeout`.
    pub(crate) fn acquire_read(
        &mut self,
        channel: &dyn DmaChannel,
        timeout: Duration,
    ) -> Result<Option<Acquired>> {
        self.ensure(StreamState::Active, "acquire a buffer on")?;

        self.hw_count = channel.counters(Direction::Rx)?.hw_count;
        if self.hw_count <= self.sw_count {
            if !channel.wait_ready(Direction::Rx, self.sw_count, timeout)? {
                trace!(sw_count = self.sw_count, "RX acquire timed out");
                return Ok(None);
            }
            self.hw_count = channel.counters(Direction::Rx)?.hw_count;
            if self.hw_count <= self.sw_count {
                return Ok(None);
            }
        }

        // On overflow, resync to the newest buffer whose slot the caller is
        // not still holding. Nothing is committed until the slot is known free.
        let depth = self.geometry.buffer_count as u64;
        let overran = self.hw_count - self.sw_count > depth;
        let seq = if overran {
            (self.hw_count - depth..self.hw_count)
                .rev()
                .find(|&seq| !self.holds_slot(self.geometry.slot(seq)))
                .unwrap_or(self.hw_count - 1)
        } else {
            self.sw_count
        };
        let handle = self.geometry.slot(seq);
        if self.holds_slot(handle) {
            return Err(M2sdrError::BufferInUse {
                direction: Direction::Rx,
                handle,
            });
        }

        if overran {
            let dropped = seq - self.sw_count;
            warn!(
                hw_count = self.hw_count,
                sw_count = self.sw_count,
                dropped,
                "RX overflow: hardware overran the ring, dropping oldest buffers"
            );
            self.overflow = true;
            self.stats.overflows += 1;
            self.stats.dropped_buffers += dropped;
        }
        self.sw_count = seq + 1;
        self.held.push_back(seq);
        self.stats.buffers_acquired += 1;
        trace!(seq, handle, hw_count = self.hw_count, "RX buffer acquired");

        Ok(Some(Acquired {
            seq,
            handle,
            overflow: std::mem::take(&mut self.overflow),
            underflow: false,
        }))
    }

    /// Give RX buffer `seq` back to the hardware.
    pub(crate) fn release_read(
        &mut self,
        channel: &dyn DmaChannel,
        seq: u64,
        generation: u64,
    ) -> Result<()> {
        self.ensure(StreamState::Active, "release a buffer on")?;
        self.take_held(seq, generation)?;
        channel.update(Direction::Rx, self.watermark())?;
        self.stats.buffers_released += 1;
        trace!(seq, watermark = self.watermark(), "RX buffer released");
        Ok(())
    }

    /// Acquire the next free TX buffer, waiting up to `timeout`.
    pub(crate) fn acquire_write(
        &mut self,
        channel: &dyn DmaChannel,
        timeout: Duration,
    ) -> Result<Option<Acquired>> {
        self.ensure(StreamState::Active, "acquire a buffer on")?;

        self.hw_count = channel.counters(Direction::Tx)?.hw_count;
        if self.hw_count > self.watermark() && self.hw_count > self.last_underflow_hw {
            warn!(
                hw_count = self.hw_count,
                watermark = self.watermark(),
                "TX underflow: hardware drained all supplied buffers"
            );
            self.underflow = true;
            self.last_underflow_hw = self.hw_count;
            self.stats.underflows += 1;
            if self.held.is_empty() {
                self.sw_count = self.hw_count;
            }
        }

        let depth = self.geometry.buffer_count as u64;
        if self.sw_count.saturating_sub(self.hw_count) >= depth {
            if !channel.wait_ready(Direction::Tx, self.sw_count, timeout)? {
                trace!(sw_count = self.sw_count, "TX acquire timed out");
                return Ok(None);
            }
            self.hw_count = channel.counters(Direction::Tx)?.hw_count;
            if self.sw_count.saturating_sub(self.hw_count) >= depth {
                return Ok(None);
            }
        }

        let seq = self.sw_count;
        let handle = self.geometry.slot(seq);
        if self.holds_slot(handle) {
            return Err(M2sdrError::BufferInUse {
                direction: Direction::Tx,
                handle,
            });
        }
        self.sw_count += 1;
        self.held.push_back(seq);
        self.stats.buffers_acquired += 1;
        trace!(seq, handle, hw_count = self.hw_count, "TX buffer acquired");

        Ok(Some(Acquired {
            seq,
            handle,
            overflow: false,
            underflow: std::mem::take(&mut self.underflow),
        }))
    }

    /// Queue TX buffer `seq` holding `num_elems` elements for transmission.
    ///
    /// The unused tail of the buffer is zero-filled.
    pub(crate) fn release_write(
        &mut self,
        channel: &dyn DmaChannel,
        seq: u64,
        generation: u64,
        num_elems: usize,
        flags: StreamFlags,
        time_ns: i64,
    ) -> Result<()> {
        self.ensure(StreamState::Active, "release a buffer on")?;
        if num_elems > self.mtu {
            return Err(M2sdrError::InvalidLength {
                requested: num_elems,
                reason: format!("a TX buffer holds at most {} elements", self.mtu),
            });
        }
        self.take_held(seq, generation)?;

        let handle = self.geometry.slot(seq);
        let valid_bytes = num_elems * self.frame_bytes();
        let base = channel.buffer_ptr(Direction::Tx, handle);
        // SAFETY: the slot was held by software until take_held above and has
        // not been published to the hardware yet.
        unsafe {
            std::ptr::write_bytes(
                base.as_ptr().add(valid_bytes),
                0,
                self.geometry.buffer_size - valid_bytes,
            );
        }

        if flags.contains(StreamFlags::HAS_TIME) {
            debug!(time_ns, "Timed TX is not supported, sending immediately");
        }

        if self.burst_end {
            self.burst_end = false;
            self.burst_samps = 0;
        }
        self.burst_samps += num_elems as u64;
        if flags.contains(StreamFlags::END_BURST) {
            channel.mark_end_of_burst(seq, valid_bytes)?;
            self.burst_end = true;
            self.stats.bursts += 1;
            debug!(seq, valid_bytes, burst_samps = self.burst_samps, "TX burst ended");
        }

        channel.update(Direction::Tx, self.watermark())?;
        self.stats.buffers_released += 1;
        trace!(seq, num_elems, watermark = self.watermark(), "TX buffer released");
        Ok(())
    }
}
