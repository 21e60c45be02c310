//! Arbitrary-length reads and writes on top of block-sized DMA buffers.
//!
//! The adapter keeps at most one partially used buffer per direction, the
//! remainder. For RX it is the unread tail of the last acquired buffer; for
//! TX it is a buffer that has been partly filled and not yet queued. A
//! remainder is always a held buffer: it is released the moment it is used up
//! (or, for TX, when a burst ends), never earlier.
//!
//! Requests are served remainder first, then buffer by buffer, until the
//! caller's slice is satisfied or the deadline passes. Samples are copied
//! unmodified; `buf.len()` counts CS16 samples over all active channels, so it
//! must be a multiple of the channel count.

use std::time::Duration;

use tracing::trace;

use super::{deadline_after, remaining, ReadResult, Remainder, Stream, StreamFlags, StreamState, WriteResult};
use crate::dma::{DmaChannel, Direction};
use crate::error::{M2sdrError, Result};
use crate::format::Cs16;

impl Stream {
    fn elements_in(&self, samples: usize) -> Result<usize> {
        let nch = self.channels.len();
        if samples % nch != 0 {
            return Err(M2sdrError::InvalidLength {
                requested: samples,
                reason: format!("not a whole number of {nch}-channel frames"),
            });
        }
        Ok(samples / nch)
    }

    /// Fill `buf` with received samples.
    pub(crate) fn read(
        &mut self,
        channel: &dyn DmaChannel,
        buf: &mut [Cs16],
        timeout: Duration,
    ) -> Result<ReadResult> {
        self.ensure(StreamState::Active, "read from")?;
        let wanted = self.elements_in(buf.len())?;
        let deadline = deadline_after(timeout);
        let frame_bytes = self.frame_bytes();
        let out: &mut [u8] = bytemuck::cast_slice_mut(buf);
        let mut result = ReadResult::default();

        while result.elements < wanted {
            let Some(mut rem) = self.remainder.take() else {
                match self.acquire_read(channel, remaining(deadline))? {
                    Some(acquired) => {
                        if acquired.overflow {
                            result.overflow = true;
                            result.flags |= StreamFlags::END_ABRUPT;
                            result.overflow_at.get_or_insert(result.elements);
                        }
                        self.remainder = Some(Remainder {
                            seq: acquired.seq,
                            handle: acquired.handle,
                            offset: 0,
                            samples: self.mtu,
                        });
                    }
                    None => {
                        result.timed_out = true;
                        break;
                    }
                }
                continue;
            };

            let n = rem.samples.min(wanted - result.elements);
            let src = channel.buffer_ptr(Direction::Rx, rem.handle);
            let dst = &mut out[result.elements * frame_bytes..(result.elements + n) * frame_bytes];
            // SAFETY: the remainder's buffer is held, `offset + samples`
            // never exceeds the MTU, and `dst` is a distinct caller slice.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    src.as_ptr().add(rem.offset * frame_bytes),
                    dst.as_mut_ptr(),
                    dst.len(),
                );
            }
            rem.offset += n;
            rem.samples -= n;
            result.elements += n;

            if rem.samples == 0 {
                self.release_read(channel, rem.seq, self.generation)?;
                self.user_count += 1;
            } else {
                self.remainder = Some(rem);
            }
        }

        self.stats.elements += result.elements as u64;
        trace!(
            wanted,
            delivered = result.elements,
            timed_out = result.timed_out,
            remainder = self.remainder.map_or(0, |r| r.samples),
            "read_stream"
        );
        Ok(result)
    }

    /// Queue `buf` for transmission.
    ///
    /// Without `END_BURST` a partly filled last buffer stays as the remainder
    /// and is topped up by the next call. With `END_BURST` it is queued at
    /// once, zero-padded and flagged as the end of the burst; an empty
    /// `END_BURST` write with nothing pending queues one silent buffer.
    pub(crate) fn write(
        &mut self,
        channel: &dyn DmaChannel,
        buf: &[Cs16],
        flags: StreamFlags,
        time_ns: i64,
        timeout: Duration,
    ) -> Result<WriteResult> {
        self.ensure(StreamState::Active, "write to")?;
        let wanted = self.elements_in(buf.len())?;
        let deadline = deadline_after(timeout);
        let frame_bytes = self.frame_bytes();
        let input: &[u8] = bytemuck::cast_slice(buf);
        let end_burst = flags.contains(StreamFlags::END_BURST);
        let mut result = WriteResult {
            flags,
            ..WriteResult::default()
        };
        let mut burst_flushed = false;

        while result.elements < wanted || (end_burst && !burst_flushed) {
            let mut rem = match self.remainder.take() {
                Some(rem) => rem,
                None => match self.acquire_write(channel, remaining(deadline))? {
                    Some(acquired) => {
                        if acquired.underflow {
                            result.underflow = true;
                        }
                        Remainder {
                            seq: acquired.seq,
                            handle: acquired.handle,
                            offset: 0,
                            samples: self.mtu,
                        }
                    }
                    None => {
                        result.timed_out = true;
                        break;
                    }
                },
            };

            let n = rem.samples.min(wanted - result.elements);
            if n > 0 {
                let src = &input[result.elements * frame_bytes..(result.elements + n) * frame_bytes];
                let dst = channel.buffer_ptr(Direction::Tx, rem.handle);
                // SAFETY: the remainder's buffer is held and unpublished;
                // `offset + n` never exceeds the MTU.
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        src.as_ptr(),
                        dst.as_ptr().add(rem.offset * frame_bytes),
                        src.len(),
                    );
                }
                rem.offset += n;
                rem.samples -= n;
                result.elements += n;
            }

            let last = result.elements == wanted;
            if rem.samples == 0 || (last && end_burst) {
                let release_flags = if last && end_burst {
                    burst_flushed = true;
                    StreamFlags::END_BURST
                } else {
                    StreamFlags::empty()
                };
                self.release_write(
                    channel,
                    rem.seq,
                    self.generation,
                    rem.offset,
                    release_flags,
                    time_ns,
                )?;
                self.user_count += 1;
            } else {
                self.remainder = Some(rem);
            }
        }

        self.stats.elements += result.elements as u64;
        trace!(
            wanted,
            queued = result.elements,
            timed_out = result.timed_out,
            remainder = self.remainder.map_or(0, |r| r.offset),
            "write_stream"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::{RingGeometry, SimulatedChannel};

    const BUFFER_SIZE: usize = 64;

    fn active(direction: Direction) -> (SimulatedChannel, Stream) {
        let chan = SimulatedChannel::new(RingGeometry {
            buffer_size: BUFFER_SIZE,
            buffer_count: 4,
        })
        .unwrap();
        let mut stream = Stream::new(direction);
        stream.setup(&chan, "CS16", &[0], &[]).unwrap();
        stream.activate(&chan).unwrap();
        (chan, stream)
    }

    fn pattern(start: i16, n: usize) -> Vec<Cs16> {
        (0..n as i16).map(|i| Cs16::new(start + i, -(start + i))).collect()
    }

    #[test]
    fn test_short_read_keeps_remainder() {
        let (chan, mut stream) = active(Direction::Rx);
        let samples = pattern(0, 16);
        chan.inject_rx(bytemuck::cast_slice(&samples));

        let mut out = vec![Cs16::default(); 5];
        let res = stream.read(&chan, &mut out, Duration::ZERO).unwrap();
        assert_eq!(res.elements, 5);
        assert_eq!(out, &samples[..5]);
        let rem = stream.remainder.unwrap();
        assert_eq!((rem.offset, rem.samples), (5, 11));
        assert_eq!(stream.held.len(), 1);

        let mut out = vec![Cs16::default(); 11];
        stream.read(&chan, &mut out, Duration::ZERO).unwrap();
        assert_eq!(out, &samples[5..]);
        assert!(stream.remainder.is_none());
        assert!(stream.held.is_empty());
        assert_eq!(stream.user_count, 1);
    }

    #[test]
    fn test_read_times_out_with_partial_data() {
        let (chan, mut stream) = active(Direction::Rx);
        chan.inject_rx(bytemuck::cast_slice(&pattern(0, 16)));
        let mut out = vec![Cs16::default(); 20];
        let res = stream.read(&chan, &mut out, Duration::from_millis(1)).unwrap();
        assert_eq!(res.elements, 16);
        assert!(res.timed_out);
    }

    #[test]
    fn test_read_rejects_partial_frames() {
        let chan = SimulatedChannel::new(RingGeometry {
            buffer_size: BUFFER_SIZE,
            buffer_count: 4,
        })
        .unwrap();
        let mut stream = Stream::new(Direction::Rx);
        stream.setup(&chan, "CS16", &[0, 1], &[]).unwrap();
        stream.activate(&chan).unwrap();
        let mut out = vec![Cs16::default(); 3];
        assert!(matches!(
            stream.read(&chan, &mut out, Duration::ZERO),
            Err(M2sdrError::InvalidLength { requested: 3, .. })
        ));
    }

    #[test]
    fn test_write_accumulates_until_full() {
        let (chan, mut stream) = active(Direction::Tx);
        stream
            .write(&chan, &pattern(0, 10), StreamFlags::empty(), 0, Duration::ZERO)
            .unwrap();
        assert_eq!(chan.snapshot(Direction::Tx).sw_count, 0);
        assert_eq!(stream.remainder.map(|r| r.offset), Some(10));

        stream
            .write(&chan, &pattern(10, 6), StreamFlags::empty(), 0, Duration::ZERO)
            .unwrap();
        assert_eq!(chan.snapshot(Direction::Tx).sw_count, 1);
        let sent = chan.drain_tx().unwrap();
        assert_eq!(bytemuck::cast_slice::<u8, Cs16>(&sent), pattern(0, 16).as_slice());
    }

    #[test]
    fn test_end_burst_flushes_short_buffer() {
        let (chan, mut stream) = active(Direction::Tx);
        let res = stream
            .write(&chan, &pattern(1, 3), StreamFlags::END_BURST, 0, Duration::ZERO)
            .unwrap();
        assert_eq!(res.elements, 3);
        assert!(stream.remainder.is_none());
        assert!(stream.burst_end);
        assert_eq!(stream.burst_samps, 3);
        assert_eq!(chan.burst_marks(), vec![(0, 12)]);
    }

    #[test]
    fn test_empty_end_burst_sends_silence() {
        let (chan, mut stream) = active(Direction::Tx);
        stream
            .write(&chan, &[], StreamFlags::END_BURST, 0, Duration::ZERO)
            .unwrap();
        assert_eq!(chan.burst_marks(), vec![(0, 0)]);
        assert!(chan.drain_tx().unwrap().iter().all(|&b| b == 0));
    }
}
