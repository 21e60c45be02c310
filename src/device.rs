//! M2SDR device: two streams, one DMA channel, one control plane.
//!
//! ```text
//!   M2sdrDevice
//!    ├── channel: Arc<dyn DmaChannel>       (mapping lives as long as the device)
//!    ├── streams: [Mutex<Stream>; 2]        (RX, TX; independent hot paths)
//!    └── control: Mutex<ControlPlane>       (register bus + cached settings)
//! ```
//!
//! Every method takes `&self`; the device is `Send + Sync` and can be shared
//! between an RX thread, a TX thread and a control thread. The control-plane
//! mutex is only taken by front-end accessors and at stream activation and
//! deactivation; acquire, release, read and write take only their own
//! direction's mutex. Locks are always taken stream first, control second.

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::config::M2sdrConfig;
use crate::control::{self, ControlPlane, Range, RegisterBus, CLOCK_SOURCES, NUM_CHANNELS};
use crate::dma::{DmaChannel, Direction, LitePcieChannel, RingGeometry, SimulatedChannel};
use crate::error::{M2sdrError, Result};
use crate::format::{Cs16, SampleFormat, FULL_SCALE};
use crate::stream::{
    ReadBuffer, ReadResult, Stream, StreamFlags, StreamId, StreamState, StreamStatus, WriteBuffer,
    WriteResult,
};

/// Driver key reported in [`M2sdrDevice::hardware_info`].
pub const DRIVER_KEY: &str = "LiteX-M2SDR";

/// LiteX-M2SDR streaming device.
pub struct M2sdrDevice {
    channel: Arc<dyn DmaChannel>,
    streams: [Mutex<Stream>; 2],
    control: Mutex<ControlPlane>,
}

impl M2sdrDevice {
    /// Open the device described by `config`: the LitePCIe node at
    /// `device.path`, or a simulated channel when `device.simulate` is set.
    pub fn open(config: &M2sdrConfig) -> Result<Self> {
        if config.device.simulate {
            let channel = SimulatedChannel::new(RingGeometry {
                buffer_size: config.device.sim_buffer_size,
                buffer_count: config.device.sim_buffer_count,
            })?;
            Ok(Self::with_channel(Arc::new(channel), config))
        } else {
            let channel = LitePcieChannel::open(&config.device.path)?;
            Ok(Self::with_channel(Arc::new(channel), config))
        }
    }

    /// Build a device on an already opened channel.
    pub fn with_channel<C>(channel: Arc<C>, config: &M2sdrConfig) -> Self
    where
        C: DmaChannel + RegisterBus + 'static,
    {
        let bus: Arc<dyn RegisterBus> = channel.clone();
        let control = ControlPlane::new(bus, config.registers, &config.frontend);
        info!(device = channel.name(), "M2SDR device ready");
        Self {
            channel,
            streams: [
                Mutex::new(Stream::new(Direction::Rx)),
                Mutex::new(Stream::new(Direction::Tx)),
            ],
            control: Mutex::new(control),
        }
    }

    fn stream(&self, id: StreamId) -> &Mutex<Stream> {
        &self.streams[id.index()]
    }

    // ---------------------------------------------------------------------
    // Identification
    // ---------------------------------------------------------------------

    /// Driver key.
    pub fn driver_key(&self) -> &'static str {
        DRIVER_KEY
    }

    /// Hardware key.
    pub fn hardware_key(&self) -> &'static str {
        "LiteX-M2SDR"
    }

    /// Key/value description of the device and its rings.
    pub fn hardware_info(&self) -> BTreeMap<String, String> {
        let mut info = BTreeMap::new();
        info.insert("driver".to_string(), env!("CARGO_PKG_NAME").to_string());
        info.insert("version".to_string(), env!("CARGO_PKG_VERSION").to_string());
        info.insert("hardware".to_string(), self.hardware_key().to_string());
        info.insert("device".to_string(), self.channel.name().to_string());
        for direction in Direction::ALL {
            let geometry = self.channel.geometry(direction);
            let prefix = direction.to_string().to_lowercase();
            info.insert(format!("{prefix}_buffer_size"), geometry.buffer_size.to_string());
            info.insert(format!("{prefix}_buffer_count"), geometry.buffer_count.to_string());
        }
        info
    }

    // ---------------------------------------------------------------------
    // Stream lifecycle
    // ---------------------------------------------------------------------

    /// Set up the `direction` stream. Valid only while it is closed.
    ///
    /// `format` must be `"CS16"`, `channels` one or two distinct indices from
    /// {0, 1}; the only option is `loopback`.
    pub fn setup_stream(
        &self,
        direction: Direction,
        format: &str,
        channels: &[usize],
        args: &[(&str, &str)],
    ) -> Result<StreamId> {
        self.stream(direction)
            .lock()
            .setup(self.channel.as_ref(), format, channels, args)?;
        Ok(direction)
    }

    /// Start the DMA engine. Valid only while the stream is opened.
    ///
    /// Timed activation is not supported: `flags`, `time_ns` and `num_elems`
    /// are accepted for API compatibility and start the stream immediately.
    pub fn activate_stream(
        &self,
        id: StreamId,
        flags: StreamFlags,
        time_ns: i64,
        num_elems: usize,
    ) -> Result<()> {
        let mut stream = self.stream(id).lock();
        let _control = self.control.lock();
        if !flags.is_empty() || num_elems != 0 {
            tracing::debug!(?flags, time_ns, num_elems, "Activation arguments ignored");
        }
        stream.activate(self.channel.as_ref())
    }

    /// Stop the DMA engine and drop any partially used buffer. Valid only
    /// while the stream is active.
    pub fn deactivate_stream(&self, id: StreamId, flags: StreamFlags, time_ns: i64) -> Result<()> {
        let mut stream = self.stream(id).lock();
        let _control = self.control.lock();
        if !flags.is_empty() {
            tracing::debug!(?flags, time_ns, "Deactivation arguments ignored");
        }
        stream.deactivate(self.channel.as_ref())
    }

    /// Close the stream. Valid only while it is opened (not active).
    pub fn close_stream(&self, id: StreamId) -> Result<()> {
        self.stream(id).lock().close()
    }

    /// Counters, remainder and statistics of a stream.
    pub fn stream_status(&self, id: StreamId) -> StreamStatus {
        self.stream(id).lock().status()
    }

    /// Elements per DMA buffer for the configured channels (0 while closed).
    pub fn stream_mtu(&self, id: StreamId) -> usize {
        self.stream(id).lock().mtu
    }

    /// Supported stream formats.
    pub fn stream_formats(&self, _direction: Direction, _channel: usize) -> Vec<&'static str> {
        vec![SampleFormat::Cs16.as_str()]
    }

    /// Native stream format and its full-scale value.
    pub fn native_stream_format(&self, _direction: Direction, _channel: usize) -> (SampleFormat, f64) {
        (SampleFormat::Cs16, FULL_SCALE)
    }

    /// Number of RF channels per direction.
    pub fn num_channels(&self, _direction: Direction) -> usize {
        NUM_CHANNELS
    }

    /// RX and TX can run at the same time.
    pub fn full_duplex(&self, _direction: Direction, _channel: usize) -> bool {
        true
    }

    // ---------------------------------------------------------------------
    // Direct buffer access
    // ---------------------------------------------------------------------

    /// Ring depth of the stream.
    pub fn num_direct_access_buffers(&self, id: StreamId) -> usize {
        self.channel.geometry(id).buffer_count
    }

    /// Base address of ring slot `handle`.
    pub fn direct_access_buffer_addrs(&self, id: StreamId, handle: usize) -> Result<NonNull<u8>> {
        if handle >= self.channel.geometry(id).buffer_count {
            return Err(M2sdrError::InvalidHandle {
                direction: id,
                handle,
            });
        }
        Ok(self.channel.buffer_ptr(id, handle))
    }

    /// Acquire the next filled RX buffer.
    ///
    /// Returns `Ok(None)` if nothing arrived within `timeout`.
    pub fn acquire_read_buffer(&self, timeout: Duration) -> Result<Option<ReadBuffer<'_>>> {
        let mut stream = self.stream(Direction::Rx).lock();
        let Some(acquired) = stream.acquire_read(self.channel.as_ref(), timeout)? else {
            return Ok(None);
        };
        Ok(Some(ReadBuffer {
            ptr: self.channel.buffer_ptr(Direction::Rx, acquired.handle),
            len: stream.geometry.buffer_size,
            handle: acquired.handle,
            seq: acquired.seq,
            generation: stream.generation,
            elements: stream.mtu,
            overflow: acquired.overflow,
            _device: PhantomData,
        }))
    }

    /// Give an RX buffer back to the hardware.
    pub fn release_read_buffer(&self, buffer: ReadBuffer<'_>) -> Result<()> {
        self.stream(Direction::Rx)
            .lock()
            .release_read(self.channel.as_ref(), buffer.seq, buffer.generation)
    }

    /// Acquire the next free TX buffer.
    ///
    /// Returns `Ok(None)` if the ring stayed full for `timeout`.
    pub fn acquire_write_buffer(&self, timeout: Duration) -> Result<Option<WriteBuffer<'_>>> {
        let mut stream = self.stream(Direction::Tx).lock();
        let Some(acquired) = stream.acquire_write(self.channel.as_ref(), timeout)? else {
            return Ok(None);
        };
        Ok(Some(WriteBuffer {
            ptr: self.channel.buffer_ptr(Direction::Tx, acquired.handle),
            len: stream.geometry.buffer_size,
            handle: acquired.handle,
            seq: acquired.seq,
            generation: stream.generation,
            elements: stream.mtu,
            underflow: acquired.underflow,
            _device: PhantomData,
        }))
    }

    /// Queue a TX buffer holding `num_elems` elements.
    ///
    /// The rest of the buffer is zero-filled. `END_BURST` marks it as the
    /// last buffer of a burst.
    pub fn release_write_buffer(
        &self,
        buffer: WriteBuffer<'_>,
        num_elems: usize,
        flags: StreamFlags,
        time_ns: i64,
    ) -> Result<()> {
        self.stream(Direction::Tx).lock().release_write(
            self.channel.as_ref(),
            buffer.seq,
            buffer.generation,
            num_elems,
            flags,
            time_ns,
        )
    }

    // ---------------------------------------------------------------------
    // Arbitrary-length streaming
    // ---------------------------------------------------------------------

    /// Read interleaved samples into `buf`, waiting at most `timeout`.
    pub fn read_stream(&self, buf: &mut [Cs16], timeout: Duration) -> Result<ReadResult> {
        self.stream(Direction::Rx)
            .lock()
            .read(self.channel.as_ref(), buf, timeout)
    }

    /// Write interleaved samples from `buf`, waiting at most `timeout`.
    pub fn write_stream(
        &self,
        buf: &[Cs16],
        flags: StreamFlags,
        time_ns: i64,
        timeout: Duration,
    ) -> Result<WriteResult> {
        self.stream(Direction::Tx)
            .lock()
            .write(self.channel.as_ref(), buf, flags, time_ns, timeout)
    }

    // ---------------------------------------------------------------------
    // Control plane
    // ---------------------------------------------------------------------

    /// Read a 32-bit register.
    pub fn read_register(&self, addr: u32) -> Result<u32> {
        self.control.lock().read_register(addr)
    }

    /// Write a 32-bit register.
    pub fn write_register(&self, addr: u32, value: u32) -> Result<()> {
        self.control.lock().write_register(addr, value)
    }

    /// Antennas available for `direction`.
    pub fn list_antennas(&self, direction: Direction, _channel: usize) -> Vec<&'static str> {
        control::antennas(direction).to_vec()
    }

    /// Select an antenna.
    pub fn set_antenna(&self, direction: Direction, channel: usize, name: &str) -> Result<()> {
        self.control.lock().set_antenna(direction, channel, name)
    }

    /// Selected antenna.
    pub fn antenna(&self, direction: Direction, channel: usize) -> Result<&'static str> {
        self.control.lock().antenna(direction, channel)
    }

    /// Set the gain in dB.
    pub fn set_gain(&self, direction: Direction, channel: usize, gain: f64) -> Result<()> {
        self.control.lock().set_gain(direction, channel, gain)
    }

    /// Cached gain in dB.
    pub fn gain(&self, direction: Direction, channel: usize) -> Result<f64> {
        self.control.lock().gain(direction, channel)
    }

    /// Gain range in dB.
    pub fn gain_range(&self, direction: Direction, _channel: usize) -> Range {
        control::gain_range(direction)
    }

    /// Tune the center frequency in Hz.
    pub fn set_frequency(&self, direction: Direction, channel: usize, frequency: f64) -> Result<()> {
        self.control.lock().set_frequency(direction, channel, frequency)
    }

    /// Cached center frequency in Hz.
    pub fn frequency(&self, direction: Direction, channel: usize) -> Result<f64> {
        self.control.lock().frequency(direction, channel)
    }

    /// Frequency range in Hz.
    pub fn frequency_range(&self, direction: Direction, _channel: usize) -> Range {
        control::frequency_range(direction)
    }

    /// Set the sample rate in Hz.
    pub fn set_sample_rate(&self, direction: Direction, _channel: usize, rate: f64) -> Result<()> {
        self.control.lock().set_sample_rate(direction, rate)
    }

    /// Cached sample rate in Hz.
    pub fn sample_rate(&self, direction: Direction, _channel: usize) -> f64 {
        self.control.lock().sample_rate(direction)
    }

    /// Sample rate range in Hz.
    pub fn sample_rate_range(&self, _direction: Direction, _channel: usize) -> Range {
        control::SAMPLE_RATE_RANGE
    }

    /// Set the analog bandwidth in Hz.
    pub fn set_bandwidth(&self, direction: Direction, channel: usize, bandwidth: f64) -> Result<()> {
        self.control.lock().set_bandwidth(direction, channel, bandwidth)
    }

    /// Cached analog bandwidth in Hz.
    pub fn bandwidth(&self, direction: Direction, channel: usize) -> Result<f64> {
        self.control.lock().bandwidth(direction, channel)
    }

    /// Analog bandwidth range in Hz.
    pub fn bandwidth_range(&self, _direction: Direction, _channel: usize) -> Range {
        control::BANDWIDTH_RANGE
    }

    /// Clock sources.
    pub fn list_clock_sources(&self) -> Vec<&'static str> {
        CLOCK_SOURCES.to_vec()
    }

    /// Select the clock source.
    pub fn set_clock_source(&self, name: &str) -> Result<()> {
        self.control.lock().set_clock_source(name)
    }

    /// Selected clock source.
    pub fn clock_source(&self) -> &'static str {
        self.control.lock().clock_source()
    }

    /// Reference clock rate in Hz.
    pub fn reference_clock_rate(&self) -> f64 {
        self.control.lock().reference_clock_rate()
    }
}

impl Drop for M2sdrDevice {
    fn drop(&mut self) {
        for direction in Direction::ALL {
            let stream = self.streams[direction.index()].get_mut();
            if stream.state == StreamState::Active {
                if let Err(e) = stream.deactivate(self.channel.as_ref()) {
                    warn!(%direction, error = %e, "Failed to stop stream on drop");
                }
            }
        }
    }
}

impl std::fmt::Debug for M2sdrDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("M2sdrDevice")
            .field("channel", &self.channel.name())
            .field("rx", &self.streams[0].lock().state)
            .field("tx", &self.streams[1].lock().state)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> (Arc<SimulatedChannel>, M2sdrDevice) {
        let chan = Arc::new(
            SimulatedChannel::new(RingGeometry {
                buffer_size: 64,
                buffer_count: 4,
            })
            .unwrap(),
        );
        let dev = M2sdrDevice::with_channel(chan.clone(), &M2sdrConfig::default());
        (chan, dev)
    }

    #[test]
    fn test_device_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<M2sdrDevice>();
    }

    #[test]
    fn test_setup_returns_direction_identity() {
        let (_, dev) = device();
        assert_eq!(
            dev.setup_stream(Direction::Tx, "CS16", &[0, 1], &[]).unwrap(),
            Direction::Tx
        );
        assert_eq!(dev.stream_mtu(Direction::Tx), 8);
        assert_eq!(dev.stream_mtu(Direction::Rx), 0);
    }

    #[test]
    fn test_buffer_addrs_lookup() {
        let (chan, dev) = device();
        assert_eq!(dev.num_direct_access_buffers(Direction::Rx), 4);
        let addr = dev.direct_access_buffer_addrs(Direction::Rx, 3).unwrap();
        assert_eq!(addr, chan.buffer_ptr(Direction::Rx, 3));
        assert!(dev.direct_access_buffer_addrs(Direction::Rx, 4).is_err());
    }

    #[test]
    fn test_hardware_info() {
        let (_, dev) = device();
        let info = dev.hardware_info();
        assert_eq!(info["device"], "simulated");
        assert_eq!(info["rx_buffer_count"], "4");
        assert_eq!(dev.native_stream_format(Direction::Rx, 0).1, 4096.0);
    }

    #[test]
    fn test_drop_stops_active_streams() {
        let (chan, dev) = device();
        let id = dev.setup_stream(Direction::Rx, "CS16", &[0], &[]).unwrap();
        dev.activate_stream(id, StreamFlags::empty(), 0, 0).unwrap();
        assert!(chan.is_enabled(Direction::Rx));
        drop(dev);
        assert!(!chan.is_enabled(Direction::Rx));
    }

    #[test]
    fn test_register_failure_leaves_stream_alone() {
        let (chan, dev) = device();
        let id = dev.setup_stream(Direction::Rx, "CS16", &[0], &[]).unwrap();
        dev.activate_stream(id, StreamFlags::empty(), 0, 0).unwrap();
        chan.set_register_failure(true);
        assert!(dev.set_gain(Direction::Rx, 0, 10.0).is_err());
        assert_eq!(dev.stream_status(id).state, StreamState::Active);
        chan.inject_rx(&[0; 64]);
        let mut buf = [Cs16::default(); 16];
        assert_eq!(dev.read_stream(&mut buf, Duration::ZERO).unwrap().elements, 16);
    }
}
