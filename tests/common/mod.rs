//! Shared helpers for the integration tests: a device backed by the
//! simulated channel and a counter pattern that makes every sample unique.

#![allow(dead_code)]

use std::sync::Arc;

use litex_m2sdr::config::M2sdrConfig;
use litex_m2sdr::dma::RingGeometry;
use litex_m2sdr::{Cs16, M2sdrDevice, SimulatedChannel};

/// Build a device on a fresh simulated channel.
pub fn sim_device(buffer_size: usize, buffer_count: usize) -> (Arc<SimulatedChannel>, M2sdrDevice) {
    let channel = Arc::new(
        SimulatedChannel::new(RingGeometry {
            buffer_size,
            buffer_count,
        })
        .unwrap(),
    );
    let device = M2sdrDevice::with_channel(channel.clone(), &M2sdrConfig::default());
    (channel, device)
}

/// Sample number `n` of the test pattern.
pub fn pattern_sample(n: u64) -> Cs16 {
    Cs16::new((n & 0xffff) as u16 as i16, ((n >> 16) & 0xffff) as u16 as i16)
}

/// `count` pattern samples starting at `start`.
pub fn pattern(start: u64, count: usize) -> Vec<Cs16> {
    (start..start + count as u64).map(pattern_sample).collect()
}

/// Let the simulated hardware fill RX buffer number `index`, where each
/// buffer holds `samples_per_buffer` consecutive pattern samples.
pub fn inject_pattern_buffer(channel: &SimulatedChannel, index: u64, samples_per_buffer: usize) {
    let samples = pattern(index * samples_per_buffer as u64, samples_per_buffer);
    assert!(channel.inject_rx(bytemuck::cast_slice(&samples)));
}
