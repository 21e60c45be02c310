//! Criterion benchmarks for the streaming hot paths.
//!
//! Uses the simulated DMA channel so the numbers reflect the engine's own
//! overhead: counter bookkeeping, remainder handling and copies.
//!
//! Key metrics:
//! - `read_stream` throughput for request sizes below, at and above the MTU
//! - direct-access acquire/release latency
//! - `write_stream` throughput
//!
//! Run with: cargo bench --bench read_stream

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use litex_m2sdr::config::M2sdrConfig;
use litex_m2sdr::dma::RingGeometry;
use litex_m2sdr::{Cs16, Direction, M2sdrDevice, SimulatedChannel, StreamFlags};
use std::sync::Arc;
use std::time::Duration;

const BUFFER_SIZE: usize = 8192;
const BUFFER_COUNT: usize = 16;

fn device() -> (Arc<SimulatedChannel>, M2sdrDevice) {
    let channel = Arc::new(
        SimulatedChannel::new(RingGeometry {
            buffer_size: BUFFER_SIZE,
            buffer_count: BUFFER_COUNT,
        })
        .unwrap(),
    );
    let device = M2sdrDevice::with_channel(channel.clone(), &M2sdrConfig::default());
    (channel, device)
}

/// Benchmark `read_stream` with different request sizes.
///
/// The hardware side refills one buffer whenever the stream has consumed
/// one, so every iteration measures the steady state.
fn read_stream_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("read_stream");
    let mtu = BUFFER_SIZE / 4;

    for (name, elements) in [("quarter_mtu", mtu / 4), ("mtu", mtu), ("3_mtu", 3 * mtu)] {
        let (chan, dev) = device();
        let rx = dev.setup_stream(Direction::Rx, "CS16", &[0], &[]).unwrap();
        dev.activate_stream(rx, StreamFlags::empty(), 0, 0).unwrap();
        let payload = vec![0u8; BUFFER_SIZE];
        let mut buf = vec![Cs16::default(); elements];

        group.throughput(Throughput::Bytes((elements * 4) as u64));
        group.bench_with_input(BenchmarkId::new("read", name), &elements, |b, _| {
            b.iter(|| {
                while chan.snapshot(Direction::Rx).hw_count
                    < dev.stream_status(rx).sw_count + BUFFER_COUNT as u64 / 2
                {
                    chan.inject_rx(&payload);
                }
                let res = dev.read_stream(black_box(&mut buf), Duration::ZERO).unwrap();
                black_box(res.elements);
            });
        });
    }

    group.finish();
}

/// Benchmark one direct-access acquire/release cycle.
fn direct_access_cycle(c: &mut Criterion) {
    let (chan, dev) = device();
    let rx = dev.setup_stream(Direction::Rx, "CS16", &[0], &[]).unwrap();
    dev.activate_stream(rx, StreamFlags::empty(), 0, 0).unwrap();
    let payload = vec![0u8; BUFFER_SIZE];

    c.bench_function("acquire_release_read", |b| {
        b.iter(|| {
            chan.inject_rx(&payload);
            let buffer = dev.acquire_read_buffer(Duration::ZERO).unwrap().unwrap();
            black_box(buffer.samples()[0]);
            dev.release_read_buffer(buffer).unwrap();
        });
    });
}

/// Benchmark `write_stream` with odd-sized requests that keep a remainder.
fn write_stream_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("write_stream");
    let (chan, dev) = device();
    let tx = dev.setup_stream(Direction::Tx, "CS16", &[0], &[]).unwrap();
    dev.activate_stream(tx, StreamFlags::empty(), 0, 0).unwrap();
    let data = vec![Cs16::new(1, -1); 1500];

    group.throughput(Throughput::Bytes((data.len() * 4) as u64));
    group.bench_function("write_1500", |b| {
        b.iter(|| {
            while chan.drain_tx().is_some() {}
            let res = dev
                .write_stream(black_box(&data), StreamFlags::empty(), 0, Duration::ZERO)
                .unwrap();
            black_box(res.elements);
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    read_stream_throughput,
    direct_access_cycle,
    write_stream_throughput
);
criterion_main!(benches);
