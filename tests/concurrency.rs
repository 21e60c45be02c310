//! RX, TX and control-plane access from separate threads.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use common::{inject_pattern_buffer, pattern, sim_device};
use litex_m2sdr::{Cs16, Direction, StreamFlags};

const BUFFER_SIZE: usize = 512;
const BUFFER_COUNT: usize = 8;
const BUFFERS: u64 = 200;

#[test]
fn test_rx_tx_and_control_in_parallel() {
    let (chan, dev) = sim_device(BUFFER_SIZE, BUFFER_COUNT);
    let dev = Arc::new(dev);
    let rx = dev.setup_stream(Direction::Rx, "CS16", &[0], &[]).unwrap();
    let tx = dev.setup_stream(Direction::Tx, "CS16", &[0], &[]).unwrap();
    dev.activate_stream(rx, StreamFlags::empty(), 0, 0).unwrap();
    dev.activate_stream(tx, StreamFlags::empty(), 0, 0).unwrap();
    let mtu = dev.stream_mtu(rx);
    let total = BUFFERS as usize * mtu;
    let deadline = Instant::now() + Duration::from_secs(20);
    let done = Arc::new(AtomicBool::new(false));

    // Hardware: produce RX without lapping the published release point,
    // and drain TX as it arrives.
    let hardware = {
        let chan = chan.clone();
        let done = done.clone();
        thread::spawn(move || {
            let mut produced = 0u64;
            let mut drained = Vec::new();
            while !done.load(Ordering::Relaxed) && Instant::now() < deadline {
                let released = chan.snapshot(Direction::Rx).sw_count;
                if produced < BUFFERS && produced + 1 < released + BUFFER_COUNT as u64 {
                    inject_pattern_buffer(&chan, produced, mtu);
                    produced += 1;
                }
                while let Some(buffer) = chan.drain_tx() {
                    drained.extend_from_slice(bytemuck::cast_slice::<u8, Cs16>(&buffer));
                }
                thread::yield_now();
            }
            drained
        })
    };

    let reader = {
        let dev = dev.clone();
        thread::spawn(move || {
            let mut received = Vec::with_capacity(total);
            let mut buf = vec![Cs16::default(); 300];
            while received.len() < total && Instant::now() < deadline {
                let want = buf.len().min(total - received.len());
                let res = dev
                    .read_stream(&mut buf[..want], Duration::from_millis(5))
                    .unwrap();
                assert!(!res.overflow);
                received.extend_from_slice(&buf[..res.elements]);
            }
            received
        })
    };

    let writer = {
        let dev = dev.clone();
        thread::spawn(move || {
            let data = pattern(1_000_000, total);
            let mut sent = 0;
            while sent < total && Instant::now() < deadline {
                let n = 333.min(total - sent);
                let flags = if sent + n == total {
                    StreamFlags::END_BURST
                } else {
                    StreamFlags::empty()
                };
                let res = dev
                    .write_stream(&data[sent..sent + n], flags, 0, Duration::from_millis(5))
                    .unwrap();
                assert!(!res.underflow);
                sent += res.elements;
            }
            sent
        })
    };

    let control = {
        let dev = dev.clone();
        let done = done.clone();
        thread::spawn(move || {
            let mut gain = 0.0;
            while !done.load(Ordering::Relaxed) && Instant::now() < deadline {
                dev.set_gain(Direction::Rx, 0, gain).unwrap();
                assert_eq!(dev.gain(Direction::Rx, 0).unwrap(), gain);
                gain = (gain + 1.0) % 70.0;
                thread::yield_now();
            }
        })
    };

    let received = reader.join().unwrap();
    let sent = writer.join().unwrap();
    // Let the hardware drain the final TX buffers.
    while chan.snapshot(Direction::Tx).hw_count < chan.snapshot(Direction::Tx).sw_count
        && Instant::now() < deadline
    {
        thread::sleep(Duration::from_millis(1));
    }
    done.store(true, Ordering::Relaxed);
    let drained = hardware.join().unwrap();
    control.join().unwrap();

    assert_eq!(received, pattern(0, total));
    assert_eq!(sent, total);
    assert_eq!(&drained[..total], pattern(1_000_000, total).as_slice());
    assert_eq!(chan.burst_marks().len(), 1);
}
