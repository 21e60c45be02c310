//! Receive path: remainder handling, overflow and state legality.

mod common;

use std::time::Duration;

use common::{inject_pattern_buffer, pattern, sim_device};
use litex_m2sdr::{Cs16, Direction, DmaChannel, M2sdrError, StreamFlags, StreamState};
use rand::{rngs::StdRng, Rng, SeedableRng};

const BUFFER_SIZE: usize = 1024;
const BUFFER_COUNT: usize = 8;

// =============================================================================
// Remainder adapter
// =============================================================================

#[test]
fn test_half_half_then_buffer_and_a_half() {
    let (chan, dev) = sim_device(BUFFER_SIZE, BUFFER_COUNT);
    let rx = dev.setup_stream(Direction::Rx, "CS16", &[0], &[]).unwrap();
    dev.activate_stream(rx, StreamFlags::empty(), 0, 0).unwrap();
    let mtu = dev.stream_mtu(rx);
    assert_eq!(mtu, 256);
    for index in 0..3 {
        inject_pattern_buffer(&chan, index, mtu);
    }

    let mut first = vec![Cs16::default(); mtu / 2];
    let res = dev.read_stream(&mut first, Duration::ZERO).unwrap();
    assert_eq!(res.elements, mtu / 2);
    assert_eq!(first, pattern(0, mtu / 2));
    let status = dev.stream_status(rx);
    assert_eq!(status.remainder_handle, Some(0));
    assert_eq!(status.remainder_offset, mtu / 2);
    assert_eq!(status.remainder_samples, mtu / 2);

    let mut second = vec![Cs16::default(); mtu / 2];
    dev.read_stream(&mut second, Duration::ZERO).unwrap();
    assert_eq!(second, pattern(mtu as u64 / 2, mtu / 2));
    let status = dev.stream_status(rx);
    assert_eq!(status.remainder_handle, None);
    assert_eq!(status.user_count, 1);
    assert_eq!(status.held, 0);

    // All of buffer 1 and the first half of buffer 2.
    let mut third = vec![Cs16::default(); mtu + mtu / 2];
    let res = dev.read_stream(&mut third, Duration::ZERO).unwrap();
    assert_eq!(res.elements, mtu + mtu / 2);
    assert!(!res.timed_out);
    assert_eq!(third, pattern(mtu as u64, mtu + mtu / 2));
    let status = dev.stream_status(rx);
    assert_eq!(status.remainder_handle, Some(2));
    assert_eq!(status.remainder_samples, mtu / 2);
    assert_eq!(status.user_count, 2);

    let mut rest = vec![Cs16::default(); mtu / 2];
    dev.read_stream(&mut rest, Duration::ZERO).unwrap();
    assert_eq!(rest, pattern(2 * mtu as u64 + mtu as u64 / 2, mtu / 2));
    assert_eq!(dev.stream_status(rx).user_count, 3);
}

#[test]
fn test_full_buffer_read_after_exact_consumption() {
    let (chan, dev) = sim_device(BUFFER_SIZE, BUFFER_COUNT);
    let rx = dev.setup_stream(Direction::Rx, "CS16", &[0], &[]).unwrap();
    dev.activate_stream(rx, StreamFlags::empty(), 0, 0).unwrap();
    let mtu = dev.stream_mtu(rx);
    for index in 0..3 {
        inject_pattern_buffer(&chan, index, mtu);
    }

    let mut half = vec![Cs16::default(); mtu / 2];
    dev.read_stream(&mut half, Duration::ZERO).unwrap();
    dev.read_stream(&mut half, Duration::ZERO).unwrap();

    let mut full = vec![Cs16::default(); mtu];
    dev.read_stream(&mut full, Duration::ZERO).unwrap();
    assert_eq!(full, pattern(mtu as u64, mtu));
    let status = dev.stream_status(rx);
    assert_eq!(status.remainder_handle, None);
    assert_eq!(status.sw_count, 2);

    dev.read_stream(&mut full, Duration::ZERO).unwrap();
    assert_eq!(full, pattern(2 * mtu as u64, mtu));
}

#[test]
fn test_random_lengths_lose_and_repeat_nothing() {
    for channels in [&[0usize][..], &[0usize, 1][..]] {
        let (chan, dev) = sim_device(BUFFER_SIZE, BUFFER_COUNT);
        let rx = dev.setup_stream(Direction::Rx, "CS16", channels, &[]).unwrap();
        dev.activate_stream(rx, StreamFlags::empty(), 0, 0).unwrap();
        let nch = channels.len();
        let samples_per_buffer = dev.stream_mtu(rx) * nch;
        let total_buffers = 60u64;
        let total = total_buffers as usize * samples_per_buffer;

        let mut rng = StdRng::seed_from_u64(0x5eed + nch as u64);
        let mut received = Vec::with_capacity(total);
        let mut injected = 0u64;

        while received.len() < total {
            // Keep the producer less than a ring ahead so nothing is dropped.
            let sw_count = dev.stream_status(rx).sw_count;
            while injected < total_buffers && injected + 1 < sw_count + BUFFER_COUNT as u64 {
                inject_pattern_buffer(&chan, injected, samples_per_buffer);
                injected += 1;
            }

            let frames = rng.gen_range(1..=400usize);
            let mut buf = vec![Cs16::default(); frames * nch];
            let res = dev.read_stream(&mut buf, Duration::ZERO).unwrap();
            assert!(!res.overflow);
            received.extend_from_slice(&buf[..res.elements * nch]);

            let status = dev.stream_status(rx);
            assert_eq!(status.remainder_samples > 0, status.remainder_handle.is_some());
            if status.remainder_handle.is_some() {
                assert!(status.held >= 1);
                assert_eq!(
                    status.remainder_offset + status.remainder_samples,
                    dev.stream_mtu(rx)
                );
            }
        }

        assert_eq!(received.len(), total);
        assert_eq!(received, pattern(0, total));
        assert_eq!(dev.stream_status(rx).stats.overflows, 0);
    }
}

#[test]
fn test_read_times_out_without_data() {
    let (_chan, dev) = sim_device(BUFFER_SIZE, BUFFER_COUNT);
    let rx = dev.setup_stream(Direction::Rx, "CS16", &[0], &[]).unwrap();
    dev.activate_stream(rx, StreamFlags::empty(), 0, 0).unwrap();

    let mut buf = vec![Cs16::default(); 100];
    let res = dev.read_stream(&mut buf, Duration::from_millis(2)).unwrap();
    assert_eq!(res.elements, 0);
    assert!(res.timed_out);
    assert!(dev.acquire_read_buffer(Duration::ZERO).unwrap().is_none());
}

// =============================================================================
// Overflow
// =============================================================================

#[test]
fn test_overflow_reported_once_and_resynchronised() {
    let (chan, dev) = sim_device(BUFFER_SIZE, BUFFER_COUNT);
    let rx = dev.setup_stream(Direction::Rx, "CS16", &[0], &[]).unwrap();
    dev.activate_stream(rx, StreamFlags::empty(), 0, 0).unwrap();
    let mtu = dev.stream_mtu(rx);

    let lapped = BUFFER_COUNT as u64 + 3;
    for index in 0..lapped {
        inject_pattern_buffer(&chan, index, mtu);
    }

    let mut buf = vec![Cs16::default(); mtu];
    let res = dev.read_stream(&mut buf, Duration::ZERO).unwrap();
    assert!(res.overflow);
    assert_eq!(res.overflow_at, Some(0));
    assert!(res.flags.contains(StreamFlags::END_ABRUPT));
    // Only the newest buffer survives.
    assert_eq!(buf, pattern((lapped - 1) * mtu as u64, mtu));

    let status = dev.stream_status(rx);
    assert_eq!(status.sw_count, lapped);
    assert!(status.hw_count - status.sw_count <= BUFFER_COUNT as u64);
    assert_eq!(status.stats.overflows, 1);
    assert_eq!(status.stats.dropped_buffers, lapped - 1);

    inject_pattern_buffer(&chan, lapped, mtu);
    let res = dev.read_stream(&mut buf, Duration::ZERO).unwrap();
    assert!(!res.overflow);
    assert_eq!(buf, pattern(lapped * mtu as u64, mtu));
}

#[test]
fn test_overflow_offset_inside_long_read() {
    let (chan, dev) = sim_device(BUFFER_SIZE, BUFFER_COUNT);
    let rx = dev.setup_stream(Direction::Rx, "CS16", &[0], &[]).unwrap();
    dev.activate_stream(rx, StreamFlags::empty(), 0, 0).unwrap();
    let mtu = dev.stream_mtu(rx);

    inject_pattern_buffer(&chan, 0, mtu);
    let mut buf = vec![Cs16::default(); mtu / 4];
    dev.read_stream(&mut buf, Duration::ZERO).unwrap();

    for index in 1..=BUFFER_COUNT as u64 + 2 {
        inject_pattern_buffer(&chan, index, mtu);
    }
    let mut buf = vec![Cs16::default(); mtu];
    let res = dev.read_stream(&mut buf, Duration::ZERO).unwrap();
    assert!(res.overflow);
    assert_eq!(res.overflow_at, Some(mtu - mtu / 4));
}

#[test]
fn test_direct_access_overflow_flag() {
    let (chan, dev) = sim_device(BUFFER_SIZE, 4);
    let rx = dev.setup_stream(Direction::Rx, "CS16", &[0], &[]).unwrap();
    dev.activate_stream(rx, StreamFlags::empty(), 0, 0).unwrap();
    let mtu = dev.stream_mtu(rx);
    for index in 0..9 {
        inject_pattern_buffer(&chan, index, mtu);
    }

    let buffer = dev.acquire_read_buffer(Duration::ZERO).unwrap().unwrap();
    assert!(buffer.overflow());
    assert_eq!(buffer.flags(), StreamFlags::END_ABRUPT);
    assert_eq!(buffer.handle(), 0);
    assert_eq!(buffer.samples(), pattern(8 * mtu as u64, mtu).as_slice());
    dev.release_read_buffer(buffer).unwrap();
}

#[test]
fn test_overflow_while_holding_a_buffer_skips_held_slot() {
    let (chan, dev) = sim_device(BUFFER_SIZE, 4);
    let rx = dev.setup_stream(Direction::Rx, "CS16", &[0], &[]).unwrap();
    dev.activate_stream(rx, StreamFlags::empty(), 0, 0).unwrap();
    let mtu = dev.stream_mtu(rx);

    inject_pattern_buffer(&chan, 0, mtu);
    let held = dev.acquire_read_buffer(Duration::ZERO).unwrap().unwrap();
    assert_eq!(held.sequence(), 0);
    for index in 1..9 {
        inject_pattern_buffer(&chan, index, mtu);
    }

    // Buffer 8 landed in the held slot 0, so the newest usable one is 7.
    let newest = dev.acquire_read_buffer(Duration::ZERO).unwrap().unwrap();
    assert!(newest.overflow());
    assert_eq!(newest.sequence(), 7);
    assert_eq!(newest.handle(), 3);
    assert_eq!(newest.samples(), pattern(7 * mtu as u64, mtu).as_slice());
    let status = dev.stream_status(rx);
    assert_eq!(status.sw_count, 8);
    assert_eq!(status.stats.overflows, 1);
    assert_eq!(status.stats.dropped_buffers, 6);

    // The lapped hardware overwrote the held slot; a fresh borrow sees it.
    assert_eq!(held.samples(), pattern(8 * mtu as u64, mtu).as_slice());

    dev.release_read_buffer(newest).unwrap();
    dev.release_read_buffer(held).unwrap();

    let next = dev.acquire_read_buffer(Duration::ZERO).unwrap().unwrap();
    assert!(!next.overflow());
    assert_eq!(next.sequence(), 8);
    assert_eq!(next.samples(), pattern(8 * mtu as u64, mtu).as_slice());
    dev.release_read_buffer(next).unwrap();
}

#[test]
fn test_overflow_with_every_slot_held_leaves_stream_unchanged() {
    let (chan, dev) = sim_device(BUFFER_SIZE, 4);
    let rx = dev.setup_stream(Direction::Rx, "CS16", &[0], &[]).unwrap();
    dev.activate_stream(rx, StreamFlags::empty(), 0, 0).unwrap();
    let mtu = dev.stream_mtu(rx);

    for index in 0..4 {
        inject_pattern_buffer(&chan, index, mtu);
    }
    let mut held: Vec<_> = (0..4)
        .map(|_| dev.acquire_read_buffer(Duration::ZERO).unwrap().unwrap())
        .collect();
    for index in 4..9 {
        inject_pattern_buffer(&chan, index, mtu);
    }

    let before = dev.stream_status(rx);
    let err = dev.acquire_read_buffer(Duration::ZERO).unwrap_err();
    assert!(matches!(err, M2sdrError::BufferInUse { direction: Direction::Rx, .. }));
    let after = dev.stream_status(rx);
    assert_eq!(after.sw_count, before.sw_count);
    assert_eq!(after.held, 4);
    assert_eq!(after.stats, before.stats);

    // Freeing slot 1 lets the stream resync onto buffer 5, which refilled it.
    dev.release_read_buffer(held.remove(1)).unwrap();
    let buffer = dev.acquire_read_buffer(Duration::ZERO).unwrap().unwrap();
    assert!(buffer.overflow());
    assert_eq!(buffer.sequence(), 5);
    assert_eq!(buffer.samples(), pattern(5 * mtu as u64, mtu).as_slice());
    assert_eq!(dev.stream_status(rx).stats.overflows, 1);
    assert_eq!(dev.stream_status(rx).stats.dropped_buffers, 1);

    dev.release_read_buffer(buffer).unwrap();
    for buffer in held {
        dev.release_read_buffer(buffer).unwrap();
    }
}

#[test]
fn test_read_stream_with_unbounded_timeout() {
    let (chan, dev) = sim_device(BUFFER_SIZE, BUFFER_COUNT);
    let rx = dev.setup_stream(Direction::Rx, "CS16", &[0], &[]).unwrap();
    dev.activate_stream(rx, StreamFlags::empty(), 0, 0).unwrap();
    let mtu = dev.stream_mtu(rx);
    inject_pattern_buffer(&chan, 0, mtu);

    let mut buf = vec![Cs16::default(); mtu];
    let res = dev.read_stream(&mut buf, Duration::MAX).unwrap();
    assert_eq!(res.elements, mtu);
    assert!(!res.timed_out);
    assert_eq!(buf, pattern(0, mtu));

    inject_pattern_buffer(&chan, 1, mtu);
    let buffer = dev.acquire_read_buffer(Duration::MAX).unwrap().unwrap();
    assert_eq!(buffer.sequence(), 1);
    dev.release_read_buffer(buffer).unwrap();
}

// =============================================================================
// Direct access
// =============================================================================

#[test]
fn test_direct_access_in_hardware_order() {
    let (chan, dev) = sim_device(BUFFER_SIZE, 4);
    let rx = dev.setup_stream(Direction::Rx, "CS16", &[0], &[]).unwrap();
    dev.activate_stream(rx, StreamFlags::empty(), 0, 0).unwrap();
    let mtu = dev.stream_mtu(rx);

    for round in 0..3u64 {
        for i in 0..4 {
            inject_pattern_buffer(&chan, round * 4 + i, mtu);
        }
        let buffers: Vec<_> = (0..4)
            .map(|_| dev.acquire_read_buffer(Duration::ZERO).unwrap().unwrap())
            .collect();
        for (i, buffer) in buffers.iter().enumerate() {
            assert_eq!(buffer.handle(), i);
            assert_eq!(buffer.elements(), mtu);
            assert_eq!(buffer.time_ns(), 0);
            assert_eq!(
                buffer.as_ptr(),
                dev.direct_access_buffer_addrs(rx, i).unwrap().as_ptr() as *const u8
            );
            assert_eq!(
                buffer.samples(),
                pattern((round * 4 + i as u64) * mtu as u64, mtu).as_slice()
            );
        }
        for buffer in buffers {
            dev.release_read_buffer(buffer).unwrap();
        }
        assert_eq!(chan.snapshot(Direction::Rx).sw_count, (round + 1) * 4);
    }
}

#[test]
fn test_direct_and_remainder_share_the_ring() {
    let (chan, dev) = sim_device(BUFFER_SIZE, 4);
    let rx = dev.setup_stream(Direction::Rx, "CS16", &[0], &[]).unwrap();
    dev.activate_stream(rx, StreamFlags::empty(), 0, 0).unwrap();
    let mtu = dev.stream_mtu(rx);
    for index in 0..2 {
        inject_pattern_buffer(&chan, index, mtu);
    }

    let mut buf = vec![Cs16::default(); 10];
    dev.read_stream(&mut buf, Duration::ZERO).unwrap();
    let buffer = dev.acquire_read_buffer(Duration::ZERO).unwrap().unwrap();
    assert_eq!(buffer.sequence(), 1);
    dev.release_read_buffer(buffer).unwrap();
    // Buffer 0 is still held as the remainder.
    assert_eq!(chan.snapshot(Direction::Rx).sw_count, 0);
}

// =============================================================================
// State machine
// =============================================================================

#[test]
fn test_rx_illegal_calls_leave_counters_alone() {
    let (chan, dev) = sim_device(BUFFER_SIZE, BUFFER_COUNT);
    let mut buf = vec![Cs16::default(); 16];

    let before = dev.stream_status(Direction::Rx);
    assert_eq!(before.state, StreamState::Closed);
    assert!(dev
        .acquire_read_buffer(Duration::ZERO)
        .unwrap_err()
        .is_invalid_state());
    assert!(dev
        .read_stream(&mut buf, Duration::ZERO)
        .unwrap_err()
        .is_invalid_state());
    assert_eq!(dev.stream_status(Direction::Rx), before);

    let rx = dev.setup_stream(Direction::Rx, "CS16", &[0], &[]).unwrap();
    chan.start(Direction::Rx, false).unwrap();
    chan.inject_rx(&[1; BUFFER_SIZE]);
    let opened = dev.stream_status(rx);
    assert!(dev
        .acquire_read_buffer(Duration::ZERO)
        .unwrap_err()
        .is_invalid_state());
    assert!(dev
        .read_stream(&mut buf, Duration::ZERO)
        .unwrap_err()
        .is_invalid_state());
    assert_eq!(dev.stream_status(rx), opened);
    assert!(dev.close_stream(rx).is_ok());
}

#[test]
fn test_setup_rejections() {
    let (_chan, dev) = sim_device(BUFFER_SIZE, BUFFER_COUNT);
    let err = dev.setup_stream(Direction::Rx, "CF32", &[0], &[]).unwrap_err();
    assert!(matches!(err, M2sdrError::InvalidFormat { .. }));
    let err = dev.setup_stream(Direction::Rx, "CS16", &[0, 2], &[]).unwrap_err();
    assert!(matches!(err, M2sdrError::InvalidChannelSelection { .. }));
    let err = dev
        .setup_stream(Direction::Rx, "CS16", &[0], &[("loopback", "perhaps")])
        .unwrap_err();
    assert!(err.is_setup_rejection());
    assert_eq!(dev.stream_status(Direction::Rx).state, StreamState::Closed);

    let (_chan, dev) = sim_device(1028, BUFFER_COUNT);
    let err = dev.setup_stream(Direction::Rx, "CS16", &[0, 1], &[]).unwrap_err();
    assert!(matches!(err, M2sdrError::FormatMismatch { .. }));
}

#[test]
fn test_deactivate_flushes_remainder_and_stale_buffers() {
    let (chan, dev) = sim_device(BUFFER_SIZE, BUFFER_COUNT);
    let rx = dev.setup_stream(Direction::Rx, "CS16", &[0], &[("loopback", "true")]).unwrap();
    dev.activate_stream(rx, StreamFlags::empty(), 0, 0).unwrap();
    assert!(chan.loopback(Direction::Rx));
    let mtu = dev.stream_mtu(rx);
    for index in 0..2 {
        inject_pattern_buffer(&chan, index, mtu);
    }

    let mut buf = vec![Cs16::default(); 10];
    dev.read_stream(&mut buf, Duration::ZERO).unwrap();
    let stale = dev.acquire_read_buffer(Duration::ZERO).unwrap().unwrap();

    dev.deactivate_stream(rx, StreamFlags::empty(), 0).unwrap();
    let status = dev.stream_status(rx);
    assert_eq!(status.state, StreamState::Opened);
    assert_eq!(status.remainder_handle, None);
    assert_eq!(status.held, 0);
    assert!(!chan.is_enabled(Direction::Rx));
    assert!(dev.release_read_buffer(stale).unwrap_err().is_invalid_state());

    dev.activate_stream(rx, StreamFlags::empty(), 0, 0).unwrap();
    inject_pattern_buffer(&chan, 0, mtu);
    let mut buf = vec![Cs16::default(); mtu];
    dev.read_stream(&mut buf, Duration::ZERO).unwrap();
    assert_eq!(buf, pattern(0, mtu));
}

#[test]
fn test_activation_failure_keeps_stream_opened() {
    let (chan, dev) = sim_device(BUFFER_SIZE, BUFFER_COUNT);
    let rx = dev.setup_stream(Direction::Rx, "CS16", &[0], &[]).unwrap();
    chan.start(Direction::Rx, false).unwrap();

    let err = dev.activate_stream(rx, StreamFlags::empty(), 0, 0).unwrap_err();
    assert!(err.is_busy());
    assert_eq!(dev.stream_status(rx).state, StreamState::Opened);

    chan.stop(Direction::Rx).unwrap();
    dev.activate_stream(rx, StreamFlags::empty(), 0, 0).unwrap();
    assert_eq!(dev.stream_status(rx).state, StreamState::Active);
}
