//! In-process DMA channel for tests, benches and `--simulate` runs.
//!
//! The simulated channel owns two heap-allocated rings and plays the role of
//! the FPGA: test code calls [`SimulatedChannel::inject_rx`] to make the
//! "hardware" fill the next RX buffer and [`SimulatedChannel::drain_tx`] to
//! make it consume the next TX buffer. Counters follow the LitePCIe driver:
//! they are reset when an engine is enabled and only move forward.
//!
//! The hardware side deliberately does not respect software ownership: if the
//! RX producer laps the consumer it overwrites buffers, and the TX engine can
//! be forced past the supplied data with [`SimulatedChannel::advance_tx`], so
//! overflow and underflow can be provoked deterministically.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use super::{DmaChannel, DmaCounters, Direction, RingGeometry};
use crate::control::RegisterBus;
use crate::error::{M2sdrError, Result};

/// Default simulated buffer size (matches the LitePCIe default).
pub const DEFAULT_BUFFER_SIZE: usize = 8192;
/// Default simulated ring depth.
pub const DEFAULT_BUFFER_COUNT: usize = 16;

/// Buffers start on page boundaries, like the kernel mapping.
const ARENA_ALIGN: usize = 4096;

/// Heap memory standing in for the kernel's DMA area.
struct DmaArena {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the arena is plain memory; accesses are sequenced by the ring
// protocol (hardware side under the channel mutex, software side through
// held handles).
unsafe impl Send for DmaArena {}
unsafe impl Sync for DmaArena {}

impl DmaArena {
    fn new(len: usize) -> Result<Self> {
        let layout = Layout::from_size_align(len.max(1), ARENA_ALIGN).map_err(|e| {
            M2sdrError::MapFailed {
                message: format!("invalid simulated ring size {len}: {e}"),
            }
        })?;
        // SAFETY: layout has a non-zero size.
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or_else(|| M2sdrError::MapFailed {
            message: format!("failed to allocate {len} bytes"),
        })?;
        Ok(Self { ptr, layout })
    }

    /// Raw pointer to byte `offset`, for hardware-side copies.
    ///
    /// # Safety
    ///
    /// `offset + len` must be within the arena for the access that follows.
    unsafe fn at(&self, offset: usize, len: usize) -> *mut u8 {
        debug_assert!(offset + len <= self.layout.size());
        self.ptr.as_ptr().add(offset)
    }
}

impl Drop for DmaArena {
    fn drop(&mut self) {
        // SAFETY: ptr was returned by alloc_zeroed with this layout.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

#[derive(Debug, Default)]
struct EngineState {
    enabled: bool,
    locked: bool,
    loopback: bool,
    hw_count: u64,
    sw_count: u64,
    fail_next_start: bool,
}

#[derive(Debug, Default)]
struct SimState {
    engines: [EngineState; 2],
    /// (sequence number, valid bytes) of every TX buffer flagged end-of-burst
    burst_marks: Vec<(u64, usize)>,
    /// Control/status registers
    registers: std::collections::HashMap<u32, u32>,
    fail_register_access: bool,
}

/// Simulated LitePCIe DMA channel.
pub struct SimulatedChannel {
    name: String,
    geometry: [RingGeometry; 2],
    arenas: [DmaArena; 2],
    state: Mutex<SimState>,
    ready: Condvar,
}

impl SimulatedChannel {
    /// Create a simulated channel with the given geometry for both rings.
    pub fn new(geometry: RingGeometry) -> Result<Self> {
        Self::with_geometry(geometry, geometry)
    }

    /// Create a simulated channel with the LitePCIe default geometry.
    pub fn with_defaults() -> Result<Self> {
        Self::new(RingGeometry {
            buffer_size: DEFAULT_BUFFER_SIZE,
            buffer_count: DEFAULT_BUFFER_COUNT,
        })
    }

    /// Create a simulated channel with distinct RX and TX geometry.
    pub fn with_geometry(rx: RingGeometry, tx: RingGeometry) -> Result<Self> {
        if rx.buffer_count == 0 || tx.buffer_count == 0 {
            return Err(M2sdrError::MapFailed {
                message: "simulated ring needs at least one buffer".to_string(),
            });
        }
        let arenas = [
            DmaArena::new(rx.total_bytes())?,
            DmaArena::new(tx.total_bytes())?,
        ];
        debug!(?rx, ?tx, "Created simulated DMA channel");
        Ok(Self {
            name: "simulated".to_string(),
            geometry: [rx, tx],
            arenas,
            state: Mutex::new(SimState::default()),
            ready: Condvar::new(),
        })
    }

    /// Hardware side: fill the next RX buffer with `data` (zero-padded to the
    /// buffer size) and advance the hardware counter.
    ///
    /// Returns `false` without touching memory when the RX engine is off.
    ///
    /// # Lapped slots
    ///
    /// Like the FPGA, the simulated engine writes the slot at `hw_count` even
    /// when software still holds it: injecting more than a ring's worth past
    /// an acquired [`ReadBuffer`](crate::ReadBuffer) overwrites that buffer.
    /// Do not inject while a slice from `ReadBuffer::samples` or
    /// `ReadBuffer::as_bytes` is alive across such a lap; re-borrow it after
    /// the injection instead.
    pub fn inject_rx(&self, data: &[u8]) -> bool {
        let geometry = self.geometry[Direction::Rx.index()];
        let mut state = self.state.lock();
        let engine = &mut state.engines[Direction::Rx.index()];
        if !engine.enabled {
            return false;
        }
        let slot = geometry.slot(engine.hw_count);
        let len = data.len().min(geometry.buffer_size);
        // SAFETY: the slot is inside the RX arena and is written through a raw
        // pointer, never a reference. Software only reads it through held
        // handles; see "Lapped slots" above for the overwrite case.
        unsafe {
            let dst = self.arenas[Direction::Rx.index()]
                .at(slot * geometry.buffer_size, geometry.buffer_size);
            std::ptr::copy_nonoverlapping(data.as_ptr(), dst, len);
            std::ptr::write_bytes(dst.add(len), 0, geometry.buffer_size - len);
        }
        engine.hw_count += 1;
        trace!(hw_count = engine.hw_count, slot, "Simulated RX buffer filled");
        drop(state);
        self.ready.notify_all();
        true
    }

    /// Hardware side: consume the next supplied TX buffer, if any.
    pub fn drain_tx(&self) -> Option<Vec<u8>> {
        let geometry = self.geometry[Direction::Tx.index()];
        let mut state = self.state.lock();
        let engine = &mut state.engines[Direction::Tx.index()];
        if !engine.enabled || engine.hw_count >= engine.sw_count {
            return None;
        }
        let slot = geometry.slot(engine.hw_count);
        // SAFETY: buffers below sw_count have been released by software and
        // are not written again until reacquired.
        let data = unsafe {
            let src = self.arenas[Direction::Tx.index()]
                .at(slot * geometry.buffer_size, geometry.buffer_size);
            std::slice::from_raw_parts(src, geometry.buffer_size).to_vec()
        };
        engine.hw_count += 1;
        drop(state);
        self.ready.notify_all();
        Some(data)
    }

    /// Hardware side: force the TX engine forward by `n` buffers whether or
    /// not software supplied them.
    pub fn advance_tx(&self, n: u64) {
        let mut state = self.state.lock();
        let engine = &mut state.engines[Direction::Tx.index()];
        if engine.enabled {
            engine.hw_count += n;
        }
        drop(state);
        self.ready.notify_all();
    }

    /// Counters as the kernel would report them.
    pub fn snapshot(&self, direction: Direction) -> DmaCounters {
        let state = self.state.lock();
        let engine = &state.engines[direction.index()];
        DmaCounters {
            hw_count: engine.hw_count,
            sw_count: engine.sw_count,
        }
    }

    /// Whether `direction`'s engine is running.
    pub fn is_enabled(&self, direction: Direction) -> bool {
        self.state.lock().engines[direction.index()].enabled
    }

    /// Whether loopback was requested when `direction` was last started.
    pub fn loopback(&self, direction: Direction) -> bool {
        self.state.lock().engines[direction.index()].loopback
    }

    /// End-of-burst markers received so far, as `(sequence, valid_bytes)`.
    pub fn burst_marks(&self) -> Vec<(u64, usize)> {
        self.state.lock().burst_marks.clone()
    }

    /// Make the next `start` of `direction` fail as if the kernel refused it.
    pub fn fail_next_start(&self, direction: Direction) {
        self.state.lock().engines[direction.index()].fail_next_start = true;
    }

    /// Make every register access fail until cleared.
    pub fn set_register_failure(&self, fail: bool) {
        self.state.lock().fail_register_access = fail;
    }
}

impl DmaChannel for SimulatedChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn geometry(&self, direction: Direction) -> RingGeometry {
        self.geometry[direction.index()]
    }

    fn buffer_ptr(&self, direction: Direction, index: usize) -> NonNull<u8> {
        let geometry = self.geometry[direction.index()];
        debug_assert!(index < geometry.buffer_count);
        let arena = &self.arenas[direction.index()];
        // SAFETY: index < buffer_count keeps the offset inside the arena.
        unsafe { NonNull::new_unchecked(arena.ptr.as_ptr().add(index * geometry.buffer_size)) }
    }

    fn start(&self, direction: Direction, loopback: bool) -> Result<DmaCounters> {
        let mut state = self.state.lock();
        let engine = &mut state.engines[direction.index()];
        if engine.fail_next_start {
            engine.fail_next_start = false;
            return Err(M2sdrError::Dma {
                direction,
                operation: "enable",
                source: std::io::Error::from_raw_os_error(libc::EIO),
            });
        }
        if engine.locked {
            return Err(M2sdrError::DeviceBusy {
                path: self.name.clone(),
                direction,
            });
        }
        *engine = EngineState {
            enabled: true,
            locked: true,
            loopback,
            ..EngineState::default()
        };
        Ok(DmaCounters::default())
    }

    fn stop(&self, direction: Direction) -> Result<()> {
        let mut state = self.state.lock();
        let engine = &mut state.engines[direction.index()];
        engine.enabled = false;
        engine.locked = false;
        drop(state);
        self.ready.notify_all();
        Ok(())
    }

    fn counters(&self, direction: Direction) -> Result<DmaCounters> {
        Ok(self.snapshot(direction))
    }

    fn update(&self, direction: Direction, sw_count: u64) -> Result<()> {
        let mut state = self.state.lock();
        let engine = &mut state.engines[direction.index()];
        engine.sw_count = engine.sw_count.max(sw_count);
        drop(state);
        self.ready.notify_all();
        Ok(())
    }

    fn mark_end_of_burst(&self, seq: u64, valid_bytes: usize) -> Result<()> {
        self.state.lock().burst_marks.push((seq, valid_bytes));
        Ok(())
    }

    fn wait_ready(&self, direction: Direction, sw_count: u64, timeout: Duration) -> Result<bool> {
        let depth = self.geometry[direction.index()].buffer_count as u64;
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.state.lock();
        loop {
            let engine = &state.engines[direction.index()];
            let ready = match direction {
                Direction::Rx => engine.hw_count > sw_count,
                Direction::Tx => sw_count.saturating_sub(engine.hw_count) < depth,
            };
            if ready {
                return Ok(true);
            }
            match deadline {
                Some(deadline) => {
                    if self.ready.wait_until(&mut state, deadline).timed_out() {
                        return Ok(false);
                    }
                }
                None => self.ready.wait(&mut state),
            }
        }
    }
}

impl RegisterBus for SimulatedChannel {
    fn read(&self, addr: u32) -> Result<u32> {
        let state = self.state.lock();
        if state.fail_register_access {
            return Err(M2sdrError::Register {
                addr,
                message: "simulated bus error".to_string(),
            });
        }
        Ok(state.registers.get(&addr).copied().unwrap_or(0))
    }

    fn write(&self, addr: u32, value: u32) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_register_access {
            return Err(M2sdrError::Register {
                addr,
                message: "simulated bus error".to_string(),
            });
        }
        state.registers.insert(addr, value);
        Ok(())
    }
}

impl std::fmt::Debug for SimulatedChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedChannel")
            .field("rx", &self.geometry[0])
            .field("tx", &self.geometry[1])
            .finish()
    }
}
