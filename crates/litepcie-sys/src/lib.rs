//! Low-level kernel ABI for the LitePCIe character device.
//!
//! This crate mirrors the `litepcie.h` ioctl interface exposed by the LitePCIe
//! kernel driver (`/dev/m2sdr*`, `/dev/litepcie*`). It contains only
//! `#[repr(C)]` request structures and the encoded request numbers; the safe
//! wrapper lives in the `litex_m2sdr` crate.
//!
//! # Safety
//!
//! Every helper here is a thin `unsafe` wrapper around `libc::ioctl`. Callers
//! must pass a file descriptor opened on a LitePCIe device.

#![allow(non_camel_case_types)]

use std::mem::size_of;
use std::os::raw::{c_int, c_ulong};

/// ioctl "magic" type byte used by the LitePCIe driver.
pub const LITEPCIE_IOCTL: u8 = b'S';

const IOC_NRBITS: c_ulong = 8;
const IOC_TYPEBITS: c_ulong = 8;
const IOC_SIZEBITS: c_ulong = 14;

const IOC_NRSHIFT: c_ulong = 0;
const IOC_TYPESHIFT: c_ulong = IOC_NRSHIFT + IOC_NRBITS;
const IOC_SIZESHIFT: c_ulong = IOC_TYPESHIFT + IOC_TYPEBITS;
const IOC_DIRSHIFT: c_ulong = IOC_SIZESHIFT + IOC_SIZEBITS;

const IOC_WRITE: c_ulong = 1;
const IOC_READ: c_ulong = 2;

/// Encode an ioctl request number the way the `_IOC` C macro does.
pub const fn ioc(dir: c_ulong, ty: u8, nr: u8, size: usize) -> c_ulong {
    (dir << IOC_DIRSHIFT)
        | ((ty as c_ulong) << IOC_TYPESHIFT)
        | ((nr as c_ulong) << IOC_NRSHIFT)
        | ((size as c_ulong) << IOC_SIZESHIFT)
}

const fn iow<T>(nr: u8) -> c_ulong {
    ioc(IOC_WRITE, LITEPCIE_IOCTL, nr, size_of::<T>())
}

const fn ior<T>(nr: u8) -> c_ulong {
    ioc(IOC_READ, LITEPCIE_IOCTL, nr, size_of::<T>())
}

const fn iowr<T>(nr: u8) -> c_ulong {
    ioc(IOC_READ | IOC_WRITE, LITEPCIE_IOCTL, nr, size_of::<T>())
}

/// Register (CSR) access.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct litepcie_ioctl_reg {
    /// CSR byte address.
    pub addr: u32,
    /// Value to write, or the value read back.
    pub val: u32,
    /// Non-zero for a write.
    pub is_write: u8,
}

/// DMA loopback control.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct litepcie_ioctl_dma {
    /// Non-zero routes the TX stream back into RX inside the FPGA.
    pub loopback_enable: u8,
}

/// DMA writer (device to host, RX) enable and counters.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct litepcie_ioctl_dma_writer {
    /// 1 to enable the engine, 0 to disable it.
    pub enable: u8,
    /// Buffers processed by the hardware.
    pub hw_count: i64,
    /// Buffers handed over by software.
    pub sw_count: i64,
}

/// DMA reader (host to device, TX) enable and counters.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct litepcie_ioctl_dma_reader {
    /// 1 to enable the engine, 0 to disable it.
    pub enable: u8,
    /// Buffers processed by the hardware.
    pub hw_count: i64,
    /// Buffers handed over by software.
    pub sw_count: i64,
}

/// Exclusive DMA ownership requests.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct litepcie_ioctl_lock {
    /// Request the reader (TX) engine.
    pub dma_reader_request: u8,
    /// Request the writer (RX) engine.
    pub dma_writer_request: u8,
    /// Release the reader (TX) engine.
    pub dma_reader_release: u8,
    /// Release the writer (RX) engine.
    pub dma_writer_release: u8,
    /// Set by the driver when this file owns the reader.
    pub dma_reader_status: u8,
    /// Set by the driver when this file owns the writer.
    pub dma_writer_status: u8,
}

/// Layout of the mmap-able DMA area.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct litepcie_ioctl_mmap_dma_info {
    /// Offset of the TX ring within the mapping.
    pub dma_tx_buf_offset: u64,
    /// Bytes per TX buffer.
    pub dma_tx_buf_size: u64,
    /// Number of TX buffers.
    pub dma_tx_buf_count: u64,
    /// Offset of the RX ring within the mapping.
    pub dma_rx_buf_offset: u64,
    /// Bytes per RX buffer.
    pub dma_rx_buf_size: u64,
    /// Number of RX buffers.
    pub dma_rx_buf_count: u64,
}

/// Software counter update for the mmap interface.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct litepcie_ioctl_mmap_dma_update {
    /// Buffers handed over by software.
    pub sw_count: i64,
}

/// Read or write one CSR.
pub const LITEPCIE_IOCTL_REG: c_ulong = iowr::<litepcie_ioctl_reg>(0);
/// Set DMA loopback.
pub const LITEPCIE_IOCTL_DMA: c_ulong = iow::<litepcie_ioctl_dma>(20);
/// Enable or disable the RX engine and read its counters.
pub const LITEPCIE_IOCTL_DMA_WRITER: c_ulong = iowr::<litepcie_ioctl_dma_writer>(21);
/// Enable or disable the TX engine and read its counters.
pub const LITEPCIE_IOCTL_DMA_READER: c_ulong = iowr::<litepcie_ioctl_dma_reader>(22);
/// Query the layout of the DMA mapping.
pub const LITEPCIE_IOCTL_MMAP_DMA_INFO: c_ulong = ior::<litepcie_ioctl_mmap_dma_info>(24);
/// Request or release exclusive engine ownership.
pub const LITEPCIE_IOCTL_LOCK: c_ulong = iowr::<litepcie_ioctl_lock>(25);
/// Publish the RX software counter.
pub const LITEPCIE_IOCTL_MMAP_DMA_WRITER_UPDATE: c_ulong =
    iow::<litepcie_ioctl_mmap_dma_update>(26);
/// Publish the TX software counter.
pub const LITEPCIE_IOCTL_MMAP_DMA_READER_UPDATE: c_ulong =
    iow::<litepcie_ioctl_mmap_dma_update>(27);

/// Issue `request` on `fd` with a pointer to `arg`.
///
/// Returns the raw ioctl return value (negative on error, `errno` set).
///
/// # Safety
///
/// `fd` must be an open LitePCIe device and `T` must be the structure the
/// driver expects for `request`.
pub unsafe fn ioctl<T>(fd: c_int, request: c_ulong, arg: &mut T) -> c_int {
    libc::ioctl(fd, request as _, arg as *mut T)
}
