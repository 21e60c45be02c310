//! LitePCIe character-device backend.
//!
//! Opens `/dev/m2sdrN` (or any LitePCIe node), maps the whole DMA area with a
//! single shared mapping and drives the rings through the driver's ioctls.
//! The same file descriptor also serves register accesses for the control
//! plane (see [`RegisterBus`]).

use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::ptr::NonNull;
use std::time::{Duration, Instant};

use memmap2::{MmapOptions, MmapRaw};
use tracing::{debug, info, trace, warn};

use litepcie_sys::{
    litepcie_ioctl_dma, litepcie_ioctl_dma_reader, litepcie_ioctl_dma_writer, litepcie_ioctl_lock,
    litepcie_ioctl_mmap_dma_info, litepcie_ioctl_mmap_dma_update, litepcie_ioctl_reg,
    LITEPCIE_IOCTL_DMA, LITEPCIE_IOCTL_DMA_READER, LITEPCIE_IOCTL_DMA_WRITER, LITEPCIE_IOCTL_LOCK,
    LITEPCIE_IOCTL_MMAP_DMA_INFO, LITEPCIE_IOCTL_MMAP_DMA_READER_UPDATE,
    LITEPCIE_IOCTL_MMAP_DMA_WRITER_UPDATE, LITEPCIE_IOCTL_REG,
};

use super::{DmaChannel, DmaCounters, Direction, RingGeometry};
use crate::control::RegisterBus;
use crate::error::{M2sdrError, Result};

/// DMA channel backed by the LitePCIe kernel driver.
pub struct LitePcieChannel {
    path: String,
    file: File,
    /// Shared mapping of the TX and RX rings, owned for the channel lifetime.
    mmap: MmapRaw,
    info: litepcie_ioctl_mmap_dma_info,
}

impl LitePcieChannel {
    /// Open a LitePCIe device node and map its DMA rings.
    pub fn open(path: &str) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| M2sdrError::from_open(path, e))?;

        let mut info = litepcie_ioctl_mmap_dma_info::default();
        // SAFETY: fd is an open LitePCIe node and MMAP_DMA_INFO fills `info`.
        let ret = unsafe {
            litepcie_sys::ioctl(file.as_raw_fd(), LITEPCIE_IOCTL_MMAP_DMA_INFO, &mut info)
        };
        if ret < 0 {
            return Err(M2sdrError::MapFailed {
                message: format!(
                    "MMAP_DMA_INFO ioctl failed: {}",
                    std::io::Error::last_os_error()
                ),
            });
        }

        let tx_end = info.dma_tx_buf_offset + info.dma_tx_buf_size * info.dma_tx_buf_count;
        let rx_end = info.dma_rx_buf_offset + info.dma_rx_buf_size * info.dma_rx_buf_count;
        let len = tx_end.max(rx_end) as usize;
        if len == 0 || info.dma_rx_buf_count == 0 || info.dma_tx_buf_count == 0 {
            return Err(M2sdrError::MapFailed {
                message: format!("driver reported an empty DMA area: {:?}", info),
            });
        }

        let mmap = MmapOptions::new()
            .len(len)
            .map_raw(&file)
            .map_err(|e| M2sdrError::MapFailed {
                message: format!("mmap of {} bytes failed: {}", len, e),
            })?;

        info!(
            path = %path,
            rx_buf_size = info.dma_rx_buf_size,
            rx_buf_count = info.dma_rx_buf_count,
            tx_buf_size = info.dma_tx_buf_size,
            tx_buf_count = info.dma_tx_buf_count,
            "Opened LitePCIe device"
        );

        Ok(Self {
            path: path.to_string(),
            file,
            mmap,
            info,
        })
    }

    fn fd(&self) -> i32 {
        self.file.as_raw_fd()
    }

    fn dma_error(direction: Direction, operation: &'static str) -> M2sdrError {
        M2sdrError::Dma {
            direction,
            operation,
            source: std::io::Error::last_os_error(),
        }
    }

    /// Enable or disable an engine, returning its counters.
    fn set_enable(&self, direction: Direction, enable: bool) -> Result<DmaCounters> {
        let (hw_count, sw_count, ret) = match direction {
            Direction::Rx => {
                let mut req = litepcie_ioctl_dma_writer {
                    enable: enable as u8,
                    ..Default::default()
                };
                // SAFETY: DMA_WRITER takes a litepcie_ioctl_dma_writer.
                let ret =
                    unsafe { litepcie_sys::ioctl(self.fd(), LITEPCIE_IOCTL_DMA_WRITER, &mut req) };
                (req.hw_count, req.sw_count, ret)
            }
            Direction::Tx => {
                let mut req = litepcie_ioctl_dma_reader {
                    enable: enable as u8,
                    ..Default::default()
                };
                // SAFETY: DMA_READER takes a litepcie_ioctl_dma_reader.
                let ret =
                    unsafe { litepcie_sys::ioctl(self.fd(), LITEPCIE_IOCTL_DMA_READER, &mut req) };
                (req.hw_count, req.sw_count, ret)
            }
        };
        if ret < 0 {
            return Err(Self::dma_error(direction, "enable"));
        }
        Ok(DmaCounters {
            hw_count: hw_count.max(0) as u64,
            sw_count: sw_count.max(0) as u64,
        })
    }

    fn lock(&self, direction: Direction, request: bool) -> Result<bool> {
        let mut req = litepcie_ioctl_lock::default();
        match (direction, request) {
            (Direction::Rx, true) => req.dma_writer_request = 1,
            (Direction::Rx, false) => req.dma_writer_release = 1,
            (Direction::Tx, true) => req.dma_reader_request = 1,
            (Direction::Tx, false) => req.dma_reader_release = 1,
        }
        // SAFETY: LOCK takes a litepcie_ioctl_lock.
        let ret = unsafe { litepcie_sys::ioctl(self.fd(), LITEPCIE_IOCTL_LOCK, &mut req) };
        if ret < 0 {
            return Err(Self::dma_error(direction, "lock"));
        }
        Ok(match direction {
            Direction::Rx => req.dma_writer_status != 0,
            Direction::Tx => req.dma_reader_status != 0,
        })
    }

    fn ring_offset(&self, direction: Direction) -> u64 {
        match direction {
            Direction::Rx => self.info.dma_rx_buf_offset,
            Direction::Tx => self.info.dma_tx_buf_offset,
        }
    }
}

impl DmaChannel for LitePcieChannel {
    fn name(&self) -> &str {
        &self.path
    }

    fn geometry(&self, direction: Direction) -> RingGeometry {
        match direction {
            Direction::Rx => RingGeometry {
                buffer_size: self.info.dma_rx_buf_size as usize,
                buffer_count: self.info.dma_rx_buf_count as usize,
            },
            Direction::Tx => RingGeometry {
                buffer_size: self.info.dma_tx_buf_size as usize,
                buffer_count: self.info.dma_tx_buf_count as usize,
            },
        }
    }

    fn buffer_ptr(&self, direction: Direction, index: usize) -> NonNull<u8> {
        let geometry = self.geometry(direction);
        debug_assert!(index < geometry.buffer_count);
        let offset = self.ring_offset(direction) as usize + index * geometry.buffer_size;
        // SAFETY: offset lies inside the mapping, whose length covers both
        // rings (checked in `open`); the mapping is never null.
        unsafe { NonNull::new_unchecked(self.mmap.as_mut_ptr().add(offset)) }
    }

    fn start(&self, direction: Direction, loopback: bool) -> Result<DmaCounters> {
        if !self.lock(direction, true)? {
            return Err(M2sdrError::DeviceBusy {
                path: self.path.clone(),
                direction,
            });
        }

        let mut req = litepcie_ioctl_dma {
            loopback_enable: loopback as u8,
        };
        // SAFETY: DMA takes a litepcie_ioctl_dma.
        let ret = unsafe { litepcie_sys::ioctl(self.fd(), LITEPCIE_IOCTL_DMA, &mut req) };
        if ret < 0 {
            let err = Self::dma_error(direction, "loopback");
            let _ = self.lock(direction, false);
            return Err(err);
        }

        match self.set_enable(direction, true) {
            Ok(counters) => {
                debug!(path = %self.path, %direction, loopback, ?counters, "DMA enabled");
                Ok(counters)
            }
            Err(e) => {
                let _ = self.lock(direction, false);
                Err(e)
            }
        }
    }

    fn stop(&self, direction: Direction) -> Result<()> {
        let result = self.set_enable(direction, false);
        if let Err(e) = self.lock(direction, false) {
            warn!(path = %self.path, %direction, error = %e, "Failed to release DMA lock");
        }
        result.map(|counters| {
            debug!(path = %self.path, %direction, ?counters, "DMA disabled");
        })
    }

    fn counters(&self, direction: Direction) -> Result<DmaCounters> {
        // Re-asserting enable=1 is how the driver reports live counters.
        self.set_enable(direction, true)
    }

    fn update(&self, direction: Direction, sw_count: u64) -> Result<()> {
        let mut req = litepcie_ioctl_mmap_dma_update {
            sw_count: sw_count as i64,
        };
        let request = match direction {
            Direction::Rx => LITEPCIE_IOCTL_MMAP_DMA_WRITER_UPDATE,
            Direction::Tx => LITEPCIE_IOCTL_MMAP_DMA_READER_UPDATE,
        };
        // SAFETY: both update requests take a litepcie_ioctl_mmap_dma_update.
        let ret = unsafe { litepcie_sys::ioctl(self.fd(), request, &mut req) };
        if ret < 0 {
            return Err(Self::dma_error(direction, "update"));
        }
        trace!(%direction, sw_count, "DMA software counter updated");
        Ok(())
    }

    fn mark_end_of_burst(&self, seq: u64, valid_bytes: usize) -> Result<()> {
        // The LitePCIe reader has no short-buffer descriptor; the zero padding
        // written by the stream is what reaches the DAC.
        debug!(path = %self.path, seq, valid_bytes, "End of burst");
        Ok(())
    }

    fn wait_ready(&self, direction: Direction, sw_count: u64, timeout: Duration) -> Result<bool> {
        let geometry = self.geometry(direction);
        // `None` waits indefinitely.
        let deadline = Instant::now().checked_add(timeout);
        let events = match direction {
            Direction::Rx => libc::POLLIN,
            Direction::Tx => libc::POLLOUT,
        };

        loop {
            let counters = self.counters(direction)?;
            let ready = match direction {
                Direction::Rx => counters.hw_count > sw_count,
                Direction::Tx => {
                    sw_count.saturating_sub(counters.hw_count) < geometry.buffer_count as u64
                }
            };
            if ready {
                return Ok(true);
            }

            let timeout_ms = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Ok(false);
                    }
                    remaining.as_micros().div_ceil(1000).min(i32::MAX as u128) as i32
                }
                None => -1,
            };

            let mut fds = libc::pollfd {
                fd: self.fd(),
                events,
                revents: 0,
            };
            // SAFETY: fds points to one valid pollfd for the duration of the call.
            let ret = unsafe { libc::poll(&mut fds, 1, timeout_ms) };
            if ret < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(M2sdrError::Dma {
                    direction,
                    operation: "poll",
                    source: err,
                });
            }
        }
    }
}

impl RegisterBus for LitePcieChannel {
    fn read(&self, addr: u32) -> Result<u32> {
        let mut req = litepcie_ioctl_reg {
            addr,
            val: 0,
            is_write: 0,
        };
        // SAFETY: REG takes a litepcie_ioctl_reg.
        let ret = unsafe { litepcie_sys::ioctl(self.fd(), LITEPCIE_IOCTL_REG, &mut req) };
        if ret < 0 {
            return Err(M2sdrError::Register {
                addr,
                message: std::io::Error::last_os_error().to_string(),
            });
        }
        Ok(req.val)
    }

    fn write(&self, addr: u32, value: u32) -> Result<()> {
        let mut req = litepcie_ioctl_reg {
            addr,
            val: value,
            is_write: 1,
        };
        // SAFETY: REG takes a litepcie_ioctl_reg.
        let ret = unsafe { litepcie_sys::ioctl(self.fd(), LITEPCIE_IOCTL_REG, &mut req) };
        if ret < 0 {
            return Err(M2sdrError::Register {
                addr,
                message: std::io::Error::last_os_error().to_string(),
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for LitePcieChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LitePcieChannel")
            .field("path", &self.path)
            .field("rx", &self.geometry(Direction::Rx))
            .field("tx", &self.geometry(Direction::Tx))
            .finish()
    }
}
