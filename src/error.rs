//! Error types for M2SDR device and stream operations.
//!
//! Every fallible operation in this crate returns [`M2sdrError`]. Timeouts are
//! deliberately *not* errors: an acquire that sees no buffer within its
//! deadline returns `Ok(None)` and the remainder adapter reports `timed_out`.
//! Overflow and underflow are likewise reported as flags on successful calls.

use thiserror::Error;

use crate::dma::Direction;
use crate::stream::StreamState;

/// Result type alias for M2SDR operations.
pub type Result<T> = std::result::Result<T, M2sdrError>;

/// Errors that can occur when driving an M2SDR device.
#[derive(Error, Debug)]
pub enum M2sdrError {
    /// Device node could not be opened
    #[error("Failed to open device '{path}': {message}")]
    DeviceNotFound { path: String, message: String },

    /// Permission denied when accessing the device node
    #[error("Permission denied for device '{path}'. Check udev rules or run as root.")]
    PermissionDenied { path: String },

    /// DMA direction is already owned by another process or stream
    #[error("{direction} DMA on '{path}' is busy (in use by another process)")]
    DeviceBusy { path: String, direction: Direction },

    /// DMA area could not be mapped into the process
    #[error("Failed to map DMA buffers: {message}")]
    MapFailed { message: String },

    /// Requested sample format is not the native encoding
    #[error("Unsupported stream format '{format}': only CS16 is supported")]
    InvalidFormat { format: String },

    /// Channel list is empty, too long, duplicated or out of range
    #[error("Invalid channel selection {channels:?}: expected 1 or 2 distinct channels from {{0, 1}}")]
    InvalidChannelSelection { channels: Vec<usize> },

    /// Stream option that this driver does not understand
    #[error("Unknown stream argument '{key}'")]
    UnknownStreamArg { key: String },

    /// Stream option with a value that cannot be parsed
    #[error("Invalid value '{value}' for stream argument '{key}'")]
    InvalidStreamArg { key: String, value: String },

    /// Hardware buffer size is not a whole number of sample frames
    #[error("{direction} buffer of {buffer_bytes} bytes is not a multiple of the {frame_bytes}-byte frame")]
    FormatMismatch {
        direction: Direction,
        buffer_bytes: usize,
        frame_bytes: usize,
    },

    /// Operation invoked in a state where it is not legal
    #[error("Cannot {operation} {direction} stream in state {state:?}")]
    InvalidState {
        direction: Direction,
        state: StreamState,
        operation: &'static str,
    },

    /// Buffer handle outside the ring or not currently held
    #[error("Invalid {direction} buffer handle {handle}")]
    InvalidHandle { direction: Direction, handle: usize },

    /// Next ring slot is still held by the caller
    #[error("{direction} buffer {handle} is still held by the caller")]
    BufferInUse { direction: Direction, handle: usize },

    /// Element count that does not fit the buffer or the channel layout
    #[error("Invalid length {requested}: {reason}")]
    InvalidLength { requested: usize, reason: String },

    /// Kernel rejected a DMA control command
    #[error("DMA {operation} failed on {direction}: {source}")]
    Dma {
        direction: Direction,
        operation: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// Register bus access failed
    #[error("Register access at 0x{addr:05x} failed: {message}")]
    Register { addr: u32, message: String },

    /// Setting outside the supported hardware range
    #[error("{setting} {value} out of range [{min}, {max}]")]
    OutOfRange {
        setting: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    /// Front-end channel index outside {0, 1}
    #[error("Invalid {direction} channel {channel}")]
    InvalidChannel { direction: Direction, channel: usize },

    /// Named value (antenna, clock source, gain element) that does not exist
    #[error("Unknown {kind} '{name}'")]
    UnknownName { kind: &'static str, name: String },

    /// Invalid configuration or parameter
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// I/O error from the operating system
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for M2sdrError {
    fn from(err: figment::Error) -> Self {
        Self::Config(Box::new(err))
    }
}

impl M2sdrError {
    /// Build an error from `errno` after a failed `open(2)` of `path`.
    pub(crate) fn from_open(path: &str, err: std::io::Error) -> Self {
        match err.raw_os_error() {
            Some(libc::EACCES) | Some(libc::EPERM) => Self::PermissionDenied {
                path: path.to_string(),
            },
            _ => Self::DeviceNotFound {
                path: path.to_string(),
                message: err.to_string(),
            },
        }
    }

    /// Check if this is a "device not found" type error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::DeviceNotFound { .. })
    }

    /// Check if the DMA direction is held elsewhere.
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::DeviceBusy { .. })
    }

    /// Check if this is an illegal state transition or call.
    pub fn is_invalid_state(&self) -> bool {
        matches!(self, Self::InvalidState { .. })
    }

    /// Check if the error came from validating stream setup parameters.
    pub fn is_setup_rejection(&self) -> bool {
        matches!(
            self,
            Self::InvalidFormat { .. }
                | Self::InvalidChannelSelection { .. }
                | Self::UnknownStreamArg { .. }
                | Self::InvalidStreamArg { .. }
                | Self::FormatMismatch { .. }
        )
    }
}
