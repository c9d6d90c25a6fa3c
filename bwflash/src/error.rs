//! Error types for bwflash.

use std::io;
use thiserror::Error;

use crate::firmware::FirmwareKind;

/// Result type for bwflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for bwflash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Malformed or structurally invalid firmware image.
    #[error("Invalid firmware image: {0}")]
    InvalidImage(String),

    /// Firmware type could not be detected.
    #[error("Unrecognized firmware image (no known signature)")]
    UnsupportedImage,

    /// Frame payload exceeds the protocol's maximum size.
    #[error("Frame payload too large: {len} bytes (max {max})")]
    FrameTooLarge {
        /// Actual payload length.
        len: usize,
        /// Protocol maximum.
        max: usize,
    },

    /// Truncated or malformed frame on the wire.
    #[error("Framing error: {0}")]
    Framing(String),

    /// CRC checksum mismatch.
    #[error("CRC mismatch: expected {expected:#06x}, got {actual:#06x}")]
    ChecksumMismatch {
        /// Checksum declared in the frame trailer.
        expected: u16,
        /// Checksum recomputed over the payload.
        actual: u16,
    },

    /// Communication timeout.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Device not responding or port not found.
    #[error("Device not found or not responding")]
    DeviceNotFound,

    /// Attached device does not match the firmware type.
    #[error("Device mismatch: image is {image}, device identifies as {device}")]
    DeviceMismatch {
        /// Firmware type declared by the image.
        image: FirmwareKind,
        /// Firmware type the device identified as.
        device: FirmwareKind,
    },

    /// Handshake failed.
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    /// Challenge/response authentication failed.
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// Erase command rejected or unacknowledged after retries.
    #[error("Erase failed after {attempts} attempts")]
    EraseFailed {
        /// Number of attempts made.
        attempts: u32,
    },

    /// Device NAKed a data chunk (on-device CRC check failed).
    #[error("Chunk rejected by device (block {block})")]
    ChunkRejected {
        /// Block the chunk belongs to.
        block: usize,
    },

    /// Block transfer failed after exhausting retries.
    #[error("Write failed at block {block} after {attempts} attempts")]
    WriteFailed {
        /// Index of the block that could not be transferred.
        block: usize,
        /// Number of attempts made.
        attempts: u32,
    },

    /// Device reported verification failure.
    #[error("Verification failed: {0}")]
    VerifyFailed(String),

    /// Operation cancelled by the caller.
    #[error("Operation cancelled")]
    Cancelled,

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl Error {
    /// Whether this error is transient wire-level corruption that the
    /// retry policy may absorb.
    ///
    /// Framing errors, checksum mismatches and device NAKs are treated
    /// identically to timeouts: the exchange is repeated, never
    /// escalated directly.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_)
                | Self::Framing(_)
                | Self::ChecksumMismatch { .. }
                | Self::ChunkRejected { .. }
        )
    }
}
