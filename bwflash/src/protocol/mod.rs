//! Protocol implementations.

pub mod auth;
pub mod brightway;
pub mod checksum;
pub mod leqi;

// Re-export common types
pub use checksum::{CRC16_ARC, CRC16_XMODEM, Crc16Params, crc16, crc32};
pub use leqi::{LeqiCommand, LeqiFrame};
