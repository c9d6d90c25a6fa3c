//! Per-protocol flasher implementations.
//!
//! [`select_flasher`] picks the implementation matching the detected
//! firmware family; the returned trait object is driven by
//! [`crate::session::FlashSession`]. Both implementations are generic
//! over the transport, so the same code runs against a serial port and
//! the simulated device.

pub mod brightway;
pub mod leqi;

use crate::error::{Error, Result};
use crate::firmware::{FirmwareImage, FirmwareKind};
use crate::retry::RetryPolicy;
use crate::session::FlasherOps;
use crate::transport::Transport;

pub use brightway::BrightwayFlasher;
pub use leqi::LeqiFlasher;

/// Create the flasher matching the image's firmware family.
///
/// The transport is moved into the flasher, which owns it exclusively
/// until the session reaches a terminal state.
pub fn select_flasher<'a, T: Transport + 'a>(
    image: &'a FirmwareImage,
    transport: T,
    retry: RetryPolicy,
) -> Result<Box<dyn FlasherOps + 'a>> {
    match image.kind() {
        FirmwareKind::Brightway => Ok(Box::new(BrightwayFlasher::new(transport, image, retry)?)),
        FirmwareKind::Leqi => Ok(Box::new(LeqiFlasher::new(transport, image, retry)?)),
        FirmwareKind::Unknown => Err(Error::UnsupportedImage),
    }
}
