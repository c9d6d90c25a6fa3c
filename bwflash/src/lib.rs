//! # bwflash
//!
//! A library for flashing Brightway and Leqi scooter controllers.
//!
//! This crate provides the core functionality for driving a controller
//! through a firmware update over a serial (UART) link, including:
//!
//! - firmware type detection and image validation
//! - the Brightway authenticated DFU protocol (challenge/response
//!   signing with firmware-embedded tables)
//! - the Leqi binary packet protocol (XOR-0xAA payload)
//! - a shared flash lifecycle state machine with bounded retry and
//!   timeout recovery at every step
//! - a simulated device implementing the same transport contract as the
//!   serial adapter, with deterministic fault injection
//!
//! ## Supported Platforms
//!
//! - **Native** (default): Linux, macOS, Windows via the `serialport`
//!   crate
//! - The protocol core and the simulator build without any platform
//!   serial support (disable the `native` feature)
//!
//! ## Features
//!
//! - `native` (default): serial port transport
//! - `serde`: serialization support for data types
//!
//! ## Example
//!
//! ```rust,no_run
//! use bwflash::{CancelToken, FirmwareImage, RetryPolicy, run_flash, select_flasher};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Parse and type-detect the firmware image
//!     let image = FirmwareImage::from_file("firmware.bin")?;
//!
//!     // Open the transport and pick the matching protocol
//!     #[cfg(feature = "native")]
//!     {
//!         let port = bwflash::SerialTransport::open("/dev/ttyUSB0", 19_200)?;
//!         let flasher = select_flasher(&image, port, RetryPolicy::default())?;
//!
//!         // Drive the session, reporting progress to the callback
//!         let summary = run_flash(
//!             flasher,
//!             &mut |event| println!("{event:?}"),
//!             CancelToken::new(),
//!         )?;
//!         println!(
//!             "flashed {}/{} blocks",
//!             summary.blocks_written, summary.total_blocks
//!         );
//!     }
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod firmware;
pub mod protocol;
pub mod retry;
pub mod session;
pub mod target;
pub mod transport;

// Re-exports for convenience
// Native-specific re-exports
#[cfg(feature = "native")]
pub use transport::serial::{DEFAULT_BAUD, PortInfo, SerialTransport, list_ports};
pub use {
    error::{Error, Result},
    firmware::{FirmwareImage, FirmwareKind, ImageChecksum, detect},
    retry::RetryPolicy,
    session::{
        CancelToken, DeviceHealth, DeviceIdentity, FlashError, FlashEvent, FlashSession,
        FlashState, FlashSummary, FlasherOps, run_flash,
    },
    target::{BrightwayFlasher, LeqiFlasher, select_flasher},
    transport::{
        Transport,
        sim::{FaultPlan, SimProbe, SimulatedDevice},
    },
};
