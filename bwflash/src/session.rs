//! Flash session state machine.
//!
//! One [`FlashSession`] drives one device through the shared lifecycle
//!
//! ```text
//! Idle -> Detecting -> Handshaking -> Erasing -> Writing(block) -> Verifying -> Complete
//!                \___________\___________\____________\______________\--> Failed
//! ```
//!
//! regardless of protocol: the per-family differences (frame constants,
//! checksum parameters, transforms, block size, command ids) live
//! behind the [`FlasherOps`] trait, so the lifecycle logic is written
//! and tested once.
//!
//! The session is synchronous and single-threaded; it suspends only in
//! transport reads. Cancellation is cooperative and takes effect at the
//! next state or block boundary, never mid-frame. Progress reporting is
//! a fire-and-forget callback owned by the caller; the engine holds no
//! process-wide state.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{info, warn};

use crate::error::{Error, Result};
use crate::firmware::FirmwareKind;

/// Lifecycle states of a flash session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashState {
    /// Session constructed, nothing sent.
    Idle,
    /// Querying device identity.
    Detecting,
    /// Establishing (and, protocol permitting, authenticating) the link.
    Handshaking,
    /// Erase command in flight. Past this point the device may be
    /// non-bootable.
    Erasing,
    /// Sequential block transfer; carries the current block cursor.
    Writing(usize),
    /// Finalize query sent, awaiting on-device verification.
    Verifying,
    /// Terminal: firmware flashed and verified.
    Complete,
    /// Terminal: session failed.
    Failed,
}

impl fmt::Display for FlashState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Detecting => write!(f, "Detecting"),
            Self::Handshaking => write!(f, "Handshaking"),
            Self::Erasing => write!(f, "Erasing"),
            Self::Writing(block) => write!(f, "Writing(block {block})"),
            Self::Verifying => write!(f, "Verifying"),
            Self::Complete => write!(f, "Complete"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Events emitted to the caller at state transitions and block
/// completions.
///
/// The observer must not block; the session fires and forgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashEvent {
    /// The session changed state.
    StateChanged {
        /// Previous state.
        from: FlashState,
        /// New state.
        to: FlashState,
    },
    /// A block was transferred and acknowledged.
    BlockWritten {
        /// Index of the completed block.
        index: usize,
        /// Total number of blocks.
        total: usize,
    },
}

/// Cooperative cancellation handle.
///
/// Cloned freely; the caller keeps one end and hands the other to the
/// session. Checked between steps and between blocks only, so no
/// partial frame is ever left on the wire.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Create a token in the not-cancelled state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Post-failure assessment of the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceHealth {
    /// Failure happened before anything was erased; the device still
    /// runs its old firmware.
    Bootable,
    /// Failure happened at or after the erase command; the device may
    /// not boot until a flash completes.
    Unknown,
}

/// Identity reported by the device during detection.
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    /// Protocol family the device speaks.
    pub kind: FirmwareKind,
    /// Device UID, when the protocol reports one.
    pub uid: Option<[u8; 16]>,
    /// Firmware/bootloader version string, when reported.
    pub version: Option<String>,
}

/// Successful session summary.
#[derive(Debug, Clone)]
pub struct FlashSummary {
    /// Identity recorded during detection.
    pub identity: DeviceIdentity,
    /// Blocks transferred (equals `total_blocks` on success).
    pub blocks_written: usize,
    /// Total number of blocks in the image.
    pub total_blocks: usize,
}

/// Terminal failure with enough context to diagnose without hardware.
#[derive(Debug)]
pub struct FlashError {
    /// Underlying error.
    pub error: Error,
    /// State the session failed in.
    pub state: FlashState,
    /// Block cursor at failure, when writing.
    pub block: Option<usize>,
    /// Attempts spent on the failing exchange.
    pub attempts: u32,
    /// Whether the device is still expected to boot.
    pub device: DeviceHealth,
}

impl fmt::Display for FlashError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (state: {}", self.error, self.state)?;
        if let Some(block) = self.block {
            write!(f, ", block {block}")?;
        }
        write!(f, ", attempts: {})", self.attempts)?;
        if self.device == DeviceHealth::Unknown {
            write!(f, "; device state unknown, do not power off")?;
        }
        Ok(())
    }
}

impl std::error::Error for FlashError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Protocol-specific flashing operations.
///
/// Implementations own their transport exclusively and route every
/// request/response exchange through the session's retry policy. The
/// engine calls these in lifecycle order and never concurrently.
pub trait FlasherOps {
    /// Protocol family this flasher speaks.
    fn kind(&self) -> FirmwareKind;

    /// Number of blocks the image transfers as.
    fn block_count(&self) -> usize;

    /// Query the device identity.
    ///
    /// Must fail with [`Error::DeviceMismatch`] when the device answers
    /// in another family's framing.
    fn identify(&mut self) -> Result<DeviceIdentity>;

    /// Establish (and authenticate, where the protocol requires) the link.
    fn handshake(&mut self) -> Result<()>;

    /// Issue the erase/begin-update command. Irreversible on the device.
    fn erase(&mut self) -> Result<()>;

    /// Transfer block `index`, resending the same block on NAK/timeout
    /// within the retry bound.
    fn write_block(&mut self, index: usize) -> Result<()>;

    /// Send the end-of-transfer command and await confirmation,
    /// retrying the query (never the payload) on a lost ack.
    fn finalize(&mut self) -> Result<()>;

    /// Confirm on-device verification and activate the new firmware.
    fn verify(&mut self) -> Result<()>;
}

/// Drives one [`FlasherOps`] implementation through the lifecycle.
pub struct FlashSession<'a> {
    flasher: Box<dyn FlasherOps + 'a>,
    state: FlashState,
    cancel: CancelToken,
}

impl<'a> FlashSession<'a> {
    /// Create a session over a type-selected flasher.
    pub fn new(flasher: Box<dyn FlasherOps + 'a>, cancel: CancelToken) -> Self {
        Self {
            flasher,
            state: FlashState::Idle,
            cancel,
        }
    }

    /// Current state.
    pub fn state(&self) -> FlashState {
        self.state
    }

    fn goto(&mut self, to: FlashState, observer: &mut dyn FnMut(FlashEvent)) {
        info!("state transition: {} -> {to}", self.state);
        let from = self.state;
        self.state = to;
        observer(FlashEvent::StateChanged { from, to });
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Run the session to a terminal state.
    ///
    /// On failure the transport is released with no retry left in
    /// flight; the error carries the state, block cursor, attempt count
    /// and a device-health assessment that is never downgraded once the
    /// erase command has been issued.
    pub fn run(
        mut self,
        observer: &mut dyn FnMut(FlashEvent),
    ) -> std::result::Result<FlashSummary, FlashError> {
        let total_blocks = self.flasher.block_count();

        macro_rules! step {
            ($block:expr, $health:expr, $op:expr) => {{
                match self.check_cancelled().and_then(|()| $op) {
                    Ok(value) => value,
                    Err(error) => return Err(self.fail(error, $block, $health, observer)),
                }
            }};
        }

        self.goto(FlashState::Detecting, observer);
        let identity = step!(None, DeviceHealth::Bootable, self.flasher.identify());
        info!("device identified as {}", identity.kind);

        self.goto(FlashState::Handshaking, observer);
        step!(None, DeviceHealth::Bootable, self.flasher.handshake());

        self.goto(FlashState::Erasing, observer);
        // From here on a failure leaves the device in an unknown state:
        // the erase command may have reached it even if the ack did not
        // come back.
        step!(None, DeviceHealth::Unknown, self.flasher.erase());

        for block in 0..total_blocks {
            self.goto(FlashState::Writing(block), observer);
            step!(
                Some(block),
                DeviceHealth::Unknown,
                self.flasher.write_block(block)
            );
            observer(FlashEvent::BlockWritten {
                index: block,
                total: total_blocks,
            });
        }

        self.goto(FlashState::Verifying, observer);
        step!(None, DeviceHealth::Unknown, self.flasher.finalize());
        step!(None, DeviceHealth::Unknown, self.flasher.verify());

        self.goto(FlashState::Complete, observer);
        Ok(FlashSummary {
            identity,
            blocks_written: total_blocks,
            total_blocks,
        })
    }

    fn fail(
        &mut self,
        error: Error,
        block: Option<usize>,
        health: DeviceHealth,
        observer: &mut dyn FnMut(FlashEvent),
    ) -> FlashError {
        let state = self.state;
        // Cancellation before the erase ack never bricks the device.
        let device = if matches!(error, Error::Cancelled) && state == FlashState::Erasing {
            DeviceHealth::Bootable
        } else {
            health
        };
        let attempts = match &error {
            Error::EraseFailed { attempts } | Error::WriteFailed { attempts, .. } => *attempts,
            _ => 1,
        };
        warn!("session failed in {state}: {error}");
        self.goto(FlashState::Failed, observer);
        FlashError {
            error,
            state,
            block,
            attempts,
            device,
        }
    }
}

/// Orchestrate a complete flash: build a session over `flasher`, run the
/// lifecycle, and return the terminal result.
pub fn run_flash<'a>(
    flasher: Box<dyn FlasherOps + 'a>,
    observer: &mut dyn FnMut(FlashEvent),
    cancel: CancelToken,
) -> std::result::Result<FlashSummary, FlashError> {
    FlashSession::new(flasher, cancel).run(observer)
}
