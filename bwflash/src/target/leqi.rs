//! Leqi flasher implementation.
//!
//! Lifecycle mapping for the Leqi packet protocol:
//!
//! - identify: Identify frame; the ack carries a model byte. A text
//!   banner instead of a framed ack means a Brightway-family device.
//! - handshake: nothing on the wire (the protocol has no auth step)
//! - erase: Start frame carrying the firmware size; the controller
//!   erases the target region when it acknowledges
//! - write_block: one Data frame per 128-byte chunk, offset-addressed,
//!   so resends are idempotent
//! - finalize: End frame, re-queried on a lost ack (the controller
//!   verifies while the ack may be lost on the wire)
//! - verify: subsumed by the End acknowledgment's status byte
//!
//! The firmware payload is already XOR-0xAA encrypted on disk and is
//! transferred as-is; the controller decrypts on its side.

use std::thread;
use std::time::Duration;

use log::{debug, info, trace};

use crate::error::{Error, Result};
use crate::firmware::{FirmwareImage, FirmwareKind};
use crate::protocol::leqi::{
    CHUNK_SIZE, DIR_DEVICE, LeqiCommand, LeqiFrame, MODEL_LEQI, PREAMBLE, STATUS_OK,
};
use crate::retry::RetryPolicy;
use crate::session::{DeviceIdentity, FlasherOps};
use crate::transport::{Transport, read_some};

/// Pause between data frames; the controller needs time to commit each
/// chunk.
pub const CHUNK_DELAY: Duration = Duration::from_millis(44);

/// Upper bound on a single device reply.
const MAX_REPLY: usize = 64;

/// Whether a reply looks like a Brightway text banner.
fn looks_like_brightway(resp: &[u8]) -> bool {
    resp.last() == Some(&b'\r') || resp.iter().all(u8::is_ascii)
}

/// Leqi flasher, generic over the transport.
pub struct LeqiFlasher<'a, T: Transport> {
    transport: T,
    image: &'a FirmwareImage,
    retry: RetryPolicy,
    chunk_delay: Duration,
    fw_size: u16,
}

impl<'a, T: Transport> LeqiFlasher<'a, T> {
    /// Create a flasher over an owned transport.
    pub fn new(transport: T, image: &'a FirmwareImage, retry: RetryPolicy) -> Result<Self> {
        let fw_size = u16::try_from(image.declared_size()).map_err(|_| {
            Error::InvalidImage(format!(
                "payload of {} bytes exceeds the protocol's 16-bit size field",
                image.declared_size()
            ))
        })?;
        Ok(Self {
            transport,
            image,
            retry,
            chunk_delay: CHUNK_DELAY,
            fw_size,
        })
    }

    /// Override the inter-chunk pause (zero for simulation).
    #[must_use]
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    /// Send a frame and read the raw reply bytes.
    fn raw_exchange(&mut self, frame: &LeqiFrame) -> Result<Vec<u8>> {
        let bytes = frame.encode()?;
        trace!("tx {:?} ({} bytes)", frame.command, bytes.len());
        self.transport.clear_input()?;
        self.transport.write_all(&bytes)?;
        self.transport.flush()?;
        read_some(&mut self.transport, MAX_REPLY, self.retry.timeout)
    }

    /// Send a frame and decode the acknowledgment it must produce.
    fn ack_exchange(&mut self, frame: &LeqiFrame, expect: LeqiCommand) -> Result<LeqiFrame> {
        let raw = self.raw_exchange(frame)?;
        let ack = LeqiFrame::decode(&raw)?;
        if ack.direction != DIR_DEVICE || ack.command != expect {
            return Err(Error::Framing(format!(
                "expected {expect:?} ack, got {:?} (dir {:#04X})",
                ack.command, ack.direction
            )));
        }
        Ok(ack)
    }
}

impl<T: Transport> FlasherOps for LeqiFlasher<'_, T> {
    fn kind(&self) -> FirmwareKind {
        FirmwareKind::Leqi
    }

    fn block_count(&self) -> usize {
        self.image.block_count(CHUNK_SIZE)
    }

    fn identify(&mut self) -> Result<DeviceIdentity> {
        let retry = self.retry;
        let probe = LeqiFrame::identify();

        let model = retry
            .attempt(|_| {
                let raw = self.raw_exchange(&probe)?;
                if raw.first() != Some(&PREAMBLE) {
                    if looks_like_brightway(&raw) {
                        return Err(Error::DeviceMismatch {
                            image: FirmwareKind::Leqi,
                            device: FirmwareKind::Brightway,
                        });
                    }
                    return Err(Error::Framing(format!(
                        "unrecognized identify reply: {raw:02X?}"
                    )));
                }
                let ack = LeqiFrame::decode(&raw)?;
                if ack.command != LeqiCommand::Identify || ack.status() != Some(STATUS_OK) {
                    return Err(Error::Framing("malformed identify ack".into()));
                }
                Ok(ack.payload.get(1).copied())
            })
            .map_err(|e| if e.is_retryable() { Error::DeviceNotFound } else { e })?;

        match model {
            Some(MODEL_LEQI) => {
                info!("Leqi controller identified (model {MODEL_LEQI:#04X})");
                Ok(DeviceIdentity {
                    kind: FirmwareKind::Leqi,
                    uid: None,
                    version: Some(format!("model {MODEL_LEQI:#04X}")),
                })
            }
            _ => Err(Error::DeviceMismatch {
                image: FirmwareKind::Leqi,
                device: FirmwareKind::Unknown,
            }),
        }
    }

    fn handshake(&mut self) -> Result<()> {
        // No authentication on this protocol family.
        debug!("Leqi handshake: nothing to exchange");
        Ok(())
    }

    fn erase(&mut self) -> Result<()> {
        let retry = self.retry;
        let start = LeqiFrame::start(self.fw_size);
        debug!("start command, payload size 0x{:04X}", self.fw_size);
        retry
            .attempt(|_| {
                let ack = self.ack_exchange(&start, LeqiCommand::Start)?;
                if ack.status() == Some(STATUS_OK) {
                    Ok(())
                } else {
                    Err(Error::EraseFailed { attempts: 1 })
                }
            })
            .map_err(|e| {
                if e.is_retryable() {
                    Error::EraseFailed {
                        attempts: retry.max_attempts,
                    }
                } else {
                    e
                }
            })
    }

    fn write_block(&mut self, index: usize) -> Result<()> {
        let offset = index * CHUNK_SIZE;
        let chunk = self.image.block(index, CHUNK_SIZE);
        let frame = LeqiFrame::data(offset as u32, &chunk);
        let retry = self.retry;

        retry
            .attempt(|attempt| {
                trace!("block {index} attempt {attempt}");
                let ack = self.ack_exchange(&frame, LeqiCommand::Data)?;
                if ack.status() == Some(STATUS_OK) {
                    Ok(())
                } else {
                    Err(Error::ChunkRejected { block: index })
                }
            })
            .map_err(|e| {
                if e.is_retryable() {
                    Error::WriteFailed {
                        block: index,
                        attempts: retry.max_attempts,
                    }
                } else {
                    e
                }
            })?;

        if !self.chunk_delay.is_zero() {
            thread::sleep(self.chunk_delay);
        }
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        let retry = self.retry;
        let end = LeqiFrame::end();
        retry
            .attempt(|attempt| {
                debug!("end command, attempt {attempt}");
                let ack = self.ack_exchange(&end, LeqiCommand::End)?;
                if ack.status() == Some(STATUS_OK) {
                    Ok(())
                } else {
                    Err(Error::VerifyFailed(
                        "controller reported verification failure".into(),
                    ))
                }
            })
            .map_err(|e| {
                if e.is_retryable() {
                    Error::VerifyFailed(format!(
                        "no end acknowledgment after {} attempts",
                        retry.max_attempts
                    ))
                } else {
                    e
                }
            })
    }

    fn verify(&mut self) -> Result<()> {
        // The end acknowledgment's status byte already reported the
        // on-device verification result.
        debug!("Leqi verify: covered by the end acknowledgment");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_looks_like_brightway() {
        assert!(looks_like_brightway(b"0010\r"));
        assert!(looks_like_brightway(b"ok\r"));
        assert!(!looks_like_brightway(&[0x5A, 0x21, 0x01, 0x02, 0x01, 0xFF]));
    }
}
