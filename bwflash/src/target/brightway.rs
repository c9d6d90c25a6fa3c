//! Brightway flasher implementation.
//!
//! Lifecycle mapping for the Brightway DFU:
//!
//! - identify: binary UID query + `get_ver`
//! - handshake: `rd_info`, then mutual challenge/response — the device
//!   proves it knows the signing tables (BLE challenge), the host
//!   proves it holds matching firmware (MCU challenge)
//! - erase: announce the first NVM page (`nvm_write 00000000`); the
//!   device erases the page on the announce, which is its point of no
//!   return
//! - write_block: per-page announce + 16 CRC-checked 128-byte chunks +
//!   end-of-page marker + cumulative `wr_info` checkpoint
//! - finalize: `dfu_verify` query, retried on a lost ack without
//!   resending any payload
//! - verify: `dfu_active` + closing `get_ver`

use log::{debug, info, trace};

use crate::error::{Error, Result};
use crate::firmware::{FirmwareImage, FirmwareKind, SigningTables};
use crate::protocol::auth::sign_challenge;
use crate::protocol::brightway::{
    ACK, CHALLENGE_LEN, CHUNK_SIZE, CHUNKS_PER_PACKET, EOT, NAK, PACKET_SIZE, UID_FRAME_END,
    UID_LEN, UID_QUERY, ble_rand, chunk_packet, dfu_active, dfu_verify, get_ver, mcu_key, mcu_rand,
    nvm_write, parse_uid_frame, rd_info, wr_info,
};
use crate::protocol::checksum::crc32;
use crate::protocol::leqi::PREAMBLE as LEQI_PREAMBLE;
use crate::retry::RetryPolicy;
use crate::session::{DeviceIdentity, FlasherOps};
use crate::transport::{Transport, read_ack_byte, read_exact, read_until};

/// Longest plain-text reply the bootloader produces.
const MAX_LINE: usize = 64;

/// `ok <16 bytes>\r` challenge reply length.
const CHALLENGE_REPLY_LEN: usize = 3 + CHALLENGE_LEN + 1;

/// Whether a text reply signals success (`ok\r`, `ok ...`, trailing `k\r`).
fn is_ok_line(resp: &[u8]) -> bool {
    resp.starts_with(b"ok") || resp.windows(2).any(|w| w == b"k\r")
}

/// Whether a text reply is an explicit device-side rejection (`er\r`).
fn is_error_line(resp: &[u8]) -> bool {
    resp.windows(2).any(|w| w == b"r\r")
}

/// Brightway flasher, generic over the transport.
pub struct BrightwayFlasher<'a, T: Transport> {
    transport: T,
    image: &'a FirmwareImage,
    tables: SigningTables,
    retry: RetryPolicy,
    uid: Option<[u8; UID_LEN]>,
    /// Host-chosen BLE challenge; fixed so sessions are reproducible.
    ble_challenge: [u8; CHALLENGE_LEN],
    /// Page already announced via `nvm_write` (skipped in write_block).
    announced: Option<usize>,
    /// Cumulative padded payload, for the `wr_info` running CRC32.
    sent: Vec<u8>,
    pages_sent: usize,
}

impl<'a, T: Transport> BrightwayFlasher<'a, T> {
    /// Create a flasher over an owned transport.
    pub fn new(transport: T, image: &'a FirmwareImage, retry: RetryPolicy) -> Result<Self> {
        let tables = image.signing_tables()?;
        Ok(Self {
            transport,
            image,
            tables,
            retry,
            uid: None,
            ble_challenge: std::array::from_fn(|i| (i + 1) as u8),
            announced: None,
            sent: Vec::with_capacity(image.data().len()),
            pages_sent: 0,
        })
    }

    fn send(&mut self, cmd: &[u8]) -> Result<()> {
        trace!("tx {} bytes", cmd.len());
        self.transport.clear_input()?;
        self.transport.write_all(cmd)?;
        self.transport.flush()?;
        Ok(())
    }

    /// Send a text command and read the CR-terminated reply.
    fn text_exchange(&mut self, cmd: &[u8]) -> Result<Vec<u8>> {
        self.send(cmd)?;
        read_until(&mut self.transport, b'\r', MAX_LINE, self.retry.timeout)
    }

    /// Send a command whose reply embeds raw bytes (fixed length).
    fn fixed_exchange(&mut self, cmd: &[u8], len: usize) -> Result<Vec<u8>> {
        self.send(cmd)?;
        read_exact(&mut self.transport, len, self.retry.timeout)
    }

    /// Extract the 16 raw bytes from an `ok <bytes>\r` reply.
    fn challenge_reply(resp: &[u8]) -> Result<[u8; CHALLENGE_LEN]> {
        if resp.len() != CHALLENGE_REPLY_LEN || !resp.starts_with(b"ok ") {
            return Err(Error::Framing("malformed challenge reply".into()));
        }
        resp[3..3 + CHALLENGE_LEN]
            .try_into()
            .map_err(|_| Error::Framing("malformed challenge reply".into()))
    }

    /// Announce the NVM page at `page * PACKET_SIZE`.
    ///
    /// The device erases the page when it acknowledges.
    fn announce(&mut self, page: usize) -> Result<()> {
        let addr = (page * PACKET_SIZE) as u32;
        debug!("announcing page {page} at 0x{addr:08X}");
        let retry = self.retry;
        retry.attempt(|_| {
            let resp = self.text_exchange(&nvm_write(addr))?;
            if is_ok_line(&resp) {
                Ok(())
            } else {
                Err(Error::Framing(format!(
                    "unexpected nvm_write reply: {resp:02X?}"
                )))
            }
        })?;
        self.announced = Some(page);
        Ok(())
    }

    fn send_chunk(&mut self, block: usize, seq: u8, chunk: &[u8]) -> Result<()> {
        let packet = chunk_packet(seq, chunk);
        let retry = self.retry;
        retry.attempt(|attempt| {
            trace!("block {block} chunk {seq} attempt {attempt}");
            self.transport.clear_input()?;
            self.transport.write_all(&packet)?;
            self.transport.flush()?;
            match read_ack_byte(&mut self.transport, self.retry.timeout)? {
                ACK => Ok(()),
                NAK => Err(Error::ChunkRejected { block }),
                other => Err(Error::Framing(format!("unexpected ack byte {other:#04X}"))),
            }
        })
    }

    /// Cumulative checkpoint after each page.
    fn checkpoint(&mut self) -> Result<()> {
        let crc = crc32(&self.sent);
        let cmd = wr_info(self.pages_sent, crc, self.pages_sent * PACKET_SIZE);
        let retry = self.retry;
        retry.attempt(|_| {
            let resp = self.text_exchange(&cmd)?;
            if is_ok_line(&resp) {
                Ok(())
            } else {
                Err(Error::Framing(format!(
                    "unexpected wr_info reply: {resp:02X?}"
                )))
            }
        })
    }

    fn write_failed(&self, block: usize, error: Error) -> Error {
        if error.is_retryable() {
            Error::WriteFailed {
                block,
                attempts: self.retry.max_attempts,
            }
        } else {
            error
        }
    }
}

impl<T: Transport> FlasherOps for BrightwayFlasher<'_, T> {
    fn kind(&self) -> FirmwareKind {
        FirmwareKind::Brightway
    }

    fn block_count(&self) -> usize {
        self.image.block_count(PACKET_SIZE)
    }

    fn identify(&mut self) -> Result<DeviceIdentity> {
        let retry = self.retry;

        let uid = retry
            .attempt(|_| {
                self.send(&UID_QUERY)?;
                let resp = read_until(&mut self.transport, UID_FRAME_END, MAX_LINE, retry.timeout)?;
                if resp.first() == Some(&LEQI_PREAMBLE) {
                    return Err(Error::DeviceMismatch {
                        image: FirmwareKind::Brightway,
                        device: FirmwareKind::Leqi,
                    });
                }
                parse_uid_frame(&resp)
                    .ok_or_else(|| Error::Framing(format!("malformed UID frame: {resp:02X?}")))
            })
            .map_err(|e| if e.is_retryable() { Error::DeviceNotFound } else { e })?;
        self.uid = Some(uid);
        info!("device UID: {}", String::from_utf8_lossy(&uid));

        let version = retry
            .attempt(|_| {
                let resp = self.text_exchange(&get_ver())?;
                if resp.last() == Some(&b'\r') {
                    Ok(String::from_utf8_lossy(&resp[..resp.len() - 1]).into_owned())
                } else {
                    Err(Error::Framing("incomplete version reply".into()))
                }
            })
            .map_err(|e| if e.is_retryable() { Error::DeviceNotFound } else { e })?;
        info!("MCU version (before): {version}");

        Ok(DeviceIdentity {
            kind: FirmwareKind::Brightway,
            uid: Some(uid),
            version: Some(version),
        })
    }

    fn handshake(&mut self) -> Result<()> {
        let uid = self
            .uid
            .ok_or_else(|| Error::Protocol("handshake before identify".into()))?;
        let retry = self.retry;

        retry
            .attempt(|_| {
                let resp = self.text_exchange(&rd_info())?;
                if resp.starts_with(b"ok") {
                    Ok(())
                } else {
                    Err(Error::Framing(format!("unexpected rd_info reply: {resp:02X?}")))
                }
            })
            .map_err(|e| {
                if e.is_retryable() {
                    Error::HandshakeFailed("no rd_info acknowledgment".into())
                } else {
                    e
                }
            })?;

        // BLE challenge: the device signs our challenge; a mismatch means
        // the device UID and the image tables do not belong together.
        let expected = sign_challenge(&uid, &self.ble_challenge, &self.tables);
        let ble_cmd = ble_rand(&self.ble_challenge);
        let device_sig = retry
            .attempt(|_| {
                let resp = self.fixed_exchange(&ble_cmd, CHALLENGE_REPLY_LEN)?;
                Self::challenge_reply(&resp)
            })
            .map_err(|e| {
                if e.is_retryable() {
                    Error::HandshakeFailed("no BLE challenge reply".into())
                } else {
                    e
                }
            })?;
        if device_sig != expected {
            return Err(Error::AuthFailed(
                "device key does not match this firmware (wrong UID or image)".into(),
            ));
        }
        debug!("BLE key verified");

        // MCU challenge: the device challenges us; sign with the same tables.
        let mcu_challenge = retry
            .attempt(|_| {
                let resp = self.fixed_exchange(&mcu_rand(), CHALLENGE_REPLY_LEN)?;
                Self::challenge_reply(&resp)
            })
            .map_err(|e| {
                if e.is_retryable() {
                    Error::HandshakeFailed("no MCU challenge".into())
                } else {
                    e
                }
            })?;

        let signature = sign_challenge(&uid, &mcu_challenge, &self.tables);
        let key_cmd = mcu_key(&signature);
        retry
            .attempt(|_| {
                let resp = self.text_exchange(&key_cmd)?;
                if resp == b"ok\r" {
                    Ok(())
                } else if is_error_line(&resp) {
                    Err(Error::AuthFailed("device rejected the MCU key".into()))
                } else {
                    Err(Error::Framing(format!("unexpected mcu_key reply: {resp:02X?}")))
                }
            })
            .map_err(|e| {
                if e.is_retryable() {
                    Error::HandshakeFailed("no mcu_key acknowledgment".into())
                } else {
                    e
                }
            })?;
        debug!("MCU key accepted");
        Ok(())
    }

    fn erase(&mut self) -> Result<()> {
        self.announce(0).map_err(|e| {
            if e.is_retryable() {
                Error::EraseFailed {
                    attempts: self.retry.max_attempts,
                }
            } else {
                e
            }
        })
    }

    fn write_block(&mut self, index: usize) -> Result<()> {
        if self.announced != Some(index) {
            self.announce(index).map_err(|e| self.write_failed(index, e))?;
        }

        let page = self.image.block(index, PACKET_SIZE);
        for n in 0..CHUNKS_PER_PACKET {
            let chunk = page[n * CHUNK_SIZE..(n + 1) * CHUNK_SIZE].to_vec();
            self.send_chunk(index, (n + 1) as u8, &chunk)
                .map_err(|e| self.write_failed(index, e))?;
        }

        // End-of-page marker; the confirmation is best-effort on real
        // hardware.
        self.transport.write_all(&EOT)?;
        self.transport.flush()?;
        let _ = read_ack_byte(&mut self.transport, self.retry.timeout);

        self.pages_sent += 1;
        self.sent.extend_from_slice(&page);
        self.checkpoint().map_err(|e| self.write_failed(index, e))?;
        self.announced = None;
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        let retry = self.retry;
        retry
            .attempt(|attempt| {
                debug!("finalize query, attempt {attempt}");
                let resp = self.text_exchange(&dfu_verify())?;
                if is_ok_line(&resp) {
                    Ok(())
                } else if is_error_line(&resp) {
                    Err(Error::VerifyFailed(
                        "device rejected the transferred image".into(),
                    ))
                } else {
                    Err(Error::Framing(format!("unexpected dfu_verify reply: {resp:02X?}")))
                }
            })
            .map_err(|e| {
                if e.is_retryable() {
                    Error::VerifyFailed(format!(
                        "no finalize acknowledgment after {} attempts",
                        retry.max_attempts
                    ))
                } else {
                    e
                }
            })
    }

    fn verify(&mut self) -> Result<()> {
        let retry = self.retry;
        retry
            .attempt(|_| {
                let resp = self.text_exchange(&dfu_active())?;
                if is_ok_line(&resp) {
                    Ok(())
                } else if is_error_line(&resp) {
                    Err(Error::VerifyFailed("device refused activation".into()))
                } else {
                    Err(Error::Framing(format!("unexpected dfu_active reply: {resp:02X?}")))
                }
            })
            .map_err(|e| {
                if e.is_retryable() {
                    Error::VerifyFailed(format!(
                        "no activation acknowledgment after {} attempts",
                        retry.max_attempts
                    ))
                } else {
                    e
                }
            })?;

        // Closing version read is informational only.
        match retry.attempt(|_| self.text_exchange(&get_ver())) {
            Ok(resp) => info!(
                "MCU version (after): {}",
                String::from_utf8_lossy(&resp).trim_end_matches('\r')
            ),
            Err(e) => debug!("no closing version reply: {e}"),
        }
        Ok(())
    }
}
