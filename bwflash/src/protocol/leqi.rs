//! Leqi binary packet protocol.
//!
//! Leqi controllers speak a compact binary framing over UART:
//!
//! ```text
//! +----------+-----+-----+-----+------------+--------+
//! | Preamble | Dir | Cmd | Len |  Payload   | CRC16  |
//! +----------+-----+-----+-----+------------+--------+
//! |   0x5A   | 1   | 1   | 1   |  variable  | 2 (BE) |
//! +----------+-----+-----+-----+------------+--------+
//! ```
//!
//! Direction is 0x12 host->device and 0x21 device->host. The CRC16
//! (XMODEM parameters) covers every byte before the trailer. Firmware
//! payloads travel pre-encrypted with XOR 0xAA; the host never sees the
//! plaintext.

use byteorder::{BigEndian, ByteOrder, LittleEndian, WriteBytesExt};

use crate::error::{Error, Result};
use crate::protocol::checksum::{CRC16_XMODEM, crc16};

/// Frame preamble byte.
pub const PREAMBLE: u8 = 0x5A;

/// Direction marker: host to device.
pub const DIR_HOST: u8 = 0x12;

/// Direction marker: device to host.
pub const DIR_DEVICE: u8 = 0x21;

/// Data chunk size carried by one Data frame.
pub const CHUNK_SIZE: usize = 128;

/// Maximum payload representable by the one-byte length field.
pub const MAX_PAYLOAD: usize = 0xFF;

/// Bytes of framing around the payload: preamble + dir + cmd + len + crc.
pub const OVERHEAD: usize = 6;

/// Ack status byte for success.
pub const STATUS_OK: u8 = 0x01;

/// Model byte reported by Leqi-family bootloaders in the identify ack.
pub const MODEL_LEQI: u8 = 0x4C;

/// Version/flag byte carried in the start command.
pub const START_FLAG: u8 = 0x31;

/// Leqi command opcodes (frame command field).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LeqiCommand {
    /// Identity query (ack carries a model byte).
    Identify = 0x01,
    /// Begin update; carries the firmware size. The controller erases
    /// the target region when it acknowledges this command.
    Start = 0x03,
    /// One 128-byte firmware chunk at an absolute offset.
    Data = 0x04,
    /// Transfer complete; triggers on-device verification.
    End = 0x05,
}

impl LeqiCommand {
    /// Parse a command opcode.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Identify),
            0x03 => Some(Self::Start),
            0x04 => Some(Self::Data),
            0x05 => Some(Self::End),
            _ => None,
        }
    }
}

/// One Leqi protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeqiFrame {
    /// Direction marker (0x12 or 0x21).
    pub direction: u8,
    /// Command opcode.
    pub command: LeqiCommand,
    /// Raw payload bytes.
    pub payload: Vec<u8>,
}

impl LeqiFrame {
    /// Create a host->device frame.
    pub fn new(command: LeqiCommand, payload: Vec<u8>) -> Self {
        Self {
            direction: DIR_HOST,
            command,
            payload,
        }
    }

    /// Build an identify frame.
    pub fn identify() -> Self {
        Self::new(LeqiCommand::Identify, Vec::new())
    }

    /// Build a start frame announcing `fw_size` payload bytes.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn start(fw_size: u16) -> Self {
        let mut payload = vec![START_FLAG, 0x00];
        payload.write_u16::<LittleEndian>(fw_size).unwrap();
        payload.extend_from_slice(&[0x00, 0x00]);
        Self::new(LeqiCommand::Start, payload)
    }

    /// Build a data frame carrying `chunk` at absolute `offset`.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn data(offset: u32, chunk: &[u8]) -> Self {
        debug_assert_eq!(chunk.len(), CHUNK_SIZE);
        let mut payload = Vec::with_capacity(4 + chunk.len());
        payload.write_u32::<LittleEndian>(offset).unwrap();
        payload.extend_from_slice(chunk);
        Self::new(LeqiCommand::Data, payload)
    }

    /// Build an end frame.
    pub fn end() -> Self {
        Self::new(LeqiCommand::End, Vec::new())
    }

    /// Build a device->host acknowledgment frame.
    pub fn ack(command: LeqiCommand, payload: Vec<u8>) -> Self {
        Self {
            direction: DIR_DEVICE,
            command,
            payload,
        }
    }

    /// Serialize to wire bytes.
    #[allow(clippy::cast_possible_truncation)]
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.payload.len() > MAX_PAYLOAD {
            return Err(Error::FrameTooLarge {
                len: self.payload.len(),
                max: MAX_PAYLOAD,
            });
        }

        let mut buf = Vec::with_capacity(OVERHEAD + self.payload.len());
        buf.push(PREAMBLE);
        buf.push(self.direction);
        buf.push(self.command as u8);
        buf.push(self.payload.len() as u8); // checked above
        buf.extend_from_slice(&self.payload);

        let crc = crc16(CRC16_XMODEM, &buf);
        buf.push((crc >> 8) as u8);
        buf.push((crc & 0xFF) as u8);
        Ok(buf)
    }

    /// Total wire length of a frame whose length field is `len`.
    pub fn wire_len(len: u8) -> usize {
        OVERHEAD + len as usize
    }

    /// Parse a frame from wire bytes.
    ///
    /// Truncated or malformed input fails with [`Error::Framing`], a bad
    /// trailer with [`Error::ChecksumMismatch`]; callers treat both like
    /// a timeout and retry the exchange.
    pub fn decode(data: &[u8]) -> Result<Self> {
        // Scan past line noise for the preamble.
        let start = data
            .iter()
            .position(|&b| b == PREAMBLE)
            .ok_or_else(|| Error::Framing("no frame preamble".into()))?;
        let frame = &data[start..];

        if frame.len() < OVERHEAD {
            return Err(Error::Framing(format!(
                "frame truncated at {} bytes",
                frame.len()
            )));
        }

        let direction = frame[1];
        if direction != DIR_HOST && direction != DIR_DEVICE {
            return Err(Error::Framing(format!(
                "invalid direction byte {direction:#04X}"
            )));
        }

        let len = frame[3] as usize;
        let total = OVERHEAD + len;
        if frame.len() < total {
            return Err(Error::Framing(format!(
                "declared {len}-byte payload, only {} bytes on the wire",
                frame.len().saturating_sub(OVERHEAD)
            )));
        }

        let expected = BigEndian::read_u16(&frame[total - 2..total]);
        let actual = crc16(CRC16_XMODEM, &frame[..total - 2]);
        if expected != actual {
            return Err(Error::ChecksumMismatch { expected, actual });
        }

        let command = LeqiCommand::from_u8(frame[2])
            .ok_or_else(|| Error::Framing(format!("unknown command {:#04X}", frame[2])))?;

        Ok(Self {
            direction,
            command,
            payload: frame[4..4 + len].to_vec(),
        })
    }

    /// Ack status byte, if this frame is a device acknowledgment.
    pub fn status(&self) -> Option<u8> {
        if self.direction == DIR_DEVICE {
            self.payload.first().copied()
        } else {
            None
        }
    }
}
