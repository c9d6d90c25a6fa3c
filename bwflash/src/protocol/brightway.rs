//! Brightway DFU command protocol.
//!
//! The Brightway bootloader mixes three wire shapes:
//!
//! - text commands of the form `down <verb> [args]\r`, answered by short
//!   `ok`/`er` lines or `ok <16 bytes>\r` challenge responses,
//! - a binary UID query answered by a `0x64 ... 0x9B` framed UID,
//! - XMODEM-style chunk packets for the firmware payload:
//!
//! ```text
//! +-----+-----+------+----------------+--------+
//! | SOH | Seq | ~Seq |  Data (128)    | CRC16  |
//! +-----+-----+------+----------------+--------+
//! | 01  | 1   | 1    |      128       | 2 (BE) |
//! +-----+-----+------+----------------+--------+
//! ```
//!
//! Chunks are acknowledged byte-wise (ACK 0x06 / NAK 0x15); each
//! 0x800-byte NVM page takes 16 chunks followed by the `04 04 04`
//! end-of-page marker and a cumulative `wr_info` checkpoint.

use crate::protocol::checksum::{CRC16_XMODEM, crc16};

/// Binary UID query command.
pub const UID_QUERY: [u8; 4] = [0x53, 0x2A, 0x7D, 0xAC];

/// First byte of the framed UID response.
pub const UID_FRAME_START: u8 = 0x64;

/// Last byte of the framed UID response.
pub const UID_FRAME_END: u8 = 0x9B;

/// Chunk acknowledged.
pub const ACK: u8 = 0x06;

/// Chunk rejected (on-device CRC failure).
pub const NAK: u8 = 0x15;

/// Start-of-header byte opening every chunk packet.
pub const SOH: u8 = 0x01;

/// End-of-page marker sent after the last chunk of a page.
pub const EOT: [u8; 3] = [0x04, 0x04, 0x04];

/// Payload bytes per chunk packet.
pub const CHUNK_SIZE: usize = 0x80;

/// Bytes per NVM page (one write block).
pub const PACKET_SIZE: usize = 0x800;

/// Chunks per NVM page.
pub const CHUNKS_PER_PACKET: usize = PACKET_SIZE / CHUNK_SIZE;

/// Device UID length.
pub const UID_LEN: usize = 16;

/// Challenge/signature length.
pub const CHALLENGE_LEN: usize = 16;

/// `down get_ver` command line.
pub fn get_ver() -> Vec<u8> {
    b"down get_ver\r".to_vec()
}

/// `down rd_info` command line.
pub fn rd_info() -> Vec<u8> {
    b"down rd_info\r\x00\x00\x00".to_vec()
}

/// `down ble_rand` carrying the host-chosen challenge.
pub fn ble_rand(challenge: &[u8; CHALLENGE_LEN]) -> Vec<u8> {
    let mut cmd = b"down ble_rand ".to_vec();
    cmd.extend_from_slice(challenge);
    cmd.push(b'\r');
    cmd
}

/// `down mcu_rand` requesting the device-chosen challenge.
pub fn mcu_rand() -> Vec<u8> {
    b"down mcu_rand\r".to_vec()
}

/// `down mcu_key` carrying the host's signature over the device challenge.
pub fn mcu_key(signature: &[u8; CHALLENGE_LEN]) -> Vec<u8> {
    let mut cmd = b"down mcu_key ".to_vec();
    cmd.extend_from_slice(signature);
    cmd.push(b'\r');
    cmd
}

/// `down nvm_write` announcing the next page address.
pub fn nvm_write(addr: u32) -> Vec<u8> {
    format!("down nvm_write {addr:08X}\r").into_bytes()
}

/// `down wr_info` checkpoint: pages sent, cumulative CRC32, bytes sent.
pub fn wr_info(pages: usize, crc: u32, bytes: usize) -> Vec<u8> {
    format!("down wr_info {pages} {crc:08x} {bytes}\r").into_bytes()
}

/// `down dfu_verify` finalize query.
pub fn dfu_verify() -> Vec<u8> {
    b"down dfu_verify\r".to_vec()
}

/// `down dfu_active` activation command.
pub fn dfu_active() -> Vec<u8> {
    b"down dfu_active\r".to_vec()
}

/// Build one chunk packet.
///
/// `seq` is 1-based within the current page; the complement byte guards
/// against sequence corruption the same way the CRC guards the payload.
#[allow(clippy::cast_possible_truncation)]
pub fn chunk_packet(seq: u8, data: &[u8]) -> Vec<u8> {
    debug_assert_eq!(data.len(), CHUNK_SIZE);
    let mut packet = Vec::with_capacity(3 + CHUNK_SIZE + 2);
    packet.push(SOH);
    packet.push(seq);
    packet.push(0xFF - seq);
    packet.extend_from_slice(data);
    let crc = crc16(CRC16_XMODEM, data);
    packet.push((crc >> 8) as u8);
    packet.push((crc & 0xFF) as u8);
    packet
}

/// Parse a chunk packet, returning `(seq, data)` if it is well-formed.
pub fn parse_chunk_packet(packet: &[u8]) -> Option<(u8, &[u8])> {
    if packet.len() != 3 + CHUNK_SIZE + 2 || packet[0] != SOH {
        return None;
    }
    let seq = packet[1];
    if packet[2] != 0xFF - seq {
        return None;
    }
    let data = &packet[3..3 + CHUNK_SIZE];
    let crc = u16::from(packet[3 + CHUNK_SIZE]) << 8 | u16::from(packet[4 + CHUNK_SIZE]);
    if crc != crc16(CRC16_XMODEM, data) {
        return None;
    }
    Some((seq, data))
}

/// Build the framed UID response (device side).
pub fn uid_frame(uid: &[u8; UID_LEN]) -> Vec<u8> {
    let mut frame = vec![UID_FRAME_START, UID_QUERY[1], 0x10];
    frame.extend_from_slice(uid);
    frame.push(0x10);
    frame.push(UID_FRAME_END);
    frame
}

/// Extract the device UID from a framed response.
///
/// Scans for the `0x64 ... 0x9B` envelope, checks the echoed command
/// byte and length marker, and returns the 16-byte UID.
pub fn parse_uid_frame(data: &[u8]) -> Option<[u8; UID_LEN]> {
    let start = data.iter().position(|&b| b == UID_FRAME_START)?;
    let end = data.iter().position(|&b| b == UID_FRAME_END)?;
    if end <= start {
        return None;
    }
    let frame = &data[start..end];
    if frame.len() < 3 + UID_LEN || frame[1] != UID_QUERY[1] || frame[2] != 0x10 {
        return None;
    }
    let mut uid = [0u8; UID_LEN];
    uid.copy_from_slice(&frame[3..3 + UID_LEN]);
    Some(uid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_lines() {
        assert_eq!(get_ver(), b"down get_ver\r");
        assert_eq!(nvm_write(0x1800), b"down nvm_write 00001800\r");
        assert_eq!(
            wr_info(3, 0xDEADBEEF, 0x1800),
            b"down wr_info 3 deadbeef 6144\r"
        );
    }

    #[test]
    fn test_challenge_command_lengths() {
        // Fixed-length commands: verb + space + 16 raw bytes + CR.
        assert_eq!(ble_rand(&[0u8; 16]).len(), 14 + 16 + 1);
        assert_eq!(mcu_key(&[0u8; 16]).len(), 13 + 16 + 1);
    }

    #[test]
    fn test_chunk_packet_layout() {
        let data = [0xAB; CHUNK_SIZE];
        let packet = chunk_packet(5, &data);
        assert_eq!(packet.len(), 133);
        assert_eq!(packet[0], SOH);
        assert_eq!(packet[1], 5);
        assert_eq!(packet[2], 0xFA);
        // CRC verified against a captured device exchange
        assert_eq!(&packet[131..], &[0xF7, 0xF1]);
    }

    #[test]
    fn test_chunk_packet_roundtrip() {
        let data: Vec<u8> = (0..CHUNK_SIZE as u8).map(|i| i.wrapping_mul(3)).collect();
        let packet = chunk_packet(16, &data);
        let (seq, parsed) = parse_chunk_packet(&packet).unwrap();
        assert_eq!(seq, 16);
        assert_eq!(parsed, &data[..]);
    }

    #[test]
    fn test_chunk_packet_rejects_corruption() {
        let data = [0x42; CHUNK_SIZE];
        let good = chunk_packet(1, &data);

        let mut bad_crc = good.clone();
        bad_crc[50] ^= 0x01;
        assert!(parse_chunk_packet(&bad_crc).is_none());

        let mut bad_seq = good.clone();
        bad_seq[2] ^= 0x01;
        assert!(parse_chunk_packet(&bad_seq).is_none());

        assert!(parse_chunk_packet(&good[..100]).is_none());
    }

    #[test]
    fn test_uid_frame_roundtrip() {
        let uid = *b"foobarfoobar1337";
        let frame = uid_frame(&uid);
        assert_eq!(frame.len(), 21);
        assert_eq!(parse_uid_frame(&frame), Some(uid));

        // With leading noise, as read off a real port
        let mut noisy = vec![0x00, 0x11];
        noisy.extend_from_slice(&frame);
        assert_eq!(parse_uid_frame(&noisy), Some(uid));
    }

    #[test]
    fn test_parse_uid_frame_rejects_garbage() {
        assert_eq!(parse_uid_frame(&[]), None);
        assert_eq!(parse_uid_frame(b"ok\r"), None);
        assert_eq!(parse_uid_frame(&[UID_FRAME_START, 0x00, 0x10]), None);
    }
}
