//! In-process simulated device.
//!
//! [`SimulatedDevice`] implements the same [`Transport`] contract as the
//! serial adapter but is driven by an internal fake-device responder: it
//! parses every frame the host writes, validates checksums and
//! challenge signatures exactly like the hardware, records what was
//! written, and queues protocol-correct responses for the next read.
//!
//! Fault injection is configuration, not a separate code path: a
//! [`FaultPlan`] makes the responder drop specific acknowledgments,
//! corrupt trailers or stay silent, so the retry logic can be exercised
//! deterministically without hardware.

use std::collections::{HashMap, VecDeque};
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, trace};

use crate::error::{Error, Result};
use crate::firmware::{FirmwareImage, FirmwareKind, PAD_BYTE, SigningTables};
use crate::protocol::auth::sign_challenge;
use crate::protocol::brightway::{
    self, ACK, CHUNK_SIZE as BW_CHUNK, EOT, NAK, PACKET_SIZE, SOH, UID_QUERY,
};
use crate::protocol::checksum::{LEQI_XOR_KEY, crc32, xor_transform};
use crate::protocol::leqi::{self, LeqiCommand, LeqiFrame};
use crate::transport::Transport;

/// UID the simulated device reports.
pub const SIM_UID: [u8; 16] = *b"foobarfoobar1337";

/// Version banner the simulated Brightway bootloader reports.
pub const SIM_VERSION: &[u8] = b"0010\r";

/// Deterministic fault injection configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct FaultPlan {
    /// Never respond to anything.
    pub silent: bool,
    /// Swallow the first N finalize acknowledgments (the transfer-end
    /// query), simulating a delayed/lost ack after the device completed.
    pub drop_finalize_acks: u32,
    /// Swallow every acknowledgment for data sent to this block index.
    pub drop_data_acks_at: Option<usize>,
    /// Corrupt the trailer of every queued response.
    pub corrupt_responses: bool,
}

/// Counters and captures for post-session assertions.
#[derive(Debug, Default)]
struct SimStats {
    erase_seen: bool,
    data_frames: HashMap<usize, usize>,
    finalize_queries: usize,
}

struct SimInner {
    persona: FirmwareKind,
    tables: Option<SigningTables>,
    expected: Vec<u8>,
    mcu_challenge: [u8; 16],
    faults: FaultPlan,
    finalize_drops_left: u32,
    rx: Vec<u8>,
    tx: VecDeque<u8>,
    /// Bytes written by the host, keyed positionally (resend-safe).
    received: Vec<u8>,
    /// Brightway page currently announced via `nvm_write`.
    page_addr: Option<u32>,
    stats: SimStats,
}

/// Software fake device speaking one of the two controller protocols.
pub struct SimulatedDevice {
    inner: Arc<Mutex<SimInner>>,
    name: String,
    timeout: Duration,
}

/// Shared handle for inspecting a [`SimulatedDevice`] after the flasher
/// has consumed it.
#[derive(Clone)]
pub struct SimProbe {
    inner: Arc<Mutex<SimInner>>,
}

impl SimulatedDevice {
    /// Create a simulated device with the given persona.
    ///
    /// The device owns a copy of `image` so it can verify challenge
    /// signatures and the final transfer exactly like real hardware.
    pub fn new(persona: FirmwareKind, image: &FirmwareImage) -> Result<Self> {
        if persona == FirmwareKind::Unknown {
            return Err(Error::Protocol("simulator needs a concrete persona".into()));
        }

        let expected = expected_transfer(persona, image);
        let inner = SimInner {
            persona,
            tables: image.signing_tables().ok(),
            expected,
            mcu_challenge: std::array::from_fn(|i| (i as u8).wrapping_mul(17).wrapping_add(7)),
            faults: FaultPlan::default(),
            finalize_drops_left: 0,
            rx: Vec::new(),
            tx: VecDeque::new(),
            received: Vec::new(),
            page_addr: None,
            stats: SimStats::default(),
        };

        Ok(Self {
            inner: Arc::new(Mutex::new(inner)),
            name: format!("sim:{persona}"),
            timeout: Duration::ZERO,
        })
    }

    /// Apply a fault plan.
    #[must_use]
    pub fn with_faults(self, faults: FaultPlan) -> Self {
        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.finalize_drops_left = faults.drop_finalize_acks;
            inner.faults = faults;
        }
        self
    }

    /// Handle for inspecting device state after the session.
    pub fn probe(&self) -> SimProbe {
        SimProbe {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl SimProbe {
    fn lock(&self) -> std::sync::MutexGuard<'_, SimInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether the device received an erase/start command.
    pub fn erase_seen(&self) -> bool {
        self.lock().stats.erase_seen
    }

    /// Number of data frames received for `block`.
    pub fn data_frames_for_block(&self, block: usize) -> usize {
        self.lock().stats.data_frames.get(&block).copied().unwrap_or(0)
    }

    /// Total number of data frames received.
    pub fn total_data_frames(&self) -> usize {
        self.lock().stats.data_frames.values().sum()
    }

    /// Number of finalize queries received.
    pub fn finalize_queries(&self) -> usize {
        self.lock().stats.finalize_queries
    }

    /// Whether the received bytes reconstruct the expected transfer.
    pub fn transfer_complete(&self) -> bool {
        let inner = self.lock();
        inner.received == inner.expected
    }
}

/// The byte sequence the device ends up holding for this image.
///
/// A Leqi controller decrypts every chunk as it lands, so its flash
/// contents are the XOR-0xAA plaintext of the wire payload.
fn expected_transfer(persona: FirmwareKind, image: &FirmwareImage) -> Vec<u8> {
    let block_size = match persona {
        FirmwareKind::Brightway => PACKET_SIZE,
        _ => leqi::CHUNK_SIZE,
    };
    let total = match persona {
        FirmwareKind::Brightway => image.data().len().div_ceil(block_size) * block_size,
        _ => image.declared_size(),
    };
    let mut expected = image.data()[..image.data().len().min(total)].to_vec();
    expected.resize(total, PAD_BYTE);
    if persona == FirmwareKind::Leqi {
        xor_transform(&mut expected, LEQI_XOR_KEY);
    }
    expected
}

impl SimInner {
    fn respond(&mut self, bytes: &[u8]) {
        if self.faults.silent {
            trace!("sim: suppressing {}-byte response", bytes.len());
            return;
        }
        let mut bytes = bytes.to_vec();
        if self.faults.corrupt_responses {
            if let Some(last) = bytes.last_mut() {
                *last ^= 0x01;
            }
        }
        self.tx.extend(bytes);
    }

    fn store(&mut self, offset: usize, data: &[u8]) {
        let end = offset + data.len();
        if self.received.len() < end {
            self.received.resize(end, 0);
        }
        self.received[offset..end].copy_from_slice(data);
    }

    /// Consume as many complete host messages from `rx` as possible.
    fn pump(&mut self) {
        loop {
            // rd_info trails NUL padding; discard it between messages.
            while self.rx.first() == Some(&0x00) {
                self.rx.remove(0);
            }
            if self.rx.is_empty() {
                return;
            }
            let consumed = match self.persona {
                FirmwareKind::Brightway => self.pump_brightway(),
                _ => self.pump_leqi(),
            };
            if consumed == 0 {
                return;
            }
            self.rx.drain(..consumed);
        }
    }

    // ---- Brightway persona -------------------------------------------

    /// Try to consume one Brightway host message; returns bytes consumed
    /// (0 = incomplete, wait for more).
    fn pump_brightway(&mut self) -> usize {
        match self.rx[0] {
            b if b == UID_QUERY[0] => {
                if self.rx.len() < 4 {
                    return 0;
                }
                if self.rx[..4] == UID_QUERY {
                    debug!("sim(bw): UID query");
                    self.respond(&brightway::uid_frame(&SIM_UID));
                    4
                } else {
                    1 // resync
                }
            }
            SOH => {
                let total = 3 + BW_CHUNK + 2;
                if self.rx.len() < total {
                    return 0;
                }
                let packet = self.rx[..total].to_vec();
                self.handle_chunk(&packet);
                total
            }
            0x04 => {
                if self.rx.len() < EOT.len() {
                    return 0;
                }
                trace!("sim(bw): end of page");
                self.respond(&[ACK]);
                EOT.len()
            }
            leqi::PREAMBLE => {
                // A Leqi frame aimed at a Brightway device: answer with
                // the version banner so the host can tell who we are.
                let Some(total) = complete_leqi_frame(&self.rx) else {
                    return 0;
                };
                debug!("sim(bw): foreign frame, identifying as Brightway");
                self.respond(SIM_VERSION);
                total
            }
            b'd' => self.pump_brightway_text(),
            _ => 1, // resync
        }
    }

    fn pump_brightway_text(&mut self) -> usize {
        // Challenge commands embed 16 raw bytes that may contain CR, so
        // they are parsed at fixed length instead of line-wise.
        const BLE_RAND: &[u8] = b"down ble_rand ";
        const MCU_KEY: &[u8] = b"down mcu_key ";

        if self.rx.starts_with(BLE_RAND) || (BLE_RAND.starts_with(&self.rx)) {
            let total = BLE_RAND.len() + 16 + 1;
            if self.rx.starts_with(BLE_RAND) {
                if self.rx.len() < total {
                    return 0;
                }
                let challenge: [u8; 16] =
                    self.rx[BLE_RAND.len()..BLE_RAND.len() + 16].try_into().unwrap_or_default();
                self.handle_ble_rand(&challenge);
                return total;
            }
        }
        if self.rx.starts_with(MCU_KEY) {
            let total = MCU_KEY.len() + 16 + 1;
            if self.rx.len() < total {
                return 0;
            }
            let signature: [u8; 16] =
                self.rx[MCU_KEY.len()..MCU_KEY.len() + 16].try_into().unwrap_or_default();
            self.handle_mcu_key(&signature);
            return total;
        }

        let Some(cr) = self.rx.iter().position(|&b| b == b'\r') else {
            return 0;
        };
        let line = self.rx[..cr].to_vec();
        self.handle_text_line(&line);
        cr + 1
    }

    fn handle_text_line(&mut self, line: &[u8]) {
        let text = String::from_utf8_lossy(line);
        trace!("sim(bw): command {text:?}");
        if text.starts_with("down get_ver") {
            self.respond(SIM_VERSION);
        } else if text.starts_with("down rd_info") {
            self.respond(b"ok\r");
        } else if text.starts_with("down mcu_rand") {
            let mut resp = b"ok ".to_vec();
            resp.extend_from_slice(&self.mcu_challenge);
            resp.push(b'\r');
            self.respond(&resp);
        } else if let Some(addr) = text.strip_prefix("down nvm_write ") {
            let addr = u32::from_str_radix(addr.trim(), 16).unwrap_or(u32::MAX);
            debug!("sim(bw): page announce 0x{addr:08X}");
            self.page_addr = Some(addr);
            self.stats.erase_seen = true;
            self.respond(b"ok\r");
        } else if let Some(rest) = text.strip_prefix("down wr_info ") {
            self.handle_wr_info(rest);
        } else if text.starts_with("down dfu_verify") {
            self.handle_finalize_query();
        } else if text.starts_with("down dfu_active") {
            self.respond(b"ok\r");
        } else {
            self.respond(b"er\r");
        }
    }

    fn handle_ble_rand(&mut self, challenge: &[u8; 16]) {
        debug!("sim(bw): BLE challenge");
        let Some(tables) = &self.tables else {
            self.respond(b"er\r");
            return;
        };
        let signature = sign_challenge(&SIM_UID, challenge, tables);
        let mut resp = b"ok ".to_vec();
        resp.extend_from_slice(&signature);
        resp.push(b'\r');
        self.respond(&resp);
    }

    fn handle_mcu_key(&mut self, signature: &[u8; 16]) {
        let valid = self
            .tables
            .as_ref()
            .is_some_and(|t| sign_challenge(&SIM_UID, &self.mcu_challenge, t) == *signature);
        debug!("sim(bw): MCU key {}", if valid { "accepted" } else { "rejected" });
        self.respond(if valid { b"ok\r" } else { b"er\r" });
    }

    fn handle_chunk(&mut self, packet: &[u8]) {
        let Some(addr) = self.page_addr else {
            self.respond(&[NAK]);
            return;
        };
        let block = addr as usize / PACKET_SIZE;
        *self.stats.data_frames.entry(block).or_insert(0) += 1;

        match brightway::parse_chunk_packet(packet) {
            Some((seq, data)) if (1..=16).contains(&seq) => {
                let offset = addr as usize + (seq as usize - 1) * BW_CHUNK;
                self.store(offset, data);
                if self.faults.drop_data_acks_at == Some(block) {
                    trace!("sim(bw): dropping ack for block {block}");
                    return;
                }
                self.respond(&[ACK]);
            }
            _ => self.respond(&[NAK]),
        }
    }

    fn handle_wr_info(&mut self, rest: &str) {
        let fields: Vec<&str> = rest.split_whitespace().collect();
        let parsed = match fields.as_slice() {
            [pages, crc, bytes] => {
                let pages = pages.parse::<usize>().ok();
                let crc = u32::from_str_radix(crc, 16).ok();
                let bytes = bytes.parse::<usize>().ok();
                pages.zip(crc).zip(bytes)
            }
            _ => None,
        };
        let Some(((_pages, crc), bytes)) = parsed else {
            self.respond(b"er\r");
            return;
        };
        let ok = self.received.len() >= bytes && crc32(&self.received[..bytes]) == crc;
        debug!("sim(bw): wr_info over {bytes} bytes {}", if ok { "ok" } else { "mismatch" });
        self.respond(if ok { b"ok\r" } else { b"er\r" });
    }

    fn handle_finalize_query(&mut self) {
        self.stats.finalize_queries += 1;
        if self.finalize_drops_left > 0 {
            self.finalize_drops_left -= 1;
            debug!("sim(bw): dropping finalize ack");
            return;
        }
        let ok = self.received == self.expected;
        debug!("sim(bw): verify {}", if ok { "ok" } else { "failed" });
        self.respond(if ok { b"ok\r" } else { b"er\r" });
    }

    // ---- Leqi persona ------------------------------------------------

    fn pump_leqi(&mut self) -> usize {
        if self.rx[0] != leqi::PREAMBLE {
            // Brightway traffic aimed at a Leqi device: identify ourselves.
            debug!("sim(leqi): foreign traffic, identifying as Leqi");
            let ack = LeqiFrame::ack(LeqiCommand::Identify, vec![leqi::STATUS_OK, leqi::MODEL_LEQI]);
            if let Ok(bytes) = ack.encode() {
                self.respond(&bytes);
            }
            return self.rx.len();
        }

        let Some(total) = complete_leqi_frame(&self.rx) else {
            return 0;
        };
        let frame_bytes = self.rx[..total].to_vec();
        match LeqiFrame::decode(&frame_bytes) {
            Ok(frame) => self.handle_leqi_frame(&frame),
            Err(_) => {
                // Corrupt frame: a real controller stays silent and lets
                // the host time out and resend.
                debug!("sim(leqi): dropping corrupt frame");
            }
        }
        total
    }

    fn handle_leqi_frame(&mut self, frame: &LeqiFrame) {
        match frame.command {
            LeqiCommand::Identify => {
                debug!("sim(leqi): identify");
                let ack =
                    LeqiFrame::ack(LeqiCommand::Identify, vec![leqi::STATUS_OK, leqi::MODEL_LEQI]);
                self.respond_frame(&ack);
            }
            LeqiCommand::Start => {
                debug!("sim(leqi): start, erasing");
                self.stats.erase_seen = true;
                self.respond_frame(&LeqiFrame::ack(LeqiCommand::Start, vec![leqi::STATUS_OK]));
            }
            LeqiCommand::Data => {
                if frame.payload.len() != 4 + leqi::CHUNK_SIZE {
                    self.respond_frame(&LeqiFrame::ack(LeqiCommand::Data, vec![0x00]));
                    return;
                }
                let offset = u32::from_le_bytes(frame.payload[..4].try_into().unwrap_or_default());
                let block = offset as usize / leqi::CHUNK_SIZE;
                *self.stats.data_frames.entry(block).or_insert(0) += 1;
                // Decrypt on landing, exactly like the controller.
                let mut chunk = frame.payload[4..].to_vec();
                xor_transform(&mut chunk, LEQI_XOR_KEY);
                self.store(offset as usize, &chunk);
                if self.faults.drop_data_acks_at == Some(block) {
                    trace!("sim(leqi): dropping ack for block {block}");
                    return;
                }
                self.respond_frame(&LeqiFrame::ack(LeqiCommand::Data, vec![leqi::STATUS_OK]));
            }
            LeqiCommand::End => {
                self.stats.finalize_queries += 1;
                if self.finalize_drops_left > 0 {
                    self.finalize_drops_left -= 1;
                    debug!("sim(leqi): dropping end ack");
                    return;
                }
                let ok = self.received == self.expected;
                debug!("sim(leqi): verify {}", if ok { "ok" } else { "failed" });
                let status = if ok { leqi::STATUS_OK } else { 0x00 };
                self.respond_frame(&LeqiFrame::ack(LeqiCommand::End, vec![status]));
            }
        }
    }

    fn respond_frame(&mut self, frame: &LeqiFrame) {
        if let Ok(bytes) = frame.encode() {
            self.respond(&bytes);
        }
    }
}

/// Length of the complete Leqi frame at the front of `buf`, if present.
fn complete_leqi_frame(buf: &[u8]) -> Option<usize> {
    if buf.len() < 4 {
        return None;
    }
    let total = LeqiFrame::wire_len(buf[3]);
    (buf.len() >= total).then_some(total)
}

impl Read for SimulatedDevice {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.tx.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "simulated device has nothing to say",
            ));
        }
        let n = buf.len().min(inner.tx.len());
        for b in buf.iter_mut().take(n) {
            *b = inner.tx.pop_front().unwrap_or_default();
        }
        Ok(n)
    }
}

impl Write for SimulatedDevice {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.rx.extend_from_slice(buf);
        inner.pump();
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Transport for SimulatedDevice {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn clear_input(&mut self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.tx.clear();
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firmware::fixtures::{brightway_image, leqi_image};
    use crate::transport::read_until;

    #[test]
    fn test_sim_answers_uid_query() {
        let image = FirmwareImage::from_bytes(brightway_image(0x10000)).unwrap();
        let mut sim = SimulatedDevice::new(FirmwareKind::Brightway, &image).unwrap();
        sim.write_all(&UID_QUERY).unwrap();
        let resp = read_until(&mut sim, brightway::UID_FRAME_END, 64, Duration::ZERO).unwrap();
        assert_eq!(brightway::parse_uid_frame(&resp), Some(SIM_UID));
    }

    #[test]
    fn test_sim_answers_leqi_identify() {
        let image = FirmwareImage::from_bytes(leqi_image(0x1000)).unwrap();
        let mut sim = SimulatedDevice::new(FirmwareKind::Leqi, &image).unwrap();
        sim.write_all(&LeqiFrame::identify().encode().unwrap()).unwrap();
        let mut buf = [0u8; 16];
        let n = sim.read(&mut buf).unwrap();
        let ack = LeqiFrame::decode(&buf[..n]).unwrap();
        assert_eq!(ack.command, LeqiCommand::Identify);
        assert_eq!(ack.payload, vec![leqi::STATUS_OK, leqi::MODEL_LEQI]);
    }

    #[test]
    fn test_sim_silent_fault() {
        let image = FirmwareImage::from_bytes(leqi_image(0x1000)).unwrap();
        let mut sim = SimulatedDevice::new(FirmwareKind::Leqi, &image)
            .unwrap()
            .with_faults(FaultPlan {
                silent: true,
                ..FaultPlan::default()
            });
        sim.write_all(&LeqiFrame::identify().encode().unwrap()).unwrap();
        let mut buf = [0u8; 16];
        let err = sim.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);
    }

    #[test]
    fn test_sim_split_writes_reassemble() {
        // Frames arriving byte-by-byte must still be parsed.
        let image = FirmwareImage::from_bytes(leqi_image(0x1000)).unwrap();
        let mut sim = SimulatedDevice::new(FirmwareKind::Leqi, &image).unwrap();
        let frame = LeqiFrame::identify().encode().unwrap();
        for byte in frame {
            sim.write_all(&[byte]).unwrap();
        }
        let mut buf = [0u8; 16];
        let n = sim.read(&mut buf).unwrap();
        assert!(LeqiFrame::decode(&buf[..n]).is_ok());
    }

    #[test]
    fn test_sim_brightway_persona_answers_leqi_probe_with_banner() {
        let image = FirmwareImage::from_bytes(brightway_image(0x10000)).unwrap();
        let mut sim = SimulatedDevice::new(FirmwareKind::Brightway, &image).unwrap();
        sim.write_all(&LeqiFrame::identify().encode().unwrap()).unwrap();
        let resp = read_until(&mut sim, b'\r', 64, Duration::ZERO).unwrap();
        assert_eq!(resp, SIM_VERSION);
    }

    #[test]
    fn test_sim_nak_on_corrupt_chunk() {
        let image = FirmwareImage::from_bytes(brightway_image(0x10000)).unwrap();
        let mut sim = SimulatedDevice::new(FirmwareKind::Brightway, &image).unwrap();

        // Announce a page, then send a chunk with a flipped payload bit.
        sim.write_all(&brightway::nvm_write(0)).unwrap();
        sim.clear_input().unwrap();
        let mut packet = brightway::chunk_packet(1, &[0x42; BW_CHUNK]);
        packet[10] ^= 0x01;
        sim.write_all(&packet).unwrap();

        let mut buf = [0u8; 4];
        let n = sim.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], &[NAK]);
    }
}
