//! Firmware image loading, type detection and block partitioning.
//!
//! Detection is a pure function over the raw bytes: it inspects the
//! signature region and structural patterns and returns
//! [`FirmwareKind::Unknown`] (not an error) when nothing matches, for any
//! input including empty and truncated files. Parsing is the single gate
//! past which a session may assume a structurally consistent image.
//!
//! ## Recognized formats
//!
//! - **Brightway**: plaintext MCU firmware with the `DEPRD5C\0` signature
//!   at offset 0x800 and a unique `63 7C` signing marker that anchors the
//!   embedded authentication lookup tables.
//! - **Leqi**: firmware pre-encrypted with XOR 0xAA, recognized by the
//!   density of `AA A2` pairs (encrypted little-endian pointers) and raw
//!   0xAA bytes in the vector region.

use std::fmt;
use std::fs;
use std::path::Path;

use log::debug;

use crate::error::{Error, Result};
use crate::protocol::checksum::{CRC16_ARC, crc16, crc32};

/// Byte used to pad the final block of a transfer.
pub const PAD_BYTE: u8 = 0xFF;

/// Offset of the Brightway firmware signature.
pub const BRIGHTWAY_SIGNATURE_OFFSET: usize = 0x800;

/// Brightway firmware signature.
pub const BRIGHTWAY_SIGNATURE: &[u8; 8] = b"DEPRD5C\x00";

/// Marker pattern anchoring the Brightway signing tables.
const SIGNING_MARKER: [u8; 2] = [0x63, 0x7C];

/// Secondary marker following the signing marker.
const ENTROPY_MARKER: [u8; 2] = [0x01, 0x02];

/// Offset of the substitution table relative to the signing marker.
const SUBST_TABLE_OFFSET: usize = 0xA802;

/// Offset of the round-constant table relative to the signing marker.
const ROUND_TABLE_OFFSET: usize = 0xAA02;

/// Minimum plausible firmware size for detection.
const MIN_IMAGE_LEN: usize = 0x1000;

/// Minimum Leqi image size for the density scan.
const MIN_LEQI_LEN: usize = 0x400;

/// Minimum 0xAA run length that counts as Leqi trailer padding.
const LEQI_PAD_RUN: usize = 500;

/// Leqi chunk granularity; sizes are rounded up to this.
const LEQI_CHUNK: usize = 128;

/// Firmware families recognized by the flasher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FirmwareKind {
    /// Brightway controllers (authenticated text-command DFU).
    Brightway,
    /// Leqi controllers (binary 5A-framed packets, XOR 0xAA payload).
    Leqi,
    /// No known signature matched.
    Unknown,
}

impl fmt::Display for FirmwareKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Brightway => write!(f, "Brightway"),
            Self::Leqi => write!(f, "Leqi"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Find every offset of `pattern` in `data`.
fn find_pattern_offsets(pattern: &[u8], data: &[u8], start: usize) -> Vec<usize> {
    if pattern.is_empty() || data.len() < start {
        return Vec::new();
    }
    data[start..]
        .windows(pattern.len())
        .enumerate()
        .filter(|(_, w)| *w == pattern)
        .map(|(i, _)| start + i)
        .collect()
}

/// Detect the firmware family from raw bytes.
///
/// Total over arbitrary input: never fails, returns
/// [`FirmwareKind::Unknown`] when nothing matches.
pub fn detect(data: &[u8]) -> FirmwareKind {
    if data.len() < MIN_IMAGE_LEN {
        return FirmwareKind::Unknown;
    }

    // Brightway signature at the fixed offset.
    if data.len() > BRIGHTWAY_SIGNATURE_OFFSET + BRIGHTWAY_SIGNATURE.len()
        && &data[BRIGHTWAY_SIGNATURE_OFFSET..BRIGHTWAY_SIGNATURE_OFFSET + 8]
            == BRIGHTWAY_SIGNATURE.as_slice()
    {
        return FirmwareKind::Brightway;
    }

    // Fallback: a single signing marker above the vector table region.
    let markers = find_pattern_offsets(&SIGNING_MARKER, data, 0);
    if markers.len() == 1 && markers[0] > MIN_IMAGE_LEN {
        return FirmwareKind::Brightway;
    }

    // Leqi: encrypted pointer density in the vector region.
    if data.len() >= MIN_LEQI_LEN {
        let region = &data[0x80..MIN_LEQI_LEN];
        let aa_a2 = region.windows(2).filter(|w| *w == [0xAA, 0xA2]).count();
        let aa = region.iter().filter(|&&b| b == 0xAA).count();
        if aa_a2 > 10 && aa > 50 {
            return FirmwareKind::Leqi;
        }
    }

    FirmwareKind::Unknown
}

/// Image-level checksum, protocol-dependent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageChecksum {
    /// CRC32 over the transferred (padded) payload; reported to
    /// Brightway devices via `wr_info`.
    Crc32(u32),
    /// CRC-16/ARC over the declared-size prefix (Leqi firmware check).
    Crc16(u16),
}

/// Embedded Brightway authentication tables.
#[derive(Debug, Clone)]
pub struct SigningTables {
    /// 256-entry substitution table.
    pub subst: [u8; 256],
    /// Per-round constants; index 0 is unused.
    pub rounds: [u8; 11],
}

/// A parsed, validated firmware image.
///
/// Immutable for the lifetime of a flash operation; sessions borrow it
/// read-only.
pub struct FirmwareImage {
    data: Vec<u8>,
    kind: FirmwareKind,
    declared_size: usize,
    checksum: ImageChecksum,
    /// Offset of the signing marker (Brightway only).
    marker_offset: Option<usize>,
}

impl FirmwareImage {
    /// Load and parse a firmware image from a file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading firmware from: {}", path.display());
        let data = fs::read(path)?;
        Self::from_bytes(data)
    }

    /// Detect the firmware type and parse.
    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        let kind = detect(&data);
        Self::parse(data, kind)
    }

    /// Parse raw bytes as the given firmware type.
    ///
    /// Fails with [`Error::UnsupportedImage`] for `Unknown` and
    /// [`Error::InvalidImage`] when structural validation fails. No
    /// session can be constructed from bytes that did not pass here.
    pub fn parse(data: Vec<u8>, kind: FirmwareKind) -> Result<Self> {
        match kind {
            FirmwareKind::Unknown => Err(Error::UnsupportedImage),
            FirmwareKind::Brightway => Self::parse_brightway(data),
            FirmwareKind::Leqi => Self::parse_leqi(data),
        }
    }

    fn parse_brightway(data: Vec<u8>) -> Result<Self> {
        if data.len() < MIN_IMAGE_LEN {
            return Err(Error::InvalidImage(format!(
                "file too small for Brightway firmware ({} bytes)",
                data.len()
            )));
        }

        let markers = find_pattern_offsets(&SIGNING_MARKER, &data, 0);
        if markers.len() != 1 {
            return Err(Error::InvalidImage(format!(
                "expected exactly one signing marker, found {}",
                markers.len()
            )));
        }
        let marker = markers[0];

        let entropy = find_pattern_offsets(&ENTROPY_MARKER, &data, marker);
        if entropy.len() != 1 {
            return Err(Error::InvalidImage(format!(
                "expected exactly one entropy marker after 0x{marker:X}, found {}",
                entropy.len()
            )));
        }

        // The authentication tables must be inside the image.
        let tables_end = marker + ROUND_TABLE_OFFSET + 11;
        if tables_end > data.len() {
            return Err(Error::InvalidImage(format!(
                "signing tables out of bounds (need 0x{tables_end:X}, have 0x{:X})",
                data.len()
            )));
        }

        let declared_size = data.len();
        let checksum = ImageChecksum::Crc32(crc32(&data));
        debug!(
            "Brightway image: {} bytes, marker at 0x{marker:X}",
            data.len()
        );

        Ok(Self {
            data,
            kind: FirmwareKind::Brightway,
            declared_size,
            checksum,
            marker_offset: Some(marker),
        })
    }

    fn parse_leqi(data: Vec<u8>) -> Result<Self> {
        if data.len() < MIN_LEQI_LEN {
            return Err(Error::InvalidImage(format!(
                "file too small for Leqi firmware ({} bytes)",
                data.len()
            )));
        }

        let declared_size = leqi_payload_size(&data);
        if declared_size == 0 || declared_size > data.len() + LEQI_CHUNK {
            return Err(Error::InvalidImage(format!(
                "implausible Leqi payload size 0x{declared_size:X}"
            )));
        }
        let covered = declared_size.min(data.len());
        let checksum = ImageChecksum::Crc16(crc16(CRC16_ARC, &data[..covered]));
        debug!(
            "Leqi image: {} bytes, payload size 0x{declared_size:X}",
            data.len()
        );

        Ok(Self {
            data,
            kind: FirmwareKind::Leqi,
            declared_size,
            checksum,
            marker_offset: None,
        })
    }

    /// The detected firmware family.
    pub fn kind(&self) -> FirmwareKind {
        self.kind
    }

    /// Raw image bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Number of payload bytes the device expects.
    ///
    /// For Leqi this is the padding-derived size announced in the start
    /// command; for Brightway it is the full file length.
    pub fn declared_size(&self) -> usize {
        self.declared_size
    }

    /// Image-level checksum.
    pub fn checksum(&self) -> ImageChecksum {
        self.checksum
    }

    /// Extract the embedded authentication tables (Brightway only).
    pub fn signing_tables(&self) -> Result<SigningTables> {
        let marker = self.marker_offset.ok_or_else(|| {
            Error::InvalidImage("image carries no signing tables".into())
        })?;

        let mut subst = [0u8; 256];
        subst.copy_from_slice(&self.data[marker + SUBST_TABLE_OFFSET..marker + SUBST_TABLE_OFFSET + 256]);

        let mut rounds = [0u8; 11];
        // Round constant 0 is never indexed; the table starts one past the base.
        for (i, slot) in rounds.iter_mut().enumerate().skip(1) {
            *slot = self.data[marker + ROUND_TABLE_OFFSET + i];
        }

        Ok(SigningTables { subst, rounds })
    }

    /// Number of fixed-size blocks covering the declared payload.
    pub fn block_count(&self, block_size: usize) -> usize {
        self.declared_size.div_ceil(block_size)
    }

    /// The `index`-th block, padded to `block_size` with [`PAD_BYTE`].
    ///
    /// Derivable from the image bytes alone; calling it twice for the
    /// same index yields identical bytes, which is what makes block
    /// resends safe.
    pub fn block(&self, index: usize, block_size: usize) -> Vec<u8> {
        let start = index * block_size;
        let end = (start + block_size).min(self.declared_size).min(self.data.len());
        let mut chunk = if start < end {
            self.data[start..end].to_vec()
        } else {
            Vec::new()
        };
        chunk.resize(block_size, PAD_BYTE);
        chunk
    }

    /// Iterator over all padded blocks.
    pub fn blocks(&self, block_size: usize) -> impl Iterator<Item = Vec<u8>> + '_ {
        (0..self.block_count(block_size)).map(move |i| self.block(i, block_size))
    }
}

impl fmt::Debug for FirmwareImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FirmwareImage")
            .field("kind", &self.kind)
            .field("len", &self.data.len())
            .field("declared_size", &self.declared_size)
            .field("checksum", &self.checksum)
            .finish()
    }
}

/// Derive the Leqi payload size from the trailing 0xAA padding.
///
/// The encrypted image ends in a long run of 0xAA (plaintext 0x00); the
/// end of the longest such run, rounded up to the 128-byte chunk size,
/// is the size the controller is told to expect.
fn leqi_payload_size(data: &[u8]) -> usize {
    let mut best_len = 0;
    let mut best_end = 0;

    let mut i = 0;
    while i < data.len() {
        if data[i] == 0xAA {
            let start = i;
            while i < data.len() && data[i] == 0xAA {
                i += 1;
            }
            let len = i - start;
            if len > best_len && len > LEQI_PAD_RUN {
                best_len = len;
                best_end = i;
            }
        } else {
            i += 1;
        }
    }

    if best_end > 0 {
        best_end.div_ceil(LEQI_CHUNK) * LEQI_CHUNK
    } else {
        data.len()
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! Synthetic images used across the crate's tests.

    use super::*;

    /// Build a minimal valid Brightway image of `len` bytes.
    ///
    /// Places the signature at 0x800, a unique signing marker at 0x1100
    /// with the entropy marker right after it, and deterministic
    /// authentication tables at the marker-relative offsets.
    pub fn brightway_image(len: usize) -> Vec<u8> {
        assert!(len >= 0x1100 + ROUND_TABLE_OFFSET + 11);
        let mut data = vec![0u8; len];
        data[BRIGHTWAY_SIGNATURE_OFFSET..BRIGHTWAY_SIGNATURE_OFFSET + 8]
            .copy_from_slice(BRIGHTWAY_SIGNATURE);

        let marker = 0x1100;
        data[marker..marker + 2].copy_from_slice(&SIGNING_MARKER);
        data[marker + 2..marker + 4].copy_from_slice(&ENTROPY_MARKER);

        for i in 0..256 {
            data[marker + SUBST_TABLE_OFFSET + i] = ((i * 7 + 3) & 0xFF) as u8;
        }
        for i in 1..11 {
            data[marker + ROUND_TABLE_OFFSET + i] = ((i * 31 + 5) & 0xFF) as u8;
        }
        data
    }

    /// Build a minimal valid Leqi image with `payload` bytes of content
    /// followed by an 0xAA padding trailer.
    pub fn leqi_image(payload: usize) -> Vec<u8> {
        let mut data = vec![0u8; 0x80];
        // Vector region: encrypted pointers produce dense AA A2 pairs.
        for _ in 0..32 {
            data.extend_from_slice(&[0xAA, 0xA2, 0x00, 0xAA]);
        }
        data.resize(0x400, 0x00);
        data.resize(0x400 + payload, 0x5C);
        // Trailer padding run that determines the declared size.
        data.extend(std::iter::repeat_n(0xAA, 600));
        data
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::{brightway_image, leqi_image};
    use super::*;

    #[test]
    fn test_detect_is_total() {
        assert_eq!(detect(&[]), FirmwareKind::Unknown);
        assert_eq!(detect(&[0x00]), FirmwareKind::Unknown);
        assert_eq!(detect(&vec![0xFF; 0x200]), FirmwareKind::Unknown);
        assert_eq!(detect(&vec![0x00; 0x20000]), FirmwareKind::Unknown);
    }

    #[test]
    fn test_detect_is_deterministic() {
        let image = brightway_image(0x10000);
        let first = detect(&image);
        for _ in 0..3 {
            assert_eq!(detect(&image), first);
        }
    }

    #[test]
    fn test_detect_brightway_by_signature() {
        assert_eq!(detect(&brightway_image(0x10000)), FirmwareKind::Brightway);
    }

    #[test]
    fn test_detect_brightway_by_marker_only() {
        let mut image = brightway_image(0x10000);
        // Wipe the signature; the unique marker above 0x1000 still matches.
        image[BRIGHTWAY_SIGNATURE_OFFSET..BRIGHTWAY_SIGNATURE_OFFSET + 8].fill(0);
        assert_eq!(detect(&image), FirmwareKind::Brightway);
    }

    #[test]
    fn test_detect_leqi() {
        assert_eq!(detect(&leqi_image(0x1000)), FirmwareKind::Leqi);
    }

    #[test]
    fn test_truncated_leqi_is_unknown() {
        let image = leqi_image(0x1000);
        assert_eq!(detect(&image[..0x300]), FirmwareKind::Unknown);
    }

    #[test]
    fn test_parse_rejects_unknown() {
        let err = FirmwareImage::parse(vec![0u8; 64], FirmwareKind::Unknown).unwrap_err();
        assert!(matches!(err, Error::UnsupportedImage));
    }

    #[test]
    fn test_parse_brightway_rejects_missing_marker() {
        let mut data = vec![0u8; 0x10000];
        data[BRIGHTWAY_SIGNATURE_OFFSET..BRIGHTWAY_SIGNATURE_OFFSET + 8]
            .copy_from_slice(BRIGHTWAY_SIGNATURE);
        let err = FirmwareImage::parse(data, FirmwareKind::Brightway).unwrap_err();
        assert!(matches!(err, Error::InvalidImage(_)));
    }

    #[test]
    fn test_parse_brightway_extracts_tables() {
        let image = FirmwareImage::from_bytes(brightway_image(0x10000)).unwrap();
        assert_eq!(image.kind(), FirmwareKind::Brightway);
        let tables = image.signing_tables().unwrap();
        assert_eq!(tables.subst[0], 3);
        assert_eq!(tables.subst[1], 10);
        assert_eq!(tables.rounds[0], 0);
        assert_eq!(tables.rounds[1], 36);
    }

    #[test]
    fn test_parse_leqi_declared_size() {
        let image = FirmwareImage::from_bytes(leqi_image(0x1000)).unwrap();
        assert_eq!(image.kind(), FirmwareKind::Leqi);
        // Content ends at 0x400 + 0x1000 + 600 trailer bytes, rounded to 128.
        let content_end: usize = 0x400 + 0x1000 + 600;
        assert_eq!(image.declared_size(), content_end.div_ceil(128) * 128);
        assert!(matches!(image.checksum(), ImageChecksum::Crc16(_)));
    }

    #[test]
    fn test_blocks_cover_declared_payload() {
        let image = FirmwareImage::from_bytes(brightway_image(0x10000)).unwrap();
        let block_size = 0x800;
        let blocks: Vec<Vec<u8>> = image.blocks(block_size).collect();
        assert_eq!(blocks.len(), image.block_count(block_size));

        let mut joined = Vec::new();
        for block in &blocks {
            assert_eq!(block.len(), block_size);
            joined.extend_from_slice(block);
        }
        assert_eq!(&joined[..image.declared_size()], image.data());
        // Everything past the payload is padding.
        assert!(joined[image.declared_size()..].iter().all(|&b| b == PAD_BYTE));
    }

    #[test]
    fn test_blocks_short_tail_is_padded() {
        let mut raw = brightway_image(0x10000);
        raw.extend_from_slice(&[0x11, 0x22, 0x33]);
        let image = FirmwareImage::from_bytes(raw).unwrap();
        let last = image.block(image.block_count(0x800) - 1, 0x800);
        assert_eq!(last.len(), 0x800);
        assert_eq!(&last[..3], &[0x11, 0x22, 0x33]);
        assert!(last[3..].iter().all(|&b| b == PAD_BYTE));
    }

    #[test]
    fn test_block_is_rederivable() {
        let image = FirmwareImage::from_bytes(leqi_image(0x1000)).unwrap();
        assert_eq!(image.block(2, 128), image.block(2, 128));
    }
}
