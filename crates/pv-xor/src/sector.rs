//! 520-byte sector format: 512 bytes of payload, a CRC32C of the payload,
//! and the low 32 bits of the sector's LBA.
//!
//! An invalidated sector carries [`INVALIDATED_MAGIC`] at the head of its
//! payload and the bitwise complement of the payload CRC, so it can never
//! pass as good data.

use pv_types::{Lba, SECTOR_BYTES, SECTOR_PAYLOAD_BYTES};

pub const INVALIDATED_MAGIC: &[u8; 8] = b"PVINVAL\0";

const CRC_OFFSET: usize = SECTOR_PAYLOAD_BYTES;
const STAMP_OFFSET: usize = SECTOR_PAYLOAD_BYTES + 4;

/// Verdict for one sector read back from a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectorCheck {
    Good,
    ChecksumMismatch,
    /// Payload intact but stamped for a different block.
    LbaStampMismatch,
    Invalidated,
}

#[must_use]
pub fn payload(sector: &[u8]) -> &[u8] {
    &sector[..SECTOR_PAYLOAD_BYTES]
}

#[must_use]
pub fn lba_stamp(lba: Lba) -> u32 {
    #[expect(clippy::cast_possible_truncation)] // stamp keeps the low 32 bits by format
    let stamp = lba.0 as u32;
    stamp
}

fn stored_crc(sector: &[u8]) -> u32 {
    u32::from_le_bytes([
        sector[CRC_OFFSET],
        sector[CRC_OFFSET + 1],
        sector[CRC_OFFSET + 2],
        sector[CRC_OFFSET + 3],
    ])
}

fn stored_stamp(sector: &[u8]) -> u32 {
    u32::from_le_bytes([
        sector[STAMP_OFFSET],
        sector[STAMP_OFFSET + 1],
        sector[STAMP_OFFSET + 2],
        sector[STAMP_OFFSET + 3],
    ])
}

/// Write the CRC and LBA stamp for the current payload.
pub fn seal(sector: &mut [u8], lba: Lba) {
    let crc = crc32c::crc32c(payload(sector));
    sector[CRC_OFFSET..STAMP_OFFSET].copy_from_slice(&crc.to_le_bytes());
    sector[STAMP_OFFSET..SECTOR_BYTES].copy_from_slice(&lba_stamp(lba).to_le_bytes());
}

/// Overwrite `sector` with the invalidation pattern for `lba`.
pub fn invalidate(sector: &mut [u8], lba: Lba) {
    sector[..SECTOR_PAYLOAD_BYTES].fill(0);
    sector[..INVALIDATED_MAGIC.len()].copy_from_slice(INVALIDATED_MAGIC);
    sector[INVALIDATED_MAGIC.len()..16].copy_from_slice(&lba.0.to_le_bytes());
    let crc = !crc32c::crc32c(payload(sector));
    sector[CRC_OFFSET..STAMP_OFFSET].copy_from_slice(&crc.to_le_bytes());
    sector[STAMP_OFFSET..SECTOR_BYTES].copy_from_slice(&lba_stamp(lba).to_le_bytes());
}

#[must_use]
pub fn check(sector: &[u8], lba: Lba) -> SectorCheck {
    let crc = crc32c::crc32c(payload(sector));
    let stored = stored_crc(sector);
    if stored == crc {
        if stored_stamp(sector) == lba_stamp(lba) {
            SectorCheck::Good
        } else {
            SectorCheck::LbaStampMismatch
        }
    } else if stored == !crc && sector.starts_with(INVALIDATED_MAGIC) {
        SectorCheck::Invalidated
    } else {
        SectorCheck::ChecksumMismatch
    }
}

/// `dst ^= src` over the payload bytes only.
pub fn xor_payload(dst: &mut [u8], src: &[u8]) {
    for (d, s) in dst[..SECTOR_PAYLOAD_BYTES].iter_mut().zip(payload(src)) {
        *d ^= *s;
    }
}

/// Number of payload bits that differ between two sectors.
#[must_use]
pub fn payload_bit_distance(a: &[u8], b: &[u8]) -> u32 {
    payload(a)
        .iter()
        .zip(payload(b))
        .map(|(x, y)| (x ^ y).count_ones())
        .sum()
}

/// Sector `index` of a multi-sector buffer.
#[must_use]
pub fn nth(buf: &[u8], index: usize) -> &[u8] {
    &buf[index * SECTOR_BYTES..(index + 1) * SECTOR_BYTES]
}

pub fn nth_mut(buf: &mut [u8], index: usize) -> &mut [u8] {
    &mut buf[index * SECTOR_BYTES..(index + 1) * SECTOR_BYTES]
}
