//! Reference single-parity engine.
//!
//! Parity is the XOR of the data payloads at the same LBA and sits on the
//! last position. A sector with one bad member is rebuilt from the others;
//! two or more bad members leave the sector unrecoverable and untouched.

use crate::sector::{self, SectorCheck};
use crate::{
    ErrorRegion, HostData, ParityEngine, SectorErrorKind, StripRequest, StripResult, XorStatus,
};
use pv_error::{Result, VerifyError};
use pv_types::{BlockRange, Lba, Position, PositionMask, RaidGeometry, MAX_WIDTH, SECTOR_BYTES};
use tracing::{debug, trace};

/// XOR parity over 520-byte sectors for single-parity groups.
#[derive(Debug, Clone)]
pub struct SectorXorEngine {
    geometry: RaidGeometry,
    parity: Position,
}

impl SectorXorEngine {
    pub fn new(geometry: RaidGeometry) -> Result<Self> {
        if geometry.parity_disks() != 1 {
            return Err(VerifyError::Geometry(format!(
                "xor engine computes one parity position, group has {}",
                geometry.parity_disks()
            )));
        }
        Ok(Self {
            geometry,
            parity: Position(geometry.width() - 1),
        })
    }

    #[must_use]
    pub fn parity_position(&self) -> Position {
        self.parity
    }

    fn check_shape(&self, strip: &StripRequest<'_>) -> Result<usize> {
        let width = usize::from(self.geometry.width());
        if strip.sectors.len() != width {
            return Err(VerifyError::invariant(
                "xor_engine",
                format!("{} sector views for width {width}", strip.sectors.len()),
            ));
        }
        let blocks = usize::try_from(strip.range.blocks)
            .map_err(|_| VerifyError::invariant("xor_engine", "strip too large"))?;
        if let Some(short) = strip.sectors.iter().position(|s| s.len() < blocks * SECTOR_BYTES) {
            return Err(VerifyError::invariant(
                "xor_engine",
                format!("pos{short} buffer shorter than {blocks} sectors"),
            ));
        }
        Ok(blocks)
    }

    /// XOR of every position's payload at `index` except `skip`.
    fn xor_except(strip: &StripRequest<'_>, index: usize, skip: PositionMask, out: &mut [u8]) {
        out.fill(0);
        for (p, buf) in strip.sectors.iter().enumerate() {
            if skip.contains(position(p)) {
                continue;
            }
            sector::xor_payload(out, sector::nth(buf, index));
        }
    }

    fn verify_sector(
        &self,
        strip: &mut StripRequest<'_>,
        index: usize,
        lba: Lba,
        scratch: &mut [u8],
        result: &mut StripResult,
    ) {
        let mut bad = PositionMask::EMPTY;
        let mut invalidated = PositionMask::EMPTY;
        let mut kinds: [Option<SectorErrorKind>; MAX_WIDTH] = [None; MAX_WIDTH];

        for p in 0..strip.sectors.len() {
            let pos = position(p);
            if strip.missing.contains(pos) {
                bad.insert(pos);
                continue;
            }
            match sector::check(sector::nth(strip.sectors[p], index), lba) {
                SectorCheck::Good => {}
                SectorCheck::Invalidated if pos != self.parity => invalidated.insert(pos),
                SectorCheck::Invalidated | SectorCheck::ChecksumMismatch => {
                    bad.insert(pos);
                    kinds[p] = Some(if strip.media_error.contains(pos) {
                        SectorErrorKind::Media
                    } else {
                        SectorErrorKind::Checksum
                    });
                }
                SectorCheck::LbaStampMismatch => {
                    bad.insert(pos);
                    kinds[p] = Some(SectorErrorKind::LbaStamp);
                }
            }
        }

        match bad.count() {
            0 => self.check_coherency(strip, index, lba, invalidated, scratch, result),
            1 => {
                if let Some(pos) = bad.first() {
                    Self::rebuild(strip, index, lba, pos, kinds[pos.index()], scratch, result);
                }
                if !invalidated.is_empty() {
                    result.counts.invalidate += 1;
                    record(result, lba, invalidated, SectorErrorKind::Invalidated, true);
                }
            }
            _ => Self::give_up(lba, bad, &kinds, result),
        }
    }

    fn check_coherency(
        &self,
        strip: &mut StripRequest<'_>,
        index: usize,
        lba: Lba,
        invalidated: PositionMask,
        scratch: &mut [u8],
        result: &mut StripResult,
    ) {
        let parity_mask = PositionMask::single(self.parity);
        Self::xor_except(strip, index, parity_mask, scratch);
        let parity = sector::nth_mut(strip.sectors[self.parity.index()], index);
        let coherent = sector::payload(parity) == sector::payload(scratch);

        if !invalidated.is_empty() {
            result.counts.invalidate += 1;
        }
        if coherent {
            if !invalidated.is_empty() {
                record(result, lba, invalidated, SectorErrorKind::Invalidated, true);
            }
            return;
        }

        parity[..SECTOR_BYTES].copy_from_slice(scratch);
        sector::seal(parity, lba);
        result.modified.insert(self.parity);
        let kind = if invalidated.is_empty() {
            result.counts.c_coh += 1;
            SectorErrorKind::Coherency
        } else {
            SectorErrorKind::Invalidated
        };
        trace!(target: "pv::xor", %lba, ?kind, "parity_rewritten");
        record(result, lba, parity_mask, kind, true);
    }

    fn rebuild(
        strip: &mut StripRequest<'_>,
        index: usize,
        lba: Lba,
        pos: Position,
        kind: Option<SectorErrorKind>,
        scratch: &mut [u8],
        result: &mut StripResult,
    ) {
        Self::xor_except(strip, index, PositionMask::single(pos), scratch);
        let target = sector::nth_mut(strip.sectors[pos.index()], index);
        let bit_distance = sector::payload_bit_distance(target, scratch);
        target[..SECTOR_BYTES].copy_from_slice(scratch);
        sector::seal(target, lba);

        // Missing positions are rebuilt for readers only; nothing to write back.
        let Some(kind) = kind else {
            return;
        };
        result.modified.insert(pos);
        let counts = &mut result.counts;
        match kind {
            SectorErrorKind::Checksum => {
                counts.c_crc += 1;
                result.checksum_errors.insert(pos);
                if bit_distance == 1 {
                    counts.c_crc_single += 1;
                    result.crc_single_bit.insert(pos);
                } else {
                    counts.c_crc_multi += 1;
                    result.crc_multi_bit.insert(pos);
                }
            }
            SectorErrorKind::Media => counts.c_media += 1,
            SectorErrorKind::LbaStamp => counts.c_ls += 1,
            SectorErrorKind::Coherency | SectorErrorKind::Invalidated => {}
        }
        debug!(target: "pv::xor", %lba, %pos, ?kind, "sector_reconstructed");
        record(result, lba, PositionMask::single(pos), kind, true);
    }

    fn give_up(
        lba: Lba,
        bad: PositionMask,
        kinds: &[Option<SectorErrorKind>; MAX_WIDTH],
        result: &mut StripResult,
    ) {
        let mut region_kind = None;
        for pos in bad.iter() {
            let Some(kind) = kinds[pos.index()] else {
                continue;
            };
            let counts = &mut result.counts;
            match kind {
                SectorErrorKind::Checksum => {
                    counts.u_crc += 1;
                    counts.u_crc_multi += 1;
                    result.checksum_errors.insert(pos);
                    result.crc_multi_bit.insert(pos);
                }
                SectorErrorKind::Media => counts.u_media += 1,
                SectorErrorKind::LbaStamp => counts.u_ls += 1,
                SectorErrorKind::Coherency | SectorErrorKind::Invalidated => {}
            }
            region_kind = Some(match (region_kind, kind) {
                (Some(SectorErrorKind::Media), _) | (_, SectorErrorKind::Media) => SectorErrorKind::Media,
                (Some(prev), _) => prev,
                (None, k) => k,
            });
        }
        result.uncorrectable = result.uncorrectable | bad;
        result.first_uncorrectable = Some(result.first_uncorrectable.map_or(lba, |l| l.min(lba)));
        debug!(target: "pv::xor", %lba, %bad, "sector_unrecoverable");
        record(
            result,
            lba,
            bad,
            region_kind.unwrap_or(SectorErrorKind::Media),
            false,
        );
    }

    fn recompute_parity(&self, strip: &mut StripRequest<'_>, blocks: usize, scratch: &mut [u8]) {
        let parity_mask = PositionMask::single(self.parity);
        for index in 0..blocks {
            let lba = strip.range.start.offset(index as u64);
            Self::xor_except(strip, index, parity_mask, scratch);
            let parity = sector::nth_mut(strip.sectors[self.parity.index()], index);
            parity[..SECTOR_BYTES].copy_from_slice(scratch);
            sector::seal(parity, lba);
        }
    }
}

impl ParityEngine for SectorXorEngine {
    fn verify_and_reconstruct(&self, strip: &mut StripRequest<'_>) -> Result<StripResult> {
        let blocks = self.check_shape(strip)?;
        let mut scratch = vec![0_u8; SECTOR_BYTES];
        let mut result = StripResult::default();
        for index in 0..blocks {
            let lba = strip.range.start.offset(index as u64);
            self.verify_sector(strip, index, lba, &mut scratch, &mut result);
        }
        Ok(result)
    }

    fn validate_checksums(&self, range: BlockRange, data: &[u8]) -> XorStatus {
        let Ok(blocks) = usize::try_from(range.blocks) else {
            return XorStatus::ChecksumError;
        };
        if data.len() < blocks * SECTOR_BYTES {
            return XorStatus::ChecksumError;
        }
        let all_good = (0..blocks).all(|i| {
            sector::check(sector::nth(data, i), range.start.offset(i as u64)) == SectorCheck::Good
        });
        if all_good {
            XorStatus::NoError
        } else {
            XorStatus::ChecksumError
        }
    }

    fn copy_new_data_and_recompute_parity(
        &self,
        strip: &mut StripRequest<'_>,
        host: &HostData<'_>,
    ) -> Result<XorStatus> {
        let blocks = self.check_shape(strip)?;
        if let Some(overlap) = host.range.intersect(strip.range) {
            for &(pos, buf) in &host.buffers {
                if pos == self.parity || pos.index() >= strip.sectors.len() {
                    return Err(VerifyError::invariant(
                        "xor_engine",
                        format!("host data for non-data {pos}"),
                    ));
                }
                let host_first = overlap.start.0 - host.range.start.0;
                let strip_first = overlap.start.0 - strip.range.start.0;
                for k in 0..overlap.blocks {
                    let lba = overlap.start.offset(k);
                    let src_index = usize::try_from(host_first + k)
                        .map_err(|_| VerifyError::invariant("xor_engine", "host range too large"))?;
                    if buf.len() < (src_index + 1) * SECTOR_BYTES {
                        return Err(VerifyError::invariant(
                            "xor_engine",
                            format!("host buffer for {pos} shorter than its range"),
                        ));
                    }
                    let src = sector::nth(buf, src_index);
                    if matches!(
                        sector::check(src, lba),
                        SectorCheck::ChecksumMismatch | SectorCheck::LbaStampMismatch
                    ) {
                        debug!(target: "pv::xor", %lba, %pos, "host_buffer_bad_checksum");
                        return Ok(XorStatus::BadMemory);
                    }
                    let dst_index = usize::try_from(strip_first + k)
                        .map_err(|_| VerifyError::invariant("xor_engine", "strip range too large"))?;
                    sector::nth_mut(strip.sectors[pos.index()], dst_index).copy_from_slice(src);
                }
            }
        }
        let mut scratch = vec![0_u8; SECTOR_BYTES];
        self.recompute_parity(strip, blocks, &mut scratch);
        Ok(XorStatus::NoError)
    }
}

fn position(index: usize) -> Position {
    Position(u16::try_from(index).unwrap_or(u16::MAX))
}

/// Append one block to the region list, extending the last region when contiguous.
fn record(
    result: &mut StripResult,
    lba: Lba,
    positions: PositionMask,
    kind: SectorErrorKind,
    correctable: bool,
) {
    if let Some(last) = result.regions.last_mut() {
        if last.kind == kind
            && last.positions == positions
            && last.correctable == correctable
            && last.range.end() == lba
        {
            last.range.blocks += 1;
            return;
        }
    }
    result.regions.push(ErrorRegion {
        range: BlockRange::new(lba, 1),
        positions,
        kind,
        correctable,
    });
}
