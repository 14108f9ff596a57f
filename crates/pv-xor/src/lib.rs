#![forbid(unsafe_code)]
//! Parity/XOR engine interface consumed by the verify state machine.
//!
//! # Design
//!
//! The state machine decides *when* the engine runs and with *which*
//! buffers; the engine owns the arithmetic. Three calls cross the seam:
//!
//! - [`ParityEngine::verify_and_reconstruct`] checks every sector of a strip,
//!   rebuilds what redundancy allows, and reports what changed and what
//!   could not be recovered.
//! - [`ParityEngine::validate_checksums`] checks a host buffer.
//! - [`ParityEngine::copy_new_data_and_recompute_parity`] merges caller data
//!   into the strip and rebuilds parity.
//!
//! [`SectorXorEngine`] is the reference single-parity implementation over
//! the 520-byte format in [`sector`].

pub mod sector;
mod xor;

use pv_error::Result;
use pv_types::{BlockRange, Lba, Position, PositionMask};
use serde::{Deserialize, Serialize};

pub use xor::SectorXorEngine;

/// Outcome of a checksum validation or data merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum XorStatus {
    NoError,
    ChecksumError,
    /// Host-supplied buffers failed their own checksums.
    BadMemory,
}

// ── Error statistics ────────────────────────────────────────────────────────

/// Per-category error counters, split correctable (`c_`) / uncorrectable (`u_`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyErrorCounts {
    pub c_crc: u32,
    pub u_crc: u32,
    pub c_crc_single: u32,
    pub u_crc_single: u32,
    pub c_crc_multi: u32,
    pub u_crc_multi: u32,
    pub c_coh: u32,
    pub u_coh: u32,
    pub c_ls: u32,
    pub u_ls: u32,
    pub c_media: u32,
    pub u_media: u32,
    pub c_soft_media: u32,
    pub retryable: u32,
    pub non_retryable: u32,
    pub shutdown: u32,
    pub invalidate: u32,
}

impl VerifyErrorCounts {
    pub fn accumulate(&mut self, other: &Self) {
        self.c_crc += other.c_crc;
        self.u_crc += other.u_crc;
        self.c_crc_single += other.c_crc_single;
        self.u_crc_single += other.u_crc_single;
        self.c_crc_multi += other.c_crc_multi;
        self.u_crc_multi += other.u_crc_multi;
        self.c_coh += other.c_coh;
        self.u_coh += other.u_coh;
        self.c_ls += other.c_ls;
        self.u_ls += other.u_ls;
        self.c_media += other.c_media;
        self.u_media += other.u_media;
        self.c_soft_media += other.c_soft_media;
        self.retryable += other.retryable;
        self.non_retryable += other.non_retryable;
        self.shutdown += other.shutdown;
        self.invalidate += other.invalidate;
    }

    #[must_use]
    pub fn correctable(&self) -> u32 {
        self.c_crc + self.c_coh + self.c_ls + self.c_media + self.c_soft_media
    }

    #[must_use]
    pub fn uncorrectable(&self) -> u32 {
        self.u_crc + self.u_coh + self.u_ls + self.u_media
    }

    /// Errors worth reporting; invalidated sectors are counted separately.
    #[must_use]
    pub fn total(&self) -> u32 {
        self.correctable() + self.uncorrectable() + self.retryable + self.non_retryable + self.shutdown
    }

    /// Single- or multi-bit CRC errors were seen.
    #[must_use]
    pub fn has_crc_class(&self) -> bool {
        self.c_crc_single + self.u_crc_single + self.c_crc_multi + self.u_crc_multi > 0
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.total() == 0 && self.invalidate == 0
    }
}

/// Kind of a recorded sector error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectorErrorKind {
    Checksum,
    /// Parity disagreed with the data it covers.
    Coherency,
    LbaStamp,
    Media,
    /// Sector previously invalidated on purpose.
    Invalidated,
}

/// Run of consecutive blocks sharing one error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRegion {
    pub range: BlockRange,
    pub positions: PositionMask,
    pub kind: SectorErrorKind,
    pub correctable: bool,
}

// ── Engine seam ─────────────────────────────────────────────────────────────

/// One strip handed to the engine: every position's sectors over `range`.
pub struct StripRequest<'a> {
    pub range: BlockRange,
    /// One view per position, `range.blocks` sectors each.
    pub sectors: Vec<&'a mut [u8]>,
    /// Positions skipped because the group is degraded there.
    pub degraded: PositionMask,
    /// Positions whose read produced no data (degraded, dead, retryable).
    pub missing: PositionMask,
    /// Positions whose read stopped at a hard media error.
    pub media_error: PositionMask,
}

/// Findings of one [`ParityEngine::verify_and_reconstruct`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StripResult {
    /// Positions whose buffers were rewritten and need write-back.
    pub modified: PositionMask,
    /// Positions holding at least one unreconstructable sector.
    pub uncorrectable: PositionMask,
    /// Positions with checksum mismatches not explained by a media error.
    pub checksum_errors: PositionMask,
    pub crc_single_bit: PositionMask,
    pub crc_multi_bit: PositionMask,
    pub first_uncorrectable: Option<Lba>,
    pub counts: VerifyErrorCounts,
    pub regions: Vec<ErrorRegion>,
}

/// Caller-owned data merged by [`ParityEngine::copy_new_data_and_recompute_parity`].
pub struct HostData<'a> {
    pub range: BlockRange,
    pub buffers: Vec<(Position, &'a [u8])>,
}

/// Stripe-wide parity arithmetic.
pub trait ParityEngine {
    /// Check and repair `strip` in place.
    fn verify_and_reconstruct(&self, strip: &mut StripRequest<'_>) -> Result<StripResult>;

    /// Check every sector of a host buffer covering `range`.
    fn validate_checksums(&self, range: BlockRange, data: &[u8]) -> XorStatus;

    /// Merge `host` into `strip` and recompute parity over the strip.
    fn copy_new_data_and_recompute_parity(
        &self,
        strip: &mut StripRequest<'_>,
        host: &HostData<'_>,
    ) -> Result<XorStatus>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_accumulate_and_classify() {
        let mut a = VerifyErrorCounts {
            c_media: 1,
            c_crc: 2,
            c_crc_single: 1,
            ..Default::default()
        };
        let b = VerifyErrorCounts {
            u_media: 1,
            retryable: 3,
            ..Default::default()
        };
        a.accumulate(&b);
        assert_eq!(a.correctable(), 3);
        assert_eq!(a.uncorrectable(), 1);
        assert_eq!(a.total(), 7);
        assert!(a.has_crc_class());
        assert!(!a.is_clean());
    }

    #[test]
    fn counts_serialize_with_field_names() {
        let c = VerifyErrorCounts {
            u_media: 2,
            ..Default::default()
        };
        let json = serde_json::to_value(c).unwrap();
        assert_eq!(json["u_media"], 2);
    }
}
