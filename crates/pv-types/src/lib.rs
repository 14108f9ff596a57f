#![forbid(unsafe_code)]
//! Shared newtypes for the parity verify engine.
//!
//! Every address that crosses a crate boundary carries its unit in the
//! type: [`Lba`] is a per-position block address, [`Position`] is a member
//! index inside a redundant group, and [`PositionMask`] is the fixed-size
//! set of positions used for degraded, retry, and write bitmaps.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitAnd, BitOr, Not, Sub};
use thiserror::Error;

/// Bytes of user payload per sector.
pub const SECTOR_PAYLOAD_BYTES: usize = 512;
/// Bytes per sector including the 8-byte metadata trailer.
pub const SECTOR_BYTES: usize = 520;
/// Widest redundant group a [`PositionMask`] can describe.
pub const MAX_WIDTH: usize = 16;

/// Per-position logical block address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Lba(pub u64);

impl Lba {
    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }

    /// Address `blocks` past this one, saturating at `u64::MAX`.
    #[must_use]
    pub fn offset(self, blocks: u64) -> Self {
        Self(self.0.saturating_add(blocks))
    }
}

impl fmt::Display for Lba {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Identity of one in-flight verify operation, assigned by its host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OperationId(pub u64);

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op#{}", self.0)
    }
}

/// Member index inside a redundant group (`0..width`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Position(pub u16);

impl Position {
    #[must_use]
    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pos{}", self.0)
    }
}

// ── Block ranges ────────────────────────────────────────────────────────────

/// Half-open range of per-position blocks `[start, start + blocks)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockRange {
    pub start: Lba,
    pub blocks: u64,
}

impl BlockRange {
    #[must_use]
    pub fn new(start: Lba, blocks: u64) -> Self {
        Self { start, blocks }
    }

    /// First address past the range.
    #[must_use]
    pub fn end(self) -> Lba {
        self.start.offset(self.blocks)
    }

    #[must_use]
    pub fn is_empty(self) -> bool {
        self.blocks == 0
    }

    #[must_use]
    pub fn contains(self, lba: Lba) -> bool {
        lba >= self.start && lba < self.end()
    }

    #[must_use]
    pub fn overlaps(self, other: Self) -> bool {
        !self.is_empty() && !other.is_empty() && self.start < other.end() && other.start < self.end()
    }

    /// Overlap of two ranges, or `None` when they are disjoint.
    #[must_use]
    pub fn intersect(self, other: Self) -> Option<Self> {
        if !self.overlaps(other) {
            return None;
        }
        let start = self.start.max(other.start);
        let end = self.end().min(other.end());
        Some(Self::new(start, end.0 - start.0))
    }

    /// Both ends fall on a multiple of `optimal`. A zero quantum never aligns.
    #[must_use]
    pub fn is_aligned(self, optimal: u64) -> bool {
        optimal != 0 && self.start.0 % optimal == 0 && self.end().0 % optimal == 0
    }

    /// Smallest range containing `self` whose ends are multiples of
    /// `optimal`, clamped to `capacity` blocks.
    #[must_use]
    pub fn expand_to(self, optimal: u64, capacity: u64) -> Self {
        if optimal == 0 {
            return self;
        }
        let start = self.start.0 - self.start.0 % optimal;
        let end = self.end().0.div_ceil(optimal).saturating_mul(optimal).min(capacity);
        Self::new(Lba(start), end.saturating_sub(start))
    }
}

impl fmt::Display for BlockRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}+{}]", self.start, self.blocks)
    }
}

// ── Position sets ───────────────────────────────────────────────────────────

/// Fixed-size set of member positions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PositionMask(u16);

impl PositionMask {
    pub const EMPTY: Self = Self(0);

    #[must_use]
    pub fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    #[must_use]
    pub fn bits(self) -> u16 {
        self.0
    }

    /// Every position of a group `width` wide.
    #[must_use]
    pub fn all(width: u16) -> Self {
        match width {
            0 => Self::EMPTY,
            w if usize::from(w) >= MAX_WIDTH => Self(u16::MAX),
            w => Self((1_u16 << w) - 1),
        }
    }

    #[must_use]
    pub fn single(pos: Position) -> Self {
        Self(1_u16.checked_shl(u32::from(pos.0)).unwrap_or(0))
    }

    #[must_use]
    pub fn contains(self, pos: Position) -> bool {
        !(self & Self::single(pos)).is_empty()
    }

    pub fn insert(&mut self, pos: Position) {
        *self = *self | Self::single(pos);
    }

    pub fn remove(&mut self, pos: Position) {
        *self = *self - Self::single(pos);
    }

    #[must_use]
    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[must_use]
    pub fn intersection(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    #[must_use]
    pub fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// Number of positions in the set.
    #[must_use]
    pub fn count(self) -> u32 {
        self.0.count_ones()
    }

    #[must_use]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Lowest-numbered member, if any.
    #[must_use]
    pub fn first(self) -> Option<Position> {
        if self.is_empty() {
            None
        } else {
            #[expect(clippy::cast_possible_truncation)] // trailing_zeros of a nonzero u16 is < 16
            let lowest = self.0.trailing_zeros() as u16;
            Some(Position(lowest))
        }
    }

    /// Members in ascending position order.
    pub fn iter(self) -> impl Iterator<Item = Position> {
        (0..MAX_WIDTH as u16)
            .map(Position)
            .filter(move |p| self.contains(*p))
    }
}

impl BitOr for PositionMask {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl BitAnd for PositionMask {
    type Output = Self;
    fn bitand(self, rhs: Self) -> Self {
        self.intersection(rhs)
    }
}

impl Sub for PositionMask {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        self.difference(rhs)
    }
}

impl Not for PositionMask {
    type Output = Self;
    fn not(self) -> Self {
        Self(!self.0)
    }
}

impl FromIterator<Position> for PositionMask {
    fn from_iter<I: IntoIterator<Item = Position>>(iter: I) -> Self {
        iter.into_iter().fold(Self::EMPTY, |m, p| m | Self::single(p))
    }
}

impl fmt::Display for PositionMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

// ── Group geometry ──────────────────────────────────────────────────────────

/// Errors from validating a [`RaidGeometry`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GeometryError {
    #[error("group width {width} outside 2..={max}")]
    Width { width: u16, max: usize },
    #[error("parity disk count {parity} must be in 1..{width}")]
    ParityDisks { parity: u16, width: u16 },
    #[error("optimal block size must be nonzero")]
    ZeroOptimalBlockSize,
    #[error("capacity {capacity} is not a multiple of optimal block size {optimal}")]
    Capacity { capacity: u64, optimal: u64 },
}

/// Shape of a parity-protected redundant group.
///
/// Parity lives on the highest-numbered `parity_disks` positions. The
/// optimal block size doubles as the region-mining quantum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaidGeometry {
    width: u16,
    parity_disks: u16,
    optimal_block_size: u64,
    capacity: u64,
}

impl RaidGeometry {
    pub fn new(
        width: u16,
        parity_disks: u16,
        optimal_block_size: u64,
        capacity: u64,
    ) -> Result<Self, GeometryError> {
        if !(2..=MAX_WIDTH).contains(&usize::from(width)) {
            return Err(GeometryError::Width {
                width,
                max: MAX_WIDTH,
            });
        }
        if parity_disks == 0 || parity_disks >= width {
            return Err(GeometryError::ParityDisks {
                parity: parity_disks,
                width,
            });
        }
        if optimal_block_size == 0 {
            return Err(GeometryError::ZeroOptimalBlockSize);
        }
        if capacity % optimal_block_size != 0 {
            return Err(GeometryError::Capacity {
                capacity,
                optimal: optimal_block_size,
            });
        }
        Ok(Self {
            width,
            parity_disks,
            optimal_block_size,
            capacity,
        })
    }

    #[must_use]
    pub fn width(&self) -> u16 {
        self.width
    }

    #[must_use]
    pub fn parity_disks(&self) -> u16 {
        self.parity_disks
    }

    #[must_use]
    pub fn data_disks(&self) -> u16 {
        self.width - self.parity_disks
    }

    #[must_use]
    pub fn optimal_block_size(&self) -> u64 {
        self.optimal_block_size
    }

    /// Blocks per member position.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    #[must_use]
    pub fn all_positions(&self) -> PositionMask {
        PositionMask::all(self.width)
    }

    #[must_use]
    pub fn parity_positions(&self) -> PositionMask {
        self.all_positions() - PositionMask::all(self.data_disks())
    }

    #[must_use]
    pub fn data_positions(&self) -> PositionMask {
        PositionMask::all(self.data_disks())
    }

    #[must_use]
    pub fn is_parity(&self, pos: Position) -> bool {
        self.parity_positions().contains(pos)
    }

    /// Range lies entirely inside the group.
    #[must_use]
    pub fn contains(&self, range: BlockRange) -> bool {
        range.end().0 <= self.capacity
    }
}
