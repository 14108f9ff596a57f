//! The request a verify operation works on behalf of.
//!
//! The parent outlives its verify: it creates the operation, lends it a
//! mutable borrow, and waits for the outcome before touching its own
//! buffers again.

use crate::algorithm::ParentAlgorithm;
use pv_drive::sector_bytes;
use pv_types::{BlockRange, Position, PositionMask};
use serde::{Deserialize, Serialize};

/// Opcode the caller issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParentOpcode {
    Read,
    Write,
    Verify,
    /// Verify that reports but never writes.
    ReadOnlyVerify,
}

impl ParentOpcode {
    /// Callers that hold only a shared range lock.
    #[must_use]
    pub fn is_shared(self) -> bool {
        matches!(self, Self::Read | Self::ReadOnlyVerify)
    }
}

#[derive(Debug, Clone)]
pub struct ParentRequest {
    pub algorithm: ParentAlgorithm,
    pub opcode: ParentOpcode,
    /// Per-position block range the parent covers.
    pub range: BlockRange,
    /// Host buffers per data position, each covering `range`.
    pub buffers: Vec<(Position, Vec<u8>)>,
    /// Positions where the parent's own read took a retryable error.
    pub retryable: PositionMask,
    /// Corrections were found that this verify could not write.
    pub remap_needed: bool,
    pub blocks_transferred: u64,
}

impl ParentRequest {
    /// Parent of a background verify over `range`.
    #[must_use]
    pub fn background(range: BlockRange, opcode: ParentOpcode) -> Self {
        Self {
            algorithm: ParentAlgorithm::Verify,
            opcode,
            range,
            buffers: Vec::new(),
            retryable: PositionMask::EMPTY,
            remap_needed: false,
            blocks_transferred: 0,
        }
    }

    /// Read parent with zeroed receive buffers for `positions`.
    #[must_use]
    pub fn read(algorithm: ParentAlgorithm, range: BlockRange, positions: PositionMask) -> Self {
        let buffers = positions
            .iter()
            .map(|p| (p, vec![0; sector_bytes(range.blocks)]))
            .collect();
        Self {
            algorithm,
            opcode: ParentOpcode::Read,
            range,
            buffers,
            retryable: PositionMask::EMPTY,
            remap_needed: false,
            blocks_transferred: 0,
        }
    }

    /// Write parent carrying new data for some data positions.
    #[must_use]
    pub fn write(
        algorithm: ParentAlgorithm,
        range: BlockRange,
        buffers: Vec<(Position, Vec<u8>)>,
    ) -> Self {
        Self {
            algorithm,
            opcode: ParentOpcode::Write,
            range,
            buffers,
            retryable: PositionMask::EMPTY,
            remap_needed: false,
            blocks_transferred: 0,
        }
    }

    #[must_use]
    pub fn with_retryable(mut self, positions: PositionMask) -> Self {
        self.retryable = positions;
        self
    }

    #[must_use]
    pub fn buffer(&self, pos: Position) -> Option<&[u8]> {
        self.buffers
            .iter()
            .find(|(p, _)| *p == pos)
            .map(|(_, b)| b.as_slice())
    }
}
