#![forbid(unsafe_code)]
//! Per-drive requests and the request chain a verify operation owns.
//!
//! # Design
//!
//! A verify operation issues at most one request per member position at a
//! time, so the chain is a boxed slice indexed by position. Slots are reset
//! in place between passes and regions; nothing is reallocated after the
//! stripe buffers are planted.
//!
//! Buffers move with the I/O. [`RequestChain::build_io`] takes each slot's
//! buffer into a [`DriveIo`], and the matching [`DriveCompletion`] hands it
//! back. A slot whose buffer is out is in flight; touching its sectors is
//! an invariant violation.

pub mod eboard;

use pv_error::{Result, VerifyError};
use pv_types::{BlockRange, Lba, OperationId, Position, PositionMask, SECTOR_BYTES};
use serde::{Deserialize, Serialize};
use tracing::trace;

pub use eboard::{ChainStatus, ErrorBoard};

// ── Request vocabulary ──────────────────────────────────────────────────────

/// Operation a per-drive request performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriveOpcode {
    Read,
    Write,
    /// Write followed by a media verify of the written blocks.
    WriteVerify,
}

impl DriveOpcode {
    #[must_use]
    pub fn is_write(self) -> bool {
        matches!(self, Self::Write | Self::WriteVerify)
    }
}

/// Completion status of a per-drive request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriveStatus {
    /// Issued, not yet completed.
    Pending,
    Success,
    /// Completed, but the drive remapped a marginal sector.
    SoftMediaError,
    /// Hard media error starting at `bad_lba`.
    MediaError { bad_lba: Lba },
    /// Position no longer responds.
    Dead,
    /// Transient failure; the request may be reissued.
    Retryable,
    /// Cancelled on the client's behalf.
    Aborted,
}

/// One I/O handed to the host for submission.
#[derive(Debug)]
pub struct DriveIo {
    pub op: OperationId,
    pub position: Position,
    pub opcode: DriveOpcode,
    pub range: BlockRange,
    /// Read target or write source; exactly `range.blocks` sectors long.
    pub buffer: Vec<u8>,
}

/// Completion of a [`DriveIo`], returning its buffer.
#[derive(Debug)]
pub struct DriveCompletion {
    pub op: OperationId,
    pub position: Position,
    pub status: DriveStatus,
    pub buffer: Vec<u8>,
}

/// Host-side submission queue for per-drive I/O.
pub trait DriveSubmitter {
    fn submit(&mut self, io: DriveIo);
}

// ── Per-drive request ───────────────────────────────────────────────────────

/// One outstanding read or write against a single member position.
#[derive(Debug)]
pub struct DriveRequest {
    position: Position,
    opcode: DriveOpcode,
    range: BlockRange,
    status: DriveStatus,
    nop: bool,
    retries: u32,
    buffer: Option<Vec<u8>>,
}

impl DriveRequest {
    fn new(position: Position) -> Self {
        Self {
            position,
            opcode: DriveOpcode::Read,
            range: BlockRange::new(Lba(0), 0),
            status: DriveStatus::Pending,
            nop: false,
            retries: 0,
            buffer: None,
        }
    }

    fn reset(&mut self, opcode: DriveOpcode, range: BlockRange) {
        self.opcode = opcode;
        self.range = range;
        self.status = DriveStatus::Pending;
        self.nop = false;
        self.retries = 0;
    }

    #[must_use]
    pub fn position(&self) -> Position {
        self.position
    }

    #[must_use]
    pub fn opcode(&self) -> DriveOpcode {
        self.opcode
    }

    #[must_use]
    pub fn range(&self) -> BlockRange {
        self.range
    }

    #[must_use]
    pub fn status(&self) -> DriveStatus {
        self.status
    }

    #[must_use]
    pub fn is_nop(&self) -> bool {
        self.nop
    }

    #[must_use]
    pub fn retries(&self) -> u32 {
        self.retries
    }

    #[must_use]
    pub fn is_in_flight(&self) -> bool {
        self.buffer.is_none()
    }

    /// Blocks that reached the media before the request stopped.
    #[must_use]
    pub fn blocks_transferred(&self) -> u64 {
        match self.status {
            DriveStatus::Success | DriveStatus::SoftMediaError => self.range.blocks,
            DriveStatus::MediaError { bad_lba } => bad_lba
                .0
                .saturating_sub(self.range.start.0)
                .min(self.range.blocks),
            DriveStatus::Pending | DriveStatus::Dead | DriveStatus::Retryable | DriveStatus::Aborted => 0,
        }
    }
}

// ── Request chain ───────────────────────────────────────────────────────────

/// Fixed-capacity array of per-drive requests, one slot per position.
#[derive(Debug)]
pub struct RequestChain {
    slots: Box<[DriveRequest]>,
}

impl RequestChain {
    /// Empty chain for a group `width` positions wide. No buffers yet.
    #[must_use]
    pub fn new(width: u16) -> Self {
        Self {
            slots: (0..width).map(|p| DriveRequest::new(Position(p))).collect(),
        }
    }

    #[must_use]
    pub fn width(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn get(&self, pos: Position) -> Option<&DriveRequest> {
        self.slots.get(pos.index())
    }

    pub fn iter(&self) -> impl Iterator<Item = &DriveRequest> {
        self.slots.iter()
    }

    /// Hand one stripe buffer to each slot.
    pub fn plant_buffers(&mut self, buffers: Vec<Vec<u8>>) -> Result<()> {
        if buffers.len() != self.slots.len() {
            return Err(VerifyError::invariant(
                "plant_buffers",
                format!("{} buffers for {} positions", buffers.len(), self.slots.len()),
            ));
        }
        for (slot, buf) in self.slots.iter_mut().zip(buffers) {
            slot.buffer = Some(buf);
        }
        Ok(())
    }

    /// Take every buffer back out, e.g. to return it to its pool.
    pub fn release_buffers(&mut self) -> Vec<Vec<u8>> {
        self.slots.iter_mut().filter_map(|s| s.buffer.take()).collect()
    }

    /// Re-initialize every slot in place for a new pass over `range`.
    pub fn reset(&mut self, opcode: DriveOpcode, range: BlockRange) {
        for slot in self.slots.iter_mut() {
            slot.reset(opcode, range);
        }
        trace!(target: "pv::drive", ?opcode, %range, "chain_reset");
    }

    /// Re-initialize only the slots in `mask`, keeping their retry counts.
    pub fn reissue(&mut self, mask: PositionMask) {
        for slot in self.slots_in(mask) {
            slot.status = DriveStatus::Pending;
            slot.retries += 1;
        }
    }

    /// Re-initialize the slots in `mask` for a fresh read of their range.
    pub fn reread(&mut self, mask: PositionMask) {
        for slot in self.slots_in(mask) {
            slot.opcode = DriveOpcode::Read;
            slot.status = DriveStatus::Pending;
            slot.nop = false;
        }
    }

    /// Switch the slots in `mask` to `opcode` and make them active.
    pub fn set_opcode(&mut self, mask: PositionMask, opcode: DriveOpcode) {
        for slot in self.slots_in(mask) {
            slot.opcode = opcode;
            slot.status = DriveStatus::Pending;
            slot.nop = false;
        }
    }

    /// Force the slots in `mask` to be skipped.
    pub fn set_nop(&mut self, mask: PositionMask) {
        for slot in self.slots_in(mask) {
            slot.nop = true;
        }
    }

    /// Record a status without I/O, e.g. an error inherited from a parent.
    pub fn set_status(&mut self, mask: PositionMask, status: DriveStatus) {
        for slot in self.slots_in(mask) {
            slot.status = status;
        }
    }

    /// Positions not marked nop.
    #[must_use]
    pub fn active(&self) -> PositionMask {
        self.slots
            .iter()
            .filter(|s| !s.nop)
            .map(DriveRequest::position)
            .collect()
    }

    /// Positions whose request is out with the host.
    #[must_use]
    pub fn in_flight(&self) -> PositionMask {
        self.slots
            .iter()
            .filter(|s| s.is_in_flight())
            .map(DriveRequest::position)
            .collect()
    }

    /// Move the buffers of the slots in `mask` into submit-ready I/O.
    pub fn build_io(&mut self, op: OperationId, mask: PositionMask) -> Result<Vec<DriveIo>> {
        let mut ios = Vec::with_capacity(mask.count() as usize);
        for slot in self.slots_in(mask) {
            let Some(mut buffer) = slot.buffer.take() else {
                return Err(VerifyError::invariant(
                    "build_io",
                    format!("{} submitted twice", slot.position),
                ));
            };
            buffer.resize(sector_bytes(slot.range.blocks), 0);
            slot.status = DriveStatus::Pending;
            ios.push(DriveIo {
                op,
                position: slot.position,
                opcode: slot.opcode,
                range: slot.range,
                buffer,
            });
        }
        Ok(ios)
    }

    /// Accept a completion and take back its buffer.
    pub fn complete(&mut self, completion: DriveCompletion) -> Result<()> {
        let Some(slot) = self.slots.get_mut(completion.position.index()) else {
            return Err(VerifyError::invariant(
                "complete",
                format!("completion for {} outside chain", completion.position),
            ));
        };
        if slot.buffer.is_some() {
            return Err(VerifyError::invariant(
                "complete",
                format!("unexpected completion for {}", completion.position),
            ));
        }
        slot.status = completion.status;
        slot.buffer = Some(completion.buffer);
        Ok(())
    }

    /// First `blocks` sectors of one position's buffer, if it is home.
    #[must_use]
    pub fn sectors(&self, pos: Position, blocks: u64) -> Option<&[u8]> {
        let buf = self.slots.get(pos.index())?.buffer.as_ref()?;
        buf.get(..sector_bytes(blocks))
    }

    /// Mutable sector views of every position, `blocks` sectors each.
    pub fn sectors_mut(&mut self, blocks: u64) -> Result<Vec<&mut [u8]>> {
        let len = sector_bytes(blocks);
        let mut views = Vec::with_capacity(self.slots.len());
        for slot in self.slots.iter_mut() {
            let position = slot.position;
            let Some(buf) = slot.buffer.as_mut() else {
                return Err(VerifyError::invariant(
                    "sectors_mut",
                    format!("{position} buffer still in flight"),
                ));
            };
            if buf.len() < len {
                buf.resize(len, 0);
            }
            views.push(&mut buf[..len]);
        }
        Ok(views)
    }

    /// Smallest transfer across non-nop slots, and the position reporting it.
    #[must_use]
    pub fn min_blocks_transferred(&self) -> Option<(Position, u64)> {
        self.slots
            .iter()
            .filter(|s| !s.nop)
            .map(|s| (s.position, s.blocks_transferred()))
            .min_by_key(|&(_, blocks)| blocks)
    }

    fn slots_in(&mut self, mask: PositionMask) -> impl Iterator<Item = &mut DriveRequest> {
        self.slots
            .iter_mut()
            .filter(move |s| mask.contains(s.position))
    }
}

/// Byte length of `blocks` whole sectors.
#[must_use]
pub fn sector_bytes(blocks: u64) -> usize {
    usize::try_from(blocks)
        .unwrap_or(usize::MAX)
        .saturating_mul(SECTOR_BYTES)
}
