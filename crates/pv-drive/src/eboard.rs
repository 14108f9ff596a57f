//! Error board: a per-evaluation classification of a request chain.
//!
//! The board is rebuilt every time a verify operation evaluates its chain.
//! Degraded positions are excluded before classification, so a position is
//! never both degraded and counted as an error. Every classified position
//! lands in exactly one category.

use crate::{DriveRequest, DriveStatus, RequestChain};
use pv_error::{Result, VerifyError};
use pv_types::{Lba, PositionMask};
use serde::Serialize;

/// Overall verdict for one chain evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainStatus {
    Success,
    /// At least one position may succeed if reissued.
    Retry,
    /// Media errors or newly dead positions within redundancy.
    Error,
    /// Unavailable positions exceed what parity can cover.
    Shutdown,
    /// A request was cancelled on the client's behalf.
    Aborted,
}

/// Disjoint error categories for one evaluation of a request chain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ErrorBoard {
    pub hard_media: PositionMask,
    pub soft_media: PositionMask,
    pub dead: PositionMask,
    pub retry: PositionMask,
    pub aborted: PositionMask,
    /// Write requests that completed cleanly.
    pub write_completed: PositionMask,
    /// Lowest bad LBA among hard media errors.
    pub first_media_lba: Option<Lba>,
}

impl ErrorBoard {
    /// Classify every non-nop, non-degraded slot of `chain`.
    ///
    /// A retryable position that already used `max_retries` reissues is
    /// counted as dead. Pending slots are an invariant violation: the board
    /// is only built once every issued request has completed.
    pub fn scan(chain: &RequestChain, degraded: PositionMask, max_retries: u32) -> Result<Self> {
        let mut board = Self::default();
        for req in chain.iter().filter(|r| !r.is_nop() && !degraded.contains(r.position())) {
            board.classify(req, max_retries)?;
        }
        board.validate(chain.width())?;
        Ok(board)
    }

    fn classify(&mut self, req: &DriveRequest, max_retries: u32) -> Result<()> {
        let pos = req.position();
        match req.status() {
            DriveStatus::Pending => {
                return Err(VerifyError::invariant(
                    "error_board",
                    format!("{pos} still pending at evaluation"),
                ));
            }
            DriveStatus::Success => {
                if req.opcode().is_write() {
                    self.write_completed.insert(pos);
                }
            }
            DriveStatus::SoftMediaError => self.soft_media.insert(pos),
            DriveStatus::MediaError { bad_lba } => {
                self.hard_media.insert(pos);
                self.first_media_lba = Some(self.first_media_lba.map_or(bad_lba, |l| l.min(bad_lba)));
            }
            DriveStatus::Dead => self.dead.insert(pos),
            DriveStatus::Retryable if req.retries() >= max_retries => self.dead.insert(pos),
            DriveStatus::Retryable => self.retry.insert(pos),
            DriveStatus::Aborted => self.aborted.insert(pos),
        }
        Ok(())
    }

    fn validate(&self, width: usize) -> Result<()> {
        let total = self.hard_media.count()
            + self.soft_media.count()
            + self.dead.count()
            + self.retry.count()
            + self.aborted.count();
        if total as usize > width {
            return Err(VerifyError::invariant(
                "error_board",
                format!("{total} classified errors exceed width {width}"),
            ));
        }
        Ok(())
    }

    /// Verdict given the group's current degraded count and parity width.
    #[must_use]
    pub fn status(&self, degraded_count: u32, parity_disks: u32) -> ChainStatus {
        if !self.aborted.is_empty() {
            ChainStatus::Aborted
        } else if degraded_count + self.dead.count() > parity_disks {
            ChainStatus::Shutdown
        } else if !self.retry.is_empty() {
            ChainStatus::Retry
        } else if !self.hard_media.is_empty() || !self.dead.is_empty() {
            ChainStatus::Error
        } else {
            ChainStatus::Success
        }
    }

    #[must_use]
    pub fn hard_media_count(&self) -> u32 {
        self.hard_media.count()
    }

    #[must_use]
    pub fn soft_media_count(&self) -> u32 {
        self.soft_media.count()
    }

    #[must_use]
    pub fn retry_count(&self) -> u32 {
        self.retry.count()
    }

    #[must_use]
    pub fn dead_count(&self) -> u32 {
        self.dead.count()
    }

    /// Every position carrying some error.
    #[must_use]
    pub fn errored(&self) -> PositionMask {
        self.hard_media | self.soft_media | self.dead | self.retry | self.aborted
    }
}
