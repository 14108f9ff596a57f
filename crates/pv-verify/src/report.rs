//! Terminal outcomes and error reports.
//!
//! A verify operation hands its caller one [`VerifyOutcome`]. Separately it
//! emits [`ErrorReport`] records for the event log: one per mined region
//! that found something, and exactly one final report per operation.
//!
//! # Format
//!
//! [`ReportLog`] writes reports as JSON lines and flushes after each one.

use crate::algorithm::VerifyAlgorithm;
use pv_error::Result;
use pv_types::{BlockRange, Lba, OperationId, PositionMask};
use pv_xor::{ErrorRegion, VerifyErrorCounts};
use serde::{Deserialize, Serialize};
use std::io::Write;

// ── Outcome ─────────────────────────────────────────────────────────────────

/// Terminal status handed back to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockStatus {
    Success,
    MediaError,
    IoFailed,
    Aborted,
    AllocationFailed,
    /// Host buffers failed their checksums while merging new data.
    BadMemory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Qualifier {
    None,
    /// Success, and corrections were written.
    CompleteWithRemap,
    DataLost,
    NotReady,
    ClientAborted,
    /// Degraded verify on an unaligned range; retry with an aligned one.
    RetryAligned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyOutcome {
    pub status: BlockStatus,
    pub qualifier: Qualifier,
    /// First block that could not be trusted.
    pub media_error_lba: Option<Lba>,
    /// Corrections reached the drives; a write that failed does not count.
    pub corrected: bool,
    pub errors: VerifyErrorCounts,
}

impl VerifyOutcome {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == BlockStatus::Success
    }
}

// ── Error reports ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub op: OperationId,
    pub algorithm: VerifyAlgorithm,
    /// Range the counts cover.
    pub range: BlockRange,
    pub counts: VerifyErrorCounts,
    pub regions: Vec<ErrorRegion>,
    /// Positions with single- or multi-bit CRC errors.
    pub crc_positions: PositionMask,
    /// Last report of the operation; carries its terminal status.
    pub final_status: Option<BlockStatus>,
}

impl ErrorReport {
    #[must_use]
    pub fn is_final(&self) -> bool {
        self.final_status.is_some()
    }
}

/// Append-only JSONL writer for error reports.
pub struct ReportLog<W: Write> {
    writer: W,
    written: u64,
}

impl<W: Write> ReportLog<W> {
    pub fn new(writer: W) -> Self {
        Self { writer, written: 0 }
    }

    pub fn append(&mut self, report: &ErrorReport) -> Result<()> {
        let line = serde_json::to_string(report).map_err(std::io::Error::from)?;
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        self.written += 1;
        Ok(())
    }

    #[must_use]
    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

/// Parse a JSONL report stream, skipping blank lines.
pub fn parse_reports(text: &str) -> Result<Vec<ErrorReport>> {
    text.lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).map_err(|e| std::io::Error::from(e).into()))
        .collect()
}
