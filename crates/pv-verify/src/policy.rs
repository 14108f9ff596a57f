//! Pure decision functions consulted while evaluating a read pass.
//!
//! # Design
//!
//! Both policies are functions of their inputs only. The degraded count is
//! passed in fresh on every call because the owning group can change it
//! while an operation is suspended.

use pv_drive::ErrorBoard;
use pv_error::{Result, VerifyError};
use serde::Serialize;

/// What to do with a read pass that did not fully succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryDecision {
    /// Reissue the retryable positions.
    Retry,
    /// Treat the failed positions as missing and rebuild them from parity.
    AttemptRedundancyRecovery,
    /// Hard media errors need the read-error policy.
    EscalateSingleRegion,
    /// More positions are gone than parity can cover.
    ReportError,
}

/// Retry / degraded-policy controller.
///
/// Recovery through redundancy is allowed while
/// `degraded + retryable + hard_media <= parity_disks` and single-error
/// recovery is not yet active.
#[must_use]
pub fn decide_retry(
    board: &ErrorBoard,
    degraded_count: u32,
    parity_disks: u32,
    single_error_recovery: bool,
) -> RetryDecision {
    if degraded_count + board.dead_count() > parity_disks {
        return RetryDecision::ReportError;
    }
    if board.retry_count() > 0 {
        let unavailable = degraded_count + board.retry_count() + board.hard_media_count();
        return if unavailable <= parity_disks && !single_error_recovery {
            RetryDecision::AttemptRedundancyRecovery
        } else {
            RetryDecision::Retry
        };
    }
    if board.hard_media_count() > 0 {
        RetryDecision::EscalateSingleRegion
    } else {
        RetryDecision::AttemptRedundancyRecovery
    }
}

/// Outcome of the read-error policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadErrorAction {
    /// Carry on into reconstruction as-is.
    Continue,
    /// Degraded verify on an unaligned range: fail with a media error so the
    /// caller retries with an aligned range.
    FailUnaligned,
    /// Enter single-error recovery and narrow to one region, then re-read.
    NarrowToRegion,
    /// Enter single-error recovery and reconstruct the current region.
    ReconstructRegion,
}

/// Inputs to [`read_error_policy`].
#[derive(Debug, Clone, Copy)]
pub struct ReadErrorInputs {
    pub hard_media: u32,
    pub width: u32,
    pub degraded_verify: bool,
    pub aligned: bool,
    pub single_error_recovery: bool,
    pub single_region_mode: bool,
}

pub fn read_error_policy(i: ReadErrorInputs) -> Result<ReadErrorAction> {
    if i.hard_media == 0 {
        return Ok(ReadErrorAction::Continue);
    }
    if i.degraded_verify && !i.aligned {
        return Ok(ReadErrorAction::FailUnaligned);
    }
    if i.hard_media == 1 && !i.single_error_recovery {
        return Ok(ReadErrorAction::Continue);
    }
    if i.hard_media > i.width {
        return Err(VerifyError::invariant(
            "read_error_policy",
            format!("{} hard errors exceed width {}", i.hard_media, i.width),
        ));
    }
    Ok(if i.single_region_mode {
        ReadErrorAction::ReconstructRegion
    } else {
        ReadErrorAction::NarrowToRegion
    })
}
