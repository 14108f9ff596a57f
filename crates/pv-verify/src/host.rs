//! Collaborators a verify operation talks to while it runs.

use crate::lock::LockCoordinator;
use crate::memory::{BufferPool, DeferredGrant};
use crate::report::ErrorReport;
use pv_drive::DriveSubmitter;
use pv_types::{BlockRange, OperationId, Position, PositionMask, RaidGeometry};
use pv_xor::ParityEngine;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Read-only view of the owning redundant group.
///
/// Degraded state is shared and changes underneath running operations, so
/// callers re-query it after every suspension instead of caching it.
pub trait RaidGroupView {
    fn geometry(&self) -> RaidGeometry;

    fn is_position_degraded(&self, pos: Position) -> bool;

    fn is_quiescing(&self) -> bool;

    fn degraded_mask(&self) -> PositionMask {
        self.geometry()
            .all_positions()
            .iter()
            .filter(|p| self.is_position_degraded(*p))
            .collect()
    }

    fn degraded_count(&self) -> u32 {
        self.degraded_mask().count()
    }

    fn parity_disk_count(&self) -> u32 {
        u32::from(self.geometry().parity_disks())
    }
}

/// Diagnostic notice for CRC-class errors found by one operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrcNotice {
    pub op: OperationId,
    pub range: BlockRange,
    pub positions: PositionMask,
    pub single_bit: u32,
    pub multi_bit: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeStatus {
    /// In flight; the host calls `on_notification_complete` later.
    Sent,
    /// Not sent; the operation carries on.
    Skipped,
}

/// Host services: I/O submission plus event, notification and scheduling hooks.
pub trait OperationHost: DriveSubmitter {
    fn record_errors(&mut self, report: &ErrorReport);

    fn notify_crc(&mut self, notice: &CrcNotice) -> NoticeStatus;

    /// Reschedule an operation whose lock was granted.
    fn wake(&mut self, op: OperationId);

    /// Deliver a deferred allocation to its operation.
    fn deliver_allocation(&mut self, grant: DeferredGrant);

    /// Whether a plain verify should start its next sibling now.
    fn should_generate_next(&mut self, _op: OperationId) -> bool {
        false
    }

    fn generate_next(&mut self, _op: OperationId) {}

    fn cancel_generate(&mut self, _op: OperationId) {}
}

/// Everything one scheduling step may touch.
pub struct VerifyContext<'h> {
    pub group: &'h dyn RaidGroupView,
    pub locks: &'h dyn LockCoordinator,
    pub memory: &'h dyn BufferPool,
    pub engine: &'h dyn ParityEngine,
    pub host: &'h mut dyn OperationHost,
}

/// Caller-side handle that asks a running operation to abort.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    pub fn abort(&self) {
        self.0.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}
