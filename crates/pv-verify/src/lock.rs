//! Lock & upgrade coordinator for stripe ranges.
//!
//! # Design
//!
//! Each operation holds at most one range lock, shared or exclusive.
//! Overlapping holders conflict unless both are shared. Requests that
//! conflict are queued, and [`LockCoordinator::release`] grants queued
//! requests in order, upgrade requests first, returning the operations it
//! woke so the host can reschedule them.
//!
//! Upgrade ownership is tracked apart from the locks themselves: an
//! operation marks itself owner once its upgrade is granted, or implicitly
//! when it runs on a path that never upgrades. A queued upgrade holds back
//! every later non-upgrade request overlapping it, except from operations
//! that already hold a lock or own an upgrade, so a stream of readers cannot
//! starve the upgrader.
//!
//! A second request from a holder widens its lock to the span of both
//! ranges; conflicts are checked against that whole span.

use parking_lot::Mutex;
use pv_types::{BlockRange, OperationId};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockGrant {
    Granted,
    /// Queued; the operation is woken when the lock is granted.
    Waiting,
}

/// Range locking consumed by verify operations.
pub trait LockCoordinator {
    /// Take `range` in `mode`, or queue behind conflicting holders.
    fn acquire_or_enqueue(&self, op: OperationId, range: BlockRange, mode: LockMode) -> LockGrant;

    /// Convert the operation's lock to exclusive over `range`.
    fn upgrade_or_enqueue(&self, op: OperationId, range: BlockRange) -> LockGrant;

    /// The operation holds `range` in at least `mode`.
    fn holds(&self, op: OperationId, range: BlockRange, mode: LockMode) -> bool;

    fn is_upgrade_owner(&self, op: OperationId) -> bool;

    fn mark_upgrade_owner(&self, op: OperationId);

    /// Drop everything the operation holds or waits for.
    fn release(&self, op: OperationId) -> Vec<OperationId>;
}

#[derive(Debug, Clone, Copy)]
struct Holder {
    op: OperationId,
    range: BlockRange,
    mode: LockMode,
}

#[derive(Debug, Clone, Copy)]
struct Waiter {
    op: OperationId,
    range: BlockRange,
    mode: LockMode,
    upgrade: bool,
}

#[derive(Debug, Default)]
struct TableState {
    holders: Vec<Holder>,
    waiters: VecDeque<Waiter>,
    upgrade_owners: HashSet<OperationId>,
}

impl TableState {
    fn holder(&self, op: OperationId) -> Option<&Holder> {
        self.holders.iter().find(|h| h.op == op)
    }

    fn conflicts(&self, op: OperationId, range: BlockRange, mode: LockMode) -> bool {
        self.holders.iter().any(|h| {
            h.op != op
                && h.range.overlaps(range)
                && (mode == LockMode::Exclusive || h.mode == LockMode::Exclusive)
        })
    }

    /// Range `op` would hold after taking `range`.
    fn target(&self, op: OperationId, range: BlockRange) -> BlockRange {
        self.holder(op).map_or(range, |h| span(h.range, range))
    }

    /// A queued upgrade overlapping `range` that `op` may not overtake.
    fn behind_upgrade(&self, op: OperationId, range: BlockRange) -> bool {
        self.holder(op).is_none()
            && !self.upgrade_owners.contains(&op)
            && self
                .waiters
                .iter()
                .any(|w| w.upgrade && w.op != op && w.range.overlaps(range))
    }

    fn must_wait(&self, op: OperationId, range: BlockRange, mode: LockMode, upgrade: bool) -> bool {
        let target = self.target(op, range);
        self.conflicts(op, target, mode) || (!upgrade && self.behind_upgrade(op, target))
    }

    /// Install or widen the operation's lock.
    fn grant(&mut self, op: OperationId, range: BlockRange, mode: LockMode) {
        if let Some(h) = self.holders.iter_mut().find(|h| h.op == op) {
            h.range = span(h.range, range);
            if mode == LockMode::Exclusive {
                h.mode = LockMode::Exclusive;
            }
        } else {
            self.holders.push(Holder { op, range, mode });
        }
    }
}

/// Smallest range covering both.
fn span(a: BlockRange, b: BlockRange) -> BlockRange {
    let start = a.start.min(b.start);
    let end = a.end().max(b.end());
    BlockRange::new(start, end.0 - start.0)
}

fn covers(outer: BlockRange, inner: BlockRange) -> bool {
    outer.start <= inner.start && outer.end() >= inner.end()
}

/// In-memory range lock table.
#[derive(Debug, Default)]
pub struct RangeLockTable {
    state: Mutex<TableState>,
}

impl RangeLockTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of queued requests.
    #[must_use]
    pub fn waiting(&self) -> usize {
        self.state.lock().waiters.len()
    }

    /// Range currently held by `op`, if any.
    #[must_use]
    pub fn held_range(&self, op: OperationId) -> Option<(BlockRange, LockMode)> {
        self.state.lock().holder(op).map(|h| (h.range, h.mode))
    }

    fn request(&self, op: OperationId, range: BlockRange, mode: LockMode, upgrade: bool) -> LockGrant {
        let mut st = self.state.lock();
        if st.must_wait(op, range, mode, upgrade) {
            st.waiters.push_back(Waiter {
                op,
                range,
                mode,
                upgrade,
            });
            debug!(target: "pv::verify::lock", %op, %range, ?mode, upgrade, "lock_queued");
            return LockGrant::Waiting;
        }
        st.grant(op, range, mode);
        trace!(target: "pv::verify::lock", %op, %range, ?mode, upgrade, "lock_granted");
        LockGrant::Granted
    }
}

impl LockCoordinator for RangeLockTable {
    fn acquire_or_enqueue(&self, op: OperationId, range: BlockRange, mode: LockMode) -> LockGrant {
        if self.holds(op, range, mode) {
            return LockGrant::Granted;
        }
        self.request(op, range, mode, false)
    }

    fn upgrade_or_enqueue(&self, op: OperationId, range: BlockRange) -> LockGrant {
        if self.holds(op, range, LockMode::Exclusive) {
            return LockGrant::Granted;
        }
        self.request(op, range, LockMode::Exclusive, true)
    }

    fn holds(&self, op: OperationId, range: BlockRange, mode: LockMode) -> bool {
        self.state.lock().holder(op).is_some_and(|h| {
            covers(h.range, range) && (mode == LockMode::Shared || h.mode == LockMode::Exclusive)
        })
    }

    fn is_upgrade_owner(&self, op: OperationId) -> bool {
        self.state.lock().upgrade_owners.contains(&op)
    }

    fn mark_upgrade_owner(&self, op: OperationId) {
        self.state.lock().upgrade_owners.insert(op);
    }

    fn release(&self, op: OperationId) -> Vec<OperationId> {
        let mut st = self.state.lock();
        st.holders.retain(|h| h.op != op);
        st.waiters.retain(|w| w.op != op);
        st.upgrade_owners.remove(&op);

        let mut order: Vec<Waiter> = st.waiters.iter().filter(|w| w.upgrade).copied().collect();
        order.extend(st.waiters.iter().filter(|w| !w.upgrade).copied());

        let mut woken = Vec::new();
        for w in order {
            if st.must_wait(w.op, w.range, w.mode, w.upgrade) {
                continue;
            }
            st.waiters.retain(|q| q.op != w.op);
            st.grant(w.op, w.range, w.mode);
            woken.push(w.op);
        }
        debug!(target: "pv::verify::lock", %op, woken = woken.len(), "lock_released");
        woken
    }
}
