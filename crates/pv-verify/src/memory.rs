//! Stripe buffer allocation.
//!
//! A verify operation asks for one buffer per position up front. The pool
//! either grants immediately, defers the request until enough memory is
//! returned, or refuses a request it can never satisfy.

use parking_lot::Mutex;
use pv_types::OperationId;
use std::collections::{HashMap, VecDeque};
use tracing::debug;

/// Answer to an allocation request.
#[derive(Debug)]
pub enum AllocGrant {
    Immediate(Vec<Vec<u8>>),
    /// Queued; a [`DeferredGrant`] follows from [`BufferPool::release`].
    Deferred,
    Failed,
}

/// A deferred request resolved later. `None` means the allocation failed.
#[derive(Debug)]
pub struct DeferredGrant {
    pub op: OperationId,
    pub buffers: Option<Vec<Vec<u8>>>,
}

pub trait BufferPool {
    fn allocate(&self, op: OperationId, positions: usize, bytes_each: usize) -> AllocGrant;

    /// Return an operation's buffers and drop any request it still has
    /// queued; may satisfy other queued requests.
    fn release(&self, op: OperationId, buffers: Vec<Vec<u8>>) -> Vec<DeferredGrant>;
}

#[derive(Debug, Clone, Copy)]
struct Request {
    op: OperationId,
    positions: usize,
    bytes_each: usize,
}

impl Request {
    fn total(self) -> usize {
        self.positions.saturating_mul(self.bytes_each)
    }

    fn buffers(self) -> Vec<Vec<u8>> {
        vec![vec![0; self.bytes_each]; self.positions]
    }
}

#[derive(Debug, Default)]
struct BudgetState {
    in_use: usize,
    reserved: HashMap<OperationId, usize>,
    waiters: VecDeque<Request>,
}

/// Byte-budgeted buffer pool with FIFO deferral.
#[derive(Debug)]
pub struct MemoryBudget {
    capacity: usize,
    state: Mutex<BudgetState>,
}

impl MemoryBudget {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(BudgetState::default()),
        }
    }

    #[must_use]
    pub fn in_use(&self) -> usize {
        self.state.lock().in_use
    }

    #[must_use]
    pub fn waiting(&self) -> usize {
        self.state.lock().waiters.len()
    }

    /// Fail every queued request, e.g. when the pool is torn down.
    pub fn fail_waiters(&self) -> Vec<DeferredGrant> {
        self.state
            .lock()
            .waiters
            .drain(..)
            .map(|r| DeferredGrant {
                op: r.op,
                buffers: None,
            })
            .collect()
    }
}

impl BufferPool for MemoryBudget {
    fn allocate(&self, op: OperationId, positions: usize, bytes_each: usize) -> AllocGrant {
        let req = Request {
            op,
            positions,
            bytes_each,
        };
        if req.total() > self.capacity {
            debug!(
                target: "pv::verify::memory",
                %op,
                bytes = req.total(),
                capacity = self.capacity,
                "allocation_never_fits"
            );
            return AllocGrant::Failed;
        }
        let mut st = self.state.lock();
        if st.waiters.is_empty() && st.in_use + req.total() <= self.capacity {
            st.in_use += req.total();
            st.reserved.insert(op, req.total());
            return AllocGrant::Immediate(req.buffers());
        }
        st.waiters.push_back(req);
        debug!(target: "pv::verify::memory", %op, bytes = req.total(), "allocation_deferred");
        AllocGrant::Deferred
    }

    fn release(&self, op: OperationId, buffers: Vec<Vec<u8>>) -> Vec<DeferredGrant> {
        drop(buffers);
        let mut st = self.state.lock();
        if let Some(bytes) = st.reserved.remove(&op) {
            st.in_use = st.in_use.saturating_sub(bytes);
        }
        st.waiters.retain(|w| w.op != op);
        let mut granted = Vec::new();
        while let Some(&next) = st.waiters.front() {
            if st.in_use + next.total() > self.capacity {
                break;
            }
            st.waiters.pop_front();
            st.in_use += next.total();
            st.reserved.insert(next.op, next.total());
            granted.push(DeferredGrant {
                op: next.op,
                buffers: Some(next.buffers()),
            });
        }
        granted
    }
}
