#![forbid(unsafe_code)]
//! Test harness for verify operations.
//!
//! # Design
//!
//! [`Harness`] owns one simulated group together with the lock table,
//! memory budget, parity engine and recording host a [`VerifyOperation`]
//! needs. Operations borrow their parents, so the harness never owns them:
//! callers keep parents and operations on their own stack and hand the
//! operations in as a slice.
//!
//! One scheduling round runs every unfinished operation until it suspends,
//! then delivers everything the host queued: drive I/O is executed against
//! the [`SimGroup`] and routed back as completions, deferred allocations and
//! notification acknowledgements go to their owners. Rounds repeat until
//! every operation finished; a round that changes nothing is a stall.

pub mod host;
pub mod scenario;
pub mod sim;

pub use host::{IoRecord, SimHost};
pub use scenario::{run_scenario, OpResult, ScenarioConfig, ScenarioOp, ScenarioResult};
pub use sim::{Fault, SimGroup};

use anyhow::{bail, Context, Result};
use pv_types::{OperationId, RaidGeometry};
use pv_verify::{
    MemoryBudget, RangeLockTable, RunStatus, VerifyConfig, VerifyContext, VerifyOperation,
    VerifyState, WaitReason,
};
use pv_xor::SectorXorEngine;
use tracing::{debug, warn};

const MAX_ROUNDS: usize = 100_000;

/// Group, collaborators and host for a set of verify operations.
pub struct Harness {
    pub group: SimGroup,
    pub locks: RangeLockTable,
    pub memory: MemoryBudget,
    pub engine: SectorXorEngine,
    pub host: SimHost,
    pub config: VerifyConfig,
    /// Operations whose `run` returned an error.
    pub faults: Vec<(OperationId, String)>,
    next_id: u64,
}

impl Harness {
    /// Fresh group formatted with the `seed` pattern.
    pub fn new(geometry: RaidGeometry, memory_bytes: usize, seed: u64) -> Result<Self> {
        let engine = SectorXorEngine::new(geometry).context("building parity engine")?;
        let group = SimGroup::new(geometry);
        group.format(seed);
        Ok(Self {
            group,
            locks: RangeLockTable::new(),
            memory: MemoryBudget::new(memory_bytes),
            engine,
            host: SimHost::default(),
            config: VerifyConfig::default(),
            faults: Vec::new(),
            next_id: 1,
        })
    }

    pub fn next_id(&mut self) -> OperationId {
        let id = OperationId(self.next_id);
        self.next_id += 1;
        id
    }

    pub fn context(&mut self) -> VerifyContext<'_> {
        VerifyContext {
            group: &self.group,
            locks: &self.locks,
            memory: &self.memory,
            engine: &self.engine,
            host: &mut self.host,
        }
    }

    /// Run one operation until it suspends or completes.
    pub fn run_op(&mut self, op: &mut VerifyOperation<'_>) -> pv_error::Result<RunStatus> {
        let mut ctx = self.context();
        op.run(&mut ctx)
    }

    /// Execute queued I/O and route completions, grants and notification
    /// acknowledgements. Returns whether anything was delivered.
    pub fn deliver(&mut self, ops: &mut [VerifyOperation<'_>]) -> Result<bool> {
        let mut delivered = false;
        while let Some(io) = self.host.queue.pop_front() {
            let completion = self.group.process(io);
            let op = find(ops, completion.op)?;
            op.on_drive_complete(completion)
                .with_context(|| format!("routing completion to {}", op.id()))?;
            delivered = true;
        }
        for grant in std::mem::take(&mut self.host.grants) {
            find(ops, grant.op)?.on_allocation(grant.buffers);
            delivered = true;
        }
        for id in std::mem::take(&mut self.host.pending_notices) {
            find(ops, id)?.on_notification_complete();
            delivered = true;
        }
        Ok(delivered)
    }

    /// Run every unfinished operation once. Returns whether any of them
    /// moved. A faulted operation is recorded in [`Harness::faults`].
    pub fn step_all(&mut self, ops: &mut [VerifyOperation<'_>]) -> bool {
        let mut moved = false;
        for op in ops.iter_mut().filter(|op| !op.is_finished()) {
            let before = (op.state(), op.waiting_on());
            match self.run_op(op) {
                Ok(_) => {}
                Err(err) => {
                    warn!(target: "pv::harness", op = %op.id(), error = %err, "operation_faulted");
                    self.faults.push((op.id(), err.to_string()));
                }
            }
            moved |= before != (op.state(), op.waiting_on()) || op.is_finished();
        }
        moved
    }

    /// Drive a single operation to completion.
    pub fn drive(&mut self, op: &mut VerifyOperation<'_>) -> Result<()> {
        self.drive_all(std::slice::from_mut(op))
    }

    /// Schedule rounds until every operation finished.
    pub fn drive_all(&mut self, ops: &mut [VerifyOperation<'_>]) -> Result<()> {
        for round in 0..MAX_ROUNDS {
            let moved = self.step_all(ops);
            let delivered = self.deliver(ops)?;
            if ops.iter().all(VerifyOperation::is_finished) {
                debug!(target: "pv::harness", rounds = round + 1, ios = self.host.io_log.len(), "operations_drained");
                return Ok(());
            }
            if !moved && !delivered {
                let stuck: Vec<(OperationId, VerifyState, Option<WaitReason>)> = ops
                    .iter()
                    .filter(|op| !op.is_finished())
                    .map(|op| (op.id(), op.state(), op.waiting_on()))
                    .collect();
                bail!("operations stalled: {stuck:?}");
            }
        }
        bail!("operations still running after {MAX_ROUNDS} rounds")
    }
}

fn find<'a, 'p>(
    ops: &'a mut [VerifyOperation<'p>],
    id: OperationId,
) -> Result<&'a mut VerifyOperation<'p>> {
    match ops.iter_mut().find(|op| op.id() == id) {
        Some(op) => Ok(op),
        None => bail!("no operation {id} in this harness"),
    }
}
