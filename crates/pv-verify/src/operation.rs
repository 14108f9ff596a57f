//! The verify operation state machine.
//!
//! # Design
//!
//! A [`VerifyOperation`] is a tagged state plus one step function. Each call
//! to [`VerifyOperation::run`] steps until the operation either suspends on
//! an external event or completes. Suspension never blocks a thread: the
//! operation records *why* it is waiting, the host delivers the event through
//! one of the `on_*` methods, and the next `run` re-checks the wait before
//! stepping again.
//!
//! ```text
//! Start ─► AwaitUpgrade ─► AcquireRange ─► Setup ─► (Allocated) ─► IssueReads
//!                                                                    │
//!    ┌──────────────── NextRegion ◄─────────────┐                    ▼
//!    │                     ▲                    │               EvaluateReads
//!    ▼                     │                    │                    │
//! IssueReads       EvaluateWrites ◄── FinishWrite ◄── RecoveryWrite  ▼
//!                          ▲                              ▲     Reconstruct
//!                          └──── WriteBackDecision ◄──────┴── HandleStripResult
//!
//! … ─► MediaErrorOnWrite ─► Finalize ─► Report ─► (NotifyWait) ─► Complete
//! ```
//!
//! Degraded state is re-read from the group at every state that acts on
//! it, never cached across a suspension. Any impossible combination is
//! returned as [`VerifyError::Invariant`]; `run` then faults the operation,
//! releases its lock and buffers, and never produces an outcome.

use crate::algorithm::{RecoveryKind, VerifyAlgorithm, VerifyEntry};
use crate::config::VerifyConfig;
use crate::host::{AbortHandle, CrcNotice, NoticeStatus, VerifyContext};
use crate::lock::{LockGrant, LockMode};
use crate::memory::AllocGrant;
use crate::parent::{ParentOpcode, ParentRequest};
use crate::policy::{decide_retry, read_error_policy, ReadErrorAction, ReadErrorInputs, RetryDecision};
use crate::region::region_mining_count;
use crate::report::{BlockStatus, ErrorReport, Qualifier, VerifyOutcome};
use pv_drive::{sector_bytes, ChainStatus, DriveCompletion, DriveOpcode, DriveStatus, ErrorBoard, RequestChain};
use pv_error::{Result, VerifyError};
use pv_types::{BlockRange, Lba, OperationId, PositionMask, SECTOR_BYTES};
use pv_xor::{ErrorRegion, HostData, ParityEngine, StripRequest, StripResult, VerifyErrorCounts, XorStatus};
use serde::Serialize;
use std::fmt;
use tracing::{debug, error, info, trace, warn};

// ── States ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyState {
    Start,
    AwaitUpgrade,
    AcquireRange,
    Setup,
    Allocated,
    IssueReads,
    EvaluateReads,
    Reconstruct,
    HandleStripResult,
    RecoveryWrite,
    FinishWrite,
    WriteBackDecision,
    EvaluateWrites,
    NextRegion,
    MediaErrorOnWrite,
    Finalize,
    Report,
    NotifyWait,
    Complete,
    Faulted,
}

impl VerifyState {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::AwaitUpgrade => "await_upgrade",
            Self::AcquireRange => "acquire_range",
            Self::Setup => "setup",
            Self::Allocated => "allocated",
            Self::IssueReads => "issue_reads",
            Self::EvaluateReads => "evaluate_reads",
            Self::Reconstruct => "reconstruct",
            Self::HandleStripResult => "handle_strip_result",
            Self::RecoveryWrite => "recovery_write",
            Self::FinishWrite => "finish_write",
            Self::WriteBackDecision => "write_back_decision",
            Self::EvaluateWrites => "evaluate_writes",
            Self::NextRegion => "next_region",
            Self::MediaErrorOnWrite => "media_error_on_write",
            Self::Finalize => "finalize",
            Self::Report => "report",
            Self::NotifyWait => "notify_wait",
            Self::Complete => "complete",
            Self::Faulted => "faulted",
        }
    }
}

impl fmt::Display for VerifyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// External event a suspended operation is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitReason {
    Allocation,
    Io,
    Lock,
    /// Deferred allocation arrived while the group was quiescing.
    Quiesce,
    Notification,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Waiting(WaitReason),
    Done,
}

enum Step {
    Continue,
    Wait(WaitReason),
    Done,
}

#[derive(Debug, Clone, Copy, Default)]
struct Flags {
    wrote_corrections: bool,
    /// A write pass carrying corrections completed without media errors.
    corrections_landed: bool,
    single_error_recovery: bool,
    single_region_mode: bool,
    upgrade_owner: bool,
    /// Errors inherited from the parent are pending evaluation.
    error_pending: bool,
    inherited: bool,
    checksum_retried: bool,
    notification_done: bool,
    reported_final: bool,
}

// ── Operation ───────────────────────────────────────────────────────────────

/// One verify or recovery-verify over a stripe range.
pub struct VerifyOperation<'p> {
    id: OperationId,
    algorithm: VerifyAlgorithm,
    config: VerifyConfig,
    parent: &'p mut ParentRequest,
    state: VerifyState,
    wait: Option<WaitReason>,
    abort: AbortHandle,

    /// Whole (possibly aligned) range the operation locks and reports on.
    range: BlockRange,
    parity_start: Lba,
    parity_count: u64,
    xfer_count: u64,
    width: u16,

    error: Option<(BlockStatus, Qualifier)>,
    media_error_lba: Option<Lba>,
    flags: Flags,
    lock_mode: LockMode,

    chain: RequestChain,
    wait_count: usize,
    board: ErrorBoard,
    strip: StripResult,
    pending_grant: Option<Option<Vec<Vec<u8>>>>,

    pass_counts: VerifyErrorCounts,
    pass_regions: Vec<ErrorRegion>,
    pass_crc: PositionMask,
    totals: VerifyErrorCounts,
    crc_positions: PositionMask,

    outcome: Option<VerifyOutcome>,
}

impl<'p> VerifyOperation<'p> {
    /// Create an operation running `algorithm` on behalf of `parent`.
    ///
    /// Nothing is validated until the first `run`.
    pub fn new(
        id: OperationId,
        algorithm: VerifyAlgorithm,
        parent: &'p mut ParentRequest,
        config: VerifyConfig,
    ) -> Self {
        let range = parent.range;
        Self {
            id,
            algorithm,
            config,
            parent,
            state: VerifyState::Start,
            wait: None,
            abort: AbortHandle::default(),
            range,
            parity_start: range.start,
            parity_count: 0,
            xfer_count: 0,
            width: 0,
            error: None,
            media_error_lba: None,
            flags: Flags::default(),
            lock_mode: LockMode::Exclusive,
            chain: RequestChain::new(0),
            wait_count: 0,
            board: ErrorBoard::default(),
            strip: StripResult::default(),
            pending_grant: None,
            pass_counts: VerifyErrorCounts::default(),
            pass_regions: Vec::new(),
            pass_crc: PositionMask::EMPTY,
            totals: VerifyErrorCounts::default(),
            crc_positions: PositionMask::EMPTY,
            outcome: None,
        }
    }

    /// Create an operation for a verify requested through `entry`, picking
    /// the algorithm from the parent.
    pub fn for_entry(
        id: OperationId,
        entry: VerifyEntry,
        parent: &'p mut ParentRequest,
        config: VerifyConfig,
    ) -> Result<Self> {
        config.validate()?;
        let algorithm = VerifyAlgorithm::resolve(entry, parent.algorithm)?;
        Ok(Self::new(id, algorithm, parent, config))
    }

    #[must_use]
    pub fn id(&self) -> OperationId {
        self.id
    }

    #[must_use]
    pub fn algorithm(&self) -> VerifyAlgorithm {
        self.algorithm
    }

    #[must_use]
    pub fn state(&self) -> VerifyState {
        self.state
    }

    #[must_use]
    pub fn waiting_on(&self) -> Option<WaitReason> {
        self.wait
    }

    /// Terminal outcome, once the operation completed.
    #[must_use]
    pub fn outcome(&self) -> Option<&VerifyOutcome> {
        self.outcome.as_ref()
    }

    #[must_use]
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Sub-range the current pass works on.
    #[must_use]
    pub fn active_range(&self) -> BlockRange {
        BlockRange::new(self.parity_start, self.parity_count)
    }

    #[must_use]
    pub fn xfer_count(&self) -> u64 {
        self.xfer_count
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        matches!(self.state, VerifyState::Complete | VerifyState::Faulted)
    }

    // ── Host events ─────────────────────────────────────────────────────────

    /// Accept one drive completion. Returns true once every outstanding
    /// request is home and the operation is ready to run.
    ///
    /// A rejected completion leaves the operation untouched.
    pub fn on_drive_complete(&mut self, completion: DriveCompletion) -> Result<bool> {
        if completion.op != self.id {
            return Err(VerifyError::invariant(
                "drive_complete",
                format!("{} completion routed to {}", completion.op, self.id),
            ));
        }
        if self.wait_count == 0 {
            return Err(VerifyError::invariant(
                "drive_complete",
                format!("{} completion with nothing outstanding", completion.position),
            ));
        }
        self.chain.complete(completion)?;
        self.wait_count -= 1;
        Ok(self.wait_count == 0)
    }

    /// Deliver a deferred allocation. `None` means it failed.
    pub fn on_allocation(&mut self, buffers: Option<Vec<Vec<u8>>>) {
        self.pending_grant = Some(buffers);
    }

    pub fn on_notification_complete(&mut self) {
        self.flags.notification_done = true;
    }

    // ── Driver ──────────────────────────────────────────────────────────────

    /// Step until the operation suspends or completes.
    pub fn run(&mut self, ctx: &mut VerifyContext<'_>) -> Result<RunStatus> {
        match self.state {
            VerifyState::Complete => return Ok(RunStatus::Done),
            VerifyState::Faulted => {
                return Err(VerifyError::invariant("run", format!("{} already faulted", self.id)));
            }
            _ => {}
        }
        if let Some(reason) = self.wait {
            if !self.wait_satisfied(reason, ctx) {
                return Ok(RunStatus::Waiting(reason));
            }
            self.wait = None;
        }
        loop {
            match self.step(ctx) {
                Ok(Step::Continue) => {}
                Ok(Step::Wait(reason)) => {
                    self.wait = Some(reason);
                    return Ok(RunStatus::Waiting(reason));
                }
                Ok(Step::Done) => return Ok(RunStatus::Done),
                Err(err) => {
                    self.fault(ctx, &err);
                    return Err(err);
                }
            }
        }
    }

    fn wait_satisfied(&self, reason: WaitReason, ctx: &VerifyContext<'_>) -> bool {
        match reason {
            WaitReason::Allocation => self.pending_grant.is_some(),
            WaitReason::Io => self.wait_count == 0,
            WaitReason::Lock => ctx.locks.holds(self.id, self.range, self.lock_mode),
            WaitReason::Quiesce => !ctx.group.is_quiescing() || self.abort.is_aborted(),
            WaitReason::Notification => self.flags.notification_done,
        }
    }

    fn step(&mut self, ctx: &mut VerifyContext<'_>) -> Result<Step> {
        if self.parity_count > self.xfer_count {
            return Err(VerifyError::invariant(
                self.state.name(),
                format!("parity_count {} > xfer_count {}", self.parity_count, self.xfer_count),
            ));
        }
        match self.state {
            VerifyState::Start => self.start(ctx),
            VerifyState::AwaitUpgrade => self.await_upgrade(ctx),
            VerifyState::AcquireRange => Ok(self.acquire_range(ctx)),
            VerifyState::Setup => self.setup(ctx),
            VerifyState::Allocated => self.allocated(ctx),
            VerifyState::IssueReads => self.issue_reads(ctx),
            VerifyState::EvaluateReads => self.evaluate_reads(ctx),
            VerifyState::Reconstruct => self.reconstruct(ctx),
            VerifyState::HandleStripResult => self.handle_strip_result(ctx),
            VerifyState::RecoveryWrite => self.recovery_write(ctx),
            VerifyState::FinishWrite => self.finish_write(ctx),
            VerifyState::WriteBackDecision => self.write_back_decision(ctx),
            VerifyState::EvaluateWrites => self.evaluate_writes(ctx),
            VerifyState::NextRegion => self.next_region(ctx),
            VerifyState::MediaErrorOnWrite => self.media_error_on_write(),
            VerifyState::Finalize => self.finalize(ctx),
            VerifyState::Report => self.report(ctx),
            VerifyState::NotifyWait => Ok(self.goto(VerifyState::Complete)),
            VerifyState::Complete => Ok(self.complete(ctx)),
            VerifyState::Faulted => Err(VerifyError::invariant("step", "stepping a faulted operation")),
        }
    }

    fn goto(&mut self, next: VerifyState) -> Step {
        trace!(
            target: "pv::verify::state",
            op = %self.id,
            from = self.state.name(),
            to = next.name(),
            "state_transition"
        );
        self.state = next;
        Step::Continue
    }

    fn suspend(&mut self, next: VerifyState, reason: WaitReason) -> Step {
        trace!(
            target: "pv::verify::state",
            op = %self.id,
            from = self.state.name(),
            to = next.name(),
            ?reason,
            "state_suspended"
        );
        self.state = next;
        Step::Wait(reason)
    }

    fn fail(&mut self, status: BlockStatus, qualifier: Qualifier) {
        self.error = Some((status, qualifier));
    }

    fn fault(&mut self, ctx: &mut VerifyContext<'_>, err: &VerifyError) {
        error!(
            target: "pv::verify::state",
            op = %self.id,
            algorithm = %self.algorithm,
            state = self.state.name(),
            parity_start = self.parity_start.0,
            parity_count = self.parity_count,
            xfer_count = self.xfer_count,
            wait_count = self.wait_count,
            error = %err,
            "verify_faulted"
        );
        self.state = VerifyState::Faulted;
        self.wait = None;
        self.release_resources(ctx);
    }

    // ── Entry ───────────────────────────────────────────────────────────────

    fn start(&mut self, ctx: &mut VerifyContext<'_>) -> Result<Step> {
        if !self.algorithm.accepts_parent(self.parent.algorithm) {
            return Err(VerifyError::invariant(
                "start",
                format!("{} cannot serve a {:?} parent", self.algorithm, self.parent.algorithm),
            ));
        }
        let geometry = ctx.group.geometry();
        let requested = self.parent.range;
        if requested.is_empty() || !geometry.contains(requested) {
            return Err(VerifyError::InvalidRequest(format!(
                "range {requested} outside group of {} blocks",
                geometry.capacity()
            )));
        }
        self.range = if self.algorithm.aligns_range() {
            requested.expand_to(geometry.optimal_block_size(), geometry.capacity())
        } else {
            requested
        };
        self.width = geometry.width();
        self.chain = RequestChain::new(self.width);
        self.parity_start = self.range.start;
        self.xfer_count = self.range.blocks;
        self.parity_count = self.xfer_count.min(self.config.max_blocks_per_pass);
        self.lock_mode = if self.parent.opcode.is_shared() {
            LockMode::Shared
        } else {
            LockMode::Exclusive
        };
        debug!(
            target: "pv::verify::state",
            op = %self.id,
            algorithm = %self.algorithm,
            %requested,
            range = %self.range,
            lock = ?self.lock_mode,
            "verify_started"
        );

        if self.algorithm.is_degraded_verify() {
            ctx.locks.mark_upgrade_owner(self.id);
            self.flags.upgrade_owner = true;
            return Ok(self.goto(VerifyState::AcquireRange));
        }
        if self.algorithm.aligns_range() && self.lock_mode == LockMode::Exclusive {
            return Ok(match ctx.locks.upgrade_or_enqueue(self.id, self.range) {
                LockGrant::Granted => self.goto(VerifyState::AwaitUpgrade),
                LockGrant::Waiting => self.suspend(VerifyState::AwaitUpgrade, WaitReason::Lock),
            });
        }
        Ok(self.goto(VerifyState::AcquireRange))
    }

    fn await_upgrade(&mut self, ctx: &mut VerifyContext<'_>) -> Result<Step> {
        if self.flags.upgrade_owner || ctx.locks.is_upgrade_owner(self.id) {
            return Err(VerifyError::invariant(
                "await_upgrade",
                format!("{} is already upgrade owner", self.id),
            ));
        }
        ctx.locks.mark_upgrade_owner(self.id);
        self.flags.upgrade_owner = true;
        Ok(self.goto(VerifyState::AcquireRange))
    }

    fn acquire_range(&mut self, ctx: &mut VerifyContext<'_>) -> Step {
        match ctx.locks.acquire_or_enqueue(self.id, self.range, self.lock_mode) {
            LockGrant::Granted => self.goto(VerifyState::Setup),
            LockGrant::Waiting => self.suspend(VerifyState::Setup, WaitReason::Lock),
        }
    }

    fn setup(&mut self, ctx: &mut VerifyContext<'_>) -> Result<Step> {
        let bytes = sector_bytes(self.parity_count);
        match ctx.memory.allocate(self.id, usize::from(self.width), bytes) {
            AllocGrant::Immediate(buffers) => {
                self.plant(buffers)?;
                Ok(self.goto(VerifyState::IssueReads))
            }
            AllocGrant::Deferred => Ok(self.suspend(VerifyState::Allocated, WaitReason::Allocation)),
            AllocGrant::Failed => {
                warn!(target: "pv::verify::state", op = %self.id, bytes, "allocation_failed");
                self.fail(BlockStatus::AllocationFailed, Qualifier::None);
                Ok(self.goto(VerifyState::Report))
            }
        }
    }

    fn allocated(&mut self, ctx: &mut VerifyContext<'_>) -> Result<Step> {
        if self.abort.is_aborted() {
            return Ok(self.abort_path(None));
        }
        if ctx.group.is_quiescing() {
            debug!(target: "pv::verify::state", op = %self.id, "allocation_parked_for_quiesce");
            return Ok(self.suspend(VerifyState::Allocated, WaitReason::Quiesce));
        }
        match self.pending_grant.take() {
            Some(Some(buffers)) => {
                self.plant(buffers)?;
                Ok(self.goto(VerifyState::IssueReads))
            }
            Some(None) => {
                warn!(target: "pv::verify::state", op = %self.id, "deferred_allocation_failed");
                self.fail(BlockStatus::AllocationFailed, Qualifier::None);
                Ok(self.goto(VerifyState::Report))
            }
            None => Err(VerifyError::invariant("allocated", "resumed without an allocation")),
        }
    }

    fn plant(&mut self, buffers: Vec<Vec<u8>>) -> Result<()> {
        self.chain.plant_buffers(buffers)?;
        self.reset_chain();
        Ok(())
    }

    fn reset_chain(&mut self) {
        self.chain.reset(DriveOpcode::Read, self.active_range());
    }

    // ── Reads ───────────────────────────────────────────────────────────────

    fn issue_reads(&mut self, ctx: &mut VerifyContext<'_>) -> Result<Step> {
        if self.abort.is_aborted() {
            return Ok(self.abort_path(None));
        }
        let degraded = ctx.group.degraded_mask();
        self.chain.set_nop(degraded);
        let mut issue = self.chain.active();

        if self.algorithm == VerifyAlgorithm::RecoveryVerify(RecoveryKind::ForRead)
            && !self.flags.single_error_recovery
            && !self.flags.inherited
        {
            self.flags.inherited = true;
            let inherited = self.parent.retryable & issue;
            if !inherited.is_empty() {
                self.chain.set_status(inherited, DriveStatus::Retryable);
                self.flags.error_pending = true;
                issue = issue - inherited;
                debug!(
                    target: "pv::verify::state",
                    op = %self.id,
                    positions = %inherited,
                    "parent_retryable_errors_inherited"
                );
            }
        }

        let sibling = self.algorithm.is_plain_verify()
            && !self.flags.single_region_mode
            && ctx.host.should_generate_next(self.id);
        let ios = match self.chain.build_io(self.id, issue) {
            Ok(ios) => ios,
            Err(err) => {
                if sibling {
                    ctx.host.cancel_generate(self.id);
                }
                return Err(err);
            }
        };
        self.wait_count = ios.len();
        for io in ios {
            ctx.host.submit(io);
        }
        if sibling {
            ctx.host.generate_next(self.id);
        }
        trace!(
            target: "pv::verify::state",
            op = %self.id,
            range = %self.active_range(),
            issued = %issue,
            %degraded,
            "reads_issued"
        );
        if self.wait_count == 0 {
            return Ok(self.goto(VerifyState::EvaluateReads));
        }
        Ok(self.suspend(VerifyState::EvaluateReads, WaitReason::Io))
    }

    /// Submit the chain slots in `mask` and count them as outstanding.
    fn submit(&mut self, ctx: &mut VerifyContext<'_>, mask: PositionMask) -> Result<()> {
        let ios = self.chain.build_io(self.id, mask)?;
        self.wait_count = ios.len();
        for io in ios {
            ctx.host.submit(io);
        }
        Ok(())
    }

    /// Re-read the board after every completion; degraded positions first
    /// become nop so they never count as errors.
    fn scan(&mut self, ctx: &VerifyContext<'_>) -> Result<(ErrorBoard, PositionMask)> {
        if self.wait_count != 0 {
            return Err(VerifyError::invariant(
                self.state.name(),
                format!("evaluating with {} requests outstanding", self.wait_count),
            ));
        }
        let degraded = ctx.group.degraded_mask();
        self.chain.set_nop(degraded);
        let board = ErrorBoard::scan(&self.chain, degraded, self.config.max_retries)?;
        Ok((board, degraded))
    }

    fn evaluate_reads(&mut self, ctx: &mut VerifyContext<'_>) -> Result<Step> {
        let (board, degraded) = self.scan(ctx)?;
        self.board = board;
        let inherited = std::mem::take(&mut self.flags.error_pending);
        let parity_disks = ctx.group.parity_disk_count();
        let status = board.status(degraded.count(), parity_disks);
        debug!(
            target: "pv::verify::state",
            op = %self.id,
            ?status,
            inherited,
            hard_media = board.hard_media_count(),
            soft_media = board.soft_media_count(),
            retry = board.retry_count(),
            dead = board.dead_count(),
            degraded = degraded.count(),
            "reads_evaluated"
        );
        if self.abort.is_aborted() {
            return Ok(self.abort_path(Some(board)));
        }
        match status {
            ChainStatus::Success => Ok(self.goto(VerifyState::Reconstruct)),
            ChainStatus::Aborted => Ok(self.abort_path(Some(board))),
            ChainStatus::Shutdown => Ok(self.shut_down(board)),
            ChainStatus::Retry => {
                let decision = decide_retry(
                    &board,
                    degraded.count(),
                    parity_disks,
                    self.flags.single_error_recovery,
                );
                debug!(target: "pv::verify::state", op = %self.id, ?decision, "retry_decided");
                match decision {
                    RetryDecision::AttemptRedundancyRecovery => Ok(self.goto(VerifyState::Reconstruct)),
                    RetryDecision::Retry => {
                        warn!(
                            target: "pv::verify::state",
                            op = %self.id,
                            positions = %board.retry,
                            "reads_retried"
                        );
                        self.pass_counts.retryable += board.retry_count();
                        self.chain.reissue(board.retry);
                        self.submit(ctx, board.retry)?;
                        Ok(self.suspend(VerifyState::EvaluateReads, WaitReason::Io))
                    }
                    RetryDecision::ReportError => Ok(self.shut_down(board)),
                    RetryDecision::EscalateSingleRegion => self.apply_read_error_policy(ctx),
                }
            }
            ChainStatus::Error => self.apply_read_error_policy(ctx),
        }
    }

    fn apply_read_error_policy(&mut self, ctx: &mut VerifyContext<'_>) -> Result<Step> {
        let geometry = ctx.group.geometry();
        let optimal = geometry.optimal_block_size();
        let action = read_error_policy(ReadErrorInputs {
            hard_media: self.board.hard_media_count(),
            width: u32::from(geometry.width()),
            degraded_verify: self.algorithm.is_degraded_verify(),
            aligned: self.active_range().is_aligned(optimal),
            single_error_recovery: self.flags.single_error_recovery,
            single_region_mode: self.flags.single_region_mode,
        })?;
        debug!(target: "pv::verify::state", op = %self.id, ?action, "read_error_policy");
        match action {
            ReadErrorAction::Continue => Ok(self.goto(VerifyState::Reconstruct)),
            ReadErrorAction::FailUnaligned => {
                warn!(
                    target: "pv::verify::state",
                    op = %self.id,
                    range = %self.active_range(),
                    optimal,
                    "degraded_verify_unaligned_media_error"
                );
                self.media_error_lba = self.board.first_media_lba;
                self.fail(BlockStatus::MediaError, Qualifier::RetryAligned);
                Ok(self.goto(VerifyState::Finalize))
            }
            ReadErrorAction::NarrowToRegion => {
                self.flags.single_error_recovery = true;
                self.flags.single_region_mode = true;
                let count = region_mining_count(self.parity_start, self.xfer_count, optimal);
                if count == 0 {
                    return Err(VerifyError::invariant(
                        "read_error_policy",
                        format!("empty region at {}", self.parity_start),
                    ));
                }
                self.parity_count = count;
                self.reset_chain();
                info!(
                    target: "pv::verify::state",
                    op = %self.id,
                    region = %self.active_range(),
                    hard_media = self.board.hard_media_count(),
                    "region_mining_entered"
                );
                Ok(self.goto(VerifyState::IssueReads))
            }
            ReadErrorAction::ReconstructRegion => {
                self.flags.single_error_recovery = true;
                Ok(self.goto(VerifyState::Reconstruct))
            }
        }
    }

    fn shut_down(&mut self, board: ErrorBoard) -> Step {
        self.absorb_board(&board);
        self.pass_counts.shutdown += 1;
        warn!(
            target: "pv::verify::state",
            op = %self.id,
            dead = %board.dead,
            "group_unavailable"
        );
        self.fail(BlockStatus::IoFailed, Qualifier::NotReady);
        self.goto(VerifyState::Finalize)
    }

    /// Report what the board saw and head for the aborted terminal.
    fn abort_path(&mut self, board: Option<ErrorBoard>) -> Step {
        if let Some(board) = board {
            self.absorb_board(&board);
            self.pass_counts.u_media += board.hard_media_count();
        }
        info!(target: "pv::verify::state", op = %self.id, state = self.state.name(), "verify_aborted");
        self.fail(BlockStatus::Aborted, Qualifier::ClientAborted);
        self.goto(VerifyState::Report)
    }

    fn absorb_board(&mut self, board: &ErrorBoard) {
        self.pass_counts.retryable += board.retry_count();
        self.pass_counts.non_retryable += board.dead_count();
        self.pass_counts.c_soft_media += board.soft_media_count();
    }

    // ── Parity ──────────────────────────────────────────────────────────────

    fn reconstruct(&mut self, ctx: &mut VerifyContext<'_>) -> Result<Step> {
        let degraded = ctx.group.degraded_mask();
        self.chain.set_nop(degraded);
        let range = self.active_range();
        let mut strip = StripRequest {
            range,
            sectors: self.chain.sectors_mut(range.blocks)?,
            degraded,
            missing: degraded | self.board.dead | self.board.retry,
            media_error: self.board.hard_media,
        };
        self.strip = ctx.engine.verify_and_reconstruct(&mut strip)?;
        trace!(
            target: "pv::verify::state",
            op = %self.id,
            %range,
            modified = %self.strip.modified,
            uncorrectable = %self.strip.uncorrectable,
            checksum = %self.strip.checksum_errors,
            "strip_verified"
        );
        Ok(self.goto(VerifyState::HandleStripResult))
    }

    fn handle_strip_result(&mut self, ctx: &mut VerifyContext<'_>) -> Result<Step> {
        let geometry = ctx.group.geometry();
        let degraded = ctx.group.degraded_mask();
        let range = self.active_range();
        let needs_write = !(self.strip.modified - degraded).is_empty();

        if self.algorithm.is_degraded_verify()
            && needs_write
            && !range.is_aligned(geometry.optimal_block_size())
        {
            warn!(
                target: "pv::verify::state",
                op = %self.id,
                %range,
                "degraded_verify_unaligned_write"
            );
            self.media_error_lba = self
                .strip
                .first_uncorrectable
                .or(self.board.first_media_lba)
                .or(Some(range.start));
            self.fail(BlockStatus::MediaError, Qualifier::RetryAligned);
            return Ok(self.goto(VerifyState::Finalize));
        }

        if !self.strip.uncorrectable.is_empty()
            && !self.flags.single_error_recovery
            && self.board.hard_media_count() > 0
        {
            info!(
                target: "pv::verify::state",
                op = %self.id,
                %range,
                positions = %self.strip.uncorrectable,
                "uncorrectable_retry_single_error_recovery"
            );
            self.flags.single_error_recovery = true;
            return Ok(self.goto(VerifyState::EvaluateReads));
        }

        if !self.strip.checksum_errors.is_empty()
            && !self.flags.checksum_retried
            && !self.flags.single_region_mode
        {
            if self.abort.is_aborted() {
                return Ok(self.abort_path(None));
            }
            self.flags.checksum_retried = true;
            let reread = self.chain.active();
            warn!(
                target: "pv::verify::state",
                op = %self.id,
                %range,
                checksum = %self.strip.checksum_errors,
                "checksum_errors_reread"
            );
            self.chain.reread(reread);
            self.submit(ctx, reread)?;
            return Ok(self.suspend(VerifyState::EvaluateReads, WaitReason::Io));
        }

        if !self.strip.uncorrectable.is_empty() {
            self.absorb_strip();
            self.media_error_lba = self.strip.first_uncorrectable;
            warn!(
                target: "pv::verify::state",
                op = %self.id,
                %range,
                positions = %self.strip.uncorrectable,
                first_lba = ?self.media_error_lba,
                "data_lost"
            );
            self.fail(BlockStatus::MediaError, Qualifier::DataLost);
            return Ok(self.goto(VerifyState::Finalize));
        }

        self.absorb_strip();
        if self.algorithm.is_read_recovery() {
            self.copy_to_parent()?;
        }
        if self.algorithm.is_write_path() {
            Ok(self.goto(VerifyState::RecoveryWrite))
        } else {
            Ok(self.goto(VerifyState::WriteBackDecision))
        }
    }

    /// Fold the engine's findings and the read board into the pass totals.
    fn absorb_strip(&mut self) {
        let board = self.board;
        self.absorb_board(&board);
        self.pass_counts.accumulate(&self.strip.counts);
        self.pass_regions.extend(self.strip.regions.iter().copied());
        self.pass_crc = self.pass_crc | self.strip.crc_single_bit | self.strip.crc_multi_bit;
    }

    /// Copy reconstructed data into the parent's buffers where they overlap
    /// the current pass.
    fn copy_to_parent(&mut self) -> Result<()> {
        let range = self.active_range();
        let Some(overlap) = range.intersect(self.parent.range) else {
            return Ok(());
        };
        let src_at = sector_bytes(overlap.start.0 - range.start.0);
        let dst_at = sector_bytes(overlap.start.0 - self.parent.range.start.0);
        let len = sector_bytes(overlap.blocks);
        for (pos, buf) in &mut self.parent.buffers {
            let src = self
                .chain
                .sectors(*pos, range.blocks)
                .and_then(|s| s.get(src_at..src_at + len))
                .ok_or_else(|| {
                    VerifyError::invariant("handle_strip_result", format!("{pos} buffer not home"))
                })?;
            let dst = buf.get_mut(dst_at..dst_at + len).ok_or_else(|| {
                VerifyError::invariant(
                    "handle_strip_result",
                    format!("parent buffer for {pos} shorter than its range"),
                )
            })?;
            dst.copy_from_slice(src);
        }
        Ok(())
    }

    // ── Writes ──────────────────────────────────────────────────────────────

    fn recovery_write(&mut self, ctx: &mut VerifyContext<'_>) -> Result<Step> {
        self.flags.wrote_corrections = true;
        let range = self.active_range();
        let degraded = ctx.group.degraded_mask();
        let host = HostData {
            range: self.parent.range,
            buffers: self
                .parent
                .buffers
                .iter()
                .map(|(p, b)| (*p, b.as_slice()))
                .collect(),
        };
        let mut strip = StripRequest {
            range,
            sectors: self.chain.sectors_mut(range.blocks)?,
            degraded,
            missing: degraded,
            media_error: PositionMask::EMPTY,
        };
        match ctx.engine.copy_new_data_and_recompute_parity(&mut strip, &host)? {
            XorStatus::NoError => Ok(self.goto(VerifyState::FinishWrite)),
            status @ (XorStatus::BadMemory | XorStatus::ChecksumError) => {
                warn!(target: "pv::verify::state", op = %self.id, %range, ?status, "host_data_bad_memory");
                self.fail(BlockStatus::BadMemory, Qualifier::None);
                Ok(self.goto(VerifyState::Finalize))
            }
        }
    }

    fn require_exclusive(&self, ctx: &VerifyContext<'_>, state: &'static str) -> Result<()> {
        if ctx.locks.holds(self.id, self.active_range(), LockMode::Exclusive) {
            Ok(())
        } else {
            Err(VerifyError::invariant(
                state,
                format!("write to {} without exclusive lock", self.active_range()),
            ))
        }
    }

    fn finish_write(&mut self, ctx: &mut VerifyContext<'_>) -> Result<Step> {
        if self.abort.is_aborted() {
            return Ok(self.abort_path(None));
        }
        let degraded = ctx.group.degraded_mask();
        let write = PositionMask::all(self.width) - degraded;
        if write.is_empty() || write.count() > u32::from(self.width) {
            return Err(VerifyError::invariant(
                "finish_write",
                format!("{} writes for width {}", write.count(), self.width),
            ));
        }
        self.require_exclusive(ctx, "finish_write")?;
        self.chain.set_opcode(write, DriveOpcode::Write);
        self.chain.set_nop(degraded);
        info!(
            target: "pv::verify::state",
            op = %self.id,
            range = %self.active_range(),
            positions = %write,
            "stripe_write_issued"
        );
        self.submit(ctx, write)?;
        Ok(self.suspend(VerifyState::EvaluateWrites, WaitReason::Io))
    }

    fn write_back_decision(&mut self, ctx: &mut VerifyContext<'_>) -> Result<Step> {
        if self.abort.is_aborted() {
            return Ok(self.abort_path(None));
        }
        let degraded = ctx.group.degraded_mask();
        let write = self.strip.modified - degraded;
        let opcode = self.parent.opcode;
        if !write.is_empty() && opcode == ParentOpcode::Read {
            self.parent.remap_needed = true;
        }
        let blocked_by_media =
            self.board.hard_media_count() > 0 && !self.algorithm.writes_through_media_errors();
        if write.is_empty()
            || matches!(opcode, ParentOpcode::Read | ParentOpcode::ReadOnlyVerify)
            || blocked_by_media
        {
            debug!(
                target: "pv::verify::state",
                op = %self.id,
                positions = %write,
                ?opcode,
                blocked_by_media,
                "write_back_skipped"
            );
            return Ok(self.advance_or_finalize());
        }

        let drive_op = if self.algorithm.is_plain_verify() {
            DriveOpcode::WriteVerify
        } else {
            DriveOpcode::Write
        };
        self.require_exclusive(ctx, "write_back_decision")?;
        self.chain.set_nop(!write);
        self.chain.set_opcode(write, drive_op);
        self.flags.wrote_corrections = true;
        info!(
            target: "pv::verify::state",
            op = %self.id,
            range = %self.active_range(),
            positions = %write,
            opcode = ?drive_op,
            "corrections_written_back"
        );
        self.submit(ctx, write)?;
        Ok(self.suspend(VerifyState::EvaluateWrites, WaitReason::Io))
    }

    fn evaluate_writes(&mut self, ctx: &mut VerifyContext<'_>) -> Result<Step> {
        let (board, degraded) = self.scan(ctx)?;
        self.board = board;
        let status = board.status(degraded.count(), ctx.group.parity_disk_count());
        debug!(
            target: "pv::verify::state",
            op = %self.id,
            ?status,
            written = %board.write_completed,
            hard_media = board.hard_media_count(),
            soft_media = board.soft_media_count(),
            dead = board.dead_count(),
            "writes_evaluated"
        );
        match status {
            ChainStatus::Success => {
                self.absorb_board(&board);
                if board.soft_media_count() > 0 && self.algorithm.is_plain_verify() {
                    return Ok(self.goto(VerifyState::MediaErrorOnWrite));
                }
                self.note_landed(&board);
                Ok(self.advance_or_finalize())
            }
            ChainStatus::Retry => {
                if self.abort.is_aborted() {
                    return Ok(self.abort_path(Some(board)));
                }
                warn!(target: "pv::verify::state", op = %self.id, positions = %board.retry, "writes_retried");
                self.pass_counts.retryable += board.retry_count();
                self.chain.reissue(board.retry);
                self.submit(ctx, board.retry)?;
                Ok(self.suspend(VerifyState::EvaluateWrites, WaitReason::Io))
            }
            ChainStatus::Aborted => Ok(self.abort_path(Some(board))),
            ChainStatus::Shutdown => Ok(self.shut_down(board)),
            ChainStatus::Error => {
                self.absorb_board(&board);
                if board.hard_media_count() > 0 {
                    self.pass_counts.u_media += board.hard_media_count();
                    return Ok(self.goto(VerifyState::MediaErrorOnWrite));
                }
                self.note_landed(&board);
                let remaining = self.xfer_count - self.parity_count;
                if self.algorithm.is_read_recovery() && remaining == 0 {
                    return Ok(self.goto(VerifyState::Finalize));
                }
                Ok(self.advance_or_finalize())
            }
        }
    }

    fn note_landed(&mut self, board: &ErrorBoard) {
        if self.flags.wrote_corrections && !board.write_completed.is_empty() {
            self.flags.corrections_landed = true;
        }
    }

    fn advance_or_finalize(&mut self) -> Step {
        if self.xfer_count > self.parity_count {
            self.goto(VerifyState::NextRegion)
        } else {
            self.goto(VerifyState::Finalize)
        }
    }

    fn next_region(&mut self, ctx: &mut VerifyContext<'_>) -> Result<Step> {
        let chain_blocks = self.chain.iter().next().map_or(0, |r| r.range().blocks);
        if chain_blocks != self.parity_count {
            return Err(VerifyError::invariant(
                "next_region",
                format!("chain covers {chain_blocks} blocks, pass has {}", self.parity_count),
            ));
        }
        if self.flags.single_region_mode {
            self.report_errors(ctx, None)?;
            if self.algorithm.is_plain_verify() {
                self.parent.blocks_transferred += self.parity_count;
            }
        }
        self.xfer_count -= self.parity_count;
        self.parity_start = self.parity_start.offset(self.parity_count);
        self.parity_count = if self.flags.single_region_mode {
            region_mining_count(
                self.parity_start,
                self.xfer_count,
                ctx.group.geometry().optimal_block_size(),
            )
        } else {
            self.parity_count.min(self.xfer_count)
        };
        if self.parity_count == 0 || self.parity_count > self.xfer_count {
            return Err(VerifyError::invariant(
                "next_region",
                format!("parity_count {} with {} blocks left", self.parity_count, self.xfer_count),
            ));
        }
        self.reset_chain();
        self.flags.checksum_retried = false;
        self.strip = StripResult::default();
        info!(
            target: "pv::verify::state",
            op = %self.id,
            region = %self.active_range(),
            remaining = self.xfer_count,
            single_region = self.flags.single_region_mode,
            "next_region"
        );
        Ok(self.goto(VerifyState::IssueReads))
    }

    fn media_error_on_write(&mut self) -> Result<Step> {
        let Some((pos, blocks)) = self.chain.min_blocks_transferred() else {
            return Err(VerifyError::invariant("media_error_on_write", "no active positions"));
        };
        self.media_error_lba = Some(self.parity_start.offset(blocks));
        warn!(
            target: "pv::verify::state",
            op = %self.id,
            %pos,
            blocks,
            lba = ?self.media_error_lba,
            "media_error_on_write"
        );
        self.fail(BlockStatus::MediaError, Qualifier::DataLost);
        Ok(self.goto(VerifyState::Finalize))
    }

    // ── Completion ──────────────────────────────────────────────────────────

    fn finalize(&mut self, ctx: &mut VerifyContext<'_>) -> Result<Step> {
        if self.error.is_none() {
            if self.algorithm.is_read_recovery() {
                if let Some(lba) = self.first_bad_parent_lba(ctx.engine) {
                    warn!(target: "pv::verify::state", op = %self.id, %lba, "parent_checksum_failed");
                    self.media_error_lba = Some(lba);
                    self.fail(BlockStatus::MediaError, Qualifier::DataLost);
                    return Ok(self.goto(VerifyState::Report));
                }
            }
            self.fail(BlockStatus::Success, Qualifier::None);
        }
        Ok(self.goto(VerifyState::Report))
    }

    fn first_bad_parent_lba(&self, engine: &dyn ParityEngine) -> Option<Lba> {
        let range = self.parent.range;
        self.parent
            .buffers
            .iter()
            .filter_map(|(_, buf)| {
                (0..range.blocks)
                    .find(|&i| {
                        let at = sector_bytes(i);
                        buf.get(at..at + SECTOR_BYTES).map_or(true, |s| {
                            engine.validate_checksums(BlockRange::new(range.start.offset(i), 1), s)
                                != XorStatus::NoError
                        })
                    })
                    .map(|i| range.start.offset(i))
            })
            .min()
    }

    /// Emit the unreported counts. `final_status` marks the operation's
    /// single final report, which is emitted even when clean.
    fn report_errors(&mut self, ctx: &mut VerifyContext<'_>, final_status: Option<BlockStatus>) -> Result<()> {
        if final_status.is_some() {
            if self.flags.reported_final {
                return Err(VerifyError::invariant("report", "final report emitted twice"));
            }
            self.flags.reported_final = true;
        }
        let counts = std::mem::take(&mut self.pass_counts);
        let regions = std::mem::take(&mut self.pass_regions);
        let crc = std::mem::replace(&mut self.pass_crc, PositionMask::EMPTY);
        self.totals.accumulate(&counts);
        self.crc_positions = self.crc_positions | crc;
        if final_status.is_none() && counts.is_clean() && regions.is_empty() {
            return Ok(());
        }
        let report = ErrorReport {
            op: self.id,
            algorithm: self.algorithm,
            range: if final_status.is_some() { self.range } else { self.active_range() },
            counts,
            regions,
            crc_positions: crc,
            final_status,
        };
        if counts.total() > 0 {
            info!(
                target: "pv::verify::report",
                op = %self.id,
                range = %report.range,
                correctable = counts.correctable(),
                uncorrectable = counts.uncorrectable(),
                regions = report.regions.len(),
                is_final = report.is_final(),
                "errors_reported"
            );
        }
        ctx.host.record_errors(&report);
        Ok(())
    }

    fn report(&mut self, ctx: &mut VerifyContext<'_>) -> Result<Step> {
        let (status, mut qualifier) = self.error.unwrap_or((BlockStatus::Success, Qualifier::None));
        if status == BlockStatus::Success && self.flags.corrections_landed {
            qualifier = Qualifier::CompleteWithRemap;
        }
        self.report_errors(ctx, Some(status))?;
        let totals = self.totals;
        if self.parent.remap_needed && totals.total() == 0 && totals.invalidate > 0 {
            debug!(target: "pv::verify::report", op = %self.id, "remap_suppressed_invalidated_only");
            self.parent.remap_needed = false;
        }
        self.outcome = Some(VerifyOutcome {
            status,
            qualifier,
            media_error_lba: if status == BlockStatus::Success { None } else { self.media_error_lba },
            corrected: self.flags.corrections_landed,
            errors: totals,
        });

        if totals.has_crc_class()
            && self.config.crc_notifications
            && self.parent.opcode != ParentOpcode::ReadOnlyVerify
        {
            let notice = CrcNotice {
                op: self.id,
                range: self.range,
                positions: self.crc_positions,
                single_bit: totals.c_crc_single + totals.u_crc_single,
                multi_bit: totals.c_crc_multi + totals.u_crc_multi,
            };
            warn!(
                target: "pv::verify::report",
                op = %self.id,
                positions = %notice.positions,
                single_bit = notice.single_bit,
                multi_bit = notice.multi_bit,
                "crc_errors_detected"
            );
            if ctx.host.notify_crc(&notice) == NoticeStatus::Sent {
                return Ok(self.suspend(VerifyState::NotifyWait, WaitReason::Notification));
            }
        }
        Ok(self.goto(VerifyState::Complete))
    }

    fn complete(&mut self, ctx: &mut VerifyContext<'_>) -> Step {
        self.release_resources(ctx);
        debug!(
            target: "pv::verify::state",
            op = %self.id,
            outcome = ?self.outcome.as_ref().map(|o| (o.status, o.qualifier)),
            "verify_complete"
        );
        Step::Done
    }

    /// Return buffers and locks, forwarding whatever that unblocks.
    fn release_resources(&mut self, ctx: &mut VerifyContext<'_>) {
        let mut buffers = self.chain.release_buffers();
        if let Some(Some(extra)) = self.pending_grant.take() {
            buffers.extend(extra);
        }
        for grant in ctx.memory.release(self.id, buffers) {
            ctx.host.deliver_allocation(grant);
        }
        for op in ctx.locks.release(self.id) {
            ctx.host.wake(op);
        }
    }
}

impl fmt::Debug for VerifyOperation<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerifyOperation")
            .field("id", &self.id)
            .field("algorithm", &self.algorithm)
            .field("state", &self.state)
            .field("wait", &self.wait)
            .field("parity_start", &self.parity_start)
            .field("parity_count", &self.parity_count)
            .field("xfer_count", &self.xfer_count)
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::ParentAlgorithm;
    use crate::host::{OperationHost, RaidGroupView};
    use crate::lock::{LockCoordinator, RangeLockTable};
    use crate::memory::{DeferredGrant, MemoryBudget};
    use pv_drive::{DriveIo, DriveSubmitter};
    use pv_types::{Position, RaidGeometry};
    use pv_xor::SectorXorEngine;

    struct Group {
        geometry: RaidGeometry,
        degraded: PositionMask,
    }

    impl RaidGroupView for Group {
        fn geometry(&self) -> RaidGeometry {
            self.geometry
        }

        fn is_position_degraded(&self, pos: Position) -> bool {
            self.degraded.contains(pos)
        }

        fn is_quiescing(&self) -> bool {
            false
        }
    }

    #[derive(Default)]
    struct Host {
        submitted: Vec<DriveIo>,
        reports: Vec<ErrorReport>,
        woken: Vec<OperationId>,
    }

    impl DriveSubmitter for Host {
        fn submit(&mut self, io: DriveIo) {
            self.submitted.push(io);
        }
    }

    impl OperationHost for Host {
        fn record_errors(&mut self, report: &ErrorReport) {
            self.reports.push(report.clone());
        }

        fn notify_crc(&mut self, _notice: &CrcNotice) -> NoticeStatus {
            NoticeStatus::Skipped
        }

        fn wake(&mut self, op: OperationId) {
            self.woken.push(op);
        }

        fn deliver_allocation(&mut self, _grant: DeferredGrant) {}
    }

    struct Rig {
        group: Group,
        locks: RangeLockTable,
        memory: MemoryBudget,
        engine: SectorXorEngine,
        host: Host,
    }

    impl Rig {
        fn new() -> Self {
            let geometry = RaidGeometry::new(3, 1, 8, 64).unwrap();
            Self {
                group: Group {
                    geometry,
                    degraded: PositionMask::EMPTY,
                },
                locks: RangeLockTable::new(),
                memory: MemoryBudget::new(1 << 20),
                engine: SectorXorEngine::new(geometry).unwrap(),
                host: Host::default(),
            }
        }

        fn ctx(&mut self) -> VerifyContext<'_> {
            VerifyContext {
                group: &self.group,
                locks: &self.locks,
                memory: &self.memory,
                engine: &self.engine,
                host: &mut self.host,
            }
        }
    }

    fn verify_parent(start: u64, blocks: u64) -> ParentRequest {
        ParentRequest::background(BlockRange::new(Lba(start), blocks), ParentOpcode::Verify)
    }

    #[test]
    fn first_run_issues_reads_to_every_position() {
        let mut rig = Rig::new();
        let mut parent = verify_parent(0, 8);
        let mut op = VerifyOperation::new(OperationId(1), VerifyAlgorithm::Verify, &mut parent, VerifyConfig::default());
        let status = op.run(&mut rig.ctx()).unwrap();
        assert_eq!(status, RunStatus::Waiting(WaitReason::Io));
        assert_eq!(op.state(), VerifyState::EvaluateReads);
        assert_eq!(rig.host.submitted.len(), 3);
        assert!(rig.host.submitted.iter().all(|io| io.opcode == DriveOpcode::Read));
        assert!(rig.locks.holds(OperationId(1), BlockRange::new(Lba(0), 8), LockMode::Exclusive));
    }

    #[test]
    fn degraded_positions_are_not_read() {
        let mut rig = Rig::new();
        rig.group.degraded = PositionMask::single(Position(1));
        let mut parent = verify_parent(0, 8);
        let mut op = VerifyOperation::new(OperationId(1), VerifyAlgorithm::Verify, &mut parent, VerifyConfig::default());
        op.run(&mut rig.ctx()).unwrap();
        let read: PositionMask = rig.host.submitted.iter().map(|io| io.position).collect();
        assert_eq!(read, PositionMask::from_bits(0b101));
    }

    #[test]
    fn mismatched_parent_faults_and_releases_lock() {
        let mut rig = Rig::new();
        let mut parent = verify_parent(0, 8);
        let alg = VerifyAlgorithm::RecoveryVerify(RecoveryKind::ForRead);
        let mut op = VerifyOperation::new(OperationId(2), alg, &mut parent, VerifyConfig::default());
        let err = op.run(&mut rig.ctx()).unwrap_err();
        assert!(err.is_invariant());
        assert_eq!(op.state(), VerifyState::Faulted);
        assert!(op.outcome().is_none());
        assert!(op.run(&mut rig.ctx()).is_err());
    }

    #[test]
    fn range_outside_group_is_rejected() {
        let mut rig = Rig::new();
        let mut parent = verify_parent(60, 8);
        let mut op = VerifyOperation::new(OperationId(3), VerifyAlgorithm::Verify, &mut parent, VerifyConfig::default());
        let err = op.run(&mut rig.ctx()).unwrap_err();
        assert!(matches!(err, VerifyError::InvalidRequest(_)));
    }

    #[test]
    fn second_upgrade_ownership_is_invariant_violation() {
        let mut rig = Rig::new();
        let mut parent = ParentRequest::write(
            ParentAlgorithm::ReadModifyWrite,
            BlockRange::new(Lba(0), 8),
            Vec::new(),
        );
        let id = OperationId(4);
        rig.locks.mark_upgrade_owner(id);
        let alg = VerifyAlgorithm::RecoveryVerify(RecoveryKind::ForReadModifyWrite);
        let mut op = VerifyOperation::new(id, alg, &mut parent, VerifyConfig::default());
        let err = op.run(&mut rig.ctx()).unwrap_err();
        assert_eq!(err.state(), Some("await_upgrade"));
        assert_eq!(rig.locks.held_range(id), None);
    }

    #[test]
    fn parity_count_above_xfer_count_faults() {
        let mut rig = Rig::new();
        let mut parent = verify_parent(0, 8);
        let mut op = VerifyOperation::new(OperationId(5), VerifyAlgorithm::Verify, &mut parent, VerifyConfig::default());
        op.run(&mut rig.ctx()).unwrap();
        op.state = VerifyState::NextRegion;
        op.wait = None;
        op.parity_count = op.xfer_count + 1;
        let err = op.run(&mut rig.ctx()).unwrap_err();
        assert!(err.is_invariant());
        assert_eq!(op.state(), VerifyState::Faulted);
    }

    #[test]
    fn write_without_exclusive_lock_faults() {
        let mut rig = Rig::new();
        let mut parent = verify_parent(0, 8);
        let mut op = VerifyOperation::new(OperationId(6), VerifyAlgorithm::Verify, &mut parent, VerifyConfig::default());
        op.run(&mut rig.ctx()).unwrap();
        rig.locks.release(OperationId(6));
        op.wait = None;
        op.wait_count = 0;
        op.state = VerifyState::FinishWrite;
        let err = op.run(&mut rig.ctx()).unwrap_err();
        assert_eq!(err.state(), Some("finish_write"));
    }

    #[test]
    fn completion_for_another_operation_is_rejected() {
        let mut rig = Rig::new();
        let mut parent = verify_parent(0, 8);
        let mut op = VerifyOperation::new(OperationId(7), VerifyAlgorithm::Verify, &mut parent, VerifyConfig::default());
        op.run(&mut rig.ctx()).unwrap();
        let io = rig.host.submitted.pop().unwrap();
        let err = op
            .on_drive_complete(DriveCompletion {
                op: OperationId(99),
                position: io.position,
                status: DriveStatus::Success,
                buffer: io.buffer,
            })
            .unwrap_err();
        assert!(err.is_invariant());
        assert_eq!(op.state(), VerifyState::EvaluateReads);
    }

    #[test]
    fn run_while_waiting_does_not_step() {
        let mut rig = Rig::new();
        let mut parent = verify_parent(0, 8);
        let mut op = VerifyOperation::new(OperationId(8), VerifyAlgorithm::Verify, &mut parent, VerifyConfig::default());
        op.run(&mut rig.ctx()).unwrap();
        assert_eq!(op.run(&mut rig.ctx()).unwrap(), RunStatus::Waiting(WaitReason::Io));
        assert_eq!(rig.host.submitted.len(), 3);
    }
}
