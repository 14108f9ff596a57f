//! Recording host: queues drive I/O and keeps every report, notice and
//! scheduling hook it sees so tests can inspect them afterwards.

use pv_drive::{DriveIo, DriveOpcode, DriveSubmitter};
use pv_types::{BlockRange, OperationId, Position};
use pv_verify::{CrcNotice, DeferredGrant, ErrorReport, NoticeStatus, OperationHost};
use serde::Serialize;
use std::collections::VecDeque;
use tracing::debug;

/// One submitted drive request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IoRecord {
    pub op: OperationId,
    pub position: Position,
    pub opcode: DriveOpcode,
    pub range: BlockRange,
}

#[derive(Debug)]
pub struct SimHost {
    pub(crate) queue: VecDeque<DriveIo>,
    pub(crate) grants: Vec<DeferredGrant>,
    pub(crate) pending_notices: Vec<OperationId>,
    pub io_log: Vec<IoRecord>,
    pub reports: Vec<ErrorReport>,
    pub notices: Vec<CrcNotice>,
    pub woken: Vec<OperationId>,
    /// Answer `notify_crc` with `Sent` (true) or `Skipped`.
    pub send_notices: bool,
    /// Answer `should_generate_next` with this.
    pub generate_siblings: bool,
    /// Operations that asked for a sibling, with the I/O count at that moment.
    pub generated: Vec<(OperationId, usize)>,
    pub cancelled: Vec<OperationId>,
}

impl Default for SimHost {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
            grants: Vec::new(),
            pending_notices: Vec::new(),
            io_log: Vec::new(),
            reports: Vec::new(),
            notices: Vec::new(),
            woken: Vec::new(),
            send_notices: true,
            generate_siblings: false,
            generated: Vec::new(),
            cancelled: Vec::new(),
        }
    }
}

impl SimHost {
    /// Submitted requests of one operation with the given opcode.
    #[must_use]
    pub fn ios(&self, op: OperationId, opcode: DriveOpcode) -> Vec<IoRecord> {
        self.io_log
            .iter()
            .filter(|r| r.op == op && r.opcode == opcode)
            .copied()
            .collect()
    }

    #[must_use]
    pub fn reports_for(&self, op: OperationId) -> Vec<&ErrorReport> {
        self.reports.iter().filter(|r| r.op == op).collect()
    }

    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.queue.len()
    }
}

impl DriveSubmitter for SimHost {
    fn submit(&mut self, io: DriveIo) {
        self.io_log.push(IoRecord {
            op: io.op,
            position: io.position,
            opcode: io.opcode,
            range: io.range,
        });
        self.queue.push_back(io);
    }
}

impl OperationHost for SimHost {
    fn record_errors(&mut self, report: &ErrorReport) {
        debug!(
            target: "pv::harness",
            op = %report.op,
            range = %report.range,
            total = report.counts.total(),
            is_final = report.is_final(),
            "report_recorded"
        );
        self.reports.push(report.clone());
    }

    fn notify_crc(&mut self, notice: &CrcNotice) -> NoticeStatus {
        self.notices.push(notice.clone());
        if self.send_notices {
            self.pending_notices.push(notice.op);
            NoticeStatus::Sent
        } else {
            NoticeStatus::Skipped
        }
    }

    fn wake(&mut self, op: OperationId) {
        self.woken.push(op);
    }

    fn deliver_allocation(&mut self, grant: DeferredGrant) {
        self.grants.push(grant);
    }

    fn should_generate_next(&mut self, _op: OperationId) -> bool {
        self.generate_siblings
    }

    fn generate_next(&mut self, op: OperationId) {
        self.generated.push((op, self.io_log.len()));
    }

    fn cancel_generate(&mut self, op: OperationId) {
        self.cancelled.push(op);
    }
}
