#![forbid(unsafe_code)]

use proptest::prelude::*;
use pv_drive::DriveOpcode;
use pv_harness::scenario::host_data;
use pv_harness::sim::pattern_sector;
use pv_harness::{run_scenario, Fault, Harness, ScenarioConfig};
use pv_types::{BlockRange, Lba, OperationId, Position, PositionMask, RaidGeometry};
use pv_verify::{
    parse_reports, BlockStatus, ParentAlgorithm, ParentOpcode, ParentRequest, Qualifier,
    RecoveryKind, ReportLog, RunStatus, VerifyAlgorithm, VerifyEntry, VerifyOperation,
    VerifyOutcome, VerifyState, WaitReason,
};
use std::fs;

const SEED: u64 = 0x5eed;

fn geometry() -> RaidGeometry {
    RaidGeometry::new(4, 1, 8, 32).expect("geometry")
}

fn harness() -> Harness {
    Harness::new(geometry(), 1 << 20, SEED).expect("harness")
}

fn r(start: u64, blocks: u64) -> BlockRange {
    BlockRange::new(Lba(start), blocks)
}

fn final_reports(h: &Harness, id: OperationId) -> usize {
    h.host.reports_for(id).iter().filter(|r| r.is_final()).count()
}

fn run_background(h: &mut Harness, range: BlockRange, opcode: ParentOpcode) -> (OperationId, VerifyOutcome) {
    let mut parent = ParentRequest::background(range, opcode);
    let id = h.next_id();
    let mut op = VerifyOperation::new(id, VerifyAlgorithm::Verify, &mut parent, h.config);
    h.drive(&mut op).expect("drive");
    (id, *op.outcome().expect("outcome"))
}

/// Step and deliver a fixed number of rounds without requiring completion.
fn pump(h: &mut Harness, ops: &mut [VerifyOperation<'_>], rounds: usize) {
    for _ in 0..rounds {
        h.step_all(ops);
        h.deliver(ops).expect("deliver");
    }
}

// ── Clean and repairing passes ──────────────────────────────────────────────

#[test]
fn clean_group_verifies_without_writes() {
    let mut h = harness();
    let (id, outcome) = run_background(&mut h, r(0, 32), ParentOpcode::Verify);
    assert_eq!(outcome.status, BlockStatus::Success);
    assert_eq!(outcome.qualifier, Qualifier::None);
    assert!(!outcome.corrected);
    assert!(outcome.errors.is_clean());
    assert_eq!(h.host.ios(id, DriveOpcode::Read).len(), 4);
    assert!(h.host.ios(id, DriveOpcode::WriteVerify).is_empty());
    assert_eq!(final_reports(&h, id), 1);
    assert_eq!(h.memory.in_use(), 0);
    assert!(h.locks.held_range(id).is_none());
}

#[test]
fn full_range_and_per_region_passes_agree_on_clean_group() {
    let mut whole = harness();
    let (_, outcome) = run_background(&mut whole, r(0, 32), ParentOpcode::Verify);
    assert!(outcome.is_success());

    let mut mined = harness();
    for start in (0..32).step_by(8) {
        let (_, outcome) = run_background(&mut mined, r(start, 8), ParentOpcode::Verify);
        assert!(outcome.is_success());
        assert!(!outcome.corrected);
    }

    assert_eq!(whole.group.snapshot(), mined.group.snapshot());
    for h in [&whole, &mined] {
        assert!(h.host.io_log.iter().all(|io| io.opcode == DriveOpcode::Read));
        assert!(h.group.audit().is_empty());
    }
}

#[test]
fn single_media_error_is_rebuilt_and_written_back() {
    let mut h = harness();
    h.group.inject(Fault::ReadMedia { position: 0, lba: 3 });
    let (id, outcome) = run_background(&mut h, r(0, 32), ParentOpcode::Verify);

    assert_eq!(outcome.status, BlockStatus::Success);
    assert_eq!(outcome.qualifier, Qualifier::CompleteWithRemap);
    assert!(outcome.corrected);
    assert_eq!(outcome.errors.c_media, 1);
    assert_eq!(outcome.errors.total(), 1);

    let writes = h.host.ios(id, DriveOpcode::WriteVerify);
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].position, Position(0));
    assert!(h.group.audit().is_empty());

    let (_, again) = run_background(&mut h, r(0, 32), ParentOpcode::Verify);
    assert!(again.errors.is_clean());
}

#[test]
fn media_errors_beyond_parity_lose_data_without_writing() {
    let mut h = harness();
    let before = h.group.snapshot();
    h.group.inject(Fault::ReadMedia { position: 0, lba: 3 });
    h.group.inject(Fault::ReadMedia { position: 1, lba: 3 });
    let (id, outcome) = run_background(&mut h, r(0, 32), ParentOpcode::Verify);

    assert_eq!(outcome.status, BlockStatus::MediaError);
    assert_eq!(outcome.qualifier, Qualifier::DataLost);
    assert_eq!(outcome.media_error_lba, Some(Lba(3)));
    assert_eq!(outcome.errors.u_media, 2);
    assert!(h.host.ios(id, DriveOpcode::WriteVerify).is_empty());
    assert!(h.host.ios(id, DriveOpcode::Write).is_empty());
    assert_eq!(h.group.snapshot(), before);
    assert_eq!(final_reports(&h, id), 1);
}

#[test]
fn flipped_bit_is_reread_then_repaired_and_notified() {
    let mut h = harness();
    h.group.inject(Fault::FlipBit { position: 1, lba: 5, bit: 9 });
    let (id, outcome) = run_background(&mut h, r(0, 32), ParentOpcode::Verify);

    assert_eq!(outcome.qualifier, Qualifier::CompleteWithRemap);
    assert_eq!(outcome.errors.c_crc, 1);
    assert_eq!(outcome.errors.c_crc_single, 1);
    assert_eq!(h.host.ios(id, DriveOpcode::Read).len(), 8);
    assert_eq!(h.host.ios(id, DriveOpcode::WriteVerify).len(), 1);
    assert!(h.group.audit().is_empty());

    assert_eq!(h.host.notices.len(), 1);
    let notice = &h.host.notices[0];
    assert_eq!(notice.op, id);
    assert_eq!(notice.positions, PositionMask::single(Position(1)));
    assert_eq!(notice.single_bit, 1);
}

#[test]
fn skipped_notice_does_not_suspend() {
    let mut h = harness();
    h.host.send_notices = false;
    h.group.inject(Fault::FlipBit { position: 0, lba: 0, bit: 0 });
    let mut parent = ParentRequest::background(r(0, 32), ParentOpcode::Verify);
    let id = h.next_id();
    let mut op = VerifyOperation::new(id, VerifyAlgorithm::Verify, &mut parent, h.config);
    h.drive(&mut op).unwrap();
    assert_eq!(op.state(), VerifyState::Complete);
    assert_eq!(h.host.notices.len(), 1);
}

#[test]
fn read_only_verify_reports_but_never_writes_or_notifies() {
    let mut h = harness();
    h.group.inject(Fault::FlipBit { position: 2, lba: 9, bit: 100 });
    let (id, outcome) = run_background(&mut h, r(0, 32), ParentOpcode::ReadOnlyVerify);

    assert_eq!(outcome.status, BlockStatus::Success);
    assert_eq!(outcome.qualifier, Qualifier::None);
    assert!(!outcome.corrected);
    assert_eq!(outcome.errors.c_crc, 1);
    assert!(h.host.ios(id, DriveOpcode::WriteVerify).is_empty());
    assert!(h.host.notices.is_empty());
    assert_eq!(h.group.audit(), vec![Lba(9)]);
}

#[test]
fn crc_notices_can_be_disabled() {
    let mut h = harness();
    h.config.crc_notifications = false;
    h.group.inject(Fault::FlipBit { position: 3, lba: 1, bit: 3 });
    let (_, outcome) = run_background(&mut h, r(0, 32), ParentOpcode::Verify);
    assert_eq!(outcome.qualifier, Qualifier::CompleteWithRemap);
    assert!(h.host.notices.is_empty());
}

// ── Region mining ───────────────────────────────────────────────────────────

#[test]
fn two_media_errors_in_different_regions_are_mined_and_repaired() {
    let mut h = harness();
    h.group.inject(Fault::ReadMedia { position: 0, lba: 3 });
    h.group.inject(Fault::ReadMedia { position: 1, lba: 12 });
    let mut parent = ParentRequest::background(r(0, 32), ParentOpcode::Verify);
    let id = h.next_id();
    let mut op = VerifyOperation::new(id, VerifyAlgorithm::Verify, &mut parent, h.config);
    h.drive(&mut op).unwrap();
    let outcome = *op.outcome().unwrap();
    drop(op);

    assert_eq!(outcome.qualifier, Qualifier::CompleteWithRemap);
    assert_eq!(outcome.errors.c_media, 2);
    assert_eq!(parent.blocks_transferred, 24);
    assert!(h.group.audit().is_empty());

    let reports = h.host.reports_for(id);
    let region_reports: Vec<_> = reports.iter().filter(|r| !r.is_final()).collect();
    assert_eq!(region_reports.len(), 2);
    assert_eq!(region_reports[0].range, r(0, 8));
    assert_eq!(region_reports[1].range, r(8, 8));
    assert_eq!(final_reports(&h, id), 1);

    let (_, again) = run_background(&mut h, r(0, 32), ParentOpcode::Verify);
    assert!(again.errors.is_clean());
    assert_eq!(again.qualifier, Qualifier::None);
}

#[test]
fn mining_stops_at_first_unrecoverable_region() {
    let mut h = harness();
    h.group.inject(Fault::ReadMedia { position: 0, lba: 20 });
    h.group.inject(Fault::ReadMedia { position: 2, lba: 20 });
    let mut parent = ParentRequest::background(r(0, 32), ParentOpcode::Verify);
    let id = h.next_id();
    let mut op = VerifyOperation::new(id, VerifyAlgorithm::Verify, &mut parent, h.config);
    h.drive(&mut op).unwrap();
    let outcome = *op.outcome().unwrap();
    drop(op);

    assert_eq!(outcome.status, BlockStatus::MediaError);
    assert_eq!(outcome.qualifier, Qualifier::DataLost);
    assert_eq!(outcome.media_error_lba, Some(Lba(20)));
    assert_eq!(parent.blocks_transferred, 16);
    let last_read = h.host.ios(id, DriveOpcode::Read).last().copied().unwrap();
    assert_eq!(last_read.range, r(16, 8));
}

// ── Degraded and unavailable positions ──────────────────────────────────────

#[test]
fn degraded_position_is_skipped_and_rebuilt_in_memory() {
    let mut h = harness();
    h.group.set_degraded(PositionMask::single(Position(1)));
    let (id, outcome) = run_background(&mut h, r(0, 32), ParentOpcode::Verify);
    assert_eq!(outcome.status, BlockStatus::Success);
    assert!(outcome.errors.is_clean());
    let reads = h.host.ios(id, DriveOpcode::Read);
    assert_eq!(reads.len(), 3);
    assert!(reads.iter().all(|io| io.position != Position(1)));
}

#[test]
fn position_degraded_mid_flight_is_not_counted_as_error() {
    let mut h = harness();
    let mut parent = ParentRequest::background(r(0, 32), ParentOpcode::Verify);
    let id = h.next_id();
    let mut op = VerifyOperation::new(id, VerifyAlgorithm::Verify, &mut parent, h.config);
    assert_eq!(h.run_op(&mut op).unwrap(), RunStatus::Waiting(WaitReason::Io));
    h.group.set_degraded(PositionMask::single(Position(2)));
    h.drive(&mut op).unwrap();
    let outcome = op.outcome().unwrap();
    assert_eq!(outcome.status, BlockStatus::Success);
    assert_eq!(outcome.errors.non_retryable, 0);
}

#[test]
fn dead_position_within_redundancy_is_tolerated() {
    let mut h = harness();
    h.group.inject(Fault::Dead { position: 2 });
    let (_, outcome) = run_background(&mut h, r(0, 32), ParentOpcode::Verify);
    assert_eq!(outcome.status, BlockStatus::Success);
    assert_eq!(outcome.errors.non_retryable, 1);
}

#[test]
fn dead_position_on_degraded_group_shuts_down() {
    let mut h = harness();
    h.group.set_degraded(PositionMask::single(Position(3)));
    h.group.inject(Fault::Dead { position: 0 });
    let (id, outcome) = run_background(&mut h, r(0, 32), ParentOpcode::Verify);
    assert_eq!(outcome.status, BlockStatus::IoFailed);
    assert_eq!(outcome.qualifier, Qualifier::NotReady);
    assert_eq!(outcome.errors.shutdown, 1);
    assert_eq!(final_reports(&h, id), 1);
}

#[test]
fn retry_is_reissued_when_redundancy_cannot_cover() {
    let mut h = harness();
    h.group.inject(Fault::Retryable { position: 0, times: 1 });
    h.group.inject(Fault::ReadMedia { position: 1, lba: 6 });
    let (id, outcome) = run_background(&mut h, r(0, 32), ParentOpcode::Verify);

    assert_eq!(outcome.qualifier, Qualifier::CompleteWithRemap);
    assert_eq!(outcome.errors.retryable, 1);
    assert_eq!(outcome.errors.c_media, 1);
    let pos0_reads = h
        .host
        .ios(id, DriveOpcode::Read)
        .iter()
        .filter(|io| io.position == Position(0))
        .count();
    assert_eq!(pos0_reads, 2);
    assert!(h.group.audit().is_empty());
}

#[test]
fn single_retry_within_redundancy_is_rebuilt_instead_of_reissued() {
    let mut h = harness();
    h.group.inject(Fault::Retryable { position: 2, times: 1 });
    let (id, outcome) = run_background(&mut h, r(0, 32), ParentOpcode::Verify);
    assert_eq!(outcome.status, BlockStatus::Success);
    assert_eq!(outcome.errors.retryable, 1);
    assert_eq!(h.host.ios(id, DriveOpcode::Read).len(), 4);
}

#[test]
fn exhausted_retries_on_degraded_group_shut_down() {
    let mut h = harness();
    h.group.set_degraded(PositionMask::single(Position(3)));
    h.group.inject(Fault::Retryable { position: 0, times: 10 });
    let (id, outcome) = run_background(&mut h, r(0, 32), ParentOpcode::Verify);

    assert_eq!(outcome.status, BlockStatus::IoFailed);
    assert_eq!(outcome.qualifier, Qualifier::NotReady);
    let pos0_reads = h
        .host
        .ios(id, DriveOpcode::Read)
        .iter()
        .filter(|io| io.position == Position(0))
        .count();
    assert_eq!(pos0_reads, 1 + h.config.max_retries as usize);
}

// ── Degraded verify ─────────────────────────────────────────────────────────

fn degraded_write_parent(range: BlockRange) -> ParentRequest {
    ParentRequest::write(ParentAlgorithm::DegradedReadModifyWrite, range, Vec::new())
}

#[test]
fn unaligned_degraded_verify_fails_on_media_error_without_writing() {
    let mut h = harness();
    h.group.inject(Fault::ReadMedia { position: 0, lba: 3 });
    let before = h.group.snapshot();
    let mut parent = degraded_write_parent(r(2, 4));
    let id = h.next_id();
    let mut op = VerifyOperation::for_entry(id, VerifyEntry::Degraded, &mut parent, h.config).unwrap();
    assert_eq!(op.algorithm(), VerifyAlgorithm::DegradedVerify);
    h.drive(&mut op).unwrap();

    let outcome = op.outcome().unwrap();
    assert_eq!(outcome.status, BlockStatus::MediaError);
    assert_eq!(outcome.qualifier, Qualifier::RetryAligned);
    assert_eq!(outcome.media_error_lba, Some(Lba(3)));
    assert!(h.host.ios(id, DriveOpcode::Write).is_empty());
    assert_eq!(h.host.ios(id, DriveOpcode::Read)[0].range, r(2, 4));
    assert_eq!(h.group.snapshot(), before);
}

#[test]
fn aligned_degraded_verify_writes_through_media_error() {
    let mut h = harness();
    h.group.inject(Fault::ReadMedia { position: 1, lba: 10 });
    let mut parent = degraded_write_parent(r(8, 8));
    let id = h.next_id();
    let mut op = VerifyOperation::for_entry(id, VerifyEntry::Degraded, &mut parent, h.config).unwrap();
    h.drive(&mut op).unwrap();

    let outcome = op.outcome().unwrap();
    assert_eq!(outcome.qualifier, Qualifier::CompleteWithRemap);
    let writes = h.host.ios(id, DriveOpcode::Write);
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].position, Position(1));
    assert!(h.group.audit().is_empty());
}

// ── Recovery verifies ───────────────────────────────────────────────────────

#[test]
fn read_recovery_rebuilds_into_parent_and_flags_remap() {
    let mut h = harness();
    h.group.inject(Fault::ReadMedia { position: 1, lba: 4 });
    let data = geometry().data_positions();
    let mut parent = ParentRequest::read(ParentAlgorithm::Read, r(2, 4), data);
    let id = h.next_id();
    let mut op = VerifyOperation::for_entry(id, VerifyEntry::Recovery, &mut parent, h.config).unwrap();
    assert_eq!(op.algorithm(), VerifyAlgorithm::RecoveryVerify(RecoveryKind::ForRead));
    h.drive(&mut op).unwrap();
    let outcome = *op.outcome().unwrap();
    drop(op);

    assert_eq!(outcome.status, BlockStatus::Success);
    assert!(!outcome.corrected);
    assert!(parent.remap_needed);
    assert_eq!(h.host.ios(id, DriveOpcode::Read)[0].range, r(0, 8));
    assert!(h.host.ios(id, DriveOpcode::Write).is_empty());
    for pos in data.iter() {
        assert_eq!(parent.buffer(pos).unwrap(), host_data(SEED, pos, r(2, 4)).as_slice());
    }
}

#[test]
fn read_recovery_inherits_parent_retryable_positions() {
    let mut h = harness();
    let data = geometry().data_positions();
    let mut parent = ParentRequest::read(ParentAlgorithm::SmallRead, r(0, 8), data)
        .with_retryable(PositionMask::single(Position(2)));
    let id = h.next_id();
    let mut op = VerifyOperation::for_entry(id, VerifyEntry::Recovery, &mut parent, h.config).unwrap();
    h.drive(&mut op).unwrap();
    let outcome = *op.outcome().unwrap();
    drop(op);

    assert_eq!(outcome.status, BlockStatus::Success);
    assert_eq!(outcome.errors.retryable, 1);
    let reads = h.host.ios(id, DriveOpcode::Read);
    assert_eq!(reads.len(), 3);
    assert!(reads.iter().all(|io| io.position != Position(2)));
    assert_eq!(
        parent.buffer(Position(2)).unwrap(),
        host_data(SEED, Position(2), r(0, 8)).as_slice()
    );
}

#[test]
fn invalidated_sector_fails_read_recovery_without_remap() {
    let mut h = harness();
    h.group.inject(Fault::Invalidate { position: 1, lba: 4 });
    let mut parent = ParentRequest::read(ParentAlgorithm::Read, r(0, 8), geometry().data_positions());
    let id = h.next_id();
    let mut op = VerifyOperation::for_entry(id, VerifyEntry::Recovery, &mut parent, h.config).unwrap();
    h.drive(&mut op).unwrap();
    let outcome = *op.outcome().unwrap();
    drop(op);

    assert_eq!(outcome.status, BlockStatus::MediaError);
    assert_eq!(outcome.qualifier, Qualifier::DataLost);
    assert_eq!(outcome.media_error_lba, Some(Lba(4)));
    assert_eq!(outcome.errors.invalidate, 1);
    assert!(!parent.remap_needed);
}

#[test]
fn read_modify_write_recovery_merges_new_data_and_rewrites_stripe() {
    let mut h = harness();
    let write_seed = SEED + 99;
    let range = r(2, 4);
    let buffers = geometry()
        .data_positions()
        .iter()
        .map(|p| (p, host_data(write_seed, p, range)))
        .collect();
    let mut parent = ParentRequest::write(ParentAlgorithm::ReadModifyWrite, range, buffers);
    let id = h.next_id();
    let mut op = VerifyOperation::for_entry(id, VerifyEntry::Recovery, &mut parent, h.config).unwrap();
    assert_eq!(
        op.algorithm(),
        VerifyAlgorithm::RecoveryVerify(RecoveryKind::ForReadModifyWrite)
    );
    h.drive(&mut op).unwrap();

    let outcome = op.outcome().unwrap();
    assert_eq!(outcome.qualifier, Qualifier::CompleteWithRemap);
    assert_eq!(h.host.ios(id, DriveOpcode::Write).len(), 4);
    assert!(h.group.audit().is_empty());
    for lba in (0..8).map(Lba) {
        let expect_seed = if range.contains(lba) { write_seed } else { SEED };
        assert_eq!(
            h.group.sector(Position(0), lba).unwrap(),
            pattern_sector(expect_seed, Position(0), lba)
        );
    }
}

#[test]
fn corrupt_host_data_is_bad_memory_and_never_written() {
    let mut h = harness();
    let range = r(0, 8);
    let mut bad = host_data(SEED + 1, Position(0), range);
    bad[17] ^= 0x40;
    let mut parent =
        ParentRequest::write(ParentAlgorithm::ReconstructWrite, range, vec![(Position(0), bad)]);
    let id = h.next_id();
    let mut op = VerifyOperation::for_entry(id, VerifyEntry::Recovery, &mut parent, h.config).unwrap();
    h.drive(&mut op).unwrap();

    assert_eq!(op.outcome().unwrap().status, BlockStatus::BadMemory);
    assert!(h.host.ios(id, DriveOpcode::Write).is_empty());
}

#[test]
fn write_verify_media_error_reports_transfer_boundary() {
    let mut h = harness();
    h.group.inject(Fault::FlipBit { position: 1, lba: 5, bit: 40 });
    h.group.inject(Fault::WriteVerifyMedia { position: 1, lba: 5 });
    let (_, outcome) = run_background(&mut h, r(0, 32), ParentOpcode::Verify);
    assert_eq!(outcome.status, BlockStatus::MediaError);
    assert_eq!(outcome.qualifier, Qualifier::DataLost);
    assert_eq!(outcome.media_error_lba, Some(Lba(5)));
    assert_eq!(outcome.errors.u_media, 1);
    assert!(!outcome.corrected);
}

#[test]
fn soft_media_error_on_write_verify_is_surfaced() {
    let mut h = harness();
    h.group.inject(Fault::FlipBit { position: 0, lba: 2, bit: 7 });
    h.group.inject(Fault::SoftMedia { position: 0 });
    let (_, outcome) = run_background(&mut h, r(0, 32), ParentOpcode::Verify);
    assert_eq!(outcome.status, BlockStatus::MediaError);
    assert_eq!(outcome.qualifier, Qualifier::DataLost);
    assert_eq!(outcome.errors.c_soft_media, 1);
    assert!(!outcome.corrected);
}

// ── Scheduling ──────────────────────────────────────────────────────────────

#[test]
fn overlapping_operations_serialize_on_the_range_lock() {
    let mut h = harness();
    let mut p1 = ParentRequest::background(r(0, 16), ParentOpcode::Verify);
    let mut p2 = ParentRequest::background(r(8, 16), ParentOpcode::Verify);
    let (a, b) = (h.next_id(), h.next_id());
    let mut ops = vec![
        VerifyOperation::new(a, VerifyAlgorithm::Verify, &mut p1, h.config),
        VerifyOperation::new(b, VerifyAlgorithm::Verify, &mut p2, h.config),
    ];
    h.step_all(&mut ops);
    assert_eq!(ops[1].waiting_on(), Some(WaitReason::Lock));
    h.drive_all(&mut ops).unwrap();

    assert!(ops.iter().all(|op| op.outcome().unwrap().is_success()));
    assert_eq!(h.host.woken, vec![b]);
    let last_a = h.host.io_log.iter().rposition(|io| io.op == a).unwrap();
    let first_b = h.host.io_log.iter().position(|io| io.op == b).unwrap();
    assert!(first_b > last_a);
}

#[test]
fn deferred_allocation_arrives_when_memory_returns() {
    let mut h = harness();
    h.memory = pv_verify::MemoryBudget::new(4 * pv_drive::sector_bytes(16));
    let mut p1 = ParentRequest::background(r(0, 16), ParentOpcode::Verify);
    let mut p2 = ParentRequest::background(r(16, 16), ParentOpcode::Verify);
    let (a, b) = (h.next_id(), h.next_id());
    let mut ops = vec![
        VerifyOperation::new(a, VerifyAlgorithm::Verify, &mut p1, h.config),
        VerifyOperation::new(b, VerifyAlgorithm::Verify, &mut p2, h.config),
    ];
    h.step_all(&mut ops);
    assert_eq!(ops[1].waiting_on(), Some(WaitReason::Allocation));
    assert_eq!(h.memory.waiting(), 1);
    h.drive_all(&mut ops).unwrap();

    assert!(ops.iter().all(|op| op.outcome().unwrap().is_success()));
    assert_eq!(h.memory.in_use(), 0);
    assert_eq!(h.memory.waiting(), 0);
}

#[test]
fn allocation_that_can_never_fit_fails_the_operation() {
    let mut h = harness();
    h.memory = pv_verify::MemoryBudget::new(1024);
    let (id, outcome) = run_background(&mut h, r(0, 32), ParentOpcode::Verify);
    assert_eq!(outcome.status, BlockStatus::AllocationFailed);
    assert!(h.host.io_log.is_empty());
    let reports = h.host.reports_for(id);
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].final_status, Some(BlockStatus::AllocationFailed));
}

#[test]
fn failed_deferred_allocation_fails_the_waiter() {
    let mut h = harness();
    h.memory = pv_verify::MemoryBudget::new(4 * pv_drive::sector_bytes(16));
    let mut p1 = ParentRequest::background(r(0, 16), ParentOpcode::Verify);
    let mut p2 = ParentRequest::background(r(16, 16), ParentOpcode::Verify);
    let (a, b) = (h.next_id(), h.next_id());
    let mut ops = vec![
        VerifyOperation::new(a, VerifyAlgorithm::Verify, &mut p1, h.config),
        VerifyOperation::new(b, VerifyAlgorithm::Verify, &mut p2, h.config),
    ];
    h.step_all(&mut ops);
    for grant in h.memory.fail_waiters() {
        assert_eq!(grant.op, b);
        ops[1].on_allocation(grant.buffers);
    }
    h.drive_all(&mut ops).unwrap();
    assert!(ops[0].outcome().unwrap().is_success());
    assert_eq!(ops[1].outcome().unwrap().status, BlockStatus::AllocationFailed);
}

#[test]
fn quiescing_group_parks_a_deferred_allocation() {
    let mut h = harness();
    h.memory = pv_verify::MemoryBudget::new(4 * pv_drive::sector_bytes(16));
    let mut p1 = ParentRequest::background(r(0, 16), ParentOpcode::Verify);
    let mut p2 = ParentRequest::background(r(16, 16), ParentOpcode::Verify);
    let (a, b) = (h.next_id(), h.next_id());
    let mut ops = vec![
        VerifyOperation::new(a, VerifyAlgorithm::Verify, &mut p1, h.config),
        VerifyOperation::new(b, VerifyAlgorithm::Verify, &mut p2, h.config),
    ];
    h.step_all(&mut ops);
    h.group.set_quiescing(true);
    pump(&mut h, &mut ops, 6);
    assert!(ops[0].is_finished());
    assert_eq!(ops[1].waiting_on(), Some(WaitReason::Quiesce));
    assert!(h.host.ios(b, DriveOpcode::Read).is_empty());

    h.group.set_quiescing(false);
    h.drive_all(&mut ops).unwrap();
    assert!(ops[1].outcome().unwrap().is_success());
}

#[test]
fn abort_before_reads_skips_all_io() {
    let mut h = harness();
    let mut parent = ParentRequest::background(r(0, 32), ParentOpcode::Verify);
    let id = h.next_id();
    let mut op = VerifyOperation::new(id, VerifyAlgorithm::Verify, &mut parent, h.config);
    op.abort_handle().abort();
    h.drive(&mut op).unwrap();
    let outcome = op.outcome().unwrap();
    assert_eq!(outcome.status, BlockStatus::Aborted);
    assert_eq!(outcome.qualifier, Qualifier::ClientAborted);
    assert!(h.host.io_log.is_empty());
    assert_eq!(final_reports(&h, id), 1);
    assert!(h.locks.held_range(id).is_none());
}

#[test]
fn abort_while_reads_are_in_flight_stops_after_evaluation() {
    let mut h = harness();
    h.group.inject(Fault::ReadMedia { position: 0, lba: 1 });
    let mut parent = ParentRequest::background(r(0, 32), ParentOpcode::Verify);
    let id = h.next_id();
    let mut op = VerifyOperation::new(id, VerifyAlgorithm::Verify, &mut parent, h.config);
    assert_eq!(h.run_op(&mut op).unwrap(), RunStatus::Waiting(WaitReason::Io));
    op.abort_handle().abort();
    h.drive(&mut op).unwrap();

    let outcome = op.outcome().unwrap();
    assert_eq!(outcome.status, BlockStatus::Aborted);
    assert_eq!(outcome.errors.u_media, 1);
    assert!(h.host.ios(id, DriveOpcode::WriteVerify).is_empty());
}

#[test]
fn sibling_generation_follows_read_submission() {
    let mut h = harness();
    h.host.generate_siblings = true;
    let (id, _) = run_background(&mut h, r(0, 32), ParentOpcode::Verify);
    assert_eq!(h.host.generated, vec![(id, 4)]);
    assert!(h.host.cancelled.is_empty());
}

#[test]
fn recovery_verifies_never_generate_siblings() {
    let mut h = harness();
    h.host.generate_siblings = true;
    let mut parent = ParentRequest::read(ParentAlgorithm::Read, r(0, 8), geometry().data_positions());
    let id = h.next_id();
    let mut op = VerifyOperation::for_entry(id, VerifyEntry::Recovery, &mut parent, h.config).unwrap();
    h.drive(&mut op).unwrap();
    assert!(h.host.generated.is_empty());
}

// ── Scenario files ──────────────────────────────────────────────────────────

#[test]
fn scenario_file_round_trips_through_report_log() {
    let dir = tempfile::tempdir().unwrap();
    let scenario = dir.path().join("scenario.json");
    fs::write(
        &scenario,
        r#"{
            "geometry": {"width": 4, "parity_disks": 1, "optimal_block_size": 8, "capacity": 32},
            "seed": 3,
            "faults": [
                {"kind": "read_media", "position": 0, "lba": 3},
                {"kind": "read_media", "position": 2, "lba": 17}
            ],
            "ops": [
                {"entry": "background", "parent": "verify", "start": 0, "blocks": 32},
                {"entry": "recovery", "parent": "read", "start": 2, "blocks": 3, "abort": true}
            ]
        }"#,
    )
    .unwrap();
    let config = ScenarioConfig::from_json(&fs::read_to_string(&scenario).unwrap()).unwrap();
    let result = run_scenario(&config).unwrap();

    assert_eq!(result.ops.len(), 2);
    assert!(result.ops[0].outcome.unwrap().is_success());
    assert_eq!(result.ops[1].outcome.unwrap().status, BlockStatus::Aborted);
    assert!(result.ops.iter().all(|op| op.fault.is_none()));
    assert!(result.incoherent.is_empty());

    let log_path = dir.path().join("reports.jsonl");
    let mut log = ReportLog::new(fs::File::create(&log_path).unwrap());
    for report in &result.reports {
        log.append(report).unwrap();
    }
    assert_eq!(log.written(), result.reports.len() as u64);
    let parsed = parse_reports(&fs::read_to_string(&log_path).unwrap()).unwrap();
    assert_eq!(parsed, result.reports);
    assert_eq!(parsed.iter().filter(|r| r.is_final()).count(), 2);
}

// ── Properties ──────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Any single corrupted sector is found, repaired and reported once.
    #[test]
    fn any_single_corruption_is_repaired(pos in 0_u16..4, lba in 0_u64..32, bit in 0_u32..4096) {
        let mut h = harness();
        h.group.inject(Fault::FlipBit { position: pos, lba, bit });
        let (id, outcome) = run_background(&mut h, r(0, 32), ParentOpcode::Verify);
        prop_assert_eq!(outcome.qualifier, Qualifier::CompleteWithRemap);
        prop_assert_eq!(outcome.errors.c_crc, 1);
        prop_assert!(h.group.audit().is_empty());
        prop_assert_eq!(final_reports(&h, id), 1);
    }

    /// A single media error is always rebuilt whatever the pass size.
    #[test]
    fn media_error_repaired_for_any_pass_size(pos in 0_u16..4, lba in 0_u64..32, pass in 1_u64..40) {
        let mut h = harness();
        h.config.max_blocks_per_pass = pass;
        h.group.inject(Fault::ReadMedia { position: pos, lba });
        let (_, outcome) = run_background(&mut h, r(0, 32), ParentOpcode::Verify);
        prop_assert_eq!(outcome.status, BlockStatus::Success);
        prop_assert_eq!(outcome.errors.c_media, 1);
        prop_assert!(h.group.audit().is_empty());
    }
}
