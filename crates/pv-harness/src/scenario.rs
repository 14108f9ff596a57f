//! JSON-described verify scenarios.
//!
//! A scenario names a group geometry, the faults to inject after
//! formatting, and the operations to run concurrently. The result carries
//! each operation's outcome, every report and notice, and whether the
//! group ended parity-coherent.

use crate::sim::{pattern_sector, Fault};
use crate::Harness;
use anyhow::{Context, Result};
use pv_types::{BlockRange, Lba, OperationId, Position, PositionMask, RaidGeometry};
use pv_verify::{
    CrcNotice, ErrorReport, ParentAlgorithm, ParentOpcode, ParentRequest, VerifyAlgorithm,
    VerifyConfig, VerifyEntry, VerifyOperation, VerifyOutcome,
};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeometryConfig {
    pub width: u16,
    pub parity_disks: u16,
    pub optimal_block_size: u64,
    pub capacity: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioConfig {
    pub geometry: GeometryConfig,
    #[serde(default)]
    pub seed: u64,
    #[serde(default = "default_memory")]
    pub memory_bytes: usize,
    #[serde(default)]
    pub verify: VerifyConfig,
    #[serde(default)]
    pub degraded: Vec<u16>,
    #[serde(default)]
    pub faults: Vec<Fault>,
    pub ops: Vec<ScenarioOp>,
}

fn default_memory() -> usize {
    1 << 24
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioOp {
    pub entry: VerifyEntry,
    pub parent: ParentAlgorithm,
    /// Defaults to the opcode the parent algorithm implies.
    #[serde(default)]
    pub opcode: Option<ParentOpcode>,
    pub start: u64,
    pub blocks: u64,
    /// Pattern seed for the new data a write parent carries.
    #[serde(default)]
    pub write_seed: Option<u64>,
    /// Positions where the parent's own read took a retryable error.
    #[serde(default)]
    pub retryable: Vec<u16>,
    /// Abort before the first step.
    #[serde(default)]
    pub abort: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpResult {
    pub id: OperationId,
    pub algorithm: VerifyAlgorithm,
    pub outcome: Option<VerifyOutcome>,
    pub remap_needed: bool,
    pub blocks_transferred: u64,
    pub fault: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioResult {
    pub ops: Vec<OpResult>,
    pub reports: Vec<ErrorReport>,
    pub notices: Vec<CrcNotice>,
    pub ios: usize,
    /// Stripes whose parity or checksums are still wrong.
    pub incoherent: Vec<Lba>,
}

impl ScenarioConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("parsing scenario")
    }
}

fn mask(positions: &[u16]) -> PositionMask {
    positions.iter().map(|p| Position(*p)).collect()
}

/// Build the parent request a scenario operation describes.
fn parent_for(op: &ScenarioOp, geometry: RaidGeometry, seed: u64) -> ParentRequest {
    use ParentAlgorithm as P;
    let range = BlockRange::new(Lba(op.start), op.blocks);
    let mut parent = match op.parent {
        P::Verify => ParentRequest::background(range, op.opcode.unwrap_or(ParentOpcode::Verify)),
        P::Read | P::SmallRead | P::DegradedRead => {
            ParentRequest::read(op.parent, range, geometry.data_positions())
        }
        _ => {
            let write_seed = op.write_seed.unwrap_or(seed.wrapping_add(1));
            let buffers = geometry
                .data_positions()
                .iter()
                .map(|pos| (pos, host_data(write_seed, pos, range)))
                .collect();
            ParentRequest::write(op.parent, range, buffers)
        }
    };
    if let Some(opcode) = op.opcode {
        parent.opcode = opcode;
    }
    parent.with_retryable(mask(&op.retryable))
}

/// Sealed pattern data for one position over `range`.
#[must_use]
pub fn host_data(seed: u64, pos: Position, range: BlockRange) -> Vec<u8> {
    (0..range.blocks)
        .flat_map(|i| pattern_sector(seed, pos, range.start.offset(i)))
        .collect()
}

/// Run every operation of `config` to completion.
pub fn run_scenario(config: &ScenarioConfig) -> Result<ScenarioResult> {
    let g = &config.geometry;
    let geometry = RaidGeometry::new(g.width, g.parity_disks, g.optimal_block_size, g.capacity)
        .context("invalid scenario geometry")?;
    let mut harness = Harness::new(geometry, config.memory_bytes, config.seed)?;
    harness.config = config.verify;
    harness.group.set_degraded(mask(&config.degraded));
    for fault in &config.faults {
        harness.group.inject(*fault);
    }

    let mut parents: Vec<ParentRequest> = config
        .ops
        .iter()
        .map(|op| parent_for(op, geometry, config.seed))
        .collect();
    let ids: Vec<OperationId> = config.ops.iter().map(|_| harness.next_id()).collect();

    let mut results = Vec::with_capacity(ids.len());
    {
        let mut ops = Vec::with_capacity(ids.len());
        for ((scenario_op, parent), id) in config.ops.iter().zip(parents.iter_mut()).zip(&ids) {
            let op = VerifyOperation::for_entry(*id, scenario_op.entry, parent, harness.config)
                .with_context(|| format!("creating {id}"))?;
            if scenario_op.abort {
                op.abort_handle().abort();
            }
            ops.push(op);
        }
        harness.drive_all(&mut ops)?;
        for op in &ops {
            results.push(OpResult {
                id: op.id(),
                algorithm: op.algorithm(),
                outcome: op.outcome().copied(),
                remap_needed: false,
                blocks_transferred: 0,
                fault: harness
                    .faults
                    .iter()
                    .find(|(f, _)| *f == op.id())
                    .map(|(_, e)| e.clone()),
            });
        }
    }
    for (result, parent) in results.iter_mut().zip(&parents) {
        result.remap_needed = parent.remap_needed;
        result.blocks_transferred = parent.blocks_transferred;
    }

    let incoherent = harness.group.audit();
    info!(
        target: "pv::harness",
        ops = results.len(),
        reports = harness.host.reports.len(),
        incoherent = incoherent.len(),
        "scenario_finished"
    );
    Ok(ScenarioResult {
        ops: results,
        reports: std::mem::take(&mut harness.host.reports),
        notices: std::mem::take(&mut harness.host.notices),
        ios: harness.host.io_log.len(),
        incoherent,
    })
}
