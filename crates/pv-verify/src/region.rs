//! Region mining: narrowing a pass to one optimal-block-size region.

use pv_types::Lba;

/// Blocks in the next mined region starting at `parity_start`.
///
/// An unaligned start runs to the next region boundary; an aligned start
/// takes a whole region. Never more than `xfer_count`.
#[must_use]
pub fn region_mining_count(parity_start: Lba, xfer_count: u64, region: u64) -> u64 {
    if region == 0 {
        return 0;
    }
    let offset = parity_start.0 % region;
    let count = if offset == 0 { region } else { region - offset };
    count.min(xfer_count)
}
