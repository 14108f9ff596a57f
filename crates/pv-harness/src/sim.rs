//! In-memory redundant group with fault injection.
//!
//! Every member position is a flat vector of 520-byte sectors. Reads and
//! writes complete synchronously when the harness pumps them; injected
//! faults decide the completion status.

use parking_lot::{Mutex, RwLock};
use pv_drive::{sector_bytes, DriveCompletion, DriveIo, DriveOpcode, DriveStatus};
use pv_types::{BlockRange, Lba, Position, PositionMask, RaidGeometry, SECTOR_BYTES, SECTOR_PAYLOAD_BYTES};
use pv_verify::RaidGroupView;
use pv_xor::sector;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, trace};

/// Fault injected into one member position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Fault {
    /// Reads covering `lba` fail with a hard media error until it is rewritten.
    ReadMedia { position: u16, lba: u64 },
    /// The next write-verify covering `lba` fails there.
    WriteVerifyMedia { position: u16, lba: u64 },
    /// The next write completes with a soft media error.
    SoftMedia { position: u16 },
    /// The next `times` requests fail as retryable.
    Retryable { position: u16, times: u32 },
    /// The position stops responding.
    Dead { position: u16 },
    /// Flip one payload bit of the stored sector, leaving its checksum stale.
    FlipBit { position: u16, lba: u64, bit: u32 },
    /// Overwrite the stored sector with the invalidation pattern.
    Invalidate { position: u16, lba: u64 },
}

#[derive(Debug, Default)]
struct SimDrive {
    data: Vec<u8>,
    read_media: Vec<Lba>,
    write_verify_media: Vec<Lba>,
    soft_media: u32,
    retryable: u32,
    dead: bool,
}

impl SimDrive {
    fn sector_mut(&mut self, lba: Lba) -> Option<&mut [u8]> {
        let at = sector_bytes(lba.0);
        self.data.get_mut(at..at + SECTOR_BYTES)
    }

    fn read(&self, range: BlockRange, buffer: &mut [u8]) -> DriveStatus {
        let at = sector_bytes(range.start.0);
        let len = sector_bytes(range.blocks);
        if let (Some(src), Some(dst)) = (self.data.get(at..at + len), buffer.get_mut(..len)) {
            dst.copy_from_slice(src);
        }
        let mut bad = None;
        for lba in self.read_media.iter().filter(|l| range.contains(**l)) {
            let index = sector_bytes(lba.0 - range.start.0);
            if let Some(s) = buffer.get_mut(index..index + SECTOR_BYTES) {
                s.fill(0);
            }
            bad = Some(bad.map_or(*lba, |b: Lba| b.min(*lba)));
        }
        bad.map_or(DriveStatus::Success, |bad_lba| DriveStatus::MediaError { bad_lba })
    }

    fn write(&mut self, opcode: DriveOpcode, range: BlockRange, buffer: &[u8]) -> DriveStatus {
        let at = sector_bytes(range.start.0);
        let len = sector_bytes(range.blocks);
        if let (Some(dst), Some(src)) = (self.data.get_mut(at..at + len), buffer.get(..len)) {
            dst.copy_from_slice(src);
        }
        self.read_media.retain(|l| !range.contains(*l));
        if opcode == DriveOpcode::WriteVerify {
            if let Some(i) = self.write_verify_media.iter().position(|l| range.contains(*l)) {
                let bad_lba = self.write_verify_media.swap_remove(i);
                return DriveStatus::MediaError { bad_lba };
            }
        }
        if self.soft_media > 0 {
            self.soft_media -= 1;
            return DriveStatus::SoftMediaError;
        }
        DriveStatus::Success
    }
}

/// Deterministic payload byte for a formatted sector.
#[must_use]
pub fn pattern_byte(seed: u64, pos: Position, lba: Lba, offset: usize) -> u8 {
    let mixed = seed
        .wrapping_mul(0x9e37_79b9)
        .wrapping_add(lba.0.wrapping_mul(131))
        .wrapping_add(u64::from(pos.0) * 31)
        .wrapping_add(offset as u64);
    mixed.to_le_bytes()[0]
}

/// One sealed sector of the deterministic pattern.
#[must_use]
pub fn pattern_sector(seed: u64, pos: Position, lba: Lba) -> Vec<u8> {
    let mut s = vec![0_u8; SECTOR_BYTES];
    for (i, b) in s[..SECTOR_PAYLOAD_BYTES].iter_mut().enumerate() {
        *b = pattern_byte(seed, pos, lba, i);
    }
    sector::seal(&mut s, lba);
    s
}

/// Simulated redundant group.
#[derive(Debug)]
pub struct SimGroup {
    geometry: RaidGeometry,
    drives: Vec<Mutex<SimDrive>>,
    degraded: RwLock<PositionMask>,
    quiescing: AtomicBool,
}

impl SimGroup {
    #[must_use]
    pub fn new(geometry: RaidGeometry) -> Self {
        let bytes = sector_bytes(geometry.capacity());
        let drives = (0..geometry.width())
            .map(|_| {
                Mutex::new(SimDrive {
                    data: vec![0; bytes],
                    ..SimDrive::default()
                })
            })
            .collect();
        Self {
            geometry,
            drives,
            degraded: RwLock::new(PositionMask::EMPTY),
            quiescing: AtomicBool::new(false),
        }
    }

    /// Fill every stripe with the `seed` pattern and matching parity.
    pub fn format(&self, seed: u64) {
        let parity = self.geometry.parity_positions();
        for lba in (0..self.geometry.capacity()).map(Lba) {
            let mut p = vec![0_u8; SECTOR_BYTES];
            for pos in self.geometry.data_positions().iter() {
                let s = pattern_sector(seed, pos, lba);
                sector::xor_payload(&mut p, &s);
                self.write_sector(pos, lba, &s);
            }
            sector::seal(&mut p, lba);
            for pos in parity.iter() {
                self.write_sector(pos, lba, &p);
            }
        }
        debug!(target: "pv::harness", seed, blocks = self.geometry.capacity(), "group_formatted");
    }

    fn write_sector(&self, pos: Position, lba: Lba, data: &[u8]) {
        if let Some(drive) = self.drives.get(pos.index()) {
            if let Some(dst) = drive.lock().sector_mut(lba) {
                dst.copy_from_slice(data);
            }
        }
    }

    #[must_use]
    pub fn sector(&self, pos: Position, lba: Lba) -> Option<Vec<u8>> {
        let drive = self.drives.get(pos.index())?.lock();
        let at = sector_bytes(lba.0);
        drive.data.get(at..at + SECTOR_BYTES).map(<[u8]>::to_vec)
    }

    /// Copy of every position's media.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Vec<u8>> {
        self.drives.iter().map(|d| d.lock().data.clone()).collect()
    }

    /// Blocks whose sectors fail their checks or whose parity disagrees
    /// with the data. Degraded positions are skipped, and parity is not
    /// checked on a stripe missing a member.
    #[must_use]
    pub fn audit(&self) -> Vec<Lba> {
        let degraded = self.degraded_mask();
        (0..self.geometry.capacity())
            .map(Lba)
            .filter(|&lba| {
                let mut x = vec![0_u8; SECTOR_BYTES];
                let mut bad = false;
                for pos in (self.geometry.all_positions() - degraded).iter() {
                    let Some(s) = self.sector(pos, lba) else {
                        return true;
                    };
                    bad |= sector::check(&s, lba) != sector::SectorCheck::Good;
                    sector::xor_payload(&mut x, &s);
                }
                bad || (degraded.is_empty() && sector::payload(&x).iter().any(|b| *b != 0))
            })
            .collect()
    }

    pub fn inject(&self, fault: Fault) {
        let pos = match fault {
            Fault::ReadMedia { position, .. }
            | Fault::WriteVerifyMedia { position, .. }
            | Fault::SoftMedia { position }
            | Fault::Retryable { position, .. }
            | Fault::Dead { position }
            | Fault::FlipBit { position, .. }
            | Fault::Invalidate { position, .. } => Position(position),
        };
        let Some(drive) = self.drives.get(pos.index()) else {
            return;
        };
        let mut drive = drive.lock();
        match fault {
            Fault::ReadMedia { lba, .. } => drive.read_media.push(Lba(lba)),
            Fault::WriteVerifyMedia { lba, .. } => drive.write_verify_media.push(Lba(lba)),
            Fault::SoftMedia { .. } => drive.soft_media += 1,
            Fault::Retryable { times, .. } => drive.retryable += times,
            Fault::Dead { .. } => drive.dead = true,
            Fault::FlipBit { lba, bit, .. } => {
                if let Some(s) = drive.sector_mut(Lba(lba)) {
                    let byte = (bit / 8) as usize % SECTOR_PAYLOAD_BYTES;
                    s[byte] ^= 1 << (bit % 8);
                }
            }
            Fault::Invalidate { lba, .. } => {
                if let Some(s) = drive.sector_mut(Lba(lba)) {
                    sector::invalidate(s, Lba(lba));
                }
            }
        }
        debug!(target: "pv::harness", ?fault, "fault_injected");
    }

    pub fn set_degraded(&self, mask: PositionMask) {
        *self.degraded.write() = mask;
    }

    pub fn set_quiescing(&self, quiescing: bool) {
        self.quiescing.store(quiescing, Ordering::Release);
    }

    /// Execute one drive I/O against the simulated media.
    pub fn process(&self, io: DriveIo) -> DriveCompletion {
        let DriveIo {
            op,
            position,
            opcode,
            range,
            mut buffer,
        } = io;
        let status = match self.drives.get(position.index()) {
            None => DriveStatus::Dead,
            Some(_) if self.is_position_degraded(position) => DriveStatus::Dead,
            Some(drive) => {
                let mut drive = drive.lock();
                if drive.dead {
                    DriveStatus::Dead
                } else if drive.retryable > 0 {
                    drive.retryable -= 1;
                    DriveStatus::Retryable
                } else if opcode.is_write() {
                    drive.write(opcode, range, &buffer)
                } else {
                    drive.read(range, &mut buffer)
                }
            }
        };
        trace!(target: "pv::harness", %op, %position, ?opcode, %range, ?status, "io_completed");
        DriveCompletion {
            op,
            position,
            status,
            buffer,
        }
    }
}

impl RaidGroupView for SimGroup {
    fn geometry(&self) -> RaidGeometry {
        self.geometry
    }

    fn is_position_degraded(&self, pos: Position) -> bool {
        self.degraded.read().contains(pos)
    }

    fn is_quiescing(&self) -> bool {
        self.quiescing.load(Ordering::Acquire)
    }

    fn degraded_mask(&self) -> PositionMask {
        *self.degraded.read()
    }
}
