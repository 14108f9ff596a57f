//! Verify algorithm variants and their selection from the parent request.

use pv_error::{Result, VerifyError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Flavor of recovery verify, named after the parent path it serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryKind {
    ForRead,
    For468Write,
    ForReadModifyWrite,
    ForReconstructWrite,
    ForDegradedRead,
    ForDegradedRecovery,
    ForJournalFlush,
}

/// Algorithm a verify operation runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyAlgorithm {
    /// Background verify of a stripe range.
    Verify,
    /// Foreground verify under a degraded write; never widens its range.
    DegradedVerify,
    RecoveryVerify(RecoveryKind),
}

/// Algorithm of the request that spawned the verify.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParentAlgorithm {
    Verify,
    Read,
    SmallRead,
    Write468,
    CorruptData,
    ReadModifyWrite,
    ReconstructWrite,
    DegradedRead,
    DegradedReadModifyWrite,
    Degraded468,
    DegradedReconstructWrite,
    FlushJournal,
}

impl ParentAlgorithm {
    fn is_degraded_write(self) -> bool {
        matches!(
            self,
            Self::DegradedReadModifyWrite | Self::Degraded468 | Self::DegradedReconstructWrite
        )
    }
}

/// Path through which a verify is requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyEntry {
    Background,
    Degraded,
    DegradedRecovery,
    Recovery,
}

impl VerifyAlgorithm {
    /// Pick the algorithm for a verify requested through `entry` by a parent
    /// running `parent`.
    pub fn resolve(entry: VerifyEntry, parent: ParentAlgorithm) -> Result<Self> {
        use ParentAlgorithm as P;
        let alg = match (entry, parent) {
            (VerifyEntry::Background, P::Verify) => Self::Verify,
            (VerifyEntry::Degraded, p) if p.is_degraded_write() => Self::DegradedVerify,
            (VerifyEntry::DegradedRecovery, P::DegradedRead) => {
                Self::RecoveryVerify(RecoveryKind::ForDegradedRead)
            }
            (VerifyEntry::DegradedRecovery, p) if p.is_degraded_write() => {
                Self::RecoveryVerify(RecoveryKind::ForDegradedRecovery)
            }
            (VerifyEntry::DegradedRecovery, P::FlushJournal) => {
                Self::RecoveryVerify(RecoveryKind::ForJournalFlush)
            }
            (VerifyEntry::Recovery, P::Read | P::SmallRead) => {
                Self::RecoveryVerify(RecoveryKind::ForRead)
            }
            (VerifyEntry::Recovery, P::Write468 | P::CorruptData) => {
                Self::RecoveryVerify(RecoveryKind::For468Write)
            }
            (VerifyEntry::Recovery, P::ReadModifyWrite) => {
                Self::RecoveryVerify(RecoveryKind::ForReadModifyWrite)
            }
            (VerifyEntry::Recovery, P::ReconstructWrite) => {
                Self::RecoveryVerify(RecoveryKind::ForReconstructWrite)
            }
            (entry, parent) => {
                return Err(VerifyError::InvalidRequest(format!(
                    "no verify algorithm for {entry:?} entry from {parent:?} parent"
                )));
            }
        };
        Ok(alg)
    }

    /// Whether a parent running `parent` may own this algorithm.
    #[must_use]
    pub fn accepts_parent(self, parent: ParentAlgorithm) -> bool {
        let entry = match self {
            Self::Verify => VerifyEntry::Background,
            Self::DegradedVerify => VerifyEntry::Degraded,
            Self::RecoveryVerify(
                RecoveryKind::ForDegradedRead
                | RecoveryKind::ForDegradedRecovery
                | RecoveryKind::ForJournalFlush,
            ) => VerifyEntry::DegradedRecovery,
            Self::RecoveryVerify(_) => VerifyEntry::Recovery,
        };
        Self::resolve(entry, parent).is_ok_and(|alg| alg == self)
    }

    #[must_use]
    pub fn is_plain_verify(self) -> bool {
        self == Self::Verify
    }

    #[must_use]
    pub fn is_degraded_verify(self) -> bool {
        self == Self::DegradedVerify
    }

    /// Recoveries whose parent reads the reconstructed data.
    #[must_use]
    pub fn is_read_recovery(self) -> bool {
        matches!(
            self,
            Self::RecoveryVerify(RecoveryKind::ForRead | RecoveryKind::ForDegradedRead)
        )
    }

    /// Recoveries that merge the parent's new data and rewrite the stripe.
    #[must_use]
    pub fn is_write_path(self) -> bool {
        matches!(
            self,
            Self::RecoveryVerify(
                RecoveryKind::For468Write
                    | RecoveryKind::ForReadModifyWrite
                    | RecoveryKind::ForReconstructWrite
                    | RecoveryKind::ForDegradedRecovery
            )
        )
    }

    /// Algorithms allowed to write corrections back despite hard media errors.
    #[must_use]
    pub fn writes_through_media_errors(self) -> bool {
        matches!(
            self,
            Self::Verify
                | Self::DegradedVerify
                | Self::RecoveryVerify(
                    RecoveryKind::ForDegradedRecovery
                        | RecoveryKind::ForDegradedRead
                        | RecoveryKind::ForJournalFlush
                )
        )
    }

    /// Recovery verifies widen their range to the optimal block size.
    #[must_use]
    pub fn aligns_range(self) -> bool {
        matches!(self, Self::RecoveryVerify(_))
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Verify => "verify",
            Self::DegradedVerify => "degraded_verify",
            Self::RecoveryVerify(RecoveryKind::ForRead) => "read_verify",
            Self::RecoveryVerify(RecoveryKind::For468Write) => "468_verify",
            Self::RecoveryVerify(RecoveryKind::ForReadModifyWrite) => "mr3_verify",
            Self::RecoveryVerify(RecoveryKind::ForReconstructWrite) => "rcw_verify",
            Self::RecoveryVerify(RecoveryKind::ForDegradedRead) => "degraded_read_verify",
            Self::RecoveryVerify(RecoveryKind::ForDegradedRecovery) => "degraded_recovery_verify",
            Self::RecoveryVerify(RecoveryKind::ForJournalFlush) => "journal_flush_verify",
        }
    }
}

impl fmt::Display for VerifyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn degraded_entry_accepts_only_degraded_writes() {
        assert_eq!(
            VerifyAlgorithm::resolve(VerifyEntry::Degraded, ParentAlgorithm::Degraded468).unwrap(),
            VerifyAlgorithm::DegradedVerify
        );
        assert!(VerifyAlgorithm::resolve(VerifyEntry::Degraded, ParentAlgorithm::Read).is_err());
    }

    #[test]
    fn degraded_recovery_entry_maps_by_parent() {
        let r = |p| VerifyAlgorithm::resolve(VerifyEntry::DegradedRecovery, p).unwrap();
        assert_eq!(
            r(ParentAlgorithm::DegradedRead),
            VerifyAlgorithm::RecoveryVerify(RecoveryKind::ForDegradedRead)
        );
        assert_eq!(
            r(ParentAlgorithm::DegradedReconstructWrite),
            VerifyAlgorithm::RecoveryVerify(RecoveryKind::ForDegradedRecovery)
        );
        assert_eq!(
            r(ParentAlgorithm::FlushJournal),
            VerifyAlgorithm::RecoveryVerify(RecoveryKind::ForJournalFlush)
        );
    }

    #[test]
    fn recovery_entry_maps_by_parent() {
        let r = |p| VerifyAlgorithm::resolve(VerifyEntry::Recovery, p).unwrap();
        assert_eq!(r(ParentAlgorithm::SmallRead), VerifyAlgorithm::RecoveryVerify(RecoveryKind::ForRead));
        assert_eq!(
            r(ParentAlgorithm::CorruptData),
            VerifyAlgorithm::RecoveryVerify(RecoveryKind::For468Write)
        );
        assert!(VerifyAlgorithm::resolve(VerifyEntry::Recovery, ParentAlgorithm::DegradedRead).is_err());
    }

    #[test]
    fn accepts_parent_round_trips_resolution() {
        let alg = VerifyAlgorithm::RecoveryVerify(RecoveryKind::ForReadModifyWrite);
        assert!(alg.accepts_parent(ParentAlgorithm::ReadModifyWrite));
        assert!(!alg.accepts_parent(ParentAlgorithm::ReconstructWrite));
        assert!(VerifyAlgorithm::Verify.accepts_parent(ParentAlgorithm::Verify));
    }

    #[test]
    fn write_through_list_is_exact() {
        use RecoveryKind as K;
        let allowed: Vec<_> = [
            VerifyAlgorithm::Verify,
            VerifyAlgorithm::DegradedVerify,
            VerifyAlgorithm::RecoveryVerify(K::ForRead),
            VerifyAlgorithm::RecoveryVerify(K::For468Write),
            VerifyAlgorithm::RecoveryVerify(K::ForReadModifyWrite),
            VerifyAlgorithm::RecoveryVerify(K::ForReconstructWrite),
            VerifyAlgorithm::RecoveryVerify(K::ForDegradedRead),
            VerifyAlgorithm::RecoveryVerify(K::ForDegradedRecovery),
            VerifyAlgorithm::RecoveryVerify(K::ForJournalFlush),
        ]
        .into_iter()
        .filter(|a| a.writes_through_media_errors())
        .map(VerifyAlgorithm::name)
        .collect();
        assert_eq!(
            allowed,
            [
                "verify",
                "degraded_verify",
                "degraded_read_verify",
                "degraded_recovery_verify",
                "journal_flush_verify"
            ]
        );
    }
}
