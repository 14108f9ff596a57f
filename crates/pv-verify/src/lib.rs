#![forbid(unsafe_code)]
//! Parity verify and recovery-verify for a parity-protected redundant group.
//!
//! A [`VerifyOperation`] reads every member position of a stripe range,
//! classifies what came back, lets the parity engine check and rebuild the
//! strip, writes corrections back when it holds the right to, and hands its
//! caller exactly one [`VerifyOutcome`].
//!
//! The operation never blocks. It talks to the outside world through the
//! collaborators bundled in [`VerifyContext`]: the group view for degraded
//! state, the [`LockCoordinator`], the [`BufferPool`], the
//! [`ParityEngine`](pv_xor::ParityEngine) and the [`OperationHost`] that
//! submits drive I/O and collects reports.

pub mod algorithm;
pub mod config;
pub mod host;
pub mod lock;
pub mod memory;
pub mod operation;
pub mod parent;
pub mod policy;
pub mod region;
pub mod report;

pub use algorithm::{ParentAlgorithm, RecoveryKind, VerifyAlgorithm, VerifyEntry};
pub use config::VerifyConfig;
pub use host::{AbortHandle, CrcNotice, NoticeStatus, OperationHost, RaidGroupView, VerifyContext};
pub use lock::{LockCoordinator, LockGrant, LockMode, RangeLockTable};
pub use memory::{AllocGrant, BufferPool, DeferredGrant, MemoryBudget};
pub use operation::{RunStatus, VerifyOperation, VerifyState, WaitReason};
pub use parent::{ParentOpcode, ParentRequest};
pub use report::{parse_reports, BlockStatus, ErrorReport, Qualifier, ReportLog, VerifyOutcome};
