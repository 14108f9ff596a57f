#![forbid(unsafe_code)]
//! Error types for the parity verify engine.
//!
//! # Error Taxonomy
//!
//! Two kinds of failure leave a verify operation, and they never share a
//! channel:
//!
//! | Kind | Carrier | Seen by |
//! |------|---------|---------|
//! | Data-recovery outcome (media error, dead group, abort, allocation failure) | `VerifyOutcome` in `pv-verify` | The caller that started the operation |
//! | Programming-invariant violation | [`VerifyError::Invariant`] | The driver, which traces it and faults the operation |
//!
//! A `VerifyError` is never converted into a block status. An operation that
//! returns one from its step function halts where it stands.
//!
//! | Variant | Raised by | Example |
//! |---------|-----------|---------|
//! | `Invariant` | Any state | `parity_count > xfer_count`, error count above group width, write without exclusive lock |
//! | `InvalidRequest` | `VerifyOperation::start` | Range outside the group, parent/algorithm mismatch |
//! | `Geometry` | Geometry and engine construction | Width above 16, parity layout the engine cannot compute |
//! | `Config` | Configuration loading | Zero `max_blocks_per_pass` |
//! | `Io` | Event-log sinks, harness | Failed JSONL append |
//!
//! ## Design Constraints
//!
//! - `pv-error` MUST NOT depend on `pv-types`; geometry errors arrive here
//!   already rendered.
//! - String payloads are owned so errors can outlive the state that raised them.

use thiserror::Error;

/// Unified error type for parity verify operations.
#[derive(Debug, Error)]
pub enum VerifyError {
    /// A state observed a combination the engine guarantees cannot happen.
    #[error("invariant violated in {state}: {detail}")]
    Invariant { state: &'static str, detail: String },

    /// The request handed to `start` cannot be executed.
    #[error("invalid verify request: {0}")]
    InvalidRequest(String),

    /// Group or engine geometry is unusable.
    #[error("invalid geometry: {0}")]
    Geometry(String),

    /// Configuration value out of range.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl VerifyError {
    /// Build an invariant violation for `state`.
    pub fn invariant(state: &'static str, detail: impl Into<String>) -> Self {
        Self::Invariant {
            state,
            detail: detail.into(),
        }
    }

    /// True for programming-invariant failures.
    #[must_use]
    pub fn is_invariant(&self) -> bool {
        matches!(self, Self::Invariant { .. })
    }

    /// State name attached to an invariant violation.
    #[must_use]
    pub fn state(&self) -> Option<&'static str> {
        match self {
            Self::Invariant { state, .. } => Some(state),
            Self::InvalidRequest(_) | Self::Geometry(_) | Self::Config(_) | Self::Io(_) => None,
        }
    }
}

/// Result alias using `VerifyError`.
pub type Result<T> = std::result::Result<T, VerifyError>;
