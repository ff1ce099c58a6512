#![forbid(unsafe_code)]

//! Error taxonomy for store transitions.
//!
//! Only rejected transitions are errors. A selector reading a missing item
//! yields `None` rather than an error, and listener failures are reported to a
//! diagnostic sink instead of being returned to the caller that triggered the
//! transition.

use thiserror::Error;

/// Convenience alias for results produced by store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Reasons a transition can be rejected.
///
/// A rejected transition never mutates the current state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// `initialize` was called with a count that cannot be represented:
    /// negative, or too large to assign every item a unique id.
    #[error("invalid item count {requested} (expected 0..={max})")]
    InvalidCount { requested: i64, max: u64 },
}

impl StoreError {
    #[must_use]
    pub fn invalid_count(requested: i64) -> Self {
        Self::InvalidCount {
            requested,
            max: u64::from(u32::MAX) + 1,
        }
    }
}
