#![forbid(unsafe_code)]

//! Core: scene state model, error taxonomy, and cooperative cancellation.

pub mod cancel;
pub mod error;
pub mod state;

pub use cancel::{CancelError, CancelHandle, CancelScope, LabClock};
pub use error::StoreError;
pub use state::{ItemId, Orientation, OrientationMap, Positions, SceneState, checked_count};
