#![forbid(unsafe_code)]

//! Gyre public facade crate.
//!
//! An observable scene store that drives many independently animated items,
//! with per-consumer choice between render-coupled and render-decoupled
//! updates.
//!
//! ```
//! use gyre::prelude::*;
//!
//! let store = Store::with_config(StoreConfig::default().with_seed(1));
//! store.initialize(3)?;
//! let view = RenderCoupled::item(&store, ItemId(0), None);
//! store.advance();
//! assert!(view.needs_render());
//! # Ok::<(), StoreError>(())
//! ```

pub use gyre_core as core;
#[cfg(feature = "runtime")]
pub use gyre_runtime as runtime;

pub mod prelude {
    pub use gyre_core::{
        CancelError, CancelHandle, CancelScope, ItemId, LabClock, Orientation, Positions,
        SceneState, StoreError,
    };

    #[cfg(feature = "runtime")]
    pub use gyre_runtime::{
        DriverConfig, FrameClock, FrameLoop, FrameScheduler, InstancedBatch, ListenerFailure,
        Observer, RedrawRequest, RenderBoundary, RenderCoupled, RenderDecoupled, StepPolicy, Store,
        StoreConfig, Subscription, UpdateDriver, ValueHolder, select,
    };
}
