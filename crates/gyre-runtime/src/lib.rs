#![forbid(unsafe_code)]

//! Runtime: the observable scene store, selector subscriptions and the
//! consumers built on them, the frame clock, and the update driver.
//!
//! # Data flow
//!
//! ```text
//! FrameClock ──tick──► UpdateDriver ──advance()──► Store
//!                                                   │ notification pass
//!                          ┌────────────────────────┼───────────────────┐
//!                          ▼                        ▼                   ▼
//!                   RenderCoupled            RenderDecoupled      InstancedBatch
//!                 (props + redraw)         (holder, read per frame)  (one buffer)
//! ```
//!
//! Everything here is single-threaded: stores, consumers and schedulers are
//! `Rc`-based and never leave the thread that created them.

pub mod driver;
pub mod frame_clock;
pub mod reactive;
pub mod render_boundary;
pub mod store;

pub use driver::{DriverConfig, StepPolicy, TickRateMeter, UpdateDriver};
pub use frame_clock::{FrameClock, FrameLoop, FrameScheduler, TickHandle};
pub use reactive::{
    InstanceTransform, InstancedBatch, Observer, RedrawRequest, RenderCoupled, RenderDecoupled,
    Subscription, SubscriptionId, ValueHolder, select,
};
pub use render_boundary::{RenderBoundary, RenderFailure};
pub use store::{
    DEFAULT_STEP, ListenerFailure, MAX_NOTIFY_PASSES, Store, StoreConfig, StoreStats,
};
