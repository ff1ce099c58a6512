#![forbid(unsafe_code)]

//! Reactive bindings between the scene store and its consumers.
//!
//! - [`Observer`] / [`Subscription`]: the selector subscription capability
//!   and its RAII guard.
//! - [`select`]: ready-made selectors and equality functions.
//! - [`RenderCoupled`]: consumers that re-render when their projection
//!   changes, with redraws coalesced through a [`RedrawRequest`].
//! - [`RenderDecoupled`] / [`ValueHolder`]: consumers that receive values
//!   into a holder and read them on their own per-frame schedule.
//! - [`InstancedBatch`]: a single whole-scene consumer writing one transform
//!   per item.
//!
//! # Architecture
//!
//! The store holds subscriptions as type-erased entries in a `BTreeMap`
//! keyed by a monotonically increasing id, which gives registration order
//! for free. Consumers own their [`Subscription`]; dropping the consumer
//! detaches it.
//!
//! # Invariants
//!
//! 1. An observer is called at most once per notification pass, and only
//!    when its projection differs from the last one it saw.
//! 2. Observers are notified in registration order.
//! 3. Dropping a [`Subscription`] stops delivery immediately, including for
//!    the rest of a pass already in progress.
//! 4. A consumer for a missing item receives `None` once and renders
//!    nothing.

pub mod consumer;
pub mod instanced;
pub mod select;
pub mod subscription;

pub use consumer::{RedrawRequest, RenderCoupled, RenderDecoupled, ValueHolder};
pub use instanced::{InstanceTransform, InstancedBatch};
pub use subscription::{Observer, Subscription, SubscriptionId};
