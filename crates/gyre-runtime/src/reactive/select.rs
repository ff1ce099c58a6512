#![forbid(unsafe_code)]

//! Ready-made selectors and equalities.
//!
//! Selectors project a [`SceneState`] onto the slice a consumer cares about.
//! An item selector returns `None` once its id is gone (after a shrinking
//! re-initialize); consumers treat that as "render nothing".

use std::sync::Arc;

use gyre_core::state::{ItemId, Orientation, Positions, SceneState};

/// Orientation of one item, or `None` when the id is not in the scene.
pub fn item(id: ItemId) -> impl Fn(&SceneState) -> Option<Orientation> + Clone + 'static {
    move |state: &SceneState| state.orientation(id)
}

/// The whole positions mapping, shared rather than copied.
pub fn positions() -> impl Fn(&SceneState) -> Arc<Positions> + Clone + 'static {
    |state: &SceneState| state.positions_shared()
}

/// Number of items in the scene.
pub fn count() -> impl Fn(&SceneState) -> usize + Clone + 'static {
    |state: &SceneState| state.count()
}

/// Default comparison: value equality.
#[inline]
pub fn value_eq<P: PartialEq>(a: &P, b: &P) -> bool {
    a == b
}

/// Identity comparison for shared projections.
///
/// Every transition builds a new positions mapping, so with this equality a
/// whole-scene subscriber fires once per transition without comparing
/// `count` entries.
#[inline]
pub fn by_ptr<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    Arc::ptr_eq(a, b)
}

/// Coarse item comparison: equal when both are absent, or both present with
/// every axis within `eps`.
pub fn within(eps: f64) -> impl Fn(&Option<Orientation>, &Option<Orientation>) -> bool + Clone + 'static {
    move |a: &Option<Orientation>, b: &Option<Orientation>| match (a, b) {
        (Some(a), Some(b)) => a.approx_eq(b, eps),
        (None, None) => true,
        _ => false,
    }
}
