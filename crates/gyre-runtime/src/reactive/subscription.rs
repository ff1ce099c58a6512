#![forbid(unsafe_code)]

//! Selector subscriptions: the observer seam and the RAII registration guard.
//!
//! # Design
//!
//! Each registration is a [`Selection`]: a selector, an equality, the last
//! projection the subscriber saw, and an [`Observer`]. The store keeps
//! registrations as type-erased [`Entry`] objects keyed by [`SubscriptionId`].
//!
//! # Invariants
//!
//! 1. `last` always holds the projection most recently delivered (or the
//!    projection at registration, before any delivery).
//! 2. `last` is updated before the observer runs.
//! 3. Once retired, an entry never calls its observer again.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use gyre_core::state::SceneState;

use crate::store::StoreShared;

/// Receiver of projected values.
///
/// Closures taking `&P` implement this, so most callers pass a closure.
/// Consumers with their own bookkeeping (render-coupled props, value holders)
/// implement it directly.
pub trait Observer<P: ?Sized> {
    fn notify(&mut self, value: &P);
}

impl<P: ?Sized, F: FnMut(&P)> Observer<P> for F {
    fn notify(&mut self, value: &P) {
        self(value);
    }
}

/// Identifier of a registration. Ids increase in registration order and are
/// never reused within a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub(crate) const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

pub(crate) trait Entry {
    fn is_live(&self) -> bool;
    fn retire(&self);
    /// Re-project `state`; returns `true` when the observer was called.
    fn evaluate(&self, state: &SceneState) -> bool;
}

pub(crate) struct Selection<P, S, E, O> {
    selector: S,
    equality: E,
    last: RefCell<P>,
    observer: RefCell<O>,
    live: Cell<bool>,
}

impl<P, S, E, O> Selection<P, S, E, O> {
    pub(crate) fn new(selector: S, equality: E, initial: P, observer: O) -> Self {
        Self {
            selector,
            equality,
            last: RefCell::new(initial),
            observer: RefCell::new(observer),
            live: Cell::new(true),
        }
    }
}

impl<P, S, E, O> Entry for Selection<P, S, E, O>
where
    S: Fn(&SceneState) -> P,
    E: Fn(&P, &P) -> bool,
    O: Observer<P>,
{
    fn is_live(&self) -> bool {
        self.live.get()
    }

    fn retire(&self) {
        self.live.set(false);
    }

    fn evaluate(&self, state: &SceneState) -> bool {
        let projected = (self.selector)(state);
        if (self.equality)(&projected, &*self.last.borrow()) {
            return false;
        }
        *self.last.borrow_mut() = projected;
        let value = self.last.borrow();
        self.observer.borrow_mut().notify(&*value);
        true
    }
}

/// Registration guard returned by [`Store::subscribe`](crate::Store::subscribe).
///
/// Dropping the guard (or calling [`unsubscribe`](Self::unsubscribe))
/// removes the registration. From that point the observer is never called
/// again, even by a notification pass that is already in progress.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    id: SubscriptionId,
    store: Weak<StoreShared>,
    entry: Rc<dyn Entry>,
}

impl Subscription {
    pub(crate) fn new(id: SubscriptionId, store: Weak<StoreShared>, entry: Rc<dyn Entry>) -> Self {
        Self { id, store, entry }
    }

    #[inline]
    #[must_use]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Whether the registration is still attached to a live store.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.entry.is_live() && self.store.strong_count() > 0
    }

    /// Explicit form of dropping the guard.
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.entry.retire();
        if let Some(store) = self.store.upgrade() {
            store.remove(self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id.get())
            .field("active", &self.is_active())
            .finish()
    }
}
