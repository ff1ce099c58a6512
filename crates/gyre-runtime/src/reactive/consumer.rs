#![forbid(unsafe_code)]

//! The two consumption patterns built on one subscription capability.
//!
//! - [`RenderCoupled`]: the observer stores the projection as new props,
//!   marks the consumer dirty and asks the host for a redraw. The host
//!   renders when it gets to it; several notifications before that render
//!   coalesce into one.
//! - [`RenderDecoupled`]: the observer writes the projection into a
//!   [`ValueHolder`] and does nothing else. A per-frame read step owned by
//!   the rendering layer calls [`RenderDecoupled::apply`] on its own
//!   schedule.
//!
//! Both hold their [`Subscription`]; dropping the consumer unmounts it.

use std::cell::{Cell, Ref, RefCell};
use std::rc::Rc;

use gyre_core::state::{ItemId, Orientation, SceneState};

use super::select;
use super::subscription::{Observer, Subscription};
use crate::store::Store;

// ---------------------------------------------------------------------------
// Redraw requests
// ---------------------------------------------------------------------------

/// Shared "something needs a redraw" flag, polled by the host once per frame.
#[derive(Debug, Clone, Default)]
pub struct RedrawRequest {
    requested: Rc<Cell<bool>>,
    total: Rc<Cell<u64>>,
}

impl RedrawRequest {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.requested.set(true);
        self.total.set(self.total.get() + 1);
    }

    /// Consume the pending request, if any.
    pub fn take(&self) -> bool {
        self.requested.replace(false)
    }

    #[must_use]
    pub fn is_requested(&self) -> bool {
        self.requested.get()
    }

    /// Requests made since creation, including coalesced ones.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.total.get()
    }
}

// ---------------------------------------------------------------------------
// Render-coupled
// ---------------------------------------------------------------------------

struct Props<P> {
    value: RefCell<P>,
    dirty: Cell<bool>,
    notifications: Cell<u64>,
    renders: Cell<u64>,
}

struct PropsWriter<P> {
    props: Rc<Props<P>>,
    redraw: Option<RedrawRequest>,
}

impl<P: Clone> Observer<P> for PropsWriter<P> {
    fn notify(&mut self, value: &P) {
        *self.props.value.borrow_mut() = value.clone();
        self.props.dirty.set(true);
        self.props
            .notifications
            .set(self.props.notifications.get() + 1);
        if let Some(redraw) = &self.redraw {
            redraw.request();
        }
    }
}

/// A consumer that re-renders whenever its projection changes.
pub struct RenderCoupled<P> {
    props: Rc<Props<P>>,
    subscription: Subscription,
}

impl<P: Clone + PartialEq + 'static> RenderCoupled<P> {
    /// Mount with value-equality change detection.
    pub fn mount<S>(store: &Store, selector: S, redraw: Option<RedrawRequest>) -> Self
    where
        S: Fn(&SceneState) -> P + 'static,
    {
        Self::mount_with(store, selector, select::value_eq, redraw)
    }
}

impl<P: Clone + 'static> RenderCoupled<P> {
    /// Mount with a caller-supplied equality.
    ///
    /// The consumer starts dirty so the host performs the initial render.
    pub fn mount_with<S, E>(
        store: &Store,
        selector: S,
        equality: E,
        redraw: Option<RedrawRequest>,
    ) -> Self
    where
        S: Fn(&SceneState) -> P + 'static,
        E: Fn(&P, &P) -> bool + 'static,
    {
        let initial = store.with_state(&selector);
        let props = Rc::new(Props {
            value: RefCell::new(initial),
            dirty: Cell::new(true),
            notifications: Cell::new(0),
            renders: Cell::new(0),
        });
        if let Some(redraw) = &redraw {
            redraw.request();
        }
        let writer = PropsWriter {
            props: Rc::clone(&props),
            redraw,
        };
        let subscription = store.subscribe_with(selector, equality, writer);
        Self {
            props,
            subscription,
        }
    }

    /// Whether props changed since the last render.
    #[must_use]
    pub fn needs_render(&self) -> bool {
        self.props.dirty.get()
    }

    /// Render with the current props and clear the dirty flag.
    pub fn render<R>(&self, view: impl FnOnce(&P) -> R) -> R {
        self.props.dirty.set(false);
        self.props.renders.set(self.props.renders.get() + 1);
        view(&self.props.value.borrow())
    }

    /// Render only if dirty.
    pub fn render_if_needed<R>(&self, view: impl FnOnce(&P) -> R) -> Option<R> {
        self.needs_render().then(|| self.render(view))
    }

    /// Current props without rendering.
    #[must_use]
    pub fn props(&self) -> P {
        self.props.value.borrow().clone()
    }

    /// Observer invocations received.
    #[must_use]
    pub fn notifications(&self) -> u64 {
        self.props.notifications.get()
    }

    #[must_use]
    pub fn renders(&self) -> u64 {
        self.props.renders.get()
    }

    #[must_use]
    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }

    pub fn unmount(self) {
        drop(self);
    }
}

impl RenderCoupled<Option<Orientation>> {
    /// Mount a consumer for one item.
    pub fn item(store: &Store, id: ItemId, redraw: Option<RedrawRequest>) -> Self {
        Self::mount(store, select::item(id), redraw)
    }

    /// Render the item, or nothing when it is absent from the scene.
    ///
    /// The dirty flag is cleared either way.
    pub fn render_item<R>(&self, view: impl FnOnce(Orientation) -> R) -> Option<R> {
        self.render(|props| props.map(view))
    }
}

impl<P: std::fmt::Debug> std::fmt::Debug for RenderCoupled<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderCoupled")
            .field("props", &self.props.value.borrow())
            .field("dirty", &self.props.dirty.get())
            .field("subscription", &self.subscription.id())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Render-decoupled
// ---------------------------------------------------------------------------

/// A mutable cell owned by a consumer and written outside any render.
///
/// Cloning yields another handle to the same cell.
#[derive(Debug)]
pub struct ValueHolder<P> {
    inner: Rc<HolderCell<P>>,
}

#[derive(Debug)]
struct HolderCell<P> {
    value: RefCell<P>,
    version: Cell<u64>,
}

impl<P> Clone for ValueHolder<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<P> ValueHolder<P> {
    #[must_use]
    pub fn new(value: P) -> Self {
        Self {
            inner: Rc::new(HolderCell {
                value: RefCell::new(value),
                version: Cell::new(0),
            }),
        }
    }

    pub fn set(&self, value: P) {
        *self.inner.value.borrow_mut() = value;
        self.inner.version.set(self.inner.version.get() + 1);
    }

    /// Borrow the current value.
    ///
    /// # Panics
    ///
    /// Panics if the holder is written while the borrow is alive.
    #[must_use]
    pub fn borrow(&self) -> Ref<'_, P> {
        self.inner.value.borrow()
    }

    /// Writes since creation.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.inner.version.get()
    }
}

impl<P: Clone> ValueHolder<P> {
    #[must_use]
    pub fn get(&self) -> P {
        self.inner.value.borrow().clone()
    }
}

impl<P: Clone> Observer<P> for ValueHolder<P> {
    fn notify(&mut self, value: &P) {
        self.set(value.clone());
    }
}

/// A consumer that receives raw values into a holder and applies them on
/// its own per-frame schedule.
pub struct RenderDecoupled<P> {
    holder: ValueHolder<P>,
    applied_version: Cell<u64>,
    subscription: Subscription,
}

impl<P: Clone + PartialEq + 'static> RenderDecoupled<P> {
    pub fn mount<S>(store: &Store, selector: S) -> Self
    where
        S: Fn(&SceneState) -> P + 'static,
    {
        Self::mount_with(store, selector, select::value_eq)
    }
}

impl<P: Clone + 'static> RenderDecoupled<P> {
    /// Mount with a caller-supplied equality. The holder starts with the
    /// projection of the current state.
    pub fn mount_with<S, E>(store: &Store, selector: S, equality: E) -> Self
    where
        S: Fn(&SceneState) -> P + 'static,
        E: Fn(&P, &P) -> bool + 'static,
    {
        let holder = ValueHolder::new(store.with_state(&selector));
        let subscription = store.subscribe_with(selector, equality, holder.clone());
        Self {
            holder,
            applied_version: Cell::new(0),
            subscription,
        }
    }

    #[must_use]
    pub fn holder(&self) -> &ValueHolder<P> {
        &self.holder
    }

    /// The per-frame read step: hand the holder's current value to `f`.
    ///
    /// Runs whether or not the store notified since the last call.
    pub fn apply<R>(&self, f: impl FnOnce(&P) -> R) -> R {
        self.applied_version.set(self.holder.version());
        f(&self.holder.borrow())
    }

    /// Whether the holder was written since the last [`apply`](Self::apply).
    #[must_use]
    pub fn has_unapplied(&self) -> bool {
        self.holder.version() != self.applied_version.get()
    }

    #[must_use]
    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }

    pub fn unmount(self) {
        drop(self);
    }
}

impl RenderDecoupled<Option<Orientation>> {
    pub fn item(store: &Store, id: ItemId) -> Self {
        Self::mount(store, select::item(id))
    }
}

impl<P: std::fmt::Debug> std::fmt::Debug for RenderDecoupled<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderDecoupled")
            .field("value", &self.holder.borrow())
            .field("version", &self.holder.version())
            .field("subscription", &self.subscription.id())
            .finish()
    }
}
