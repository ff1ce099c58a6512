#![forbid(unsafe_code)]

//! The observable scene store.
//!
//! [`Store`] owns the current [`SceneState`] and a table of selector
//! subscriptions. Every transition ([`initialize`](Store::initialize),
//! [`advance`](Store::advance)) publishes a new state and then runs one
//! notification pass over the table.
//!
//! # Notification pass
//!
//! 1. The subscriber table is snapshotted in registration order.
//! 2. Each still-live entry re-runs its selector on the new state and compares
//!    the projection with the last value it saw.
//! 3. On a difference the entry records the projection, then calls its
//!    observer exactly once.
//!
//! Entries registered during a pass are not visited by it. Entries removed
//! during a pass are skipped if the pass has not reached them yet.
//!
//! # Nested and batched transitions
//!
//! A transition requested while a pass is running (from inside an observer)
//! or inside [`Store::batch`] is applied to the state immediately, but its
//! notification is deferred: the outermost transition runs follow-up passes
//! until nothing is pending, up to [`MAX_NOTIFY_PASSES`].
//!
//! # Failure isolation
//!
//! A selector, equality, or observer that panics is caught per entry. The
//! failure is logged, counted, and handed to the failure sink; the pass
//! continues with the next entry and the published state is untouched.
//!
//! Stores are single-threaded (`Rc` inside) and cheap to clone; clones share
//! the same state and subscribers.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::rc::{Rc, Weak};

use gyre_core::error::Result;
use gyre_core::state::{SceneState, checked_count};
use rand::SeedableRng;
use rand::rngs::StdRng;
use tracing::{debug, error, trace, warn};

use crate::reactive::subscription::{Entry, Observer, Selection, Subscription, SubscriptionId};

/// Per-call orientation increment, in radians.
pub const DEFAULT_STEP: f64 = 0.01;

/// Upper bound on follow-up notification passes for one outermost
/// transition. Changes still pending after the cap are delivered by the next
/// transition.
pub const MAX_NOTIFY_PASSES: usize = 16;

/// Store construction options.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StoreConfig {
    /// Increment applied to every axis by [`Store::advance`].
    pub step: f64,
    /// Seed for initial orientations. `None` seeds from the OS.
    pub seed: Option<u64>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            step: DEFAULT_STEP,
            seed: None,
        }
    }
}

impl StoreConfig {
    #[must_use]
    pub fn with_step(mut self, step: f64) -> Self {
        self.step = step;
        self
    }

    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

/// A caught selector or observer failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerFailure {
    pub subscription: SubscriptionId,
    /// Generation of the state the failing entry was evaluated against.
    pub generation: u64,
    pub message: String,
}

impl std::fmt::Display for ListenerFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "subscription {} failed at generation {}: {}",
            self.subscription.get(),
            self.generation,
            self.message
        )
    }
}

/// Counters for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StoreStats {
    /// Published transitions (rejected ones are not counted).
    pub transitions: u64,
    /// Live subscriptions.
    pub subscribers: usize,
    /// Observer invocations.
    pub notifications: u64,
    /// Caught selector/observer failures.
    pub listener_failures: u64,
}

type FailureSink = Rc<dyn Fn(&ListenerFailure)>;

pub(crate) struct StoreShared {
    config: StoreConfig,
    state: RefCell<SceneState>,
    rng: RefCell<StdRng>,
    subscribers: RefCell<BTreeMap<SubscriptionId, Rc<dyn Entry>>>,
    next_subscription: Cell<u64>,
    notifying: Cell<bool>,
    batch_depth: Cell<u32>,
    pending: Cell<bool>,
    transitions: Cell<u64>,
    notifications: Cell<u64>,
    failures: Cell<u64>,
    sink: RefCell<Option<FailureSink>>,
}

impl StoreShared {
    pub(crate) fn remove(&self, id: SubscriptionId) {
        // Drop the entry after the table borrow ends: its observer may own
        // other subscriptions whose drop re-enters this table.
        let removed = self.subscribers.borrow_mut().remove(&id);
        drop(removed);
    }
}

/// Handle to an observable scene store.
#[derive(Clone)]
pub struct Store {
    shared: Rc<StoreShared>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.borrow();
        f.debug_struct("Store")
            .field("generation", &state.generation())
            .field("count", &state.count())
            .field("subscribers", &self.shared.subscribers.borrow().len())
            .finish()
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    /// An empty store (`count == 0`) with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(StoreConfig::default())
    }

    #[must_use]
    pub fn with_config(config: StoreConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            shared: Rc::new(StoreShared {
                config,
                state: RefCell::new(SceneState::empty()),
                rng: RefCell::new(rng),
                subscribers: RefCell::new(BTreeMap::new()),
                next_subscription: Cell::new(1),
                notifying: Cell::new(false),
                batch_depth: Cell::new(0),
                pending: Cell::new(false),
                transitions: Cell::new(0),
                notifications: Cell::new(0),
                failures: Cell::new(0),
                sink: RefCell::new(None),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> StoreConfig {
        self.shared.config
    }

    // ── Reads ────────────────────────────────────────────────────────

    /// The current state. O(1); the heavy fields are shared, not copied.
    #[must_use]
    pub fn get_state(&self) -> SceneState {
        self.shared.state.borrow().clone()
    }

    /// Borrow the current state without cloning.
    ///
    /// # Panics
    ///
    /// Panics if `f` starts a transition on this store.
    pub fn with_state<R>(&self, f: impl FnOnce(&SceneState) -> R) -> R {
        f(&self.shared.state.borrow())
    }

    #[must_use]
    pub fn stats(&self) -> StoreStats {
        StoreStats {
            transitions: self.shared.transitions.get(),
            subscribers: self.shared.subscribers.borrow().len(),
            notifications: self.shared.notifications.get(),
            listener_failures: self.shared.failures.get(),
        }
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.shared.subscribers.borrow().len()
    }

    /// Whether `other` is a handle to this same store.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.shared, &other.shared)
    }

    // ── Transitions ──────────────────────────────────────────────────

    /// Replace the scene with `count` freshly randomized items.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidCount`](gyre_core::StoreError::InvalidCount)
    /// for a negative or oversized count; the current state is untouched.
    pub fn initialize(&self, count: i64) -> Result<()> {
        let count = checked_count(count).inspect_err(|err| {
            warn!(requested = count, %err, "initialize rejected");
        })?;
        let generation = self.next_generation();
        let next = SceneState::populated(generation, count, &mut *self.shared.rng.borrow_mut());
        debug!(count, generation, "scene initialized");
        self.commit(next);
        Ok(())
    }

    /// Advance every item by the configured step.
    pub fn advance(&self) {
        self.advance_by(self.shared.config.step);
    }

    /// Advance every item by `step` radians on each axis.
    pub fn advance_by(&self, step: f64) {
        let generation = self.next_generation();
        let next = self.shared.state.borrow().advanced(generation, step);
        trace!(generation, step, count = next.count(), "scene advanced");
        self.commit(next);
    }

    /// Run `f` with notifications deferred until the outermost batch exits.
    ///
    /// Transitions inside `f` are applied immediately; subscribers then see
    /// a single pass against the final state.
    pub fn batch<R>(&self, f: impl FnOnce() -> R) -> R {
        struct Depth<'a>(&'a Cell<u32>);
        impl Drop for Depth<'_> {
            fn drop(&mut self) {
                self.0.set(self.0.get() - 1);
            }
        }

        let depth = &self.shared.batch_depth;
        depth.set(depth.get() + 1);
        let result = {
            let _depth = Depth(depth);
            f()
        };
        if depth.get() == 0 && self.shared.pending.get() {
            self.notify();
        }
        result
    }

    fn next_generation(&self) -> u64 {
        self.shared.state.borrow().generation() + 1
    }

    fn commit(&self, next: SceneState) {
        *self.shared.state.borrow_mut() = next;
        let shared = &self.shared;
        shared.transitions.set(shared.transitions.get() + 1);
        self.notify();
    }

    // ── Subscriptions ────────────────────────────────────────────────

    /// Subscribe to a projection of the state, compared with `PartialEq`.
    ///
    /// The observer is not called on registration. It is called on the first
    /// later transition whose projection differs from the projection at
    /// registration time.
    pub fn subscribe<P, S, O>(&self, selector: S, observer: O) -> Subscription
    where
        P: PartialEq + 'static,
        S: Fn(&SceneState) -> P + 'static,
        O: Observer<P> + 'static,
    {
        self.subscribe_with(selector, |a: &P, b: &P| a == b, observer)
    }

    /// Subscribe with a custom equality. `equality(new, last)` returning
    /// `true` suppresses the notification.
    pub fn subscribe_with<P, S, E, O>(&self, selector: S, equality: E, observer: O) -> Subscription
    where
        P: 'static,
        S: Fn(&SceneState) -> P + 'static,
        E: Fn(&P, &P) -> bool + 'static,
        O: Observer<P> + 'static,
    {
        let initial = self.with_state(|state| selector(state));
        let entry: Rc<dyn Entry> = Rc::new(Selection::new(selector, equality, initial, observer));

        let id = SubscriptionId::new(self.shared.next_subscription.get());
        self.shared.next_subscription.set(id.get() + 1);
        self.shared
            .subscribers
            .borrow_mut()
            .insert(id, Rc::clone(&entry));
        trace!(subscription = id.get(), "subscribed");

        Subscription::new(id, Rc::downgrade(&self.shared), entry)
    }

    // ── Diagnostics ──────────────────────────────────────────────────

    /// Install the sink that receives every caught listener failure.
    ///
    /// Failures are logged at `error` level whether or not a sink is set.
    pub fn set_failure_sink(&self, sink: impl Fn(&ListenerFailure) + 'static) {
        *self.shared.sink.borrow_mut() = Some(Rc::new(sink));
    }

    pub fn clear_failure_sink(&self) {
        *self.shared.sink.borrow_mut() = None;
    }

    // ── Notification ─────────────────────────────────────────────────

    fn notify(&self) {
        let shared = &self.shared;
        if shared.notifying.get() || shared.batch_depth.get() > 0 {
            shared.pending.set(true);
            return;
        }

        shared.notifying.set(true);
        let mut passes = 0;
        loop {
            shared.pending.set(false);
            passes += 1;
            self.notify_pass();
            if !shared.pending.get() {
                break;
            }
            if passes >= MAX_NOTIFY_PASSES {
                warn!(passes, "notification pass limit reached; deferring to next transition");
                shared.pending.set(false);
                break;
            }
        }
        shared.notifying.set(false);
    }

    fn notify_pass(&self) {
        let state = self.get_state();
        let snapshot: Vec<(SubscriptionId, Rc<dyn Entry>)> = self
            .shared
            .subscribers
            .borrow()
            .iter()
            .map(|(id, entry)| (*id, Rc::clone(entry)))
            .collect();

        for (id, entry) in snapshot {
            if !entry.is_live() {
                continue;
            }
            match panic::catch_unwind(AssertUnwindSafe(|| entry.evaluate(&state))) {
                Ok(true) => {
                    let n = &self.shared.notifications;
                    n.set(n.get() + 1);
                }
                Ok(false) => {}
                Err(payload) => self.report_failure(id, state.generation(), payload.as_ref()),
            }
        }
    }

    fn report_failure(&self, id: SubscriptionId, generation: u64, payload: &(dyn Any + Send)) {
        let failures = &self.shared.failures;
        failures.set(failures.get() + 1);

        let failure = ListenerFailure {
            subscription: id,
            generation,
            message: panic_message(payload),
        };
        error!(
            subscription = id.get(),
            generation,
            message = %failure.message,
            "listener failed"
        );

        let sink = self.shared.sink.borrow().clone();
        if let Some(sink) = sink
            && panic::catch_unwind(AssertUnwindSafe(|| sink(&failure))).is_err()
        {
            error!(subscription = id.get(), "failure sink panicked");
        }
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gyre_core::{ItemId, Orientation, StoreError};

    fn seeded() -> Store {
        Store::with_config(StoreConfig::default().with_seed(42))
    }

    fn recorder<P: Clone + 'static>() -> (Rc<RefCell<Vec<P>>>, impl FnMut(&P) + 'static) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&log);
        (log, move |v: &P| sink.borrow_mut().push(v.clone()))
    }

    #[test]
    fn new_store_is_empty() {
        let store = Store::new();
        let state = store.get_state();
        assert_eq!(state.count(), 0);
        assert!(state.positions().is_empty());
        assert_eq!(store.stats(), StoreStats::default());
    }

    #[test]
    fn initialize_populates_items() {
        let store = seeded();
        store.initialize(5).unwrap();
        let state = store.get_state();
        assert_eq!(state.count(), 5);
        assert_eq!(state.positions().len(), 5);
        assert_eq!(store.stats().transitions, 1);
    }

    #[test]
    fn initialize_replaces_items_wholesale() {
        let store = seeded();
        store.initialize(10).unwrap();
        store.initialize(3).unwrap();
        let state = store.get_state();
        assert_eq!(state.ids(), &[ItemId(0), ItemId(1), ItemId(2)]);
        assert!(!state.positions().contains(ItemId(3)));
    }

    #[test]
    fn negative_count_is_rejected_without_mutation() {
        let store = seeded();
        store.initialize(4).unwrap();
        let before = store.get_state();
        let err = store.initialize(-1).unwrap_err();
        assert!(matches!(err, StoreError::InvalidCount { requested: -1, .. }));
        assert!(store.get_state().same_snapshot(&before));
        assert_eq!(store.stats().transitions, 1);
    }

    #[test]
    fn advance_adds_configured_step() {
        let store = Store::with_config(StoreConfig::default().with_seed(1).with_step(0.5));
        store.initialize(2).unwrap();
        let before = store.get_state();
        store.advance();
        let after = store.get_state();
        for id in before.ids() {
            let expected = before.orientation(*id).unwrap().offset(0.5);
            assert!(after.orientation(*id).unwrap().approx_eq(&expected, 1e-12));
        }
    }

    #[test]
    fn seeded_stores_are_reproducible() {
        let a = seeded();
        let b = seeded();
        a.initialize(8).unwrap();
        b.initialize(8).unwrap();
        for id in a.get_state().ids() {
            assert_eq!(a.get_state().orientation(*id), b.get_state().orientation(*id));
        }
    }

    #[test]
    fn subscribe_does_not_fire_on_registration() {
        let store = seeded();
        let (log, observer) = recorder::<usize>();
        let _sub = store.subscribe(|s: &SceneState| s.count(), observer);
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn selector_isolation_fires_only_on_change() {
        let store = seeded();
        let (log, observer) = recorder::<Option<Orientation>>();
        let _sub = store.subscribe(|s: &SceneState| s.orientation(ItemId(3)), observer);

        store.initialize(5).unwrap();
        store.advance();
        assert_eq!(log.borrow().len(), 2);

        let (count_log, count_observer) = recorder::<usize>();
        let _count = store.subscribe(|s: &SceneState| s.count(), count_observer);
        store.advance();
        store.advance();
        assert!(count_log.borrow().is_empty(), "count did not change");
        assert_eq!(log.borrow().len(), 4);
    }

    #[test]
    fn custom_equality_suppresses_notifications() {
        let store = seeded();
        store.initialize(1).unwrap();
        let (log, observer) = recorder::<Option<Orientation>>();
        let _sub = store.subscribe_with(
            |s: &SceneState| s.orientation(ItemId(0)),
            |a: &Option<Orientation>, b: &Option<Orientation>| a.is_some() == b.is_some(),
            observer,
        );
        store.advance();
        store.advance();
        assert!(log.borrow().is_empty());
        store.initialize(0).unwrap();
        assert_eq!(log.borrow().as_slice(), &[None]);
    }

    #[test]
    fn dropping_subscription_stops_notifications() {
        let store = seeded();
        let (log, observer) = recorder::<u64>();
        let sub = store.subscribe(|s: &SceneState| s.generation(), observer);
        store.advance();
        assert_eq!(store.subscriber_count(), 1);
        drop(sub);
        assert_eq!(store.subscriber_count(), 0);
        store.advance();
        assert_eq!(log.borrow().len(), 1);
    }

    #[test]
    fn subscribers_notified_in_registration_order() {
        let store = seeded();
        let order = Rc::new(RefCell::new(Vec::new()));
        let subs: Vec<_> = (0..4)
            .map(|n| {
                let order = Rc::clone(&order);
                store.subscribe(|s: &SceneState| s.generation(), move |_: &u64| {
                    order.borrow_mut().push(n);
                })
            })
            .collect();
        store.advance();
        assert_eq!(order.borrow().as_slice(), &[0, 1, 2, 3]);
        drop(subs);
    }

    #[test]
    fn panicking_listener_is_isolated() {
        let store = seeded();
        let failures = Rc::new(RefCell::new(Vec::new()));
        let seen = Rc::clone(&failures);
        store.set_failure_sink(move |f: &ListenerFailure| seen.borrow_mut().push(f.clone()));

        let _bad = store.subscribe(|s: &SceneState| s.generation(), |g: &u64| {
            if *g > 0 {
                panic!("render exploded");
            }
        });
        let (log, observer) = recorder::<u64>();
        let _good = store.subscribe(|s: &SceneState| s.generation(), observer);

        store.advance();
        assert_eq!(log.borrow().as_slice(), &[1]);
        assert_eq!(store.get_state().generation(), 1);
        assert_eq!(store.stats().listener_failures, 1);
        let failures = failures.borrow();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].message, "render exploded");
        assert_eq!(failures[0].generation, 1);
    }

    #[test]
    fn nested_transition_is_delivered_in_follow_up_pass() {
        let store = seeded();
        store.initialize(1).unwrap();
        let inner = store.clone();
        let fired = Rc::new(Cell::new(0u32));
        let fired_in = Rc::clone(&fired);
        let _chain = store.subscribe(|s: &SceneState| s.generation(), move |g: &u64| {
            fired_in.set(fired_in.get() + 1);
            if *g == 2 {
                inner.advance();
            }
        });
        let (log, observer) = recorder::<u64>();
        let _watch = store.subscribe(|s: &SceneState| s.generation(), observer);

        store.advance();
        assert_eq!(store.get_state().generation(), 3);
        assert_eq!(fired.get(), 2);
        assert_eq!(log.borrow().as_slice(), &[2, 3]);
    }

    #[test]
    fn runaway_nested_transitions_are_capped() {
        let store = seeded();
        let inner = store.clone();
        let _loop = store.subscribe(|s: &SceneState| s.generation(), move |_: &u64| inner.advance());
        store.advance();
        assert_eq!(store.get_state().generation(), 1 + MAX_NOTIFY_PASSES as u64);
        // The store is usable afterwards.
        store.advance();
    }

    #[test]
    fn batch_coalesces_notifications() {
        let store = seeded();
        store.initialize(2).unwrap();
        let (log, observer) = recorder::<u64>();
        let _sub = store.subscribe(|s: &SceneState| s.generation(), observer);
        let out = store.batch(|| {
            store.advance();
            store.advance();
            store.batch(|| store.advance());
            7
        });
        assert_eq!(out, 7);
        assert_eq!(log.borrow().as_slice(), &[4]);
    }

    #[test]
    fn stats_count_notifications() {
        let store = seeded();
        let _a = store.subscribe(|s: &SceneState| s.generation(), |_: &u64| {});
        let _b = store.subscribe(|s: &SceneState| s.count(), |_: &usize| {});
        store.initialize(3).unwrap();
        store.advance();
        let stats = store.stats();
        assert_eq!(stats.transitions, 2);
        assert_eq!(stats.subscribers, 2);
        assert_eq!(stats.notifications, 3);
    }

    #[test]
    fn panic_message_handles_payload_kinds() {
        let s: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(s.as_ref()), "static");
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(owned.as_ref()), "owned");
        let other: Box<dyn Any + Send> = Box::new(5u8);
        assert_eq!(panic_message(other.as_ref()), "non-string panic payload");
    }
}
