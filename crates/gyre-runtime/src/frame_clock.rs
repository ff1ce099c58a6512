#![forbid(unsafe_code)]

//! Frame clock and recurring per-frame work.
//!
//! A [`FrameClock`] delivers one-shot callbacks on the next frame, the way a
//! display refresh callback does: each request fires at most once, and a
//! callback requested while a frame is being delivered waits for the next
//! frame. There is no periodicity guarantee; recurring work re-requests.
//!
//! [`FrameScheduler`] is the in-process implementation. With real time it
//! paces frames at a target rate through [`FrameScheduler::run`]; with a
//! [`LabClock`] every [`fire_frame`](FrameScheduler::fire_frame) advances
//! time by exactly one interval, so tests are deterministic.
//!
//! [`FrameLoop`] turns the one-shot requests into a cancellable recurring
//! callback.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use gyre_core::cancel::{CancelHandle, CancelScope, LabClock};
use tracing::{debug, trace};
use web_time::{Duration, Instant};

/// Token for a requested tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TickHandle(u64);

impl TickHandle {
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

pub type TickCallback = Box<dyn FnOnce(Instant)>;

/// Source of per-frame callbacks.
pub trait FrameClock {
    /// Run `callback` once on the next frame with that frame's timestamp.
    fn request_tick(&self, callback: TickCallback) -> TickHandle;

    /// Withdraw a request that has not fired yet. Returns `false` if it
    /// already fired or was never issued by this clock.
    fn cancel_tick(&self, handle: TickHandle) -> bool;
}

// ─── Scheduler ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Time {
    Real,
    Lab(LabClock),
}

struct SchedulerInner {
    time: Time,
    interval: Duration,
    queue: RefCell<Vec<(TickHandle, TickCallback)>>,
    next_handle: Cell<u64>,
    frames: Cell<u64>,
}

/// Queue-based [`FrameClock`]. Clones share the same queue.
#[derive(Clone)]
pub struct FrameScheduler {
    inner: Rc<SchedulerInner>,
}

impl std::fmt::Debug for FrameScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameScheduler")
            .field("time", &self.inner.time)
            .field("interval", &self.inner.interval)
            .field("pending", &self.pending())
            .field("frames", &self.frames())
            .finish()
    }
}

impl FrameScheduler {
    fn build(time: Time, interval: Duration) -> Self {
        Self {
            inner: Rc::new(SchedulerInner {
                time,
                interval,
                queue: RefCell::new(Vec::new()),
                next_handle: Cell::new(1),
                frames: Cell::new(0),
            }),
        }
    }

    /// Real-time scheduler targeting `fps` frames per second (at least 1).
    #[must_use]
    pub fn real(fps: u32) -> Self {
        let interval = Duration::from_secs_f64(1.0 / f64::from(fps.max(1)));
        Self::build(Time::Real, interval)
    }

    /// Deterministic scheduler: each frame advances `clock` by `interval`.
    #[must_use]
    pub fn lab(clock: &LabClock, interval: Duration) -> Self {
        Self::build(Time::Lab(clock.clone()), interval)
    }

    #[must_use]
    pub fn now(&self) -> Instant {
        match &self.inner.time {
            Time::Real => Instant::now(),
            Time::Lab(clock) => clock.now(),
        }
    }

    #[must_use]
    pub fn interval(&self) -> Duration {
        self.inner.interval
    }

    /// Requests waiting for the next frame.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.queue.borrow().len()
    }

    /// Frames delivered so far.
    #[must_use]
    pub fn frames(&self) -> u64 {
        self.inner.frames.get()
    }

    /// Deliver one frame: every request queued before this call fires once.
    ///
    /// Returns the number of callbacks run.
    pub fn fire_frame(&self) -> usize {
        if let Time::Lab(clock) = &self.inner.time {
            clock.advance(self.inner.interval);
        }
        let now = self.now();
        let due = std::mem::take(&mut *self.inner.queue.borrow_mut());
        self.inner.frames.set(self.inner.frames.get() + 1);
        let fired = due.len();
        for (_, callback) in due {
            callback(now);
        }
        trace!(frame = self.frames(), fired, "frame delivered");
        fired
    }

    /// Let one frame interval pass without delivering anything, as when the
    /// display drops a frame. Only meaningful on a lab clock.
    pub fn skip_frame(&self) {
        if let Time::Lab(clock) = &self.inner.time {
            clock.advance(self.inner.interval);
        }
    }

    /// Deliver frames at the configured rate until `scope` is done, the
    /// queue goes idle, or `max_frames` frames have been delivered.
    ///
    /// Returns the number of frames delivered by this call.
    pub fn run(&self, scope: &CancelScope, max_frames: Option<u64>) -> u64 {
        let mut delivered = 0u64;
        while !scope.is_done() && max_frames.is_none_or(|max| delivered < max) {
            if self.pending() == 0 {
                debug!(delivered, "frame queue idle");
                break;
            }
            let started = self.now();
            self.fire_frame();
            delivered += 1;
            let spent = self
                .now()
                .checked_duration_since(started)
                .unwrap_or_default();
            if !scope.sleep(self.inner.interval.saturating_sub(spent)) {
                break;
            }
        }
        delivered
    }
}

impl FrameClock for FrameScheduler {
    fn request_tick(&self, callback: TickCallback) -> TickHandle {
        let handle = TickHandle(self.inner.next_handle.get());
        self.inner.next_handle.set(handle.0 + 1);
        self.inner.queue.borrow_mut().push((handle, callback));
        handle
    }

    fn cancel_tick(&self, handle: TickHandle) -> bool {
        let mut queue = self.inner.queue.borrow_mut();
        let before = queue.len();
        queue.retain(|(h, _)| *h != handle);
        queue.len() != before
    }
}

// ─── Frame loop ──────────────────────────────────────────────────────────────

struct LoopInner {
    clock: Rc<dyn FrameClock>,
    scope: CancelScope,
    handle: CancelHandle,
    pending: Cell<Option<TickHandle>>,
    ticks: Cell<u64>,
    body: RefCell<Box<dyn FnMut(Instant)>>,
}

impl LoopInner {
    fn schedule(this: &Rc<Self>) {
        let weak: Weak<Self> = Rc::downgrade(this);
        let handle = this.clock.request_tick(Box::new(move |now| {
            if let Some(inner) = weak.upgrade() {
                Self::on_frame(&inner, now);
            }
        }));
        this.pending.set(Some(handle));
    }

    fn on_frame(this: &Rc<Self>, now: Instant) {
        this.pending.set(None);
        if this.scope.is_done() {
            trace!(scope_id = this.scope.id(), "queued tick after cancellation ignored");
            return;
        }
        this.ticks.set(this.ticks.get() + 1);
        (this.body.borrow_mut())(now);
        if !this.scope.is_done() {
            Self::schedule(this);
        }
    }
}

/// A recurring per-frame callback.
///
/// The body runs once per frame until the loop is stopped, its scope (or an
/// ancestor) is cancelled, or its deadline passes. Cancellation is checked
/// when each frame fires, so a tick already queued at the moment of
/// cancellation does nothing. Dropping the loop stops it.
pub struct FrameLoop {
    inner: Rc<LoopInner>,
}

impl FrameLoop {
    /// Start a loop on `clock` with its own root scope.
    pub fn start(clock: Rc<dyn FrameClock>, body: impl FnMut(Instant) + 'static) -> Self {
        let (scope, handle) = CancelScope::root();
        Self::with_scope(clock, scope, handle, body)
    }

    /// Start a loop whose scope is a child of `parent`.
    pub fn start_within(
        clock: Rc<dyn FrameClock>,
        parent: &CancelScope,
        body: impl FnMut(Instant) + 'static,
    ) -> Self {
        let (scope, handle) = parent.child();
        Self::with_scope(clock, scope, handle, body)
    }

    fn with_scope(
        clock: Rc<dyn FrameClock>,
        scope: CancelScope,
        handle: CancelHandle,
        body: impl FnMut(Instant) + 'static,
    ) -> Self {
        let inner = Rc::new(LoopInner {
            clock,
            scope,
            handle,
            pending: Cell::new(None),
            ticks: Cell::new(0),
            body: RefCell::new(Box::new(body)),
        });
        LoopInner::schedule(&inner);
        Self { inner }
    }

    /// Stop scheduling and withdraw the queued tick. Idempotent; returns
    /// whether the loop was running.
    pub fn stop(&self) -> bool {
        let was_running = self.is_running();
        self.inner.handle.cancel();
        if let Some(tick) = self.inner.pending.take() {
            self.inner.clock.cancel_tick(tick);
        }
        was_running
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.inner.scope.is_done()
    }

    /// Frames on which the body ran.
    #[must_use]
    pub fn ticks(&self) -> u64 {
        self.inner.ticks.get()
    }

    #[must_use]
    pub fn scope(&self) -> &CancelScope {
        &self.inner.scope
    }
}

impl Drop for FrameLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for FrameLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameLoop")
            .field("scope", &self.inner.scope.id())
            .field("running", &self.is_running())
            .field("ticks", &self.ticks())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lab() -> (LabClock, FrameScheduler) {
        let clock = LabClock::new();
        let scheduler = FrameScheduler::lab(&clock, Duration::from_millis(16));
        (clock, scheduler)
    }

    #[test]
    fn request_fires_once_on_next_frame() {
        let (_clock, scheduler) = lab();
        let hits = Rc::new(Cell::new(0));
        let h = Rc::clone(&hits);
        scheduler.request_tick(Box::new(move |_| h.set(h.get() + 1)));
        assert_eq!(scheduler.pending(), 1);
        assert_eq!(scheduler.fire_frame(), 1);
        assert_eq!(scheduler.fire_frame(), 0);
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn requests_made_during_a_frame_wait_for_the_next() {
        let (_clock, scheduler) = lab();
        let again = scheduler.clone();
        scheduler.request_tick(Box::new(move |_| {
            again.request_tick(Box::new(|_| {}));
        }));
        assert_eq!(scheduler.fire_frame(), 1);
        assert_eq!(scheduler.pending(), 1);
    }

    #[test]
    fn cancel_tick_withdraws_request() {
        let (_clock, scheduler) = lab();
        let ran = Rc::new(Cell::new(false));
        let r = Rc::clone(&ran);
        let handle = scheduler.request_tick(Box::new(move |_| r.set(true)));
        assert!(scheduler.cancel_tick(handle));
        assert!(!scheduler.cancel_tick(handle));
        assert_eq!(scheduler.fire_frame(), 0);
        assert!(!ran.get());
    }

    #[test]
    fn lab_frames_advance_time_by_interval() {
        let (clock, scheduler) = lab();
        let start = clock.now();
        let stamp = Rc::new(Cell::new(None));
        let s = Rc::clone(&stamp);
        scheduler.request_tick(Box::new(move |now| s.set(Some(now))));
        scheduler.skip_frame();
        scheduler.fire_frame();
        assert_eq!(stamp.get(), Some(start + Duration::from_millis(32)));
        assert_eq!(scheduler.frames(), 1);
    }

    #[test]
    fn frame_loop_runs_until_stopped() {
        let (_clock, scheduler) = lab();
        let clock: Rc<dyn FrameClock> = Rc::new(scheduler.clone());
        let hits = Rc::new(Cell::new(0u32));
        let h = Rc::clone(&hits);
        let frame_loop = FrameLoop::start(clock, move |_| h.set(h.get() + 1));
        for _ in 0..5 {
            scheduler.fire_frame();
        }
        assert_eq!(hits.get(), 5);
        assert_eq!(frame_loop.ticks(), 5);
        assert!(frame_loop.stop());
        assert!(!frame_loop.stop());
        assert_eq!(scheduler.pending(), 0);
        scheduler.fire_frame();
        assert_eq!(hits.get(), 5);
    }

    #[test]
    fn queued_tick_after_parent_cancel_is_noop() {
        let (_clock, scheduler) = lab();
        let clock: Rc<dyn FrameClock> = Rc::new(scheduler.clone());
        let (parent, parent_handle) = CancelScope::root();
        let hits = Rc::new(Cell::new(0u32));
        let h = Rc::clone(&hits);
        let frame_loop = FrameLoop::start_within(clock, &parent, move |_| h.set(h.get() + 1));
        scheduler.fire_frame();
        parent_handle.cancel();
        assert_eq!(scheduler.pending(), 1, "tick still queued");
        scheduler.fire_frame();
        assert_eq!(hits.get(), 1);
        assert_eq!(scheduler.pending(), 0);
        assert!(!frame_loop.is_running());
    }

    #[test]
    fn dropping_loop_withdraws_tick() {
        let (_clock, scheduler) = lab();
        let clock: Rc<dyn FrameClock> = Rc::new(scheduler.clone());
        let frame_loop = FrameLoop::start(clock, |_| {});
        assert_eq!(scheduler.pending(), 1);
        drop(frame_loop);
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn run_stops_at_max_frames_on_lab_time() {
        let (clock, scheduler) = lab();
        let dyn_clock: Rc<dyn FrameClock> = Rc::new(scheduler.clone());
        let _loop = FrameLoop::start(dyn_clock, |_| {});
        let (scope, _h) = CancelScope::lab(&clock);
        assert_eq!(scheduler.run(&scope, Some(10)), 10);
    }

    #[test]
    fn run_stops_at_lab_deadline() {
        let (clock, scheduler) = lab();
        let dyn_clock: Rc<dyn FrameClock> = Rc::new(scheduler.clone());
        let _loop = FrameLoop::start(dyn_clock, |_| {});
        let (scope, _h) = CancelScope::lab_with_deadline(&clock, Duration::from_millis(100));
        let delivered = scheduler.run(&scope, None);
        assert!((6..=7).contains(&delivered), "delivered {delivered}");
    }

    #[test]
    fn run_returns_when_idle() {
        let (clock, scheduler) = lab();
        let (scope, _h) = CancelScope::lab(&clock);
        assert_eq!(scheduler.run(&scope, None), 0);
    }
}
