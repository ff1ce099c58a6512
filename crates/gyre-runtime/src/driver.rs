#![forbid(unsafe_code)]

//! The update driver: populates the store, then advances it once per frame.
//!
//! # Lifecycle
//!
//! ```text
//! activate(n) ──► validate n ──► deactivate previous ──► initialize(n)
//!                                                          │
//!                                  ┌───────────────────────┘
//!                                  ▼
//!                        FrameLoop: every frame ──► advance()
//! ```
//!
//! [`UpdateDriver::deactivate`] stops scheduling. A tick that was already
//! queued when the driver's scope was cancelled finds the scope done and does
//! nothing; a tick that is running completes.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use gyre_core::cancel::CancelScope;
use gyre_core::error::Result;
use gyre_core::state::checked_count;
use tracing::{debug, info};
use web_time::{Duration, Instant};

use crate::frame_clock::{FrameClock, FrameLoop};
use crate::store::Store;

/// Default number of intervals kept by the [`TickRateMeter`].
pub const DEFAULT_METER_WINDOW: usize = 120;

/// How the per-tick increment is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum StepPolicy {
    /// Fixed increment per tick; the visible speed follows the frame rate.
    #[default]
    PerCall,
    /// Increment scaled by `elapsed / nominal_interval`, so the visible
    /// speed is independent of the frame rate. The first tick after
    /// activation uses the unscaled increment.
    ScaledByElapsed { nominal_interval: Duration },
}

impl StepPolicy {
    /// Multiplier applied to the configured step for a tick that followed
    /// the previous one by `elapsed`.
    #[must_use]
    pub fn scale(self, elapsed: Option<Duration>) -> f64 {
        match (self, elapsed) {
            (Self::PerCall, _) | (Self::ScaledByElapsed { .. }, None) => 1.0,
            (Self::ScaledByElapsed { nominal_interval }, Some(elapsed)) => {
                if nominal_interval.is_zero() {
                    1.0
                } else {
                    elapsed.as_secs_f64() / nominal_interval.as_secs_f64()
                }
            }
        }
    }
}

/// Driver options.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriverConfig {
    pub step_policy: StepPolicy,
    /// Intervals averaged by the tick-rate meter.
    pub meter_window: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            step_policy: StepPolicy::PerCall,
            meter_window: DEFAULT_METER_WINDOW,
        }
    }
}

impl DriverConfig {
    #[must_use]
    pub fn with_step_policy(mut self, policy: StepPolicy) -> Self {
        self.step_policy = policy;
        self
    }

    #[must_use]
    pub fn with_meter_window(mut self, window: usize) -> Self {
        self.meter_window = window.max(1);
        self
    }
}

// ─── Tick-rate meter ─────────────────────────────────────────────────────────

/// Sliding-window measurement of the time between ticks.
///
/// Informational only; nothing in the driver depends on it.
#[derive(Debug, Clone)]
pub struct TickRateMeter {
    window: usize,
    intervals: VecDeque<Duration>,
    last: Option<Instant>,
    ticks: u64,
}

impl TickRateMeter {
    #[must_use]
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            window,
            intervals: VecDeque::with_capacity(window),
            last: None,
            ticks: 0,
        }
    }

    /// Record a tick at `now`; returns the time since the previous tick.
    pub fn record(&mut self, now: Instant) -> Option<Duration> {
        self.ticks += 1;
        let elapsed = self
            .last
            .map(|prev| now.checked_duration_since(prev).unwrap_or_default());
        self.last = Some(now);
        if let Some(elapsed) = elapsed {
            if self.intervals.len() == self.window {
                self.intervals.pop_front();
            }
            self.intervals.push_back(elapsed);
        }
        elapsed
    }

    #[must_use]
    pub fn mean_interval(&self) -> Option<Duration> {
        if self.intervals.is_empty() {
            return None;
        }
        let total: Duration = self.intervals.iter().sum();
        Some(total / self.intervals.len() as u32)
    }

    /// Ticks per second over the window, if at least two ticks were seen
    /// and time moved between them.
    #[must_use]
    pub fn ticks_per_second(&self) -> Option<f64> {
        self.mean_interval()
            .filter(|d| !d.is_zero())
            .map(|d| 1.0 / d.as_secs_f64())
    }

    /// Ticks recorded since the last reset.
    #[must_use]
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn reset(&mut self) {
        self.intervals.clear();
        self.last = None;
        self.ticks = 0;
    }
}

impl Default for TickRateMeter {
    fn default() -> Self {
        Self::new(DEFAULT_METER_WINDOW)
    }
}

// ─── Driver ──────────────────────────────────────────────────────────────────

/// Drives a [`Store`] from a [`FrameClock`].
pub struct UpdateDriver {
    store: Store,
    clock: Rc<dyn FrameClock>,
    config: DriverConfig,
    parent: Option<CancelScope>,
    active: Option<FrameLoop>,
    meter: Rc<RefCell<TickRateMeter>>,
    ticks: Rc<Cell<u64>>,
    activations: u64,
}

impl UpdateDriver {
    pub fn new(store: Store, clock: Rc<dyn FrameClock>) -> Self {
        Self::with_config(store, clock, DriverConfig::default())
    }

    pub fn with_config(store: Store, clock: Rc<dyn FrameClock>, config: DriverConfig) -> Self {
        Self {
            store,
            clock,
            config,
            parent: None,
            active: None,
            meter: Rc::new(RefCell::new(TickRateMeter::new(config.meter_window))),
            ticks: Rc::new(Cell::new(0)),
            activations: 0,
        }
    }

    /// Run every activation inside a child of `parent`, so cancelling
    /// `parent` (or reaching its deadline) stops the driver.
    #[must_use]
    pub fn within(mut self, parent: &CancelScope) -> Self {
        self.parent = Some(parent.clone());
        self
    }

    /// Populate the store with `count` items and start advancing it every
    /// frame. Any previous activation is cancelled first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidCount`](gyre_core::StoreError::InvalidCount)
    /// for an invalid count. The check happens before anything else, so a
    /// running activation keeps running.
    pub fn activate(&mut self, count: i64) -> Result<()> {
        checked_count(count)?;
        self.deactivate();
        self.store.initialize(count)?;

        self.meter.borrow_mut().reset();
        self.ticks.set(0);
        self.activations += 1;

        let store = self.store.clone();
        let meter = Rc::clone(&self.meter);
        let ticks = Rc::clone(&self.ticks);
        let policy = self.config.step_policy;
        let body = move |now: Instant| {
            let elapsed = meter.borrow_mut().record(now);
            ticks.set(ticks.get() + 1);
            match policy {
                StepPolicy::PerCall => store.advance(),
                StepPolicy::ScaledByElapsed { .. } => {
                    store.advance_by(store.config().step * policy.scale(elapsed));
                }
            }
        };

        let frame_loop = match &self.parent {
            Some(parent) => FrameLoop::start_within(Rc::clone(&self.clock), parent, body),
            None => FrameLoop::start(Rc::clone(&self.clock), body),
        };
        info!(
            count,
            activation = self.activations,
            scope_id = frame_loop.scope().id(),
            "driver activated"
        );
        self.active = Some(frame_loop);
        Ok(())
    }

    /// Stop the current activation. Returns `false` if nothing was running.
    pub fn deactivate(&mut self) -> bool {
        match self.active.take() {
            Some(frame_loop) => {
                let was_running = frame_loop.stop();
                debug!(ticks = self.ticks.get(), "driver deactivated");
                was_running
            }
            None => false,
        }
    }

    /// Whether an activation exists and its scope is still live.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.as_ref().is_some_and(FrameLoop::is_running)
    }

    /// Ticks of the current (or most recent) activation.
    #[must_use]
    pub fn ticks(&self) -> u64 {
        self.ticks.get()
    }

    #[must_use]
    pub fn activations(&self) -> u64 {
        self.activations
    }

    /// Measured tick rate of the current activation.
    #[must_use]
    pub fn tick_rate(&self) -> Option<f64> {
        self.meter.borrow().ticks_per_second()
    }

    #[must_use]
    pub fn meter(&self) -> TickRateMeter {
        self.meter.borrow().clone()
    }

    #[must_use]
    pub fn store(&self) -> &Store {
        &self.store
    }

    #[must_use]
    pub fn config(&self) -> DriverConfig {
        self.config
    }
}

impl Drop for UpdateDriver {
    fn drop(&mut self) {
        self.deactivate();
    }
}

impl std::fmt::Debug for UpdateDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateDriver")
            .field("store", &self.store)
            .field("config", &self.config)
            .field("active", &self.is_active())
            .field("ticks", &self.ticks.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_clock::FrameScheduler;
    use crate::store::StoreConfig;
    use gyre_core::cancel::LabClock;
    use gyre_core::{ItemId, StoreError};

    const FRAME: Duration = Duration::from_millis(16);

    fn setup() -> (FrameScheduler, UpdateDriver) {
        let clock = LabClock::new();
        let scheduler = FrameScheduler::lab(&clock, FRAME);
        let store = Store::with_config(StoreConfig::default().with_seed(9));
        let driver = UpdateDriver::new(store, Rc::new(scheduler.clone()));
        (scheduler, driver)
    }

    #[test]
    fn activation_initializes_then_advances_per_frame() {
        let (scheduler, mut driver) = setup();
        driver.activate(4).unwrap();
        assert_eq!(driver.store().get_state().count(), 4);
        assert_eq!(driver.store().stats().transitions, 1);
        for _ in 0..3 {
            scheduler.fire_frame();
        }
        assert_eq!(driver.ticks(), 3);
        assert_eq!(driver.store().stats().transitions, 4);
    }

    #[test]
    fn deactivate_stops_advancing() {
        let (scheduler, mut driver) = setup();
        driver.activate(2).unwrap();
        scheduler.fire_frame();
        assert!(driver.deactivate());
        assert!(!driver.is_active());
        let generation = driver.store().get_state().generation();
        for _ in 0..10 {
            scheduler.fire_frame();
        }
        assert_eq!(driver.store().get_state().generation(), generation);
        assert!(!driver.deactivate());
    }

    #[test]
    fn reactivation_replaces_the_previous_loop() {
        let (scheduler, mut driver) = setup();
        driver.activate(10).unwrap();
        scheduler.fire_frame();
        driver.activate(3).unwrap();
        assert_eq!(scheduler.pending(), 1);
        let before = driver.store().stats().transitions;
        scheduler.fire_frame();
        assert_eq!(driver.store().stats().transitions, before + 1);
        assert_eq!(driver.store().get_state().count(), 3);
        assert_eq!(driver.activations(), 2);
    }

    #[test]
    fn invalid_count_keeps_previous_activation() {
        let (scheduler, mut driver) = setup();
        driver.activate(2).unwrap();
        let err = driver.activate(-5).unwrap_err();
        assert!(matches!(err, StoreError::InvalidCount { requested: -5, .. }));
        assert!(driver.is_active());
        scheduler.fire_frame();
        assert_eq!(driver.ticks(), 1);
    }

    #[test]
    fn per_call_policy_ignores_frame_gaps() {
        let (scheduler, mut driver) = setup();
        driver.activate(1).unwrap();
        let start = driver.store().get_state().orientation(ItemId(0)).unwrap();
        scheduler.fire_frame();
        scheduler.skip_frame();
        scheduler.skip_frame();
        scheduler.fire_frame();
        let end = driver.store().get_state().orientation(ItemId(0)).unwrap();
        assert!(end.approx_eq(&start.offset(0.02), 1e-12));
    }

    #[test]
    fn scaled_policy_follows_elapsed_time() {
        let clock = LabClock::new();
        let scheduler = FrameScheduler::lab(&clock, FRAME);
        let store = Store::with_config(StoreConfig::default().with_seed(9));
        let config = DriverConfig::default()
            .with_step_policy(StepPolicy::ScaledByElapsed { nominal_interval: FRAME });
        let mut driver = UpdateDriver::with_config(store, Rc::new(scheduler.clone()), config);
        driver.activate(1).unwrap();
        let start = driver.store().get_state().orientation(ItemId(0)).unwrap();
        scheduler.fire_frame();
        scheduler.skip_frame();
        scheduler.fire_frame();
        let end = driver.store().get_state().orientation(ItemId(0)).unwrap();
        // First tick unscaled (0.01), second spans two intervals (0.02).
        assert!(end.approx_eq(&start.offset(0.03), 1e-9));
    }

    #[test]
    fn meter_reports_frame_rate() {
        let (scheduler, mut driver) = setup();
        driver.activate(1).unwrap();
        assert_eq!(driver.tick_rate(), None);
        for _ in 0..5 {
            scheduler.fire_frame();
        }
        let rate = driver.tick_rate().unwrap();
        assert!((rate - 62.5).abs() < 1e-6, "rate {rate}");
        assert_eq!(driver.meter().ticks(), 5);
    }

    #[test]
    fn parent_scope_cancellation_stops_driver() {
        let clock = LabClock::new();
        let scheduler = FrameScheduler::lab(&clock, FRAME);
        let (parent, handle) = CancelScope::lab(&clock);
        let mut driver = UpdateDriver::new(Store::new(), Rc::new(scheduler.clone())).within(&parent);
        driver.activate(1).unwrap();
        scheduler.fire_frame();
        handle.cancel();
        scheduler.fire_frame();
        assert_eq!(driver.ticks(), 1);
        assert!(!driver.is_active());
    }

    #[test]
    fn dropping_driver_withdraws_tick() {
        let (scheduler, mut driver) = setup();
        driver.activate(1).unwrap();
        drop(driver);
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn meter_window_is_bounded() {
        let clock = LabClock::new();
        let mut meter = TickRateMeter::new(2);
        for ms in [10u64, 20, 40] {
            clock.advance(Duration::from_millis(ms));
            meter.record(clock.now());
        }
        clock.advance(Duration::from_millis(40));
        meter.record(clock.now());
        // Intervals were 20, 40, 40; the window keeps the last two.
        assert_eq!(meter.mean_interval(), Some(Duration::from_millis(40)));
        meter.reset();
        assert_eq!(meter.ticks(), 0);
        assert_eq!(meter.mean_interval(), None);
    }

    #[test]
    fn step_policy_scale() {
        assert_eq!(StepPolicy::PerCall.scale(Some(Duration::from_secs(1))), 1.0);
        let scaled = StepPolicy::ScaledByElapsed {
            nominal_interval: Duration::from_millis(10),
        };
        assert_eq!(scaled.scale(None), 1.0);
        assert!((scaled.scale(Some(Duration::from_millis(25))) - 2.5).abs() < 1e-12);
    }
}
