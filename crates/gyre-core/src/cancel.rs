//! Cooperative cancellation scopes for frame loops.
//!
//! A [`CancelScope`] is checked by recurring work (frame ticks, paced run
//! loops) at the point where the work would start. Cancelling never
//! interrupts work already running; it only guarantees that no new unit of
//! work starts afterwards.
//!
//! Scopes form a tree: cancelling a parent cancels every child, and a child
//! sees the tighter of its own deadline and its parent's.
//!
//! Time comes from either the real clock or a shared [`LabClock`], so tests
//! can drive deadlines deterministically.
//!
//! ```
//! use gyre_core::cancel::CancelScope;
//!
//! let (scope, handle) = CancelScope::root();
//! assert!(scope.check().is_ok());
//! handle.cancel();
//! assert!(scope.is_cancelled());
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use thiserror::Error;
use tracing::warn;
use web_time::{Duration, Instant};

static NEXT_SCOPE_ID: AtomicU64 = AtomicU64::new(1);

const NO_DEADLINE: u64 = u64::MAX;

fn as_micros(d: Duration) -> u64 {
    d.as_micros().min(u128::from(u64::MAX)) as u64
}

// ─── Time source ─────────────────────────────────────────────────────────────

/// A manually advanced clock shared by every scope created from it.
#[derive(Debug, Clone)]
pub struct LabClock {
    epoch: Instant,
    offset_us: Arc<AtomicU64>,
}

impl LabClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            offset_us: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn advance(&self, delta: Duration) {
        self.offset_us.fetch_add(as_micros(delta), Ordering::Release);
    }

    #[must_use]
    pub fn now(&self) -> Instant {
        self.epoch + Duration::from_micros(self.offset_us.load(Ordering::Acquire))
    }
}

impl Default for LabClock {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
enum TimeSource {
    Real,
    Lab(LabClock),
}

impl TimeSource {
    fn now(&self) -> Instant {
        match self {
            Self::Real => Instant::now(),
            Self::Lab(clock) => clock.now(),
        }
    }
}

// ─── Scope ───────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct ScopeInner {
    id: u64,
    cancelled: AtomicBool,
    /// Microseconds after `created_at`; `NO_DEADLINE` when unbounded.
    deadline_us: u64,
    created_at: Instant,
    time: TimeSource,
    parent: Option<Arc<ScopeInner>>,
}

impl ScopeInner {
    fn cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
            || self.parent.as_ref().is_some_and(|p| p.cancelled())
    }

    fn remaining_us(&self) -> u64 {
        let own = if self.deadline_us == NO_DEADLINE {
            NO_DEADLINE
        } else {
            let elapsed = self
                .time
                .now()
                .checked_duration_since(self.created_at)
                .unwrap_or(Duration::ZERO);
            self.deadline_us.saturating_sub(as_micros(elapsed))
        };
        let parent = self.parent.as_ref().map_or(NO_DEADLINE, |p| p.remaining_us());
        own.min(parent)
    }
}

/// Cancellation scope handle. Cheap to clone; all clones observe the same
/// cancellation.
#[derive(Debug, Clone)]
pub struct CancelScope {
    inner: Arc<ScopeInner>,
}

impl CancelScope {
    fn build(deadline_us: u64, time: TimeSource, parent: Option<Arc<ScopeInner>>) -> (Self, CancelHandle) {
        let inner = Arc::new(ScopeInner {
            id: NEXT_SCOPE_ID.fetch_add(1, Ordering::Relaxed),
            cancelled: AtomicBool::new(false),
            deadline_us,
            created_at: time.now(),
            time,
            parent,
        });
        (
            Self {
                inner: Arc::clone(&inner),
            },
            CancelHandle { inner },
        )
    }

    /// A root scope on the real clock with no deadline.
    #[must_use]
    pub fn root() -> (Self, CancelHandle) {
        Self::build(NO_DEADLINE, TimeSource::Real, None)
    }

    /// A root scope on the real clock that expires after `deadline`.
    #[must_use]
    pub fn with_deadline(deadline: Duration) -> (Self, CancelHandle) {
        Self::build(as_micros(deadline), TimeSource::Real, None)
    }

    /// A root scope whose time is read from `clock`.
    #[must_use]
    pub fn lab(clock: &LabClock) -> (Self, CancelHandle) {
        Self::build(NO_DEADLINE, TimeSource::Lab(clock.clone()), None)
    }

    #[must_use]
    pub fn lab_with_deadline(clock: &LabClock, deadline: Duration) -> (Self, CancelHandle) {
        Self::build(as_micros(deadline), TimeSource::Lab(clock.clone()), None)
    }

    /// A child scope inheriting this scope's time source and deadline.
    #[must_use]
    pub fn child(&self) -> (Self, CancelHandle) {
        Self::build(
            NO_DEADLINE,
            self.inner.time.clone(),
            Some(Arc::clone(&self.inner)),
        )
    }

    #[inline]
    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Whether this scope or any ancestor was cancelled.
    #[inline]
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled()
    }

    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        match self.inner.remaining_us() {
            NO_DEADLINE => None,
            us => Some(Duration::from_micros(us)),
        }
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.remaining().is_some_and(|d| d.is_zero())
    }

    /// Cancelled or expired.
    #[inline]
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.is_cancelled() || self.is_expired()
    }

    #[must_use]
    pub fn now(&self) -> Instant {
        self.inner.time.now()
    }

    #[must_use]
    pub fn is_lab(&self) -> bool {
        matches!(self.inner.time, TimeSource::Lab(_))
    }

    pub fn check(&self) -> Result<(), CancelError> {
        if self.is_cancelled() {
            Err(CancelError::Cancelled)
        } else if self.is_expired() {
            Err(CancelError::DeadlineExceeded)
        } else {
            Ok(())
        }
    }

    /// Block for `duration` in short slices, stopping early when the scope
    /// is cancelled or its deadline passes.
    ///
    /// Returns `true` if the full duration elapsed. On a lab clock this does
    /// not block; it advances nothing and only reports liveness.
    pub fn sleep(&self, duration: Duration) -> bool {
        if self.is_done() {
            return false;
        }
        let wanted = self.remaining().map_or(duration, |rem| duration.min(rem));
        if self.is_lab() {
            return wanted == duration;
        }
        let slice = Duration::from_millis(10);
        let mut left = wanted;
        while !left.is_zero() {
            if self.is_cancelled() {
                return false;
            }
            let step = left.min(slice);
            std::thread::sleep(step);
            left = left.saturating_sub(step);
        }
        wanted == duration && !self.is_cancelled()
    }
}

// ─── Handle ──────────────────────────────────────────────────────────────────

/// Owner side of a [`CancelScope`].
///
/// Dropping the handle does not cancel the scope.
#[derive(Debug)]
pub struct CancelHandle {
    inner: Arc<ScopeInner>,
}

impl CancelHandle {
    /// Cancel the scope and every child. Idempotent.
    pub fn cancel(&self) {
        if !self.inner.cancelled.swap(true, Ordering::AcqRel) {
            warn!(scope_id = self.inner.id, "scope cancelled");
        }
    }

    #[inline]
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn scope(&self) -> CancelScope {
        CancelScope {
            inner: Arc::clone(&self.inner),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CancelError {
    #[error("scope cancelled")]
    Cancelled,
    #[error("deadline exceeded")]
    DeadlineExceeded,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_scope_is_live() {
        let (scope, _handle) = CancelScope::root();
        assert!(!scope.is_done());
        assert!(scope.remaining().is_none());
        assert_eq!(scope.check(), Ok(()));
    }

    #[test]
    fn cancel_reaches_clones_and_children() {
        let (scope, handle) = CancelScope::root();
        let clone = scope.clone();
        let (child, _child_handle) = scope.child();
        handle.cancel();
        assert!(clone.is_cancelled());
        assert!(child.is_cancelled());
        assert_eq!(child.check(), Err(CancelError::Cancelled));
    }

    #[test]
    fn cancelling_child_leaves_parent_live() {
        let (parent, _ph) = CancelScope::root();
        let (child, ch) = parent.child();
        ch.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[test]
    fn double_cancel_is_idempotent() {
        let (scope, handle) = CancelScope::root();
        handle.cancel();
        handle.cancel();
        assert!(scope.is_cancelled());
        assert!(handle.is_cancelled());
    }

    #[test]
    fn lab_deadline_expires_deterministically() {
        let clock = LabClock::new();
        let (scope, _h) = CancelScope::lab_with_deadline(&clock, Duration::from_millis(100));
        clock.advance(Duration::from_millis(60));
        assert!(!scope.is_expired());
        assert_eq!(scope.remaining(), Some(Duration::from_millis(40)));
        clock.advance(Duration::from_millis(50));
        assert!(scope.is_expired());
        assert_eq!(scope.check(), Err(CancelError::DeadlineExceeded));
    }

    #[test]
    fn child_inherits_parent_deadline() {
        let clock = LabClock::new();
        let (parent, _h) = CancelScope::lab_with_deadline(&clock, Duration::from_millis(30));
        let (child, _ch) = parent.child();
        assert!(child.is_lab());
        clock.advance(Duration::from_millis(31));
        assert!(child.is_expired());
    }

    #[test]
    fn sleep_returns_false_once_cancelled() {
        let (scope, handle) = CancelScope::root();
        handle.cancel();
        assert!(!scope.sleep(Duration::from_secs(5)));
    }

    #[test]
    fn lab_sleep_does_not_block() {
        let clock = LabClock::new();
        let (scope, _h) = CancelScope::lab(&clock);
        assert!(scope.sleep(Duration::from_secs(3600)));
    }

    #[test]
    fn handle_scope_shares_state() {
        let (_scope, handle) = CancelScope::root();
        let again = handle.scope();
        handle.cancel();
        assert!(again.is_cancelled());
    }

    #[test]
    fn scope_ids_are_unique() {
        let (a, _) = CancelScope::root();
        let (b, _) = CancelScope::root();
        assert_ne!(a.id(), b.id());
    }
}
