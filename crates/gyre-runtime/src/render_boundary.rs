#![forbid(unsafe_code)]

//! Supervisory wrapper for the rendering layer.
//!
//! A [`RenderBoundary`] runs render closures and trips on the first failure
//! (a panic, or an `Err` from [`render_result`](RenderBoundary::render_result)).
//! Once tripped it records the failure and suppresses every further render
//! until [`reset`](RenderBoundary::reset). It wraps rendering only; store
//! transitions isolate their own listener failures.

use std::cell::{Cell, RefCell};
use std::fmt::Display;
use std::panic::{self, AssertUnwindSafe};

use tracing::{error, trace};

use crate::store::panic_message;

/// The failure that tripped a boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderFailure {
    pub message: String,
}

impl Display for RenderFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "render failed: {}", self.message)
    }
}

#[derive(Debug)]
pub struct RenderBoundary {
    label: String,
    failure: RefCell<Option<RenderFailure>>,
    suppressed: Cell<u64>,
}

impl RenderBoundary {
    #[must_use]
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            failure: RefCell::new(None),
            suppressed: Cell::new(0),
        }
    }

    /// Run `f` unless the boundary has tripped. A panic inside `f` trips it.
    pub fn render<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        if self.suppress() {
            return None;
        }
        match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(out) => Some(out),
            Err(payload) => {
                self.trip(panic_message(payload.as_ref()));
                None
            }
        }
    }

    /// Like [`render`](Self::render), also tripping on `Err`.
    pub fn render_result<R, E: Display>(&self, f: impl FnOnce() -> Result<R, E>) -> Option<R> {
        match self.render(f)? {
            Ok(out) => Some(out),
            Err(err) => {
                self.trip(err.to_string());
                None
            }
        }
    }

    #[must_use]
    pub fn is_tripped(&self) -> bool {
        self.failure.borrow().is_some()
    }

    #[must_use]
    pub fn failure(&self) -> Option<RenderFailure> {
        self.failure.borrow().clone()
    }

    /// Renders skipped since the boundary tripped.
    #[must_use]
    pub fn suppressed(&self) -> u64 {
        self.suppressed.get()
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Clear the failure and resume rendering.
    pub fn reset(&self) -> Option<RenderFailure> {
        self.suppressed.set(0);
        self.failure.borrow_mut().take()
    }

    fn suppress(&self) -> bool {
        if !self.is_tripped() {
            return false;
        }
        self.suppressed.set(self.suppressed.get() + 1);
        trace!(boundary = %self.label, "render suppressed");
        true
    }

    fn trip(&self, message: String) {
        error!(boundary = %self.label, %message, "render boundary tripped");
        *self.failure.borrow_mut() = Some(RenderFailure { message });
    }
}
