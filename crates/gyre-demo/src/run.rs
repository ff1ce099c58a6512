#![forbid(unsafe_code)]

//! The headless simulation: store, driver, consumers, paced frame loop.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use gyre::prelude::*;
use tracing::{info, warn};
use web_time::{Duration, Instant};

use crate::cli::{Mode, Opts};
use crate::error::{DemoError, Result};

/// Summary of one run.
#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    pub mode: Mode,
    pub count: usize,
    pub frames: u64,
    pub ticks: u64,
    pub tick_rate: Option<f64>,
    pub transitions: u64,
    pub notifications: u64,
    pub listener_failures: u64,
    /// Consumer renders (coupled) or applies (decoupled, instanced).
    pub presentations: u64,
    pub elapsed: Duration,
}

/// The per-frame presentation step for the chosen mode. Owns the consumers.
enum Presenter {
    Coupled {
        consumers: Vec<RenderCoupled<Option<Orientation>>>,
        redraw: RedrawRequest,
    },
    Decoupled {
        consumers: Vec<RenderDecoupled<Option<Orientation>>>,
    },
    Instanced {
        batch: RefCell<InstancedBatch>,
    },
}

impl Presenter {
    fn mount(mode: Mode, store: &Store) -> Self {
        let ids: Vec<ItemId> = store.with_state(|state| state.ids().to_vec());
        match mode {
            Mode::Coupled => {
                let redraw = RedrawRequest::new();
                let consumers = ids
                    .iter()
                    .map(|id| RenderCoupled::item(store, *id, Some(redraw.clone())))
                    .collect();
                Self::Coupled { consumers, redraw }
            }
            Mode::Decoupled => Self::Decoupled {
                consumers: ids
                    .iter()
                    .map(|id| RenderDecoupled::item(store, *id))
                    .collect(),
            },
            Mode::Instanced => Self::Instanced {
                batch: RefCell::new(InstancedBatch::mount(store)),
            },
        }
    }

    /// Present one frame; returns the number of consumers that produced
    /// output.
    fn present(&self) -> u64 {
        match self {
            Self::Coupled { consumers, redraw } => {
                if !redraw.take() {
                    return 0;
                }
                let mut rendered = 0;
                for consumer in consumers {
                    if consumer.render_if_needed(|props| props.is_some()).is_some() {
                        rendered += 1;
                    }
                }
                rendered
            }
            Self::Decoupled { consumers } => {
                let mut applied = 0;
                for consumer in consumers {
                    if consumer.apply(Option::is_some) {
                        applied += 1;
                    }
                }
                applied
            }
            Self::Instanced { batch } => batch.borrow_mut().apply_frame() as u64,
        }
    }
}

/// Run the simulation described by `opts`.
pub fn run(opts: &Opts) -> Result<Report> {
    let mut config = StoreConfig::default().with_step(opts.step);
    if let Some(seed) = opts.seed {
        config = config.with_seed(seed);
    }
    let store = Store::with_config(config);
    let failures = Rc::new(Cell::new(0u64));
    let failure_count = Rc::clone(&failures);
    store.set_failure_sink(move |failure: &ListenerFailure| {
        failure_count.set(failure_count.get() + 1);
        warn!(%failure, "listener failure reported");
    });

    let scheduler = FrameScheduler::real(opts.fps);
    let clock: Rc<dyn FrameClock> = Rc::new(scheduler.clone());
    let (scope, _handle) = if opts.exit_after_ms > 0 {
        CancelScope::with_deadline(Duration::from_millis(opts.exit_after_ms))
    } else {
        CancelScope::root()
    };

    let policy = if opts.scaled {
        StepPolicy::ScaledByElapsed {
            nominal_interval: scheduler.interval(),
        }
    } else {
        StepPolicy::PerCall
    };
    let driver_config = DriverConfig::default().with_step_policy(policy);
    let mut driver =
        UpdateDriver::with_config(store.clone(), Rc::clone(&clock), driver_config).within(&scope);
    driver.activate(opts.count)?;

    let presenter = Presenter::mount(opts.mode, &store);
    let boundary = Rc::new(RenderBoundary::new(opts.mode.to_string()));
    let presentations = Rc::new(Cell::new(0u64));
    let frame_boundary = Rc::clone(&boundary);
    let frame_presentations = Rc::clone(&presentations);
    let present_loop = FrameLoop::start_within(clock, &scope, move |_| {
        if let Some(n) = frame_boundary.render(|| presenter.present()) {
            frame_presentations.set(frame_presentations.get() + n);
        }
    });

    let count = store.get_state().count();
    info!(mode = %opts.mode, count, fps = opts.fps, "simulation started");
    let started = Instant::now();
    let max_frames = (opts.frames > 0).then_some(opts.frames);
    let frames = scheduler.run(&scope, max_frames);
    let elapsed = started.elapsed();

    present_loop.stop();
    driver.deactivate();

    if let Some(failure) = boundary.failure() {
        return Err(DemoError::RenderFailed {
            message: failure.message,
        });
    }

    let stats = store.stats();
    let report = Report {
        mode: opts.mode,
        count,
        frames,
        ticks: driver.ticks(),
        tick_rate: driver.tick_rate(),
        transitions: stats.transitions,
        notifications: stats.notifications,
        listener_failures: failures.get(),
        presentations: presentations.get(),
        elapsed,
    };
    info!(
        mode = %report.mode,
        count = report.count,
        frames = report.frames,
        ticks = report.ticks,
        tick_rate = report.tick_rate.unwrap_or(0.0),
        transitions = report.transitions,
        notifications = report.notifications,
        presentations = report.presentations,
        listener_failures = report.listener_failures,
        elapsed_ms = report.elapsed.as_millis() as u64,
        "simulation finished"
    );
    Ok(report)
}
