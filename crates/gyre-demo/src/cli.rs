#![forbid(unsafe_code)]

//! Command-line argument parsing for the demo.
//!
//! Parses args manually to keep the binary lean. Supports environment
//! variable overrides via the `GYRE_DEMO_*` prefix.

use std::env;
use std::fmt;
use std::str::FromStr;

use crate::error::{DemoError, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub const HELP_TEXT: &str = "\
Gyre Demo: headless scene simulation

USAGE:
    gyre-demo [OPTIONS]

OPTIONS:
    --count=N            Number of simulated items (default: 1000)
    --frames=N           Stop after N frames, 0 = until deadline (default: 300)
    --fps=N              Target frame rate (default: 60)
    --mode=MODE          Consumption mode: 'coupled', 'decoupled', or 'instanced'
                         (default: coupled)
    --seed=N             Seed for initial orientations (default: random)
    --step=F             Per-tick increment in radians (default: 0.01)
    --scaled             Scale the increment by elapsed frame time
    --exit-after-ms=N    Stop after N milliseconds, 0 = disabled (default: 0)
    --help, -h           Show this help message
    --version, -V        Show version

ENVIRONMENT VARIABLES:
    GYRE_DEMO_COUNT           Override --count
    GYRE_DEMO_FRAMES          Override --frames
    GYRE_DEMO_FPS             Override --fps
    GYRE_DEMO_MODE            Override --mode
    GYRE_DEMO_SEED            Override --seed
    GYRE_DEMO_STEP            Override --step
    GYRE_DEMO_SCALED          Override --scaled (1/true to enable)
    GYRE_DEMO_EXIT_AFTER_MS   Override --exit-after-ms
    RUST_LOG                  Log filter (default: info)";

/// How the demo consumes the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// One render-coupled consumer per item.
    #[default]
    Coupled,
    /// One render-decoupled consumer per item, applied every frame.
    Decoupled,
    /// One whole-scene instanced batch.
    Instanced,
}

impl FromStr for Mode {
    type Err = DemoError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "coupled" => Ok(Self::Coupled),
            "decoupled" => Ok(Self::Decoupled),
            "instanced" => Ok(Self::Instanced),
            other => Err(DemoError::invalid(format!("unknown mode '{other}'"))),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Coupled => "coupled",
            Self::Decoupled => "decoupled",
            Self::Instanced => "instanced",
        })
    }
}

/// Parsed command-line options.
#[derive(Debug, Clone, PartialEq)]
pub struct Opts {
    /// Item count passed to the driver. Validated by the store, not here.
    pub count: i64,
    /// Frame limit (0 = none).
    pub frames: u64,
    pub fps: u32,
    pub mode: Mode,
    pub seed: Option<u64>,
    pub step: f64,
    /// Use the elapsed-time step policy.
    pub scaled: bool,
    /// Auto-exit after this many milliseconds (0 = disabled).
    pub exit_after_ms: u64,
}

impl Default for Opts {
    fn default() -> Self {
        Self {
            count: 1000,
            frames: 300,
            fps: 60,
            mode: Mode::Coupled,
            seed: None,
            step: 0.01,
            scaled: false,
            exit_after_ms: 0,
        }
    }
}

/// Outcome of argument parsing.
#[derive(Debug, Clone, PartialEq)]
pub enum Parsed {
    Run(Opts),
    Help,
    Version,
}

fn parse_value<T: FromStr>(flag: &str, val: &str) -> Result<T> {
    val.parse()
        .map_err(|_| DemoError::invalid(format!("invalid {flag} value: {val}")))
}

fn truthy(val: &str) -> bool {
    val == "1" || val.eq_ignore_ascii_case("true")
}

impl Opts {
    /// Parse the process arguments and environment.
    pub fn parse() -> Result<Parsed> {
        Self::parse_from(env::args().skip(1), |key| env::var(key).ok())
    }

    /// Parse `args` on top of environment values read through `lookup`.
    ///
    /// Environment variables take precedence over defaults but are overridden
    /// by explicit command-line flags. Malformed environment values are
    /// ignored; malformed flags are errors.
    pub fn parse_from<I, F>(args: I, lookup: F) -> Result<Parsed>
    where
        I: IntoIterator<Item = String>,
        F: Fn(&str) -> Option<String>,
    {
        let mut opts = Self::default();

        if let Some(val) = lookup("GYRE_DEMO_COUNT")
            && let Ok(n) = val.parse()
        {
            opts.count = n;
        }
        if let Some(val) = lookup("GYRE_DEMO_FRAMES")
            && let Ok(n) = val.parse()
        {
            opts.frames = n;
        }
        if let Some(val) = lookup("GYRE_DEMO_FPS")
            && let Ok(n) = val.parse()
        {
            opts.fps = n;
        }
        if let Some(val) = lookup("GYRE_DEMO_MODE")
            && let Ok(mode) = val.parse()
        {
            opts.mode = mode;
        }
        if let Some(val) = lookup("GYRE_DEMO_SEED")
            && let Ok(n) = val.parse()
        {
            opts.seed = Some(n);
        }
        if let Some(val) = lookup("GYRE_DEMO_STEP")
            && let Ok(n) = val.parse()
        {
            opts.step = n;
        }
        if let Some(val) = lookup("GYRE_DEMO_SCALED") {
            opts.scaled = truthy(&val);
        }
        if let Some(val) = lookup("GYRE_DEMO_EXIT_AFTER_MS")
            && let Ok(n) = val.parse()
        {
            opts.exit_after_ms = n;
        }

        for arg in args {
            match arg.as_str() {
                "--help" | "-h" => return Ok(Parsed::Help),
                "--version" | "-V" => return Ok(Parsed::Version),
                "--scaled" => opts.scaled = true,
                other => {
                    if let Some(val) = other.strip_prefix("--count=") {
                        opts.count = parse_value("--count", val)?;
                    } else if let Some(val) = other.strip_prefix("--frames=") {
                        opts.frames = parse_value("--frames", val)?;
                    } else if let Some(val) = other.strip_prefix("--fps=") {
                        opts.fps = parse_value("--fps", val)?;
                    } else if let Some(val) = other.strip_prefix("--mode=") {
                        opts.mode = val.parse()?;
                    } else if let Some(val) = other.strip_prefix("--seed=") {
                        opts.seed = Some(parse_value("--seed", val)?);
                    } else if let Some(val) = other.strip_prefix("--step=") {
                        opts.step = parse_value("--step", val)?;
                    } else if let Some(val) = other.strip_prefix("--exit-after-ms=") {
                        opts.exit_after_ms = parse_value("--exit-after-ms", val)?;
                    } else {
                        return Err(DemoError::invalid(format!(
                            "unknown argument: {other} (run with --help for usage)"
                        )));
                    }
                }
            }
        }

        if opts.fps == 0 {
            return Err(DemoError::invalid("--fps must be at least 1"));
        }
        if !opts.step.is_finite() {
            return Err(DemoError::invalid("--step must be finite"));
        }
        Ok(Parsed::Run(opts))
    }
}
