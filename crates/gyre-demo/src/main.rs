#![forbid(unsafe_code)]

//! Gyre demo binary.
//!
//! Drives a scene store from a real-time frame scheduler and presents it
//! through one of the consumption modes, then logs a summary.

mod cli;
mod error;
mod run;

use tracing_subscriber::EnvFilter;

use crate::cli::{HELP_TEXT, Opts, Parsed, VERSION};

#[cfg(feature = "tracing-json")]
fn init_tracing() {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

#[cfg(not(feature = "tracing-json"))]
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .init();
}

fn main() {
    let opts = match Opts::parse() {
        Ok(Parsed::Run(opts)) => opts,
        Ok(Parsed::Help) => {
            println!("{HELP_TEXT}");
            return;
        }
        Ok(Parsed::Version) => {
            println!("gyre-demo {VERSION}");
            return;
        }
        Err(error) => {
            eprintln!("{error}");
            std::process::exit(error.exit_code());
        }
    };

    init_tracing();
    if opts.exit_after_ms > 0 {
        tracing::warn!(exit_after_ms = opts.exit_after_ms, "auto-exit deadline set");
    }

    if let Err(error) = run::run(&opts) {
        tracing::error!(%error, "demo failed");
        eprintln!("{error}");
        std::process::exit(error.exit_code());
    }
}
