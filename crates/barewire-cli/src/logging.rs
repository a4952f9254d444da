//! Logging initialization for the CLI.
//!
//! The library crate stays tracing-free; the CLI decides the level and the
//! output shape here. `RUST_LOG` is honored, with the `-v` flags raising the
//! level for this crate's own targets.

use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize the tracing subscriber.
///
/// `verbosity` maps 0/1/2+ to INFO/DEBUG/TRACE. With `json`, log lines are
/// emitted as JSON to stderr for machine consumption; otherwise as plain
/// human-readable lines.
///
/// # Panics
/// Panics if a subscriber is already installed.
pub fn init(verbosity: u8, json: bool) {
    let level = match verbosity {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn"))
        .add_directive(format!("barewire={level}").parse().unwrap())
        .add_directive(level.into());

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .init();
    }
}
