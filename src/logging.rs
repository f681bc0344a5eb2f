// SPDX-License-Identifier: MIT

//! Log setup for the binaries.  Library code only emits events.

use tracing::Level;
use tracing_subscriber::{EnvFilter, fmt};

/// Log to stderr, filtered by `RUST_LOG` on top of the chosen default level.
///
/// Stdout is left to the grain's app.  Installing twice is not an error; the
/// first subscriber stays.
pub fn init(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::from_default_env().add_directive(level.into());
    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
