//! Development-time tracing.
//!
//! Tracing goes to stderr and is filtered by `RUST_LOG` (default `warn`).
//! Command results are printed to stdout by the binary and are not affected.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the stderr subscriber.
///
/// `verbose` raises the `autorun` target to `debug` on top of `RUST_LOG`.
///
/// ```bash
/// RUST_LOG=autorun=trace autorun hook < payload.json
/// ```
pub fn init(verbose: bool) {
    let mut filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    if verbose && let Ok(directive) = "autorun=debug".parse() {
        filter = filter.add_directive(directive);
    }

    // A second init (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}
