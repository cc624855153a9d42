//! Log output for the command-line binary
//!
//! The library only emits `tracing` events; installing a subscriber is left to
//! the binary. Output goes to stderr so JSON on stdout stays machine-readable.
//!
//! The level can be controlled via the RUST_LOG environment variable:
//! - RUST_LOG=pestdesk=debug pestdesk get /orders  (cache hits, each attempt)
//! - RUST_LOG=pestdesk=warn pestdesk get /orders   (retries and failures only)

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used when RUST_LOG is unset or invalid
pub const DEFAULT_LOG_FILTER: &str = "pestdesk=info";

/// Builds the filter from RUST_LOG, falling back to `DEFAULT_LOG_FILTER`
pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
}

/// Installs the global subscriber
///
/// Does nothing if a subscriber is already installed (e.g. by a test harness).
pub fn init() {
    let _ = tracing_subscriber::registry()
        .with(env_filter())
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .compact(),
        )
        .try_init();
}
