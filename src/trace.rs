//! Subscriber setup for binaries and tests.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Install a `fmt` subscriber filtered by `RUST_LOG`, falling back to
/// `reactivesocket_aeron=debug`.
///
/// Thread names are included since the duty threads are named. Calling this
/// twice is harmless; the second install is ignored.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("reactivesocket_aeron=debug"));

    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_names(true)
                .with_file(false)
                .with_line_number(false)
                .with_timer(fmt::time::uptime()),
        )
        .with(filter)
        .try_init();
}
