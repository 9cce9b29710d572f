use tracing_subscriber::{EnvFilter, fmt};

/// Directives used when `COURIER_LOG` is not set: our own crates only,
/// verbose in debug builds.
const fn default_directives() -> &'static str {
    if cfg!(debug_assertions) {
        "courier_common=trace,courier_dispatch=trace"
    } else {
        "courier_common=info,courier_dispatch=info"
    }
}

/// Install the process-wide tracing subscriber.
///
/// Filtering is directive-based and read from `COURIER_LOG` (same syntax as
/// `RUST_LOG`), so per-module levels like `courier_dispatch=debug` work out
/// of the box. Events carry the time since subscriber setup rather than a
/// wall-clock stamp; the process embedding the dispatcher owns wall-clock
/// log correlation.
///
/// # Panics
/// Panics if a global subscriber has already been installed.
pub fn init() {
    let filter = EnvFilter::try_from_env("COURIER_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_directives()));

    fmt()
        .compact()
        .with_env_filter(filter)
        .with_timer(fmt::time::uptime())
        .with_target(true)
        .init();
}
