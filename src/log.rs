//! Structured logging for maos.
//!
//! Log levels:
//! - ERROR: Failures that end a run (deadlock, cycle, failed group)
//! - WARN: Recoverable surprises (dangling dependency, forced allocation, high utilization)
//! - INFO: Run milestones (plan built, stage started, project status changes)
//! - DEBUG: Per-group and per-task traces
//! - TRACE: Telemetry samples
//!
//! The filter comes from `MAOS_LOG` (EnvFilter syntax). Debug mode can be
//! forced with `MAOS_DEBUG=1` or by calling [`init_with_debug`].

use std::sync::atomic::{AtomicBool, Ordering};

use tracing_subscriber::{fmt, EnvFilter};

static DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);

/// Environment variable holding the log filter directive.
pub const LOG_ENV: &str = "MAOS_LOG";

/// Environment variable that forces debug logging when set to `1` or `true`.
pub const DEBUG_ENV: &str = "MAOS_DEBUG";

/// Initialize logging to stderr.
pub fn init() {
    init_with_debug(false);
}

/// Initialize logging with explicit debug mode setting.
///
/// Safe to call more than once; only the first call installs a subscriber.
pub fn init_with_debug(debug: bool) {
    let debug = debug || env_debug();
    DEBUG_ENABLED.store(debug, Ordering::SeqCst);

    let _ = fmt()
        .with_env_filter(build_filter(debug))
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Whether debug logging was requested at init time.
pub fn is_debug() -> bool {
    DEBUG_ENABLED.load(Ordering::SeqCst)
}

fn env_debug() -> bool {
    std::env::var(DEBUG_ENV)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn build_filter(debug: bool) -> EnvFilter {
    if debug {
        return EnvFilter::new("maos=debug");
    }
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("maos=info"))
}
