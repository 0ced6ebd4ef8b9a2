use tracing_subscriber::{fmt, EnvFilter};

/// Environment variable that controls log verbosity.
pub const LOG_ENV: &str = "GPURPC_LOG";

/// Initialize structured logging with environment filter.
/// Set GPURPC_LOG=debug (or trace, info, warn, error) for verbosity control.
/// Per-request dispatch logs are emitted at `debug` under the `gpurpc_server` target.
pub fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();
}

/// Like [`init_logging`], but tolerates a subscriber that is already installed.
/// Test binaries call this from every test.
pub fn try_init_logging() -> bool {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init()
        .is_ok()
}
