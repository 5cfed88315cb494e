use berth_core::config::{GeneralConfig, LogFormat};
use tracing_subscriber::{fmt, EnvFilter};

fn filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Initialize logging with human-readable output format.
///
/// Uses the `RUST_LOG` environment variable if set, otherwise falls back
/// to `default_level` (e.g. "info", "debug", "berth_orchestrator=debug,warn").
///
/// Safe to call multiple times (e.g. in tests); subsequent calls are no-ops.
pub fn init_logging(service_name: &str, default_level: &str) {
    fmt()
        .with_env_filter(filter(default_level))
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_level(true)
        .try_init()
        .ok();

    tracing::debug!(service = service_name, "logging initialised (human-readable)");
}

/// Initialize logging with JSON output, one object per line.
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init_logging_json(service_name: &str, default_level: &str) {
    fmt()
        .json()
        .with_env_filter(filter(default_level))
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_level(true)
        .try_init()
        .ok();

    tracing::debug!(service = service_name, "logging initialised (json)");
}

/// Pick the output format from the `[general]` config section.
pub fn init_from_config(service_name: &str, general: &GeneralConfig) {
    match general.format() {
        LogFormat::Human => init_logging(service_name, &general.log_level),
        LogFormat::Json => init_logging_json(service_name, &general.log_level),
    }
}
