use berth_core::config::GeneralConfig;
use berth_telemetry::logging;

#[test]
fn init_logging_human_twice_is_safe() {
    logging::init_logging("test-service", "debug");
    logging::init_logging("test-service", "info");

    tracing::info!(key = "value", "human-readable log line");
}

#[test]
fn init_logging_json_after_global_set_is_noop() {
    logging::init_logging_json("test-service-json", "info");

    tracing::info!(key = "value", "json log line");
}

#[test]
fn init_from_config_accepts_both_formats() {
    let mut general = GeneralConfig::default();
    logging::init_from_config("cfg-human", &general);

    general.log_format = "json".into();
    general.log_level = "warn".into();
    logging::init_from_config("cfg-json", &general);
}
