use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::cache::CacheConfig;

/// Top-level configuration loaded from `~/.berth/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub container: ContainerConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
}

impl Config {
    /// Load config from `~/.berth/config.toml`, falling back to defaults when
    /// the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path)
            .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
        let cfg: Config = toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Semantic validation for settings that types alone cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.general.validate()?;
        self.cache.validate()?;
        self.container.validate()?;
        self.health.validate()?;
        self.events.validate()?;
        self.monitor.validate()?;
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".berth")
            .join("config.toml")
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// general
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Human,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// `"human"` or `"json"`.
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

impl GeneralConfig {
    pub fn format(&self) -> LogFormat {
        match self.log_format.as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Human,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        match self.log_format.as_str() {
            "human" | "json" => Ok(()),
            other => Err(ConfigError::Validation(format!(
                "general.log_format must be \"human\" or \"json\", got {other:?}"
            ))),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "human".into()
}

// ---------------------------------------------------------------------------
// cache
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSection {
    #[serde(default = "default_cache_max_size")]
    pub max_size: usize,
    /// 0 disables time-based expiry.
    #[serde(default = "default_cache_ttl_secs")]
    pub default_ttl_secs: u64,
    /// 0 disables the background sweeper.
    #[serde(default = "default_cache_cleanup_secs")]
    pub cleanup_period_secs: u64,
    #[serde(default = "default_true")]
    pub enable_stats: bool,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            max_size: default_cache_max_size(),
            default_ttl_secs: default_cache_ttl_secs(),
            cleanup_period_secs: default_cache_cleanup_secs(),
            enable_stats: true,
        }
    }
}

impl CacheSection {
    pub fn to_cache_config(&self) -> CacheConfig {
        CacheConfig {
            max_size: self.max_size,
            default_ttl: Duration::from_secs(self.default_ttl_secs),
            cleanup_period: Duration::from_secs(self.cleanup_period_secs),
            enable_stats: self.enable_stats,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_size == 0 {
            return Err(ConfigError::Validation(
                "cache.max_size must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

fn default_cache_max_size() -> usize {
    100
}
fn default_cache_ttl_secs() -> u64 {
    300
}
fn default_cache_cleanup_secs() -> u64 {
    300
}

// ---------------------------------------------------------------------------
// container
// ---------------------------------------------------------------------------

pub const RUNTIME_PREFERENCES: &[&str] = &["auto", "docker", "container", "apple"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    #[serde(default = "default_image")]
    pub image: String,
    #[serde(default = "default_container_name")]
    pub name: String,
    /// `"auto"`, `"docker"`, `"container"` or `"apple"`.
    #[serde(default = "default_runtime")]
    pub runtime: String,
    /// `host:container` port mappings.
    #[serde(default = "default_ports")]
    pub ports: Vec<String>,
    #[serde(default)]
    pub dev_mode: bool,
    #[serde(default = "default_dev_image")]
    pub dev_image: String,
    /// Pull or rebuild even when the image is present locally.
    #[serde(default)]
    pub refresh: bool,
    /// Remove the container once it stops.
    #[serde(default)]
    pub rm: bool,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            image: default_image(),
            name: default_container_name(),
            runtime: default_runtime(),
            ports: default_ports(),
            dev_mode: false,
            dev_image: default_dev_image(),
            refresh: false,
            rm: false,
            env: BTreeMap::new(),
        }
    }
}

impl ContainerConfig {
    /// Image the bootstrap should end up running.
    pub fn effective_image(&self) -> &str {
        if self.dev_mode {
            &self.dev_image
        } else {
            &self.image
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !RUNTIME_PREFERENCES.contains(&self.runtime.as_str()) {
            return Err(ConfigError::Validation(format!(
                "container.runtime must be one of {RUNTIME_PREFERENCES:?}, got {:?}",
                self.runtime
            )));
        }
        if self.name.trim().is_empty() {
            return Err(ConfigError::Validation(
                "container.name must not be empty".into(),
            ));
        }
        Ok(())
    }
}

fn default_image() -> String {
    "ghcr.io/berth-dev/berth:latest".into()
}
fn default_container_name() -> String {
    "berth".into()
}
fn default_runtime() -> String {
    "auto".into()
}
fn default_ports() -> Vec<String> {
    vec!["6369:6369".into()]
}
fn default_dev_image() -> String {
    "berth:dev".into()
}

// ---------------------------------------------------------------------------
// health
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_health_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_health_warmup_ms")]
    pub warmup_ms: u64,
    #[serde(default = "default_health_max_wait_secs")]
    pub max_wait_secs: u64,
    /// Consecutive "container not running" probes before the check gives up.
    /// A closed service port only delays readiness, bounded by `max_wait_secs`.
    #[serde(default = "default_health_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_health_confirm_delay_ms")]
    pub confirm_delay_ms: u64,
    /// Service port probed inside the container.
    #[serde(default = "default_service_port")]
    pub port: u16,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_health_interval_ms(),
            warmup_ms: default_health_warmup_ms(),
            max_wait_secs: default_health_max_wait_secs(),
            failure_threshold: default_health_failure_threshold(),
            confirm_delay_ms: default_health_confirm_delay_ms(),
            port: default_service_port(),
        }
    }
}

impl HealthConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::Validation(
                "health.failure_threshold must be at least 1".into(),
            ));
        }
        if self.interval_ms == 0 {
            return Err(ConfigError::Validation(
                "health.interval_ms must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

fn default_health_interval_ms() -> u64 {
    500
}
fn default_health_warmup_ms() -> u64 {
    2_000
}
fn default_health_max_wait_secs() -> u64 {
    30
}
fn default_health_failure_threshold() -> u32 {
    3
}
fn default_health_confirm_delay_ms() -> u64 {
    500
}
fn default_service_port() -> u16 {
    6369
}

// ---------------------------------------------------------------------------
// events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    #[serde(default = "default_events_host")]
    pub host: String,
    #[serde(default = "default_service_port")]
    pub port: u16,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    #[serde(default = "default_reconnect_secs")]
    pub reconnect_secs: u64,
    #[serde(default = "default_liveness_timeout_secs")]
    pub liveness_timeout_secs: u64,
    /// Per-client buffered messages before drops begin.
    #[serde(default = "default_client_buffer")]
    pub client_buffer: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            host: default_events_host(),
            port: default_service_port(),
            heartbeat_secs: default_heartbeat_secs(),
            reconnect_secs: default_reconnect_secs(),
            liveness_timeout_secs: default_liveness_timeout_secs(),
            client_buffer: default_client_buffer(),
        }
    }
}

impl EventsConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn url(&self) -> String {
        format!("http://{}:{}/v1/events", self.host, self.port)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_secs == 0 {
            return Err(ConfigError::Validation(
                "events.heartbeat_secs must be greater than 0".into(),
            ));
        }
        if self.reconnect_secs == 0 {
            return Err(ConfigError::Validation(
                "events.reconnect_secs must be greater than 0".into(),
            ));
        }
        if self.liveness_timeout_secs <= self.heartbeat_secs {
            return Err(ConfigError::Validation(format!(
                "events.liveness_timeout_secs ({}) must exceed events.heartbeat_secs ({})",
                self.liveness_timeout_secs, self.heartbeat_secs
            )));
        }
        if self.client_buffer == 0 {
            return Err(ConfigError::Validation(
                "events.client_buffer must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

fn default_events_host() -> String {
    "127.0.0.1".into()
}
fn default_heartbeat_secs() -> u64 {
    5
}
fn default_reconnect_secs() -> u64 {
    3
}
fn default_liveness_timeout_secs() -> u64 {
    15
}
fn default_client_buffer() -> usize {
    100
}

// ---------------------------------------------------------------------------
// monitor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_monitor_interval_secs")]
    pub interval_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_monitor_interval_secs(),
        }
    }
}

impl MonitorConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_secs == 0 {
            return Err(ConfigError::Validation(
                "monitor.interval_secs must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

fn default_monitor_interval_secs() -> u64 {
    5
}

fn default_true() -> bool {
    true
}
