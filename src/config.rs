use crate::rate_controller::{ControllerConfig, ControllerOverrides};
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
pub struct PagecastConfig {
    /// Rate controller overrides; unset fields fall back to the built-in defaults
    #[serde(default)]
    pub controller: ControllerOverrides,
    #[serde(default)]
    pub stream: StreamSettings,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub collector: CollectorConfig,
}

/// Which capture strategy a session should use
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StrategyPreference {
    /// Push when the source supports screencast, poll otherwise
    #[default]
    Auto,
    Push,
    Poll,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct StreamSettings {
    /// JPEG quality (1-100)
    #[serde(default = "default_quality")]
    pub quality: u8,

    /// Capture scale factor in (0, 1]
    #[serde(default = "default_scale")]
    pub scale: f64,

    /// Requested frames per second
    #[serde(default = "default_target_fps")]
    pub target_fps: u32,

    #[serde(default)]
    pub strategy: StrategyPreference,

    /// Hard timeout for a single poll capture
    #[serde(default = "default_capture_timeout_ms")]
    pub capture_timeout_ms: u64,

    /// Consecutive poll failures before the circuit breaker trips
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,

    /// Breaker cooldown, in multiples of the current frame interval
    #[serde(default = "default_failure_backoff_multiplier")]
    pub failure_backoff_multiplier: u32,

    /// Timeout for acknowledging a pushed frame
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,

    /// Consecutive acknowledgment failures before escalating to error level
    #[serde(default = "default_ack_failure_threshold")]
    pub ack_failure_threshold: u32,

    /// How often the push strategy checks whether the source changed
    #[serde(default = "default_identity_check_interval_ms")]
    pub identity_check_interval_ms: u64,

    /// Poll delay while the connection is not ready
    #[serde(default = "default_not_ready_retry_ms")]
    pub not_ready_retry_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ConnectionConfig {
    /// Base address of the remote consumer; the session id is appended
    #[serde(default = "default_connection_address")]
    pub address: String,

    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    /// Outbound messages buffered ahead of the writer task
    #[serde(default = "default_send_queue_capacity")]
    pub send_queue_capacity: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct CollectorConfig {
    /// Timing records retained for aggregation
    #[serde(default = "default_collector_capacity")]
    pub capacity: usize,

    /// Frames between summary log lines (0 disables)
    #[serde(default = "default_log_interval")]
    pub log_interval: u64,

    /// Frames between stats messages sent to the consumer (0 disables)
    #[serde(default = "default_stats_interval")]
    pub stats_interval: u64,
}

impl StreamSettings {
    pub fn capture_timeout(&self) -> Duration {
        Duration::from_millis(self.capture_timeout_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn identity_check_interval(&self) -> Duration {
        Duration::from_millis(self.identity_check_interval_ms)
    }

    pub fn not_ready_retry(&self) -> Duration {
        Duration::from_millis(self.not_ready_retry_ms)
    }
}

impl ConnectionConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// Address used for one session's connection
    pub fn session_address(&self, session_id: &str) -> String {
        format!("{}/{}", self.address.trim_end_matches('/'), session_id)
    }
}

impl PagecastConfig {
    /// Load configuration from default sources (file + environment variables)
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_file("pagecast.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_str = path.as_ref().to_string_lossy();
        debug!("Loading configuration from: {}", path_str);

        let settings = Config::builder()
            .set_default("stream.quality", default_quality() as i64)?
            .set_default("stream.scale", default_scale())?
            .set_default("stream.target_fps", default_target_fps() as i64)?
            .set_default("stream.strategy", "auto")?
            .set_default("stream.capture_timeout_ms", default_capture_timeout_ms())?
            .set_default(
                "stream.max_consecutive_failures",
                default_max_consecutive_failures() as i64,
            )?
            .set_default(
                "stream.failure_backoff_multiplier",
                default_failure_backoff_multiplier() as i64,
            )?
            .set_default("stream.ack_timeout_ms", default_ack_timeout_ms())?
            .set_default(
                "stream.ack_failure_threshold",
                default_ack_failure_threshold() as i64,
            )?
            .set_default(
                "stream.identity_check_interval_ms",
                default_identity_check_interval_ms(),
            )?
            .set_default("stream.not_ready_retry_ms", default_not_ready_retry_ms())?
            .set_default("connection.address", default_connection_address())?
            .set_default("connection.reconnect_delay_ms", default_reconnect_delay_ms())?
            .set_default(
                "connection.send_queue_capacity",
                default_send_queue_capacity() as i64,
            )?
            .set_default("collector.capacity", default_collector_capacity() as i64)?
            .set_default("collector.log_interval", default_log_interval())?
            .set_default("collector.stats_interval", default_stats_interval())?
            .add_source(File::with_name(&path_str).required(false))
            .add_source(
                Environment::with_prefix("PAGECAST")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: PagecastConfig = settings.try_deserialize()?;

        info!("Configuration loaded successfully");
        debug!("Final configuration: {:#?}", config);

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        ControllerConfig::resolve(self.stream.target_fps, &self.controller)
            .map_err(|e| ConfigError::Message(e.to_string()))?;

        if self.stream.quality == 0 || self.stream.quality > 100 {
            return Err(ConfigError::Message(
                "Stream quality must be between 1 and 100".to_string(),
            ));
        }

        if !(self.stream.scale > 0.0 && self.stream.scale <= 1.0) {
            return Err(ConfigError::Message(
                "Stream scale must be in (0, 1]".to_string(),
            ));
        }

        if self.stream.target_fps == 0 {
            return Err(ConfigError::Message(
                "Stream target_fps must be greater than 0".to_string(),
            ));
        }

        if self.stream.capture_timeout_ms == 0 || self.stream.ack_timeout_ms == 0 {
            return Err(ConfigError::Message(
                "Capture and acknowledgment timeouts must be greater than 0".to_string(),
            ));
        }

        if self.stream.identity_check_interval_ms == 0 || self.stream.not_ready_retry_ms == 0 {
            return Err(ConfigError::Message(
                "Identity check and not-ready retry intervals must be greater than 0".to_string(),
            ));
        }

        if self.stream.max_consecutive_failures == 0 {
            return Err(ConfigError::Message(
                "Stream max_consecutive_failures must be greater than 0".to_string(),
            ));
        }

        if self.connection.address.trim().is_empty() {
            return Err(ConfigError::Message(
                "Connection address must not be empty".to_string(),
            ));
        }

        if self.connection.send_queue_capacity == 0 {
            return Err(ConfigError::Message(
                "Connection send_queue_capacity must be greater than 0".to_string(),
            ));
        }

        if self.collector.capacity == 0 {
            return Err(ConfigError::Message(
                "Collector capacity must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            quality: default_quality(),
            scale: default_scale(),
            target_fps: default_target_fps(),
            strategy: StrategyPreference::Auto,
            capture_timeout_ms: default_capture_timeout_ms(),
            max_consecutive_failures: default_max_consecutive_failures(),
            failure_backoff_multiplier: default_failure_backoff_multiplier(),
            ack_timeout_ms: default_ack_timeout_ms(),
            ack_failure_threshold: default_ack_failure_threshold(),
            identity_check_interval_ms: default_identity_check_interval_ms(),
            not_ready_retry_ms: default_not_ready_retry_ms(),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            address: default_connection_address(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            send_queue_capacity: default_send_queue_capacity(),
        }
    }
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            capacity: default_collector_capacity(),
            log_interval: default_log_interval(),
            stats_interval: default_stats_interval(),
        }
    }
}

// Default value functions
fn default_quality() -> u8 {
    80
}
fn default_scale() -> f64 {
    1.0
}
fn default_target_fps() -> u32 {
    15
}
fn default_capture_timeout_ms() -> u64 {
    2000
}
fn default_max_consecutive_failures() -> u32 {
    5
}
fn default_failure_backoff_multiplier() -> u32 {
    5
}
fn default_ack_timeout_ms() -> u64 {
    1000
}
fn default_ack_failure_threshold() -> u32 {
    3
}
fn default_identity_check_interval_ms() -> u64 {
    500
}
fn default_not_ready_retry_ms() -> u64 {
    100
}

fn default_connection_address() -> String {
    "ws://127.0.0.1:9300/stream".to_string()
}
fn default_reconnect_delay_ms() -> u64 {
    1000
}
fn default_send_queue_capacity() -> usize {
    8
}

fn default_collector_capacity() -> usize {
    120
}
fn default_log_interval() -> u64 {
    100
}
fn default_stats_interval() -> u64 {
    30
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = PagecastConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.stream.target_fps, 15);
        assert_eq!(config.collector.capacity, 120);
    }

    #[test]
    fn test_config_validation() {
        let mut config = PagecastConfig::default();

        config.stream.quality = 0;
        assert!(config.validate().is_err());
        config.stream.quality = 70;

        config.controller.min_fps = Some(20.0);
        config.controller.max_fps = Some(10.0);
        assert!(config.validate().is_err());

        config.controller = ControllerOverrides::default();
        config.stream.scale = 1.5;
        assert!(config.validate().is_err());

        config.stream.scale = 0.5;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file_merges_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[controller]\nmax_fps = 24.0\n\n[stream]\nquality = 60\nstrategy = \"poll\"\n\n[connection]\naddress = \"ws://example.test/frames\""
        )
        .unwrap();

        let config = PagecastConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.controller.max_fps, Some(24.0));
        assert_eq!(config.controller.min_fps, None);
        assert_eq!(config.stream.quality, 60);
        assert_eq!(config.stream.strategy, StrategyPreference::Poll);
        assert_eq!(config.stream.target_fps, 15);
        assert_eq!(config.connection.address, "ws://example.test/frames");
        assert_eq!(config.connection.reconnect_delay_ms, 1000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_session_address() {
        let config = ConnectionConfig {
            address: "ws://localhost:9300/stream/".to_string(),
            ..ConnectionConfig::default()
        };
        assert_eq!(
            config.session_address("abc"),
            "ws://localhost:9300/stream/abc"
        );
    }
}
