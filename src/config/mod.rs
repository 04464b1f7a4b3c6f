use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::time::Duration;

use crate::error::HubError;

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HeartbeatSettings {
    pub ping_period_ms: u64,
    pub pong_wait_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct UpgraderSettings {
    pub handshake_timeout_ms: u64,
    pub read_buffer_size: usize,
    pub write_buffer_size: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub environment: String,
    pub server: ServerConfig,
    pub heartbeat: HeartbeatSettings,
    pub write_wait_ms: u64,
    pub max_message_size: usize,
    pub upgrader: UpgraderSettings,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = Self::with_defaults(Config::builder())?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            .add_source(Self::environment())
            .build()?;

        s.try_deserialize()
    }

    #[cfg(test)]
    pub fn new_for_test() -> Result<Self, ConfigError> {
        Self::with_defaults(Config::builder())?
            .set_override("environment", "test")?
            .set_override("heartbeat.ping_period_ms", 100)?
            .set_override("heartbeat.pong_wait_ms", 200)?
            .build()?
            .try_deserialize()
    }

    // E.g., `HUB_HEARTBEAT__PING_PERIOD_MS=1000` sets `Settings.heartbeat.ping_period_ms`
    fn environment() -> Environment {
        Environment::with_prefix("hub")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
    }

    fn with_defaults(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError> {
        builder
            .set_default("environment", "development")?
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("heartbeat.ping_period_ms", 54_000)?
            .set_default("heartbeat.pong_wait_ms", 60_000)?
            .set_default("write_wait_ms", 10_000)?
            .set_default("max_message_size", 4 * 1024 * 1024)?
            .set_default("upgrader.handshake_timeout_ms", 30_000)?
            .set_default("upgrader.read_buffer_size", 1024)?
            .set_default("upgrader.write_buffer_size", 1024)
    }

    pub fn engine_config(&self) -> Result<EngineConfig, HubError> {
        let config = EngineConfig {
            write_wait: Duration::from_millis(self.write_wait_ms),
            pong_wait: Duration::from_millis(self.heartbeat.pong_wait_ms),
            ping_period: Duration::from_millis(self.heartbeat.ping_period_ms),
            max_message_size: self.max_message_size,
            upgrader: UpgraderConfig {
                handshake_timeout: Duration::from_millis(self.upgrader.handshake_timeout_ms),
                read_buffer_size: self.upgrader.read_buffer_size,
                write_buffer_size: self.upgrader.write_buffer_size,
            },
        };
        config.validate()?;
        Ok(config)
    }
}

/// Runtime configuration of an [`Engine`](crate::Engine).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Deadline applied to every outgoing frame, renewed per write.
    pub write_wait: Duration,
    /// How long a session may stay silent (no pong) before it is closed.
    /// Zero disables the check. Also unused while the heartbeat is disabled,
    /// since no pings means no pongs.
    pub pong_wait: Duration,
    /// Interval between heartbeat pings. Zero disables the heartbeat.
    pub ping_period: Duration,
    /// Frames larger than this are dropped without dispatch.
    pub max_message_size: usize,
    pub upgrader: UpgraderConfig,
}

#[derive(Debug, Clone)]
pub struct UpgraderConfig {
    pub handshake_timeout: Duration,
    pub read_buffer_size: usize,
    pub write_buffer_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            write_wait: Duration::from_secs(10),
            pong_wait: Duration::from_secs(60),
            ping_period: Duration::from_secs(54),
            max_message_size: 4 * 1024 * 1024,
            upgrader: UpgraderConfig::default(),
        }
    }
}

impl Default for UpgraderConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(30),
            read_buffer_size: 1024,
            write_buffer_size: 1024,
        }
    }
}

impl EngineConfig {
    /// Read deadline measured from the last pong. `None` when pongs are not
    /// expected: either check is disabled or no pings are sent.
    pub(crate) fn read_wait(&self) -> Option<Duration> {
        if self.ping_period.is_zero() || self.pong_wait.is_zero() {
            None
        } else {
            Some(self.pong_wait)
        }
    }

    pub fn validate(&self) -> Result<(), HubError> {
        if self.write_wait.is_zero() {
            return Err(HubError::Config("write_wait must be greater than zero".into()));
        }
        if self.max_message_size == 0 {
            return Err(HubError::Config(
                "max_message_size must be greater than zero".into(),
            ));
        }
        if !self.pong_wait.is_zero()
            && !self.ping_period.is_zero()
            && self.ping_period >= self.pong_wait
        {
            return Err(HubError::Config(format!(
                "ping_period ({:?}) must be shorter than pong_wait ({:?})",
                self.ping_period, self.pong_wait
            )));
        }
        Ok(())
    }
}
