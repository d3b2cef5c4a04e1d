use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::bus::{NoIntervalStrategy, ReconnectPolicy};
use crate::types::DEFAULT_REQUEST_TIMEOUT;

const DEFAULT_PICTURE_NAME: &str = "seahut.jpg";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectStrategy {
    Never,
    Immediate,
    Fixed,
    Exponential,
}

impl FromStr for ReconnectStrategy {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "never" => Ok(Self::Never),
            "immediate" => Ok(Self::Immediate),
            "fixed" => Ok(Self::Fixed),
            "exponential" => Ok(Self::Exponential),
            other => Err(format!("unknown reconnect strategy '{other}'")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MeshConfig {
    pub bus_address: String,
    pub request_timeout_secs: u64,
    pub handler_budget_ms: u64,
    pub reconnect_strategy: ReconnectStrategy,
    pub reconnect_interval_ms: u64,
    pub reconnect_max_interval_ms: u64,
    pub reconnect_max_retries: Option<usize>,
    pub picture_folder: PathBuf,
    /// Defaults to `seahut.jpg` inside the picture folder.
    pub default_picture: Option<PathBuf>,
    pub retention_days: u32,
    /// Zero disables the cleanup.
    pub cleanup_interval_secs: u64,
    pub heartbeat_secs: u64,
    /// Zero disables the chat heartbeat.
    pub chat_heartbeat_secs: u64,
    pub sensor_poll_ms: u64,
    pub debug_mode: bool,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            bus_address: "local://seaguard".to_string(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT.as_secs(),
            handler_budget_ms: 5_000,
            reconnect_strategy: ReconnectStrategy::Exponential,
            reconnect_interval_ms: 500,
            reconnect_max_interval_ms: 30_000,
            reconnect_max_retries: None,
            picture_folder: PathBuf::from("pictures"),
            default_picture: None,
            retention_days: 3,
            cleanup_interval_secs: 24 * 60 * 60,
            heartbeat_secs: 60,
            chat_heartbeat_secs: 60 * 60,
            sensor_poll_ms: 200,
            debug_mode: false,
        }
    }
}

fn parsed<T: FromStr>(key: &str) -> Option<T> {
    let raw = env::var(key).ok()?;
    match raw.parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("Ignoring {}={}: not a valid value", key, raw);
            None
        }
    }
}

impl MeshConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(address) = env::var("BUS_ADDRESS") {
            config.bus_address = address;
        }

        if let Some(secs) = parsed("REQUEST_TIMEOUT_SECS") {
            config.request_timeout_secs = secs;
        }

        if let Some(ms) = parsed("HANDLER_BUDGET_MS") {
            config.handler_budget_ms = ms;
        }

        if let Some(strategy) = parsed("RECONNECT_STRATEGY") {
            config.reconnect_strategy = strategy;
        }

        if let Some(ms) = parsed("RECONNECT_INTERVAL_MS") {
            config.reconnect_interval_ms = ms;
        }

        if let Some(ms) = parsed("RECONNECT_MAX_INTERVAL_MS") {
            config.reconnect_max_interval_ms = ms;
        }

        if let Some(retries) = parsed("RECONNECT_MAX_RETRIES") {
            config.reconnect_max_retries = Some(retries);
        }

        if let Ok(folder) = env::var("PICTURE_FOLDER") {
            config.picture_folder = PathBuf::from(folder);
        }

        if let Ok(picture) = env::var("DEFAULT_PICTURE") {
            config.default_picture = Some(PathBuf::from(picture));
        }

        if let Some(days) = parsed("RETENTION_DAYS") {
            config.retention_days = days;
        }

        if let Some(secs) = parsed("CLEANUP_INTERVAL_SECS") {
            config.cleanup_interval_secs = secs;
        }

        if let Some(secs) = parsed("HEARTBEAT_SECS") {
            config.heartbeat_secs = secs;
        }

        if let Some(secs) = parsed("CHAT_HEARTBEAT_SECS") {
            config.chat_heartbeat_secs = secs;
        }

        if let Some(ms) = parsed("SENSOR_POLL_MS") {
            config.sensor_poll_ms = ms;
        }

        if let Ok(debug) = env::var("DEBUG_MODE") {
            config.debug_mode = debug.parse::<bool>().unwrap_or(false);
        }

        config
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn handler_budget(&self) -> Duration {
        Duration::from_millis(self.handler_budget_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    pub fn chat_heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.chat_heartbeat_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn default_picture(&self) -> PathBuf {
        self.default_picture
            .clone()
            .unwrap_or_else(|| self.picture_folder.join(DEFAULT_PICTURE_NAME))
    }

    pub fn sensor_poll_interval(&self) -> Duration {
        Duration::from_millis(self.sensor_poll_ms)
    }

    /// A fresh policy; each bus client needs its own.
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        let interval = Duration::from_millis(self.reconnect_interval_ms);
        let retries = self.reconnect_max_retries;

        match self.reconnect_strategy {
            ReconnectStrategy::Never => ReconnectPolicy::Never,
            ReconnectStrategy::Immediate => {
                ReconnectPolicy::Retry(Box::new(NoIntervalStrategy::new(retries)))
            }
            ReconnectStrategy::Fixed => ReconnectPolicy::fixed(retries, interval),
            ReconnectStrategy::Exponential => ReconnectPolicy::exponential(
                retries,
                interval,
                Duration::from_millis(self.reconnect_max_interval_ms),
            ),
        }
    }
}
