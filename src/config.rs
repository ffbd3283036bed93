use std::{collections::HashSet, fs, path::Path, time::Duration};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::channel::ChannelOptions;
use crate::edge::Level;
use crate::error::AppError;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct HttpConfig {
    pub unix_socket: Option<String>,
    pub host: Option<String>,
    pub path: String,
    pub timeout: u64,
}

#[derive(Debug, Hash, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum GpioCapability {
    Error,
    Disabled,
    PushPull,
    OpenDrain,
    OpenSource,
    Floating,
    PullUp,
    PullDown,
}

#[derive(Debug, Default, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum EdgeDetect {
    #[default]
    None,
    Rising,
    Falling,
    Both,
}

impl EdgeDetect {
    /// Whether a validated change to `level` should be reported.
    pub fn admits(self, level: Level) -> bool {
        match self {
            EdgeDetect::None => false,
            EdgeDetect::Rising => level == Level::High,
            EdgeDetect::Falling => level == Level::Low,
            EdgeDetect::Both => true,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PinConfig {
    pub name: String,
    /// Character device path; unused by the pigpio backend.
    #[serde(default)]
    pub chip: String,
    pub line: u32,
    pub capabilities: HashSet<GpioCapability>,
}

#[derive(Debug, Default, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum BackendConfig {
    #[default]
    Libgpiod,
    Mock,
    Pigpio(PigpioConfig),
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct PigpioConfig {
    #[serde(default = "default_pigpio_host")]
    pub host: String,
    #[serde(default = "default_pigpio_port")]
    pub port: u16,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
}

impl Default for PigpioConfig {
    fn default() -> Self {
        Self {
            host: default_pigpio_host(),
            port: default_pigpio_port(),
            connect_timeout_ms: default_connect_timeout_ms(),
            response_timeout_ms: default_response_timeout_ms(),
        }
    }
}

impl PigpioConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn channel_options(&self) -> ChannelOptions {
        ChannelOptions {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            response_timeout: match self.response_timeout_ms {
                0 => None,
                ms => Some(Duration::from_millis(ms)),
            },
        }
    }
}

fn default_pigpio_host() -> String {
    "127.0.0.1".into()
}

fn default_pigpio_port() -> u16 {
    8888
}

fn default_connect_timeout_ms() -> u64 {
    2000
}

fn default_response_timeout_ms() -> u64 {
    500
}

fn default_broadcast_capacity() -> usize {
    64
}

fn default_event_history_capacity() -> usize {
    32
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AppConfig {
    pub http: HttpConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    pub gpios: FxHashMap<u32, PinConfig>,
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
    #[serde(default = "default_event_history_capacity")]
    pub event_history_capacity: usize,
}

impl AppConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, AppError> {
        let contents = fs::read_to_string(&path)
            .map_err(|e| AppError::Config(format!("Failed to read config: {e}")))?;
        Self::from_json(&contents)
    }

    pub fn from_json(contents: &str) -> Result<Self, AppError> {
        let config: Self = serde_json::from_str(contents)
            .map_err(|e| AppError::Config(format!("Invalid config json: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), AppError> {
        if self.broadcast_capacity == 0 {
            return Err(AppError::Config("broadcast_capacity must be positive".into()));
        }
        if let BackendConfig::Pigpio(_) = &self.backend
            && let Some((id, pin)) = self.gpios.iter().find(|(_, pin)| pin.line > 31)
        {
            return Err(AppError::Config(format!(
                "pin {id} ({}) uses line {}, pigpio notifications cover lines 0-31",
                pin.name, pin.line
            )));
        }
        Ok(())
    }
}
