use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::GatewayError;

pub const DEFAULT_METHOD: &str = "PUT";
pub const DEFAULT_PAYLOAD: &str = "{% if rising_edge %}1{% else %}0{% endif %}";

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct HttpConfig {
    pub unix_socket: Option<String>,
    pub host: Option<String>,
    pub path: String,
    pub timeout: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct HardwareConfig {
    pub sysfs_root: PathBuf,
    pub dev_root: PathBuf,
    pub i2c_bus: u32,
    pub consumer: String,
    pub fake_tick_ms: Option<u64>,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            sysfs_root: PathBuf::from("/sys/class/gpio"),
            dev_root: PathBuf::from("/dev"),
            i2c_bus: 1,
            consumer: env!("CARGO_PKG_NAME").to_string(),
            fake_tick_ms: Some(2000),
        }
    }
}

impl HardwareConfig {
    pub fn fake_tick(&self) -> Option<Duration> {
        self.fake_tick_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default)]
pub struct InputConfig {
    pub pin: String,
    pub hidden: bool,
    pub invert: bool,
    pub on_rising: String,
    pub on_falling: String,
    pub method: Option<String>,
    pub payload: Option<String>,
    pub debounce: Option<String>,
}

impl InputConfig {
    pub fn wants_trigger(&self) -> bool {
        !self.on_rising.is_empty() || !self.on_falling.is_empty()
    }

    pub fn method(&self) -> &str {
        match self.method.as_deref() {
            Some(m) if !m.is_empty() => m,
            _ => DEFAULT_METHOD,
        }
    }

    pub fn payload(&self) -> &str {
        match self.payload.as_deref() {
            Some(p) if !p.is_empty() => p,
            _ => DEFAULT_PAYLOAD,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default)]
pub struct OutputConfig {
    pub pin: String,
    pub hidden: bool,
    pub invert: bool,
    pub pulse: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GatewayConfig {
    pub http: HttpConfig,
    #[serde(default)]
    pub hardware: HardwareConfig,
    #[serde(default)]
    pub inputs: BTreeMap<String, InputConfig>,
    #[serde(default)]
    pub outputs: BTreeMap<String, OutputConfig>,
}

impl GatewayConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, GatewayError> {
        let contents = fs::read_to_string(&path)
            .map_err(|e| GatewayError::Config(format!("Failed to read config: {e}")))?;
        Self::from_json(&contents)
    }

    pub fn from_json(contents: &str) -> Result<Self, GatewayError> {
        let config: Self = serde_json::from_str(contents)
            .map_err(|e| GatewayError::Config(format!("Invalid config json: {e}")))?;
        if config.http.unix_socket.is_none() && config.http.host.is_none() {
            return Err(GatewayError::Config(
                "either 'unix_socket' or 'host' must be specified".into(),
            ));
        }
        Ok(config)
    }
}

pub fn parse_duration(text: &str) -> Result<Duration, GatewayError> {
    humantime::parse_duration(text.trim())
        .map_err(|e| GatewayError::InvalidDuration(format!("{text:?}: {e}")))
}
