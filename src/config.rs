//! Gateway configuration, loaded once at startup from a TOML file.
//!
//! ```toml
//! [broker]
//! url = "mqtt.lan:1883"
//! client_id = "pi-garage"
//! topic_root = "mqtthome"
//!
//! [queue]
//! path = "/var/tmp/sensor-relay/queue"
//!
//! [[sensor]]
//! id = "raven"
//! location = "house"
//! topic = "demand"
//! interval_secs = 1
//! kind = "energy_monitor"
//! device = "/dev/ttyUSB0"
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, Level};

use crate::mqtt::config::MqttConfig;
use crate::sensor::thermistor::ThermistorModel;

pub const CONFIG_FILE_NAME: &str = "sensor-relay.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Cannot parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub broker: MqttConfig,
    pub queue: QueueConfig,
    pub logging: LoggingConfig,
    pub scheduler: SchedulerConfig,
    #[serde(rename = "sensor")]
    pub sensors: Vec<SensorConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub path: PathBuf,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/tmp/sensor-relay/queue"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// Log to this file instead of stdout.
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl LoggingConfig {
    pub fn level(&self) -> Result<Level, ConfigError> {
        Level::from_str(self.level.trim()).map_err(|_| {
            ConfigError::Invalid(format!("unknown logging.level {:?}", self.level))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub tick_millis: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { tick_millis: 1000 }
    }
}

impl SchedulerConfig {
    /// Tick period, never slower than once per second.
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_millis.clamp(50, 1000))
    }
}

/// One `[[sensor]]` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorConfig {
    pub id: String,
    pub location: String,
    pub topic: String,
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
    #[serde(flatten)]
    pub kind: SensorKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SensorKind {
    EnergyMonitor {
        device: String,
        #[serde(default = "default_baud")]
        baud: u32,
        #[serde(default = "default_reopen_secs")]
        reopen_secs: u64,
    },
    Thermistor {
        #[serde(default = "default_i2c_bus")]
        i2c_bus: u8,
        #[serde(default = "default_ads1115_address")]
        i2c_address: u16,
        channel: u8,
        #[serde(default)]
        model: ThermistorModel,
        #[serde(default = "enabled")]
        fahrenheit: bool,
    },
    DoorSwitch {
        pin: u8,
        #[serde(default)]
        continuous: bool,
    },
    OneWire {
        device_path: PathBuf,
        #[serde(default = "enabled")]
        fahrenheit: bool,
    },
    Humidity {
        pin: u8,
        #[serde(default = "enabled")]
        fahrenheit: bool,
    },
}

fn default_interval() -> u64 {
    60
}

fn default_baud() -> u32 {
    115_200
}

fn default_reopen_secs() -> u64 {
    10
}

fn default_i2c_bus() -> u8 {
    1
}

fn default_ads1115_address() -> u16 {
    0x48
}

fn enabled() -> bool {
    true
}

impl GatewayConfig {
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        let config = Self::parse(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        debug!(
            "Loaded {} with {} sensors",
            path.display(),
            config.sensors.len()
        );
        Ok(config)
    }

    pub fn parse(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.broker.validate()?;
        self.logging.level()?;

        let mut ids = HashSet::new();
        for sensor in &self.sensors {
            if !ids.insert(sensor.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate sensor id {:?}",
                    sensor.id
                )));
            }
            check_segment("id", &sensor.id)?;
            check_segment("location", &sensor.location)?;
            for segment in sensor.topic.split('/') {
                check_segment("topic", segment)?;
            }
        }
        Ok(())
    }
}

fn check_segment(field: &str, value: &str) -> Result<(), ConfigError> {
    let bad = value.is_empty()
        || value.contains('/')
        || value.contains(['+', '#'])
        || value.chars().any(char::is_whitespace);
    if bad {
        return Err(ConfigError::Invalid(format!(
            "sensor {} {:?} is not a usable topic segment",
            field, value
        )));
    }
    Ok(())
}

/// Explicit path if given, else `./sensor-relay.toml`, else the per-user
/// config directory.
pub fn resolve_path(explicit: Option<PathBuf>) -> PathBuf {
    if let Some(path) = explicit {
        return path;
    }
    let local = PathBuf::from(CONFIG_FILE_NAME);
    if local.exists() {
        return local;
    }
    dirs::config_dir()
        .map(|dir| dir.join("sensor-relay").join(CONFIG_FILE_NAME))
        .filter(|path| path.exists())
        .unwrap_or(local)
}
