//! # Sensor Sources
//!
//! Every physical sensor the relay knows about is a [`SensorSource`]: a
//! configured identity (id, location, topic suffix, interval) plus one
//! acquisition variant. The scheduler only ever calls
//! [`SensorSource::acquire`], which returns zero or more readings or an error.
//!
//! ```text
//! sensor/
//! ├── energy_monitor.rs  - Serial demand frames, decoded on a reader thread
//! ├── thermistor.rs      - NTC divider through an ADS1115 on I2C
//! ├── door_switch.rs     - Reed contact on a GPIO input
//! ├── one_wire.rs        - DS18B20 via the kernel w1 driver
//! └── humidity.rs        - DHT22 on a bit-banged GPIO line
//! ```
//!
//! Hardware is opened once at startup. Failing to open a bus is fatal; a
//! failed sample is not.

pub mod door_switch;
pub mod energy_monitor;
pub mod humidity;
pub mod one_wire;
pub mod thermistor;

use std::time::Duration;

use rppal::gpio::Gpio;
use thiserror::Error;
use tracing::info;

use crate::config::{SensorConfig, SensorKind};
use crate::mqtt::message::Reading;
use door_switch::DoorSwitch;
use energy_monitor::{EnergyMonitorSource, SerialSettings};
use humidity::HumiditySensor;
use one_wire::OneWireThermometer;
use thermistor::Thermistor;

#[derive(Debug, Error)]
pub enum SensorError {
    #[error("Cannot open {device}: {reason}")]
    Device { device: String, reason: String },

    #[error("Sensor I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("GPIO error: {0}")]
    Gpio(#[from] rppal::gpio::Error),

    #[error("I2C error: {0}")]
    I2c(#[from] rppal::i2c::Error),

    #[error("Invalid reading: {0}")]
    InvalidData(String),

    #[error("Source unavailable: {0}")]
    Unavailable(String),
}

pub enum Acquisition {
    EnergyMonitor(EnergyMonitorSource),
    Thermistor(Thermistor),
    DoorSwitch(DoorSwitch),
    OneWire(OneWireThermometer),
    Humidity(HumiditySensor),
}

impl Acquisition {
    fn name(&self) -> &'static str {
        match self {
            Acquisition::EnergyMonitor(_) => "energy monitor",
            Acquisition::Thermistor(_) => "thermistor",
            Acquisition::DoorSwitch(_) => "door switch",
            Acquisition::OneWire(_) => "one-wire thermometer",
            Acquisition::Humidity(_) => "humidity sensor",
        }
    }
}

pub struct SensorSource {
    id: String,
    topic: String,
    interval_secs: i64,
    acquisition: Acquisition,
}

impl SensorSource {
    pub fn new(config: &SensorConfig, acquisition: Acquisition) -> Self {
        Self {
            id: config.id.clone(),
            topic: format!("{}/{}/{}", config.id, config.location, config.topic),
            interval_secs: config.interval_secs as i64,
            acquisition,
        }
    }

    /// Opens the hardware behind `config`. The GPIO controller is opened
    /// lazily and shared between pins.
    pub fn open(config: &SensorConfig, gpio: &mut Option<Gpio>) -> Result<Self, SensorError> {
        let acquisition = match &config.kind {
            SensorKind::EnergyMonitor {
                device,
                baud,
                reopen_secs,
            } => Acquisition::EnergyMonitor(EnergyMonitorSource::spawn(
                SerialSettings {
                    device: device.clone(),
                    baud_rate: *baud,
                },
                Duration::from_secs(*reopen_secs),
            )?),
            SensorKind::Thermistor {
                i2c_bus,
                i2c_address,
                channel,
                model,
                fahrenheit,
            } => Acquisition::Thermistor(Thermistor::open(
                *i2c_bus,
                *i2c_address,
                *channel,
                *model,
                *fahrenheit,
            )?),
            SensorKind::DoorSwitch { pin, continuous } => {
                Acquisition::DoorSwitch(DoorSwitch::open(shared_gpio(gpio)?, *pin, *continuous)?)
            }
            SensorKind::OneWire {
                device_path,
                fahrenheit,
            } => Acquisition::OneWire(OneWireThermometer::new(device_path.clone(), *fahrenheit)),
            SensorKind::Humidity { pin, fahrenheit } => {
                Acquisition::Humidity(HumiditySensor::open(shared_gpio(gpio)?, *pin, *fahrenheit)?)
            }
        };
        let source = Self::new(config, acquisition);
        info!(
            "Sensor {} ({}) publishes to {} every {}s",
            source.id,
            source.acquisition.name(),
            source.topic,
            source.interval_secs
        );
        Ok(source)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// `<id>/<location>/<topic>`
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn interval_secs(&self) -> i64 {
        self.interval_secs
    }

    /// Takes one sample. `now` stamps readings whose device supplies no time.
    pub fn acquire(&mut self, now: i64) -> Result<Vec<Reading>, SensorError> {
        match &mut self.acquisition {
            Acquisition::EnergyMonitor(monitor) => monitor.drain(&self.topic),
            Acquisition::Thermistor(thermistor) => Ok(vec![Reading::measurement(
                self.topic.clone(),
                now,
                thermistor.temperature()?,
            )]),
            Acquisition::DoorSwitch(switch) => Ok(switch
                .sample()
                .map(|state| Reading::state(self.topic.clone(), now, state))
                .into_iter()
                .collect()),
            Acquisition::OneWire(thermometer) => Ok(vec![Reading::measurement(
                self.topic.clone(),
                now,
                thermometer.temperature()?,
            )]),
            Acquisition::Humidity(sensor) => {
                let climate = sensor.measure()?;
                Ok(vec![
                    Reading::measurement(
                        format!("{}/temperature", self.topic),
                        now,
                        climate.temperature,
                    ),
                    Reading::measurement(format!("{}/humidity", self.topic), now, climate.humidity),
                ])
            }
        }
    }
}

fn shared_gpio(gpio: &mut Option<Gpio>) -> Result<&Gpio, SensorError> {
    if gpio.is_none() {
        *gpio = Some(Gpio::new()?);
    }
    gpio.as_ref()
        .ok_or_else(|| SensorError::Unavailable("GPIO controller".into()))
}
