use std::thread;
use std::time::Duration;

use rppal::i2c::I2c;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::SensorError;

/// ADS1115 full-scale ±4.096 V over 15 bits.
const VOLTS_PER_LSB: f64 = 125e-6;

const REG_CONVERSION: u8 = 0x00;
const REG_CONFIG: u8 = 0x01;
const CONVERSION_WAIT: Duration = Duration::from_millis(9);

/// Divider and Steinhart-Hart parameters of one thermistor circuit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThermistorModel {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub bias_ohms: f64,
    pub supply_volts: f64,
}

impl Default for ThermistorModel {
    fn default() -> Self {
        Self {
            a: 1.413e-3,
            b: 2.385e-4,
            c: 9.588e-8,
            bias_ohms: 10_000.0,
            supply_volts: 3.3,
        }
    }
}

impl ThermistorModel {
    /// Thermistor resistance from the divider voltage.
    pub fn resistance(&self, volts: f64) -> Result<f64, SensorError> {
        if volts <= 0.0 || volts >= self.supply_volts {
            return Err(SensorError::InvalidData(format!(
                "divider voltage {:.4} V out of range",
                volts
            )));
        }
        Ok(self.supply_volts * self.bias_ohms / volts - self.bias_ohms)
    }

    /// Temperature in Celsius for a resistance in ohms.
    pub fn steinhart_hart(&self, ohms: f64) -> f64 {
        let ln_r = ohms.ln();
        let kelvin = 1.0 / (self.a + self.b * ln_r + self.c * ln_r.powi(3));
        kelvin - 273.15
    }
}

/// NTC thermistor in a divider, read through one ADS1115 input.
pub struct Thermistor {
    bus: I2c,
    channel: u8,
    model: ThermistorModel,
    fahrenheit: bool,
}

impl Thermistor {
    pub fn open(
        bus: u8,
        address: u16,
        channel: u8,
        model: ThermistorModel,
        fahrenheit: bool,
    ) -> Result<Self, SensorError> {
        if channel > 3 {
            return Err(SensorError::InvalidData(format!(
                "ADS1115 has no input {}",
                channel
            )));
        }
        let mut i2c = I2c::with_bus(bus)?;
        i2c.set_slave_address(address)?;
        Ok(Self {
            bus: i2c,
            channel,
            model,
            fahrenheit,
        })
    }

    pub fn temperature(&mut self) -> Result<f64, SensorError> {
        let volts = self.read_volts()?;
        let ohms = self.model.resistance(volts)?;
        let celsius = self.model.steinhart_hart(ohms);
        debug!(
            "Thermistor input {}: {:.4} V, {:.1} ohm, {:.2} C",
            self.channel, volts, ohms, celsius
        );
        Ok(if self.fahrenheit {
            celsius_to_fahrenheit(celsius)
        } else {
            celsius
        })
    }

    /// Single-shot conversion at 128 SPS.
    fn read_volts(&mut self) -> Result<f64, SensorError> {
        let mux = 0x4000 | (u16::from(self.channel) << 12);
        let config: u16 = 0x8000 | mux | 0x0200 | 0x0100 | 0x0080 | 0x0003;
        let [hi, lo] = config.to_be_bytes();
        self.bus.write(&[REG_CONFIG, hi, lo])?;
        thread::sleep(CONVERSION_WAIT);

        self.bus.write(&[REG_CONVERSION])?;
        let mut raw = [0u8; 2];
        self.bus.read(&mut raw)?;
        Ok(f64::from(i16::from_be_bytes(raw)) * VOLTS_PER_LSB)
    }
}

pub fn celsius_to_fahrenheit(celsius: f64) -> f64 {
    celsius * 9.0 / 5.0 + 32.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_reference_points() {
        let model = ThermistorModel::default();
        assert!((model.steinhart_hart(3_000.0) - 23.434).abs() < 0.01);
        assert!((model.steinhart_hart(10_000.0) + 1.749).abs() < 0.01);
    }

    #[test]
    fn higher_resistance_is_colder() {
        let model = ThermistorModel::default();
        assert!(model.steinhart_hart(30_000.0) < model.steinhart_hart(10_000.0));
    }

    #[test]
    fn half_supply_means_equal_resistors() {
        let ohms = ThermistorModel::default().resistance(1.65).unwrap();
        assert!((ohms - 10_000.0).abs() < 1e-6);
    }

    #[test]
    fn rail_voltages_are_rejected() {
        let model = ThermistorModel::default();
        assert!(model.resistance(0.0).is_err());
        assert!(model.resistance(3.3).is_err());
    }

    #[test]
    fn fahrenheit_conversion() {
        assert_eq!(celsius_to_fahrenheit(100.0), 212.0);
        assert_eq!(celsius_to_fahrenheit(-40.0), -40.0);
    }
}
