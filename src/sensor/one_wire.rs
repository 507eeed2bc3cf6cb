use std::path::PathBuf;

use super::thermistor::celsius_to_fahrenheit;
use super::SensorError;

/// DS18B20 exposed by the kernel w1 driver under
/// `/sys/bus/w1/devices/28-*/`.
pub struct OneWireThermometer {
    slave_file: PathBuf,
    fahrenheit: bool,
}

impl OneWireThermometer {
    pub fn new(device_path: PathBuf, fahrenheit: bool) -> Self {
        Self {
            slave_file: device_path.join("w1_slave"),
            fahrenheit,
        }
    }

    /// Blocks for the conversion time of the device (up to ~750 ms).
    pub fn temperature(&self) -> Result<f64, SensorError> {
        let content = std::fs::read_to_string(&self.slave_file)?;
        let celsius = parse_w1_slave(&content)?;
        Ok(if self.fahrenheit {
            celsius_to_fahrenheit(celsius)
        } else {
            celsius
        })
    }
}

/// Parses the two-line driver output, e.g.
///
/// ```text
/// 72 01 4b 46 7f ff 0e 10 57 : crc=57 YES
/// 72 01 4b 46 7f ff 0e 10 57 t=23125
/// ```
pub fn parse_w1_slave(content: &str) -> Result<f64, SensorError> {
    let mut lines = content.lines();
    let status = lines.next().unwrap_or_default();
    if !status.trim_end().ends_with("YES") {
        return Err(SensorError::InvalidData(format!(
            "one-wire CRC check failed: {:?}",
            status
        )));
    }
    let data = lines.next().unwrap_or_default();
    let millis = data
        .rsplit_once("t=")
        .map(|(_, value)| value.trim())
        .ok_or_else(|| SensorError::InvalidData(format!("no temperature in {:?}", data)))?;
    let millis: i32 = millis
        .parse()
        .map_err(|_| SensorError::InvalidData(format!("bad temperature {:?}", millis)))?;
    Ok(f64::from(millis) / 1000.0)
}
