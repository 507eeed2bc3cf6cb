use std::thread;
use std::time::{Duration, Instant};

use rppal::gpio::{Gpio, IoPin, Level, Mode};

use super::thermistor::celsius_to_fahrenheit;
use super::SensorError;

const START_LOW: Duration = Duration::from_millis(18);
const START_HIGH: Duration = Duration::from_micros(40);
const EDGE_TIMEOUT: Duration = Duration::from_micros(200);
// A one bit holds the line high ~70us, a zero ~26us.
const ONE_THRESHOLD: Duration = Duration::from_micros(45);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Climate {
    pub humidity: f64,
    pub temperature: f64,
}

/// DHT22 / AM2302 on a single bidirectional GPIO line.
pub struct HumiditySensor {
    pin: IoPin,
    fahrenheit: bool,
}

impl HumiditySensor {
    pub fn open(gpio: &Gpio, pin: u8, fahrenheit: bool) -> Result<Self, SensorError> {
        Ok(Self {
            pin: gpio.get(pin)?.into_io(Mode::Input),
            fahrenheit,
        })
    }

    pub fn measure(&mut self) -> Result<Climate, SensorError> {
        let raw = self.read_raw()?;
        let mut climate = decode_dht22(raw)?;
        if self.fahrenheit {
            climate.temperature = celsius_to_fahrenheit(climate.temperature);
        }
        Ok(climate)
    }

    fn read_raw(&mut self) -> Result<[u8; 5], SensorError> {
        self.pin.set_mode(Mode::Output);
        self.pin.set_low();
        thread::sleep(START_LOW);
        self.pin.set_high();
        spin_for(START_HIGH);
        self.pin.set_mode(Mode::Input);

        // Sensor answers with 80us low, 80us high, then the first bit's low.
        self.wait_for(Level::Low)?;
        self.wait_for(Level::High)?;
        self.wait_for(Level::Low)?;

        let mut bytes = [0u8; 5];
        for bit in 0..40 {
            self.wait_for(Level::High)?;
            let rise = Instant::now();
            self.wait_for(Level::Low)?;
            if rise.elapsed() > ONE_THRESHOLD {
                bytes[bit / 8] |= 1 << (7 - bit % 8);
            }
        }
        Ok(bytes)
    }

    fn wait_for(&self, level: Level) -> Result<(), SensorError> {
        let start = Instant::now();
        while self.pin.read() != level {
            if start.elapsed() > EDGE_TIMEOUT {
                return Err(SensorError::InvalidData(format!(
                    "DHT22 on GPIO {} stopped responding",
                    self.pin.pin()
                )));
            }
        }
        Ok(())
    }
}

fn spin_for(duration: Duration) {
    let start = Instant::now();
    while start.elapsed() < duration {
        std::hint::spin_loop();
    }
}

/// Decodes the 40-bit frame: humidity and temperature in tenths, the
/// temperature's top bit is its sign, last byte is the checksum.
pub fn decode_dht22(raw: [u8; 5]) -> Result<Climate, SensorError> {
    let sum = raw[..4].iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    if sum != raw[4] {
        return Err(SensorError::InvalidData(format!(
            "DHT22 checksum mismatch: {:#04x} != {:#04x}",
            sum, raw[4]
        )));
    }
    let humidity = f64::from(u16::from_be_bytes([raw[0], raw[1]])) / 10.0;
    let magnitude = f64::from(u16::from_be_bytes([raw[2] & 0x7f, raw[3]])) / 10.0;
    let temperature = if raw[2] & 0x80 != 0 {
        -magnitude
    } else {
        magnitude
    };
    Ok(Climate {
        humidity,
        temperature,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_datasheet_example() {
        // 65.2 %RH, 35.1 C
        let climate = decode_dht22([0x02, 0x8c, 0x01, 0x5f, 0xee]).unwrap();
        assert_eq!(climate.humidity, 65.2);
        assert_eq!(climate.temperature, 35.1);
    }

    #[test]
    fn sign_bit_makes_temperature_negative() {
        let climate = decode_dht22([0x02, 0x8c, 0x80, 0x65, 0x73]).unwrap();
        assert_eq!(climate.temperature, -10.1);
    }

    #[test]
    fn bad_checksum_is_rejected() {
        assert!(decode_dht22([0x02, 0x8c, 0x01, 0x5f, 0x00]).is_err());
    }
}
