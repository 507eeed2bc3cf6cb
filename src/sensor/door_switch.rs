use rppal::gpio::{Gpio, InputPin, Level};
use tracing::debug;

use super::SensorError;

/// Reed contact on a GPIO input. High means the door is open.
pub struct DoorSwitch {
    pin: InputPin,
    continuous: bool,
    last_level: Option<Level>,
}

impl DoorSwitch {
    pub fn open(gpio: &Gpio, pin: u8, continuous: bool) -> Result<Self, SensorError> {
        Ok(Self {
            pin: gpio.get(pin)?.into_input(),
            continuous,
            last_level: None,
        })
    }

    /// Current state, or `None` when nothing changed and the switch is not
    /// reporting continuously.
    pub fn sample(&mut self) -> Option<&'static str> {
        let level = self.pin.read();
        report(&mut self.last_level, level, self.continuous).map(|state| {
            debug!("Door on GPIO {} is {}", self.pin.pin(), state);
            state
        })
    }
}

fn report(last: &mut Option<Level>, level: Level, continuous: bool) -> Option<&'static str> {
    let changed = *last != Some(level);
    *last = Some(level);
    if changed || continuous {
        Some(door_state(level))
    } else {
        None
    }
}

pub fn door_state(level: Level) -> &'static str {
    match level {
        Level::High => "opened",
        Level::Low => "closed",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_always_reports() {
        let mut last = None;
        assert_eq!(report(&mut last, Level::Low, false), Some("closed"));
    }

    #[test]
    fn unchanged_level_is_quiet_unless_continuous() {
        let mut last = Some(Level::High);
        assert_eq!(report(&mut last, Level::High, false), None);
        assert_eq!(report(&mut last, Level::High, true), Some("opened"));
        assert_eq!(report(&mut last, Level::Low, false), Some("closed"));
    }
}
