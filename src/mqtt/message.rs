use serde_json::{json, Value};
use std::fmt;

/// A single outbound message: a sensor sample or a status/acknowledgement.
///
/// `topic` is relative to the configured topic root; the root is applied by
/// the transport at send time so the durable queue stays root-agnostic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reading {
    topic: String,
    payload: String,
    timestamp: i64,
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} - {}: {}", self.timestamp, self.topic, self.payload)
    }
}

impl Reading {
    pub fn new(topic: impl Into<String>, payload: impl Into<String>, timestamp: i64) -> Self {
        Reading {
            topic: topic.into(),
            payload: payload.into(),
            timestamp,
        }
    }

    /// Numeric measurement, `{"timestamp":..,"value":..}` with the value
    /// rounded to three decimals.
    pub fn measurement(topic: impl Into<String>, timestamp: i64, value: f64) -> Self {
        let rounded = (value * 1000.0).round() / 1000.0;
        Self::from_json(topic, timestamp, json!({ "value": rounded }))
    }

    /// Textual state such as a door being `opened` or `closed`.
    pub fn state(topic: impl Into<String>, timestamp: i64, value: &str) -> Self {
        Self::from_json(topic, timestamp, json!({ "value": value }))
    }

    /// Management message carrying a single `key: value` pair next to the
    /// timestamp, e.g. `{"timestamp":..,"system":"kill requested"}`.
    pub fn status(topic: impl Into<String>, timestamp: i64, key: &str, value: &str) -> Self {
        let mut body = serde_json::Map::new();
        body.insert(key.to_string(), Value::String(value.to_string()));
        Self::from_json(topic, timestamp, Value::Object(body))
    }

    fn from_json(topic: impl Into<String>, timestamp: i64, body: Value) -> Self {
        let mut object = serde_json::Map::new();
        object.insert("timestamp".to_string(), Value::from(timestamp));
        if let Value::Object(fields) = body {
            object.extend(fields);
        }
        Reading {
            topic: topic.into(),
            payload: Value::Object(object).to_string(),
            timestamp,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }
}

/// Seconds since the Unix epoch according to the host clock.
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn measurement_payload_carries_timestamp_and_rounded_value() {
        let reading = Reading::measurement("raven/garage/demand", 1_500_000_000, 5000.0004);
        let parsed: Value = serde_json::from_str(reading.payload()).unwrap();
        assert_eq!(parsed["timestamp"], 1_500_000_000);
        assert_eq!(parsed["value"].as_f64(), Some(5000.0));
        assert_eq!(reading.topic(), "raven/garage/demand");
    }

    #[test]
    fn status_payload_is_compact_single_line_json() {
        let reading = Reading::status("manage", 42, "system", "kill requested");
        assert_eq!(
            reading.payload(),
            r#"{"timestamp":42,"system":"kill requested"}"#
        );
        assert!(!reading.payload().contains('\n'));
    }

    #[test]
    fn door_state_is_a_string_value() {
        let reading = Reading::state("door1/garage/door", 7, "opened");
        let parsed: Value = serde_json::from_str(reading.payload()).unwrap();
        assert_eq!(parsed["value"], "opened");
    }
}
