use rumqttc::{LastWill, MqttOptions, QoS};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::ConfigError;

const DEFAULT_PORT: u16 = 1883;

/// Body of the last-will message the broker publishes if we vanish uncleanly.
pub const OFFLINE_PAYLOAD: &str = r#"{"status":"system offline"}"#;

/// `[broker]` section of the gateway configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// `host` or `host:port`
    pub url: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Prepended to every outbound topic on the wire.
    pub topic_root: String,
    /// Management topic, relative to `topic_root`.
    pub status_topic: String,
    /// Subscription filter for inbound commands. Defaults to
    /// `<topic_root>/<client_id>/manage/+`.
    pub command_topic: Option<String>,
    pub qos: u8,
    pub retain: bool,
    pub keep_alive_secs: u64,
    pub reconnect_backoff_secs: u64,
    pub channel_capacity: usize,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            url: format!("localhost:{}", DEFAULT_PORT),
            client_id: "sensor-relay".to_string(),
            username: None,
            password: None,
            topic_root: "home".to_string(),
            status_topic: "manage".to_string(),
            command_topic: None,
            qos: 1,
            retain: true,
            keep_alive_secs: 20,
            reconnect_backoff_secs: 10,
            channel_capacity: 100,
        }
    }
}

impl MqttConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.client_id.trim().is_empty() {
            return Err(ConfigError::Invalid("broker.client_id is empty".into()));
        }
        if self.qos > 2 {
            return Err(ConfigError::Invalid(format!(
                "broker.qos must be 0, 1 or 2, got {}",
                self.qos
            )));
        }
        if self.channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "broker.channel_capacity must be positive".into(),
            ));
        }
        if self.status_topic.trim().is_empty() {
            return Err(ConfigError::Invalid("broker.status_topic is empty".into()));
        }
        self.host_port().map(|_| ())
    }

    pub fn host_port(&self) -> Result<(String, u16), ConfigError> {
        let mut parts = self.url.splitn(2, ':');
        let host = parts.next().unwrap_or_default().trim();
        if host.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "broker.url has no host: {:?}",
                self.url
            )));
        }
        let port = match parts.next() {
            Some(port) => port.trim().parse().map_err(|_| {
                ConfigError::Invalid(format!("broker.url has a bad port: {:?}", self.url))
            })?,
            None => DEFAULT_PORT,
        };
        Ok((host.to_string(), port))
    }

    pub fn qos(&self) -> QoS {
        match self.qos {
            0 => QoS::AtMostOnce,
            2 => QoS::ExactlyOnce,
            _ => QoS::AtLeastOnce,
        }
    }

    pub fn topics(&self) -> TopicScheme {
        TopicScheme {
            root: self.topic_root.trim_end_matches('/').to_string(),
            status: self.status_topic.clone(),
            command: self.command_topic.clone().unwrap_or_else(|| {
                format!(
                    "{}/{}/manage/+",
                    self.topic_root.trim_end_matches('/'),
                    self.client_id
                )
            }),
        }
    }

    /// Client options including credentials and the offline last will.
    pub fn to_options(&self) -> Result<MqttOptions, ConfigError> {
        let (host, port) = self.host_port()?;
        let mut options = MqttOptions::new(self.client_id.clone(), host, port);
        options
            .set_keep_alive(Duration::from_secs(self.keep_alive_secs.max(5)))
            .set_clean_session(true)
            .set_last_will(LastWill::new(
                self.topics().wire(&self.status_topic),
                OFFLINE_PAYLOAD,
                self.qos(),
                self.retain,
            ));
        if let Some(username) = &self.username {
            options.set_credentials(
                username.clone(),
                self.password.clone().unwrap_or_default(),
            );
        }
        Ok(options)
    }
}

/// Maps root-relative topics onto the broker namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicScheme {
    root: String,
    status: String,
    command: String,
}

impl TopicScheme {
    pub fn new(root: &str, status: &str, command: &str) -> Self {
        Self {
            root: root.trim_end_matches('/').to_string(),
            status: status.to_string(),
            command: command.to_string(),
        }
    }

    pub fn wire(&self, topic: &str) -> String {
        if self.root.is_empty() {
            topic.to_string()
        } else {
            format!("{}/{}", self.root, topic)
        }
    }

    /// Root-relative management topic.
    pub fn status(&self) -> &str {
        &self.status
    }

    /// Absolute subscription filter.
    pub fn command(&self) -> &str {
        &self.command
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_without_port_uses_default() {
        let config = MqttConfig {
            url: "broker.lan".into(),
            ..Default::default()
        };
        assert_eq!(config.host_port().unwrap(), ("broker.lan".to_string(), 1883));
    }

    #[test]
    fn bad_port_is_rejected() {
        let config = MqttConfig {
            url: "broker.lan:eighty".into(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn command_topic_defaults_under_client_id() {
        let config = MqttConfig {
            client_id: "pi-garage".into(),
            topic_root: "mqtthome".into(),
            ..Default::default()
        };
        let topics = config.topics();
        assert_eq!(topics.command(), "mqtthome/pi-garage/manage/+");
        assert_eq!(topics.wire("manage"), "mqtthome/manage");
    }

    #[test]
    fn empty_root_leaves_topic_untouched() {
        let topics = TopicScheme::new("", "manage", "manage/+");
        assert_eq!(topics.wire("a/b/c"), "a/b/c");
    }
}
