use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use thiserror::Error;
use tracing::{error, info, warn};

use super::message::{unix_now, Reading};
use crate::context::{ControlFlags, GatewayContext};

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Unknown command: {0}")]
    Unknown(String),

    #[error("Could not back up {}: {source}", .path.display())]
    Backup {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Could not write new configuration {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Kill,
    Update,
    Reboot,
    Read,
}

impl FromStr for Command {
    type Err = CommandError;

    fn from_str(key: &str) -> Result<Self, Self::Err> {
        match key {
            "kill" => Ok(Command::Kill),
            "update" => Ok(Command::Update),
            "reboot" => Ok(Command::Reboot),
            "read" => Ok(Command::Read),
            other => Err(CommandError::Unknown(other.to_string())),
        }
    }
}

impl Command {
    /// Command named by the last `/` segment of an inbound topic.
    pub fn from_topic(topic: &str) -> Result<Self, CommandError> {
        topic.rsplit('/').next().unwrap_or(topic).parse()
    }

    fn acknowledgement(self) -> &'static str {
        match self {
            Command::Kill => "kill requested",
            Command::Update => "update",
            Command::Reboot => "reboot requested",
            Command::Read => "read requested",
        }
    }
}

/// Interprets inbound management messages.
pub struct CommandChannel {
    flags: Arc<ControlFlags>,
    config_path: PathBuf,
    status_topic: String,
}

impl CommandChannel {
    pub fn new(context: &GatewayContext, status_topic: impl Into<String>) -> Self {
        Self {
            flags: context.flags.clone(),
            config_path: context.config_path.clone(),
            status_topic: status_topic.into(),
        }
    }

    /// Applies the command selected by `topic` and returns its
    /// acknowledgement. Unknown commands and failed updates yield nothing.
    pub async fn handle(&self, topic: &str, payload: &[u8]) -> Option<Reading> {
        let command = match Command::from_topic(topic) {
            Ok(command) => command,
            Err(e) => {
                warn!("Ignoring message on {}: {}", topic, e);
                return None;
            }
        };
        info!("Received {:?} command", command);

        match command {
            Command::Kill => self.flags.request_kill(),
            Command::Reboot => self.flags.request_reboot(),
            Command::Read => self.flags.request_read(),
            Command::Update => {
                if let Err(e) = replace_config(&self.config_path, payload).await {
                    error!("Configuration update failed: {}", e);
                    return None;
                }
                self.flags.request_reboot();
            }
        }

        Some(Reading::status(
            self.status_topic.clone(),
            unix_now(),
            "system",
            command.acknowledgement(),
        ))
    }
}

fn backup_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".bak");
    PathBuf::from(name)
}

/// Moves the current configuration aside as `<name>.bak` and writes
/// `contents` in its place.
async fn replace_config(path: &Path, contents: &[u8]) -> Result<(), CommandError> {
    let backup = backup_path(path);
    tokio::fs::rename(path, &backup)
        .await
        .map_err(|source| CommandError::Backup {
            path: path.to_path_buf(),
            source,
        })?;
    tokio::fs::write(path, contents)
        .await
        .map_err(|source| CommandError::Write {
            path: path.to_path_buf(),
            source,
        })?;
    info!(
        "Wrote new configuration to {}, previous kept at {}",
        path.display(),
        backup.display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel_for(path: PathBuf) -> (CommandChannel, Arc<ControlFlags>) {
        let context = GatewayContext::new(path);
        let flags = context.flags.clone();
        (CommandChannel::new(&context, "manage"), flags)
    }

    #[tokio::test]
    async fn kill_sets_flag_and_acknowledges_once() {
        let (channel, flags) = channel_for(PathBuf::from("/nonexistent/relay.toml"));
        let ack = channel
            .handle("home/pi/manage/kill", b"")
            .await
            .expect("kill is acknowledged");
        assert!(flags.kill_requested());
        assert!(!flags.reboot_requested());
        assert_eq!(ack.topic(), "manage");
        let body: serde_json::Value = serde_json::from_str(ack.payload()).unwrap();
        assert_eq!(body["system"], "kill requested");
        assert!(body["timestamp"].is_i64());
    }

    #[tokio::test]
    async fn unknown_command_is_ignored() {
        let (channel, flags) = channel_for(PathBuf::from("/nonexistent/relay.toml"));
        assert!(channel.handle("home/pi/manage/dance", b"").await.is_none());
        assert!(!flags.kill_requested());
        assert!(!flags.take_read_request());
    }

    #[tokio::test]
    async fn read_requests_one_forced_pass() {
        let (channel, flags) = channel_for(PathBuf::from("/nonexistent/relay.toml"));
        channel.handle("read", b"").await.unwrap();
        assert!(flags.take_read_request());
    }

    #[tokio::test]
    async fn update_backs_up_and_replaces_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.toml");
        tokio::fs::write(&path, "old = true\n").await.unwrap();
        let (channel, flags) = channel_for(path.clone());

        let ack = channel
            .handle("home/pi/manage/update", b"new = true\n")
            .await
            .unwrap();

        assert!(ack.payload().contains(r#""system":"update""#));
        assert!(flags.reboot_requested());
        assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), "new = true\n");
        assert_eq!(
            tokio::fs::read_to_string(dir.path().join("relay.toml.bak"))
                .await
                .unwrap(),
            "old = true\n"
        );
    }

    #[tokio::test]
    async fn update_without_existing_config_is_not_acknowledged() {
        let dir = tempfile::tempdir().unwrap();
        let (channel, flags) = channel_for(dir.path().join("missing.toml"));
        assert!(channel.handle("manage/update", b"x").await.is_none());
        assert!(!flags.reboot_requested());
    }
}
