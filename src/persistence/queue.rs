use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

use crate::mqtt::transport::{Transport, TransportError};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Queue file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Record cannot be stored: {0}")]
    Malformed(String),

    #[error("Drain interrupted after {delivered} records, {remaining} kept: {source}")]
    Interrupted {
        delivered: usize,
        remaining: usize,
        #[source]
        source: TransportError,
    },

    #[error("Delivered {delivered} records but could not empty the queue: {source}")]
    Truncate {
        delivered: usize,
        #[source]
        source: std::io::Error,
    },
}

/// One undelivered message as it sits in the queue file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub topic: String,
    pub payload: String,
}

/// Append-only durable log of messages that could not be sent.
///
/// Every record is two lines, `topic\n` followed by `payload\n`. The file
/// survives restarts; it is only emptied by a complete drain or an explicit
/// [`reset`](Self::reset). A record torn by a crash is cut off on open, so
/// later appends stay aligned. Callers must not enqueue while a drain is running,
/// which the connection manager guarantees by owning the store exclusively.
#[derive(Debug)]
pub struct StoreAndForward {
    path: PathBuf,
}

impl StoreAndForward {
    /// Opens the queue at `path`, creating the parent directory if needed.
    /// Existing records are kept.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        let store = Self { path };
        store.repair().await?;
        let pending = store.len().await?;
        if pending > 0 {
            info!(
                "Queue {} holds {} undelivered records",
                store.path.display(),
                pending
            );
        }
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn enqueue(&self, topic: &str, payload: &str) -> Result<(), StoreError> {
        if topic.is_empty() {
            return Err(StoreError::Malformed("empty topic".into()));
        }
        if topic.contains('\n') || payload.contains('\n') {
            return Err(StoreError::Malformed(format!(
                "newline in record for {}",
                topic
            )));
        }

        let mut record = String::with_capacity(topic.len() + payload.len() + 2);
        record.push_str(topic);
        record.push('\n');
        record.push_str(payload);
        record.push('\n');

        if let Err(e) = self.append(record.as_bytes()).await {
            // A partial append would misalign every later record.
            if let Err(repair) = self.repair().await {
                error!("Could not repair queue {}: {}", self.path.display(), repair);
            }
            return Err(e.into());
        }
        debug!("Queued {}", topic);
        Ok(())
    }

    async fn append(&self, record: &[u8]) -> std::io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(record).await?;
        file.flush().await
    }

    /// Truncates the file to its last complete record.
    async fn repair(&self) -> Result<(), StoreError> {
        let content = match fs::read(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let intact = complete_records_len(&content);
        if intact < content.len() {
            warn!(
                "Queue {} ends in a torn record, dropping {} bytes",
                self.path.display(),
                content.len() - intact
            );
            let file = OpenOptions::new().write(true).open(&self.path).await?;
            file.set_len(intact as u64).await?;
            file.sync_all().await?;
        }
        Ok(())
    }

    /// All records in append order. A trailing half record (topic without
    /// payload) is skipped. Lines split on `\n` only, so payloads come back
    /// byte for byte.
    pub async fn entries(&self) -> Result<Vec<QueueEntry>, StoreError> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut lines = content.split_terminator('\n');
        let mut entries = Vec::new();
        while let Some(topic) = lines.next() {
            match lines.next() {
                Some(payload) => entries.push(QueueEntry {
                    topic: topic.to_string(),
                    payload: payload.to_string(),
                }),
                None => warn!("Skipping incomplete queue record for {}", topic),
            }
        }
        Ok(entries)
    }

    pub async fn len(&self) -> Result<usize, StoreError> {
        Ok(self.entries().await?.len())
    }

    pub async fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len().await? == 0)
    }

    /// Republishes every record in order and truncates the file once all of
    /// them were accepted. On a send failure the undelivered tail replaces
    /// the file contents, so nothing already sent is replayed twice and
    /// nothing unsent is lost.
    pub async fn drain_all<T: Transport>(&self, transport: &mut T) -> Result<usize, StoreError> {
        let entries = self.entries().await?;
        if entries.is_empty() {
            return Ok(0);
        }
        info!("Replaying {} queued records", entries.len());

        for (delivered, entry) in entries.iter().enumerate() {
            if let Err(source) = transport.publish(&entry.topic, &entry.payload).await {
                let remaining = &entries[delivered..];
                if let Err(e) = self.rewrite(remaining).await {
                    error!(
                        "Could not trim queue {}, delivered records will be sent again: {}",
                        self.path.display(),
                        e
                    );
                }
                return Err(StoreError::Interrupted {
                    delivered,
                    remaining: remaining.len(),
                    source,
                });
            }
        }

        fs::write(&self.path, b"")
            .await
            .map_err(|source| StoreError::Truncate {
                delivered: entries.len(),
                source,
            })?;
        Ok(entries.len())
    }

    /// Discards every record.
    pub async fn reset(&self) -> Result<(), StoreError> {
        fs::write(&self.path, b"").await?;
        Ok(())
    }

    /// Replaces the file with `entries`, through a temp file when possible
    /// and in place otherwise.
    async fn rewrite(&self, entries: &[QueueEntry]) -> std::io::Result<()> {
        let mut content = String::new();
        for entry in entries {
            content.push_str(&entry.topic);
            content.push('\n');
            content.push_str(&entry.payload);
            content.push('\n');
        }
        let tmp = self.path.with_extension("tmp");
        let staged = match fs::write(&tmp, &content).await {
            Ok(()) => fs::rename(&tmp, &self.path).await,
            Err(e) => Err(e),
        };
        if let Err(e) = staged {
            warn!("Rewriting {} in place: {}", self.path.display(), e);
            fs::write(&self.path, content).await?;
        }
        Ok(())
    }
}

/// Length of the prefix of `content` made of whole two-line records.
fn complete_records_len(content: &[u8]) -> usize {
    let mut newlines = content
        .iter()
        .enumerate()
        .filter(|(_, b)| **b == b'\n')
        .map(|(i, _)| i);
    let mut intact = 0;
    while let (Some(_), Some(payload_end)) = (newlines.next(), newlines.next()) {
        intact = payload_end + 1;
    }
    intact
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::transport::testing::RecordingTransport;

    async fn store_in(dir: &tempfile::TempDir) -> StoreAndForward {
        StoreAndForward::open(dir.path().join("spool/queue")).await.unwrap()
    }

    #[tokio::test]
    async fn drain_replays_in_append_order_and_empties_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir).await;
        for i in 0..5 {
            store
                .enqueue(&format!("raven/house/demand{}", i), &format!("{{\"n\":{}}}", i))
                .await
                .unwrap();
        }

        let mut transport = RecordingTransport::default();
        assert_eq!(store.drain_all(&mut transport).await.unwrap(), 5);

        let topics = transport.published_topics();
        let expected: Vec<String> = (0..5).map(|i| format!("raven/house/demand{}", i)).collect();
        assert_eq!(topics, expected);
        assert!(store.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn interrupted_drain_keeps_only_undelivered_tail() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir).await;
        for i in 0..4 {
            store.enqueue(&format!("t{}", i), "{}").await.unwrap();
        }

        let mut transport = RecordingTransport::failing_after(2);
        let err = store.drain_all(&mut transport).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::Interrupted {
                delivered: 2,
                remaining: 2,
                ..
            }
        ));

        let left: Vec<String> = store
            .entries()
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.topic)
            .collect();
        assert_eq!(left, vec!["t2".to_string(), "t3".to_string()]);

        transport.heal();
        store.drain_all(&mut transport).await.unwrap();
        assert_eq!(transport.published_topics(), vec!["t0", "t1", "t2", "t3"]);
    }

    #[tokio::test]
    async fn record_survives_byte_for_byte() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir).await;
        let payload = r#"{"timestamp":1700000000,"value":-12.5,"note":"ü <x>"}"#;
        store.enqueue("id/loc/temp", payload).await.unwrap();

        let raw = tokio::fs::read_to_string(store.path()).await.unwrap();
        assert_eq!(raw, format!("id/loc/temp\n{}\n", payload));

        let mut transport = RecordingTransport::default();
        store.drain_all(&mut transport).await.unwrap();
        assert_eq!(
            transport.published(),
            vec![("id/loc/temp".to_string(), payload.to_string())]
        );
    }

    #[tokio::test]
    async fn records_persist_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        store_in(&dir).await.enqueue("a", "1").await.unwrap();
        let reopened = store_in(&dir).await;
        assert_eq!(reopened.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn reset_discards_everything() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir).await;
        store.enqueue("a", "1").await.unwrap();
        store.reset().await.unwrap();
        assert!(store.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn newline_in_payload_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir).await;
        let err = store.enqueue("a", "line\nbreak").await.unwrap_err();
        assert!(matches!(err, StoreError::Malformed(_)));
        assert!(store.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn carriage_return_survives_replay() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir).await;
        store.enqueue("a/b/c", "value\r").await.unwrap();

        let mut transport = RecordingTransport::default();
        store.drain_all(&mut transport).await.unwrap();
        assert_eq!(
            transport.published(),
            vec![("a/b/c".to_string(), "value\r".to_string())]
        );
    }

    #[tokio::test]
    async fn torn_record_is_cut_off_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue");
        tokio::fs::write(&path, "t0\n{\"n\":0}\nt1\n{\"n\"").await.unwrap();

        let store = StoreAndForward::open(&path).await.unwrap();
        store.enqueue("t2", r#"{"n":2}"#).await.unwrap();
        store.enqueue("t3", r#"{"n":3}"#).await.unwrap();

        let entries = store.entries().await.unwrap();
        let pairs: Vec<(&str, &str)> = entries
            .iter()
            .map(|e| (e.topic.as_str(), e.payload.as_str()))
            .collect();
        assert_eq!(
            pairs,
            vec![("t0", r#"{"n":0}"#), ("t2", r#"{"n":2}"#), ("t3", r#"{"n":3}"#)]
        );
    }

    #[tokio::test]
    async fn lone_topic_line_is_cut_off_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue");
        tokio::fs::write(&path, "a\n1\nb\n").await.unwrap();

        let store = StoreAndForward::open(&path).await.unwrap();
        store.enqueue("c", "3").await.unwrap();
        assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), "a\n1\nc\n3\n");
    }

    #[tokio::test]
    async fn interrupted_drain_trims_in_place_when_temp_file_is_blocked() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir).await;
        for i in 0..3 {
            store.enqueue(&format!("t{}", i), "{}").await.unwrap();
        }
        tokio::fs::create_dir(store.path().with_extension("tmp"))
            .await
            .unwrap();

        let mut transport = RecordingTransport::failing_after(1);
        let err = store.drain_all(&mut transport).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::Interrupted {
                delivered: 1,
                remaining: 2,
                ..
            }
        ));
        let left: Vec<String> = store
            .entries()
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.topic)
            .collect();
        assert_eq!(left, vec!["t1".to_string(), "t2".to_string()]);
    }

    #[tokio::test]
    async fn dangling_topic_line_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir).await;
        tokio::fs::write(store.path(), "a\n1\nb\n").await.unwrap();
        let entries = store.entries().await.unwrap();
        assert_eq!(
            entries,
            vec![QueueEntry {
                topic: "a".into(),
                payload: "1".into()
            }]
        );
    }
}
