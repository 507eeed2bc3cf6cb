//! Connection manager.
//!
//! A single task owns the connection state, the transport and the durable
//! queue. Everything that can change them arrives as a [`ManagerEvent`] on one
//! channel: readings from the scheduler, lifecycle notifications from the
//! event loop driver and inbound command messages. Because only this task
//! touches the queue, a drain can never interleave with a fresh enqueue.
//!
//! ```text
//!   Disconnected --ConnectAttempt--> Connecting --Connected--> (subscribe,
//!        ^                               |          announce, drain) --> Connected
//!        |                          ConnectFailed                          |
//!        +-------------------------------+---------- ConnectionLost -------+
//! ```

use chrono::Local;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::command::CommandChannel;
use super::config::{TopicScheme, OFFLINE_PAYLOAD};
use super::message::{unix_now, Reading};
use super::transport::Transport;
use crate::persistence::{StoreAndForward, StoreError};

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Snapshot of the link published on a watch channel after every change.
#[derive(Clone, Debug, Default)]
pub struct MqttStatus {
    pub connection_state: ConnectionState,
    pub last_error: Option<String>,
    pub messages_received: usize,
    pub messages_sent: usize,
    pub messages_queued: usize,
    pub last_activity: Option<chrono::DateTime<Local>>,
}

#[derive(Debug)]
pub enum ManagerEvent {
    Publish(Reading),
    ConnectAttempt,
    Connected,
    ConnectFailed(String),
    ConnectionLost(String),
    MessageArrived { topic: String, payload: Vec<u8> },
}

/// Cheap, cloneable entry point for producers. Never blocks and never fails
/// the caller; readings go out directly or land in the queue.
#[derive(Clone, Debug)]
pub struct PublishHandle {
    events: mpsc::UnboundedSender<ManagerEvent>,
}

impl PublishHandle {
    pub fn new(events: mpsc::UnboundedSender<ManagerEvent>) -> Self {
        Self { events }
    }

    pub fn publish(&self, reading: Reading) {
        if let Err(e) = self.events.send(ManagerEvent::Publish(reading)) {
            warn!("Connection manager stopped, dropping {}", e.0.describe());
        }
    }
}

impl ManagerEvent {
    fn describe(&self) -> String {
        match self {
            ManagerEvent::Publish(reading) => reading.to_string(),
            other => format!("{:?}", other),
        }
    }
}

pub struct ConnectionManager<T: Transport> {
    state: ConnectionState,
    transport: T,
    store: StoreAndForward,
    commands: CommandChannel,
    topics: TopicScheme,
    has_connected_before: bool,
    status: MqttStatus,
    status_tx: watch::Sender<MqttStatus>,
}

impl<T: Transport> ConnectionManager<T> {
    pub fn new(
        transport: T,
        store: StoreAndForward,
        commands: CommandChannel,
        topics: TopicScheme,
    ) -> Self {
        let (status_tx, _) = watch::channel(MqttStatus::default());
        Self {
            state: ConnectionState::Disconnected,
            transport,
            store,
            commands,
            topics,
            has_connected_before: false,
            status: MqttStatus::default(),
            status_tx,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn store(&self) -> &StoreAndForward {
        &self.store
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn subscribe_status(&self) -> watch::Receiver<MqttStatus> {
        self.status_tx.subscribe()
    }

    /// Processes events until shutdown is requested or every sender is gone.
    /// Readings still waiting in the channel at shutdown are delivered or
    /// queued before returning.
    pub async fn run(
        &mut self,
        mut events: mpsc::UnboundedReceiver<ManagerEvent>,
        shutdown: CancellationToken,
    ) {
        info!("Connection manager started");
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.handle(event).await,
                    None => break,
                },
            }
        }

        let mut flushed = 0;
        while let Ok(event) = events.try_recv() {
            if let ManagerEvent::Publish(reading) = event {
                self.publish(reading).await;
                flushed += 1;
            }
        }
        if flushed > 0 {
            info!("Flushed {} pending readings", flushed);
        }

        if self.state == ConnectionState::Connected {
            let offline = Reading::new(self.topics.status(), OFFLINE_PAYLOAD, unix_now());
            self.publish(offline).await;
            self.transport.disconnect().await;
        }
        info!("Connection manager stopped");
    }

    pub async fn handle(&mut self, event: ManagerEvent) {
        match event {
            ManagerEvent::Publish(reading) => self.publish(reading).await,
            ManagerEvent::ConnectAttempt => {
                if self.state == ConnectionState::Disconnected {
                    debug!("Connecting to broker");
                    self.set_state(ConnectionState::Connecting);
                }
            }
            ManagerEvent::Connected => self.on_connected().await,
            ManagerEvent::ConnectFailed(reason) => {
                warn!("Broker connect failed: {}", reason);
                self.status.last_error = Some(reason);
                self.set_state(ConnectionState::Disconnected);
            }
            ManagerEvent::ConnectionLost(reason) => self.on_connection_lost(reason).await,
            ManagerEvent::MessageArrived { topic, payload } => {
                self.status.messages_received += 1;
                self.status.last_activity = Some(Local::now());
                if let Some(ack) = self.commands.handle(&topic, &payload).await {
                    self.publish(ack).await;
                }
            }
        }
    }

    /// Sends directly while connected; otherwise appends to the queue.
    pub async fn publish(&mut self, reading: Reading) {
        if self.state != ConnectionState::Connected {
            self.enqueue(&reading).await;
            return;
        }

        match self
            .transport
            .publish(reading.topic(), reading.payload())
            .await
        {
            Ok(()) => self.record_sent(1),
            Err(e) => {
                warn!("Publish to {} failed: {}", reading.topic(), e);
                self.go_offline(true, Some(reading), e.to_string()).await;
                self.transport.request_reconnect();
            }
        }
    }

    async fn on_connected(&mut self) {
        info!("Connected to broker");
        self.set_state(ConnectionState::Connecting);

        if let Err(e) = self.transport.subscribe(self.topics.command()).await {
            warn!("Subscribing to {} failed: {}", self.topics.command(), e);
            self.go_offline(false, None, e.to_string()).await;
            self.transport.request_reconnect();
            return;
        }

        let announce = Reading::status(self.topics.status(), unix_now(), "status", "connected");
        if let Err(e) = self
            .transport
            .publish(announce.topic(), announce.payload())
            .await
        {
            warn!("Announcing connection failed: {}", e);
            self.go_offline(false, None, e.to_string()).await;
            self.transport.request_reconnect();
            return;
        }
        self.record_sent(1);

        match self.store.drain_all(&mut self.transport).await {
            Ok(0) => {}
            Ok(replayed) => {
                info!("Replayed {} queued messages", replayed);
                self.record_sent(replayed);
            }
            Err(StoreError::Interrupted {
                delivered,
                remaining,
                source,
            }) => {
                warn!(
                    "Replay stopped after {} messages, {} left queued: {}",
                    delivered, remaining, source
                );
                self.record_sent(delivered);
                self.go_offline(false, None, source.to_string()).await;
                self.transport.request_reconnect();
                return;
            }
            Err(StoreError::Truncate { delivered, source }) => {
                error!(
                    "Replayed {} messages but could not empty {}, they will be sent again: {}",
                    delivered,
                    self.store.path().display(),
                    source
                );
                self.record_sent(delivered);
            }
            Err(e) => {
                // Unreadable queue: stay online rather than stall live data.
                error!("Could not replay queue {}: {}", self.store.path().display(), e);
            }
        }

        self.set_state(ConnectionState::Connected);
        if self.has_connected_before {
            let back = Reading::status(
                self.topics.status(),
                unix_now(),
                "connection",
                "reconnected",
            );
            self.publish(back).await;
        }
        self.has_connected_before = true;
    }

    async fn on_connection_lost(&mut self, reason: String) {
        if self.state == ConnectionState::Connected {
            warn!("Connection to broker lost: {}", reason);
            self.go_offline(true, None, reason).await;
        } else {
            debug!("Connection loss while {:?}: {}", self.state, reason);
            self.status.last_error = Some(reason);
            self.set_state(ConnectionState::Disconnected);
        }
    }

    /// Leaves the connected state. With `fresh_queue` the queue is restarted
    /// empty before `pending` and the loss notice are written to it.
    async fn go_offline(&mut self, fresh_queue: bool, pending: Option<Reading>, reason: String) {
        self.status.last_error = Some(reason);
        self.set_state(ConnectionState::Disconnected);

        if fresh_queue {
            if let Err(e) = self.store.reset().await {
                error!("Could not reset queue {}: {}", self.store.path().display(), e);
            }
        }
        if let Some(reading) = pending {
            self.enqueue(&reading).await;
        }
        let lost = Reading::status(self.topics.status(), unix_now(), "connection", "lost");
        self.enqueue(&lost).await;
    }

    async fn enqueue(&mut self, reading: &Reading) {
        match self.store.enqueue(reading.topic(), reading.payload()).await {
            Ok(()) => {
                self.status.messages_queued += 1;
                self.status_tx.send_replace(self.status.clone());
            }
            Err(e) => error!("Dropping {}: {}", reading, e),
        }
    }

    fn record_sent(&mut self, count: usize) {
        self.status.messages_sent += count;
        self.status.last_activity = Some(Local::now());
        self.status_tx.send_replace(self.status.clone());
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!("Connection state {:?} -> {:?}", self.state, state);
        }
        self.state = state;
        self.status.connection_state = state;
        self.status_tx.send_replace(self.status.clone());
    }
}
