//! Broker transport seam.
//!
//! The connection manager only ever talks to a [`Transport`]. The production
//! implementation wraps a `rumqttc::AsyncClient`; its event loop is polled by
//! [`drive`], which turns broker activity into [`ManagerEvent`]s so that no
//! library callback touches connection state directly.

use std::future::Future;
use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, Outgoing, Packet, QoS};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::TopicScheme;
use super::connection::ManagerEvent;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Broker client rejected request: {0}")]
    Rejected(String),

    #[error("Send did not complete within {0:?}")]
    Timeout(Duration),

    #[error("Transport closed")]
    Closed,
}

impl From<rumqttc::ClientError> for TransportError {
    fn from(e: rumqttc::ClientError) -> Self {
        TransportError::Rejected(e.to_string())
    }
}

/// Outbound half of a broker connection.
///
/// `publish` takes a topic relative to the configured root; implementations
/// apply the root themselves.
pub trait Transport: Send {
    fn subscribe(
        &mut self,
        filter: &str,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn publish(
        &mut self,
        topic: &str,
        payload: &str,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Ask the underlying client to drop and re-establish the session.
    fn request_reconnect(&mut self) {}

    fn disconnect(&mut self) -> impl Future<Output = ()> + Send;
}

pub struct MqttTransport {
    client: AsyncClient,
    topics: TopicScheme,
    qos: QoS,
    retain: bool,
    send_timeout: Duration,
    pending_disconnect: Option<JoinHandle<()>>,
}

impl MqttTransport {
    pub fn new(
        client: AsyncClient,
        topics: TopicScheme,
        qos: QoS,
        retain: bool,
        send_timeout: Duration,
    ) -> Self {
        Self {
            client,
            topics,
            qos,
            retain,
            send_timeout,
            pending_disconnect: None,
        }
    }
}

impl Transport for MqttTransport {
    async fn subscribe(&mut self, filter: &str) -> Result<(), TransportError> {
        tokio::time::timeout(self.send_timeout, self.client.subscribe(filter, self.qos))
            .await
            .map_err(|_| TransportError::Timeout(self.send_timeout))??;
        Ok(())
    }

    async fn publish(&mut self, topic: &str, payload: &str) -> Result<(), TransportError> {
        let wire_topic = self.topics.wire(topic);
        let send = self
            .client
            .publish(wire_topic, self.qos, self.retain, payload.as_bytes().to_vec());
        tokio::time::timeout(self.send_timeout, send)
            .await
            .map_err(|_| TransportError::Timeout(self.send_timeout))??;
        Ok(())
    }

    fn request_reconnect(&mut self) {
        // The event loop reconnects on its next poll after the disconnect goes out.
        let Err(e) = self.client.try_disconnect() else {
            return;
        };
        if self
            .pending_disconnect
            .as_ref()
            .is_some_and(|pending| !pending.is_finished())
        {
            debug!("Disconnect already waiting for the request queue");
            return;
        }
        // A full request queue is what made the send time out in the first
        // place; wait for room instead of giving up on the reconnect.
        warn!("Request queue busy ({}), disconnect will follow", e);
        let client = self.client.clone();
        self.pending_disconnect = Some(tokio::spawn(async move {
            if let Err(e) = client.disconnect().await {
                warn!("Disconnect request failed: {}", e);
            }
        }));
    }

    async fn disconnect(&mut self) {
        if let Err(e) = self.client.try_disconnect() {
            debug!("Disconnect not queued: {}", e);
        }
    }
}

/// Polls the client event loop until shutdown, translating activity into
/// manager events. After any transport error the next poll reconnects; a
/// fixed backoff separates attempts.
pub async fn drive(
    mut eventloop: EventLoop,
    events: mpsc::UnboundedSender<ManagerEvent>,
    backoff: Duration,
    shutdown: CancellationToken,
) {
    let mut connected = false;
    let mut attempting = false;

    loop {
        if !connected && !attempting {
            if shutdown.is_cancelled() {
                break;
            }
            attempting = true;
            if events.send(ManagerEvent::ConnectAttempt).is_err() {
                break;
            }
        }

        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                info!("Broker accepted connection: {:?}", ack.code);
                connected = true;
                attempting = false;
                if events.send(ManagerEvent::Connected).is_err() {
                    break;
                }
            }
            Ok(Event::Incoming(Packet::Publish(p))) => {
                let message = ManagerEvent::MessageArrived {
                    topic: p.topic.clone(),
                    payload: p.payload.to_vec(),
                };
                if events.send(message).is_err() {
                    break;
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) if shutdown.is_cancelled() => {
                info!("Disconnect sent, stopping event loop");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                let reason = e.to_string();
                let event = if connected {
                    warn!("Connection lost: {}", reason);
                    ManagerEvent::ConnectionLost(reason)
                } else {
                    warn!("Connect attempt failed: {}", reason);
                    ManagerEvent::ConnectFailed(reason)
                };
                connected = false;
                attempting = false;
                if events.send(event).is_err() || shutdown.is_cancelled() {
                    break;
                }
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
        }
    }
    debug!("Event loop driver finished");
}
