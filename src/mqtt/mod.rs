//! # MQTT Integration Module
//!
//! Everything between a finished [`message::Reading`] and the broker: the
//! connection state machine, the transport seam, the remote command channel
//! and the broker configuration.
//!
//! ## Why This Module Exists
//!
//! The relay runs unattended on hosts with unreliable uplinks. A reading that
//! is produced while the broker is unreachable must still arrive eventually,
//! in order, and the operator must be able to steer the process remotely.
//! This module keeps those obligations in one place.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── config.rs      - [broker] settings, topic scheme, client options and last will
//! ├── message.rs     - The Reading value type and JSON payload builders
//! ├── transport.rs   - Transport trait, rumqttc adapter and event loop driver
//! ├── connection.rs  - Connection state machine and store-and-forward routing
//! └── command.rs     - kill / update / reboot / read handling
//! ```
//!
//! ## Design Philosophy
//!
//! - **Single owner**: one task owns connection state and the queue; the
//!   rumqttc event loop only reports what happened through a channel
//! - **Never block producers**: publishing is a channel send, outages are
//!   absorbed by the durable queue
//! - **Retry forever**: the driver reconnects with a fixed backoff since no
//!   operator is assumed to be around

pub mod command;
pub mod config;
pub mod connection;
pub mod message;
pub mod transport;
