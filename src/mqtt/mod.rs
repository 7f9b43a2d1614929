//! # MQTT Session Module
//!
//! Owns the broker connections of the hub. Every integration gets its own
//! session so a misbehaving adapter cannot stall another one's delivery.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── config.rs           - Broker settings and presence topics
//! ├── message_manager.rs  - Inbound/outbound messages and session requests
//! └── mqtt_handler.rs     - Connection state machine, session tasks and handle
//! ```
//!
//! ## Connection Lifecycle
//!
//! ```text
//! Disconnected ──start──► Connecting ──ConnAck──► Connected
//!                                                  │    ▲
//!                                        drop      ▼    │ ConnAck
//!                                               Reconnecting
//! any ──shutdown──► Disconnected   (offline presence published first)
//! any ──close─────► Disconnected   (no presence, clean disconnect)
//! ```
//!
//! Every successful handshake resubscribes the current subscription set and
//! publishes `<root>/<device>/online` once. The matching `.../offline` topic
//! is registered as the last will, so a crash or partition still ends in an
//! offline announcement delivered by the broker.
//!
//! ## Threading Model
//!
//! A session spawns two tokio tasks:
//! 1. **Poll task**: drives the `rumqttc` event loop, applies state
//!    transitions and hands inbound publishes to an unbounded channel
//! 2. **Forwarder task**: executes subscribe/publish requests on the client
//!
//! The poll task never waits on handlers or on the request queue.

pub mod config;
pub mod message_manager;
pub mod mqtt_handler;

pub use config::{MqttConfig, PresenceTopics};
pub use message_manager::{InboundMessage, OutboundMessage, SessionRequest};
pub use mqtt_handler::{
    ConnectionSession, ConnectionState, SessionCore, SessionError, SessionHandle, SessionStatus,
};
