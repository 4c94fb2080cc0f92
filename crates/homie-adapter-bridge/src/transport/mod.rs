//! Transport abstraction for the device side of the adapter
//!
//! The bridge talks to the broker through [`Transport`] and receives
//! connection and message events as [`TransportEvent`]s on an mpsc channel.
//!
//! - [`MqttTransport`] - `rumqttc` client (requires `mqtt` feature)
//!
//! Tests use `test_utils::MockTransport` instead.

#[cfg(feature = "mqtt")]
mod mqtt;
#[cfg(feature = "mqtt")]
pub use mqtt::MqttTransport;

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;

/// Trait for publish/subscribe transports
#[async_trait]
pub trait Transport: Send + Sync {
    /// Subscribe to a topic
    async fn subscribe(&self, topic: &str) -> Result<()>;

    /// Publish a payload
    async fn publish(&self, topic: &str, payload: Bytes, retain: bool) -> Result<()>;

    /// End the session
    async fn disconnect(&self) -> Result<()>;

    /// Current connection state
    fn state(&self) -> ConnectionState;

    /// Get the transport name (for logging)
    fn name(&self) -> &str;

    /// Check if currently connected
    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }
}

/// Events produced by a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Session established (or re-established)
    Connected,
    /// Session lost
    Disconnected,
    /// Message received on a subscribed topic
    Message {
        /// Topic
        topic: String,
        /// Raw payload
        payload: Bytes,
    },
}

/// Connection state for transports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected
    Disconnected,
    /// Connection in progress
    Connecting,
    /// Successfully connected
    Connected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}
