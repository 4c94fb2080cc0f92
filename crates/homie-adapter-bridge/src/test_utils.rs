//! Test utilities for driving the adapter without a broker
//!
//! [`MockTransport`] records subscriptions and publishes, and can answer a
//! command publish with a state message the way a real device would.
//! [`RecordingTree`] captures every canonical attribute update on a channel.
//!
//! # Example
//!
//! ```rust,ignore
//! use homie_adapter_bridge::test_utils::MockTransport;
//!
//! let (transport, events) = MockTransport::with_events();
//! transport.respond_to("cmnd/plug/POWER", "stat/plug/POWER", "ON");
//! transport.connect();
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use homie_adapter_core::EntityRef;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::transport::{ConnectionState, Transport, TransportEvent};
use crate::tree::{CanonicalTree, HomieTree, SetRequest};

/// A publish recorded by [`MockTransport`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    /// Topic
    pub topic: String,
    /// Payload as text
    pub payload: String,
    /// Retain flag
    pub retain: bool,
}

#[derive(Default)]
struct MockState {
    connection: Option<ConnectionState>,
    subscriptions: Vec<String>,
    published: Vec<PublishedMessage>,
    responses: HashMap<String, (String, Bytes)>,
    fail_publish: bool,
}

/// In-memory transport for tests
#[derive(Default)]
pub struct MockTransport {
    state: Mutex<MockState>,
    events: Option<mpsc::UnboundedSender<TransportEvent>>,
}

impl MockTransport {
    /// Transport without an event channel
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport plus the receiver of its events
    pub fn with_events() -> (Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Self {
            state: Mutex::new(MockState::default()),
            events: Some(tx),
        };
        (Arc::new(transport), rx)
    }

    /// Emit `Connected`
    pub fn connect(&self) {
        self.state.lock().connection = Some(ConnectionState::Connected);
        self.emit(TransportEvent::Connected);
    }

    /// Emit `Disconnected`
    pub fn drop_connection(&self) {
        self.state.lock().connection = Some(ConnectionState::Disconnected);
        self.emit(TransportEvent::Disconnected);
    }

    /// Emit a message as if the broker delivered it
    pub fn deliver(&self, topic: &str, payload: impl Into<Bytes>) {
        self.emit(TransportEvent::Message {
            topic: topic.to_string(),
            payload: payload.into(),
        });
    }

    /// Answer every publish on `command_topic` with `payload` on `state_topic`
    pub fn respond_to(&self, command_topic: &str, state_topic: &str, payload: impl Into<Bytes>) {
        self.state.lock().responses.insert(
            command_topic.to_string(),
            (state_topic.to_string(), payload.into()),
        );
    }

    /// Make every publish fail
    pub fn fail_publish(&self, fail: bool) {
        self.state.lock().fail_publish = fail;
    }

    /// Topics subscribed so far, in call order
    pub fn subscriptions(&self) -> Vec<String> {
        self.state.lock().subscriptions.clone()
    }

    /// Publishes so far, in call order
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state.lock().published.clone()
    }

    /// Publishes on one topic
    pub fn published_to(&self, topic: &str) -> Vec<PublishedMessage> {
        self.state
            .lock()
            .published
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    fn emit(&self, event: TransportEvent) {
        if let Some(events) = &self.events {
            if events.send(event).is_err() {
                debug!("mock transport event dropped");
            }
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn subscribe(&self, topic: &str) -> Result<()> {
        self.state.lock().subscriptions.push(topic.to_string());
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Bytes, retain: bool) -> Result<()> {
        let response = {
            let mut state = self.state.lock();
            if state.fail_publish {
                return Err(BridgeError::PublishFailed {
                    topic: topic.to_string(),
                    reason: "publish disabled".to_string(),
                });
            }
            state.published.push(PublishedMessage {
                topic: topic.to_string(),
                payload: String::from_utf8_lossy(&payload).into_owned(),
                retain,
            });
            state.responses.get(topic).cloned()
        };

        if let Some((state_topic, payload)) = response {
            self.deliver(&state_topic, payload);
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.state.lock().connection = Some(ConnectionState::Disconnected);
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        self.state
            .lock()
            .connection
            .unwrap_or(ConnectionState::Connected)
    }

    fn name(&self) -> &str {
        "MockTransport"
    }
}

/// An attribute update captured by [`RecordingTree`]
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeUpdate {
    /// Entity
    pub entity: EntityRef,
    /// Attribute name
    pub attribute: String,
    /// Published value
    pub value: Value,
    /// Retained flag
    pub retained: bool,
}

/// Canonical tree that records updates instead of publishing them.
///
/// Set topics follow the Homie layout of [`HomieTree`].
pub struct RecordingTree {
    updates: mpsc::UnboundedSender<AttributeUpdate>,
    layout: HomieTree,
}

impl RecordingTree {
    /// Tree with the default layout, plus the receiver of its updates
    pub fn new() -> (Self, mpsc::UnboundedReceiver<AttributeUpdate>) {
        Self::with_config(&BridgeConfig::default())
    }

    /// Tree with the layout of `config`
    pub fn with_config(config: &BridgeConfig) -> (Self, mpsc::UnboundedReceiver<AttributeUpdate>) {
        let (updates, rx) = mpsc::unbounded_channel();
        let layout = HomieTree::new(Arc::new(MockTransport::new()), config);
        (Self { updates, layout }, rx)
    }
}

#[async_trait]
impl CanonicalTree for RecordingTree {
    async fn publish_attribute(
        &self,
        entity: &EntityRef,
        attribute: &str,
        value: &Value,
        retained: bool,
    ) -> Result<()> {
        self.updates
            .send(AttributeUpdate {
                entity: entity.clone(),
                attribute: attribute.to_string(),
                value: value.clone(),
                retained,
            })
            .map_err(|_| BridgeError::ChannelClosed)
    }

    fn set_topic(&self, entity: &EntityRef) -> Option<String> {
        self.layout.set_topic(entity)
    }

    fn parse_set_topic(&self, topic: &str) -> Option<SetRequest> {
        self.layout.parse_set_topic(topic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_transport_responds() {
        let (transport, mut events) = MockTransport::with_events();
        transport.respond_to("cmnd/plug/POWER", "stat/plug/POWER", "ON");

        transport
            .publish("cmnd/plug/POWER", Bytes::from_static(b"ON"), false)
            .await
            .unwrap();

        assert_eq!(
            events.recv().await.unwrap(),
            TransportEvent::Message {
                topic: "stat/plug/POWER".to_string(),
                payload: Bytes::from_static(b"ON"),
            }
        );
        assert_eq!(transport.published_to("cmnd/plug/POWER").len(), 1);
    }

    #[tokio::test]
    async fn test_mock_transport_failure() {
        let transport = MockTransport::new();
        transport.fail_publish(true);
        let err = transport
            .publish("x", Bytes::new(), true)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "PUBLISH_FAILED");
        assert!(transport.published().is_empty());
    }
}
