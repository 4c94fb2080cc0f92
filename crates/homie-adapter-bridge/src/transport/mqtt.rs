//! MQTT transport backed by `rumqttc`
//!
//! The client's event loop runs on its own task and is translated into
//! [`TransportEvent`]s. Reconnection is left to the event loop itself: after
//! a poll error the task waits a second and polls again, which makes
//! `rumqttc` reconnect.
//!
//! The event channel is unbounded. The consumer publishes through the same
//! client, so the poll task must never wait on it: a blocked poll stops
//! draining the request queue and the consumer's publish never completes.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use super::{ConnectionState, Transport, TransportEvent};
use crate::config::MqttConfig;
use crate::error::{BridgeError, Result};

const RETRY_DELAY: Duration = Duration::from_secs(1);

/// MQTT client transport
pub struct MqttTransport {
    client: AsyncClient,
    state: Arc<RwLock<ConnectionState>>,
    name: String,
}

impl MqttTransport {
    /// Create the client and start its event loop.
    ///
    /// Returns the transport and the receiver of its events.
    pub fn connect(
        config: &MqttConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TransportEvent>)> {
        let endpoint = config.endpoint()?;
        let (host, port) = (endpoint.host, endpoint.port);
        let client_id = config
            .client_id
            .clone()
            .unwrap_or_else(|| format!("homie-adapter-{}", uuid::Uuid::new_v4().simple()));

        let mut options = MqttOptions::new(client_id, host.clone(), port);
        options.set_keep_alive(config.keep_alive);
        // Explicit settings win over userinfo in the URI
        if let Some(username) = config.username.clone().or(endpoint.username) {
            let password = config.password.clone().or(endpoint.password);
            options.set_credentials(username, password.unwrap_or_default());
        }

        let (client, event_loop) = AsyncClient::new(options, config.request_capacity);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let state = Arc::new(RwLock::new(ConnectionState::Connecting));

        tokio::spawn(drive_event_loop(event_loop, event_tx, Arc::clone(&state)));
        info!(host = %host, port, "MQTT transport started");

        let transport = Self {
            client,
            state,
            name: format!("mqtt://{}:{}", host, port),
        };
        Ok((transport, event_rx))
    }
}

async fn drive_event_loop(
    mut event_loop: EventLoop,
    events: mpsc::UnboundedSender<TransportEvent>,
    state: Arc<RwLock<ConnectionState>>,
) {
    loop {
        let event = match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                debug!(code = ?ack.code, "MQTT session established");
                *state.write() = ConnectionState::Connected;
                Some(TransportEvent::Connected)
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                trace!(topic = %publish.topic, bytes = publish.payload.len(), "MQTT message");
                Some(TransportEvent::Message {
                    topic: publish.topic,
                    payload: publish.payload,
                })
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                *state.write() = ConnectionState::Disconnected;
                let _ = events.send(TransportEvent::Disconnected);
                break;
            }
            Ok(_) => None,
            Err(e) => {
                warn!("MQTT connection error: {}", e);
                let was_connected = {
                    let mut current = state.write();
                    let was = *current == ConnectionState::Connected;
                    *current = ConnectionState::Connecting;
                    was
                };
                if was_connected && events.send(TransportEvent::Disconnected).is_err() {
                    break;
                }
                tokio::time::sleep(RETRY_DELAY).await;
                None
            }
        };

        if let Some(event) = event {
            if events.send(event).is_err() {
                debug!("transport event receiver dropped, stopping MQTT event loop");
                break;
            }
        }
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn subscribe(&self, topic: &str) -> Result<()> {
        self.client
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| BridgeError::SubscribeFailed {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    async fn publish(&self, topic: &str, payload: Bytes, retain: bool) -> Result<()> {
        self.client
            .publish_bytes(topic, QoS::AtLeastOnce, retain, payload)
            .await
            .map_err(|e| BridgeError::PublishFailed {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    async fn disconnect(&self) -> Result<()> {
        self.client
            .disconnect()
            .await
            .map_err(|e| BridgeError::Connection(e.to_string()))
    }

    fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    fn name(&self) -> &str {
        &self.name
    }
}
