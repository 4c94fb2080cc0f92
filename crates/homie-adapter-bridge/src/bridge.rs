//! AdapterBridge - the service tying transport, tree and router together
//!
//! The bridge owns the [`TransformRouter`] and drives it from a single
//! `tokio::select!` loop:
//!
//! - transport events: connection changes feed the router's state machine,
//!   device messages are routed to the canonical tree, `.../set` messages
//!   become commands
//! - handle commands: programmatic `set` requests, stats, shutdown
//! - command outcomes: confirmations finishing on their own tasks
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                      AdapterBridge                        │
//! ├───────────────────────────────────────────────────────────┤
//! │                                                           │
//! │  ┌────────────┐   events   ┌──────────────────┐           │
//! │  │ Transport  │───────────►│ TransformRouter  │           │
//! │  │ (MQTT)     │◄───────────│  Pipeline        │           │
//! │  └────────────┘  publish   │  bindings        │           │
//! │                            └────────┬─────────┘           │
//! │  ┌────────────┐                     │ publish_attribute   │
//! │  │BridgeHandle│── set/stats ──►     ▼                     │
//! │  └────────────┘            ┌──────────────────┐           │
//! │                            │ CanonicalTree    │           │
//! │                            └──────────────────┘           │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use homie_adapter_bridge::{AdapterBridge, BridgeConfig, HomieTree, MqttTransport};
//!
//! let (transport, events) = MqttTransport::connect(&settings.mqtt)?;
//! let transport = Arc::new(transport);
//! let tree = Arc::new(HomieTree::new(transport.clone(), &settings.bridge));
//! let (bridge, handle) = AdapterBridge::new(transport, events, tree, entities, &settings.bridge);
//!
//! tokio::spawn(bridge.run());
//! handle.set(entity, "true").await?;
//! ```

use bytes::Bytes;
use homie_adapter_core::EntityRef;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::pipeline::Pipeline;
use crate::router::TransformRouter;
use crate::table::EntityDescriptor;
use crate::transport::{ConnectionState, Transport, TransportEvent};
use crate::tree::{CanonicalTree, SetRequest, VALUE_ATTRIBUTE};

/// Exit code reported when the transport goes away
pub const EXIT_CODE_CONNECTION_LOST: i32 = 1;

/// Commands that can be sent to the bridge
#[derive(Debug)]
pub enum BridgeCommand {
    /// Set an entity field and report once confirmed
    Set {
        /// Target entity and field
        request: SetRequest,
        /// Raw value
        value: Bytes,
        /// Confirmation result
        reply: oneshot::Sender<Result<()>>,
    },
    /// Get bridge statistics
    GetStats(oneshot::Sender<BridgeStats>),
    /// Shutdown the bridge
    Shutdown,
}

/// Events surfaced to the hosting process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    /// A recoverable error
    Error {
        /// Error code
        code: &'static str,
        /// Error message
        message: String,
    },
    /// The bridge stopped
    Exit {
        /// Why it stopped
        reason: String,
        /// Suggested process exit code
        code: i32,
    },
}

/// Bridge statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BridgeStats {
    /// Device messages received on state topics
    pub inbound_messages: u64,
    /// Canonical attributes published
    pub attributes_published: u64,
    /// State bindings that failed (decode, transform or publish)
    pub message_errors: u64,
    /// Commands published to the device
    pub commands_sent: u64,
    /// Commands rejected before publishing
    pub commands_rejected: u64,
    /// Commands confirmed by the device
    pub confirmations_succeeded: u64,
    /// Commands whose confirmation failed or timed out
    pub confirmations_failed: u64,
    /// Rules skipped while building bindings
    pub skipped_rules: u64,
    /// Connections established
    pub connects: u64,
}

#[derive(Debug)]
struct CommandOutcome {
    entity: EntityRef,
    failure: Option<(&'static str, String)>,
}

/// Handle for controlling the AdapterBridge
#[derive(Clone)]
pub struct BridgeHandle {
    command_tx: mpsc::Sender<BridgeCommand>,
    events: broadcast::Sender<BridgeEvent>,
}

impl BridgeHandle {
    /// Set an entity's value and wait for the device to confirm it
    pub async fn set(&self, entity: EntityRef, value: impl Into<Bytes>) -> Result<()> {
        self.set_attribute(entity, VALUE_ATTRIBUTE, value).await
    }

    /// Set a field of an entity
    pub async fn set_attribute(
        &self,
        entity: EntityRef,
        field: &str,
        value: impl Into<Bytes>,
    ) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(BridgeCommand::Set {
                request: SetRequest {
                    entity,
                    field: field.to_string(),
                },
                value: value.into(),
                reply,
            })
            .await
            .map_err(|_| BridgeError::BridgeNotRunning)?;
        rx.await.map_err(|_| BridgeError::ChannelClosed)?
    }

    /// Get bridge statistics
    pub async fn stats(&self) -> Result<BridgeStats> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(BridgeCommand::GetStats(tx))
            .await
            .map_err(|_| BridgeError::ChannelClosed)?;
        rx.await.map_err(|_| BridgeError::ChannelClosed)
    }

    /// Shutdown the bridge
    pub async fn shutdown(&self) -> Result<()> {
        self.command_tx
            .send(BridgeCommand::Shutdown)
            .await
            .map_err(|_| BridgeError::ChannelClosed)
    }

    /// Subscribe to error and exit events
    pub fn subscribe_events(&self) -> broadcast::Receiver<BridgeEvent> {
        self.events.subscribe()
    }
}

/// Main bridge service between device topics and the canonical tree
pub struct AdapterBridge {
    transport: Arc<dyn Transport>,
    transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    tree: Arc<dyn CanonicalTree>,
    router: TransformRouter,
    command_rx: mpsc::Receiver<BridgeCommand>,
    outcome_tx: mpsc::UnboundedSender<CommandOutcome>,
    outcome_rx: mpsc::UnboundedReceiver<CommandOutcome>,
    events: broadcast::Sender<BridgeEvent>,
    stats: BridgeStats,
    running: bool,
}

impl AdapterBridge {
    /// Create a bridge over a transport, its event stream and a canonical tree
    pub fn new(
        transport: Arc<dyn Transport>,
        transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
        tree: Arc<dyn CanonicalTree>,
        entities: Vec<EntityDescriptor>,
        config: &BridgeConfig,
    ) -> (Self, BridgeHandle) {
        let router = TransformRouter::new(
            entities,
            Arc::clone(&transport),
            Arc::clone(&tree),
            Pipeline::default(),
            config.signal_capacity,
        )
        .with_confirmation_timeout(config.confirmation_timeout);

        let (command_tx, command_rx) = mpsc::channel(config.command_queue_size.max(1));
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(config.signal_capacity.max(1));

        let handle = BridgeHandle {
            command_tx,
            events: events.clone(),
        };

        let bridge = Self {
            transport,
            transport_rx,
            tree,
            router,
            command_rx,
            outcome_tx,
            outcome_rx,
            events,
            stats: BridgeStats::default(),
            running: false,
        };

        (bridge, handle)
    }

    /// Use a custom pipeline (extra parsers)
    pub fn with_pipeline(mut self, pipeline: Pipeline) -> Self {
        self.router.set_pipeline(pipeline);
        self
    }

    /// Run the bridge service
    ///
    /// Returns when shut down through the handle, or with an error when the
    /// transport event stream ends.
    pub async fn run(mut self) -> Result<()> {
        info!(
            transport = %self.transport.name(),
            entities = self.router.entities().len(),
            "Starting adapter bridge"
        );
        self.running = true;

        let result = loop {
            tokio::select! {
                event = self.transport_rx.recv() => {
                    match event {
                        Some(event) => self.handle_transport_event(event).await,
                        None => {
                            error!("Transport event stream closed");
                            break Err(BridgeError::Connection(
                                "transport event stream closed".to_string(),
                            ));
                        }
                    }
                }

                Some(cmd) = self.command_rx.recv() => {
                    match cmd {
                        BridgeCommand::Set { request, value, reply } => {
                            self.start_command(request, value, Some(reply)).await;
                        }
                        BridgeCommand::GetStats(tx) => {
                            let _ = tx.send(self.stats.clone());
                        }
                        BridgeCommand::Shutdown => {
                            info!("Bridge shutdown requested");
                            self.running = false;
                        }
                    }
                }

                Some(outcome) = self.outcome_rx.recv() => {
                    self.record_outcome(outcome);
                }
            }

            if !self.running {
                break Ok(());
            }
        };

        if let Err(e) = self.transport.disconnect().await {
            warn!("Error disconnecting transport: {}", e);
        }

        match &result {
            Ok(()) => self.emit(BridgeEvent::Exit {
                reason: "shutdown".to_string(),
                code: 0,
            }),
            Err(e) => {
                self.emit(BridgeEvent::Error {
                    code: e.error_code(),
                    message: e.to_string(),
                });
                self.emit(BridgeEvent::Exit {
                    reason: e.to_string(),
                    code: EXIT_CODE_CONNECTION_LOST,
                });
            }
        }

        info!("Adapter bridge stopped");
        result
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => self.handle_connected().await,
            TransportEvent::Disconnected => {
                warn!(transport = %self.transport.name(), "Transport disconnected");
                let _ = self
                    .router
                    .on_connection_state(ConnectionState::Disconnected)
                    .await;
            }
            TransportEvent::Message { topic, payload } => {
                if let Some(request) = self.tree.parse_set_topic(&topic) {
                    self.start_command(request, payload, None).await;
                    return;
                }

                self.stats.inbound_messages += 1;
                let outcome = self.router.handle_message(&topic, &payload).await;
                self.stats.attributes_published += outcome.published as u64;
                self.stats.message_errors += outcome.failed as u64;
            }
        }
    }

    async fn handle_connected(&mut self) {
        info!(transport = %self.transport.name(), "Transport connected");
        self.stats.connects += 1;

        if let Err(e) = self.tree.announce().await {
            warn!("Failed to announce device: {}", e);
            self.emit_error(&e);
        }

        if let Err(e) = self
            .router
            .on_connection_state(ConnectionState::Connected)
            .await
        {
            error!("Failed to activate transform router: {}", e);
            self.emit_error(&e);
            return;
        }
        self.stats.skipped_rules = self.router.skipped_rules() as u64;

        let set_topics: Vec<String> = self
            .router
            .command_entities()
            .filter_map(|entity| self.tree.set_topic(entity))
            .collect();
        for topic in set_topics {
            match self.transport.subscribe(&topic).await {
                Ok(()) => debug!(topic = %topic, "subscribed set topic"),
                Err(e) => {
                    error!(topic = %topic, "Failed to subscribe set topic: {}", e);
                    self.emit_error(&e);
                }
            }
        }
    }

    async fn start_command(
        &mut self,
        request: SetRequest,
        value: Bytes,
        reply: Option<oneshot::Sender<Result<()>>>,
    ) {
        let SetRequest { entity, field } = request;

        match self.router.begin_command(&entity, &field, &value).await {
            Ok(confirmation) => {
                if field == VALUE_ATTRIBUTE {
                    self.stats.commands_sent += 1;
                }
                let outcome_tx = self.outcome_tx.clone();
                tokio::spawn(async move {
                    let result = confirmation.await;
                    let failure = result
                        .as_ref()
                        .err()
                        .map(|e| (e.error_code(), e.to_string()));
                    let _ = outcome_tx.send(CommandOutcome { entity, failure });
                    if let Some(reply) = reply {
                        let _ = reply.send(result);
                    }
                });
            }
            Err(e) => {
                warn!(entity = %entity, field = %field, "Command rejected: {}", e);
                self.stats.commands_rejected += 1;
                match reply {
                    Some(reply) => {
                        let _ = reply.send(Err(e));
                    }
                    None => self.emit_error(&e),
                }
            }
        }
    }

    fn record_outcome(&mut self, outcome: CommandOutcome) {
        match outcome.failure {
            None => {
                debug!(entity = %outcome.entity, "Command confirmed");
                self.stats.confirmations_succeeded += 1;
            }
            Some((code, message)) => {
                warn!(entity = %outcome.entity, code, "Command not confirmed: {}", message);
                self.stats.confirmations_failed += 1;
                self.emit(BridgeEvent::Error { code, message });
            }
        }
    }

    fn emit_error(&self, error: &BridgeError) {
        self.emit(BridgeEvent::Error {
            code: error.error_code(),
            message: error.to_string(),
        });
    }

    fn emit(&self, event: BridgeEvent) {
        // No subscriber is fine, the hosting process may not listen.
        let _ = self.events.send(event);
    }
}
