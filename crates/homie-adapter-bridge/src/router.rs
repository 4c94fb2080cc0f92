//! Transform router
//!
//! The router turns the rules owned by each entity into live bindings:
//!
//! - state halves subscribe the transport to a device topic and republish
//!   every message received there onto a canonical attribute
//! - command halves of settable properties turn `set` requests into device
//!   publishes and wait for the device to report back on the paired state
//!   topic
//!
//! # Lifecycle
//!
//! ```text
//!            Connected                     Connected
//!   Idle ───────────────► Active ◄──────────────────┐
//!    ▲                      │  rebuild bindings,     │
//!    └──────────────────────┘  re-subscribe ─────────┘
//!         Disconnected
//! ```
//!
//! Every `Connected` rebuilds the binding tables from scratch, so repeated
//! connects never stack handlers. Subscriptions are not torn down on
//! `Disconnected`; the broker session takes care of that.
//!
//! # Confirmations
//!
//! After a command is published the router waits for a [`RouterSignal`]:
//! the next non-empty message on the paired state topic confirms it, an
//! error signal on the same entity fails it. Nothing correlates a specific
//! `set` with a specific reply, so two overlapping commands on one property
//! both resolve on the first reply that arrives. Without a configured
//! timeout the wait never ends on its own. A listener that falls behind the
//! signal buffer fails instead of waiting for a reply it may have missed.

use bytes::Bytes;
use futures::future::{self, BoxFuture, FutureExt};
use homie_adapter_core::{EntityRef, TopicShape};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, trace, warn};

use crate::error::{BridgeError, Result};
use crate::pipeline::{coerce_node_state, Flow, Pipeline};
use crate::table::{EntityDescriptor, TransformRule};
use crate::transport::{ConnectionState, Transport};
use crate::tree::{CanonicalTree, STATE_ATTRIBUTE, VALUE_ATTRIBUTE};

/// Router lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterState {
    /// No connection, no bindings in use
    Idle,
    /// Bindings built and state topics subscribed
    Active,
}

/// Canonical attribute an inbound binding writes to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingTarget {
    /// The node's `$state`, coerced to an allowed state
    NodeState,
    /// The property's value
    PropertyValue,
    /// A named attribute, sigil stripped
    Attribute(String),
}

impl BindingTarget {
    fn attribute(&self) -> &str {
        match self {
            BindingTarget::NodeState => STATE_ATTRIBUTE,
            BindingTarget::PropertyValue => VALUE_ATTRIBUTE,
            BindingTarget::Attribute(name) => name,
        }
    }
}

#[derive(Debug, Clone)]
struct InboundBinding {
    entity: EntityRef,
    target: BindingTarget,
    flow: Flow,
}

#[derive(Debug, Clone)]
struct CommandBinding {
    flow: Flow,
    confirm_topic: Option<String>,
    retain: bool,
}

/// Signals observed by pending command confirmations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterSignal {
    /// A message was processed on a state topic
    State {
        /// Device topic
        topic: String,
        /// True when the payload was non-empty
        truthy: bool,
    },
    /// Handling a message for an entity failed
    Error {
        /// Entity whose binding failed
        entity: EntityRef,
        /// Failure description
        reason: String,
    },
}

/// Result of routing one inbound message
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InboundOutcome {
    /// Canonical attributes published
    pub published: usize,
    /// Bindings that failed to decode, transform or publish
    pub failed: usize,
}

/// Future resolving once a command is confirmed
pub type Confirmation = BoxFuture<'static, Result<()>>;

/// Routes messages between device topics and the canonical tree
pub struct TransformRouter {
    entities: Vec<EntityDescriptor>,
    transport: Arc<dyn Transport>,
    tree: Arc<dyn CanonicalTree>,
    pipeline: Pipeline,
    state: RouterState,
    inbound: HashMap<String, Vec<InboundBinding>>,
    commands: HashMap<EntityRef, Vec<CommandBinding>>,
    signals: broadcast::Sender<RouterSignal>,
    confirmation_timeout: Option<Duration>,
    skipped_rules: usize,
}

impl TransformRouter {
    /// Create an idle router
    pub fn new(
        entities: Vec<EntityDescriptor>,
        transport: Arc<dyn Transport>,
        tree: Arc<dyn CanonicalTree>,
        pipeline: Pipeline,
        signal_capacity: usize,
    ) -> Self {
        let (signals, _) = broadcast::channel(signal_capacity.max(1));
        Self {
            entities,
            transport,
            tree,
            pipeline,
            state: RouterState::Idle,
            inbound: HashMap::new(),
            commands: HashMap::new(),
            signals,
            confirmation_timeout: None,
            skipped_rules: 0,
        }
    }

    /// Bound every confirmation wait
    pub fn with_confirmation_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.confirmation_timeout = timeout;
        self
    }

    /// Replace the pipeline, e.g. to register extra parsers
    pub fn set_pipeline(&mut self, pipeline: Pipeline) {
        self.pipeline = pipeline;
    }

    /// Current lifecycle state
    pub fn state(&self) -> RouterState {
        self.state
    }

    /// Entities served by this router
    pub fn entities(&self) -> &[EntityDescriptor] {
        &self.entities
    }

    /// Rules skipped while building the current bindings
    pub fn skipped_rules(&self) -> usize {
        self.skipped_rules
    }

    /// Device topics the current bindings listen on
    pub fn state_topics(&self) -> BTreeSet<&str> {
        self.inbound.keys().map(String::as_str).collect()
    }

    /// Entities that currently accept commands
    pub fn command_entities(&self) -> impl Iterator<Item = &EntityRef> {
        self.commands.keys()
    }

    /// Subscribe to router signals
    pub fn subscribe_signals(&self) -> broadcast::Receiver<RouterSignal> {
        self.signals.subscribe()
    }

    /// Feed a connection state change
    pub async fn on_connection_state(&mut self, state: ConnectionState) -> Result<()> {
        match state {
            ConnectionState::Connected => self.activate().await,
            ConnectionState::Disconnected | ConnectionState::Connecting => {
                if self.state == RouterState::Active {
                    debug!("transform router idle");
                }
                self.state = RouterState::Idle;
                Ok(())
            }
        }
    }

    async fn activate(&mut self) -> Result<()> {
        self.rebuild_bindings();

        let topics: Vec<String> = self.inbound.keys().cloned().collect();
        for topic in &topics {
            self.transport.subscribe(topic).await?;
            debug!(topic = %topic, "subscribed state topic");
        }

        self.state = RouterState::Active;
        info!(
            state_topics = topics.len(),
            command_entities = self.commands.len(),
            skipped = self.skipped_rules,
            "transform router active"
        );
        Ok(())
    }

    fn rebuild_bindings(&mut self) {
        self.inbound.clear();
        self.commands.clear();
        self.skipped_rules = 0;

        let entities = std::mem::take(&mut self.entities);
        for descriptor in &entities {
            for rule in &descriptor.rules {
                if !self.bind_rule(descriptor, rule) {
                    self.skipped_rules += 1;
                }
            }
        }
        self.entities = entities;
    }

    /// Bind one owned rule, returning false when nothing was bound
    fn bind_rule(&mut self, descriptor: &EntityDescriptor, rule: &TransformRule) -> bool {
        let entity = &descriptor.entity;
        let pattern = rule.pattern_str();

        if rule.is_empty() {
            warn!(
                entity = %entity,
                pattern = %pattern,
                "transform rule must contain state or command"
            );
            return false;
        }

        let target = match (entity, rule.pattern.shape()) {
            (EntityRef::Node { .. }, shape) => {
                if shape.attribute() != Some(STATE_ATTRIBUTE) {
                    debug!(entity = %entity, pattern = %pattern, "unsupported node attribute");
                    return false;
                }
                if rule.state.is_none() {
                    warn!(entity = %entity, pattern = %pattern, "node rule must contain state");
                    return false;
                }
                BindingTarget::NodeState
            }
            (EntityRef::Property { .. }, TopicShape::NodeAttribute { .. }) => {
                warn!(entity = %entity, pattern = %pattern, "node attribute rule on a property");
                return false;
            }
            (EntityRef::Property { .. }, shape) => match shape.attribute() {
                Some(attribute) => BindingTarget::Attribute(attribute.to_string()),
                None => BindingTarget::PropertyValue,
            },
        };

        let mut bound = false;

        if let Some(flow) = &rule.state {
            self.inbound
                .entry(flow.topic.clone())
                .or_default()
                .push(InboundBinding {
                    entity: entity.clone(),
                    target: target.clone(),
                    flow: flow.clone(),
                });
            bound = true;
        }

        if let Some(flow) = &rule.command {
            if target != BindingTarget::PropertyValue {
                warn!(entity = %entity, pattern = %pattern, "command ignored on attribute rule");
            } else if !descriptor.settable {
                warn!(entity = %entity, pattern = %pattern, "command ignored on non-settable property");
            } else {
                let confirm_topic = rule.state.as_ref().map(|s| s.topic.clone());
                if confirm_topic.is_none() {
                    info!(
                        entity = %entity,
                        pattern = %pattern,
                        "command without state topic is not confirmed"
                    );
                }
                self.commands
                    .entry(entity.clone())
                    .or_default()
                    .push(CommandBinding {
                        flow: flow.clone(),
                        confirm_topic,
                        retain: descriptor.retained,
                    });
                bound = true;
            }
        }

        bound
    }

    /// Route a device message to every binding listening on its topic
    pub async fn handle_message(&self, topic: &str, payload: &[u8]) -> InboundOutcome {
        let mut outcome = InboundOutcome::default();
        if self.state != RouterState::Active {
            trace!(topic = %topic, "router idle, message ignored");
            return outcome;
        }
        let Some(bindings) = self.inbound.get(topic) else {
            return outcome;
        };

        for binding in bindings {
            match self.apply_binding(binding, payload).await {
                Ok(()) => outcome.published += 1,
                Err(e) => {
                    outcome.failed += 1;
                    if e.is_message_error() {
                        warn!(
                            topic = %topic,
                            entity = %binding.entity,
                            attribute = %binding.target.attribute(),
                            "failed to handle state message: {}",
                            e
                        );
                    } else {
                        error!(
                            topic = %topic,
                            entity = %binding.entity,
                            attribute = %binding.target.attribute(),
                            code = e.error_code(),
                            "failed to publish canonical attribute: {}",
                            e
                        );
                    }
                    let _ = self.signals.send(RouterSignal::Error {
                        entity: binding.entity.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        let _ = self.signals.send(RouterSignal::State {
            topic: topic.to_string(),
            truthy: !payload.is_empty(),
        });
        outcome
    }

    async fn apply_binding(&self, binding: &InboundBinding, payload: &[u8]) -> Result<()> {
        let value = self.pipeline.run(&binding.flow, payload).await?;
        let value = match binding.target {
            BindingTarget::NodeState => Value::String(coerce_node_state(&value).to_string()),
            _ => value,
        };
        trace!(
            entity = %binding.entity,
            attribute = %binding.target.attribute(),
            "publishing transformed value"
        );
        self.tree
            .publish_attribute(&binding.entity, binding.target.attribute(), &value, true)
            .await
    }

    /// Run a `set` request and publish it to the device.
    ///
    /// Returns once the command is published. The returned future resolves
    /// when the device confirms it and must be polled off the router's own
    /// task, since confirmations arrive through [`TransformRouter::handle_message`].
    pub async fn begin_command(
        &self,
        entity: &EntityRef,
        field: &str,
        value: &[u8],
    ) -> Result<Confirmation> {
        if field != VALUE_ATTRIBUTE {
            debug!(entity = %entity, field = %field, "set on attribute ignored");
            return Ok(future::ready(Ok(())).boxed());
        }
        if self.state != RouterState::Active {
            return Err(BridgeError::NotConnected);
        }
        let bindings = match self.commands.get(entity) {
            Some(bindings) => bindings,
            None if self.entities.iter().any(|e| &e.entity == entity) => {
                return Err(BridgeError::NotSettable(entity.to_string()))
            }
            None => return Err(BridgeError::UnknownEntity(entity.to_string())),
        };

        let mut confirmations = Vec::with_capacity(bindings.len());
        for binding in bindings {
            let payload = self.pipeline.run_to_payload(&binding.flow, value).await?;

            // Listen before publishing so a fast reply is not missed.
            let confirmation = binding
                .confirm_topic
                .as_ref()
                .map(|topic| self.confirmation(entity.clone(), topic.clone()));

            self.transport
                .publish(&binding.flow.topic, Bytes::from(payload), binding.retain)
                .await?;
            debug!(entity = %entity, topic = %binding.flow.topic, "command published");

            if let Some(confirmation) = confirmation {
                confirmations.push(confirmation);
            }
        }

        Ok(future::try_join_all(confirmations).map(|r| r.map(|_| ())).boxed())
    }

    fn confirmation(&self, entity: EntityRef, topic: String) -> Confirmation {
        let receiver = self.signals.subscribe();
        let wait = wait_for_confirmation(receiver, entity, topic.clone());
        match self.confirmation_timeout {
            None => wait.boxed(),
            Some(timeout) => async move {
                tokio::time::timeout(timeout, wait)
                    .await
                    .map_err(|_| BridgeError::ConfirmationTimeout { topic, timeout })?
            }
            .boxed(),
        }
    }
}

async fn wait_for_confirmation(
    mut signals: broadcast::Receiver<RouterSignal>,
    entity: EntityRef,
    topic: String,
) -> Result<()> {
    loop {
        match signals.recv().await {
            Ok(RouterSignal::State { topic: t, truthy }) if truthy && t == topic => return Ok(()),
            Ok(RouterSignal::Error { entity: e, reason }) if e == entity => {
                error!(entity = %entity, "command failed: {}", reason);
                return Err(BridgeError::ConfirmationFailed {
                    entity: entity.to_string(),
                    reason,
                });
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                // the reply may be among the dropped signals
                warn!(entity = %entity, missed, "confirmation listener lagged");
                return Err(BridgeError::ConfirmationLagged {
                    entity: entity.to_string(),
                    missed,
                });
            }
            Err(broadcast::error::RecvError::Closed) => return Err(BridgeError::ChannelClosed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{from_fn, Identity};
    use crate::table::{assign_rules, TransformTable};
    use crate::test_utils::{MockTransport, RecordingTree};
    use homie_adapter_core::{DeviceConfig, ParserKind, TransformerSpec};
    use serde_json::json;

    fn device() -> DeviceConfig {
        serde_json::from_value(json!({
            "nodes": [
                {
                    "id": "power",
                    "name": "Power",
                    "sensors": [
                        { "id": "state", "settable": true, "retained": false },
                        { "id": "voltage", "unit": "V" }
                    ]
                }
            ]
        }))
        .unwrap()
    }

    fn table() -> TransformTable {
        let mut table = TransformTable::new();
        table.insert(
            TransformRule::parse("power/$state")
                .unwrap()
                .with_state(Flow::new("tele/plug/LWT").with_transformer(TransformerSpec::Map {
                    values: [
                        ("Online".to_string(), json!("ready")),
                        ("Offline".to_string(), json!("lost")),
                    ]
                    .into_iter()
                    .collect(),
                    default: None,
                })),
        );
        table.insert(
            TransformRule::parse("power/state")
                .unwrap()
                .with_state(Flow::new("stat/plug/POWER").with_transformer(TransformerSpec::Equals {
                    value: json!("ON"),
                }))
                .with_command(Flow::new("cmnd/plug/POWER").with_transformer(from_fn(|v| {
                    Ok(json!(if v == json!("true") { "ON" } else { "OFF" }))
                }))),
        );
        table.insert(
            TransformRule::parse("power/voltage/$unit")
                .unwrap()
                .with_state(Flow::new("tele/plug/UNIT")),
        );
        table.insert(
            TransformRule::parse("power/voltage")
                .unwrap()
                .with_state(Flow::new("tele/plug/SENSOR").with_parser(ParserKind::Json))
                .with_command(Flow::new("cmnd/plug/VOLTAGE").with_transformer(Identity)),
        );
        table
    }

    async fn router() -> (
        TransformRouter,
        Arc<MockTransport>,
        tokio::sync::mpsc::UnboundedReceiver<crate::test_utils::AttributeUpdate>,
    ) {
        let transport = Arc::new(MockTransport::new());
        let (tree, updates) = RecordingTree::new();
        let entities = assign_rules(&device(), &table());
        let mut router = TransformRouter::new(
            entities,
            transport.clone(),
            Arc::new(tree),
            Pipeline::default(),
            16,
        );
        router
            .on_connection_state(ConnectionState::Connected)
            .await
            .unwrap();
        (router, transport, updates)
    }

    #[tokio::test]
    async fn test_activation_subscribes_state_topics() {
        let (router, transport, _) = router().await;
        assert_eq!(router.state(), RouterState::Active);

        let mut subscriptions = transport.subscriptions();
        subscriptions.sort();
        assert_eq!(
            subscriptions,
            vec!["stat/plug/POWER", "tele/plug/LWT", "tele/plug/SENSOR", "tele/plug/UNIT"]
        );
        // voltage is not settable, so its command half is skipped
        assert_eq!(router.skipped_rules(), 0);
        assert_eq!(router.command_entities().count(), 1);
    }

    #[tokio::test]
    async fn test_reconnect_does_not_duplicate_bindings() {
        let (mut router, transport, mut updates) = router().await;
        router
            .on_connection_state(ConnectionState::Disconnected)
            .await
            .unwrap();
        assert_eq!(router.state(), RouterState::Idle);
        router
            .on_connection_state(ConnectionState::Connected)
            .await
            .unwrap();
        assert_eq!(transport.subscriptions().len(), 8);

        let outcome = router.handle_message("tele/plug/UNIT", b"V").await;
        assert_eq!(outcome.published, 1);
        let update = updates.recv().await.unwrap();
        assert_eq!(update.attribute, "unit");
        assert!(updates.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_node_state_coerced() {
        let (router, _, mut updates) = router().await;

        router.handle_message("tele/plug/LWT", b"Online").await;
        let update = updates.recv().await.unwrap();
        assert_eq!(update.entity, EntityRef::node("power"));
        assert_eq!(update.attribute, "state");
        assert_eq!(update.value, json!("ready"));
        assert!(update.retained);

        router.handle_message("tele/plug/LWT", b"Rebooting").await;
        assert_eq!(updates.recv().await.unwrap().value, json!("alert"));
    }

    #[tokio::test]
    async fn test_idle_router_ignores_messages() {
        let (mut router, _, mut updates) = router().await;
        router
            .on_connection_state(ConnectionState::Disconnected)
            .await
            .unwrap();

        let outcome = router.handle_message("tele/plug/UNIT", b"V").await;
        assert_eq!(outcome, InboundOutcome::default());
        assert!(updates.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_decode_error_raises_entity_error() {
        let (router, _, _) = router().await;
        let mut signals = router.subscribe_signals();

        let outcome = router.handle_message("tele/plug/SENSOR", b"{broken").await;
        assert_eq!(outcome.failed, 1);

        match signals.recv().await.unwrap() {
            RouterSignal::Error { entity, .. } => assert_eq!(entity.id(), "voltage"),
            other => panic!("unexpected signal {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_command_confirmed_by_state_topic() {
        let (router, transport, _updates) = router().await;
        let entity = EntityRef::property(homie_adapter_core::PropertyKind::Sensor, "power", "state");

        let confirmation = router.begin_command(&entity, "value", b"true").await.unwrap();
        let published = transport.published();
        assert_eq!(published[0].topic, "cmnd/plug/POWER");
        assert_eq!(published[0].payload, "ON");
        assert!(!published[0].retain);

        let waiter = tokio::spawn(confirmation);
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        router.handle_message("stat/plug/POWER", b"ON").await;
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_command_errors() {
        let (router, _, _) = router().await;
        let voltage =
            EntityRef::property(homie_adapter_core::PropertyKind::Sensor, "power", "voltage");
        let missing =
            EntityRef::property(homie_adapter_core::PropertyKind::Sensor, "power", "current");

        assert!(matches!(
            router.begin_command(&voltage, "value", b"1").await,
            Err(BridgeError::NotSettable(_))
        ));
        assert!(matches!(
            router.begin_command(&missing, "value", b"1").await,
            Err(BridgeError::UnknownEntity(_))
        ));
        // other fields resolve immediately without publishing
        router
            .begin_command(&voltage, "unit", b"V")
            .await
            .unwrap()
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirmation_timeout() {
        let (router, _, _) = router().await;
        let router = router.with_confirmation_timeout(Some(Duration::from_secs(2)));
        let entity = EntityRef::property(homie_adapter_core::PropertyKind::Sensor, "power", "state");

        let confirmation = router.begin_command(&entity, "value", b"false").await.unwrap();
        let err = confirmation.await.unwrap_err();
        assert!(matches!(
            err,
            BridgeError::ConfirmationTimeout { timeout, .. } if timeout == Duration::from_secs(2)
        ));
    }

    #[tokio::test]
    async fn test_lagged_listener_fails_instead_of_hanging() {
        let transport = Arc::new(MockTransport::new());
        let (tree, _updates) = RecordingTree::new();
        let mut router = TransformRouter::new(
            assign_rules(&device(), &table()),
            transport,
            Arc::new(tree),
            Pipeline::default(),
            1,
        );
        router
            .on_connection_state(ConnectionState::Connected)
            .await
            .unwrap();
        let entity = EntityRef::property(homie_adapter_core::PropertyKind::Sensor, "power", "state");

        let confirmation = router.begin_command(&entity, "value", b"true").await.unwrap();

        // the reply is pushed out of a one-slot buffer before the listener runs
        router.handle_message("stat/plug/POWER", b"ON").await;
        router.handle_message("tele/plug/UNIT", b"V").await;
        router.handle_message("tele/plug/UNIT", b"V").await;

        let err = confirmation.await.unwrap_err();
        assert!(matches!(err, BridgeError::ConfirmationLagged { missed: 2, .. }));
        assert_eq!(err.error_code(), "CONFIRMATION_LAGGED");
    }
}
