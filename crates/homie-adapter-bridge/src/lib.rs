//! Homie Adapter Bridge - runtime topic transformation
//!
//! This crate runs the transform rules compiled from an adapter
//! configuration against a live publish/subscribe transport, mirroring an
//! arbitrary device topic layout into a Homie canonical tree and turning
//! canonical `set` requests back into device commands.
//!
//! # Architecture
//!
//! The bridge operates in four layers:
//!
//! 1. **Transport** - MQTT connection delivering connect/disconnect/message events
//! 2. **Pipeline** - per-rule payload parsing and value transformation
//! 3. **Router** - bindings between device topics and canonical entities
//! 4. **Bridge** - the service loop, handle and lifecycle events
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use homie_adapter_bridge::{
//!     assign_rules, AdapterBridge, AdapterSettings, HomieTree, MqttTransport, TransformTable,
//! };
//! use homie_adapter_core::AdapterConfig;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = AdapterConfig::from_path("config.device.json")?;
//!     let settings = AdapterSettings::default();
//!
//!     let table = TransformTable::from_config(&config)?;
//!     let entities = assign_rules(&config.device_config, &table);
//!
//!     let (transport, events) = MqttTransport::connect(&settings.mqtt)?;
//!     let transport = std::sync::Arc::new(transport);
//!     let tree = std::sync::Arc::new(HomieTree::new(transport.clone(), &settings.bridge));
//!
//!     let (bridge, _handle) =
//!         AdapterBridge::new(transport, events, tree, entities, &settings.bridge);
//!     bridge.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Features
//!
//! - `mqtt` - MQTT transport on `rumqttc` (default)
//!
//! # Message Flow
//!
//! ## Device → canonical
//!
//! 1. Transport delivers a message on a subscribed state topic
//! 2. Router looks up every binding for the topic
//! 3. Pipeline parses the payload and runs the transformer
//! 4. Node states are coerced to an allowed state
//! 5. CanonicalTree publishes the attribute, retained
//!
//! ## Canonical → device
//!
//! 1. A `.../set` message (or `BridgeHandle::set`) reaches the bridge
//! 2. Router runs the command pipeline on the requested value
//! 3. Transport publishes the result to the device command topic
//! 4. The command resolves on the next non-empty message on the paired
//!    state topic, or fails on the entity's error signal

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod config;
pub mod error;
pub mod pipeline;
pub mod table;
pub mod transport;
pub mod tree;

pub mod bridge;
pub mod router;

pub mod test_utils;

pub use config::{
    AdapterSettings, AdapterSettingsBuilder, BridgeConfig, BrokerEndpoint, MqttConfig,
};
pub use error::{BridgeError, Result};
pub use pipeline::{
    coerce_node_state, from_async_fn, from_fn, Flow, Identity, JsonParser, PayloadParser,
    Pipeline, PlainParser, ParserTable, Transformer,
};
pub use table::{assign_rules, owns, Direction, EntityDescriptor, TransformRule, TransformTable};
pub use transport::{ConnectionState, Transport, TransportEvent};
pub use tree::{CanonicalTree, HomieTree, SetRequest, STATE_ATTRIBUTE, VALUE_ATTRIBUTE};

#[cfg(feature = "mqtt")]
pub use transport::MqttTransport;

pub use bridge::{AdapterBridge, BridgeCommand, BridgeEvent, BridgeHandle, BridgeStats};
pub use router::{
    BindingTarget, Confirmation, InboundOutcome, RouterSignal, RouterState, TransformRouter,
};

pub use test_utils::{AttributeUpdate, MockTransport, PublishedMessage, RecordingTree};

pub use config::{DEFAULT_BASE_TOPIC, DEFAULT_MQTT_PORT};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
