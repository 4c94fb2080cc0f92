//! Canonical tree collaborator
//!
//! The router never builds canonical topics itself. It writes attribute
//! values through [`CanonicalTree`] and the bridge asks the tree which
//! topics carry `set` requests.
//!
//! [`HomieTree`] lays entities out the Homie way under
//! `{base}/{device}/`:
//!
//! ```text
//! $name                               device name, when configured
//! {node}/$state
//! {node}/{sensor}                     value
//! {node}/{sensor}/$unit               attribute
//! {node}/$options/{id}[/$attr]
//! {node}/$telemetry/{id}[/$attr]
//! {node}/{sensor}/set                 command
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use homie_adapter_core::{render_value, EntityRef, PropertyKind, ATTRIBUTE_SIGIL};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, trace};

use crate::config::BridgeConfig;
use crate::error::Result;
use crate::transport::Transport;

/// Attribute carrying a property's value
pub const VALUE_ATTRIBUTE: &str = "value";

/// Attribute carrying a node's lifecycle state
pub const STATE_ATTRIBUTE: &str = "state";

const SET_SUFFIX: &str = "set";

/// A `set` request addressed to an entity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetRequest {
    /// Target entity
    pub entity: EntityRef,
    /// Field being set, [`VALUE_ATTRIBUTE`] for the value itself
    pub field: String,
}

/// Writer for the canonical attribute tree
#[async_trait]
pub trait CanonicalTree: Send + Sync {
    /// Publish one attribute of an entity
    async fn publish_attribute(
        &self,
        entity: &EntityRef,
        attribute: &str,
        value: &Value,
        retained: bool,
    ) -> Result<()>;

    /// Topic on which `set` requests for an entity's value arrive
    fn set_topic(&self, entity: &EntityRef) -> Option<String>;

    /// Resolve a received topic to a `set` request
    fn parse_set_topic(&self, topic: &str) -> Option<SetRequest>;

    /// Publish device-level attributes, called on every connect
    async fn announce(&self) -> Result<()> {
        Ok(())
    }
}

/// Homie topic layout over a transport
pub struct HomieTree {
    transport: Arc<dyn Transport>,
    device_topic: String,
    device_name: Option<String>,
}

impl HomieTree {
    /// Create a tree rooted at `{base_topic}/{device_id}`
    pub fn new(transport: Arc<dyn Transport>, config: &BridgeConfig) -> Self {
        Self {
            transport,
            device_topic: format!("{}/{}", config.base_topic, config.device_id),
            device_name: config.device_name.clone(),
        }
    }

    /// Root topic of the device
    pub fn device_topic(&self) -> &str {
        &self.device_topic
    }

    /// Topic of an entity, without attribute
    pub fn entity_topic(&self, entity: &EntityRef) -> String {
        match entity {
            EntityRef::Node { node } => format!("{}/{}", self.device_topic, node),
            EntityRef::Property {
                property_kind,
                node,
                property,
            } => match property_kind.type_segment() {
                Some(segment) => format!(
                    "{}/{}/{}{}/{}",
                    self.device_topic, node, ATTRIBUTE_SIGIL, segment, property
                ),
                None => format!("{}/{}/{}", self.device_topic, node, property),
            },
        }
    }

    /// Topic of one attribute of an entity
    pub fn attribute_topic(&self, entity: &EntityRef, attribute: &str) -> String {
        let base = self.entity_topic(entity);
        match entity {
            EntityRef::Property { .. } if attribute == VALUE_ATTRIBUTE => base,
            _ => format!("{}/{}{}", base, ATTRIBUTE_SIGIL, attribute),
        }
    }
}

#[async_trait]
impl CanonicalTree for HomieTree {
    async fn publish_attribute(
        &self,
        entity: &EntityRef,
        attribute: &str,
        value: &Value,
        retained: bool,
    ) -> Result<()> {
        let topic = self.attribute_topic(entity, attribute);
        let payload = render_value(value);
        trace!(topic = %topic, payload = %payload, "publishing canonical attribute");
        self.transport
            .publish(&topic, Bytes::from(payload), retained)
            .await
    }

    async fn announce(&self) -> Result<()> {
        let Some(name) = &self.device_name else {
            return Ok(());
        };
        let topic = format!("{}/{}name", self.device_topic, ATTRIBUTE_SIGIL);
        debug!(topic = %topic, name = %name, "publishing device name");
        self.transport
            .publish(&topic, Bytes::from(name.clone()), true)
            .await
    }

    fn set_topic(&self, entity: &EntityRef) -> Option<String> {
        match entity {
            EntityRef::Node { .. } => None,
            EntityRef::Property { .. } => {
                Some(format!("{}/{}", self.entity_topic(entity), SET_SUFFIX))
            }
        }
    }

    fn parse_set_topic(&self, topic: &str) -> Option<SetRequest> {
        let rest = topic
            .strip_prefix(self.device_topic.as_str())?
            .strip_prefix('/')?
            .strip_suffix(SET_SUFFIX)?
            .strip_suffix('/')?;
        let levels: Vec<&str> = rest.split('/').collect();

        let attribute = |level: &str| level.strip_prefix(ATTRIBUTE_SIGIL).map(str::to_string);
        let typed = |level: &str| attribute(level).and_then(|t| PropertyKind::from_type_segment(&t));

        let (entity, field) = match levels.as_slice() {
            [node, sensor] if attribute(*sensor).is_none() => (
                EntityRef::property(PropertyKind::Sensor, *node, *sensor),
                VALUE_ATTRIBUTE.to_string(),
            ),
            [node, sensor, attr] if attribute(*sensor).is_none() => (
                EntityRef::property(PropertyKind::Sensor, *node, *sensor),
                attribute(*attr)?,
            ),
            [node, kind, property] => (
                EntityRef::property(typed(*kind)?, *node, *property),
                VALUE_ATTRIBUTE.to_string(),
            ),
            [node, kind, property, attr] => (
                EntityRef::property(typed(*kind)?, *node, *property),
                attribute(*attr)?,
            ),
            _ => return None,
        };

        Some(SetRequest { entity, field })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockTransport;
    use serde_json::json;

    fn tree() -> (HomieTree, Arc<MockTransport>) {
        let transport = Arc::new(MockTransport::new());
        let config = BridgeConfig {
            device_id: "tasmota".to_string(),
            ..Default::default()
        };
        (HomieTree::new(transport.clone(), &config), transport)
    }

    #[test]
    fn test_attribute_topics() {
        let (tree, _) = tree();
        let node = EntityRef::node("power");
        let sensor = EntityRef::property(PropertyKind::Sensor, "power", "state");
        let option = EntityRef::property(PropertyKind::Option, "power", "mode");

        assert_eq!(tree.attribute_topic(&node, "state"), "homie/tasmota/power/$state");
        assert_eq!(tree.attribute_topic(&sensor, "value"), "homie/tasmota/power/state");
        assert_eq!(tree.attribute_topic(&sensor, "unit"), "homie/tasmota/power/state/$unit");
        assert_eq!(
            tree.attribute_topic(&option, "value"),
            "homie/tasmota/power/$options/mode"
        );
        assert_eq!(tree.set_topic(&node), None);
        assert_eq!(
            tree.set_topic(&option).as_deref(),
            Some("homie/tasmota/power/$options/mode/set")
        );
    }

    #[test]
    fn test_parse_set_topic() {
        let (tree, _) = tree();

        let request = tree.parse_set_topic("homie/tasmota/power/state/set").unwrap();
        assert_eq!(
            request.entity,
            EntityRef::property(PropertyKind::Sensor, "power", "state")
        );
        assert_eq!(request.field, "value");

        let request = tree
            .parse_set_topic("homie/tasmota/power/$telemetry/signal/$unit/set")
            .unwrap();
        assert_eq!(
            request.entity,
            EntityRef::property(PropertyKind::Telemetry, "power", "signal")
        );
        assert_eq!(request.field, "unit");

        assert!(tree.parse_set_topic("homie/tasmota/power/state").is_none());
        assert!(tree.parse_set_topic("homie/other/power/state/set").is_none());
        assert!(tree.parse_set_topic("homie/tasmota/power/$unknown/x/set").is_none());
        assert!(tree.parse_set_topic("homie/tasmota/power/set").is_none());
    }

    #[tokio::test]
    async fn test_publish_attribute() {
        let (tree, transport) = tree();
        let sensor = EntityRef::property(PropertyKind::Sensor, "power", "state");

        tree.publish_attribute(&sensor, VALUE_ATTRIBUTE, &json!(true), true)
            .await
            .unwrap();

        let published = transport.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, "homie/tasmota/power/state");
        assert_eq!(published[0].payload, "true");
        assert!(published[0].retain);
    }

    #[tokio::test]
    async fn test_announce_device_name() {
        let transport = Arc::new(MockTransport::new());
        let config = BridgeConfig {
            device_id: "tasmota".to_string(),
            device_name: Some("Kitchen plug".to_string()),
            ..Default::default()
        };
        let named = HomieTree::new(transport.clone(), &config);
        named.announce().await.unwrap();

        let published = transport.published_to("homie/tasmota/$name");
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].payload, "Kitchen plug");
        assert!(published[0].retain);

        // nothing to announce without a name
        let (unnamed, transport) = tree();
        unnamed.announce().await.unwrap();
        assert!(transport.published().is_empty());
    }
}
