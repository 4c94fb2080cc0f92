//! Canonical entity addressing
//!
//! The canonical tree is made of nodes, and each node owns sensors, options
//! and telemetry items. The adapter addresses all of them uniformly through
//! [`EntityRef`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of property hanging off a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyKind {
    /// Plain sensor, addressed as `node/sensor`
    Sensor,
    /// Option, addressed as `node/$options/id`
    Option,
    /// Telemetry item, addressed as `node/$telemetry/id`
    Telemetry,
}

impl PropertyKind {
    /// Type segment (without sigil) used in canonical topics
    pub fn type_segment(&self) -> Option<&'static str> {
        match self {
            PropertyKind::Sensor => None,
            PropertyKind::Option => Some("options"),
            PropertyKind::Telemetry => Some("telemetry"),
        }
    }

    /// Inverse of [`PropertyKind::type_segment`]
    pub fn from_type_segment(segment: &str) -> Option<Self> {
        match segment {
            "options" => Some(PropertyKind::Option),
            "telemetry" => Some(PropertyKind::Telemetry),
            _ => None,
        }
    }
}

impl fmt::Display for PropertyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyKind::Sensor => write!(f, "sensor"),
            PropertyKind::Option => write!(f, "option"),
            PropertyKind::Telemetry => write!(f, "telemetry"),
        }
    }
}

/// Reference to one canonical entity
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum EntityRef {
    /// A node
    Node {
        /// Node id
        node: String,
    },
    /// A sensor, option or telemetry item of a node
    Property {
        /// Property kind
        property_kind: PropertyKind,
        /// Parent node id
        node: String,
        /// Property id
        property: String,
    },
}

impl EntityRef {
    /// Reference a node
    pub fn node(node: impl Into<String>) -> Self {
        EntityRef::Node { node: node.into() }
    }

    /// Reference a property of a node
    pub fn property(
        property_kind: PropertyKind,
        node: impl Into<String>,
        property: impl Into<String>,
    ) -> Self {
        EntityRef::Property {
            property_kind,
            node: node.into(),
            property: property.into(),
        }
    }

    /// Own id (node id for nodes, property id otherwise)
    pub fn id(&self) -> &str {
        match self {
            EntityRef::Node { node } => node,
            EntityRef::Property { property, .. } => property,
        }
    }

    /// Id of the node this entity belongs to
    pub fn node_id(&self) -> &str {
        match self {
            EntityRef::Node { node } | EntityRef::Property { node, .. } => node,
        }
    }

    /// Parent node id, `None` for nodes
    pub fn parent_id(&self) -> Option<&str> {
        match self {
            EntityRef::Node { .. } => None,
            EntityRef::Property { node, .. } => Some(node),
        }
    }

    /// Property kind, `None` for nodes
    pub fn property_kind(&self) -> Option<PropertyKind> {
        match self {
            EntityRef::Node { .. } => None,
            EntityRef::Property { property_kind, .. } => Some(*property_kind),
        }
    }

    /// Prefix a rule pattern must start with to belong to this entity.
    ///
    /// Nodes only own their `$state` attribute.
    pub fn ownership_prefix(&self) -> String {
        match self {
            EntityRef::Node { node } => format!("{}/$state", node),
            EntityRef::Property {
                property_kind,
                node,
                property,
            } => match property_kind.type_segment() {
                Some(segment) => format!("{}/${}/{}", node, segment, property),
                None => format!("{}/{}", node, property),
            },
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityRef::Node { node } => write!(f, "node:{}", node),
            EntityRef::Property {
                property_kind,
                node,
                property,
            } => write!(f, "{}:{}/{}", property_kind, node, property),
        }
    }
}

/// Node lifecycle states allowed by the convention
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    /// Starting up
    Init,
    /// Operational
    Ready,
    /// Cleanly disconnected
    Disconnected,
    /// Sleeping
    Sleeping,
    /// Unexpectedly gone
    Lost,
    /// Something is wrong
    Alert,
}

impl NodeState {
    /// Every allowed state
    pub const ALL: [NodeState; 6] = [
        NodeState::Init,
        NodeState::Ready,
        NodeState::Disconnected,
        NodeState::Sleeping,
        NodeState::Lost,
        NodeState::Alert,
    ];

    /// Wire representation
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::Init => "init",
            NodeState::Ready => "ready",
            NodeState::Disconnected => "disconnected",
            NodeState::Sleeping => "sleeping",
            NodeState::Lost => "lost",
            NodeState::Alert => "alert",
        }
    }

    /// Map any transformer output onto an allowed state, `alert` otherwise
    pub fn coerce(value: &str) -> NodeState {
        value.parse().unwrap_or(NodeState::Alert)
    }
}

impl FromStr for NodeState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        NodeState::ALL
            .iter()
            .find(|state| state.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown node state '{}'", s))
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ownership_prefixes() {
        assert_eq!(EntityRef::node("camera").ownership_prefix(), "camera/$state");
        assert_eq!(
            EntityRef::property(PropertyKind::Sensor, "temp", "outside-temperature")
                .ownership_prefix(),
            "temp/outside-temperature"
        );
        assert_eq!(
            EntityRef::property(PropertyKind::Option, "temp", "availability").ownership_prefix(),
            "temp/$options/availability"
        );
        assert_eq!(
            EntityRef::property(PropertyKind::Telemetry, "temp", "inside").ownership_prefix(),
            "temp/$telemetry/inside"
        );
    }

    #[test]
    fn test_entity_ids() {
        let node = EntityRef::node("leds");
        assert_eq!(node.id(), "leds");
        assert_eq!(node.parent_id(), None);

        let sensor = EntityRef::property(PropertyKind::Sensor, "leds", "blue");
        assert_eq!(sensor.id(), "blue");
        assert_eq!(sensor.node_id(), "leds");
        assert_eq!(sensor.parent_id(), Some("leds"));
        assert_eq!(sensor.to_string(), "sensor:leds/blue");
    }

    #[test]
    fn test_node_state_coercion() {
        assert_eq!(NodeState::coerce("ready"), NodeState::Ready);
        assert_eq!(NodeState::coerce("lost"), NodeState::Lost);
        assert_eq!(NodeState::coerce("on"), NodeState::Alert);
        assert_eq!(NodeState::coerce(""), NodeState::Alert);
        assert_eq!(NodeState::coerce("READY"), NodeState::Alert);
    }

    #[test]
    fn test_type_segments() {
        assert_eq!(PropertyKind::from_type_segment("options"), Some(PropertyKind::Option));
        assert_eq!(
            PropertyKind::from_type_segment("telemetry"),
            Some(PropertyKind::Telemetry)
        );
        assert_eq!(PropertyKind::from_type_segment("state"), None);
        assert_eq!(PropertyKind::Sensor.type_segment(), None);
    }
}
