//! Topic pattern classification
//!
//! A transform rule is keyed by a canonical topic pattern such as
//! `temp/outside-temperature/$unit`. The pattern is split on `/` and each
//! segment is either a plain identifier or an attribute marked with the
//! [`ATTRIBUTE_SIGIL`]. Only these arrangements are legal:
//!
//! | segments | layout                         | shape                            |
//! |----------|--------------------------------|----------------------------------|
//! | 2        | `node/sensor`                  | [`TopicShape::Sensor`]           |
//! | 2        | `node/$attr`                   | [`TopicShape::NodeAttribute`]    |
//! | 3        | `node/$type/property`          | [`TopicShape::TypedProperty`]    |
//! | 3        | `node/sensor/$attr`            | [`TopicShape::SensorAttribute`]  |
//! | 4        | `node/$type/property/$attr`    | [`TopicShape::TypedPropertyAttribute`] |
//!
//! Anything else is rejected with [`AdapterError::InvalidTopic`].

use std::fmt;
use std::str::FromStr;

use crate::error::{AdapterError, Result};

/// Marker prefix for attribute segments
pub const ATTRIBUTE_SIGIL: char = '$';

/// Topic level separator
pub const TOPIC_SEPARATOR: char = '/';

/// A single classified path segment
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Segment {
    /// Plain entity identifier
    Id(String),
    /// Attribute name, stored without the sigil
    Attribute(String),
}

impl Segment {
    /// Validate and classify one raw segment
    pub fn parse(raw: &str) -> Option<Self> {
        if !is_valid_topic_level(raw) {
            return None;
        }
        match raw.strip_prefix(ATTRIBUTE_SIGIL) {
            Some(name) => Some(Segment::Attribute(name.to_string())),
            None => Some(Segment::Id(raw.to_string())),
        }
    }

    /// Name without sigil
    pub fn name(&self) -> &str {
        match self {
            Segment::Id(name) | Segment::Attribute(name) => name,
        }
    }

    /// True when the segment carried the sigil
    pub fn is_attribute(&self) -> bool {
        matches!(self, Segment::Attribute(_))
    }
}

/// Check one topic level: optional sigil, then `[a-z0-9-]+`, and no hyphen
/// at either end of the raw level.
pub fn is_valid_topic_level(level: &str) -> bool {
    if level.starts_with('-') || level.ends_with('-') {
        return false;
    }
    let body = level.strip_prefix(ATTRIBUTE_SIGIL).unwrap_or(level);
    !body.is_empty()
        && body
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
}

/// Canonical entity addressed by a pattern
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TopicShape {
    /// `node/$attr` - an attribute of the node itself
    NodeAttribute {
        /// Node id
        node: String,
        /// Attribute name
        attribute: String,
    },
    /// `node/sensor` - a plain sensor value
    Sensor {
        /// Node id
        node: String,
        /// Sensor id
        sensor: String,
    },
    /// `node/$type/property` - an option or telemetry value
    TypedProperty {
        /// Node id
        node: String,
        /// Property type without sigil (`options`, `telemetry`)
        property_type: String,
        /// Property id
        property: String,
    },
    /// `node/sensor/$attr` - an attribute of a sensor
    SensorAttribute {
        /// Node id
        node: String,
        /// Sensor id
        sensor: String,
        /// Attribute name
        attribute: String,
    },
    /// `node/$type/property/$attr` - an attribute of an option or telemetry item
    TypedPropertyAttribute {
        /// Node id
        node: String,
        /// Property type without sigil
        property_type: String,
        /// Property id
        property: String,
        /// Attribute name
        attribute: String,
    },
}

impl TopicShape {
    /// Node id the pattern starts with
    pub fn node(&self) -> &str {
        match self {
            TopicShape::NodeAttribute { node, .. }
            | TopicShape::Sensor { node, .. }
            | TopicShape::TypedProperty { node, .. }
            | TopicShape::SensorAttribute { node, .. }
            | TopicShape::TypedPropertyAttribute { node, .. } => node,
        }
    }

    /// Trailing attribute, if the pattern addresses one
    pub fn attribute(&self) -> Option<&str> {
        match self {
            TopicShape::NodeAttribute { attribute, .. }
            | TopicShape::SensorAttribute { attribute, .. }
            | TopicShape::TypedPropertyAttribute { attribute, .. } => Some(attribute),
            TopicShape::Sensor { .. } | TopicShape::TypedProperty { .. } => None,
        }
    }

    /// True for shapes that carry a property's value (and may take commands)
    pub fn is_property_value(&self) -> bool {
        matches!(
            self,
            TopicShape::Sensor { .. } | TopicShape::TypedProperty { .. }
        )
    }

    /// Short label for logging
    pub fn label(&self) -> &'static str {
        match self {
            TopicShape::NodeAttribute { .. } => "node-attribute",
            TopicShape::Sensor { .. } => "sensor",
            TopicShape::TypedProperty { .. } => "typed-property",
            TopicShape::SensorAttribute { .. } => "sensor-attribute",
            TopicShape::TypedPropertyAttribute { .. } => "typed-property-attribute",
        }
    }
}

/// A parsed, immutable canonical topic pattern
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicPattern {
    raw: String,
    segments: Vec<Segment>,
    shape: TopicShape,
}

impl TopicPattern {
    /// Parse and classify a pattern string
    pub fn parse(pattern: &str) -> Result<Self> {
        let invalid = |reason: &str| AdapterError::InvalidTopic {
            pattern: pattern.to_string(),
            reason: reason.to_string(),
        };

        let levels: Vec<&str> = pattern.split(TOPIC_SEPARATOR).collect();
        if !(2..=4).contains(&levels.len()) {
            return Err(invalid("expected 2 to 4 topic levels"));
        }

        let mut segments = Vec::with_capacity(levels.len());
        for level in &levels {
            let segment = Segment::parse(level)
                .ok_or_else(|| invalid(&format!("invalid topic level '{}'", level)))?;
            segments.push(segment);
        }

        let shape = classify(&segments).ok_or_else(|| invalid("attribute markers misplaced"))?;

        Ok(Self {
            raw: pattern.to_string(),
            segments,
            shape,
        })
    }

    /// The pattern as written
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Classified segments
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Entity shape addressed by this pattern
    pub fn shape(&self) -> &TopicShape {
        &self.shape
    }

    /// Number of topic levels (2..=4)
    pub fn depth(&self) -> usize {
        self.segments.len()
    }
}

fn classify(segments: &[Segment]) -> Option<TopicShape> {
    use Segment::{Attribute as A, Id};

    match segments {
        [Id(node), Id(sensor)] => Some(TopicShape::Sensor {
            node: node.clone(),
            sensor: sensor.clone(),
        }),
        [Id(node), A(attribute)] => Some(TopicShape::NodeAttribute {
            node: node.clone(),
            attribute: attribute.clone(),
        }),
        [Id(node), A(property_type), Id(property)] => Some(TopicShape::TypedProperty {
            node: node.clone(),
            property_type: property_type.clone(),
            property: property.clone(),
        }),
        [Id(node), Id(sensor), A(attribute)] => Some(TopicShape::SensorAttribute {
            node: node.clone(),
            sensor: sensor.clone(),
            attribute: attribute.clone(),
        }),
        [Id(node), A(property_type), Id(property), A(attribute)] => {
            Some(TopicShape::TypedPropertyAttribute {
                node: node.clone(),
                property_type: property_type.clone(),
                property: property.clone(),
                attribute: attribute.clone(),
            })
        }
        _ => None,
    }
}

impl FromStr for TopicPattern {
    type Err = AdapterError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
