//! Homie Adapter Core - configuration model and topic classification
//!
//! This crate holds the transport-free half of the adapter: everything that
//! can be decided once, at configuration-load time, before a single message
//! is exchanged.
//!
//! # Modules
//!
//! - [`topic`] - canonical topic pattern classifier
//! - [`entity`] - node / sensor / option / telemetry addressing and node states
//! - [`transform`] - parser kinds and declarative transformers
//! - [`config`] - static configuration model and validation
//! - [`error`] - configuration error taxonomy
//!
//! # Example
//!
//! ```rust
//! use homie_adapter_core::topic::{TopicPattern, TopicShape};
//!
//! let pattern = TopicPattern::parse("temp/outside-temperature/$unit").unwrap();
//! assert!(matches!(pattern.shape(), TopicShape::SensorAttribute { .. }));
//! assert_eq!(pattern.shape().attribute(), Some("unit"));
//! ```

pub mod config;
pub mod entity;
pub mod error;
pub mod topic;
pub mod transform;

pub use config::{
    AdapterConfig, DataType, DeviceConfig, ExtensionConfig, FlowDeclaration, NodeDeclaration,
    PropertyDeclaration, RuleDeclaration, RuleSpec,
};
pub use entity::{EntityRef, NodeState, PropertyKind};
pub use error::{AdapterError, ConfigErrorCode, FieldErrors, Result};
pub use topic::{Segment, TopicPattern, TopicShape, ATTRIBUTE_SIGIL};
pub use transform::{render_value, ParserKind, TransformerSpec};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
