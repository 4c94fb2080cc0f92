//! Static adapter configuration
//!
//! The configuration has two halves:
//!
//! - `extension.transform` - a dictionary from canonical topic pattern to a
//!   rule with optional `state` (device -> canonical) and `command`
//!   (canonical -> device) flows
//! - `deviceConfig.nodes` - the canonical nodes with their sensors, options
//!   and telemetry items
//!
//! Loading validates the raw JSON first, collecting every failing field into
//! [`AdapterError::WrongConfig`], and only then deserialises into the typed
//! model below.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;

use crate::entity::{EntityRef, PropertyKind};
use crate::error::{AdapterError, ConfigErrorCode, FieldErrors, Result};
use crate::topic::TopicPattern;
use crate::transform::{ParserKind, TransformerSpec};

/// Whole adapter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterConfig {
    /// Transform rules
    pub extension: ExtensionConfig,
    /// Canonical device description
    pub device_config: DeviceConfig,
}

/// Extension block holding the transform dictionary
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtensionConfig {
    /// Pattern -> rule
    #[serde(default)]
    pub transform: BTreeMap<String, RuleDeclaration>,
}

/// One transform rule as declared
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleDeclaration {
    /// Device -> canonical flow
    #[serde(default)]
    pub state: Option<FlowDeclaration>,
    /// Canonical -> device flow
    #[serde(default)]
    pub command: Option<FlowDeclaration>,
}

/// One direction of a rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowDeclaration {
    /// Device topic
    pub topic: String,
    /// Payload parser, PLAIN when absent
    #[serde(default)]
    pub parser: Option<ParserKind>,
    /// Value transformer, identity when absent
    #[serde(default)]
    pub transformer: Option<TransformerSpec>,
}

/// Canonical device description
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Nodes in declaration order
    pub nodes: Vec<NodeDeclaration>,
}

/// A canonical node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDeclaration {
    /// Node id
    pub id: String,
    /// Human readable name
    pub name: String,
    /// Plain sensors
    #[serde(default)]
    pub sensors: Vec<PropertyDeclaration>,
    /// Options
    #[serde(default)]
    pub options: Vec<PropertyDeclaration>,
    /// Telemetry items
    #[serde(default)]
    pub telemetry: Vec<PropertyDeclaration>,
}

impl NodeDeclaration {
    /// Every property with its kind, sensors first, then options, then telemetry
    pub fn properties(&self) -> impl Iterator<Item = (PropertyKind, &PropertyDeclaration)> {
        self.sensors
            .iter()
            .map(|p| (PropertyKind::Sensor, p))
            .chain(self.options.iter().map(|p| (PropertyKind::Option, p)))
            .chain(self.telemetry.iter().map(|p| (PropertyKind::Telemetry, p)))
    }

    /// Find a property by kind and id
    pub fn property(&self, kind: PropertyKind, id: &str) -> Option<&PropertyDeclaration> {
        self.properties()
            .find(|(k, p)| *k == kind && p.id == id)
            .map(|(_, p)| p)
    }
}

/// Property data types allowed by the convention
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    /// Integer
    Integer,
    /// Float
    Float,
    /// Boolean
    Boolean,
    /// String
    String,
    /// Enum
    Enum,
    /// Color
    Color,
}

impl DataType {
    /// Accepted spellings
    pub const NAMES: [&'static str; 6] = ["integer", "float", "boolean", "string", "enum", "color"];
}

/// A sensor, option or telemetry item
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyDeclaration {
    /// Property id
    pub id: String,
    /// Human readable name
    #[serde(default)]
    pub name: Option<String>,
    /// Data type
    #[serde(default)]
    pub data_type: Option<DataType>,
    /// Accepts `set` commands
    #[serde(default, deserialize_with = "flag")]
    pub settable: bool,
    /// Values are published retained
    #[serde(default = "default_retained", deserialize_with = "flag")]
    pub retained: bool,
    /// Unit of measurement
    #[serde(default)]
    pub unit: Option<String>,
}

fn default_retained() -> bool {
    true
}

// Flags arrive either as booleans or as the strings "true"/"false".
fn flag<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Text(String),
    }

    match Flag::deserialize(deserializer)? {
        Flag::Bool(b) => Ok(b),
        Flag::Text(s) => match s.trim() {
            "true" => Ok(true),
            "false" => Ok(false),
            other => Err(serde::de::Error::custom(format!(
                "expected \"true\" or \"false\", got \"{}\"",
                other
            ))),
        },
    }
}

/// A rule whose pattern has been classified
#[derive(Debug, Clone)]
pub struct RuleSpec {
    /// Classified pattern
    pub pattern: TopicPattern,
    /// Device -> canonical flow
    pub state: Option<FlowDeclaration>,
    /// Canonical -> device flow
    pub command: Option<FlowDeclaration>,
}

impl AdapterConfig {
    /// Read, validate and deserialise a JSON configuration file
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let value: Value = serde_json::from_str(&text)?;
        Self::from_value(value)
    }

    /// Validate and deserialise an already parsed JSON document
    pub fn from_value(value: Value) -> Result<Self> {
        let fields = validate(&value);
        if !fields.is_empty() {
            return Err(AdapterError::WrongConfig { fields });
        }
        Ok(serde_json::from_value(value)?)
    }

    /// Classify every rule pattern, in dictionary order
    pub fn rules(&self) -> Result<Vec<RuleSpec>> {
        self.extension
            .transform
            .iter()
            .map(|(pattern, rule)| {
                Ok(RuleSpec {
                    pattern: TopicPattern::parse(pattern)?,
                    state: rule.state.clone(),
                    command: rule.command.clone(),
                })
            })
            .collect()
    }

    /// Find a node by id
    pub fn node(&self, id: &str) -> Option<&NodeDeclaration> {
        self.device_config.nodes.iter().find(|n| n.id == id)
    }

    /// Resolve an entity reference against the device description
    pub fn contains(&self, entity: &EntityRef) -> bool {
        match entity {
            EntityRef::Node { node } => self.node(node).is_some(),
            EntityRef::Property {
                property_kind,
                node,
                property,
            } => self
                .node(node)
                .and_then(|n| n.property(*property_kind, property))
                .is_some(),
        }
    }
}

/// Validate a raw configuration document, returning every failing field
pub fn validate(config: &Value) -> FieldErrors {
    let mut errors = FieldErrors::new();

    let Some(root) = config.as_object() else {
        errors.insert(String::new(), ConfigErrorCode::WrongFormat);
        return errors;
    };

    match root.get("extension") {
        None | Some(Value::Null) => {
            errors.insert("extension".to_string(), ConfigErrorCode::Required);
        }
        Some(Value::Object(extension)) => {
            if let Some(transform) = extension.get("transform") {
                validate_transform_dictionary(transform, &mut errors);
            }
        }
        Some(_) => {
            errors.insert("extension".to_string(), ConfigErrorCode::WrongFormat);
        }
    }

    match root.get("deviceConfig") {
        None | Some(Value::Null) => {
            errors.insert("deviceConfig".to_string(), ConfigErrorCode::Required);
        }
        Some(Value::Object(device)) => validate_device(device, &mut errors),
        Some(_) => {
            errors.insert("deviceConfig".to_string(), ConfigErrorCode::WrongFormat);
        }
    }

    errors
}

fn validate_transform_dictionary(dictionary: &Value, errors: &mut FieldErrors) {
    let Some(rules) = dictionary.as_object() else {
        errors.insert(
            "extension.transform".to_string(),
            ConfigErrorCode::WrongTransportType,
        );
        return;
    };

    for (pattern, rule) in rules {
        if let Some(code) = check_rule(pattern, rule) {
            errors.insert(format!("extension.transform.{}", pattern), code);
        }
    }
}

/// First failing check for one rule, in the order the checks are specified
pub fn check_rule(pattern: &str, rule: &Value) -> Option<ConfigErrorCode> {
    if TopicPattern::parse(pattern).is_err() {
        return Some(ConfigErrorCode::WrongTransportTopic);
    }

    let state = present(rule.get("state"));
    let command = present(rule.get("command"));
    if state.is_none() && command.is_none() {
        return Some(ConfigErrorCode::WrongTransportElement);
    }

    if let Some(state) = state {
        if let Some(code) = check_flow(
            state,
            ConfigErrorCode::StateTopicRequired,
            ConfigErrorCode::StateTransformerIsNotAFunction,
            ConfigErrorCode::NotSupportedStateParserType,
        ) {
            return Some(code);
        }
    }

    if let Some(command) = command {
        if let Some(code) = check_flow(
            command,
            ConfigErrorCode::CommandTopicRequired,
            ConfigErrorCode::CommandTransformerIsNotAFunction,
            ConfigErrorCode::NotSupportedCommandParserType,
        ) {
            return Some(code);
        }
    }

    None
}

fn present(value: Option<&Value>) -> Option<&Value> {
    value.filter(|v| !v.is_null())
}

fn check_flow(
    flow: &Value,
    topic_required: ConfigErrorCode,
    not_a_function: ConfigErrorCode,
    unsupported_parser: ConfigErrorCode,
) -> Option<ConfigErrorCode> {
    let topic = flow.get("topic").and_then(Value::as_str).unwrap_or("");
    if topic.is_empty() {
        return Some(topic_required);
    }

    if let Some(transformer) = present(flow.get("transformer")) {
        if serde_json::from_value::<TransformerSpec>(transformer.clone()).is_err() {
            return Some(not_a_function);
        }
    }

    if let Some(parser) = present(flow.get("parser")) {
        let supported = parser
            .as_str()
            .is_some_and(|p| p.parse::<ParserKind>().is_ok());
        if !supported {
            return Some(unsupported_parser);
        }
    }

    None
}

fn validate_device(device: &Map<String, Value>, errors: &mut FieldErrors) {
    let nodes = match device.get("nodes") {
        Some(Value::Array(nodes)) if !nodes.is_empty() => nodes,
        Some(Value::Array(_)) | None | Some(Value::Null) => {
            errors.insert(
                "deviceConfig.nodes".to_string(),
                ConfigErrorCode::CannotBeEmpty,
            );
            return;
        }
        Some(_) => {
            errors.insert("deviceConfig.nodes".to_string(), ConfigErrorCode::WrongFormat);
            return;
        }
    };

    for (index, node) in nodes.iter().enumerate() {
        let path = format!("deviceConfig.nodes[{}]", index);
        let Some(node) = node.as_object() else {
            errors.insert(path, ConfigErrorCode::WrongFormat);
            continue;
        };

        required_string(node, "id", &path, errors);
        required_string(node, "name", &path, errors);

        for list in ["sensors", "options", "telemetry"] {
            match present(node.get(list)) {
                None => {}
                Some(Value::Array(properties)) => {
                    for (i, property) in properties.iter().enumerate() {
                        validate_property(property, &format!("{}.{}[{}]", path, list, i), errors);
                    }
                }
                Some(_) => {
                    errors.insert(format!("{}.{}", path, list), ConfigErrorCode::WrongFormat);
                }
            }
        }
    }
}

fn validate_property(property: &Value, path: &str, errors: &mut FieldErrors) {
    let Some(property) = property.as_object() else {
        errors.insert(path.to_string(), ConfigErrorCode::WrongFormat);
        return;
    };

    required_string(property, "id", path, errors);

    for field in ["name", "unit"] {
        if let Some(value) = present(property.get(field)) {
            if !value.is_string() {
                errors.insert(format!("{}.{}", path, field), ConfigErrorCode::WrongFormat);
            }
        }
    }

    if let Some(data_type) = present(property.get("dataType")) {
        let allowed = data_type
            .as_str()
            .is_some_and(|t| DataType::NAMES.contains(&t));
        if !allowed {
            errors.insert(
                format!("{}.dataType", path),
                ConfigErrorCode::NotAllowedValue,
            );
        }
    }

    for field in ["settable", "retained"] {
        if let Some(value) = property.get(field) {
            let allowed = match value {
                Value::Bool(_) => true,
                Value::String(s) => s == "true" || s == "false",
                _ => false,
            };
            if !allowed {
                errors.insert(format!("{}.{}", path, field), ConfigErrorCode::NotAllowedValue);
            }
        }
    }
}

fn required_string(object: &Map<String, Value>, field: &str, path: &str, errors: &mut FieldErrors) {
    match object.get(field) {
        Some(Value::String(s)) if !s.trim().is_empty() => {}
        Some(Value::String(_)) | None | Some(Value::Null) => {
            errors.insert(format!("{}.{}", path, field), ConfigErrorCode::Required);
        }
        Some(_) => {
            errors.insert(format!("{}.{}", path, field), ConfigErrorCode::WrongFormat);
        }
    }
}
