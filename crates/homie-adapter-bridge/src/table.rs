//! Transform table and rule ownership
//!
//! The table holds every compiled rule keyed by its canonical pattern. Rules
//! are handed out to canonical entities by a plain string prefix test, see
//! [`owns`].
//!
//! The prefix test is deliberately naive: a sensor `temp/x` also owns every
//! rule of a sibling sensor `temp/x2`. Keep entity ids prefix-free when they
//! share a node.

use homie_adapter_core::{
    AdapterConfig, DeviceConfig, EntityRef, NodeDeclaration, PropertyDeclaration, PropertyKind,
    RuleSpec, TopicPattern,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{BridgeError, Result};
use crate::pipeline::{Flow, Transformer};

/// Direction of a rule half
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Device -> canonical
    State,
    /// Canonical -> device
    Command,
}

/// A compiled transform rule
#[derive(Debug, Clone)]
pub struct TransformRule {
    /// Canonical pattern the rule is keyed by
    pub pattern: TopicPattern,
    /// Device -> canonical flow
    pub state: Option<Flow>,
    /// Canonical -> device flow
    pub command: Option<Flow>,
}

impl TransformRule {
    /// Rule without flows
    pub fn new(pattern: TopicPattern) -> Self {
        Self {
            pattern,
            state: None,
            command: None,
        }
    }

    /// Classify a pattern string and start a rule for it
    pub fn parse(pattern: &str) -> Result<Self> {
        Ok(Self::new(TopicPattern::parse(pattern)?))
    }

    /// Set the state flow
    pub fn with_state(mut self, flow: Flow) -> Self {
        self.state = Some(flow);
        self
    }

    /// Set the command flow
    pub fn with_command(mut self, flow: Flow) -> Self {
        self.command = Some(flow);
        self
    }

    /// Compile a classified rule from configuration
    pub fn from_spec(spec: &RuleSpec) -> Self {
        Self {
            pattern: spec.pattern.clone(),
            state: spec.state.as_ref().map(Flow::from_declaration),
            command: spec.command.as_ref().map(Flow::from_declaration),
        }
    }

    /// Pattern text
    pub fn pattern_str(&self) -> &str {
        self.pattern.as_str()
    }

    /// True when neither half is present
    pub fn is_empty(&self) -> bool {
        self.state.is_none() && self.command.is_none()
    }

    /// Flow for a direction
    pub fn flow(&self, direction: Direction) -> Option<&Flow> {
        match direction {
            Direction::State => self.state.as_ref(),
            Direction::Command => self.command.as_ref(),
        }
    }

    fn flow_mut(&mut self, direction: Direction) -> Option<&mut Flow> {
        match direction {
            Direction::State => self.state.as_mut(),
            Direction::Command => self.command.as_mut(),
        }
    }
}

/// Every rule of the adapter, keyed by pattern
#[derive(Debug, Clone, Default)]
pub struct TransformTable {
    rules: BTreeMap<String, Arc<TransformRule>>,
}

impl TransformTable {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile the transform dictionary of a configuration
    pub fn from_config(config: &AdapterConfig) -> Result<Self> {
        let mut table = Self::new();
        for spec in config.rules()? {
            table.insert(TransformRule::from_spec(&spec));
        }
        debug!(rules = table.len(), "transform table compiled");
        Ok(table)
    }

    /// Insert a rule, replacing any rule with the same pattern
    pub fn insert(&mut self, rule: TransformRule) -> Option<Arc<TransformRule>> {
        self.rules
            .insert(rule.pattern_str().to_string(), Arc::new(rule))
    }

    /// Replace the transformer of one half of an existing rule
    pub fn replace_transformer(
        &mut self,
        pattern: &str,
        direction: Direction,
        transformer: Arc<dyn Transformer>,
    ) -> Result<()> {
        let rule = self.rules.get_mut(pattern).ok_or_else(|| {
            BridgeError::InvalidConfig(format!("no transform rule for '{}'", pattern))
        })?;
        let flow = Arc::make_mut(rule).flow_mut(direction).ok_or_else(|| {
            BridgeError::InvalidConfig(format!(
                "transform rule '{}' has no {:?} flow",
                pattern, direction
            ))
        })?;
        flow.transformer = transformer;
        Ok(())
    }

    /// Look up a rule
    pub fn get(&self, pattern: &str) -> Option<&Arc<TransformRule>> {
        self.rules.get(pattern)
    }

    /// Iterate rules in pattern order
    pub fn iter(&self) -> impl Iterator<Item = &Arc<TransformRule>> {
        self.rules.values()
    }

    /// Number of rules
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// True when the table holds no rule
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Rules owned by an ownership prefix, in pattern order
    pub fn owned_by(&self, prefix: &str) -> Vec<Arc<TransformRule>> {
        self.rules
            .iter()
            .filter(|(pattern, _)| owns(prefix, pattern))
            .map(|(_, rule)| Arc::clone(rule))
            .collect()
    }
}

/// Ownership test between an entity prefix and a rule pattern.
///
/// This is a string prefix test, not a path match: `temp/x` owns `temp/x2`.
pub fn owns(prefix: &str, pattern: &str) -> bool {
    pattern == prefix || pattern.starts_with(prefix)
}

/// A canonical entity together with the rules it owns
#[derive(Debug, Clone)]
pub struct EntityDescriptor {
    /// Entity address
    pub entity: EntityRef,
    /// Accepts `set` commands
    pub settable: bool,
    /// Values are published retained
    pub retained: bool,
    /// Owned rules
    pub rules: Vec<Arc<TransformRule>>,
}

impl EntityDescriptor {
    /// Descriptor for a node, which owns only its `$state` rules
    pub fn node(node: &NodeDeclaration, table: &TransformTable) -> Self {
        Self::with_rules(EntityRef::node(&node.id), false, true, table)
    }

    /// Descriptor for a sensor, option or telemetry item
    pub fn property(
        kind: PropertyKind,
        node: &NodeDeclaration,
        property: &PropertyDeclaration,
        table: &TransformTable,
    ) -> Self {
        Self::with_rules(
            EntityRef::property(kind, &node.id, &property.id),
            property.settable,
            property.retained,
            table,
        )
    }

    /// Descriptor for an arbitrary entity
    pub fn with_rules(
        entity: EntityRef,
        settable: bool,
        retained: bool,
        table: &TransformTable,
    ) -> Self {
        let rules = table.owned_by(&entity.ownership_prefix());
        Self {
            entity,
            settable,
            retained,
            rules,
        }
    }

    /// Own id
    pub fn id(&self) -> &str {
        self.entity.id()
    }

    /// Parent node id, `None` for nodes
    pub fn parent_id(&self) -> Option<&str> {
        self.entity.parent_id()
    }
}

/// Hand every rule of the table to the entities that own it.
///
/// Entities come out node first, then its sensors, options and telemetry,
/// in declaration order.
pub fn assign_rules(device: &DeviceConfig, table: &TransformTable) -> Vec<EntityDescriptor> {
    let mut entities = Vec::new();

    for node in &device.nodes {
        entities.push(EntityDescriptor::node(node, table));
        for (kind, property) in node.properties() {
            entities.push(EntityDescriptor::property(kind, node, property, table));
        }
    }

    for rule in table.iter() {
        let owners = entities
            .iter()
            .filter(|e| owns(&e.entity.ownership_prefix(), rule.pattern_str()))
            .count();
        match owners {
            0 => warn!(pattern = %rule.pattern_str(), "transform rule matches no entity"),
            1 => {}
            n => warn!(
                pattern = %rule.pattern_str(),
                owners = n,
                "transform rule owned by several entities"
            ),
        }
    }

    entities
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Identity;
    use serde_json::json;

    fn table(patterns: &[&str]) -> TransformTable {
        let mut table = TransformTable::new();
        for pattern in patterns {
            table.insert(TransformRule::parse(pattern).unwrap().with_state(Flow::new("t")));
        }
        table
    }

    #[test]
    fn test_owns() {
        assert!(owns("temp/outside", "temp/outside"));
        assert!(owns("temp/outside", "temp/outside/$unit"));
        assert!(!owns("temp/outside", "temp/inside"));
        assert!(owns("temp/x", "temp/x2"));
        assert!(!owns("temp/$state", "temp/$name"));
    }

    #[test]
    fn test_assign_rules() {
        let device: DeviceConfig = serde_json::from_value(json!({
            "nodes": [
                {
                    "id": "temp",
                    "name": "Temperature",
                    "sensors": [ { "id": "outside" } ],
                    "options": [ { "id": "availability", "settable": true } ],
                    "telemetry": [ { "id": "inside" } ]
                }
            ]
        }))
        .unwrap();
        let table = table(&[
            "temp/$state",
            "temp/outside",
            "temp/outside/$unit",
            "temp/$options/availability",
            "temp/$telemetry/inside/$unit",
        ]);

        let entities = assign_rules(&device, &table);
        assert_eq!(entities.len(), 4);

        let patterns = |i: usize| -> Vec<&str> {
            entities[i].rules.iter().map(|r| r.pattern_str()).collect()
        };
        assert_eq!(entities[0].entity, EntityRef::node("temp"));
        assert_eq!(patterns(0), vec!["temp/$state"]);
        assert_eq!(patterns(1), vec!["temp/outside", "temp/outside/$unit"]);
        assert_eq!(patterns(2), vec!["temp/$options/availability"]);
        assert!(entities[2].settable);
        assert_eq!(patterns(3), vec!["temp/$telemetry/inside/$unit"]);
    }

    #[test]
    fn test_prefix_collision_is_reproduced() {
        let device: DeviceConfig = serde_json::from_value(json!({
            "nodes": [
                { "id": "temp", "name": "t", "sensors": [ { "id": "x" }, { "id": "x2" } ] }
            ]
        }))
        .unwrap();
        let table = table(&["temp/x", "temp/x2"]);

        let entities = assign_rules(&device, &table);
        assert_eq!(entities[1].rules.len(), 2);
        assert_eq!(entities[2].rules.len(), 1);
    }

    #[test]
    fn test_replace_transformer() {
        let mut table = table(&["temp/outside"]);
        table
            .replace_transformer("temp/outside", Direction::State, Arc::new(Identity))
            .unwrap();
        assert!(table
            .replace_transformer("temp/outside", Direction::Command, Arc::new(Identity))
            .is_err());
        assert!(table
            .replace_transformer("temp/missing", Direction::State, Arc::new(Identity))
            .is_err());
    }

    #[test]
    fn test_from_config_rejects_bad_pattern() {
        let config: AdapterConfig = serde_json::from_value(json!({
            "extension": { "transform": { "Bad/Pattern": { "state": { "topic": "t" } } } },
            "deviceConfig": { "nodes": [ { "id": "a", "name": "a" } ] }
        }))
        .unwrap();
        let err = TransformTable::from_config(&config).unwrap_err();
        assert_eq!(err.error_code(), "WRONG_TRANSPORT_TOPIC");
    }
}
