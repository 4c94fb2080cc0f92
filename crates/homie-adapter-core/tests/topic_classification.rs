//! Classification grid and configuration loading

use homie_adapter_core::{
    AdapterConfig, ConfigErrorCode, EntityRef, ParserKind, PropertyKind, TopicPattern,
};
use serde_json::json;
use std::path::PathBuf;

const LEVELS: [&str; 4] = ["node", "item", "prop", "unit"];

/// Build a pattern of `depth` levels, prefixing the sigil where `mask` has a bit set.
fn pattern(depth: usize, mask: u32) -> String {
    LEVELS[..depth]
        .iter()
        .enumerate()
        .map(|(i, level)| {
            if mask & (1 << i) != 0 {
                format!("${}", level)
            } else {
                level.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn expected(depth: usize, mask: u32) -> Option<&'static str> {
    // bit i set => level i is an attribute
    match (depth, mask) {
        (2, 0b00) => Some("sensor"),
        (2, 0b10) => Some("node-attribute"),
        (3, 0b010) => Some("typed-property"),
        (3, 0b100) => Some("sensor-attribute"),
        (4, 0b1010) => Some("typed-property-attribute"),
        _ => None,
    }
}

#[test]
fn test_every_sigil_placement() {
    for depth in 2..=4 {
        for mask in 0..(1u32 << depth) {
            let raw = pattern(depth, mask);
            let parsed = TopicPattern::parse(&raw);
            match expected(depth, mask) {
                Some(label) => {
                    let pattern = parsed.unwrap_or_else(|e| panic!("{}: {}", raw, e));
                    assert_eq!(pattern.shape().label(), label, "{}", raw);
                    assert_eq!(pattern.shape().node(), "node");
                }
                None => {
                    let err = parsed.expect_err(&raw);
                    assert_eq!(err.error_code(), "WRONG_TRANSPORT_TOPIC", "{}", raw);
                }
            }
        }
    }
}

#[test]
fn test_depth_out_of_range() {
    for raw in ["node", "node/item/prop/unit/extra", ""] {
        assert!(TopicPattern::parse(raw).is_err(), "{}", raw);
    }
}

#[test]
fn test_attribute_names_strip_sigil() {
    let pattern = TopicPattern::parse("node/$telemetry/signal/$unit").unwrap();
    assert_eq!(pattern.shape().attribute(), Some("unit"));
    assert!(!pattern.shape().is_property_value());

    let pattern = TopicPattern::parse("node/$options/led").unwrap();
    assert_eq!(pattern.shape().attribute(), None);
    assert!(pattern.shape().is_property_value());
}

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

#[test]
fn test_load_fixture_from_disk() {
    let config = AdapterConfig::from_path(fixture("tasmota.json")).unwrap();

    let plug = config.node("plug").unwrap();
    assert_eq!(plug.properties().count(), 3);
    assert!(plug.property(PropertyKind::Option, "led").unwrap().settable);
    assert!(!plug.property(PropertyKind::Option, "led").unwrap().retained);

    let rules = config.rules().unwrap();
    let patterns: Vec<&str> = rules.iter().map(|r| r.pattern.as_str()).collect();
    assert_eq!(
        patterns,
        vec![
            "plug/$options/led",
            "plug/$state",
            "plug/$telemetry/signal",
            "plug/power",
            "plug/power/$unit",
        ]
    );

    let power = rules.iter().find(|r| r.pattern.as_str() == "plug/power").unwrap();
    let state = power.state.as_ref().unwrap();
    assert_eq!(state.parser, Some(ParserKind::Json));
    assert_eq!(power.command.as_ref().unwrap().topic, "cmnd/tasmota/POWER");

    assert!(config.contains(&EntityRef::property(PropertyKind::Telemetry, "plug", "signal")));
    assert!(!config.contains(&EntityRef::node("socket")));
}

#[test]
fn test_missing_file_is_io_error() {
    let err = AdapterConfig::from_path(fixture("absent.json")).unwrap_err();
    assert!(err.fields().is_none());
}

#[test]
fn test_invalid_document_reports_fields() {
    let err = AdapterConfig::from_value(json!({
        "extension": {
            "transform": {
                "plug": { "state": { "topic": "x" } },
                "plug/power": { "command": { "topic": "" } }
            }
        },
        "deviceConfig": { "nodes": [] }
    }))
    .unwrap_err();

    assert_eq!(err.error_code(), "WRONG_CONFIG");
    let fields = err.fields().unwrap();
    assert_eq!(
        fields.get("extension.transform.plug"),
        Some(&ConfigErrorCode::WrongTransportTopic)
    );
    assert!(fields.contains_key("extension.transform.plug/power"));
}
