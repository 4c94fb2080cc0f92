//! Homie Adapter Node - MQTT to Homie adapter process
//!
//! This binary:
//! - loads and validates the device configuration file
//! - compiles the transform rules and assigns them to canonical entities
//! - connects to the broker and runs the adapter bridge
//! - maps bridge `error`/`exit` events to logs and the process exit code

mod cli;

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use homie_adapter_bridge::{
    assign_rules, AdapterBridge, BridgeEvent, BridgeHandle, HomieTree, MqttTransport,
    TransformTable, Transport,
};
use homie_adapter_core::{AdapterConfig, AdapterError};

use cli::Args;

/// Exit code for a configuration that failed to load
const EXIT_CODE_BAD_CONFIG: i32 = 1;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // RUST_LOG wins; otherwise --verbose picks the level
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(
        version = homie_adapter_bridge::VERSION,
        config = %args.config.display(),
        "Starting Homie adapter"
    );

    let config = match AdapterConfig::from_path(&args.config) {
        Ok(config) => config,
        Err(e) => {
            report_config_error(&e);
            std::process::exit(EXIT_CODE_BAD_CONFIG);
        }
    };

    let table = match TransformTable::from_config(&config) {
        Ok(table) => table,
        Err(e) if e.is_config_error() => {
            error!(code = e.error_code(), "Invalid transform rules: {}", e);
            std::process::exit(EXIT_CODE_BAD_CONFIG);
        }
        Err(e) => return Err(e).context("compiling transform rules"),
    };
    let entities = assign_rules(&config.device_config, &table);
    info!(
        rules = table.len(),
        entities = entities.len(),
        "Transform rules assigned"
    );

    let settings = args.settings();
    let (transport, transport_events) =
        MqttTransport::connect(&settings.mqtt).context("creating MQTT transport")?;
    let transport: Arc<dyn Transport> = Arc::new(transport);
    let tree = Arc::new(HomieTree::new(Arc::clone(&transport), &settings.bridge));

    let (bridge, handle) = AdapterBridge::new(
        transport,
        transport_events,
        tree,
        entities,
        &settings.bridge,
    );
    let events = handle.subscribe_events();

    tokio::spawn(async move {
        if let Err(e) = bridge.run().await {
            error!("Bridge stopped: {}", e);
        }
    });

    info!(
        base_topic = %settings.bridge.base_topic,
        device = %settings.bridge.device_id,
        broker = %settings.mqtt.uri,
        "Adapter running"
    );

    let code = supervise(handle, events).await;
    std::process::exit(code);
}

fn report_config_error(e: &AdapterError) {
    match e.fields() {
        Some(fields) => {
            let fields: BTreeMap<&str, &str> = fields
                .iter()
                .map(|(field, code)| (field.as_str(), code.as_str()))
                .collect();
            error!(
                code = e.error_code(),
                fields = %serde_json::to_string(&fields).unwrap_or_default(),
                "Invalid device configuration"
            );
        }
        None => error!(code = e.error_code(), "Cannot load device configuration: {}", e),
    }
}

/// Follow bridge events until it exits, forwarding Ctrl-C as a shutdown.
///
/// Returns the process exit code.
async fn supervise(handle: BridgeHandle, mut events: broadcast::Receiver<BridgeEvent>) -> i32 {
    let mut shutting_down = false;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(BridgeEvent::Error { code, message }) => {
                    error!(code, "{}", message);
                }
                Ok(BridgeEvent::Exit { reason, code }) => {
                    info!(code, "Adapter exiting: {}", reason);
                    return code;
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Missed {} bridge events", n);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return if shutting_down { 0 } else { 1 };
                }
            },

            signal = tokio::signal::ctrl_c(), if !shutting_down => {
                if let Err(e) = signal {
                    warn!("Cannot listen for Ctrl-C: {}", e);
                }
                info!("Shutting down adapter");
                shutting_down = true;

                if let Ok(stats) = handle.stats().await {
                    info!(
                        inbound = stats.inbound_messages,
                        published = stats.attributes_published,
                        commands = stats.commands_sent,
                        errors = stats.message_errors,
                        "Final bridge statistics"
                    );
                }
                if handle.shutdown().await.is_err() {
                    return 0;
                }
            }
        }
    }
}
