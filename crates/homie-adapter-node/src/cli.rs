//! Command line and environment settings

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use homie_adapter_bridge::{AdapterSettings, AdapterSettingsBuilder, DEFAULT_BASE_TOPIC};

#[derive(Parser, Debug)]
#[command(name = "homie-adapter-node")]
#[command(about = "Mirror a device's MQTT topics into a Homie device tree")]
pub struct Args {
    /// Device configuration file (extension.transform + deviceConfig)
    #[arg(long, short, env = "CONFIG_PATH", default_value = "/etc/config.device.json")]
    pub config: PathBuf,

    /// Broker URI
    #[arg(long, env = "MQTT_URI", default_value = "mqtt://localhost:1883")]
    pub mqtt_uri: String,

    /// Broker username
    #[arg(long, env = "MQTT_USER")]
    pub mqtt_user: Option<String>,

    /// Broker password
    #[arg(long, env = "MQTT_PASS", hide_env_values = true)]
    pub mqtt_pass: Option<String>,

    /// Canonical device id, the broker username when unset
    #[arg(long, env = "DEVICE_ID")]
    pub device_id: Option<String>,

    /// Human readable device name
    #[arg(long, env = "DEVICE_NAME")]
    pub device_name: Option<String>,

    /// Homie base topic
    #[arg(long, env = "HOMIE_BASE_TOPIC", default_value = DEFAULT_BASE_TOPIC)]
    pub base_topic: String,

    /// Give up on command confirmations after this long (e.g. "5s"); waits forever when unset
    #[arg(long, env = "CONFIRMATION_TIMEOUT", value_parser = humantime::parse_duration)]
    pub confirmation_timeout: Option<Duration>,

    /// Enable verbose logging
    #[arg(long, short, env = "DEBUG")]
    pub verbose: bool,
}

impl Args {
    /// Runtime settings for the transport and the bridge
    pub fn settings(&self) -> AdapterSettings {
        let mut builder = AdapterSettingsBuilder::new()
            .uri(self.mqtt_uri.clone())
            .base_topic(self.base_topic.clone());

        if let Some(id) = self.device_id.as_ref().or(self.mqtt_user.as_ref()) {
            builder = builder.device_id(id.clone());
        }

        if let Some(name) = &self.device_name {
            builder = builder.device_name(name.clone());
        }
        if let Some(timeout) = self.confirmation_timeout {
            builder = builder.confirmation_timeout(timeout);
        }

        let mut settings = builder.build();
        settings.mqtt.username = self.mqtt_user.clone();
        settings.mqtt.password = self.mqtt_pass.clone();
        settings
    }
}
