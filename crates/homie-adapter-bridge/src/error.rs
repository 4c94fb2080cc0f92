//! Error types for adapter bridge operations
//!
//! Configuration failures come from `homie-adapter-core` and are wrapped
//! unchanged. Everything else here happens at runtime: decoding a device
//! payload, talking to the transport, or waiting for a command to be
//! confirmed.

use homie_adapter_core::{AdapterError, ParserKind};
use std::time::Duration;
use thiserror::Error;

/// Main error type for bridge operations
#[derive(Error, Debug)]
pub enum BridgeError {
    // ===== Configuration Errors =====
    /// Configuration rejected at load time
    #[error(transparent)]
    Config(#[from] AdapterError),

    /// Invalid runtime setting
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ===== Pipeline Errors =====
    /// Payload could not be decoded by the rule's parser
    #[error("Failed to decode {parser} payload on '{topic}': {reason}")]
    Decode {
        /// Topic the payload arrived on (or was headed to)
        topic: String,
        /// Parser that failed
        parser: ParserKind,
        /// Decoder message
        reason: String,
    },

    /// A transformer reported failure
    #[error("Transformer failed: {0}")]
    TransformFailed(String),

    /// No parser registered for this kind
    #[error("No parser registered for {0}")]
    ParserNotRegistered(ParserKind),

    // ===== Transport Errors =====
    /// Subscribing to a device topic failed
    #[error("Failed to subscribe to '{topic}': {reason}")]
    SubscribeFailed {
        /// Topic
        topic: String,
        /// Transport message
        reason: String,
    },

    /// Publishing failed
    #[error("Failed to publish to '{topic}': {reason}")]
    PublishFailed {
        /// Topic
        topic: String,
        /// Transport message
        reason: String,
    },

    /// Transport connection failed
    #[error("Connection error: {0}")]
    Connection(String),

    /// Operation needs an active connection
    #[error("Transport is not connected")]
    NotConnected,

    // ===== Command Errors =====
    /// Entity has no settable command rule
    #[error("Entity {0} is not settable")]
    NotSettable(String),

    /// Entity is not part of the device tree
    #[error("Unknown entity: {0}")]
    UnknownEntity(String),

    /// The entity's error signal fired before the confirmation arrived
    #[error("Command on {entity} failed: {reason}")]
    ConfirmationFailed {
        /// Entity the command targeted
        entity: String,
        /// Reason carried by the error signal
        reason: String,
    },

    /// Optional confirmation deadline elapsed
    #[error("No confirmation on '{topic}' after {elapsed}", elapsed = humantime::format_duration(*.timeout))]
    ConfirmationTimeout {
        /// Paired state topic
        topic: String,
        /// Configured deadline
        timeout: Duration,
    },

    /// The confirmation listener fell behind and may have missed its reply
    #[error("Confirmation for {entity} missed {missed} signals")]
    ConfirmationLagged {
        /// Entity the command targeted
        entity: String,
        /// Signals dropped from the listener's buffer
        missed: u64,
    },

    // ===== Bridge Errors =====
    /// Bridge not running
    #[error("Adapter bridge is not running")]
    BridgeNotRunning,

    /// Channel closed
    #[error("Channel closed")]
    ChannelClosed,
}

impl BridgeError {
    /// Check if this error was raised while loading configuration
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            BridgeError::Config(_) | BridgeError::InvalidConfig(_)
        )
    }

    /// Check if this error is bound to a single message and leaves the bridge healthy
    pub fn is_message_error(&self) -> bool {
        matches!(
            self,
            BridgeError::Decode { .. } | BridgeError::TransformFailed(_)
        )
    }

    /// Get an error code for logging
    pub fn error_code(&self) -> &'static str {
        match self {
            BridgeError::Config(err) => err.error_code(),
            BridgeError::InvalidConfig(_) => "INVALID_CONFIG",
            BridgeError::Decode { .. } => "DECODE_ERROR",
            BridgeError::TransformFailed(_) => "TRANSFORM_FAILED",
            BridgeError::ParserNotRegistered(_) => "PARSER_NOT_REGISTERED",
            BridgeError::SubscribeFailed { .. } => "SUBSCRIBE_FAILED",
            BridgeError::PublishFailed { .. } => "PUBLISH_FAILED",
            BridgeError::Connection(_) => "CONNECTION_ERROR",
            BridgeError::NotConnected => "NOT_CONNECTED",
            BridgeError::NotSettable(_) => "NOT_SETTABLE",
            BridgeError::UnknownEntity(_) => "UNKNOWN_ENTITY",
            BridgeError::ConfirmationFailed { .. } => "CONFIRMATION_FAILED",
            BridgeError::ConfirmationTimeout { .. } => "CONFIRMATION_TIMEOUT",
            BridgeError::ConfirmationLagged { .. } => "CONFIRMATION_LAGGED",
            BridgeError::BridgeNotRunning => "BRIDGE_NOT_RUNNING",
            BridgeError::ChannelClosed => "CHANNEL_CLOSED",
        }
    }
}

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for BridgeError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        BridgeError::ChannelClosed
    }
}
