//! Error types for adapter configuration
//!
//! Everything in this module is a load-time failure: a configuration that
//! produces one of these errors never reaches the runtime bridge.

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

/// Configuration error codes reported per field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigErrorCode {
    /// Transform dictionary is not an object
    WrongTransportType,
    /// Transform key is not a valid topic pattern
    WrongTransportTopic,
    /// Rule has neither a state nor a command half
    WrongTransportElement,
    /// State half has no topic
    StateTopicRequired,
    /// Command half has no topic
    CommandTopicRequired,
    /// State transformer is not a recognised transformer
    StateTransformerIsNotAFunction,
    /// Command transformer is not a recognised transformer
    CommandTransformerIsNotAFunction,
    /// State parser kind is unsupported
    NotSupportedStateParserType,
    /// Command parser kind is unsupported
    NotSupportedCommandParserType,
    /// Required field is missing
    Required,
    /// List must contain at least one element
    CannotBeEmpty,
    /// Value is not one of the allowed choices
    NotAllowedValue,
    /// Value has the wrong type
    WrongFormat,
}

impl ConfigErrorCode {
    /// Stable code string
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigErrorCode::WrongTransportType => "WRONG_TRANSPORT_TYPE",
            ConfigErrorCode::WrongTransportTopic => "WRONG_TRANSPORT_TOPIC",
            ConfigErrorCode::WrongTransportElement => "WRONG_TRANSPORT_ELEMENT",
            ConfigErrorCode::StateTopicRequired => "STATE_TOPIC_REQUIRED",
            ConfigErrorCode::CommandTopicRequired => "COMMAND_TOPIC_REQUIRED",
            ConfigErrorCode::StateTransformerIsNotAFunction => "STATE_TRANSFORMER_IS_NOT_A_FUNCTION",
            ConfigErrorCode::CommandTransformerIsNotAFunction => {
                "COMMAND_TRANSFORMER_IS_NOT_A_FUNCTION"
            }
            ConfigErrorCode::NotSupportedStateParserType => "NOT_SUPPORTED_STATE_PARSER_TYPE",
            ConfigErrorCode::NotSupportedCommandParserType => "NOT_SUPPORTED_COMMAND_PARSER_TYPE",
            ConfigErrorCode::Required => "REQUIRED",
            ConfigErrorCode::CannotBeEmpty => "CANNOT_BE_EMPTY",
            ConfigErrorCode::NotAllowedValue => "NOT_ALLOWED_VALUE",
            ConfigErrorCode::WrongFormat => "FORMAT_ERROR",
        }
    }
}

impl fmt::Display for ConfigErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Field path -> error code, ordered for stable reporting
pub type FieldErrors = BTreeMap<String, ConfigErrorCode>;

/// Main error type for adapter configuration
#[derive(Error, Debug)]
pub enum AdapterError {
    /// Topic pattern failed classification
    #[error("Invalid topic pattern '{pattern}': {reason}")]
    InvalidTopic {
        /// The offending pattern
        pattern: String,
        /// Why it was rejected
        reason: String,
    },

    /// Parser kind is not one of PLAIN/JSON
    #[error("Unsupported parser kind: {0}")]
    UnsupportedParser(String),

    /// Structured validation failure over the whole configuration
    #[error("Wrong config: {}", format_fields(.fields))]
    WrongConfig {
        /// Every failing field with its code
        fields: FieldErrors,
    },

    /// Configuration could not be deserialised
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// IO error wrapper
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn format_fields(fields: &FieldErrors) -> String {
    fields
        .iter()
        .map(|(field, code)| format!("{}={}", field, code))
        .collect::<Vec<_>>()
        .join(", ")
}

impl AdapterError {
    /// Get an error code for logging
    pub fn error_code(&self) -> &'static str {
        match self {
            AdapterError::InvalidTopic { .. } => "WRONG_TRANSPORT_TOPIC",
            AdapterError::UnsupportedParser(_) => "NOT_SUPPORTED_PARSER_TYPE",
            AdapterError::WrongConfig { .. } => "WRONG_CONFIG",
            AdapterError::Deserialization(_) => "DESERIALIZATION_ERROR",
            AdapterError::Io(_) => "IO_ERROR",
        }
    }

    /// Field list for structured reports, empty for non-validation errors
    pub fn fields(&self) -> Option<&FieldErrors> {
        match self {
            AdapterError::WrongConfig { fields } => Some(fields),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for AdapterError {
    fn from(err: serde_json::Error) -> Self {
        AdapterError::Deserialization(err.to_string())
    }
}

/// Result type alias for configuration operations
pub type Result<T> = std::result::Result<T, AdapterError>;
