// src/errors.rs

use std::path::PathBuf;

use lapin::Error as LapinError;
use serde_json::Error as SerdeError;
use thiserror::Error;
use tokio::time::error::Elapsed;

/// Errors raised while binding properties and resolving the component registry.
///
/// Every variant is fatal to startup: the resolver never hands out a partial registry.
#[derive(Debug, Error)]
pub enum AutoConfigError {
    #[error("No qualifying component for {0} is defined")]
    NoSuchComponent(String),

    #[error("Bad configuration value for '{key}': '{value}' ({reason})")]
    InvalidConfiguration {
        key: String,
        value: String,
        reason: String,
    },

    #[error("Failed to initialize secure transport: resource '{}' {reason}", path.display())]
    TransportInitialization { path: PathBuf, reason: String },

    #[error("Component name '{0}' is already taken by an explicit definition")]
    DuplicateComponent(String),

    #[error("Definition '{name}' was declared as {expected} but produced {actual}")]
    DefinitionMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("Configuration source error: {0}")]
    ConfigSource(String),
}

impl AutoConfigError {
    pub(crate) fn invalid(key: &str, value: &str, reason: impl Into<String>) -> Self {
        AutoConfigError::InvalidConfiguration {
            key: key.to_string(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn missing_store(path: impl Into<PathBuf>) -> Self {
        AutoConfigError::TransportInitialization {
            path: path.into(),
            reason: "does not exist".to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, AutoConfigError>;

/// Errors from the broker-facing collaborators once the registry is in use.
#[derive(Debug, Error)]
pub enum AmqpError {
    #[error("RabbitMQ connection error: {0}")]
    ConnectionError(String),

    #[error("RabbitMQ channel error: {0}")]
    ChannelError(String),

    #[error("Message serialization error: {0}")]
    SerializationError(#[from] SerdeError),

    #[error("Message conversion error: {0}")]
    ConversionError(String),

    #[error("RabbitMQ publish error: {0}")]
    PublishError(String),

    #[error("RabbitMQ consume error: {0}")]
    ConsumeError(String),

    #[error("RabbitMQ acknowledge error: {0}")]
    AckError(String),

    #[error("Connection timeout: {0}")]
    TimeoutError(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

pub type AmqpResult<T> = std::result::Result<T, AmqpError>;

// Converting from lapin errors
impl From<LapinError> for AmqpError {
    fn from(error: LapinError) -> Self {
        // lapin does not expose a stable kind, so classify on the rendered text
        let error_text = error.to_string();
        let lowered = error_text.to_lowercase();

        if lowered.contains("connection") || lowered.contains("io error") {
            AmqpError::ConnectionError(error_text)
        } else if lowered.contains("channel") {
            AmqpError::ChannelError(error_text)
        } else if lowered.contains("publish") {
            AmqpError::PublishError(error_text)
        } else if lowered.contains("consume") {
            AmqpError::ConsumeError(error_text)
        } else if lowered.contains("ack") || lowered.contains("nack") {
            AmqpError::AckError(error_text)
        } else {
            AmqpError::Unknown(error_text)
        }
    }
}

impl From<Elapsed> for AmqpError {
    fn from(_: Elapsed) -> Self {
        AmqpError::TimeoutError("Connection timed out".to_string())
    }
}
