//! Configuration Error Types
//!
//! Specific, actionable error messages for configuration loading and
//! validation failures.

use thiserror::Error;

/// Configuration-related errors with detailed context
#[derive(Debug, Error)]
pub enum ConfigurationError {
    /// A layer could not be read or parsed
    #[error("Failed to load configuration from '{source_name}': {error}")]
    LoadError { source_name: String, error: String },

    /// Layers merged but do not deserialize into the expected shape
    #[error("Configuration does not match the expected schema: {error}")]
    SchemaError { error: String },

    /// Missing required configuration field
    #[error("Missing required configuration field '{field}' in {context}")]
    MissingRequiredField { field: String, context: String },

    /// Invalid configuration value
    #[error("Invalid value '{value}' for field '{field}': {context}")]
    InvalidValue {
        field: String,
        value: String,
        context: String,
    },

    /// Two stages configured to share a queue
    #[error("Queue name '{queue_name}' is used by both {first} and {second}")]
    DuplicateQueue {
        queue_name: String,
        first: String,
        second: String,
    },

    /// Environment override could not be applied
    #[error("Environment override error for key {key}: {reason}")]
    EnvironmentOverrideError { key: String, reason: String },
}

impl ConfigurationError {
    pub fn load_error<S: Into<String>, E: std::fmt::Display>(source_name: S, error: E) -> Self {
        Self::LoadError {
            source_name: source_name.into(),
            error: error.to_string(),
        }
    }

    pub fn schema_error<E: std::fmt::Display>(error: E) -> Self {
        Self::SchemaError {
            error: error.to_string(),
        }
    }

    /// Create a missing required field error
    pub fn missing_required_field<F: Into<String>, C: Into<String>>(field: F, context: C) -> Self {
        Self::MissingRequiredField {
            field: field.into(),
            context: context.into(),
        }
    }

    /// Create an invalid value error
    pub fn invalid_value<F: Into<String>, V: Into<String>, C: Into<String>>(
        field: F,
        value: V,
        context: C,
    ) -> Self {
        Self::InvalidValue {
            field: field.into(),
            value: value.into(),
            context: context.into(),
        }
    }

    pub fn duplicate_queue<Q: Into<String>>(queue_name: Q, first: &str, second: &str) -> Self {
        Self::DuplicateQueue {
            queue_name: queue_name.into(),
            first: first.to_string(),
            second: second.to_string(),
        }
    }
}

impl From<config::ConfigError> for ConfigurationError {
    fn from(error: config::ConfigError) -> Self {
        match error {
            config::ConfigError::Type { .. } | config::ConfigError::Message(_) => {
                Self::schema_error(error)
            }
            config::ConfigError::NotFound(key) => Self::missing_required_field(key, "configuration"),
            other => Self::load_error("configuration", other),
        }
    }
}

pub type ConfigResult<T> = Result<T, ConfigurationError>;
