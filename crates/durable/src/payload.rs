//! Durable representation of step inputs, outputs and errors
//!
//! Payloads are stored as JSON (JSONB in PostgreSQL). Readers tolerate schema
//! evolution: unknown fields are ignored and missing fields fall back to their
//! defaults, so records written by an older or newer engine still load.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

/// Error converting between typed values and payloads
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    /// Value could not be encoded
    #[error("failed to encode payload: {0}")]
    Encode(String),

    /// Stored payload does not match the requested type
    #[error("failed to decode payload: {0}")]
    Decode(String),
}

/// Opaque JSON document handed between steps
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(Value);

impl Payload {
    /// Wrap a raw JSON value
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    /// The empty payload
    pub fn null() -> Self {
        Self(Value::Null)
    }

    /// Encode a typed value
    pub fn encode<T: Serialize>(value: &T) -> Result<Self, PayloadError> {
        serde_json::to_value(value)
            .map(Self)
            .map_err(|e| PayloadError::Encode(e.to_string()))
    }

    /// Decode into a typed value
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, PayloadError> {
        T::deserialize(&self.0).map_err(|e| PayloadError::Decode(e.to_string()))
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, PayloadError> {
        serde_json::to_vec(&self.0).map_err(|e| PayloadError::Encode(e.to_string()))
    }

    /// Parse from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PayloadError> {
        serde_json::from_slice(bytes)
            .map(Self)
            .map_err(|e| PayloadError::Decode(e.to_string()))
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    pub fn is_null(&self) -> bool {
        self.0.is_null()
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

impl From<Payload> for Value {
    fn from(payload: Payload) -> Self {
        payload.0
    }
}

/// Persisted description of a failed step attempt
///
/// Stored on the failing `StepRecord` and, for FAILED instances, on the
/// instance itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorInfo {
    /// Human readable message
    pub message: String,

    /// Error type/code for programmatic handling
    pub error_type: Option<String>,

    /// Whether the attempt was classified as retryable
    pub retryable: bool,

    /// Step that produced the error
    pub step_name: Option<String>,

    /// Attempt that produced the error (1-based)
    pub attempt: Option<u32>,

    /// Additional error details
    pub details: Option<Value>,
}

impl ErrorInfo {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    pub fn at_step(mut self, step_name: impl Into<String>, attempt: u32) -> Self {
        self.step_name = Some(step_name.into());
        self.attempt = Some(attempt);
        self
    }

    /// Parse a stored error, tolerating older or newer shapes
    pub fn from_value(value: Value) -> Result<Self, PayloadError> {
        match value {
            Value::String(message) => Ok(Self::new(message)),
            other => serde_json::from_value(other).map_err(|e| PayloadError::Decode(e.to_string())),
        }
    }

    pub fn to_value(&self) -> Result<Value, PayloadError> {
        serde_json::to_value(self).map_err(|e| PayloadError::Encode(e.to_string()))
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.error_type {
            Some(error_type) => write!(f, "{}: {}", error_type, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}
