//! How a unit finds the payload inside a producer's response.

use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::api::ApiError;

/// Conventional name of the payload field in API responses.
pub const DATA_FIELD: &str = "data";

/// Strategy for extracting the payload from a raw response.
#[derive(Clone, Default)]
pub enum Envelope {
    /// Use the `data` field of an object response when present, otherwise
    /// the whole response.
    #[default]
    Data,
    /// Use a named field when present, otherwise the whole response.
    Field(String),
    /// The response is the payload.
    Raw,
    Custom(Arc<dyn Fn(Value) -> Value + Send + Sync>),
}

impl Envelope {
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        Envelope::Custom(Arc::new(f))
    }

    pub fn extract(&self, response: Value) -> Value {
        match self {
            Envelope::Data => take_field(response, DATA_FIELD),
            Envelope::Field(name) => take_field(response, name),
            Envelope::Raw => response,
            Envelope::Custom(f) => f(response),
        }
    }
}

fn take_field(response: Value, field: &str) -> Value {
    match response {
        Value::Object(mut map) if map.contains_key(field) => {
            map.remove(field).unwrap_or(Value::Null)
        }
        other => other,
    }
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Envelope::Data => f.write_str("Data"),
            Envelope::Field(name) => f.debug_tuple("Field").field(name).finish(),
            Envelope::Raw => f.write_str("Raw"),
            Envelope::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Decode a payload into the unit's data type.
pub(crate) fn decode<T: DeserializeOwned>(payload: Value) -> Result<T, ApiError> {
    serde_json::from_value(payload)
        .map_err(|e| ApiError::InvalidResponse(format!("Unexpected payload shape: {}", e)))
}
