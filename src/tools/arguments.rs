//! Typed access to tool call arguments.
//!
//! Arguments reach a tool only after schema validation, so an object-typed
//! tool always sees a JSON object here.

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::ParleyError;

/// Validated arguments of one tool call.
#[derive(Debug, Clone)]
pub struct ToolArguments {
    value: Value,
}

impl ToolArguments {
    pub fn new(value: Value) -> Self {
        Self { value }
    }

    pub fn raw(&self) -> &Value {
        &self.value
    }

    /// A required string field. Blank strings count as missing.
    pub fn get_str(&self, key: &str) -> Result<&str, ParleyError> {
        self.get_str_opt(key)
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| ParleyError::InvalidArgument(format!("'{key}' must be a non-empty string")))
    }

    pub fn get_str_opt(&self, key: &str) -> Option<&str> {
        self.value.get(key)?.as_str()
    }

    /// Decode the whole argument object into `T`.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, ParleyError> {
        T::deserialize(&self.value)
            .map_err(|e| ParleyError::InvalidArgument(format!("arguments do not fit: {e}")))
    }
}
