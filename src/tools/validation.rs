//! Check tool call arguments against a tool's JSON Schema before invoking it.

use serde_json::Value;

use crate::error::ParleyError;

/// Validate model-supplied arguments against a JSON Schema.
///
/// Top-level only: object shape, required keys, declared property types,
/// `enum` membership and `additionalProperties: false`. The first violation
/// is reported as [`ParleyError::InvalidArgument`].
pub fn validate_arguments(args: &Value, schema: &Value) -> Result<(), ParleyError> {
    check(args, schema).map_err(ParleyError::InvalidArgument)
}

fn check(args: &Value, schema: &Value) -> Result<(), String> {
    let expects_object = schema.get("type").and_then(Value::as_str) == Some("object");
    let Some(obj) = args.as_object() else {
        if expects_object {
            return Err(format!("expected object arguments, got {}", json_type_name(args)));
        }
        return Ok(());
    };

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        if let Some(missing) = required
            .iter()
            .filter_map(Value::as_str)
            .find(|name| !obj.contains_key(*name))
        {
            return Err(format!("missing required field '{missing}'"));
        }
    }

    let properties = schema.get("properties").and_then(Value::as_object);
    let closed = schema.get("additionalProperties") == Some(&Value::Bool(false));

    for (key, value) in obj {
        let Some(prop) = properties.and_then(|p| p.get(key)) else {
            if closed {
                return Err(format!("unexpected field '{key}'"));
            }
            continue;
        };
        if let Some(expected) = prop.get("type").and_then(Value::as_str) {
            if !value_matches_type(value, expected) {
                return Err(format!(
                    "field '{key}' expected type '{expected}', got {}",
                    json_type_name(value)
                ));
            }
        }
        if let Some(allowed) = prop.get("enum").and_then(Value::as_array) {
            if !allowed.contains(value) {
                return Err(format!("field '{key}' is not one of the allowed values"));
            }
        }
    }

    Ok(())
}

fn value_matches_type(value: &Value, expected: &str) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
