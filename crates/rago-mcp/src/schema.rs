//! Argument validation against a tool's declared input schema
//!
//! Covers the subset servers actually publish: `type` (single or list),
//! `required`, `properties`, `enum`, `items` and `additionalProperties`.

use rago_core::{Component, RagoError, RagoResult};
use serde_json::Value;

/// Validates `args` and returns non-fatal findings (unknown fields)
pub fn validate_arguments(tool: &str, schema: &Value, args: &Value) -> RagoResult<Vec<String>> {
    let mut warnings = Vec::new();
    check(schema, args, "", &mut warnings).map_err(|message| {
        RagoError::invalid_arguments(format!("arguments for '{}': {}", tool, message))
            .at(Component::Tools, "call_tool")
    })?;
    Ok(warnings)
}

fn check(schema: &Value, value: &Value, path: &str, warnings: &mut Vec<String>) -> Result<(), String> {
    let Value::Object(schema) = schema else {
        return Ok(());
    };
    let here = if path.is_empty() { "arguments" } else { path };

    if let Some(expected) = schema.get("type") {
        if !type_matches(expected, value) {
            return Err(format!("{} must be {}, got {}", here, describe(expected), kind_of(value)));
        }
    }

    if let Some(Value::Array(allowed)) = schema.get("enum") {
        if !allowed.contains(value) {
            return Err(format!("{} must be one of {}", here, Value::Array(allowed.clone())));
        }
    }

    match value {
        Value::Object(fields) => {
            if let Some(Value::Array(required)) = schema.get("required") {
                for name in required.iter().filter_map(|r| r.as_str()) {
                    if !fields.contains_key(name) {
                        return Err(format!("missing required field '{}'", join(path, name)));
                    }
                }
            }

            let properties = schema.get("properties").and_then(|p| p.as_object());
            let closed = matches!(schema.get("additionalProperties"), Some(Value::Bool(false)));
            for (name, field) in fields {
                match properties.and_then(|p| p.get(name)) {
                    Some(sub) => check(sub, field, &join(path, name), warnings)?,
                    None if closed => {
                        return Err(format!("unexpected field '{}'", join(path, name)));
                    }
                    None if properties.is_some() => {
                        warnings.push(format!("unknown field '{}'", join(path, name)));
                    }
                    None => {}
                }
            }
        }
        Value::Array(items) => {
            if let Some(item_schema) = schema.get("items") {
                for (i, item) in items.iter().enumerate() {
                    check(item_schema, item, &format!("{}[{}]", here, i), warnings)?;
                }
            }
        }
        _ => {}
    }
    Ok(())
}

fn join(path: &str, name: &str) -> String {
    if path.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", path, name)
    }
}

fn type_matches(expected: &Value, value: &Value) -> bool {
    match expected {
        Value::String(t) => single_type_matches(t, value),
        Value::Array(types) => types
            .iter()
            .filter_map(|t| t.as_str())
            .any(|t| single_type_matches(t, value)),
        _ => true,
    }
}

fn single_type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        "number" => value.is_number(),
        "integer" => {
            value.is_i64()
                || value.is_u64()
                || value.as_f64().map_or(false, |f| f.fract() == 0.0)
        }
        _ => true,
    }
}

fn describe(expected: &Value) -> String {
    match expected {
        Value::String(t) => t.clone(),
        other => other.to_string(),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
