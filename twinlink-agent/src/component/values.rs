//! Raw desired/config value parsing
//!
//! Desired properties arrive either as JSON scalars or as their string form
//! (`5` and `"5"` both set a gain of 5), so every parser accepts both.

use serde_json::Value;

use crate::error::ComponentError;

fn invalid(name: &str, raw: &Value, expected: &str) -> ComponentError {
    ComponentError::InvalidValue {
        name: name.to_string(),
        reason: format!("expected {}, got {}", expected, raw),
    }
}

pub fn parse_f64(name: &str, raw: &Value) -> Result<f64, ComponentError> {
    match raw {
        Value::Number(n) => n.as_f64().ok_or_else(|| invalid(name, raw, "a number")),
        Value::String(s) => s.trim().parse::<f64>().map_err(|_| invalid(name, raw, "a number")),
        _ => Err(invalid(name, raw, "a number")),
    }
}

pub fn parse_i64(name: &str, raw: &Value) -> Result<i64, ComponentError> {
    match raw {
        Value::Number(n) => n.as_i64().ok_or_else(|| invalid(name, raw, "an integer")),
        Value::String(s) => s.trim().parse::<i64>().map_err(|_| invalid(name, raw, "an integer")),
        _ => Err(invalid(name, raw, "an integer")),
    }
}

pub fn parse_bool(name: &str, raw: &Value) -> Result<bool, ComponentError> {
    match raw {
        Value::Bool(b) => Ok(*b),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" => Ok(true),
            "false" | "0" => Ok(false),
            _ => Err(invalid(name, raw, "a boolean")),
        },
        _ => Err(invalid(name, raw, "a boolean")),
    }
}

pub fn parse_string(name: &str, raw: &Value) -> Result<String, ComponentError> {
    match raw {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        _ => Err(invalid(name, raw, "a string")),
    }
}
