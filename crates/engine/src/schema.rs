//! Compact JSON-Schema subset validation for workflow input/output schemas.
//!
//! Covers the keywords workflow definitions actually use: `type`,
//! `required`, `properties`, `items`, and `enum`. Unknown keywords are
//! ignored, and a non-object schema accepts anything.

use serde_json::Value;

use weft_domain::{Error, Result};

/// Validate `value` against `schema`. `field` names the root in error
/// messages (e.g. `input`, `output`).
pub fn validate(schema: &Value, value: &Value, field: &str) -> Result<()> {
    let Some(schema) = schema.as_object() else {
        return Ok(());
    };

    if let Some(expected) = schema.get("type").and_then(Value::as_str) {
        if !type_matches(expected, value) {
            return Err(Error::validation(
                field,
                format!("expected {expected}, got {}", type_name(value)),
            ));
        }
    }

    if let Some(allowed) = schema.get("enum").and_then(Value::as_array) {
        if !allowed.contains(value) {
            return Err(Error::validation(field, "value not in enum"));
        }
    }

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for key in required.iter().filter_map(Value::as_str) {
            let present = value
                .as_object()
                .map(|o| o.contains_key(key))
                .unwrap_or(false);
            if !present {
                return Err(Error::validation(
                    format!("{field}.{key}"),
                    "required property missing",
                ));
            }
        }
    }

    if let (Some(props), Some(obj)) = (
        schema.get("properties").and_then(Value::as_object),
        value.as_object(),
    ) {
        for (key, sub_schema) in props {
            if let Some(sub_value) = obj.get(key) {
                validate(sub_schema, sub_value, &format!("{field}.{key}"))?;
            }
        }
    }

    if let (Some(item_schema), Some(items)) = (schema.get("items"), value.as_array()) {
        for (i, item) in items.iter().enumerate() {
            validate(item_schema, item, &format!("{field}[{i}]"))?;
        }
    }

    Ok(())
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "null" => value.is_null(),
        "boolean" => value.is_boolean(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "string" => value.is_string(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        _ => true,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn type_and_required() {
        let schema = json!({
            "type": "object",
            "required": ["question"],
            "properties": { "question": { "type": "string" } }
        });
        assert!(validate(&schema, &json!({ "question": "hi" }), "input").is_ok());

        let err = validate(&schema, &json!({}), "input").unwrap_err();
        assert!(err.to_string().contains("input.question"));

        let err = validate(&schema, &json!({ "question": 4 }), "input").unwrap_err();
        assert!(err.to_string().contains("expected string"));
    }

    #[test]
    fn nested_properties_and_items() {
        let schema = json!({
            "type": "object",
            "properties": {
                "votes": { "type": "array", "items": { "type": "integer" } }
            }
        });
        assert!(validate(&schema, &json!({ "votes": [1, 2] }), "output").is_ok());
        assert!(validate(&schema, &json!({ "votes": [1, "x"] }), "output").is_err());
    }

    #[test]
    fn enum_constraint() {
        let schema = json!({ "enum": ["fast", "slow"] });
        assert!(validate(&schema, &json!("fast"), "mode").is_ok());
        assert!(validate(&schema, &json!("medium"), "mode").is_err());
    }

    #[test]
    fn absent_schema_accepts_everything() {
        assert!(validate(&Value::Null, &json!({ "anything": true }), "input").is_ok());
    }

    #[test]
    fn integer_vs_number() {
        let schema = json!({ "type": "integer" });
        assert!(validate(&schema, &json!(3), "n").is_ok());
        assert!(validate(&schema, &json!(3.5), "n").is_err());
    }
}
