//! JSON-schema sanitization and structural comparison shared by the runner
//! (structured-output/strict-mode request shaping, output validation) and
//! the deployment resolver (compatibility checks, spec §4.6, §8 property 9).

use serde_json::{Map, Value};

/// Reshape `schema` for vendors whose "strict" structured-output mode
/// requires every property to be listed as required and rejects additional
/// properties (spec §4.1: adapters that need a stricter schema than the
/// caller supplied reshape it rather than rejecting the request).
pub fn sanitize_for_strict_mode(schema: &mut Value) {
    let Some(object) = schema.as_object_mut() else { return };

    if object.get("type").and_then(Value::as_str) == Some("object") {
        object.insert("additionalProperties".to_string(), Value::Bool(false));

        if let Some(properties) = object.get("properties").and_then(Value::as_object).cloned() {
            let required: Vec<Value> = properties.keys().map(|key| Value::String(key.clone())).collect();
            object.insert("required".to_string(), Value::Array(required));
        }
    }

    if let Some(properties) = object.get_mut("properties").and_then(Value::as_object_mut) {
        for value in properties.values_mut() {
            sanitize_for_strict_mode(value);
        }
    }

    if let Some(items) = object.get_mut("items") {
        sanitize_for_strict_mode(items);
    }
}

/// Remove `null` leaves that the schema doesn't declare as nullable, so a
/// vendor's habit of emitting an explicit `null` for an omitted optional
/// field doesn't fail validation against a schema that only lists, say,
/// `"type": "string"` (spec §4.3 step 4: "sanitise empty/null values against
/// the schema").
pub fn sanitize_nulls(value: &mut Value, schema: &Value) {
    match value {
        Value::Object(fields) => {
            let Some(properties) = schema.get("properties").and_then(Value::as_object) else { return };
            let nullable_absent: Vec<String> = fields
                .iter()
                .filter(|(key, v)| {
                    v.is_null() && properties.get(*key).is_some_and(|prop| !declared_types_allow_null(prop))
                })
                .map(|(key, _)| key.clone())
                .collect();

            for key in nullable_absent {
                fields.remove(&key);
            }

            for (key, v) in fields.iter_mut() {
                if let Some(prop_schema) = properties.get(key) {
                    sanitize_nulls(v, prop_schema);
                }
            }
        }
        Value::Array(items) => {
            if let Some(item_schema) = schema.get("items") {
                for item in items.iter_mut() {
                    sanitize_nulls(item, item_schema);
                }
            }
        }
        _ => {}
    }
}

fn declared_types(schema: &Value) -> Vec<String> {
    match schema.get("type") {
        Some(Value::String(t)) => vec![t.clone()],
        Some(Value::Array(types)) => types.iter().filter_map(|t| t.as_str().map(str::to_string)).collect(),
        _ => vec![],
    }
}

fn declared_types_allow_null(schema: &Value) -> bool {
    declared_types(schema).iter().any(|t| t == "null")
}

/// Minimal structural validation: type, required properties, nested
/// object/array shape. Enough to catch a generation that doesn't match the
/// requested schema (spec §4.3 step 4: "validate; on failure raise
/// InvalidGeneration").
pub fn validate(value: &Value, schema: &Value) -> std::result::Result<(), String> {
    let types = declared_types(schema);
    if !types.is_empty() && !types.iter().any(|t| value_matches_type(value, t)) {
        return Err(format!("expected type {types:?}, got {value}"));
    }

    if let (Value::Object(fields), Some(properties)) = (value, schema.get("properties").and_then(Value::as_object)) {
        if let Some(required) = schema.get("required").and_then(Value::as_array) {
            for key in required {
                let Some(key) = key.as_str() else { continue };
                if !fields.contains_key(key) {
                    return Err(format!("missing required property '{key}'"));
                }
            }
        }

        for (key, field_value) in fields {
            if let Some(prop_schema) = properties.get(key) {
                validate(field_value, prop_schema)?;
            }
        }
    }

    if let (Value::Array(items), Some(item_schema)) = (value, schema.get("items")) {
        for item in items {
            validate(item, item_schema)?;
        }
    }

    Ok(())
}

fn value_matches_type(value: &Value, expected: &str) -> bool {
    match expected {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        _ => true,
    }
}

/// Whether two optional schemas are structurally compatible for a
/// deployment update (spec §4.6): both absent, or both present with the
/// same shape. Field ordering and descriptions don't matter, only the
/// declared type/required/properties/items structure.
pub fn schemas_structurally_compatible(existing: Option<&Value>, incoming: Option<&Value>) -> bool {
    match (existing, incoming) {
        (None, None) => true,
        (None, Some(_)) | (Some(_), None) => false,
        (Some(a), Some(b)) => structurally_equal(a, b),
    }
}

fn structurally_equal(a: &Value, b: &Value) -> bool {
    if declared_types(a) != declared_types(b) {
        return false;
    }

    match (a.get("properties"), b.get("properties")) {
        (None, None) => {}
        (Some(a_props), Some(b_props)) => {
            let (Some(a_props), Some(b_props)) = (a_props.as_object(), b_props.as_object()) else { return false };
            if a_props.len() != b_props.len() {
                return false;
            }
            for (key, a_schema) in a_props {
                let Some(b_schema) = b_props.get(key) else { return false };
                if !structurally_equal(a_schema, b_schema) {
                    return false;
                }
            }
        }
        _ => return false,
    }

    match (a.get("items"), b.get("items")) {
        (None, None) => true,
        (Some(a_items), Some(b_items)) => structurally_equal(a_items, b_items),
        _ => false,
    }
}

/// Sort a property map the way [`sanitize_for_strict_mode`] reads it, used
/// only by tests that need deterministic iteration order.
#[cfg(test)]
fn sorted_keys(map: &Map<String, Value>) -> Vec<&String> {
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();
    keys
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn strict_mode_forces_additional_properties_false_and_all_required() {
        let mut schema = json!({"type": "object", "properties": {"x": {"type": "integer"}, "y": {"type": "string"}}});
        sanitize_for_strict_mode(&mut schema);

        assert_eq!(schema["additionalProperties"], false);
        assert_eq!(sorted_keys(schema["properties"].as_object().unwrap()), vec!["x", "y"]);
        assert_eq!(schema["required"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn sanitize_nulls_drops_non_nullable_null_fields() {
        let schema = json!({"type": "object", "properties": {"x": {"type": "integer"}}});
        let mut value = json!({"x": null});
        sanitize_nulls(&mut value, &schema);
        assert!(!value.as_object().unwrap().contains_key("x"));
    }

    #[test]
    fn sanitize_nulls_keeps_nullable_fields() {
        let schema = json!({"type": "object", "properties": {"x": {"type": ["integer", "null"]}}});
        let mut value = json!({"x": null});
        sanitize_nulls(&mut value, &schema);
        assert!(value.as_object().unwrap().contains_key("x"));
    }

    #[test]
    fn validate_rejects_missing_required_property() {
        let schema = json!({"type": "object", "properties": {"x": {"type": "integer"}}, "required": ["x"]});
        assert!(validate(&json!({}), &schema).is_err());
        assert!(validate(&json!({"x": 1}), &schema).is_ok());
    }

    #[test]
    fn deployment_compatibility_rejects_presence_mismatch() {
        let schema = json!({"type": "object", "properties": {"x": {"type": "integer"}}});
        assert!(!schemas_structurally_compatible(None, Some(&schema)));
        assert!(!schemas_structurally_compatible(Some(&schema), None));
        assert!(schemas_structurally_compatible(None, None));
    }

    #[test]
    fn deployment_compatibility_rejects_different_shapes() {
        let a = json!({"type": "object", "properties": {"x": {"type": "integer"}}});
        let b = json!({"type": "object", "properties": {"x": {"type": "string"}}});
        assert!(!schemas_structurally_compatible(Some(&a), Some(&b)));

        let c = json!({"type": "object", "properties": {"x": {"type": "integer"}}});
        assert!(schemas_structurally_compatible(Some(&a), Some(&c)));
    }
}
