//! Prompt templating and schema inference (spec §4.3, §9 "Template
//! rendering + schema inference"). Rendering uses `minijinja`, the same
//! templating crate this retrieval pack's other gateways reach for;
//! `schema_of` is a hand-rolled structural inferrer over `serde_json::Value`
//! rather than a derive, since the variable tree is dynamic input, not a
//! Rust type.

use minijinja::Environment;
use serde_json::{Map, Value, json};

use crate::error::{GatewayError, Result};

/// Render `template` substituting `variables` (spec §4.3 step 1: "render
/// Version.prompt as a template substituting input.variables").
pub fn render(template: &str, variables: &Value) -> Result<String> {
    let env = Environment::new();
    env.render_str(template, variables)
        .map_err(|err| GatewayError::BadRequest(format!("prompt template error: {err}")))
}

/// Whether `template` references any variable at all, used by the runner to
/// skip rendering (and the "does this look like a template" check) for
/// plain-text prompts.
pub fn is_template(template: &str) -> bool {
    template.contains("{{") || template.contains("{%")
}

/// Infer a minimal JSON Schema describing the shape of `value` (spec §9:
/// "a pure function `schema_of(vars) -> JSON schema` inferred from the
/// variable tree"). Objects are inferred as requiring every key they
/// contain; arrays take their schema from the first element, falling back
/// to an unconstrained schema for empty arrays.
pub fn schema_of(value: &Value) -> Value {
    match value {
        Value::Null => json!({"type": "null"}),
        Value::Bool(_) => json!({"type": "boolean"}),
        Value::Number(n) if n.is_i64() || n.is_u64() => json!({"type": "integer"}),
        Value::Number(_) => json!({"type": "number"}),
        Value::String(_) => json!({"type": "string"}),
        Value::Array(items) => {
            let item_schema = items.first().map(schema_of).unwrap_or_else(|| json!({}));
            json!({"type": "array", "items": item_schema})
        }
        Value::Object(fields) => {
            let properties: Map<String, Value> = fields.iter().map(|(key, v)| (key.clone(), schema_of(v))).collect();
            let required: Vec<&String> = fields.keys().collect();
            json!({"type": "object", "properties": properties, "required": required})
        }
    }
}
