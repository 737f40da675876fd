//! Tool-schema conversion between wire formats.
//!
//! Tools are described once, in the native shape (`name` + `description` +
//! `input_schema`), and converted on demand to the function-call shape some
//! providers expect (`{"type": "function", "function": {name, description,
//! parameters}}`). Conversion is bidirectional and lossless over the
//! documented field set `{name, description, parameters/input_schema}`.

use crate::error::{Error, Result};
use serde_json::{Value, json};

/// Output shape for [`ToolRegistry::schemas`](crate::tools::ToolRegistry::schemas).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaFormat {
    /// `{name, description, input_schema}`
    Native,
    /// `{type: "function", function: {name, description, parameters}}`
    FunctionCall,
}

fn empty_object_schema() -> Value {
    json!({"type": "object", "properties": {}})
}

/// Convert a native tool schema to the function-call shape.
///
/// # Errors
///
/// Returns [`Error::Validation`] when the schema has no `name`.
pub fn native_to_function_call(schema: &Value) -> Result<Value> {
    let name = schema
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Validation("native schema missing 'name'".into()))?;

    let mut function = serde_json::Map::new();
    function.insert("name".into(), json!(name));
    if let Some(description) = schema.get("description") {
        function.insert("description".into(), description.clone());
    }
    function.insert(
        "parameters".into(),
        schema
            .get("input_schema")
            .cloned()
            .unwrap_or_else(empty_object_schema),
    );

    Ok(json!({"type": "function", "function": function}))
}

/// Convert a function-call schema back to the native shape.
///
/// Accepts both the wrapped form (`{"type": "function", "function": {...}}`)
/// and a bare function definition.
///
/// # Errors
///
/// Returns [`Error::Validation`] when no function definition with a `name`
/// can be found.
pub fn function_call_to_native(schema: &Value) -> Result<Value> {
    let function = if let Some(inner) = schema.get("function") {
        inner
    } else if schema.get("name").is_some() {
        schema
    } else {
        return Err(Error::Validation(
            "function-call schema must have a 'function' key or a bare 'name'".into(),
        ));
    };

    let name = function
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Validation("function definition missing 'name'".into()))?;

    let mut native = serde_json::Map::new();
    native.insert("name".into(), json!(name));
    if let Some(description) = function.get("description") {
        native.insert("description".into(), description.clone());
    }
    native.insert(
        "input_schema".into(),
        function
            .get("parameters")
            .cloned()
            .unwrap_or_else(empty_object_schema),
    );

    Ok(Value::Object(native))
}

/// Convert a list of native schemas into the requested format.
pub fn convert_schemas(schemas: &[Value], format: SchemaFormat) -> Result<Vec<Value>> {
    match format {
        SchemaFormat::Native => Ok(schemas.to_vec()),
        SchemaFormat::FunctionCall => schemas.iter().map(native_to_function_call).collect(),
    }
}
