//! Tool definitions, invocation outcomes, and schema validation.
//!
//! Input and return schemas use a small JSON-Schema subset: an `object` with
//! `properties` (each carrying `type` and optional `enum`) and a `required`
//! list. That covers what the registry enforces — type, required, enum —
//! without pulling in a full validator.

use serde::{Deserialize, Serialize};

// ============================================================================
// ToolDefinition
// ============================================================================

/// A registered tool's contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    /// Semver; name-only lookups resolve to the highest registered version.
    pub version: String,
    pub description: String,
    /// JSON-Schema subset describing the parameter object.
    pub input_schema: serde_json::Value,
    /// Optional JSON-Schema subset for the output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_schema: Option<serde_json::Value>,
    /// Plans invoking this tool halt at a confirmation gate first.
    #[serde(default)]
    pub requires_confirmation: bool,
    /// Used when a plan step does not set its own `timeout_ms`.
    pub default_timeout_ms: u64,
    /// Tool to invoke (with the original step's parameters and output) when
    /// this tool's effect must be undone during compensation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensation_tool: Option<String>,
}

impl ToolDefinition {
    /// Property names whose declared type is scalar (string, number,
    /// integer, or boolean), in sorted order. Fan-out expansion targets the
    /// first of these that receives an array value.
    pub fn scalar_parameters(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .input_schema
            .get("properties")
            .and_then(|p| p.as_object())
            .map(|props| {
                props
                    .iter()
                    .filter(|(_, schema)| {
                        matches!(
                            schema.get("type").and_then(|t| t.as_str()),
                            Some("string") | Some("number") | Some("integer") | Some("boolean")
                        )
                    })
                    .map(|(name, _)| name.clone())
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }
}

// ============================================================================
// ToolOutcome
// ============================================================================

/// Result of one tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolError>,
    pub latency_ms: u64,
}

/// Error half of a [`ToolOutcome`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolError {
    pub message: String,
    /// Numeric code from the backend, when one exists (HTTP status, errno).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
}

impl ToolOutcome {
    pub fn ok(output: serde_json::Value, latency_ms: u64) -> Self {
        Self {
            success: true,
            output: Some(output),
            error: None,
            latency_ms,
        }
    }

    pub fn err(message: impl Into<String>, code: Option<i64>, latency_ms: u64) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(ToolError {
                message: message.into(),
                code,
            }),
            latency_ms,
        }
    }
}

// ============================================================================
// Schema validation
// ============================================================================

/// One validation problem: `{path, message, code}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub path: String,
    pub message: String,
    pub code: String,
}

/// Validate a parameter object against a schema's `type`, `required`, and
/// `enum` declarations. Returns every problem found, not just the first.
pub fn validate_against_schema(schema: &serde_json::Value, value: &serde_json::Value) -> Vec<FieldError> {
    let mut errors = Vec::new();

    let Some(obj) = value.as_object() else {
        errors.push(FieldError {
            path: "$".into(),
            message: "parameters must be an object".into(),
            code: "invalid_type".into(),
        });
        return errors;
    };

    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        for field in required.iter().filter_map(|f| f.as_str()) {
            if !obj.contains_key(field) {
                errors.push(FieldError {
                    path: format!("$.{field}"),
                    message: format!("missing required field '{field}'"),
                    code: "required".into(),
                });
            }
        }
    }

    let Some(properties) = schema.get("properties").and_then(|p| p.as_object()) else {
        return errors;
    };

    for (name, prop_schema) in properties {
        let Some(supplied) = obj.get(name) else {
            continue;
        };
        if let Some(expected) = prop_schema.get("type").and_then(|t| t.as_str()) {
            if !type_matches(expected, supplied) {
                errors.push(FieldError {
                    path: format!("$.{name}"),
                    message: format!("expected {expected}, got {}", type_name(supplied)),
                    code: "invalid_type".into(),
                });
                continue;
            }
        }
        if let Some(allowed) = prop_schema.get("enum").and_then(|e| e.as_array()) {
            if !allowed.contains(supplied) {
                errors.push(FieldError {
                    path: format!("$.{name}"),
                    message: format!("value not in enum for '{name}'"),
                    code: "enum".into(),
                });
            }
        }
    }

    errors
}

fn type_matches(expected: &str, value: &serde_json::Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}
