//! Parameter validation and path security normalization

use crate::tool::Tool;
use capstan_core::ToolError;
use serde_json::Value;
use std::path::{Component, Path};
use std::sync::Arc;

/// Validate args against the tool's declared parameters: required checks,
/// type checks, default injection, and security normalization of
/// path-typed parameters. Returns the (possibly amended) args.
pub fn validate_input(
    tool: &Arc<dyn Tool>,
    input: Value,
    workspace_root: Option<&Path>,
) -> Result<Value, ToolError> {
    let mut object = match input {
        Value::Object(map) => map,
        Value::Null => serde_json::Map::new(),
        other => {
            return Err(ToolError::InvalidParameter {
                name: "<input>".into(),
                reason: format!("expected object, got {}", json_type(&other)),
            })
        }
    };

    for param in tool.parameters() {
        match object.get(param.name) {
            None | Some(Value::Null) => {
                if let Some(default) = param.default.clone() {
                    object.insert(param.name.to_string(), default);
                } else if param.required {
                    return Err(ToolError::MissingParameter(param.name.to_string()));
                }
            }
            Some(value) => {
                if !param.kind.matches(value) {
                    return Err(ToolError::InvalidParameter {
                        name: param.name.to_string(),
                        reason: format!(
                            "expected {}, got {}",
                            param.kind.as_json_type(),
                            json_type(value)
                        ),
                    });
                }
            }
        }

        if param.is_path {
            if let Some(Value::String(raw)) = object.get(param.name) {
                let normalized = normalize_path(raw, workspace_root)?;
                object.insert(param.name.to_string(), Value::String(normalized));
            }
        }
    }

    Ok(Value::Object(object))
}

/// Reject traversal and NUL bytes; keep absolute paths inside the
/// workspace root when one is configured.
fn normalize_path(raw: &str, workspace_root: Option<&Path>) -> Result<String, ToolError> {
    if raw.contains('\0') {
        return Err(ToolError::SecurityViolation(
            "path contains NUL byte".into(),
        ));
    }
    let path = Path::new(raw);
    if path
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(ToolError::SecurityViolation(format!(
            "path '{}' contains parent-directory traversal",
            raw
        )));
    }
    if let Some(root) = workspace_root {
        if path.is_absolute() && !path.starts_with(root) {
            return Err(ToolError::SecurityViolation(format!(
                "path '{}' escapes the workspace root",
                raw
            )));
        }
    }
    // Lexical cleanup only; existence checks belong to the tool.
    let cleaned: String = raw.strip_prefix("./").unwrap_or(raw).to_string();
    Ok(cleaned)
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
