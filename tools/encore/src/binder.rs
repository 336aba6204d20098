//! Parameter binding: resolve `{{name}}` placeholders in a recorded step's
//! payload against runtime parameters, producing a fully substituted
//! concrete step. Binding is pure and total: it either succeeds for the
//! whole step or fails with a `BindingError`.

use crate::action_log::{ParamShape, Step};
use crate::types::StepKind;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum ParamValue {
    Text(String),
    Path(PathBuf),
    Json(Value),
}

pub type ParameterMap = BTreeMap<String, ParamValue>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BindingError {
    #[error("missing parameter: {0}")]
    MissingParameter(String),
    #[error("type mismatch for '{name}': {detail}")]
    TypeMismatch { name: String, detail: String },
}

/// A step with every placeholder substituted, ready for execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConcreteStep {
    pub index: u32,
    pub kind: StepKind,
    pub payload: Value,
}

/// Bind one recorded step against the caller-supplied parameters.
///
/// The step's `kind` never changes: substitution is textual replacement
/// inside the payload, not reinterpretation.
pub fn bind(step: &Step, params: &ParameterMap) -> Result<ConcreteStep, BindingError> {
    let mut resolved: BTreeMap<&str, String> = BTreeMap::new();
    for spec in &step.placeholders {
        let value = match params.get(&spec.name) {
            Some(value) => coerce(&spec.name, spec.shape, value)?,
            None => match &spec.default {
                Some(default) => default.clone(),
                None => return Err(BindingError::MissingParameter(spec.name.clone())),
            },
        };
        resolved.insert(spec.name.as_str(), value);
    }

    let payload = substitute_value(&step.literal_payload, &resolved);

    // Totality check: no placeholder token may survive substitution.
    if let Some(leftover) = find_first_token(&payload) {
        return Err(BindingError::MissingParameter(leftover));
    }

    Ok(ConcreteStep {
        index: step.index,
        kind: step.kind,
        payload,
    })
}

fn coerce(name: &str, shape: ParamShape, value: &ParamValue) -> Result<String, BindingError> {
    match (shape, value) {
        (ParamShape::Text, ParamValue::Text(text)) => Ok(text.clone()),
        (ParamShape::Text, ParamValue::Path(path)) => Ok(path.display().to_string()),
        (ParamShape::Text, ParamValue::Json(Value::String(text))) => Ok(text.clone()),
        (ParamShape::Path, ParamValue::Path(path)) => Ok(path.display().to_string()),
        (ParamShape::Path, ParamValue::Text(text)) if !text.is_empty() => Ok(text.clone()),
        (ParamShape::Path, ParamValue::Text(_)) => Err(BindingError::TypeMismatch {
            name: name.to_string(),
            detail: "empty string is not a path".to_string(),
        }),
        (ParamShape::Number, ParamValue::Text(text)) => {
            text.parse::<f64>()
                .map(|_| text.clone())
                .map_err(|_| BindingError::TypeMismatch {
                    name: name.to_string(),
                    detail: format!("'{text}' is not numeric"),
                })
        }
        (ParamShape::Number, ParamValue::Json(value)) if value.is_number() => {
            Ok(value.to_string())
        }
        (shape, value) => Err(BindingError::TypeMismatch {
            name: name.to_string(),
            detail: format!("{} cannot satisfy {} slot", describe(value), shape.as_str()),
        }),
    }
}

fn describe(value: &ParamValue) -> &'static str {
    match value {
        ParamValue::Text(_) => "text value",
        ParamValue::Path(_) => "path value",
        ParamValue::Json(Value::Array(_)) => "json array",
        ParamValue::Json(Value::Object(_)) => "json object",
        ParamValue::Json(_) => "json value",
    }
}

fn substitute_value(value: &Value, resolved: &BTreeMap<&str, String>) -> Value {
    match value {
        Value::String(text) => Value::String(substitute_text(text, resolved)),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| substitute_value(item, resolved))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, item)| (key.clone(), substitute_value(item, resolved)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn substitute_text(text: &str, resolved: &BTreeMap<&str, String>) -> String {
    let mut output = text.to_string();
    for (name, value) in resolved {
        output = output.replace(&format!("{{{{{name}}}}}"), value);
    }
    output
}

/// Find the first surviving `{{name}}` token anywhere in the payload.
fn find_first_token(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => scan_token(text),
        Value::Array(items) => items.iter().find_map(find_first_token),
        Value::Object(map) => map.values().find_map(find_first_token),
        _ => None,
    }
}

fn scan_token(text: &str) -> Option<String> {
    let bytes = text.as_bytes();
    let mut i = 0;
    while i + 3 < bytes.len() {
        if bytes[i] == b'{' && bytes[i + 1] == b'{' {
            let rest = &text[i + 2..];
            if let Some(end) = rest.find("}}") {
                let name = &rest[..end];
                if !name.is_empty()
                    && name
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '_')
                {
                    return Some(name.to_string());
                }
            }
        }
        i += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action_log::PlaceholderSpec;
    use serde_json::json;

    fn step_with(payload: Value, placeholders: Vec<PlaceholderSpec>) -> Step {
        Step {
            index: 0,
            kind: StepKind::Shell,
            literal_payload: payload,
            placeholders,
            expected_precondition: None,
            expected_postcondition: None,
        }
    }

    fn slot(name: &str, shape: ParamShape) -> PlaceholderSpec {
        PlaceholderSpec {
            name: name.to_string(),
            shape,
            default: None,
        }
    }

    #[test]
    fn bind_substitutes_every_occurrence() {
        let step = step_with(
            json!({
                "command": "cp",
                "args": ["{{html_path}}", "{{output_dir}}/copy.html"],
                "note": "writes into {{output_dir}}"
            }),
            vec![
                slot("html_path", ParamShape::Path),
                slot("output_dir", ParamShape::Path),
            ],
        );
        let mut params = ParameterMap::new();
        params.insert(
            "html_path".to_string(),
            ParamValue::Path("viewer.html".into()),
        );
        params.insert("output_dir".to_string(), ParamValue::Text("/tmp/out".into()));

        let concrete = bind(&step, &params).expect("bind");
        assert_eq!(concrete.kind, StepKind::Shell);
        assert_eq!(
            concrete.payload,
            json!({
                "command": "cp",
                "args": ["viewer.html", "/tmp/out/copy.html"],
                "note": "writes into /tmp/out"
            })
        );
    }

    #[test]
    fn missing_parameter_without_default_fails() {
        let step = step_with(
            json!({"command": "open", "args": ["{{html_path}}"]}),
            vec![slot("html_path", ParamShape::Path)],
        );
        let err = bind(&step, &ParameterMap::new()).expect_err("must fail");
        assert_eq!(err, BindingError::MissingParameter("html_path".to_string()));
    }

    #[test]
    fn declared_default_fills_absent_parameter() {
        let step = step_with(
            json!({"command": "sleep", "args": ["{{seconds}}"]}),
            vec![PlaceholderSpec {
                name: "seconds".to_string(),
                shape: ParamShape::Number,
                default: Some("2".to_string()),
            }],
        );
        let concrete = bind(&step, &ParameterMap::new()).expect("bind with default");
        assert_eq!(concrete.payload, json!({"command": "sleep", "args": ["2"]}));
    }

    #[test]
    fn path_slot_rejects_json_object() {
        let step = step_with(
            json!({"args": ["{{output_dir}}"]}),
            vec![slot("output_dir", ParamShape::Path)],
        );
        let mut params = ParameterMap::new();
        params.insert(
            "output_dir".to_string(),
            ParamValue::Json(json!({"not": "a path"})),
        );
        let err = bind(&step, &params).expect_err("must fail");
        assert!(matches!(err, BindingError::TypeMismatch { ref name, .. } if name == "output_dir"));
    }

    #[test]
    fn number_slot_rejects_non_numeric_text() {
        let step = step_with(
            json!({"args": ["{{width}}"]}),
            vec![slot("width", ParamShape::Number)],
        );
        let mut params = ParameterMap::new();
        params.insert("width".to_string(), ParamValue::Text("wide".into()));
        assert!(bind(&step, &params).is_err());
    }

    #[test]
    fn undeclared_token_in_payload_fails_rather_than_half_binding() {
        // The recorder declared only one of the two tokens present in the
        // payload; binding must not return a partially substituted step.
        let step = step_with(
            json!({"args": ["{{declared}}", "{{forgotten}}"]}),
            vec![slot("declared", ParamShape::Text)],
        );
        let mut params = ParameterMap::new();
        params.insert("declared".to_string(), ParamValue::Text("ok".into()));
        let err = bind(&step, &params).expect_err("must fail");
        assert_eq!(err, BindingError::MissingParameter("forgotten".to_string()));
    }

    #[test]
    fn unreferenced_parameters_are_ignored() {
        let step = step_with(json!({"command": "true"}), vec![]);
        let mut params = ParameterMap::new();
        params.insert("spare".to_string(), ParamValue::Text("unused".into()));
        let concrete = bind(&step, &params).expect("bind");
        assert_eq!(concrete.payload, json!({"command": "true"}));
    }

    #[test]
    fn literal_braces_that_are_not_tokens_survive() {
        let step = step_with(json!({"command": "awk", "args": ["{print $1}"]}), vec![]);
        let concrete = bind(&step, &ParameterMap::new()).expect("bind");
        assert_eq!(concrete.payload["args"][0], "{print $1}");
    }
}
