//! Validation of raw model output against a block's output schema.

use jsonschema::Validator;
use serde_json::Value;

/// Extracts the JSON payload from a model response.
///
/// Handles plain JSON, JSON inside ```json or generic code fences, and JSON
/// surrounded by explanatory text. Returns the trimmed input unchanged when no
/// JSON-looking span is found.
pub fn extract_json(response: &str) -> &str {
    if let Some(start) = response.find("```json") {
        let after_marker = &response[start + 7..];
        if let Some(end) = after_marker.find("```") {
            return after_marker[..end].trim();
        }
    }

    if let Some(start) = response.find("```") {
        let after_marker = &response[start + 3..];
        let content_start = after_marker.find('\n').map(|i| i + 1).unwrap_or(0);
        let after_newline = &after_marker[content_start..];
        if let Some(end) = after_newline.find("```") {
            return after_newline[..end].trim();
        }
    }

    let trimmed = response.trim();
    if (trimmed.starts_with('{') && trimmed.ends_with('}'))
        || (trimmed.starts_with('[') && trimmed.ends_with(']'))
    {
        return trimmed;
    }

    let start = trimmed.find(['{', '[']);
    let end = trimmed.rfind(['}', ']']).map(|i| i + 1);
    match (start, end) {
        (Some(start), Some(end)) if start < end => &trimmed[start..end],
        _ => trimmed,
    }
}

/// Outcome of validating one model response.
#[derive(Debug, Clone, PartialEq)]
pub struct Validated {
    /// Structured output on success; the raw text as a JSON string on failure.
    pub output: Value,
    /// Validation error message, if the output was rejected.
    pub error: Option<String>,
}

impl Validated {
    fn ok(output: Value) -> Self {
        Self {
            output,
            error: None,
        }
    }

    fn rejected(raw: &str, error: impl Into<String>) -> Self {
        Self {
            output: Value::String(raw.to_string()),
            error: Some(error.into()),
        }
    }

    /// Returns true if the output satisfied the schema.
    pub fn is_valid(&self) -> bool {
        self.error.is_none()
    }
}

/// A compiled output schema.
pub struct OutputSchema {
    validator: Option<Validator>,
    expects_string: bool,
}

impl std::fmt::Debug for OutputSchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputSchema")
            .field("permissive", &self.validator.is_none())
            .field("expects_string", &self.expects_string)
            .finish()
    }
}

impl OutputSchema {
    /// Compiles a JSON Schema. `null` and `{}` accept any output.
    pub fn compile(schema: &Value) -> Result<Self, String> {
        let permissive = match schema {
            Value::Null => true,
            Value::Object(map) => map.is_empty(),
            _ => false,
        };

        let validator = if permissive {
            None
        } else {
            Some(jsonschema::validator_for(schema).map_err(|e| e.to_string())?)
        };

        Ok(Self {
            validator,
            expects_string: schema.get("type").and_then(Value::as_str) == Some("string"),
        })
    }

    /// Parses and validates a raw model response.
    pub fn validate(&self, raw: &str) -> Validated {
        let candidate = match serde_json::from_str::<Value>(extract_json(raw)) {
            Ok(Value::String(s)) => Value::String(s),
            Ok(_) if self.expects_string => Value::String(raw.trim().to_string()),
            Ok(value) => value,
            Err(_) if self.expects_string || self.validator.is_none() => {
                Value::String(raw.trim().to_string())
            }
            Err(e) => return Validated::rejected(raw, format!("output is not valid JSON: {e}")),
        };

        let Some(validator) = &self.validator else {
            return Validated::ok(candidate);
        };

        let errors: Vec<String> = validator
            .iter_errors(&candidate)
            .map(|e| e.to_string())
            .collect();

        if errors.is_empty() {
            Validated::ok(candidate)
        } else {
            Validated::rejected(raw, errors.join("; "))
        }
    }
}

/// Validates `raw` against `schema` in one step.
pub fn validate_output(raw: &str, schema: &Value) -> Validated {
    match OutputSchema::compile(schema) {
        Ok(compiled) => compiled.validate(raw),
        Err(e) => Validated::rejected(raw, format!("invalid output schema: {e}")),
    }
}
