//! Input validation against a predictor-provided JSON Schema.
//!
//! The declarative type system lives outside this crate; the boundary
//! here is a raw JSON Schema for the input object. Errors render in the
//! `detail` array shape callers expect from pydantic-style APIs.

use std::collections::HashSet;

use serde_json::Value;

/// A single validation error for one field.
#[derive(Debug)]
pub struct ValidationError {
    pub field: String,
    pub msg: String,
    pub error_type: String,
}

impl ValidationError {
    /// Render as one entry of the 422 `detail` array.
    pub fn to_detail(&self) -> Value {
        serde_json::json!({
            "loc": ["body", "input", self.field],
            "msg": self.msg,
            "type": self.error_type,
        })
    }
}

/// Compiled validator for prediction inputs.
pub struct InputValidator {
    validator: jsonschema::Validator,
    properties: HashSet<String>,
    required: Vec<String>,
}

impl InputValidator {
    /// Compile a validator from the predictor's input schema.
    ///
    /// `additionalProperties: false` is injected so unknown fields are
    /// rejected. Returns None when the schema does not compile.
    pub fn from_schema(schema: &Value) -> Option<Self> {
        let properties: HashSet<String> = schema
            .get("properties")
            .and_then(|p| p.as_object())
            .map(|obj| obj.keys().cloned().collect())
            .unwrap_or_default();

        let required: Vec<String> = schema
            .get("required")
            .and_then(|r| r.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();

        let mut resolved = schema.clone();
        if let Some(obj) = resolved.as_object_mut() {
            obj.entry("additionalProperties".to_string())
                .or_insert(Value::Bool(false));
        }

        let validator = jsonschema::validator_for(&resolved)
            .inspect_err(|e| {
                tracing::warn!(error = %e, "Failed to compile input schema validator");
            })
            .ok()?;

        Some(Self {
            validator,
            properties,
            required,
        })
    }

    /// Validate an input payload, returning per-field errors.
    pub fn validate(&self, input: &Value) -> Result<(), Vec<ValidationError>> {
        if self.validator.validate(input).is_ok() {
            return Ok(());
        }

        let mut errors = Vec::new();
        let mut seen_required = false;
        let mut seen_additional = false;

        for error in self.validator.iter_errors(input) {
            let msg = error.to_string();

            // "required" errors: one entry per missing field.
            if msg.contains("is a required property") {
                if seen_required {
                    continue;
                }
                seen_required = true;
                let input_obj = input.as_object();
                for field in &self.required {
                    let present = input_obj.map(|obj| obj.contains_key(field)).unwrap_or(false);
                    if !present {
                        errors.push(ValidationError {
                            field: field.clone(),
                            msg: "Field required".to_string(),
                            error_type: "value_error.missing".to_string(),
                        });
                    }
                }
                continue;
            }

            // "additionalProperties" errors: one entry per unknown field.
            if msg.contains("Additional properties") {
                if seen_additional {
                    continue;
                }
                seen_additional = true;
                if let Some(input_obj) = input.as_object() {
                    for key in input_obj.keys() {
                        if !self.properties.contains(key) {
                            errors.push(ValidationError {
                                field: key.clone(),
                                msg: format!("Unexpected field '{key}'"),
                                error_type: "value_error.extra".to_string(),
                            });
                        }
                    }
                }
                continue;
            }

            // Type/constraint errors on specific fields.
            let path = error.instance_path.to_string();
            let field = path.trim_start_matches('/');
            errors.push(ValidationError {
                field: if field.is_empty() {
                    "__root__".to_string()
                } else {
                    field.to_string()
                },
                msg,
                error_type: "value_error".to_string(),
            });
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}
