//! Casting untyped input into drafts, and field validators.
//!
//! # Invariants
//! - Only permitted fields present in the input are touched; absent fields
//!   are never defaulted.
//! - A failed conversion records a field error and processing continues with
//!   the remaining fields.

use super::{
    CastError, CastResult, Changeset, RawInput, CODE_CAST, CODE_LENGTH, CODE_NUMBER,
    CODE_REQUIRED,
};
use crate::association::record::Record;
use crate::schema::entity::EntitySchema;
use crate::schema::value::{FieldType, Value};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use uuid::Uuid;

/// Builds a draft by casting permitted fields of `raw` against `schema`.
///
/// # Errors
/// - `CastError::UnknownField` when a permitted name is not a schema field.
pub fn cast(
    schema: &Arc<EntitySchema>,
    data: Option<Record>,
    raw: &RawInput,
    permitted: &[&str],
) -> CastResult<Changeset> {
    let mut changeset = Changeset::new(Arc::clone(schema), data);

    for field in permitted {
        let field_type = schema
            .field_def(field)
            .map(|definition| definition.field_type)
            .ok_or_else(|| CastError::UnknownField {
                schema: schema.name.clone(),
                field: field.to_string(),
            })?;

        let Some(raw_value) = raw.get(*field) else {
            continue;
        };
        match cast_value(field_type, raw_value) {
            Ok(value) => changeset.put_change(*field, value),
            Err(message) => changeset.add_error(*field, message, CODE_CAST),
        }
    }

    Ok(changeset)
}

/// Builds a draft from trusted values, skipping casting.
///
/// # Errors
/// - `CastError::UnknownField` for names outside the schema.
/// - `CastError::TypeMismatch` when a value does not fit the field type.
pub fn change<I, K, V>(
    schema: &Arc<EntitySchema>,
    data: Option<Record>,
    values: I,
) -> CastResult<Changeset>
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<Value>,
{
    let mut changeset = Changeset::new(Arc::clone(schema), data);
    for (field, value) in values {
        let field = field.into();
        let value = value.into();
        let field_type = schema
            .field_def(&field)
            .map(|definition| definition.field_type)
            .ok_or_else(|| CastError::UnknownField {
                schema: schema.name.clone(),
                field: field.clone(),
            })?;
        if !value.fits(field_type) {
            return Err(CastError::TypeMismatch {
                schema: schema.name.clone(),
                field,
                expected: field_type,
            });
        }
        changeset.put_change(field, value);
    }
    Ok(changeset)
}

/// Converts one untyped input value to `field_type`.
///
/// Returns the field error message on failure.
pub fn cast_value(field_type: FieldType, raw: &JsonValue) -> Result<Value, String> {
    if let JsonValue::String(text) = raw {
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
    }
    let invalid = || format!("is not a valid {field_type}");

    match (field_type, raw) {
        (_, JsonValue::Null) => Ok(Value::Null),
        (FieldType::Integer, JsonValue::Number(number)) => {
            number.as_i64().map(Value::Integer).ok_or_else(invalid)
        }
        (FieldType::Integer, JsonValue::String(text)) => text
            .trim()
            .parse::<i64>()
            .map(Value::Integer)
            .map_err(|_| invalid()),
        (FieldType::Float, JsonValue::Number(number)) => {
            number.as_f64().map(Value::Float).ok_or_else(invalid)
        }
        (FieldType::Float, JsonValue::String(text)) => text
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|value| value.is_finite())
            .map(Value::Float)
            .ok_or_else(invalid),
        (FieldType::Boolean, JsonValue::Bool(value)) => Ok(Value::Boolean(*value)),
        (FieldType::Boolean, JsonValue::String(text)) => match text.trim() {
            "true" | "1" => Ok(Value::Boolean(true)),
            "false" | "0" => Ok(Value::Boolean(false)),
            _ => Err(invalid()),
        },
        (FieldType::Text, JsonValue::String(text)) => Ok(Value::Text(text.clone())),
        (FieldType::Uuid, JsonValue::String(text)) => Uuid::parse_str(text.trim())
            .map(Value::Uuid)
            .map_err(|_| invalid()),
        _ => Err(invalid()),
    }
}

impl Changeset {
    /// Requires each field to hold a non-null, non-blank value after changes.
    pub fn validate_required(mut self, fields: &[&str]) -> Self {
        for field in fields {
            if self.errors.iter().any(|error| error.field == *field) {
                continue;
            }
            let present = match self.field(field) {
                None | Some(Value::Null) => false,
                Some(Value::Text(text)) => !text.trim().is_empty(),
                Some(_) => true,
            };
            if !present {
                self.add_error(*field, "can't be blank", CODE_REQUIRED);
            }
        }
        self
    }

    /// Bounds the character count of a changed text field.
    pub fn validate_length(mut self, field: &str, min: Option<usize>, max: Option<usize>) -> Self {
        let Some(Value::Text(text)) = self.changes.get(field) else {
            return self;
        };
        let count = text.chars().count();
        if let Some(min) = min.filter(|min| count < *min) {
            self.add_error(
                field,
                format!("should be at least {min} character(s)"),
                CODE_LENGTH,
            );
        } else if let Some(max) = max.filter(|max| count > *max) {
            self.add_error(
                field,
                format!("should be at most {max} character(s)"),
                CODE_LENGTH,
            );
        }
        self
    }

    /// Bounds a changed integer or float field.
    pub fn validate_number(mut self, field: &str, min: Option<f64>, max: Option<f64>) -> Self {
        let number = match self.changes.get(field) {
            Some(Value::Integer(value)) => *value as f64,
            Some(Value::Float(value)) => *value,
            _ => return self,
        };
        if let Some(min) = min.filter(|min| number < *min) {
            self.add_error(
                field,
                format!("must be greater than or equal to {min}"),
                CODE_NUMBER,
            );
        } else if let Some(max) = max.filter(|max| number > *max) {
            self.add_error(
                field,
                format!("must be less than or equal to {max}"),
                CODE_NUMBER,
            );
        }
        self
    }

    /// Runs `check` on a changed field; `Some(message)` becomes an error.
    pub fn validate_change<F>(mut self, field: &str, code: &str, check: F) -> Self
    where
        F: FnOnce(&Value) -> Option<String>,
    {
        let message = self.changes.get(field).and_then(check);
        if let Some(message) = message {
            self.add_error(field, message, code);
        }
        self
    }
}
