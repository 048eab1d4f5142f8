//! Semantic field types and typed field values.
//!
//! # Responsibility
//! - Define the closed set of semantic types a schema field may declare.
//! - Convert typed values to and from SQLite storage representation.
//!
//! # Invariants
//! - UUID values are stored as hyphenated lowercase text.
//! - Booleans are stored as `0`/`1` integers.

use rusqlite::types::{ToSqlOutput, Value as SqlValue, ValueRef};
use rusqlite::ToSql;
use serde::{Serialize, Serializer};
use std::fmt::{Display, Formatter};
use uuid::Uuid;

/// Semantic type of one schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    Integer,
    Float,
    Boolean,
    Text,
    Uuid,
}

impl FieldType {
    /// SQLite column affinity used by generated DDL.
    pub fn sql_type(self) -> &'static str {
        match self {
            Self::Integer | Self::Boolean => "INTEGER",
            Self::Float => "REAL",
            Self::Text | Self::Uuid => "TEXT",
        }
    }

    /// Short lowercase name used in cast error messages.
    pub fn name(self) -> &'static str {
        match self {
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Boolean => "boolean",
            Self::Text => "text",
            Self::Uuid => "uuid",
        }
    }
}

impl Display for FieldType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Typed field value held by drafts and persisted records.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Text(String),
    Uuid(Uuid),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value.as_str()),
            _ => None,
        }
    }

    /// Whether this value may be stored in a field of `field_type`.
    pub fn fits(&self, field_type: FieldType) -> bool {
        matches!(
            (self, field_type),
            (Self::Null, _)
                | (Self::Integer(_), FieldType::Integer)
                | (Self::Float(_), FieldType::Float)
                | (Self::Boolean(_), FieldType::Boolean)
                | (Self::Text(_), FieldType::Text)
                | (Self::Uuid(_), FieldType::Uuid)
        )
    }

    /// Reads a stored column value back into the semantic type of the field.
    ///
    /// Returns `None` when the stored value cannot represent `field_type`.
    pub fn from_sql_value(value: SqlValue, field_type: FieldType) -> Option<Self> {
        match (value, field_type) {
            (SqlValue::Null, _) => Some(Self::Null),
            (SqlValue::Integer(value), FieldType::Integer) => Some(Self::Integer(value)),
            (SqlValue::Integer(value), FieldType::Float) => Some(Self::Float(value as f64)),
            (SqlValue::Real(value), FieldType::Float) => Some(Self::Float(value)),
            (SqlValue::Integer(0), FieldType::Boolean) => Some(Self::Boolean(false)),
            (SqlValue::Integer(1), FieldType::Boolean) => Some(Self::Boolean(true)),
            (SqlValue::Text(value), FieldType::Text) => Some(Self::Text(value)),
            (SqlValue::Text(value), FieldType::Uuid) => Uuid::parse_str(&value).ok().map(Self::Uuid),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Uuid> for Value {
    fn from(value: Uuid) -> Self {
        Self::Uuid(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Integer(value) => write!(f, "{value}"),
            Self::Float(value) => write!(f, "{value}"),
            Self::Boolean(value) => write!(f, "{value}"),
            Self::Text(value) => f.write_str(value),
            Self::Uuid(value) => write!(f, "{value}"),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Null => serializer.serialize_none(),
            Self::Integer(value) => serializer.serialize_i64(*value),
            Self::Float(value) => serializer.serialize_f64(*value),
            Self::Boolean(value) => serializer.serialize_bool(*value),
            Self::Text(value) => serializer.serialize_str(value),
            Self::Uuid(value) => serializer.collect_str(value),
        }
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Self::Null => ToSqlOutput::Owned(SqlValue::Null),
            Self::Integer(value) => ToSqlOutput::Owned(SqlValue::Integer(*value)),
            Self::Float(value) => ToSqlOutput::Owned(SqlValue::Real(*value)),
            Self::Boolean(value) => ToSqlOutput::Owned(SqlValue::Integer(i64::from(*value))),
            Self::Text(value) => ToSqlOutput::Borrowed(ValueRef::Text(value.as_bytes())),
            Self::Uuid(value) => ToSqlOutput::Owned(SqlValue::Text(value.to_string())),
        })
    }
}

/// Reads one raw column without type coercion.
pub(crate) fn read_sql_value(row: &rusqlite::Row<'_>, column: &str) -> rusqlite::Result<SqlValue> {
    row.get::<_, SqlValue>(column)
}
