//! Drafts (changesets) of proposed record changes.
//!
//! # Responsibility
//! - Hold proposed field values, accumulated field errors and nested
//!   association drafts for one target schema.
//! - Act as the only boundary converting untyped input into typed values.
//!
//! # Invariants
//! - A changeset with `data == None` inserts; with `Some(record)` it updates.
//! - `changes` only holds values that differ from `data`.
//! - Any field error, here or in a nested draft, makes the draft invalid.
//!
//! # See also
//! - `repo::record_repo` for how drafts are persisted.

mod assoc;
mod cast;

pub use assoc::{cast_assoc, cast_assoc_with, put_assoc, AssocEntry};
pub use cast::{cast, cast_value, change};

use crate::association::record::Record;
use crate::schema::entity::EntitySchema;
use crate::schema::registry::SchemaError;
use crate::schema::value::{FieldType, Value};
use serde::Serialize;
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

/// Untyped external input: form submission, JSON body or CLI arguments.
pub type RawInput = serde_json::Map<String, serde_json::Value>;

pub type CastResult<T> = Result<T, CastError>;

/// Error codes carried by `FieldError::code`.
pub const CODE_CAST: &str = "cast";
pub const CODE_REQUIRED: &str = "required";
pub const CODE_LENGTH: &str = "length";
pub const CODE_NUMBER: &str = "number";
pub const CODE_STALE_ID: &str = "stale_id";
pub const CODE_DUPLICATE_ID: &str = "duplicate_id";

/// Accumulated, non-fatal error attached to one field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
    pub code: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>, code: &str) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            code: code.to_string(),
        }
    }
}

impl Display for FieldError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.field, self.message)
    }
}

/// Programmer errors raised while building a changeset.
///
/// These indicate a registration or call-site bug, never bad user input.
#[derive(Debug, Clone, PartialEq)]
pub enum CastError {
    Schema(SchemaError),
    UnknownField {
        schema: String,
        field: String,
    },
    TypeMismatch {
        schema: String,
        field: String,
        expected: FieldType,
    },
    UnknownAssociation {
        schema: String,
        association: String,
    },
    /// Parent is persisted but its association slot was never preloaded.
    AssociationNotLoaded {
        schema: String,
        association: String,
    },
    UnsupportedAssociation {
        association: String,
        kind: &'static str,
    },
    MalformedNested {
        association: String,
        reason: String,
    },
    SchemaMismatch {
        association: String,
        expected: String,
        found: String,
    },
}

impl Display for CastError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Schema(err) => write!(f, "{err}"),
            Self::UnknownField { schema, field } => {
                write!(f, "unknown field `{field}` on schema `{schema}`")
            }
            Self::TypeMismatch {
                schema,
                field,
                expected,
            } => write!(f, "field `{schema}.{field}` expects a {expected} value"),
            Self::UnknownAssociation {
                schema,
                association,
            } => write!(f, "unknown association `{association}` on schema `{schema}`"),
            Self::AssociationNotLoaded {
                schema,
                association,
            } => write!(
                f,
                "association `{schema}.{association}` must be preloaded before it is changed"
            ),
            Self::UnsupportedAssociation { association, kind } => {
                write!(f, "cannot cast nested input into {kind} association `{association}`")
            }
            Self::MalformedNested {
                association,
                reason,
            } => write!(f, "malformed input for association `{association}`: {reason}"),
            Self::SchemaMismatch {
                association,
                expected,
                found,
            } => write!(
                f,
                "association `{association}` expects `{expected}` records, got `{found}`"
            ),
        }
    }
}

impl Error for CastError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Schema(err) => Some(err),
            _ => None,
        }
    }
}

impl From<SchemaError> for CastError {
    fn from(value: SchemaError) -> Self {
        Self::Schema(value)
    }
}

/// One nested entry of an association draft.
#[derive(Debug, Clone, PartialEq)]
pub enum AssocChange {
    /// New related record.
    Insert(Changeset),
    /// Already related record with proposed changes.
    Update(Changeset),
    /// Existing persisted record to attach to the parent.
    Link(Record),
    /// Already related record kept as is.
    Keep(Record),
    /// Loaded related record omitted from the input; resolved by the
    /// association's on-replace policy at write time.
    Replace(Record),
}

impl AssocChange {
    pub fn changeset(&self) -> Option<&Changeset> {
        match self {
            Self::Insert(changeset) | Self::Update(changeset) => Some(changeset),
            _ => None,
        }
    }
}

/// Working copy of proposed changes for one schema.
#[derive(Debug, Clone, PartialEq)]
pub struct Changeset {
    pub schema: Arc<EntitySchema>,
    /// Record being changed; `None` for inserts.
    pub data: Option<Record>,
    pub changes: BTreeMap<String, Value>,
    pub errors: Vec<FieldError>,
    /// Nested drafts per association name, in input order.
    pub assoc_changes: BTreeMap<String, Vec<AssocChange>>,
    valid: bool,
}

impl Changeset {
    pub fn new(schema: Arc<EntitySchema>, data: Option<Record>) -> Self {
        Self {
            schema,
            data,
            changes: BTreeMap::new(),
            errors: Vec::new(),
            assoc_changes: BTreeMap::new(),
            valid: true,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn is_insert(&self) -> bool {
        self.data.is_none()
    }

    /// Current value of `field`: the proposed change, else the existing value.
    pub fn field(&self, field: &str) -> Option<&Value> {
        self.changes
            .get(field)
            .or_else(|| self.data.as_ref().and_then(|record| record.get(field)))
    }

    pub fn change_of(&self, field: &str) -> Option<&Value> {
        self.changes.get(field)
    }

    /// Records `value` unless it equals the existing record value.
    pub fn put_change(&mut self, field: impl Into<String>, value: Value) {
        let field = field.into();
        let unchanged = self
            .data
            .as_ref()
            .is_some_and(|record| record.column(&field) == value);
        if unchanged {
            self.changes.remove(&field);
        } else {
            self.changes.insert(field, value);
        }
    }

    pub fn add_error(&mut self, field: impl Into<String>, message: impl Into<String>, code: &str) {
        self.errors.push(FieldError::new(field, message, code));
        self.valid = false;
    }

    /// Errors attached to `field` on this draft, in detection order.
    pub fn errors_on(&self, field: &str) -> Vec<&FieldError> {
        self.errors
            .iter()
            .filter(|error| error.field == field)
            .collect()
    }

    pub fn assoc_changes(&self, association: &str) -> Option<&[AssocChange]> {
        self.assoc_changes.get(association).map(Vec::as_slice)
    }

    /// Every error in this draft tree with dotted paths such as
    /// `characters.1.name`, parents first.
    pub fn all_errors(&self) -> Vec<FieldError> {
        let mut collected = self.errors.clone();
        for (association, changes) in &self.assoc_changes {
            for (index, change) in changes.iter().enumerate() {
                let Some(nested) = change.changeset() else {
                    continue;
                };
                for error in nested.all_errors() {
                    collected.push(FieldError {
                        field: format!("{association}.{index}.{}", error.field),
                        ..error
                    });
                }
            }
        }
        collected
    }

    pub(crate) fn set_assoc_changes(&mut self, association: String, changes: Vec<AssocChange>) {
        if changes
            .iter()
            .filter_map(AssocChange::changeset)
            .any(|nested| !nested.is_valid())
        {
            self.valid = false;
        }
        self.assoc_changes.insert(association, changes);
    }
}

#[cfg(test)]
mod tests {
    use super::{AssocChange, Changeset};
    use crate::association::record::Record;
    use crate::schema::entity::EntitySchema;
    use crate::schema::value::{FieldType, Value};
    use std::sync::Arc;

    fn movie_schema() -> Arc<EntitySchema> {
        Arc::new(EntitySchema::new("movie", "movies").field("title", FieldType::Text))
    }

    #[test]
    fn put_change_drops_values_equal_to_existing_data() {
        let existing = Record::new("movie", 1).with_field("title", "Alien");
        let mut changeset = Changeset::new(movie_schema(), Some(existing));

        changeset.put_change("title", Value::from("Alien"));
        assert!(changeset.changes.is_empty());

        changeset.put_change("title", Value::from("Aliens"));
        assert_eq!(changeset.change_of("title"), Some(&Value::from("Aliens")));
        assert_eq!(changeset.field("title"), Some(&Value::from("Aliens")));
    }

    #[test]
    fn invalid_nested_draft_invalidates_parent_and_reports_path() {
        let character = Arc::new(EntitySchema::new("character", "characters"));
        let mut nested = Changeset::new(character, None);
        nested.add_error("name", "can't be blank", "required");

        let mut parent = Changeset::new(movie_schema(), None);
        parent.set_assoc_changes(
            "characters".to_string(),
            vec![
                AssocChange::Keep(Record::new("character", 3)),
                AssocChange::Insert(nested),
            ],
        );

        assert!(!parent.is_valid());
        let errors = parent.all_errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "characters.1.name");
    }
}
