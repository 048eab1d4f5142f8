//! Repository layer: persistence of drafts and loading of associations.
//!
//! # Responsibility
//! - Define the record repository contract and its SQLite implementation.
//! - Translate store failures into semantic errors (`NotFound`,
//!   `Constraint`, `AssociationReplace`) in addition to transport errors.
//!
//! # Invariants
//! - Every top-level write runs inside one transaction.
//! - Read paths reject persisted values that do not fit the schema.

pub mod preload;
pub mod query;
pub mod record_repo;
mod writer;

use crate::association::resolver::ResolveError;
use crate::changeset::Changeset;
use crate::db::DbError;
use rusqlite::ErrorCode;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub type RepoResult<T> = Result<T, RepoError>;

/// Store-reported constraint breach (unique join pair, foreign key, ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstraintViolation {
    pub message: String,
    /// SQLite extended result code, e.g. 2067 for a unique violation.
    pub extended_code: i32,
}

/// Repository error for record persistence and query operations.
#[derive(Debug)]
pub enum RepoError {
    /// Draft carries field errors; nothing was written.
    Invalid(Box<Changeset>),
    /// A related record was omitted under the `Raise` on-replace policy.
    AssociationReplace {
        schema: String,
        association: String,
        related_id: i64,
    },
    Constraint(ConstraintViolation),
    AssociationNotLoadable {
        schema: String,
        association: String,
        source: ResolveError,
    },
    Resolve(ResolveError),
    UnknownField {
        schema: String,
        field: String,
    },
    NotFound {
        schema: String,
        id: i64,
    },
    MissingRequiredTable(String),
    MissingRequiredColumn {
        table: String,
        column: String,
    },
    InvalidData(String),
    Db(DbError),
}

impl Display for RepoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Invalid(changeset) => write!(
                f,
                "invalid `{}` changeset: {} error(s)",
                changeset.schema.name,
                changeset.all_errors().len()
            ),
            Self::AssociationReplace {
                schema,
                association,
                related_id,
            } => write!(
                f,
                "attempted to replace related record {related_id} of `{schema}.{association}` \
                 whose on_replace policy is raise"
            ),
            Self::Constraint(violation) => {
                write!(f, "constraint violation: {}", violation.message)
            }
            Self::AssociationNotLoadable {
                schema,
                association,
                source,
            } => write!(
                f,
                "association `{schema}.{association}` is not loadable: {source}"
            ),
            Self::Resolve(err) => write!(f, "{err}"),
            Self::UnknownField { schema, field } => {
                write!(f, "unknown field `{field}` on schema `{schema}`")
            }
            Self::NotFound { schema, id } => write!(f, "{schema} not found: {id}"),
            Self::MissingRequiredTable(table) => {
                write!(f, "record repository requires table `{table}`")
            }
            Self::MissingRequiredColumn { table, column } => write!(
                f,
                "record repository requires column `{column}` in table `{table}`"
            ),
            Self::InvalidData(message) => write!(f, "invalid persisted data: {message}"),
            Self::Db(err) => write!(f, "{err}"),
        }
    }
}

impl Error for RepoError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::AssociationNotLoadable { source, .. } => Some(source),
            Self::Resolve(err) => Some(err),
            Self::Db(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ResolveError> for RepoError {
    fn from(value: ResolveError) -> Self {
        Self::Resolve(value)
    }
}

impl From<DbError> for RepoError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for RepoError {
    fn from(value: rusqlite::Error) -> Self {
        match value {
            rusqlite::Error::SqliteFailure(failure, message)
                if failure.code == ErrorCode::ConstraintViolation =>
            {
                Self::Constraint(ConstraintViolation {
                    message: message.unwrap_or_else(|| failure.to_string()),
                    extended_code: failure.extended_code,
                })
            }
            other => Self::Db(DbError::Sqlite(other)),
        }
    }
}
