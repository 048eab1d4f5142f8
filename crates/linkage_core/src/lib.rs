//! Minimal object-relational association layer over SQLite.
//! Schemas declare associations; drafts carry nested changes; the repository
//! writes them atomically and preloads related records.

pub mod association;
pub mod changeset;
pub mod config;
pub mod db;
pub mod logging;
pub mod repo;
pub mod schema;

pub use association::record::{Association, Record};
pub use association::resolver::{wiring_for, JoinRelation, ResolveError, Wiring};
pub use changeset::{
    cast, cast_assoc, cast_assoc_with, cast_value, change, put_assoc, AssocChange, AssocEntry,
    CastError, Changeset, FieldError, RawInput,
};
pub use config::{ConfigError, CoreConfig};
pub use db::migrations::Migration;
pub use db::{open_db, open_db_in_memory, open_db_with, DbError};
pub use logging::{default_log_level, init_logging, init_logging_with, logging_status};
pub use repo::preload::{preload_join, preload_separate};
pub use repo::query::{Direction, Filter, Query};
pub use repo::record_repo::{RecordRepository, SqliteRecordRepository};
pub use repo::{ConstraintViolation, RepoError, RepoResult};
pub use schema::ddl::{provisioning_migration, provisioning_statements};
pub use schema::entity::{AssociationDef, AssociationKind, EntitySchema, JoinThrough, OnReplace};
pub use schema::registry::{SchemaError, SchemaRegistry};
pub use schema::value::{FieldType, Value};

/// Minimal health-check API for early integration.
pub fn ping() -> &'static str {
    "pong"
}

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
