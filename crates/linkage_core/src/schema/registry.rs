//! Process-wide schema registry.
//!
//! # Responsibility
//! - Map entity names to registered, immutable `EntitySchema` values.
//! - Reject malformed declarations at registration time.
//!
//! # Invariants
//! - Entity names and table names are unique within one registry.
//! - Registered schemas are shared read-only through `Arc`.

use crate::association::resolver::{wiring_for, JoinRelation};
use crate::schema::entity::{
    is_valid_identifier, AssociationKind, EntitySchema, JoinThrough, OnReplace, PRIMARY_KEY,
};
use crate::schema::value::FieldType;
use log::{info, warn};
use std::collections::{BTreeMap, BTreeSet};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

pub type SchemaResult<T> = Result<T, SchemaError>;

/// Registration and lookup errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    DuplicateSchema(String),
    UnknownSchema(String),
    InvalidSchema { schema: String, reason: String },
}

impl Display for SchemaError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateSchema(name) => write!(f, "schema already registered: {name}"),
            Self::UnknownSchema(name) => write!(f, "unknown schema: {name}"),
            Self::InvalidSchema { schema, reason } => {
                write!(f, "invalid schema `{schema}`: {reason}")
            }
        }
    }
}

impl Error for SchemaError {}

/// Registry of entity schemas, filled at startup and read-only afterwards.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    schemas: BTreeMap<String, Arc<EntitySchema>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers one schema after checking its declaration invariants.
    pub fn register(&mut self, schema: EntitySchema) -> SchemaResult<Arc<EntitySchema>> {
        if self.schemas.contains_key(&schema.name) {
            warn!(
                "event=schema_register module=schema status=error schema={} error_code=duplicate_schema",
                schema.name
            );
            return Err(SchemaError::DuplicateSchema(schema.name));
        }
        if let Some(existing) = self
            .schemas
            .values()
            .find(|existing| existing.table == schema.table)
        {
            return Err(invalid(
                &schema,
                format!("table `{}` already used by `{}`", schema.table, existing.name),
            ));
        }
        check_declaration(&schema)?;

        info!(
            "event=schema_register module=schema status=ok schema={} table={} fields={} associations={}",
            schema.name,
            schema.table,
            schema.fields.len(),
            schema.associations.len()
        );
        let schema = Arc::new(schema);
        self.schemas.insert(schema.name.clone(), Arc::clone(&schema));
        Ok(schema)
    }

    /// Looks up one registered schema by entity name.
    pub fn lookup(&self, name: &str) -> SchemaResult<Arc<EntitySchema>> {
        self.schemas
            .get(name)
            .cloned()
            .ok_or_else(|| SchemaError::UnknownSchema(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.schemas.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }

    /// Registered schemas sorted by entity name.
    pub fn schemas(&self) -> impl Iterator<Item = &Arc<EntitySchema>> {
        self.schemas.values()
    }

    /// Resolves every declared association once all schemas are registered.
    ///
    /// Catches unknown targets, malformed join schemas, and many-to-many
    /// pairs whose two sides disagree on the join relation.
    pub fn validate(&self) -> SchemaResult<()> {
        for schema in self.schemas.values() {
            for association in &schema.associations {
                let wiring = wiring_for(self, &schema.name, &association.name).map_err(|err| {
                    SchemaError::InvalidSchema {
                        schema: schema.name.clone(),
                        reason: err.to_string(),
                    }
                })?;

                let Some(join) = wiring.join.as_ref() else {
                    continue;
                };
                let target = self.lookup(&association.target)?;
                let mut reverse_joins = Vec::new();
                for reverse in &target.associations {
                    let same_declaration =
                        target.name == schema.name && reverse.name == association.name;
                    if same_declaration
                        || reverse.target != schema.name
                        || !matches!(reverse.kind, AssociationKind::ManyToMany { .. })
                    {
                        continue;
                    }
                    let reverse_wiring = wiring_for(self, &target.name, &reverse.name)
                        .map_err(|err| SchemaError::InvalidSchema {
                            schema: target.name.clone(),
                            reason: err.to_string(),
                        })?;
                    if let Some(other) = reverse_wiring.join {
                        reverse_joins.push((reverse.name.as_str(), other));
                    }
                }

                let mismatch = match reverse_joins.as_slice() {
                    [] => None,
                    [(reverse, other)] if !declares_several(schema, &target.name) => {
                        (!mirrors(join, other)).then_some(*reverse)
                    }
                    many => many
                        .iter()
                        .find(|(_, other)| other.table == join.table && !mirrors(join, other))
                        .map(|(reverse, _)| *reverse),
                };
                if let Some(reverse) = mismatch {
                    return Err(SchemaError::InvalidSchema {
                        schema: schema.name.clone(),
                        reason: format!(
                            "many-to-many `{}` and `{}.{reverse}` must share one join relation",
                            association.name, target.name
                        ),
                    });
                }
            }
        }
        Ok(())
    }
}

fn check_declaration(schema: &EntitySchema) -> SchemaResult<()> {
    for identifier in [schema.name.as_str(), schema.table.as_str()] {
        if !is_valid_identifier(identifier) {
            return Err(invalid(schema, format!("invalid identifier `{identifier}`")));
        }
    }

    let mut names = BTreeSet::new();
    for field in &schema.fields {
        if !is_valid_identifier(&field.name) {
            return Err(invalid(schema, format!("invalid field name `{}`", field.name)));
        }
        if field.name == PRIMARY_KEY {
            return Err(invalid(schema, format!("field name `{PRIMARY_KEY}` is reserved")));
        }
        if !names.insert(field.name.as_str()) {
            return Err(invalid(schema, format!("duplicate field `{}`", field.name)));
        }
    }

    for association in &schema.associations {
        if !is_valid_identifier(&association.name) {
            return Err(invalid(
                schema,
                format!("invalid association name `{}`", association.name),
            ));
        }
        if !names.insert(association.name.as_str()) {
            return Err(invalid(
                schema,
                format!("association `{}` clashes with another name", association.name),
            ));
        }

        match &association.kind {
            AssociationKind::HasMany { foreign_key } | AssociationKind::HasOne { foreign_key } => {
                if !is_valid_identifier(foreign_key) {
                    return Err(invalid(schema, format!("invalid foreign key `{foreign_key}`")));
                }
            }
            AssociationKind::BelongsTo { foreign_key } => {
                if schema.field_type(foreign_key) != Some(FieldType::Integer) {
                    return Err(invalid(
                        schema,
                        format!(
                            "belongs_to `{}` needs integer field `{foreign_key}`",
                            association.name
                        ),
                    ));
                }
                if association.on_replace == OnReplace::NilifyForeignKey {
                    return Err(invalid(
                        schema,
                        format!("belongs_to `{}` cannot nilify", association.name),
                    ));
                }
            }
            AssociationKind::ManyToMany { through } => {
                if association.on_replace == OnReplace::NilifyForeignKey {
                    return Err(invalid(
                        schema,
                        format!(
                            "many_to_many `{}` has no foreign key to nilify",
                            association.name
                        ),
                    ));
                }
                if let JoinThrough::Table {
                    table,
                    owner_key,
                    related_key,
                } = through
                {
                    for identifier in [table, owner_key, related_key] {
                        if !is_valid_identifier(identifier) {
                            return Err(invalid(
                                schema,
                                format!("invalid join identifier `{identifier}`"),
                            ));
                        }
                    }
                    if owner_key == related_key {
                        return Err(invalid(
                            schema,
                            format!("join table `{table}` needs two distinct keys"),
                        ));
                    }
                }
            }
        }
    }

    Ok(())
}

/// Whether `schema` declares more than one many-to-many towards `target`.
fn declares_several(schema: &EntitySchema, target: &str) -> bool {
    schema
        .associations
        .iter()
        .filter(|association| {
            association.target == target
                && matches!(association.kind, AssociationKind::ManyToMany { .. })
        })
        .count()
        > 1
}

/// Whether `other` is `join` seen from the opposite side.
fn mirrors(join: &JoinRelation, other: &JoinRelation) -> bool {
    other.table == join.table
        && other.owner_column == join.related_column
        && other.related_column == join.owner_column
}

fn invalid(schema: &EntitySchema, reason: String) -> SchemaError {
    warn!(
        "event=schema_register module=schema status=error schema={} error_code=invalid_schema",
        schema.name
    );
    SchemaError::InvalidSchema {
        schema: schema.name.clone(),
        reason,
    }
}
