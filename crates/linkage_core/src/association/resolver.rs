//! Association wiring resolution.
//!
//! # Responsibility
//! - Turn an association declaration into the concrete key columns and join
//!   relation needed to load or persist related rows.
//!
//! # Invariants
//! - Direct wiring compares `owner.owner_column` with `related.related_column`.
//! - Join wiring always keys both sides by primary key; the join relation
//!   carries the two foreign keys.
//! - An implicit join table is synthesized with a unique constraint over the
//!   key pair.

use crate::schema::entity::{
    AssociationDef, AssociationKind, EntitySchema, JoinThrough, PRIMARY_KEY,
};
use crate::schema::registry::SchemaRegistry;
use crate::schema::value::FieldType;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

pub type ResolveResult<T> = Result<T, ResolveError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    UnknownSchema(String),
    UnknownAssociation {
        schema: String,
        association: String,
    },
    InvalidJoinSchema {
        join_schema: String,
        reason: String,
    },
    /// Target schema lacks the integer foreign key the declaration names.
    MissingForeignKey {
        schema: String,
        field: String,
    },
}

impl Display for ResolveError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownSchema(name) => write!(f, "unknown schema: {name}"),
            Self::UnknownAssociation {
                schema,
                association,
            } => write!(f, "unknown association `{association}` on schema `{schema}`"),
            Self::InvalidJoinSchema {
                join_schema,
                reason,
            } => write!(f, "invalid join schema `{join_schema}`: {reason}"),
            Self::MissingForeignKey { schema, field } => {
                write!(f, "schema `{schema}` has no integer foreign key `{field}`")
            }
        }
    }
}

impl Error for ResolveError {}

/// Intermediate relation realizing a many-to-many association.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRelation {
    pub table: String,
    /// Join column referencing the owner's primary key.
    pub owner_column: String,
    /// Join column referencing the related primary key.
    pub related_column: String,
    /// Whether the key pair carries a unique index.
    pub unique_pair: bool,
    /// Join schema name when the relation is an explicit schema.
    pub schema: Option<String>,
}

/// Resolved wiring for one association of one schema.
#[derive(Debug, Clone)]
pub struct Wiring {
    pub owner: Arc<EntitySchema>,
    pub association: AssociationDef,
    pub related: Arc<EntitySchema>,
    /// Owner column whose value keys the relation.
    pub owner_column: String,
    /// Related column matched against `owner_column` (direct wiring), or the
    /// related primary key (join wiring).
    pub related_column: String,
    pub join: Option<JoinRelation>,
}

impl Wiring {
    /// Foreign key stored on related rows, for has-many/has-one.
    pub fn child_foreign_key(&self) -> Option<&str> {
        match &self.association.kind {
            AssociationKind::HasMany { foreign_key } | AssociationKind::HasOne { foreign_key } => {
                Some(foreign_key.as_str())
            }
            _ => None,
        }
    }
}

/// Resolves the wiring of `association` declared on `schema`.
pub fn wiring_for(
    registry: &SchemaRegistry,
    schema: &str,
    association: &str,
) -> ResolveResult<Wiring> {
    let owner = registry
        .lookup(schema)
        .map_err(|_| ResolveError::UnknownSchema(schema.to_string()))?;
    let declaration = owner
        .association(association)
        .cloned()
        .ok_or_else(|| ResolveError::UnknownAssociation {
            schema: schema.to_string(),
            association: association.to_string(),
        })?;
    let related = registry
        .lookup(&declaration.target)
        .map_err(|_| ResolveError::UnknownSchema(declaration.target.clone()))?;

    let (owner_column, related_column, join) = match &declaration.kind {
        AssociationKind::HasMany { foreign_key } | AssociationKind::HasOne { foreign_key } => {
            if related.field_type(foreign_key) != Some(FieldType::Integer) {
                return Err(ResolveError::MissingForeignKey {
                    schema: related.name.clone(),
                    field: foreign_key.clone(),
                });
            }
            (PRIMARY_KEY.to_string(), foreign_key.clone(), None)
        }
        AssociationKind::BelongsTo { foreign_key } => {
            (foreign_key.clone(), PRIMARY_KEY.to_string(), None)
        }
        AssociationKind::ManyToMany { through } => {
            let join = match through {
                JoinThrough::Table {
                    table,
                    owner_key,
                    related_key,
                } => JoinRelation {
                    table: table.clone(),
                    owner_column: owner_key.clone(),
                    related_column: related_key.clone(),
                    unique_pair: true,
                    schema: None,
                },
                JoinThrough::Schema(join_schema) => {
                    join_schema_relation(registry, join_schema, &owner.name, &related.name)?
                }
            };
            (PRIMARY_KEY.to_string(), PRIMARY_KEY.to_string(), Some(join))
        }
    };

    Ok(Wiring {
        owner,
        association: declaration,
        related,
        owner_column,
        related_column,
        join,
    })
}

fn join_schema_relation(
    registry: &SchemaRegistry,
    join_schema: &str,
    owner: &str,
    related: &str,
) -> ResolveResult<JoinRelation> {
    let invalid = |reason: String| ResolveError::InvalidJoinSchema {
        join_schema: join_schema.to_string(),
        reason,
    };
    let schema = registry
        .lookup(join_schema)
        .map_err(|_| invalid("join schema is not registered".to_string()))?;

    let keys_towards = |target: &str| -> Vec<&str> {
        schema
            .associations
            .iter()
            .filter(|association| association.target == target)
            .filter_map(|association| match &association.kind {
                AssociationKind::BelongsTo { foreign_key } => Some(foreign_key.as_str()),
                _ => None,
            })
            .collect()
    };

    let (owner_column, related_column) = if owner == related {
        match keys_towards(owner).as_slice() {
            [first, second] => (first.to_string(), second.to_string()),
            _ => {
                return Err(invalid(format!(
                    "needs exactly two belongs_to relations to `{owner}`"
                )))
            }
        }
    } else {
        let owner_keys = keys_towards(owner);
        let related_keys = keys_towards(related);
        match (owner_keys.as_slice(), related_keys.as_slice()) {
            ([owner_key], [related_key]) => (owner_key.to_string(), related_key.to_string()),
            ([], _) => return Err(invalid(format!("missing belongs_to relation to `{owner}`"))),
            (_, []) => {
                return Err(invalid(format!(
                    "missing belongs_to relation to `{related}`"
                )))
            }
            _ => {
                return Err(invalid(format!(
                    "ambiguous belongs_to relations to `{owner}` or `{related}`"
                )))
            }
        }
    };

    Ok(JoinRelation {
        table: schema.table.clone(),
        owner_column,
        related_column,
        unique_pair: false,
        schema: Some(schema.name.clone()),
    })
}

#[cfg(test)]
mod tests {
    use super::{wiring_for, ResolveError};
    use crate::schema::entity::EntitySchema;
    use crate::schema::registry::SchemaRegistry;
    use crate::schema::value::FieldType;

    fn registry() -> SchemaRegistry {
        let mut registry = SchemaRegistry::new();
        registry
            .register(
                EntitySchema::new("movie", "movies")
                    .field("title", FieldType::Text)
                    .has_many("characters", "character", "movie_id")
                    .many_to_many("actors", "actor", "movies_actors", "movie_id", "actor_id")
                    .many_to_many_through("crew", "person", "credit"),
            )
            .unwrap();
        registry
            .register(
                EntitySchema::new("character", "characters")
                    .field("name", FieldType::Text)
                    .belongs_to("movie", "movie", "movie_id"),
            )
            .unwrap();
        registry
            .register(EntitySchema::new("actor", "actors").field("name", FieldType::Text))
            .unwrap();
        registry
            .register(EntitySchema::new("person", "people").field("name", FieldType::Text))
            .unwrap();
        registry
            .register(
                EntitySchema::new("credit", "credits")
                    .field("role", FieldType::Text)
                    .belongs_to("movie", "movie", "movie_id")
                    .belongs_to("person", "person", "person_id"),
            )
            .unwrap();
        registry
    }

    #[test]
    fn has_many_keys_children_by_foreign_key() {
        let wiring = wiring_for(&registry(), "movie", "characters").unwrap();
        assert_eq!(wiring.owner_column, "id");
        assert_eq!(wiring.related_column, "movie_id");
        assert_eq!(wiring.related.table, "characters");
        assert!(wiring.join.is_none());
        assert_eq!(wiring.child_foreign_key(), Some("movie_id"));
    }

    #[test]
    fn belongs_to_keys_owner_foreign_key() {
        let wiring = wiring_for(&registry(), "character", "movie").unwrap();
        assert_eq!(wiring.owner_column, "movie_id");
        assert_eq!(wiring.related_column, "id");
        assert_eq!(wiring.child_foreign_key(), None);
    }

    #[test]
    fn implicit_join_table_is_synthesized_with_unique_pair() {
        let wiring = wiring_for(&registry(), "movie", "actors").unwrap();
        let join = wiring.join.unwrap();
        assert_eq!(join.table, "movies_actors");
        assert_eq!(join.owner_column, "movie_id");
        assert_eq!(join.related_column, "actor_id");
        assert!(join.unique_pair);
        assert_eq!(join.schema, None);
    }

    #[test]
    fn explicit_join_schema_uses_its_belongs_to_keys() {
        let wiring = wiring_for(&registry(), "movie", "crew").unwrap();
        let join = wiring.join.unwrap();
        assert_eq!(join.table, "credits");
        assert_eq!(join.owner_column, "movie_id");
        assert_eq!(join.related_column, "person_id");
        assert_eq!(join.schema.as_deref(), Some("credit"));
    }

    #[test]
    fn join_schema_without_both_sides_is_rejected() {
        let mut registry = SchemaRegistry::new();
        registry
            .register(EntitySchema::new("movie", "movies").many_to_many_through(
                "crew", "person", "credit",
            ))
            .unwrap();
        registry
            .register(EntitySchema::new("person", "people"))
            .unwrap();
        registry
            .register(EntitySchema::new("credit", "credits").belongs_to("movie", "movie", "movie_id"))
            .unwrap();

        let err = wiring_for(&registry, "movie", "crew").unwrap_err();
        assert!(matches!(err, ResolveError::InvalidJoinSchema { .. }));
    }

    #[test]
    fn unknown_association_is_reported() {
        let err = wiring_for(&registry(), "movie", "sequels").unwrap_err();
        assert_eq!(
            err,
            ResolveError::UnknownAssociation {
                schema: "movie".to_string(),
                association: "sequels".to_string(),
            }
        );
    }
}
