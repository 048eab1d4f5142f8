//! Entity schema and association declarations.
//!
//! # Responsibility
//! - Describe one entity: its table, typed fields and declared associations.
//! - Provide a builder that reads like the declaration it replaces.
//!
//! # Invariants
//! - Every entity owns an implicit integer primary key column `id`.
//! - A belongs-to association names exactly one foreign key on its own entity;
//!   the builder declares that field as `Integer` when it is missing.
//! - Schemas are immutable after registration.

use crate::schema::value::FieldType;
use once_cell::sync::Lazy;
use regex::Regex;

/// Name of the primary key column every entity table carries.
pub const PRIMARY_KEY: &str = "id";

static IDENTIFIER_PATTERN: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").ok());

/// Returns whether `value` can be used as a table or column name.
pub fn is_valid_identifier(value: &str) -> bool {
    IDENTIFIER_PATTERN
        .as_ref()
        .is_some_and(|pattern| pattern.is_match(value))
}

/// Double-quotes a validated identifier for generated SQL.
pub(crate) fn quote_ident(identifier: &str) -> String {
    format!("\"{identifier}\"")
}

/// One typed field of an entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDef {
    pub name: String,
    pub field_type: FieldType,
}

/// What happens to an existing related record omitted from a nested update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnReplace {
    /// Reject the whole write with `AssociationReplaceError`.
    #[default]
    Raise,
    /// Delete the related row (many-to-many: only the join row).
    DeleteMissing,
    /// Set the related row's foreign key to NULL.
    NilifyForeignKey,
    /// Leave the related row untouched.
    Ignore,
}

impl OnReplace {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Raise => "raise",
            Self::DeleteMissing => "delete_missing",
            Self::NilifyForeignKey => "nilify_foreign_key",
            Self::Ignore => "ignore",
        }
    }
}

/// Where the two keys of a many-to-many relationship live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinThrough {
    /// Bare two-column join table; the pair gets a unique index.
    Table {
        table: String,
        owner_key: String,
        related_key: String,
    },
    /// Registered join schema declaring belongs-to relations to both sides.
    Schema(String),
}

/// Association kind plus its wiring metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssociationKind {
    /// Target rows carry `foreign_key` pointing at this entity.
    HasMany { foreign_key: String },
    /// Same wiring as has-many, at most one target row.
    HasOne { foreign_key: String },
    /// This entity carries `foreign_key` pointing at the target.
    BelongsTo { foreign_key: String },
    ManyToMany { through: JoinThrough },
}

impl AssociationKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::HasMany { .. } => "has_many",
            Self::HasOne { .. } => "has_one",
            Self::BelongsTo { .. } => "belongs_to",
            Self::ManyToMany { .. } => "many_to_many",
        }
    }

    /// Whether the association holds a list rather than at most one record.
    pub fn is_collection(&self) -> bool {
        matches!(self, Self::HasMany { .. } | Self::ManyToMany { .. })
    }
}

/// Declared relationship from one entity to another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociationDef {
    pub name: String,
    /// Name of the target entity schema.
    pub target: String,
    pub kind: AssociationKind,
    pub on_replace: OnReplace,
}

/// Registered description of one entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntitySchema {
    pub name: String,
    pub table: String,
    pub fields: Vec<FieldDef>,
    pub associations: Vec<AssociationDef>,
}

impl EntitySchema {
    pub fn new(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            fields: Vec::new(),
            associations: Vec::new(),
        }
    }

    pub fn field(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.fields.push(FieldDef {
            name: name.into(),
            field_type,
        });
        self
    }

    pub fn has_many(
        self,
        name: impl Into<String>,
        target: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        self.associate(
            name,
            target,
            AssociationKind::HasMany {
                foreign_key: foreign_key.into(),
            },
        )
    }

    pub fn has_one(
        self,
        name: impl Into<String>,
        target: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        self.associate(
            name,
            target,
            AssociationKind::HasOne {
                foreign_key: foreign_key.into(),
            },
        )
    }

    /// Declares a belongs-to association and its foreign key field.
    pub fn belongs_to(
        mut self,
        name: impl Into<String>,
        target: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        let foreign_key = foreign_key.into();
        if self.field_def(&foreign_key).is_none() {
            self = self.field(foreign_key.clone(), FieldType::Integer);
        }
        self.associate(name, target, AssociationKind::BelongsTo { foreign_key })
    }

    /// Declares a many-to-many association through a bare join table.
    pub fn many_to_many(
        self,
        name: impl Into<String>,
        target: impl Into<String>,
        join_table: impl Into<String>,
        owner_key: impl Into<String>,
        related_key: impl Into<String>,
    ) -> Self {
        self.associate(
            name,
            target,
            AssociationKind::ManyToMany {
                through: JoinThrough::Table {
                    table: join_table.into(),
                    owner_key: owner_key.into(),
                    related_key: related_key.into(),
                },
            },
        )
    }

    /// Declares a many-to-many association through a registered join schema.
    pub fn many_to_many_through(
        self,
        name: impl Into<String>,
        target: impl Into<String>,
        join_schema: impl Into<String>,
    ) -> Self {
        self.associate(
            name,
            target,
            AssociationKind::ManyToMany {
                through: JoinThrough::Schema(join_schema.into()),
            },
        )
    }

    /// Sets the on-replace policy of the most recently declared association.
    pub fn on_replace(mut self, policy: OnReplace) -> Self {
        if let Some(association) = self.associations.last_mut() {
            association.on_replace = policy;
        }
        self
    }

    pub fn field_def(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|field| field.name == name)
    }

    pub fn field_type(&self, name: &str) -> Option<FieldType> {
        if name == PRIMARY_KEY {
            return Some(FieldType::Integer);
        }
        self.field_def(name).map(|field| field.field_type)
    }

    pub fn association(&self, name: &str) -> Option<&AssociationDef> {
        self.associations
            .iter()
            .find(|association| association.name == name)
    }

    /// Stored column names in declaration order, primary key first.
    pub fn columns(&self) -> impl Iterator<Item = &str> {
        std::iter::once(PRIMARY_KEY).chain(self.fields.iter().map(|field| field.name.as_str()))
    }

    fn associate(
        mut self,
        name: impl Into<String>,
        target: impl Into<String>,
        kind: AssociationKind,
    ) -> Self {
        self.associations.push(AssociationDef {
            name: name.into(),
            target: target.into(),
            kind,
            on_replace: OnReplace::default(),
        });
        self
    }
}
