//! Provisioning DDL generated from a registry.
//!
//! # Responsibility
//! - Emit table, foreign-key and join-pair unique index statements for every
//!   registered schema and every implicit join table.
//!
//! # Invariants
//! - Statements are idempotent (`IF NOT EXISTS`).
//! - An implicit join table shared by both sides is emitted once.

use crate::association::resolver::wiring_for;
use crate::db::migrations::Migration;
use crate::schema::entity::{quote_ident, AssociationKind, PRIMARY_KEY};
use crate::schema::registry::{SchemaError, SchemaRegistry, SchemaResult};
use std::collections::{BTreeMap, BTreeSet};

/// Builds provisioning statements for everything in `registry`.
pub fn provisioning_statements(registry: &SchemaRegistry) -> SchemaResult<Vec<String>> {
    let references = foreign_key_references(registry)?;
    let mut statements = Vec::new();

    for schema in registry.schemas() {
        let mut columns = vec![format!(
            "{} INTEGER PRIMARY KEY AUTOINCREMENT",
            quote_ident(PRIMARY_KEY)
        )];
        for field in &schema.fields {
            let mut column = format!("{} {}", quote_ident(&field.name), field.field_type.sql_type());
            if let Some(target_table) = references.get(&(schema.table.clone(), field.name.clone())) {
                column.push_str(&format!(
                    " REFERENCES {}({})",
                    quote_ident(target_table),
                    quote_ident(PRIMARY_KEY)
                ));
            }
            columns.push(column);
        }
        statements.push(format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    {}\n);",
            quote_ident(&schema.table),
            columns.join(",\n    ")
        ));
    }

    let mut emitted_joins = BTreeSet::new();
    for schema in registry.schemas() {
        for association in &schema.associations {
            if !matches!(association.kind, AssociationKind::ManyToMany { .. }) {
                continue;
            }
            let wiring = wiring_for(registry, &schema.name, &association.name)
                .map_err(|err| resolve_failure(&schema.name, err))?;
            let Some(join) = wiring.join else {
                continue;
            };
            if !join.unique_pair || !emitted_joins.insert(join.table.clone()) {
                continue;
            }

            statements.push(format!(
                "CREATE TABLE IF NOT EXISTS {table} (\n    {owner} INTEGER NOT NULL REFERENCES {owner_table}({pk}) ON DELETE CASCADE,\n    {related} INTEGER NOT NULL REFERENCES {related_table}({pk}) ON DELETE CASCADE\n);",
                table = quote_ident(&join.table),
                owner = quote_ident(&join.owner_column),
                owner_table = quote_ident(&wiring.owner.table),
                related = quote_ident(&join.related_column),
                related_table = quote_ident(&wiring.related.table),
                pk = quote_ident(PRIMARY_KEY),
            ));
            statements.push(format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS {} ON {} ({}, {});",
                quote_ident(&format!(
                    "{}_{}_{}_index",
                    join.table, join.owner_column, join.related_column
                )),
                quote_ident(&join.table),
                quote_ident(&join.owner_column),
                quote_ident(&join.related_column),
            ));
        }
    }

    Ok(statements)
}

/// Packages `provisioning_statements` as one migration step.
pub fn provisioning_migration(registry: &SchemaRegistry, version: u32) -> SchemaResult<Migration> {
    let statements = provisioning_statements(registry)?;
    Ok(Migration::new(version, statements.join("\n")))
}

/// Maps `(table, column)` to the table its foreign key references.
fn foreign_key_references(
    registry: &SchemaRegistry,
) -> SchemaResult<BTreeMap<(String, String), String>> {
    let mut references = BTreeMap::new();
    for schema in registry.schemas() {
        for association in &schema.associations {
            let target = registry.lookup(&association.target)?;
            match &association.kind {
                AssociationKind::BelongsTo { foreign_key } => {
                    references.insert(
                        (schema.table.clone(), foreign_key.clone()),
                        target.table.clone(),
                    );
                }
                AssociationKind::HasMany { foreign_key } | AssociationKind::HasOne { foreign_key } => {
                    references
                        .entry((target.table.clone(), foreign_key.clone()))
                        .or_insert_with(|| schema.table.clone());
                }
                AssociationKind::ManyToMany { .. } => {}
            }
        }
    }
    Ok(references)
}

fn resolve_failure(schema: &str, err: impl ToString) -> SchemaError {
    SchemaError::InvalidSchema {
        schema: schema.to_string(),
        reason: err.to_string(),
    }
}
