//! Association writer: persists a validated draft tree.
//!
//! # Invariants
//! - Callers run this inside one transaction; any error leaves the caller
//!   responsible for rolling back.
//! - Belongs-to parents are written before the owning row, children after.
//! - Omitted related records are resolved by the association's on-replace
//!   policy before new children are attached.

use super::query::placeholders;
use super::{RepoError, RepoResult};
use crate::association::record::{Association, Record};
use crate::association::resolver::{wiring_for, Wiring};
use crate::changeset::{AssocChange, Changeset};
use crate::schema::entity::{quote_ident, AssociationKind, EntitySchema, OnReplace, PRIMARY_KEY};
use crate::schema::registry::SchemaRegistry;
use crate::schema::value::Value;
use rusqlite::{params, params_from_iter, Connection};
use std::collections::BTreeMap;

/// Row counts of one `apply`, reported in the `assoc_apply` log event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct WriteStats {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    pub linked: usize,
    pub nilified: usize,
    pub ignored: usize,
}

/// Writes `changeset` and its nested drafts, returning the persisted record
/// with every written association loaded in input order.
pub(crate) fn write_changeset(
    conn: &Connection,
    registry: &SchemaRegistry,
    changeset: Changeset,
    stats: &mut WriteStats,
) -> RepoResult<Record> {
    let Changeset {
        schema,
        data,
        mut changes,
        assoc_changes,
        ..
    } = changeset;

    let mut parents = Vec::new();
    let mut children = Vec::new();
    for (name, entries) in assoc_changes {
        match schema.association(&name).map(|declaration| &declaration.kind) {
            Some(AssociationKind::BelongsTo { foreign_key }) => {
                parents.push((name, foreign_key.clone(), entries))
            }
            Some(_) => children.push((name, entries)),
            None => {
                return Err(RepoError::InvalidData(format!(
                    "draft carries unknown association `{}.{name}`",
                    schema.name
                )))
            }
        }
    }

    let mut loaded = BTreeMap::new();
    for (name, foreign_key, entries) in parents {
        let mut slot = Vec::with_capacity(entries.len());
        for entry in entries {
            match entry {
                AssocChange::Insert(draft) => {
                    let parent = write_changeset(conn, registry, draft, stats)?;
                    changes.insert(foreign_key.clone(), Value::Integer(parent.id));
                    slot.push(parent);
                }
                AssocChange::Update(draft) => slot.push(write_changeset(conn, registry, draft, stats)?),
                AssocChange::Link(record) | AssocChange::Keep(record) => slot.push(record),
                AssocChange::Replace(_) => {}
            }
        }
        loaded.insert(name, Association::Loaded(slot));
    }

    let mut record = match data {
        None => {
            let id = insert_row(conn, &schema, &changes)?;
            stats.inserted += 1;
            let mut record = Record::new(schema.name.clone(), id);
            for field in &schema.fields {
                let value = changes.remove(&field.name).unwrap_or(Value::Null);
                record.fields.insert(field.name.clone(), value);
            }
            record
        }
        Some(mut record) => {
            if !changes.is_empty() {
                update_row(conn, &schema, record.id, &changes)?;
                stats.updated += 1;
                record.fields.extend(changes);
            }
            record
        }
    };

    for (name, entries) in children {
        let wiring = wiring_for(registry, &schema.name, &name)?;
        let slot = write_children(conn, registry, &wiring, record.id, entries, stats)?;
        loaded.insert(name, Association::Loaded(slot));
    }

    record.associations.extend(loaded);
    Ok(record)
}

fn write_children(
    conn: &Connection,
    registry: &SchemaRegistry,
    wiring: &Wiring,
    owner_id: i64,
    entries: Vec<AssocChange>,
    stats: &mut WriteStats,
) -> RepoResult<Vec<Record>> {
    let (replaced, entries): (Vec<_>, Vec<_>) = entries
        .into_iter()
        .partition(|entry| matches!(entry, AssocChange::Replace(_)));

    for entry in replaced {
        if let AssocChange::Replace(record) = entry {
            replace_related(conn, wiring, owner_id, &record, stats)?;
        }
    }

    let mut slot = Vec::with_capacity(entries.len());
    for entry in entries {
        let written = match entry {
            AssocChange::Insert(mut draft) => match wiring.child_foreign_key() {
                Some(foreign_key) => {
                    draft.put_change(foreign_key, Value::Integer(owner_id));
                    write_changeset(conn, registry, draft, stats)?
                }
                None => {
                    let related = write_changeset(conn, registry, draft, stats)?;
                    insert_join_row(conn, wiring, owner_id, related.id)?;
                    related
                }
            },
            AssocChange::Update(draft) => write_changeset(conn, registry, draft, stats)?,
            AssocChange::Link(mut record) => {
                match wiring.child_foreign_key() {
                    Some(foreign_key) => {
                        let changed = conn.execute(
                            &format!(
                                "UPDATE {} SET {} = ?1 WHERE {} = ?2;",
                                quote_ident(&wiring.related.table),
                                quote_ident(foreign_key),
                                quote_ident(PRIMARY_KEY)
                            ),
                            params![owner_id, record.id],
                        )?;
                        if changed == 0 {
                            return Err(RepoError::NotFound {
                                schema: wiring.related.name.clone(),
                                id: record.id,
                            });
                        }
                        record
                            .fields
                            .insert(foreign_key.to_string(), Value::Integer(owner_id));
                    }
                    None => insert_join_row(conn, wiring, owner_id, record.id)?,
                }
                stats.linked += 1;
                record
            }
            AssocChange::Keep(record) | AssocChange::Replace(record) => record,
        };
        slot.push(written);
    }
    Ok(slot)
}

fn replace_related(
    conn: &Connection,
    wiring: &Wiring,
    owner_id: i64,
    record: &Record,
    stats: &mut WriteStats,
) -> RepoResult<()> {
    match (wiring.association.on_replace, &wiring.join) {
        (OnReplace::Raise, _) => Err(RepoError::AssociationReplace {
            schema: wiring.owner.name.clone(),
            association: wiring.association.name.clone(),
            related_id: record.id,
        }),
        (OnReplace::Ignore, _) => {
            stats.ignored += 1;
            Ok(())
        }
        (OnReplace::DeleteMissing | OnReplace::NilifyForeignKey, Some(join)) => {
            conn.execute(
                &format!(
                    "DELETE FROM {} WHERE {} = ?1 AND {} = ?2;",
                    quote_ident(&join.table),
                    quote_ident(&join.owner_column),
                    quote_ident(&join.related_column)
                ),
                params![owner_id, record.id],
            )?;
            stats.deleted += 1;
            Ok(())
        }
        (OnReplace::DeleteMissing, None) => {
            conn.execute(
                &format!(
                    "DELETE FROM {} WHERE {} = ?1;",
                    quote_ident(&wiring.related.table),
                    quote_ident(PRIMARY_KEY)
                ),
                [record.id],
            )?;
            stats.deleted += 1;
            Ok(())
        }
        (OnReplace::NilifyForeignKey, None) => {
            let Some(foreign_key) = wiring.child_foreign_key() else {
                return Ok(());
            };
            conn.execute(
                &format!(
                    "UPDATE {} SET {} = NULL WHERE {} = ?1;",
                    quote_ident(&wiring.related.table),
                    quote_ident(foreign_key),
                    quote_ident(PRIMARY_KEY)
                ),
                [record.id],
            )?;
            stats.nilified += 1;
            Ok(())
        }
    }
}

fn insert_join_row(
    conn: &Connection,
    wiring: &Wiring,
    owner_id: i64,
    related_id: i64,
) -> RepoResult<()> {
    let Some(join) = wiring.join.as_ref() else {
        return Err(RepoError::InvalidData(format!(
            "association `{}.{}` has no join relation",
            wiring.owner.name, wiring.association.name
        )));
    };
    conn.execute(
        &format!(
            "INSERT INTO {} ({}, {}) VALUES (?1, ?2);",
            quote_ident(&join.table),
            quote_ident(&join.owner_column),
            quote_ident(&join.related_column)
        ),
        params![owner_id, related_id],
    )?;
    Ok(())
}

fn insert_row(
    conn: &Connection,
    schema: &EntitySchema,
    changes: &BTreeMap<String, Value>,
) -> RepoResult<i64> {
    if changes.is_empty() {
        conn.execute(
            &format!("INSERT INTO {} DEFAULT VALUES;", quote_ident(&schema.table)),
            [],
        )?;
        return Ok(conn.last_insert_rowid());
    }

    let columns = changes
        .keys()
        .map(|column| quote_ident(column))
        .collect::<Vec<_>>()
        .join(", ");
    conn.execute(
        &format!(
            "INSERT INTO {} ({columns}) VALUES ({});",
            quote_ident(&schema.table),
            placeholders(changes.len())
        ),
        params_from_iter(changes.values()),
    )?;
    Ok(conn.last_insert_rowid())
}

fn update_row(
    conn: &Connection,
    schema: &EntitySchema,
    id: i64,
    changes: &BTreeMap<String, Value>,
) -> RepoResult<()> {
    let assignments = changes
        .keys()
        .map(|column| format!("{} = ?", quote_ident(column)))
        .collect::<Vec<_>>()
        .join(", ");
    let mut bind_values: Vec<Value> = changes.values().cloned().collect();
    bind_values.push(Value::Integer(id));

    let changed = conn.execute(
        &format!(
            "UPDATE {} SET {assignments} WHERE {} = ?;",
            quote_ident(&schema.table),
            quote_ident(PRIMARY_KEY)
        ),
        params_from_iter(bind_values.iter()),
    )?;
    if changed == 0 {
        return Err(RepoError::NotFound {
            schema: schema.name.clone(),
            id,
        });
    }
    Ok(())
}
