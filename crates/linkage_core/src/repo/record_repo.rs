//! Record repository contracts and SQLite implementation.
//!
//! # Responsibility
//! - Provide get/list/delete over registered entity tables.
//! - Persist draft trees atomically through `apply`.
//! - Expose both preload strategies behind one repository handle.
//!
//! # Invariants
//! - `apply` validates the whole draft tree before touching the store.
//! - `apply` runs in one `IMMEDIATE` transaction; nothing is committed on
//!   failure.
//! - Read paths reject stored values that do not fit the schema.

use super::preload;
use super::query::{select_list, Query};
use super::writer::{write_changeset, WriteStats};
use super::{RepoError, RepoResult};
use crate::association::record::Record;
use crate::association::resolver::{wiring_for, ResolveError};
use crate::changeset::Changeset;
use crate::schema::entity::{quote_ident, EntitySchema, PRIMARY_KEY};
use crate::schema::registry::SchemaRegistry;
use crate::schema::value::{read_sql_value, Value};
use log::{info, warn};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, Row, TransactionBehavior};
use std::sync::Arc;
use std::time::Instant;

/// Repository interface for records of registered schemas.
pub trait RecordRepository {
    fn get(&self, schema: &str, id: i64) -> RepoResult<Option<Record>>;
    fn all(&self, query: &Query) -> RepoResult<Vec<Record>>;
    /// Persists `changeset` and all nested drafts in one transaction.
    fn apply(&mut self, changeset: Changeset) -> RepoResult<Record>;
    fn delete(&mut self, schema: &str, id: i64) -> RepoResult<()>;
    /// Loads `path` onto `records` with one extra query per path level.
    fn preload_separate(&self, records: &mut [Record], path: &str) -> RepoResult<()>;
    /// Loads owners matching `query` together with `association` in one query.
    fn preload_join(&self, query: &Query, association: &str) -> RepoResult<Vec<Record>>;
}

/// SQLite-backed record repository.
pub struct SqliteRecordRepository<'conn> {
    conn: &'conn mut Connection,
    registry: &'conn SchemaRegistry,
}

impl<'conn> SqliteRecordRepository<'conn> {
    /// Constructs a repository from a provisioned connection.
    ///
    /// # Errors
    /// - `MissingRequiredTable`/`MissingRequiredColumn` when a registered
    ///   table or column is absent.
    pub fn try_new(
        conn: &'conn mut Connection,
        registry: &'conn SchemaRegistry,
    ) -> RepoResult<Self> {
        ensure_connection_ready(conn, registry)?;
        Ok(Self { conn, registry })
    }

    pub fn registry(&self) -> &SchemaRegistry {
        self.registry
    }

    fn schema(&self, name: &str) -> RepoResult<Arc<EntitySchema>> {
        self.registry
            .lookup(name)
            .map_err(|_| RepoError::Resolve(ResolveError::UnknownSchema(name.to_string())))
    }
}

impl RecordRepository for SqliteRecordRepository<'_> {
    fn get(&self, schema: &str, id: i64) -> RepoResult<Option<Record>> {
        let schema = self.schema(schema)?;
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM {} WHERE {} = ?1;",
            select_list(&schema, None),
            quote_ident(&schema.table),
            quote_ident(PRIMARY_KEY)
        ))?;

        let mut rows = stmt.query([id])?;
        if let Some(row) = rows.next()? {
            return parse_record(row, &schema, "");
        }
        Ok(None)
    }

    fn all(&self, query: &Query) -> RepoResult<Vec<Record>> {
        let schema = self.schema(&query.schema)?;
        let (sql, bind_values) = query.select_sql(&schema)?;
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(bind_values.iter()))?;

        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            if let Some(record) = parse_record(row, &schema, "")? {
                records.push(record);
            }
        }
        Ok(records)
    }

    fn apply(&mut self, changeset: Changeset) -> RepoResult<Record> {
        let schema = changeset.schema.name.clone();
        let mode = if changeset.is_insert() { "insert" } else { "update" };
        if !changeset.is_valid() {
            warn!(
                "event=assoc_apply module=repo status=rejected schema={} mode={} errors={}",
                schema,
                mode,
                changeset.all_errors().len()
            );
            return Err(RepoError::Invalid(Box::new(changeset)));
        }

        let started_at = Instant::now();
        let mut stats = WriteStats::default();
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let written = write_changeset(&tx, self.registry, changeset, &mut stats);

        match written.and_then(|record| tx.commit().map(|()| record).map_err(RepoError::from)) {
            Ok(record) => {
                info!(
                    "event=assoc_apply module=repo status=ok schema={} mode={} id={} inserted={} updated={} deleted={} linked={} nilified={} ignored={} duration_ms={}",
                    schema,
                    mode,
                    record.id,
                    stats.inserted,
                    stats.updated,
                    stats.deleted,
                    stats.linked,
                    stats.nilified,
                    stats.ignored,
                    started_at.elapsed().as_millis()
                );
                Ok(record)
            }
            Err(err) => {
                warn!(
                    "event=assoc_apply module=repo status=error schema={} mode={} duration_ms={} error={}",
                    schema,
                    mode,
                    started_at.elapsed().as_millis(),
                    err
                );
                Err(err)
            }
        }
    }

    fn delete(&mut self, schema: &str, id: i64) -> RepoResult<()> {
        let schema = self.schema(schema)?;
        let changed = self.conn.execute(
            &format!(
                "DELETE FROM {} WHERE {} = ?1;",
                quote_ident(&schema.table),
                quote_ident(PRIMARY_KEY)
            ),
            [id],
        )?;
        if changed == 0 {
            return Err(RepoError::NotFound {
                schema: schema.name.clone(),
                id,
            });
        }
        Ok(())
    }

    fn preload_separate(&self, records: &mut [Record], path: &str) -> RepoResult<()> {
        preload::preload_separate(&*self.conn, self.registry, records, path)
    }

    fn preload_join(&self, query: &Query, association: &str) -> RepoResult<Vec<Record>> {
        preload::preload_join(&*self.conn, self.registry, query, association)
    }
}

/// Parses the schema columns of `row`, read from `{prefix}{column}` labels.
///
/// Returns `None` when the primary key column is NULL (unmatched outer join).
pub(crate) fn parse_record(
    row: &Row<'_>,
    schema: &EntitySchema,
    prefix: &str,
) -> RepoResult<Option<Record>> {
    let id = match read_sql_value(row, &format!("{prefix}{PRIMARY_KEY}"))? {
        SqlValue::Null => return Ok(None),
        SqlValue::Integer(id) => id,
        other => {
            return Err(RepoError::InvalidData(format!(
                "non-integer primary key in `{}`: {other:?}",
                schema.table
            )))
        }
    };

    let mut record = Record::new(schema.name.clone(), id);
    for field in &schema.fields {
        let raw = read_sql_value(row, &format!("{prefix}{}", field.name))?;
        let value = Value::from_sql_value(raw, field.field_type).ok_or_else(|| {
            RepoError::InvalidData(format!(
                "column `{}.{}` of row {id} is not a valid {}",
                schema.table, field.name, field.field_type
            ))
        })?;
        record.fields.insert(field.name.clone(), value);
    }
    Ok(Some(record))
}

fn ensure_connection_ready(conn: &Connection, registry: &SchemaRegistry) -> RepoResult<()> {
    for schema in registry.schemas() {
        if !table_exists(conn, &schema.table)? {
            return Err(RepoError::MissingRequiredTable(schema.table.clone()));
        }
        for column in schema.columns() {
            if !table_has_column(conn, &schema.table, column)? {
                return Err(RepoError::MissingRequiredColumn {
                    table: schema.table.clone(),
                    column: column.to_string(),
                });
            }
        }
        for association in &schema.associations {
            let wiring = wiring_for(registry, &schema.name, &association.name)?;
            let Some(join) = wiring.join else {
                continue;
            };
            if !table_exists(conn, &join.table)? {
                return Err(RepoError::MissingRequiredTable(join.table));
            }
            for column in [&join.owner_column, &join.related_column] {
                if !table_has_column(conn, &join.table, column)? {
                    return Err(RepoError::MissingRequiredColumn {
                        table: join.table.clone(),
                        column: column.clone(),
                    });
                }
            }
        }
    }
    Ok(())
}

fn table_exists(conn: &Connection, table: &str) -> RepoResult<bool> {
    let exists: i64 = conn.query_row(
        "SELECT EXISTS(
            SELECT 1
            FROM sqlite_master
            WHERE type = 'table' AND name = ?1
        );",
        [table],
        |row| row.get(0),
    )?;
    Ok(exists == 1)
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> RepoResult<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({});", quote_ident(table)))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let current: String = row.get(1)?;
        if current == column {
            return Ok(true);
        }
    }
    Ok(false)
}
