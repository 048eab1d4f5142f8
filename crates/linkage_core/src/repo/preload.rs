//! Query/preload executor.
//!
//! # Responsibility
//! - `preload_separate`: one extra query per association level, keyed by
//!   the owner keys already in memory.
//! - `preload_join`: one query joining owners to related rows, regrouped
//!   under owners.
//!
//! # Invariants
//! - Owner order is preserved (separate) or first-seen (join).
//! - Related records within one owner are ordered by related `id` in both
//!   strategies, so both produce the same owner to related mapping.
//! - Singular associations hold at most one record.

use super::query::{placeholders, select_list, Query};
use super::record_repo::parse_record;
use super::{RepoError, RepoResult};
use crate::association::record::{Association, Record};
use crate::association::resolver::{wiring_for, Wiring};
use crate::schema::entity::{quote_ident, PRIMARY_KEY};
use crate::schema::registry::SchemaRegistry;
use log::debug;
use rusqlite::{params_from_iter, Connection};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

/// Upper bound of bound keys per `IN (...)` list.
const KEY_CHUNK_SIZE: usize = 500;
const OWNER_KEY_LABEL: &str = "__owner_key";
const OWNER_PREFIX: &str = "o__";
const RELATED_PREFIX: &str = "r__";

/// Loads `path` (e.g. `characters` or `characters.actor`) onto `records`.
///
/// # Errors
/// - `AssociationNotLoadable` when a path segment cannot be resolved.
/// - `InvalidData` when `records` mix schemas.
pub fn preload_separate(
    conn: &Connection,
    registry: &SchemaRegistry,
    records: &mut [Record],
    path: &str,
) -> RepoResult<()> {
    let Some(first) = records.first() else {
        return Ok(());
    };
    let schema = first.schema.clone();
    if let Some(other) = records.iter().find(|record| record.schema != schema) {
        return Err(RepoError::InvalidData(format!(
            "cannot preload over mixed schemas `{schema}` and `{}`",
            other.schema
        )));
    }

    let (association, rest) = match path.split_once('.') {
        Some((head, rest)) => (head, Some(rest)),
        None => (path, None),
    };
    let wiring = loadable_wiring(registry, &schema, association)?;
    let started_at = Instant::now();

    if let Some(rest) = rest {
        resolve_path(registry, &wiring.related.name, rest)?;
    }

    let mut seen = BTreeSet::new();
    let owner_keys: Vec<i64> = records
        .iter()
        .filter_map(|record| record.column(&wiring.owner_column).as_i64())
        .filter(|key| seen.insert(*key))
        .collect();

    let mut related_by_id = BTreeMap::new();
    let mut groups: BTreeMap<i64, Vec<i64>> = BTreeMap::new();
    for chunk in owner_keys.chunks(KEY_CHUNK_SIZE) {
        fetch_related_chunk(conn, &wiring, chunk, &mut related_by_id, &mut groups)?;
    }

    if let Some(rest) = rest {
        let mut fetched: Vec<Record> = related_by_id.into_values().collect();
        preload_separate(conn, registry, &mut fetched, rest)?;
        related_by_id = fetched
            .into_iter()
            .map(|record| (record.id, record))
            .collect();
    }

    let singular = !wiring.association.kind.is_collection();
    for record in records.iter_mut() {
        let mut related: Vec<Record> = record
            .column(&wiring.owner_column)
            .as_i64()
            .and_then(|key| groups.get(&key))
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| related_by_id.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default();
        if singular {
            related.truncate(1);
        }
        record.set_association(association, Association::Loaded(related));
    }

    debug!(
        "event=preload module=repo status=ok strategy=separate schema={} association={} owners={} related={} duration_ms={}",
        schema,
        association,
        records.len(),
        related_by_id.len(),
        started_at.elapsed().as_millis()
    );
    Ok(())
}

/// Runs `query` joined with `association` and groups rows under owners.
///
/// `LIMIT`/`OFFSET` apply to owners, not joined rows.
///
/// # Errors
/// - `AssociationNotLoadable` when the association cannot be resolved.
/// - `UnknownField` when the query filters or orders by a non-field.
pub fn preload_join(
    conn: &Connection,
    registry: &SchemaRegistry,
    query: &Query,
    association: &str,
) -> RepoResult<Vec<Record>> {
    let wiring = loadable_wiring(registry, &query.schema, association)?;
    let started_at = Instant::now();
    let (owner_sql, bind_values) = query.select_sql(&wiring.owner)?;

    let join_clause = match &wiring.join {
        Some(join) => format!(
            "LEFT JOIN {join_table} AS j ON j.{join_owner} = o.{owner_key}
             LEFT JOIN {related} AS r ON r.{related_key} = j.{join_related}",
            join_table = quote_ident(&join.table),
            join_owner = quote_ident(&join.owner_column),
            owner_key = quote_ident(&wiring.owner_column),
            related = quote_ident(&wiring.related.table),
            related_key = quote_ident(&wiring.related_column),
            join_related = quote_ident(&join.related_column),
        ),
        None => format!(
            "LEFT JOIN {} AS r ON r.{} = o.{}",
            quote_ident(&wiring.related.table),
            quote_ident(&wiring.related_column),
            quote_ident(&wiring.owner_column)
        ),
    };
    let mut order_terms = query.order_terms(Some("o"));
    order_terms.push(format!("r.{} ASC", quote_ident(PRIMARY_KEY)));

    let sql = format!(
        "SELECT {}, {}
         FROM ({owner_sql}) AS o
         {join_clause}
         ORDER BY {};",
        select_list(&wiring.owner, Some(("o", OWNER_PREFIX))),
        select_list(&wiring.related, Some(("r", RELATED_PREFIX))),
        order_terms.join(", ")
    );

    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params_from_iter(bind_values.iter()))?;
    let mut owners: Vec<(Record, Vec<Record>)> = Vec::new();
    let mut positions: BTreeMap<i64, usize> = BTreeMap::new();
    let mut related_rows = 0_usize;
    while let Some(row) = rows.next()? {
        let Some(owner) = parse_record(row, &wiring.owner, OWNER_PREFIX)? else {
            return Err(RepoError::InvalidData(format!(
                "joined row without `{}` owner",
                wiring.owner.name
            )));
        };
        let position = match positions.get(&owner.id) {
            Some(position) => *position,
            None => {
                positions.insert(owner.id, owners.len());
                owners.push((owner, Vec::new()));
                owners.len() - 1
            }
        };
        if let Some(related) = parse_record(row, &wiring.related, RELATED_PREFIX)? {
            related_rows += 1;
            owners[position].1.push(related);
        }
    }

    let singular = !wiring.association.kind.is_collection();
    let records: Vec<Record> = owners
        .into_iter()
        .map(|(mut owner, mut related)| {
            if singular {
                related.truncate(1);
            }
            owner.set_association(association, Association::Loaded(related));
            owner
        })
        .collect();

    debug!(
        "event=preload module=repo status=ok strategy=join schema={} association={} owners={} related={} duration_ms={}",
        query.schema,
        association,
        records.len(),
        related_rows,
        started_at.elapsed().as_millis()
    );
    Ok(records)
}

/// Resolves every segment of `path` starting at `schema`, so an unknown
/// segment fails even when an earlier level fetches nothing.
fn resolve_path(registry: &SchemaRegistry, schema: &str, path: &str) -> RepoResult<()> {
    let mut current = schema.to_string();
    for segment in path.split('.') {
        current = loadable_wiring(registry, &current, segment)?.related.name.clone();
    }
    Ok(())
}

fn loadable_wiring(
    registry: &SchemaRegistry,
    schema: &str,
    association: &str,
) -> RepoResult<Wiring> {
    wiring_for(registry, schema, association).map_err(|source| {
        debug!(
            "event=preload module=repo status=error schema={} association={} error={}",
            schema, association, source
        );
        RepoError::AssociationNotLoadable {
            schema: schema.to_string(),
            association: association.to_string(),
            source,
        }
    })
}

/// Fetches related rows for one chunk of owner keys, ordered by related id.
fn fetch_related_chunk(
    conn: &Connection,
    wiring: &Wiring,
    keys: &[i64],
    related_by_id: &mut BTreeMap<i64, Record>,
    groups: &mut BTreeMap<i64, Vec<i64>>,
) -> RepoResult<()> {
    let sql = match &wiring.join {
        Some(join) => format!(
            "SELECT {}, j.{} AS {}
             FROM {} AS j
             INNER JOIN {} AS r ON r.{} = j.{}
             WHERE j.{} IN ({})
             ORDER BY r.{} ASC;",
            select_list(&wiring.related, Some(("r", ""))),
            quote_ident(&join.owner_column),
            quote_ident(OWNER_KEY_LABEL),
            quote_ident(&join.table),
            quote_ident(&wiring.related.table),
            quote_ident(&wiring.related_column),
            quote_ident(&join.related_column),
            quote_ident(&join.owner_column),
            placeholders(keys.len()),
            quote_ident(PRIMARY_KEY)
        ),
        None => format!(
            "SELECT {}, r.{} AS {}
             FROM {} AS r
             WHERE r.{} IN ({})
             ORDER BY r.{} ASC;",
            select_list(&wiring.related, Some(("r", ""))),
            quote_ident(&wiring.related_column),
            quote_ident(OWNER_KEY_LABEL),
            quote_ident(&wiring.related.table),
            quote_ident(&wiring.related_column),
            placeholders(keys.len()),
            quote_ident(PRIMARY_KEY)
        ),
    };

    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params_from_iter(keys.iter()))?;
    while let Some(row) = rows.next()? {
        let Some(related) = parse_record(row, &wiring.related, "")? else {
            continue;
        };
        let owner_key: Option<i64> = row.get(OWNER_KEY_LABEL)?;
        let Some(owner_key) = owner_key else {
            continue;
        };
        groups.entry(owner_key).or_default().push(related.id);
        related_by_id.entry(related.id).or_insert(related);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{preload_join, preload_separate};
    use crate::association::record::Record;
    use crate::db::open_db_in_memory;
    use crate::repo::query::Query;
    use crate::repo::RepoError;
    use crate::schema::ddl::provisioning_migration;
    use crate::schema::entity::EntitySchema;
    use crate::schema::registry::SchemaRegistry;
    use crate::schema::value::{FieldType, Value};
    use rusqlite::Connection;

    fn setup() -> (SchemaRegistry, Connection) {
        let mut registry = SchemaRegistry::new();
        registry
            .register(
                EntitySchema::new("movie", "movies")
                    .field("title", FieldType::Text)
                    .has_one("poster", "poster", "movie_id"),
            )
            .unwrap();
        registry
            .register(
                EntitySchema::new("poster", "posters")
                    .field("url", FieldType::Text)
                    .belongs_to("movie", "movie", "movie_id"),
            )
            .unwrap();
        let conn = open_db_in_memory(&[provisioning_migration(&registry, 1).unwrap()]).unwrap();
        conn.execute_batch(
            "INSERT INTO movies (title) VALUES ('Alien'), ('Heat');
             INSERT INTO posters (url, movie_id) VALUES ('a1', 1), ('a2', 1);",
        )
        .unwrap();
        (registry, conn)
    }

    #[test]
    fn empty_owner_slice_is_a_no_op() {
        let (registry, conn) = setup();
        let mut records: Vec<Record> = Vec::new();
        preload_separate(&conn, &registry, &mut records, "poster").unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn singular_association_keeps_first_related_by_id() {
        let (registry, conn) = setup();
        let mut movies = vec![Record::new("movie", 1), Record::new("movie", 2)];
        preload_separate(&conn, &registry, &mut movies, "poster").unwrap();

        let poster = movies[0].association("poster").one().unwrap();
        assert_eq!(poster.get("url"), Some(&Value::from("a1")));
        assert_eq!(movies[1].related("poster"), Some(&[][..]));

        let joined = preload_join(&conn, &registry, &Query::from("movie"), "poster").unwrap();
        assert_eq!(joined[0].related("poster"), movies[0].related("poster"));
        assert_eq!(joined[1].related("poster"), Some(&[][..]));
    }

    #[test]
    fn belongs_to_is_keyed_by_owner_foreign_key() {
        let (registry, conn) = setup();
        let mut posters = vec![
            Record::new("poster", 2).with_field("movie_id", 1_i64),
            Record::new("poster", 9).with_field("movie_id", Value::Null),
        ];
        preload_separate(&conn, &registry, &mut posters, "movie").unwrap();

        assert_eq!(posters[0].association("movie").one().map(|m| m.id), Some(1));
        assert_eq!(posters[1].related("movie"), Some(&[][..]));
    }

    #[test]
    fn shared_owner_keys_are_fetched_once_and_attached_to_each_owner() {
        let (registry, conn) = setup();
        let mut posters = vec![
            Record::new("poster", 1).with_field("movie_id", 1_i64),
            Record::new("poster", 2).with_field("movie_id", 1_i64),
        ];
        preload_separate(&conn, &registry, &mut posters, "movie").unwrap();

        for poster in &posters {
            assert_eq!(poster.association("movie").one().map(|m| m.id), Some(1));
        }
    }

    #[test]
    fn nested_path_is_resolved_before_fetching() {
        let (registry, conn) = setup();
        let mut movies = vec![Record::new("movie", 2)];
        let err = preload_separate(&conn, &registry, &mut movies, "poster.sequels").unwrap_err();
        assert!(matches!(
            err,
            RepoError::AssociationNotLoadable { ref schema, .. } if schema == "poster"
        ));
        assert!(!movies[0].association("poster").is_loaded());
    }

    #[test]
    fn unresolvable_association_is_not_loadable() {
        let (registry, conn) = setup();
        let mut movies = vec![Record::new("movie", 1)];
        let err = preload_separate(&conn, &registry, &mut movies, "sequels").unwrap_err();
        assert!(matches!(err, RepoError::AssociationNotLoadable { .. }));

        let err = preload_join(&conn, &registry, &Query::from("movie"), "sequels").unwrap_err();
        assert!(matches!(err, RepoError::AssociationNotLoadable { .. }));
    }

    #[test]
    fn mixed_schemas_are_rejected() {
        let (registry, conn) = setup();
        let mut records = vec![Record::new("movie", 1), Record::new("poster", 1)];
        let err = preload_separate(&conn, &registry, &mut records, "poster").unwrap_err();
        assert!(matches!(err, RepoError::InvalidData(_)));
    }
}
