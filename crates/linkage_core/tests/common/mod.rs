#![allow(dead_code)]

use linkage_core::{
    cast, cast_assoc, open_db_in_memory, provisioning_migration, EntitySchema, FieldType,
    OnReplace, RawInput, Record, RecordRepository, SchemaRegistry,
};
use rusqlite::Connection;
use serde_json::{json, Value as JsonValue};

/// Movie/character/actor registry; `characters` uses `on_replace`.
pub fn registry_with(on_replace: OnReplace) -> SchemaRegistry {
    let mut registry = SchemaRegistry::new();
    registry
        .register(
            EntitySchema::new("movie", "movies")
                .field("title", FieldType::Text)
                .field("release_year", FieldType::Integer)
                .has_many("characters", "character", "movie_id")
                .on_replace(on_replace)
                .many_to_many("actors", "actor", "movies_actors", "movie_id", "actor_id")
                .on_replace(OnReplace::DeleteMissing),
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
        .register(
            EntitySchema::new("actor", "actors")
                .field("name", FieldType::Text)
                .many_to_many("movies", "movie", "movies_actors", "actor_id", "movie_id"),
        )
        .unwrap();
    registry.validate().unwrap();
    registry
}

pub fn registry() -> SchemaRegistry {
    registry_with(OnReplace::Raise)
}

pub fn provisioned(registry: &SchemaRegistry) -> Connection {
    open_db_in_memory(&[provisioning_migration(registry, 1).unwrap()]).unwrap()
}

pub fn raw(value: JsonValue) -> RawInput {
    value.as_object().cloned().unwrap()
}

/// Inserts a movie with `characters` (by name) through one nested apply.
pub fn insert_movie(
    repo: &mut impl RecordRepository,
    registry: &SchemaRegistry,
    title: &str,
    characters: &[&str],
) -> Record {
    let schema = registry.lookup("movie").unwrap();
    let draft = cast(&schema, None, &raw(json!({ "title": title })), &["title"]).unwrap();
    let nested = JsonValue::Array(
        characters
            .iter()
            .map(|name| json!({ "name": name }))
            .collect(),
    );
    let draft = cast_assoc(draft, registry, "characters", &nested, &["name"]).unwrap();
    repo.apply(draft).unwrap()
}

pub fn related_ids(record: &Record, association: &str) -> Vec<i64> {
    record
        .related(association)
        .unwrap()
        .iter()
        .map(|related| related.id)
        .collect()
}

pub fn count_rows(conn: &Connection, table: &str) -> i64 {
    conn.query_row(&format!("SELECT COUNT(*) FROM \"{table}\";"), [], |row| {
        row.get(0)
    })
    .unwrap()
}
