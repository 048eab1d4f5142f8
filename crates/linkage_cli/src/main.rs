//! CLI smoke entry point.
//!
//! # Responsibility
//! - Provision a demo movie/character/actor store and walk it through
//!   nested writes and both preload strategies.
//! - Print each stage as JSON for quick local sanity checks.
//!
//! Usage: `linkage_cli [config.json]`

use linkage_core::{
    cast, cast_assoc_with, init_logging_with, open_db_with, provisioning_migration, CoreConfig,
    Direction, EntitySchema, FieldType, OnReplace, Query, RecordRepository, SchemaRegistry,
    SqliteRecordRepository,
};
use serde_json::json;
use std::error::Error;

fn demo_registry() -> Result<SchemaRegistry, Box<dyn Error>> {
    let mut registry = SchemaRegistry::new();
    registry.register(
        EntitySchema::new("movie", "movies")
            .field("title", FieldType::Text)
            .field("release_year", FieldType::Integer)
            .has_many("characters", "character", "movie_id")
            .on_replace(OnReplace::DeleteMissing)
            .many_to_many("actors", "actor", "movies_actors", "movie_id", "actor_id"),
    )?;
    registry.register(
        EntitySchema::new("character", "characters")
            .field("name", FieldType::Text)
            .belongs_to("movie", "movie", "movie_id"),
    )?;
    registry.register(
        EntitySchema::new("actor", "actors")
            .field("name", FieldType::Text)
            .many_to_many("movies", "movie", "movies_actors", "actor_id", "movie_id"),
    )?;
    registry.validate()?;
    Ok(registry)
}

fn main() -> Result<(), Box<dyn Error>> {
    let config = match std::env::args().nth(1) {
        Some(path) => CoreConfig::from_path(path)?,
        None => CoreConfig::default(),
    };
    init_logging_with(&config)?;

    println!("linkage_core ping={}", linkage_core::ping());
    println!("linkage_core version={}", linkage_core::core_version());

    let registry = demo_registry()?;
    let mut conn = open_db_with(&config, &[provisioning_migration(&registry, 1)?])?;
    let mut repo = SqliteRecordRepository::try_new(&mut conn, &registry)?;
    let movie_schema = registry.lookup("movie")?;

    let input = json!({
        "title": "Ready Player One",
        "release_year": "2018",
        "characters": [{"name": "Parzival"}, {"name": "Art3mis"}],
        "actors": [{"name": "Tye Sheridan"}, {"name": "Olivia Cooke"}]
    });
    let raw = input.as_object().cloned().unwrap_or_default();
    let draft = cast(&movie_schema, None, &raw, &["title", "release_year"])?
        .validate_required(&["title"]);
    let draft = cast_assoc_with(
        draft,
        &registry,
        "characters",
        &input["characters"],
        &["name"],
        |nested, _| Ok(nested.validate_required(&["name"])),
    )?;
    let draft = cast_assoc_with(draft, &registry, "actors", &input["actors"], &["name"], |nested, _| {
        Ok(nested.validate_required(&["name"]))
    })?;
    let movie = repo.apply(draft)?;
    println!("inserted={}", serde_json::to_string(&movie)?);

    let first_character = movie
        .related("characters")
        .and_then(|characters| characters.first())
        .map(|character| character.id);
    let update = json!([{"id": first_character, "name": "Wade Watts"}, {"name": "Aech"}]);
    let draft = cast(&movie_schema, Some(movie), &serde_json::Map::new(), &[])?;
    let draft = cast_assoc_with(draft, &registry, "characters", &update, &["name"], |nested, _| {
        Ok(nested.validate_required(&["name"]))
    })?;
    let movie = repo.apply(draft)?;
    println!("updated={}", serde_json::to_string(&movie)?);

    let query = Query::from("movie").order_by("release_year", Direction::Desc);
    let mut joined = repo.preload_join(&query, "characters")?;
    repo.preload_separate(&mut joined, "actors")?;
    println!("preloaded={}", serde_json::to_string(&joined)?);

    log::info!(
        "event=cli_demo module=cli status=ok movies={}",
        joined.len()
    );
    Ok(())
}
