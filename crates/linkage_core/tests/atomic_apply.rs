mod common;

use common::{count_rows, insert_movie, provisioned, raw, registry};
use linkage_core::{
    cast, cast_assoc, put_assoc, AssocEntry, Association, RecordRepository, RepoError,
    SqliteRecordRepository,
};
use serde_json::json;

const SQLITE_CONSTRAINT_UNIQUE: i32 = 2067;

#[test]
fn failure_on_nth_nested_insert_leaves_nothing_behind() {
    let registry = registry();
    let mut conn = provisioned(&registry);
    conn.execute_batch(
        "CREATE TRIGGER fail_second_character
         BEFORE INSERT ON characters
         WHEN (SELECT COUNT(*) FROM characters) >= 1
         BEGIN
             SELECT RAISE(ABORT, 'injected character failure');
         END;",
    )
    .unwrap();
    let mut repo = SqliteRecordRepository::try_new(&mut conn, &registry).unwrap();

    let schema = registry.lookup("movie").unwrap();
    let draft = cast(&schema, None, &raw(json!({"title": "Alien"})), &["title"]).unwrap();
    let draft = cast_assoc(
        draft,
        &registry,
        "characters",
        &json!([{"name": "Ripley"}, {"name": "Dallas"}, {"name": "Ash"}]),
        &["name"],
    )
    .unwrap();
    let err = repo.apply(draft).unwrap_err();

    match err {
        RepoError::Constraint(violation) => {
            assert!(violation.message.contains("injected character failure"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(count_rows(&conn, "movies"), 0);
    assert_eq!(count_rows(&conn, "characters"), 0);
}

#[test]
fn failed_apply_does_not_poison_the_connection() {
    let registry = registry();
    let mut conn = provisioned(&registry);
    conn.execute_batch(
        "CREATE TRIGGER reject_villains
         BEFORE INSERT ON characters
         WHEN NEW.name = 'Villain'
         BEGIN
             SELECT RAISE(ABORT, 'villains are not allowed');
         END;",
    )
    .unwrap();
    let mut repo = SqliteRecordRepository::try_new(&mut conn, &registry).unwrap();

    let schema = registry.lookup("movie").unwrap();
    let draft = cast(&schema, None, &raw(json!({"title": "Heat"})), &["title"]).unwrap();
    let draft = cast_assoc(
        draft,
        &registry,
        "characters",
        &json!([{"name": "McCauley"}, {"name": "Villain"}]),
        &["name"],
    )
    .unwrap();
    assert!(matches!(repo.apply(draft), Err(RepoError::Constraint(_))));

    insert_movie(&mut repo, &registry, "Heat", &["McCauley", "Hanna"]);
    assert_eq!(count_rows(&conn, "movies"), 1);
    assert_eq!(count_rows(&conn, "characters"), 2);
}

#[test]
fn duplicate_join_pair_surfaces_constraint_violation() {
    let registry = registry();
    let mut conn = provisioned(&registry);
    let mut repo = SqliteRecordRepository::try_new(&mut conn, &registry).unwrap();
    let schema = registry.lookup("movie").unwrap();

    let draft = cast(&schema, None, &raw(json!({"title": "Heat"})), &["title"]).unwrap();
    let draft = cast_assoc(draft, &registry, "actors", &json!([{"name": "Al Pacino"}]), &["name"])
        .unwrap();
    let heat = repo.apply(draft).unwrap();
    let pacino = heat.association("actors").one().unwrap().clone();

    let mut stale = repo.get("movie", heat.id).unwrap().unwrap();
    stale.set_association("actors", Association::Loaded(Vec::new()));
    let draft = cast(&schema, Some(stale), &raw(json!({"title": "Heat (1995)"})), &["title"])
        .unwrap();
    let draft = put_assoc(draft, &registry, "actors", vec![AssocEntry::Record(pacino)]).unwrap();
    let err = repo.apply(draft).unwrap_err();

    match err {
        RepoError::Constraint(violation) => {
            assert_eq!(violation.extended_code, SQLITE_CONSTRAINT_UNIQUE);
        }
        other => panic!("unexpected error: {other}"),
    }
    let stored = repo.get("movie", heat.id).unwrap().unwrap();
    assert_eq!(stored.get("title").map(ToString::to_string), Some("Heat".to_string()));
    assert_eq!(count_rows(&conn, "movies_actors"), 1);
}
