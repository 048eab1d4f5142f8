//! Nested association drafts: `cast_assoc` for external input and
//! `put_assoc` for trusted records or drafts.
//!
//! # Invariants
//! - A persisted parent must have the association preloaded; matching of
//!   nested input against existing related records happens here.
//! - Loaded related records that the input omits become
//!   `AssocChange::Replace` entries; the writer applies the on-replace policy.

use super::cast::{cast, cast_value};
use super::{
    AssocChange, CastError, CastResult, Changeset, RawInput, CODE_DUPLICATE_ID, CODE_STALE_ID,
};
use crate::association::record::{Association, Record};
use crate::schema::entity::{AssociationDef, AssociationKind, EntitySchema, PRIMARY_KEY};
use crate::schema::registry::SchemaRegistry;
use crate::schema::value::{FieldType, Value};
use serde_json::Value as JsonValue;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Trusted entry for `put_assoc`.
#[derive(Debug, Clone, PartialEq)]
pub enum AssocEntry {
    /// Persisted record linked as is.
    Record(Record),
    /// Draft for a new record, or for an already related one.
    Changeset(Changeset),
}

/// Casts nested input for `association` with the same `permitted` fields
/// for every entry.
pub fn cast_assoc(
    changeset: Changeset,
    registry: &SchemaRegistry,
    association: &str,
    nested: &JsonValue,
    permitted: &[&str],
) -> CastResult<Changeset> {
    cast_assoc_with(changeset, registry, association, nested, permitted, |draft, _| {
        Ok(draft)
    })
}

/// Casts nested input for `association`, passing each nested draft and its
/// raw entry through `with` (validators, deeper `cast_assoc` calls).
///
/// Entries with an `id` of a loaded related record update that record;
/// entries without an `id` insert. An `id` matching no loaded related record
/// marks the nested draft invalid.
pub fn cast_assoc_with<F>(
    mut changeset: Changeset,
    registry: &SchemaRegistry,
    association: &str,
    nested: &JsonValue,
    permitted: &[&str],
    with: F,
) -> CastResult<Changeset>
where
    F: Fn(Changeset, &RawInput) -> CastResult<Changeset>,
{
    let declaration = declaration(&changeset.schema, association)?;
    if let AssociationKind::BelongsTo { .. } = declaration.kind {
        return Err(CastError::UnsupportedAssociation {
            association: declaration.name,
            kind: declaration.kind.label(),
        });
    }
    let related = registry.lookup(&declaration.target)?;
    let existing = loaded_related(&changeset, &declaration)?;
    let entries = nested_entries(&declaration, nested)?;

    let mut matched = BTreeSet::new();
    let mut changes = Vec::with_capacity(entries.len());
    for entry in entries {
        let requested_id = entry
            .get(PRIMARY_KEY)
            .map(|raw| cast_value(FieldType::Integer, raw));

        let change = match requested_id {
            None | Some(Ok(Value::Null)) => {
                AssocChange::Insert(with(cast(&related, None, entry, permitted)?, entry)?)
            }
            Some(Ok(Value::Integer(id))) => {
                match existing.iter().find(|record| record.id == id) {
                    Some(record) if matched.insert(id) => AssocChange::Update(with(
                        cast(&related, Some(record.clone()), entry, permitted)?,
                        entry,
                    )?),
                    Some(_) => {
                        let mut draft = with(cast(&related, None, entry, permitted)?, entry)?;
                        draft.add_error(PRIMARY_KEY, "is given more than once", CODE_DUPLICATE_ID);
                        AssocChange::Insert(draft)
                    }
                    None => {
                        let mut draft = with(cast(&related, None, entry, permitted)?, entry)?;
                        draft.add_error(
                            PRIMARY_KEY,
                            "does not belong to this association",
                            CODE_STALE_ID,
                        );
                        AssocChange::Insert(draft)
                    }
                }
            }
            Some(Ok(_)) | Some(Err(_)) => {
                let mut draft = with(cast(&related, None, entry, permitted)?, entry)?;
                draft.add_error(PRIMARY_KEY, "is not a valid integer", CODE_STALE_ID);
                AssocChange::Insert(draft)
            }
        };
        changes.push(change);
    }

    changes.extend(
        existing
            .into_iter()
            .filter(|record| !matched.contains(&record.id))
            .map(AssocChange::Replace),
    );
    changeset.set_assoc_changes(declaration.name, changes);
    Ok(changeset)
}

/// Replaces the association with trusted entries.
///
/// For belongs-to, a persisted record sets the foreign key directly and an
/// empty entry list clears it.
pub fn put_assoc(
    mut changeset: Changeset,
    registry: &SchemaRegistry,
    association: &str,
    entries: Vec<AssocEntry>,
) -> CastResult<Changeset> {
    let declaration = declaration(&changeset.schema, association)?;
    let related = registry.lookup(&declaration.target)?;
    if !declaration.kind.is_collection() && entries.len() > 1 {
        return Err(CastError::MalformedNested {
            association: declaration.name,
            reason: format!("expects at most one entry, got {}", entries.len()),
        });
    }
    for entry in &entries {
        let found = match entry {
            AssocEntry::Record(record) => record.schema.as_str(),
            AssocEntry::Changeset(draft) => draft.schema.name.as_str(),
        };
        if found != related.name {
            return Err(CastError::SchemaMismatch {
                association: declaration.name,
                expected: related.name.clone(),
                found: found.to_string(),
            });
        }
    }

    if let AssociationKind::BelongsTo { foreign_key } = &declaration.kind {
        let change = match entries.into_iter().next() {
            Some(AssocEntry::Record(record)) => {
                changeset.put_change(foreign_key.clone(), Value::Integer(record.id));
                vec![AssocChange::Link(record)]
            }
            Some(AssocEntry::Changeset(draft)) => match draft.data.as_ref().map(|record| record.id) {
                Some(id) => {
                    changeset.put_change(foreign_key.clone(), Value::Integer(id));
                    vec![AssocChange::Update(draft)]
                }
                None => vec![AssocChange::Insert(draft)],
            },
            None => {
                changeset.put_change(foreign_key.clone(), Value::Null);
                Vec::new()
            }
        };
        changeset.set_assoc_changes(declaration.name, change);
        return Ok(changeset);
    }

    let existing = loaded_related(&changeset, &declaration)?;
    let mut kept = BTreeSet::new();
    let mut changes = Vec::with_capacity(entries.len());
    for entry in entries {
        let change = match entry {
            AssocEntry::Record(record) => {
                if existing.iter().any(|current| current.id == record.id) {
                    kept.insert(record.id);
                    AssocChange::Keep(record)
                } else {
                    AssocChange::Link(record)
                }
            }
            AssocEntry::Changeset(draft) => match draft.data.as_ref().map(|record| record.id) {
                None => AssocChange::Insert(draft),
                Some(id) if existing.iter().any(|current| current.id == id) => {
                    kept.insert(id);
                    AssocChange::Update(draft)
                }
                Some(id) => {
                    return Err(CastError::MalformedNested {
                        association: declaration.name,
                        reason: format!("draft for record {id} which is not related"),
                    })
                }
            },
        };
        changes.push(change);
    }

    changes.extend(
        existing
            .into_iter()
            .filter(|record| !kept.contains(&record.id))
            .map(AssocChange::Replace),
    );
    changeset.set_assoc_changes(declaration.name, changes);
    Ok(changeset)
}

fn declaration(schema: &Arc<EntitySchema>, association: &str) -> CastResult<AssociationDef> {
    schema
        .association(association)
        .cloned()
        .ok_or_else(|| CastError::UnknownAssociation {
            schema: schema.name.clone(),
            association: association.to_string(),
        })
}

fn loaded_related(changeset: &Changeset, declaration: &AssociationDef) -> CastResult<Vec<Record>> {
    let Some(parent) = changeset.data.as_ref() else {
        return Ok(Vec::new());
    };
    match parent.association(&declaration.name) {
        Association::Loaded(records) => Ok(records.clone()),
        Association::NotLoaded => Err(CastError::AssociationNotLoaded {
            schema: changeset.schema.name.clone(),
            association: declaration.name.clone(),
        }),
    }
}

fn nested_entries<'a>(
    declaration: &AssociationDef,
    nested: &'a JsonValue,
) -> CastResult<Vec<&'a RawInput>> {
    let malformed = |reason: &str| CastError::MalformedNested {
        association: declaration.name.clone(),
        reason: reason.to_string(),
    };

    if !declaration.kind.is_collection() {
        return match nested {
            JsonValue::Null => Ok(Vec::new()),
            JsonValue::Object(entry) => Ok(vec![entry]),
            _ => Err(malformed("expects an object or null")),
        };
    }

    match nested {
        JsonValue::Null => Ok(Vec::new()),
        JsonValue::Array(items) => items
            .iter()
            .map(|item| item.as_object().ok_or_else(|| malformed("expects a list of objects")))
            .collect(),
        // Form submissions encode lists as {"0": {...}, "1": {...}}.
        JsonValue::Object(indexed) => {
            let mut keyed = indexed
                .iter()
                .map(|(key, item)| -> CastResult<(u64, &RawInput)> {
                    let index = key
                        .parse::<u64>()
                        .map_err(|_| malformed("expects numeric keys"))?;
                    let entry = item
                        .as_object()
                        .ok_or_else(|| malformed("expects object entries"))?;
                    Ok((index, entry))
                })
                .collect::<CastResult<Vec<_>>>()?;
            keyed.sort_by_key(|(index, _)| *index);
            Ok(keyed.into_iter().map(|(_, entry)| entry).collect())
        }
        _ => Err(malformed("expects a list of objects")),
    }
}

#[cfg(test)]
mod tests {
    use super::{cast_assoc, cast_assoc_with, put_assoc, AssocEntry};
    use crate::association::record::{Association, Record};
    use crate::changeset::{cast, AssocChange, CastError, Changeset, CODE_STALE_ID};
    use crate::schema::entity::EntitySchema;
    use crate::schema::registry::SchemaRegistry;
    use crate::schema::value::{FieldType, Value};
    use serde_json::json;

    fn registry() -> SchemaRegistry {
        let mut registry = SchemaRegistry::new();
        registry
            .register(
                EntitySchema::new("movie", "movies")
                    .field("title", FieldType::Text)
                    .has_many("characters", "character", "movie_id")
                    .has_one("distributor", "distributor", "movie_id")
                    .many_to_many("actors", "actor", "movies_actors", "movie_id", "actor_id"),
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
                EntitySchema::new("distributor", "distributors")
                    .field("name", FieldType::Text)
                    .field("movie_id", FieldType::Integer),
            )
            .unwrap();
        registry
            .register(EntitySchema::new("actor", "actors").field("name", FieldType::Text))
            .unwrap();
        registry
    }

    fn persisted_movie(characters: Vec<Record>) -> Record {
        let mut movie = Record::new("movie", 1).with_field("title", "Star Wars");
        movie.set_association("characters", Association::Loaded(characters));
        movie
    }

    fn character(id: i64, name: &str) -> Record {
        Record::new("character", id)
            .with_field("name", name)
            .with_field("movie_id", 1_i64)
    }

    fn movie_changeset(registry: &SchemaRegistry, data: Option<Record>) -> Changeset {
        let schema = registry.lookup("movie").unwrap();
        Changeset::new(schema, data)
    }

    #[test]
    fn matching_id_updates_and_missing_id_inserts() {
        let registry = registry();
        let movie = persisted_movie(vec![character(10, "Luke"), character(11, "Leia")]);
        let changeset = cast_assoc(
            movie_changeset(&registry, Some(movie)),
            &registry,
            "characters",
            &json!([{ "id": 10, "name": "Luke Skywalker" }, { "name": "Han" }]),
            &["name"],
        )
        .unwrap();

        let changes = changeset.assoc_changes("characters").unwrap();
        assert_eq!(changes.len(), 3);
        match &changes[0] {
            AssocChange::Update(draft) => {
                assert_eq!(draft.data.as_ref().map(|r| r.id), Some(10));
                assert_eq!(draft.change_of("name"), Some(&Value::from("Luke Skywalker")));
            }
            other => panic!("unexpected change: {other:?}"),
        }
        assert!(matches!(&changes[1], AssocChange::Insert(draft) if draft.data.is_none()));
        assert!(matches!(&changes[2], AssocChange::Replace(record) if record.id == 11));
    }

    #[test]
    fn persisted_parent_requires_preloaded_association() {
        let registry = registry();
        let movie = Record::new("movie", 1);
        let err = cast_assoc(
            movie_changeset(&registry, Some(movie)),
            &registry,
            "characters",
            &json!([]),
            &["name"],
        )
        .unwrap_err();
        assert!(matches!(err, CastError::AssociationNotLoaded { .. }));
    }

    #[test]
    fn unknown_id_marks_nested_draft_invalid() {
        let registry = registry();
        let movie = persisted_movie(vec![character(10, "Luke")]);
        let changeset = cast_assoc(
            movie_changeset(&registry, Some(movie)),
            &registry,
            "characters",
            &json!([{ "id": 10 }, { "id": 99, "name": "Ghost" }]),
            &["name"],
        )
        .unwrap();

        assert!(!changeset.is_valid());
        let errors = changeset.all_errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "characters.1.id");
        assert_eq!(errors[0].code, CODE_STALE_ID);
    }

    #[test]
    fn form_style_indexed_objects_are_ordered_by_index() {
        let registry = registry();
        let changeset = cast_assoc(
            movie_changeset(&registry, None),
            &registry,
            "characters",
            &json!({ "10": { "name": "third" }, "2": { "name": "second" }, "0": { "name": "first" } }),
            &["name"],
        )
        .unwrap();

        let names: Vec<_> = changeset
            .assoc_changes("characters")
            .unwrap()
            .iter()
            .filter_map(|change| change.changeset())
            .filter_map(|draft| draft.change_of("name").cloned())
            .collect();
        assert_eq!(
            names,
            vec![Value::from("first"), Value::from("second"), Value::from("third")]
        );
    }

    #[test]
    fn nested_validators_run_through_with() {
        let registry = registry();
        let changeset = cast_assoc_with(
            movie_changeset(&registry, None),
            &registry,
            "characters",
            &json!([{ "name": "" }]),
            &["name"],
            |draft, _| Ok(draft.validate_required(&["name"])),
        )
        .unwrap();

        assert!(!changeset.is_valid());
        assert_eq!(changeset.all_errors()[0].field, "characters.0.name");
    }

    #[test]
    fn has_one_accepts_object_and_rejects_list() {
        let registry = registry();
        let changeset = cast_assoc(
            movie_changeset(&registry, None),
            &registry,
            "distributor",
            &json!({ "name": "Fox" }),
            &["name"],
        )
        .unwrap();
        assert_eq!(changeset.assoc_changes("distributor").unwrap().len(), 1);

        let err = cast_assoc(
            movie_changeset(&registry, None),
            &registry,
            "distributor",
            &json!([{ "name": "Fox" }]),
            &["name"],
        )
        .unwrap_err();
        assert!(matches!(err, CastError::MalformedNested { .. }));
    }

    #[test]
    fn cast_assoc_rejects_belongs_to() {
        let registry = registry();
        let schema = registry.lookup("character").unwrap();
        let err = cast_assoc(
            Changeset::new(schema, None),
            &registry,
            "movie",
            &json!({ "title": "x" }),
            &["title"],
        )
        .unwrap_err();
        assert!(matches!(err, CastError::UnsupportedAssociation { .. }));
    }

    #[test]
    fn put_assoc_on_belongs_to_sets_foreign_key() {
        let registry = registry();
        let schema = registry.lookup("character").unwrap();
        let input = json!({ "name": "Chewbacca" });
        let draft = cast(&schema, None, input.as_object().unwrap(), &["name"]).unwrap();
        let movie = Record::new("movie", 7).with_field("title", "Empire");

        let draft = put_assoc(draft, &registry, "movie", vec![AssocEntry::Record(movie)]).unwrap();
        assert_eq!(draft.change_of("movie_id"), Some(&Value::Integer(7)));
        assert!(matches!(
            draft.assoc_changes("movie").unwrap(),
            [AssocChange::Link(record)] if record.id == 7
        ));
    }

    #[test]
    fn put_assoc_keeps_related_links_new_and_replaces_omitted() {
        let registry = registry();
        let mut movie = Record::new("movie", 1);
        movie.set_association(
            "actors",
            Association::Loaded(vec![Record::new("actor", 1), Record::new("actor", 2)]),
        );

        let changeset = put_assoc(
            movie_changeset(&registry, Some(movie)),
            &registry,
            "actors",
            vec![
                AssocEntry::Record(Record::new("actor", 2)),
                AssocEntry::Record(Record::new("actor", 3)),
            ],
        )
        .unwrap();

        assert!(matches!(
            changeset.assoc_changes("actors").unwrap(),
            [
                AssocChange::Keep(kept),
                AssocChange::Link(linked),
                AssocChange::Replace(replaced),
            ] if kept.id == 2 && linked.id == 3 && replaced.id == 1
        ));
    }

    #[test]
    fn put_assoc_rejects_records_of_another_schema() {
        let registry = registry();
        let err = put_assoc(
            movie_changeset(&registry, None),
            &registry,
            "actors",
            vec![AssocEntry::Record(Record::new("character", 1))],
        )
        .unwrap_err();
        assert!(matches!(err, CastError::SchemaMismatch { .. }));
    }
}
