//! Persisted record model.
//!
//! # Invariants
//! - `id` is the stable primary key assigned by the store.
//! - An association slot is tri-state: absent/`NotLoaded`, `Loaded(empty)`,
//!   or `Loaded(records)`. Unloaded slots are never serialized.

use crate::schema::entity::PRIMARY_KEY;
use crate::schema::value::Value;
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;

/// Load state of one association slot.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Association {
    #[default]
    NotLoaded,
    /// Loaded related records in fetch (or input) order. Singular
    /// associations hold at most one record.
    Loaded(Vec<Record>),
}

impl Association {
    pub fn is_loaded(&self) -> bool {
        matches!(self, Self::Loaded(_))
    }

    /// Loaded records, or `None` while unloaded.
    pub fn records(&self) -> Option<&[Record]> {
        match self {
            Self::Loaded(records) => Some(records.as_slice()),
            Self::NotLoaded => None,
        }
    }

    /// First loaded record, for singular associations.
    pub fn one(&self) -> Option<&Record> {
        self.records().and_then(|records| records.first())
    }
}

static NOT_LOADED: Association = Association::NotLoaded;

/// Entity instance read from or written to the store.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub schema: String,
    pub id: i64,
    pub fields: BTreeMap<String, Value>,
    pub associations: BTreeMap<String, Association>,
}

impl Record {
    pub fn new(schema: impl Into<String>, id: i64) -> Self {
        Self {
            schema: schema.into(),
            id,
            fields: BTreeMap::new(),
            associations: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Value of a stored column, including the primary key.
    pub fn column(&self, column: &str) -> Value {
        if column == PRIMARY_KEY {
            return Value::Integer(self.id);
        }
        self.fields.get(column).cloned().unwrap_or(Value::Null)
    }

    pub fn association(&self, name: &str) -> &Association {
        self.associations.get(name).unwrap_or(&NOT_LOADED)
    }

    pub fn set_association(&mut self, name: impl Into<String>, association: Association) {
        self.associations.insert(name.into(), association);
    }

    /// Loaded related records of `name`, or `None` while unloaded.
    pub fn related(&self, name: &str) -> Option<&[Record]> {
        self.association(name).records()
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let loaded = self
            .associations
            .iter()
            .filter_map(|(name, association)| association.records().map(|records| (name, records)));
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry(PRIMARY_KEY, &self.id)?;
        for (name, value) in &self.fields {
            map.serialize_entry(name, value)?;
        }
        for (name, records) in loaded {
            map.serialize_entry(name, records)?;
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::{Association, Record};
    use crate::schema::value::Value;

    #[test]
    fn unknown_slots_read_as_not_loaded() {
        let record = Record::new("movie", 1);
        assert_eq!(record.association("characters"), &Association::NotLoaded);
        assert_eq!(record.related("characters"), None);
    }

    #[test]
    fn loaded_empty_differs_from_not_loaded() {
        let mut record = Record::new("movie", 1);
        record.set_association("characters", Association::Loaded(Vec::new()));
        assert!(record.association("characters").is_loaded());
        assert_eq!(record.related("characters"), Some(&[][..]));
    }

    #[test]
    fn column_reads_primary_key_and_missing_as_null() {
        let record = Record::new("character", 9).with_field("movie_id", 3_i64);
        assert_eq!(record.column("id"), Value::Integer(9));
        assert_eq!(record.column("movie_id"), Value::Integer(3));
        assert_eq!(record.column("name"), Value::Null);
    }

    #[test]
    fn serialization_skips_unloaded_associations() {
        let mut movie = Record::new("movie", 1).with_field("title", "Alien");
        movie.set_association("actors", Association::NotLoaded);
        movie.set_association(
            "characters",
            Association::Loaded(vec![Record::new("character", 4).with_field("name", "Ripley")]),
        );

        let json = serde_json::to_value(&movie).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "id": 1,
                "title": "Alien",
                "characters": [{"id": 4, "name": "Ripley"}]
            })
        );
    }
}
