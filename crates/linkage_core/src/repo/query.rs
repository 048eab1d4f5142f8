//! Owner query value consumed by `all` and `preload_join`.
//!
//! # Invariants
//! - Filter and order fields must be stored columns of the queried schema.
//! - Ordering always ends with `id ASC` so owner order is deterministic.

use super::{RepoError, RepoResult};
use crate::schema::entity::{quote_ident, EntitySchema, PRIMARY_KEY};
use crate::schema::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

impl Direction {
    fn sql(self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq(String, Value),
    In(String, Vec<Value>),
    IsNull(String),
}

impl Filter {
    fn field(&self) -> &str {
        match self {
            Self::Eq(field, _) | Self::In(field, _) | Self::IsNull(field) => field,
        }
    }
}

/// Filtered, ordered fetch of one schema's records.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub schema: String,
    pub filters: Vec<Filter>,
    pub order_by: Vec<(String, Direction)>,
    pub limit: Option<u32>,
    pub offset: u32,
}

impl Query {
    pub fn from(schema: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            filters: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            offset: 0,
        }
    }

    pub fn filter_eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::Eq(field.into(), value.into()));
        self
    }

    pub fn filter_in(mut self, field: impl Into<String>, values: Vec<Value>) -> Self {
        self.filters.push(Filter::In(field.into(), values));
        self
    }

    pub fn filter_null(mut self, field: impl Into<String>) -> Self {
        self.filters.push(Filter::IsNull(field.into()));
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.order_by.push((field.into(), direction));
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u32) -> Self {
        self.offset = offset;
        self
    }

    /// Builds the owner `SELECT` with bound values, in column order.
    pub(crate) fn select_sql(&self, schema: &EntitySchema) -> RepoResult<(String, Vec<Value>)> {
        self.check_fields(schema)?;
        let mut sql = format!(
            "SELECT {} FROM {}",
            select_list(schema, None),
            quote_ident(&schema.table)
        );
        let mut bind_values = Vec::new();

        let mut conditions = Vec::new();
        for filter in &self.filters {
            match filter {
                Filter::Eq(field, Value::Null) | Filter::IsNull(field) => {
                    conditions.push(format!("{} IS NULL", quote_ident(field)));
                }
                Filter::Eq(field, value) => {
                    conditions.push(format!("{} = ?", quote_ident(field)));
                    bind_values.push(value.clone());
                }
                Filter::In(_, values) if values.is_empty() => conditions.push("0 = 1".to_string()),
                Filter::In(field, values) => {
                    conditions.push(format!(
                        "{} IN ({})",
                        quote_ident(field),
                        placeholders(values.len())
                    ));
                    bind_values.extend(values.iter().cloned());
                }
            }
        }
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }

        sql.push_str(" ORDER BY ");
        sql.push_str(&self.order_terms(None).join(", "));

        if let Some(limit) = self.limit {
            sql.push_str(" LIMIT ?");
            bind_values.push(Value::Integer(i64::from(limit)));
            if self.offset > 0 {
                sql.push_str(" OFFSET ?");
                bind_values.push(Value::Integer(i64::from(self.offset)));
            }
        } else if self.offset > 0 {
            sql.push_str(" LIMIT -1 OFFSET ?");
            bind_values.push(Value::Integer(i64::from(self.offset)));
        }

        Ok((sql, bind_values))
    }

    /// `ORDER BY` terms, optionally qualified by a table alias.
    pub(crate) fn order_terms(&self, alias: Option<&str>) -> Vec<String> {
        let qualify = |field: &str| match alias {
            Some(alias) => format!("{alias}.{}", quote_ident(field)),
            None => quote_ident(field),
        };
        let mut terms: Vec<String> = self
            .order_by
            .iter()
            .map(|(field, direction)| format!("{} {}", qualify(field), direction.sql()))
            .collect();
        terms.push(format!("{} ASC", qualify(PRIMARY_KEY)));
        terms
    }

    fn check_fields(&self, schema: &EntitySchema) -> RepoResult<()> {
        let fields = self
            .filters
            .iter()
            .map(Filter::field)
            .chain(self.order_by.iter().map(|(field, _)| field.as_str()));
        for field in fields {
            if schema.field_type(field).is_none() {
                return Err(RepoError::UnknownField {
                    schema: schema.name.clone(),
                    field: field.to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Comma separated column list, optionally aliased as `{prefix}{column}`.
pub(crate) fn select_list(schema: &EntitySchema, aliased: Option<(&str, &str)>) -> String {
    schema
        .columns()
        .map(|column| match aliased {
            Some((table_alias, prefix)) => format!(
                "{table_alias}.{} AS {}",
                quote_ident(column),
                quote_ident(&format!("{prefix}{column}"))
            ),
            None => quote_ident(column),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

pub(crate) fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

#[cfg(test)]
mod tests {
    use super::{Direction, Query};
    use crate::repo::RepoError;
    use crate::schema::entity::EntitySchema;
    use crate::schema::value::{FieldType, Value};

    fn movie() -> EntitySchema {
        EntitySchema::new("movie", "movies")
            .field("title", FieldType::Text)
            .field("release_year", FieldType::Integer)
    }

    #[test]
    fn select_sql_appends_id_tiebreak_and_binds_in_order() {
        let (sql, values) = Query::from("movie")
            .filter_eq("release_year", 1977_i64)
            .filter_in("title", vec![Value::from("A"), Value::from("B")])
            .order_by("title", Direction::Desc)
            .limit(5)
            .offset(10)
            .select_sql(&movie())
            .unwrap();

        assert_eq!(
            sql,
            "SELECT \"id\", \"title\", \"release_year\" FROM \"movies\" \
             WHERE \"release_year\" = ? AND \"title\" IN (?, ?) \
             ORDER BY \"title\" DESC, \"id\" ASC LIMIT ? OFFSET ?"
        );
        assert_eq!(
            values,
            vec![
                Value::Integer(1977),
                Value::from("A"),
                Value::from("B"),
                Value::Integer(5),
                Value::Integer(10),
            ]
        );
    }

    #[test]
    fn null_equality_becomes_is_null() {
        let (sql, values) = Query::from("movie")
            .filter_eq("title", Value::Null)
            .select_sql(&movie())
            .unwrap();
        assert!(sql.contains("\"title\" IS NULL"));
        assert!(values.is_empty());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = Query::from("movie")
            .order_by("budget", Direction::Asc)
            .select_sql(&movie())
            .unwrap_err();
        assert!(matches!(err, RepoError::UnknownField { field, .. } if field == "budget"));
    }
}
