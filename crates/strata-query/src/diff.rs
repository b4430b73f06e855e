//! Partial updates and upsert planning.
//!
//! [`UpdateDiff`] keeps only the fields a caller marked valid and did not
//! ask to ignore. [`EntitySchema`] is a static per-entity field table that
//! drives [`upsert_plan`], the filter/`$set` pair used by `insert_or_update`.

use crate::error::{DataError, Result};
use crate::expr::Expr;
use crate::index::{IndexType, Indexes};
use crate::sql::SqlDialect;
use crate::types::DataRow;
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;

/// Field that is never rewritten by an upsert
pub const CREATED_AT: &str = "created_at";

/// One candidate assignment
#[derive(Debug, Clone, PartialEq)]
pub struct ArgStmt {
    pub field: String,
    pub value: Value,
    pub valid: bool,
    /// Fields to leave untouched; the entry is dropped if its own field is listed
    pub ignores: Vec<String>,
}

impl ArgStmt {
    pub fn new(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
            valid: true,
            ignores: Vec::new(),
        }
    }

    /// Entry from an optional value; `None` is invalid
    pub fn optional<V: Into<Value>>(field: impl Into<String>, value: Option<V>) -> Self {
        let valid = value.is_some();
        Self {
            field: field.into(),
            value: value.map(Into::into).unwrap_or(Value::Null),
            valid,
            ignores: Vec::new(),
        }
    }

    pub fn valid(mut self, valid: bool) -> Self {
        self.valid = valid;
        self
    }

    pub fn ignoring<I: IntoIterator<Item = S>, S: Into<String>>(mut self, fields: I) -> Self {
        self.ignores.extend(fields.into_iter().map(Into::into));
        self
    }

    fn is_kept(&self) -> bool {
        self.valid && !self.ignores.iter().any(|f| *f == self.field)
    }
}

/// Ordered `(field, value)` assignments that survived filtering
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateDiff {
    fields: Vec<String>,
    values: Vec<Value>,
}

impl UpdateDiff {
    pub fn compose(entries: &[ArgStmt]) -> Self {
        let mut diff = Self::default();
        for entry in entries.iter().filter(|e| e.is_kept()) {
            diff.fields.push(entry.field.clone());
            diff.values.push(entry.value.clone());
        }
        diff
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// `a=?, b=?` or `"a"=$1, "b"=$2`
    pub fn set_clause(&self, dialect: SqlDialect) -> String {
        self.fields
            .iter()
            .enumerate()
            .map(|(i, field)| format!("{}={}", dialect.quote_ident(field), dialect.placeholder(i + 1)))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Values followed by the lookup key, for `SET ... WHERE key=?`
    pub fn args_with_key(&self, key: impl Into<Value>) -> Vec<Value> {
        let mut args = self.values.clone();
        args.push(key.into());
        args
    }

    /// `{"$set": {field: value, ...}}`
    pub fn to_set_document(&self) -> Value {
        let set: Map<String, Value> = self
            .fields
            .iter()
            .cloned()
            .zip(self.values.iter().cloned())
            .collect();
        json!({ "$set": set })
    }

    pub fn into_pairs(self) -> Vec<(String, Value)> {
        self.fields.into_iter().zip(self.values).collect()
    }
}

/// Static description of one persisted field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    /// Rust-side name
    pub name: &'static str,
    /// Column or document key
    pub storage_key: &'static str,
    pub updatable: bool,
    pub part_of_key: bool,
}

impl FieldSpec {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            storage_key: name,
            updatable: true,
            part_of_key: false,
        }
    }

    pub const fn stored_as(mut self, storage_key: &'static str) -> Self {
        self.storage_key = storage_key;
        self
    }

    pub const fn no_update(mut self) -> Self {
        self.updatable = false;
        self
    }

    pub const fn key(mut self) -> Self {
        self.part_of_key = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntitySchema(pub &'static [FieldSpec]);

impl EntitySchema {
    pub const EMPTY: EntitySchema = EntitySchema(&[]);

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn fields(&self) -> &'static [FieldSpec] {
        self.0
    }
}

impl Default for EntitySchema {
    fn default() -> Self {
        Self::EMPTY
    }
}

/// Filter and update document for an insert-or-update
#[derive(Debug, Clone, PartialEq)]
pub struct UpsertPlan {
    pub filter: Expr,
    pub update: Value,
}

/// Build the upsert filter from the primary and unique indexes and the
/// `$set` document from the remaining fields.
///
/// The filter ANDs the fields of each key index and ORs the indexes
/// together. Key fields, `created_at`, non-updatable fields and fields
/// flagged `part_of_key` never appear in `$set`. Without a schema every
/// row key except those is updated. Row fields left out of `$set` go to
/// `$setOnInsert` so a freshly inserted document is complete.
pub fn upsert_plan(indexes: &Indexes, schema: EntitySchema, row: &DataRow) -> Result<UpsertPlan> {
    let keys = indexes.list(&[IndexType::Primary, IndexType::Unique]);
    if keys.is_empty() {
        return Err(DataError::invalid_argument("missing primary or unique key"));
    }

    let mut key_fields = BTreeSet::new();
    let mut groups = Vec::with_capacity(keys.len());
    for (name, fields) in &keys {
        let mut conds = Vec::with_capacity(fields.len());
        for field in fields {
            let value = row.get(field).ok_or_else(|| {
                DataError::invalid_argument(format!("{} value missing for key {}", field, name))
            })?;
            conds.push(Expr::eq(field.clone(), value.clone()));
            key_fields.insert(field.as_str());
        }
        groups.push(if conds.len() == 1 {
            conds.remove(0)
        } else {
            Expr::And(conds)
        });
    }
    let filter = if groups.len() == 1 {
        groups.remove(0)
    } else {
        Expr::Or(groups)
    };

    let skip = |key: &str| key_fields.contains(key) || key == CREATED_AT;
    let mut set = Map::new();
    if schema.is_empty() {
        for (name, value) in row.iter().filter(|(k, _)| !skip(k.as_str())) {
            set.insert(name.clone(), value.clone());
        }
    } else {
        for spec in schema.fields() {
            if !spec.updatable || spec.part_of_key || skip(spec.storage_key) {
                continue;
            }
            if let Some(value) = row.get(spec.storage_key) {
                set.insert(spec.storage_key.to_string(), value.clone());
            }
        }
    }

    let on_insert: Map<String, Value> = row
        .iter()
        .filter(|(k, _)| !set.contains_key(k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    let mut update = Map::new();
    if !set.is_empty() {
        update.insert("$set".to_string(), Value::Object(set));
    }
    if !on_insert.is_empty() {
        update.insert("$setOnInsert".to_string(), Value::Object(on_insert));
    }
    Ok(UpsertPlan {
        filter,
        update: Value::Object(update),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::IndexSpec;

    #[test]
    fn test_compose_excludes_invalid_and_ignored() {
        let diff = UpdateDiff::compose(&[
            ArgStmt::new("name", "Aario"),
            ArgStmt::new("age", 30).valid(false),
            ArgStmt::new("email", "a@b.c").ignoring(["email"]),
            ArgStmt::new("city", "Paris").ignoring(["name"]),
            ArgStmt::optional::<i64>("score", None),
        ]);
        assert!(!diff.is_empty());
        assert_eq!(diff.fields(), ["name".to_string(), "city".to_string()]);
        assert_eq!(diff.values(), [json!("Aario"), json!("Paris")]);
        assert_eq!(diff.set_clause(SqlDialect::MySql), "`name`=?, `city`=?");
        assert_eq!(diff.set_clause(SqlDialect::Postgres), "\"name\"=$1, \"city\"=$2");
        assert_eq!(diff.args_with_key(9), vec![json!("Aario"), json!("Paris"), json!(9)]);
    }

    #[test]
    fn test_compose_empty_is_not_an_error() {
        let diff = UpdateDiff::compose(&[ArgStmt::new("a", 1).valid(false)]);
        assert!(diff.is_empty());
        assert!(diff.fields().is_empty());
        assert!(diff.values().is_empty());
    }

    #[test]
    fn test_set_document() {
        let diff = UpdateDiff::compose(&[ArgStmt::new("a", 1), ArgStmt::new("b", "x")]);
        assert_eq!(diff.to_set_document(), json!({"$set": {"a": 1, "b": "x"}}));
    }

    static USER_FIELDS: &[FieldSpec] = &[
        FieldSpec::new("id").key(),
        FieldSpec::new("email"),
        FieldSpec::new("display_name").stored_as("name"),
        FieldSpec::new("password_hash").no_update(),
        FieldSpec::new("created_at"),
    ];

    fn user_row() -> DataRow {
        [
            ("id", json!(1)),
            ("email", json!("a@b.c")),
            ("name", json!("Aario")),
            ("password_hash", json!("x")),
            ("created_at", json!(1700000000)),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
    }

    #[test]
    fn test_upsert_plan_with_schema() {
        let indexes = Indexes::new()
            .with(IndexSpec::primary(["id"]))
            .with(IndexSpec::unique(["email"]));
        let plan = upsert_plan(&indexes, EntitySchema(USER_FIELDS), &user_row()).unwrap();

        assert_eq!(
            plan.filter,
            Expr::Or(vec![Expr::eq("id", 1), Expr::eq("email", "a@b.c")])
        );
        assert_eq!(
            plan.update,
            json!({
                "$set": {"name": "Aario"},
                "$setOnInsert": {
                    "id": 1,
                    "email": "a@b.c",
                    "password_hash": "x",
                    "created_at": 1700000000
                }
            })
        );
    }

    #[test]
    fn test_upsert_plan_composite_key_without_schema() {
        let indexes = Indexes::new().with(IndexSpec::unique(["tenant", "slug"]));
        let row: DataRow = [
            ("tenant", json!(2)),
            ("slug", json!("home")),
            ("title", json!("Home")),
            ("body", json!("...")),
            ("created_at", json!(1)),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        let plan = upsert_plan(&indexes, EntitySchema::EMPTY, &row).unwrap();
        assert_eq!(
            plan.filter,
            Expr::And(vec![Expr::eq("tenant", 2), Expr::eq("slug", "home")])
        );
        assert_eq!(
            plan.update,
            json!({
                "$set": {"body": "...", "title": "Home"},
                "$setOnInsert": {"tenant": 2, "slug": "home", "created_at": 1}
            })
        );
    }

    #[test]
    fn test_upsert_plan_requires_key() {
        let indexes = Indexes::new().with(IndexSpec::index(["name"]));
        let err = upsert_plan(&indexes, EntitySchema::EMPTY, &user_row()).unwrap_err();
        assert_eq!(err, DataError::invalid_argument("missing primary or unique key"));

        let indexes = Indexes::new().with(IndexSpec::unique(["phone"]));
        assert!(upsert_plan(&indexes, EntitySchema::EMPTY, &user_row())
            .unwrap_err()
            .is_invalid_argument());
    }
}
