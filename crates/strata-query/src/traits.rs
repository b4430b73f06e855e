use crate::diff::EntitySchema;
use crate::error::{DataError, Result};
use crate::expr::Expr;
use crate::index::Indexes;
use crate::types::*;
use async_trait::async_trait;
use downcast_rs::{impl_downcast, Downcast};
use serde::Serialize;
use serde_json::Value;

/// A persisted type: where it lives, how it is indexed, which fields an
/// upsert may rewrite
pub trait Entity: Serialize + Send + Sync {
    /// Table or collection name
    fn table(&self) -> &str;

    fn indexes(&self) -> Indexes;

    fn schema(&self) -> EntitySchema {
        EntitySchema::EMPTY
    }

    /// The entity as a row; must serialize to a JSON object
    fn to_row(&self) -> Result<DataRow> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map.into_iter().collect()),
            other => Err(DataError::Serialization(format!(
                "entity for {} serialized to a non-object: {}",
                self.table(),
                other
            ))),
        }
    }
}

/// Execution interface every backend implements.
///
/// Filters arrive already composed; `None` matches everything. `find`
/// returns an empty list when nothing matches, `find_one` returns
/// `NotFound`.
#[async_trait]
pub trait Store: Send + Sync + Downcast {
    /// Backend identifier (mongodb, postgres, ...)
    fn store_type(&self) -> &'static str;

    async fn find(&self, table: &str, filter: Option<&Expr>, options: &FindOptions) -> Result<Vec<DataRow>>;

    async fn find_one(&self, table: &str, filter: Option<&Expr>, options: &FindOptions) -> Result<DataRow> {
        let options = options.clone().with_limit(1);
        self.find(table, filter, &options)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| DataError::not_found(format!("no row in {} matches the filter", table)))
    }

    async fn count(&self, table: &str, filter: Option<&Expr>) -> Result<u64>;

    async fn distinct(&self, table: &str, field: &str, filter: Option<&Expr>) -> Result<Vec<Value>>;

    /// Run a backend-native pipeline
    async fn aggregate(&self, table: &str, _pipeline: &[Value]) -> Result<Vec<DataRow>> {
        Err(DataError::operation_not_supported(format!(
            "{} does not support aggregation on {}",
            self.store_type(),
            table
        )))
    }

    /// Returns the inserted id when the backend assigns one
    async fn insert_one(&self, table: &str, row: DataRow) -> Result<Option<Value>>;

    async fn insert_many(&self, table: &str, rows: Vec<DataRow>) -> Result<InsertOutcome>;

    /// `update` is a `{"$set": ...}`-style document
    async fn update(
        &self,
        table: &str,
        filter: Option<&Expr>,
        update: &Value,
        scope: WriteScope,
        upsert: bool,
    ) -> Result<UpdateOutcome>;

    /// Returns the number of deleted rows
    async fn delete(&self, table: &str, filter: Option<&Expr>, scope: WriteScope) -> Result<u64>;

    /// Returns the names of the indexes now present. Creating an existing
    /// index is a no-op.
    async fn create_indexes(&self, table: &str, indexes: &Indexes) -> Result<Vec<String>>;

    async fn drop_table(&self, table: &str) -> Result<()>;

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

impl_downcast!(Store);
