//! MongoDB implementation of the strata-query `Store` trait
//!
//! Composed filters are projected with `Expr::to_document` and converted
//! to BSON; rows come back as relaxed extended JSON.
//!
//! ## Example
//!
//! ```rust,no_run
//! use strata_query::{Expr, Orm};
//! use strata_query_mongodb::MongoStore;
//! use std::sync::Arc;
//!
//! # async fn example<E: strata_query::Entity>(user: &E) -> strata_query::Result<()> {
//! let store = Arc::new(MongoStore::new("mongodb://localhost:27017", "app").await?);
//!
//! let rows = Orm::new(store, user)
//!     .where_(Expr::eq("status", 1))
//!     .desc_by("created_at")
//!     .limit(0, 20)
//!     .find()
//!     .await?;
//! # let _ = rows;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use bson::{Bson, Document};
use futures::TryStreamExt;
use mongodb::{
    error::{ErrorKind, WriteFailure},
    options::{ClientOptions, IndexOptions},
    Client, Collection, Database, IndexModel,
};
use serde_json::Value;
use std::sync::Arc;
use strata_query::{
    ClientRegistry, ConnectionConfig, DataError, DataRow, DocumentIndexModel, DriverSettings,
    Expr, FindOptions, Indexes, InsertOutcome, Result, SortSpec, Store, UpdateOutcome, WriteScope,
};
use tracing::{debug, error};

pub const BACKEND: &str = "mongodb";

const DUPLICATE_KEY: i32 = 11000;

/// Map a driver error: duplicate key becomes `Conflict`, the rest `Upstream`
#[track_caller]
pub fn map_error(e: mongodb::error::Error) -> DataError {
    if is_duplicate_key(&e) {
        return DataError::conflict(e.to_string());
    }
    error!("MongoDB operation failed: {}", e);
    DataError::upstream(e)
}

fn is_duplicate_key(e: &mongodb::error::Error) -> bool {
    match e.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(we)) => we.code == DUPLICATE_KEY,
        ErrorKind::Command(ce) => ce.code == DUPLICATE_KEY,
        ErrorKind::InsertMany(ime) => ime
            .write_errors
            .as_ref()
            .is_some_and(|errs| errs.iter().any(|we| we.code == DUPLICATE_KEY)),
        _ => false,
    }
}

/// JSON object to BSON document
pub fn to_document(value: &Value) -> Result<Document> {
    match bson::to_bson(value).map_err(|e| DataError::Serialization(e.to_string()))? {
        Bson::Document(doc) => Ok(doc),
        other => Err(DataError::Serialization(format!(
            "expected a document, got {}",
            other
        ))),
    }
}

fn row_to_document(row: DataRow) -> Result<Document> {
    let mut doc = Document::new();
    for (key, value) in row {
        let value = bson::to_bson(&value).map_err(|e| DataError::Serialization(e.to_string()))?;
        doc.insert(key, value);
    }
    Ok(doc)
}

fn document_to_row(doc: Document) -> DataRow {
    doc.into_iter()
        .map(|(k, v)| (k, v.into_relaxed_extjson()))
        .collect()
}

fn filter_document(filter: Option<&Expr>) -> Result<Document> {
    match filter {
        Some(expr) => to_document(&expr.to_document()),
        None => Ok(Document::new()),
    }
}

pub fn sort_document(sort: &SortSpec) -> Document {
    let mut doc = Document::new();
    for (field, order) in sort.iter() {
        doc.insert(field.clone(), order.as_i32());
    }
    doc
}

/// Update documents without top-level operators are treated as `$set`
fn update_document(update: &Value) -> Result<Document> {
    let doc = to_document(update)?;
    if doc.is_empty() || doc.keys().all(|k| k.starts_with('$')) {
        return Ok(doc);
    }
    let mut set = Document::new();
    set.insert("$set", doc);
    Ok(set)
}

pub fn index_model(model: &DocumentIndexModel) -> Result<IndexModel> {
    let mut keys = Document::new();
    for (field, kind) in &model.keys {
        let kind = bson::to_bson(kind).map_err(|e| DataError::Serialization(e.to_string()))?;
        keys.insert(field.clone(), kind);
    }

    let mut options = IndexOptions::default();
    options.name = Some(model.name.clone());
    if model.unique {
        options.unique = Some(true);
    }
    options.default_language = model.default_language.clone();

    Ok(IndexModel::builder().keys(keys).options(options).build())
}

/// MongoDB store bound to one database
#[derive(Clone)]
pub struct MongoStore {
    client: Client,
    database: Database,
}

impl MongoStore {
    /// Connect to `url` and use `database`
    pub async fn new(url: &str, database: &str) -> Result<Self> {
        debug!("Creating MongoDB store for database: {}", database);

        let options = ClientOptions::parse(url).await.map_err(|e| {
            error!("Failed to parse MongoDB URL: {}", e);
            DataError::ConnectionFailed(format!("Failed to parse MongoDB URL: {}", e))
        })?;
        Self::with_options(options, database).await
    }

    /// Connect using a resolved config section; the database name is required
    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        let database = config.database.clone().ok_or_else(|| {
            DataError::invalid_configuration(format!(
                "MongoDB config {} has no database",
                config.connection_string()
            ))
        })?;

        let mut options = ClientOptions::parse(config.url(BACKEND)).await.map_err(|e| {
            error!("Failed to parse MongoDB URL: {}", e);
            DataError::ConnectionFailed(format!("Failed to parse MongoDB URL: {}", e))
        })?;
        options.connect_timeout = Some(config.timeouts.connect);
        options.server_selection_timeout = Some(config.timeouts.connect);
        Self::with_options(options, &database).await
    }

    async fn with_options(options: ClientOptions, database: &str) -> Result<Self> {
        let client = Client::with_options(options).map_err(|e| {
            error!("Failed to create MongoDB client: {}", e);
            DataError::ConnectionFailed(format!("Failed to create MongoDB client: {}", e))
        })?;

        // Test connection
        client.list_database_names().await.map_err(|e| {
            error!("Failed to connect to MongoDB: {}", e);
            DataError::ConnectionFailed(format!("Failed to connect to MongoDB: {}", e))
        })?;

        debug!("MongoDB client created successfully");

        Ok(Self {
            database: client.database(database),
            client,
        })
    }

    /// The shared store for a config section, connecting on first use
    pub async fn shared(
        registry: &ClientRegistry<MongoStore>,
        settings: &DriverSettings,
        section: &str,
    ) -> Result<Arc<MongoStore>> {
        let key = if section.is_empty() { BACKEND } else { section };
        registry
            .get_or_try_init(key, || async move {
                let config = ConnectionConfig::from_section(settings, BACKEND, section)?;
                MongoStore::connect(&config).await
            })
            .await
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    fn collection(&self, table: &str) -> Collection<Document> {
        self.database.collection::<Document>(table)
    }

    async fn collect(cursor: mongodb::Cursor<Document>) -> Result<Vec<DataRow>> {
        let docs: Vec<Document> = cursor.try_collect().await.map_err(|e| map_error(e))?;
        Ok(docs.into_iter().map(document_to_row).collect())
    }
}

#[async_trait]
impl Store for MongoStore {
    fn store_type(&self) -> &'static str {
        BACKEND
    }

    async fn find(&self, table: &str, filter: Option<&Expr>, options: &FindOptions) -> Result<Vec<DataRow>> {
        let filter = filter_document(filter)?;
        debug!("find {} filter={}", table, filter);

        let collection = self.collection(table);
        let mut find = collection.find(filter);
        if !options.sort.is_empty() {
            find = find.sort(sort_document(&options.sort));
        }
        if options.offset > 0 {
            find = find.skip(options.offset);
        }
        if let Some(limit) = options.limit {
            find = find.limit(i64::try_from(limit).unwrap_or(i64::MAX));
        }
        let cursor = find.await.map_err(|e| map_error(e))?;
        Self::collect(cursor).await
    }

    async fn count(&self, table: &str, filter: Option<&Expr>) -> Result<u64> {
        let filter = filter_document(filter)?;
        self.collection(table)
            .count_documents(filter)
            .await
            .map_err(|e| map_error(e))
    }

    async fn distinct(&self, table: &str, field: &str, filter: Option<&Expr>) -> Result<Vec<Value>> {
        let filter = filter_document(filter)?;
        let values = self
            .collection(table)
            .distinct(field, filter)
            .await
            .map_err(|e| map_error(e))?;
        Ok(values.into_iter().map(Bson::into_relaxed_extjson).collect())
    }

    async fn aggregate(&self, table: &str, pipeline: &[Value]) -> Result<Vec<DataRow>> {
        let stages = pipeline.iter().map(to_document).collect::<Result<Vec<_>>>()?;
        debug!("aggregate {} with {} stages", table, stages.len());
        let cursor = self
            .collection(table)
            .aggregate(stages)
            .await
            .map_err(|e| map_error(e))?;
        Self::collect(cursor).await
    }

    async fn insert_one(&self, table: &str, row: DataRow) -> Result<Option<Value>> {
        let doc = row_to_document(row)?;
        let result = self
            .collection(table)
            .insert_one(doc)
            .await
            .map_err(|e| map_error(e))?;
        Ok(Some(result.inserted_id.into_relaxed_extjson()))
    }

    async fn insert_many(&self, table: &str, rows: Vec<DataRow>) -> Result<InsertOutcome> {
        if rows.is_empty() {
            return Ok(InsertOutcome::default());
        }
        let docs = rows.into_iter().map(row_to_document).collect::<Result<Vec<_>>>()?;
        let result = self
            .collection(table)
            .insert_many(docs)
            .await
            .map_err(|e| map_error(e))?;
        let mut ids: Vec<_> = result.inserted_ids.into_iter().collect();
        ids.sort_by_key(|(i, _)| *i);
        Ok(InsertOutcome {
            inserted_ids: ids.into_iter().map(|(_, id)| id.into_relaxed_extjson()).collect(),
        })
    }

    async fn update(
        &self,
        table: &str,
        filter: Option<&Expr>,
        update: &Value,
        scope: WriteScope,
        upsert: bool,
    ) -> Result<UpdateOutcome> {
        let filter = filter_document(filter)?;
        let update = update_document(update)?;
        debug!("update {} filter={} update={}", table, filter, update);

        let collection = self.collection(table);
        let result = match scope {
            WriteScope::One => collection.update_one(filter, update).upsert(upsert).await,
            WriteScope::Many => collection.update_many(filter, update).upsert(upsert).await,
        }
        .map_err(|e| map_error(e))?;

        Ok(UpdateOutcome {
            matched: result.matched_count,
            modified: result.modified_count,
            upserted_id: result.upserted_id.map(Bson::into_relaxed_extjson),
        })
    }

    async fn delete(&self, table: &str, filter: Option<&Expr>, scope: WriteScope) -> Result<u64> {
        let filter = filter_document(filter)?;
        let collection = self.collection(table);
        let result = match scope {
            WriteScope::One => collection.delete_one(filter).await,
            WriteScope::Many => collection.delete_many(filter).await,
        }
        .map_err(|e| map_error(e))?;
        Ok(result.deleted_count)
    }

    async fn create_indexes(&self, table: &str, indexes: &Indexes) -> Result<Vec<String>> {
        let models = indexes
            .to_document_models()
            .iter()
            .map(index_model)
            .collect::<Result<Vec<_>>>()?;
        if models.is_empty() {
            return Ok(Vec::new());
        }
        debug!("creating {} indexes on {}", models.len(), table);
        let result = self
            .collection(table)
            .create_indexes(models)
            .await
            .map_err(|e| map_error(e))?;
        Ok(result.index_names)
    }

    async fn drop_table(&self, table: &str) -> Result<()> {
        self.collection(table).drop().await.map_err(|e| map_error(e))
    }

    async fn close(&self) -> Result<()> {
        debug!("Closing MongoDB store");
        // MongoDB client handles cleanup automatically
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use strata_query::{IndexColumn, IndexSpec, IndexType};

    #[test]
    fn test_filter_document_conversion() {
        let expr = Expr::Or(vec![
            Expr::cond("age", "$gte", 18),
            Expr::in_values("tag", ["a", "b"]),
        ]);
        let doc = filter_document(Some(&expr)).unwrap();
        assert_eq!(
            doc,
            bson::doc! {"$or": [{"age": {"$gte": 18_i64}}, {"tag": {"$in": ["a", "b"]}}]}
        );
        assert!(filter_document(None).unwrap().is_empty());
    }

    #[test]
    fn test_sort_document_keeps_order() {
        let doc = sort_document(&SortSpec::new().desc("created_at").asc("id"));
        let keys: Vec<&String> = doc.keys().collect();
        assert_eq!(keys, ["created_at", "id"]);
        assert_eq!(doc.get_i32("created_at").unwrap(), -1);
        assert_eq!(doc.get_i32("id").unwrap(), 1);
    }

    #[test]
    fn test_update_document_wraps_plain_object() {
        assert_eq!(
            update_document(&json!({"name": "x"})).unwrap(),
            bson::doc! {"$set": {"name": "x"}}
        );
        assert_eq!(
            update_document(&json!({"$inc": {"n": 1}})).unwrap(),
            bson::doc! {"$inc": {"n": 1_i64}}
        );
    }

    #[test]
    fn test_index_model_projection() {
        let unique = index_model(&IndexSpec::unique(["user_id", "email"]).to_document_model()).unwrap();
        assert_eq!(unique.keys, bson::doc! {"user_id": -1_i64, "email": -1_i64});
        let options = unique.options.unwrap();
        assert_eq!(options.name.as_deref(), Some("U_userid_email"));
        assert_eq!(options.unique, Some(true));

        let text = IndexSpec::with_columns(
            IndexType::FullText,
            vec![IndexColumn::new("body").with_language("spanish")],
        );
        let text = index_model(&text.to_document_model()).unwrap();
        assert_eq!(text.keys, bson::doc! {"body": "text"});
        assert_eq!(text.options.unwrap().default_language.as_deref(), Some("spanish"));
    }

    #[test]
    fn test_row_round_trip_through_document() {
        let row: DataRow = [("a".to_string(), json!(1)), ("b".to_string(), json!("x"))]
            .into_iter()
            .collect();
        let doc = row_to_document(row.clone()).unwrap();
        assert_eq!(document_to_row(doc), row);
    }
}
