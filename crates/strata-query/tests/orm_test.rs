use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use strata_query::*;

#[derive(Debug, Clone, PartialEq)]
enum Call {
    Find {
        table: String,
        filter: Option<Value>,
        options: FindOptions,
    },
    Count(String),
    Update {
        filter: Option<Value>,
        update: Value,
        scope: WriteScope,
        upsert: bool,
    },
    Delete(WriteScope),
    Insert(Vec<DataRow>),
    CreateIndexes(Vec<String>),
    Drop(String),
}

/// In-memory store that records every call and serves canned rows
#[derive(Default)]
struct RecordingStore {
    calls: Mutex<Vec<Call>>,
    rows: Vec<DataRow>,
}

impl RecordingStore {
    fn with_rows(rows: Vec<DataRow>) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            rows,
        }
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl Store for RecordingStore {
    fn store_type(&self) -> &'static str {
        "recording"
    }

    async fn find(&self, table: &str, filter: Option<&Expr>, options: &FindOptions) -> Result<Vec<DataRow>> {
        self.record(Call::Find {
            table: table.to_string(),
            filter: filter.map(Expr::to_document),
            options: options.clone(),
        });
        let limit = options.limit.unwrap_or(u64::MAX) as usize;
        Ok(self.rows.iter().take(limit).cloned().collect())
    }

    async fn count(&self, table: &str, _filter: Option<&Expr>) -> Result<u64> {
        self.record(Call::Count(table.to_string()));
        Ok(self.rows.len() as u64)
    }

    async fn distinct(&self, _table: &str, field: &str, _filter: Option<&Expr>) -> Result<Vec<Value>> {
        Ok(self.rows.iter().filter_map(|r| r.get(field).cloned()).collect())
    }

    async fn insert_one(&self, _table: &str, row: DataRow) -> Result<Option<Value>> {
        let id = row.get("id").cloned();
        self.record(Call::Insert(vec![row]));
        Ok(id)
    }

    async fn insert_many(&self, _table: &str, rows: Vec<DataRow>) -> Result<InsertOutcome> {
        let inserted_ids = rows.iter().filter_map(|r| r.get("id").cloned()).collect();
        self.record(Call::Insert(rows));
        Ok(InsertOutcome { inserted_ids })
    }

    async fn update(
        &self,
        _table: &str,
        filter: Option<&Expr>,
        update: &Value,
        scope: WriteScope,
        upsert: bool,
    ) -> Result<UpdateOutcome> {
        self.record(Call::Update {
            filter: filter.map(Expr::to_document),
            update: update.clone(),
            scope,
            upsert,
        });
        Ok(UpdateOutcome {
            matched: 1,
            modified: 1,
            upserted_id: None,
        })
    }

    async fn delete(&self, _table: &str, _filter: Option<&Expr>, scope: WriteScope) -> Result<u64> {
        self.record(Call::Delete(scope));
        Ok(match scope {
            WriteScope::One => 1,
            WriteScope::Many => self.rows.len() as u64,
        })
    }

    async fn create_indexes(&self, _table: &str, indexes: &Indexes) -> Result<Vec<String>> {
        let names: Vec<String> = indexes.iter().map(IndexSpec::name).collect();
        self.record(Call::CreateIndexes(names.clone()));
        Ok(names)
    }

    async fn drop_table(&self, table: &str) -> Result<()> {
        self.record(Call::Drop(table.to_string()));
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct User {
    id: u64,
    email: String,
    name: String,
    created_at: i64,
}

static USER_FIELDS: &[FieldSpec] = &[
    FieldSpec::new("id").key(),
    FieldSpec::new("email"),
    FieldSpec::new("name"),
    FieldSpec::new("created_at"),
];

impl Entity for User {
    fn table(&self) -> &str {
        "users"
    }

    fn indexes(&self) -> Indexes {
        Indexes::new()
            .with(IndexSpec::primary(["id"]))
            .with(IndexSpec::unique(["email"]))
            .with(IndexSpec::index(["created_at"]))
    }

    fn schema(&self) -> EntitySchema {
        EntitySchema(USER_FIELDS)
    }
}

fn user() -> User {
    User {
        id: 7,
        email: "ada@example.com".to_string(),
        name: "Ada".to_string(),
        created_at: 1_700_000_000,
    }
}

fn row(id: u64, name: &str) -> DataRow {
    [("id".to_string(), json!(id)), ("name".to_string(), json!(name))]
        .into_iter()
        .collect()
}

#[tokio::test]
async fn test_find_hands_composed_state_to_store() {
    let store = Arc::new(RecordingStore::with_rows(vec![row(1, "a"), row(2, "b")]));
    let entity = user();

    let rows = Orm::new(store.clone(), &entity)
        .where_(Expr::eq("status", 1))
        .and_args(&[json!("age"), json!(">="), json!(18)])
        .or_exists("vip")
        .order_by(&[("created_at", "DESC"), ("id", "ASC")])
        .limit(10, 20)
        .find()
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);

    let calls = store.calls();
    assert_eq!(
        calls,
        vec![Call::Find {
            table: "users".to_string(),
            filter: Some(json!({"$and": [
                {"$and": [{"status": 1}, {"age": {"$gte": 18}}]},
                {"$or": [{"vip": {"$exists": true}}]}
            ]})),
            options: FindOptions::new()
                .with_sort(SortSpec::new().desc("created_at").asc("id"))
                .with_paging(Paging::new(10, 20)),
        }]
    );
}

#[tokio::test]
async fn test_find_one_not_found_vs_empty_find() {
    let store = Arc::new(RecordingStore::default());
    let entity = user();

    let rows = Orm::new(store.clone(), &entity).find().await.unwrap();
    assert!(rows.is_empty());

    let err = Orm::new(store.clone(), &entity).find_one().await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_find_as_decodes_rows() {
    #[derive(Deserialize)]
    struct Named {
        id: u64,
        name: String,
    }

    let store = Arc::new(RecordingStore::with_rows(vec![row(3, "c")]));
    let entity = user();
    let named: Named = Orm::new(store, &entity).find_one_as().await.unwrap();
    assert_eq!(named.id, 3);
    assert_eq!(named.name, "c");
}

#[tokio::test]
async fn test_recorded_error_short_circuits_every_terminal() {
    let store = Arc::new(RecordingStore::default());
    let entity = user();
    let acquire_error = DataError::ConnectionFailed("pool exhausted".to_string());

    let err = Orm::failed(&entity, acquire_error.clone())
        .with_error(DataError::invalid_argument("later"))
        .count()
        .await
        .unwrap_err();
    assert_eq!(err, acquire_error);

    let err = Orm::acquired(Err(acquire_error.clone()), &entity)
        .with_update(json!({"$set": {"name": "x"}}))
        .update_many()
        .await
        .unwrap_err();
    assert_eq!(err, acquire_error);

    let err = Orm::new(store.clone(), &entity)
        .with_error(acquire_error.clone())
        .delete_many()
        .await
        .unwrap_err();
    assert_eq!(err, acquire_error);

    assert!(store.calls().is_empty());
}

#[tokio::test]
async fn test_bad_arity_is_recorded_not_fatal() {
    let store = Arc::new(RecordingStore::default());
    let entity = user();

    let err = Orm::new(store.clone(), &entity)
        .where_args(&[json!("a"), json!("="), json!(1), json!("extra")])
        .find()
        .await
        .unwrap_err();
    assert!(err.is_invalid_argument());
    assert!(store.calls().is_empty());
}

#[tokio::test]
async fn test_update_requires_document() {
    let store = Arc::new(RecordingStore::default());
    let entity = user();

    let err = Orm::new(store.clone(), &entity)
        .where_(Expr::eq("id", 1))
        .update_one()
        .await
        .unwrap_err();
    assert!(err.is_invalid_argument());
    assert!(store.calls().is_empty());
}

#[tokio::test]
async fn test_update_with_diff() {
    let store = Arc::new(RecordingStore::default());
    let entity = user();

    let diff = UpdateDiff::compose(&[
        ArgStmt::new("name", "Grace"),
        ArgStmt::optional::<String>("email", None),
    ]);
    let outcome = Orm::new(store.clone(), &entity)
        .where_(Expr::eq("id", 7))
        .with_diff(diff)
        .upsert_one()
        .await
        .unwrap();
    assert_eq!(outcome.matched, 1);

    assert_eq!(
        store.calls(),
        vec![Call::Update {
            filter: Some(json!({"id": 7})),
            update: json!({"$set": {"name": "Grace"}}),
            scope: WriteScope::One,
            upsert: true,
        }]
    );
}

#[tokio::test]
async fn test_empty_diff_skips_io() {
    let store = Arc::new(RecordingStore::default());
    let entity = user();

    let outcome = Orm::new(store.clone(), &entity)
        .where_(Expr::eq("id", 7))
        .with_diff(UpdateDiff::compose(&[ArgStmt::new("name", "x").valid(false)]))
        .update_many()
        .await
        .unwrap();
    assert_eq!(outcome, UpdateOutcome::default());
    assert!(store.calls().is_empty());
}

#[tokio::test]
async fn test_insert_or_update_uses_key_indexes() {
    let store = Arc::new(RecordingStore::default());
    let entity = user();

    Orm::new(store.clone(), &entity)
        .insert_or_update()
        .await
        .unwrap();

    assert_eq!(
        store.calls(),
        vec![Call::Update {
            filter: Some(json!({"$or": [{"id": 7}, {"email": "ada@example.com"}]})),
            update: json!({
                "$set": {"name": "Ada"},
                "$setOnInsert": {"id": 7, "email": "ada@example.com", "created_at": 1_700_000_000}
            }),
            scope: WriteScope::One,
            upsert: true,
        }]
    );
}

#[tokio::test]
async fn test_insert_and_index_lifecycle() {
    let store = Arc::new(RecordingStore::default());
    let entity = user();

    let id = Orm::new(store.clone(), &entity).insert().await.unwrap();
    assert_eq!(id, Some(json!(7)));

    let names = Orm::new(store.clone(), &entity).create_indexes().await.unwrap();
    assert_eq!(names, vec!["PRIMARY", "U_email", "I_createdat"]);

    let outcome = Orm::new(store.clone(), &entity)
        .insert_many(&[user(), User { id: 8, ..user() }])
        .await
        .unwrap();
    assert_eq!(outcome.inserted_ids, vec![json!(7), json!(8)]);

    Orm::new(store.clone(), &entity).drop().await.unwrap();
    assert_eq!(store.calls().last(), Some(&Call::Drop("users".to_string())));
}

#[tokio::test]
async fn test_delete_and_count() {
    let store = Arc::new(RecordingStore::with_rows(vec![row(1, "a"), row(2, "b")]));
    let entity = user();

    assert_eq!(Orm::new(store.clone(), &entity).count().await.unwrap(), 2);
    assert_eq!(
        Orm::new(store.clone(), &entity)
            .where_(Expr::eq("id", 1))
            .delete_one()
            .await
            .unwrap(),
        1
    );
    assert_eq!(
        Orm::new(store.clone(), &entity).distinct("name").await.unwrap(),
        vec![json!("a"), json!("b")]
    );
    assert!(matches!(
        Orm::new(store.clone(), &entity).aggregate(&[]).await,
        Err(DataError::OperationNotSupported(_))
    ));
}
