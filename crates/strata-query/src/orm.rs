//! Fluent query accumulator.
//!
//! An [`Orm`] is created per logical query, chain-mutated by value and
//! consumed by exactly one terminal call. Chain calls record state and do
//! no I/O. If the store could not be acquired the error is recorded and
//! every terminal returns it without touching a store; the first recorded
//! error wins.

use crate::diff::{upsert_plan, UpdateDiff};
use crate::error::{DataError, Result};
use crate::expr::Expr;
use crate::filter::FilterBuilder;
use crate::traits::{Entity, Store};
use crate::types::*;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
enum PendingUpdate {
    Unset,
    Document(Value),
    /// An empty diff: update terminals succeed without I/O
    Nothing,
}

/// Finalized state handed to a terminal
struct Prepared<'a, E: Entity> {
    store: Arc<dyn Store>,
    entity: &'a E,
    filter: Option<Expr>,
    options: FindOptions,
    update: PendingUpdate,
}

pub struct Orm<'a, E: Entity> {
    store: Option<Arc<dyn Store>>,
    entity: &'a E,
    filter: FilterBuilder,
    sort: SortSpec,
    paging: Paging,
    update: PendingUpdate,
    error: Option<DataError>,
}

impl<'a, E: Entity> Orm<'a, E> {
    pub fn new(store: Arc<dyn Store>, entity: &'a E) -> Self {
        Self {
            store: Some(store),
            entity,
            filter: FilterBuilder::new(),
            sort: SortSpec::new(),
            paging: Paging::default(),
            update: PendingUpdate::Unset,
            error: None,
        }
    }

    /// An accumulator whose store acquisition already failed
    pub fn failed(entity: &'a E, error: DataError) -> Self {
        Self {
            store: None,
            entity,
            filter: FilterBuilder::new(),
            sort: SortSpec::new(),
            paging: Paging::default(),
            update: PendingUpdate::Unset,
            error: Some(error),
        }
    }

    /// Accept the result of a store lookup directly
    pub fn acquired(store: Result<Arc<dyn Store>>, entity: &'a E) -> Self {
        match store {
            Ok(store) => Self::new(store, entity),
            Err(e) => Self::failed(entity, e),
        }
    }

    /// Record an error; an earlier one is kept
    pub fn with_error(mut self, error: DataError) -> Self {
        match &self.error {
            Some(first) => debug!("ignoring {} after earlier error {}", error, first),
            None => self.error = Some(error),
        }
        self
    }

    pub fn error(&self) -> Option<&DataError> {
        self.error.as_ref()
    }

    pub fn table(&self) -> &str {
        self.entity.table()
    }

    pub fn where_(mut self, condition: Expr) -> Self {
        self.filter = self.filter.where_(condition);
        self
    }

    pub fn and(mut self, condition: Expr) -> Self {
        self.filter = self.filter.and(condition);
        self
    }

    pub fn or(mut self, condition: Expr) -> Self {
        self.filter = self.filter.or(condition);
        self
    }

    /// `where_` from positional arguments; a bad arity is recorded as the error
    pub fn where_args(self, args: &[Value]) -> Self {
        match Expr::from_args(args) {
            Ok(expr) => self.where_(expr),
            Err(e) => self.with_error(e),
        }
    }

    pub fn and_args(self, args: &[Value]) -> Self {
        match Expr::from_args(args) {
            Ok(expr) => self.and(expr),
            Err(e) => self.with_error(e),
        }
    }

    pub fn or_args(self, args: &[Value]) -> Self {
        match Expr::from_args(args) {
            Ok(expr) => self.or(expr),
            Err(e) => self.with_error(e),
        }
    }

    pub fn where_exists(mut self, field: impl Into<String>) -> Self {
        self.filter = self.filter.where_exists(field);
        self
    }

    pub fn where_not_exists(mut self, field: impl Into<String>) -> Self {
        self.filter = self.filter.where_not_exists(field);
        self
    }

    pub fn and_exists(mut self, field: impl Into<String>) -> Self {
        self.filter = self.filter.and_exists(field);
        self
    }

    pub fn and_not_exists(mut self, field: impl Into<String>) -> Self {
        self.filter = self.filter.and_not_exists(field);
        self
    }

    pub fn or_exists(mut self, field: impl Into<String>) -> Self {
        self.filter = self.filter.or_exists(field);
        self
    }

    pub fn or_not_exists(mut self, field: impl Into<String>) -> Self {
        self.filter = self.filter.or_not_exists(field);
        self
    }

    pub fn asc_by(mut self, field: impl Into<String>) -> Self {
        self.sort.push(field, SortOrder::Ascending);
        self
    }

    pub fn desc_by(mut self, field: impl Into<String>) -> Self {
        self.sort.push(field, SortOrder::Descending);
        self
    }

    /// `(field, "ASC" | "DESC")` pairs; anything but `ASC` sorts descending
    pub fn order_by(mut self, pairs: &[(&str, &str)]) -> Self {
        for (field, order) in pairs {
            self.sort.push(*field, SortOrder::parse(order));
        }
        self
    }

    pub fn sort(mut self, sort: SortSpec) -> Self {
        for (field, order) in sort.0 {
            self.sort.push(field, order);
        }
        self
    }

    pub fn limit(mut self, offset: u64, limit: u64) -> Self {
        self.paging = Paging::new(offset, limit);
        self
    }

    pub fn paging(mut self, paging: Paging) -> Self {
        self.paging = paging;
        self
    }

    pub fn with_update(mut self, update: Value) -> Self {
        if self.update != PendingUpdate::Unset {
            warn!("replacing pending update for {}", self.entity.table());
        }
        self.update = PendingUpdate::Document(update);
        self
    }

    /// Use a partial-update diff; an empty diff turns updates into no-ops
    pub fn with_diff(self, diff: UpdateDiff) -> Self {
        if diff.is_empty() {
            let mut orm = self;
            orm.update = PendingUpdate::Nothing;
            return orm;
        }
        let document = diff.to_set_document();
        self.with_update(document)
    }

    /// The composed filter, as the store will receive it
    pub fn composed_filter(&self) -> Option<Expr> {
        self.filter.compose()
    }

    pub fn find_options(&self) -> FindOptions {
        FindOptions::new()
            .with_sort(self.sort.clone())
            .with_paging(self.paging)
    }

    fn into_parts(self) -> Result<Prepared<'a, E>> {
        if let Some(e) = self.error {
            return Err(e);
        }
        let store = self.store.ok_or_else(|| {
            DataError::ConnectionFailed(format!("no store for {}", self.entity.table()))
        })?;
        Ok(Prepared {
            store,
            entity: self.entity,
            filter: self.filter.compose(),
            options: FindOptions::new().with_sort(self.sort).with_paging(self.paging),
            update: self.update,
        })
    }

    pub async fn find(self) -> Result<Vec<DataRow>> {
        let Prepared { store, entity, filter, options, .. } = self.into_parts()?;
        debug!("find {} filter={:?} options={:?}", entity.table(), filter, options);
        store.find(entity.table(), filter.as_ref(), &options).await
    }

    pub async fn find_as<T: DeserializeOwned>(self) -> Result<Vec<T>> {
        self.find()
            .await?
            .into_iter()
            .map(decode_row)
            .collect()
    }

    pub async fn find_one(self) -> Result<DataRow> {
        let Prepared { store, entity, filter, options, .. } = self.into_parts()?;
        debug!("find_one {} filter={:?}", entity.table(), filter);
        store.find_one(entity.table(), filter.as_ref(), &options).await
    }

    pub async fn find_one_as<T: DeserializeOwned>(self) -> Result<T> {
        decode_row(self.find_one().await?)
    }

    pub async fn count(self) -> Result<u64> {
        let Prepared { store, entity, filter, .. } = self.into_parts()?;
        store.count(entity.table(), filter.as_ref()).await
    }

    pub async fn distinct(self, field: &str) -> Result<Vec<Value>> {
        let Prepared { store, entity, filter, .. } = self.into_parts()?;
        store.distinct(entity.table(), field, filter.as_ref()).await
    }

    /// Runs `pipeline` as given; chained filters are not applied
    pub async fn aggregate(self, pipeline: &[Value]) -> Result<Vec<DataRow>> {
        let Prepared { store, entity, .. } = self.into_parts()?;
        store.aggregate(entity.table(), pipeline).await
    }

    /// Insert the accumulator's entity
    pub async fn insert(self) -> Result<Option<Value>> {
        let Prepared { store, entity, .. } = self.into_parts()?;
        let row = entity.to_row()?;
        debug!("insert into {}", entity.table());
        store.insert_one(entity.table(), row).await
    }

    /// Insert `entities` into the accumulator entity's table
    pub async fn insert_many<T: Entity>(self, entities: &[T]) -> Result<InsertOutcome> {
        let Prepared { store, entity, .. } = self.into_parts()?;
        let rows = entities.iter().map(Entity::to_row).collect::<Result<Vec<_>>>()?;
        debug!("insert {} rows into {}", rows.len(), entity.table());
        store.insert_many(entity.table(), rows).await
    }

    async fn write(self, scope: WriteScope, upsert: bool) -> Result<UpdateOutcome> {
        let Prepared { store, entity, filter, update, .. } = self.into_parts()?;
        let update = match update {
            PendingUpdate::Document(doc) => doc,
            PendingUpdate::Nothing => {
                debug!("nothing to update in {}", entity.table());
                return Ok(UpdateOutcome::default());
            }
            PendingUpdate::Unset => {
                return Err(DataError::invalid_argument(format!(
                    "update on {} without an update document",
                    entity.table()
                )))
            }
        };
        debug!(
            "update {} scope={:?} upsert={} filter={:?}",
            entity.table(),
            scope,
            upsert,
            filter
        );
        store
            .update(entity.table(), filter.as_ref(), &update, scope, upsert)
            .await
    }

    pub async fn update_one(self) -> Result<UpdateOutcome> {
        self.write(WriteScope::One, false).await
    }

    pub async fn update_many(self) -> Result<UpdateOutcome> {
        self.write(WriteScope::Many, false).await
    }

    pub async fn upsert_one(self) -> Result<UpdateOutcome> {
        self.write(WriteScope::One, true).await
    }

    pub async fn upsert_many(self) -> Result<UpdateOutcome> {
        self.write(WriteScope::Many, true).await
    }

    pub async fn delete_one(self) -> Result<u64> {
        let Prepared { store, entity, filter, .. } = self.into_parts()?;
        store.delete(entity.table(), filter.as_ref(), WriteScope::One).await
    }

    pub async fn delete_many(self) -> Result<u64> {
        let Prepared { store, entity, filter, .. } = self.into_parts()?;
        store.delete(entity.table(), filter.as_ref(), WriteScope::Many).await
    }

    /// Upsert the entity keyed by its primary and unique indexes.
    ///
    /// Chained filters and updates are ignored; both are derived from the
    /// entity.
    pub async fn insert_or_update(self) -> Result<UpdateOutcome> {
        let Prepared { store, entity, .. } = self.into_parts()?;
        let row = entity.to_row()?;
        let plan = upsert_plan(&entity.indexes(), entity.schema(), &row)?;
        debug!("insert_or_update {} filter={}", entity.table(), plan.filter);
        store
            .update(entity.table(), Some(&plan.filter), &plan.update, WriteScope::One, true)
            .await
    }

    pub async fn create_indexes(self) -> Result<Vec<String>> {
        let Prepared { store, entity, .. } = self.into_parts()?;
        store.create_indexes(entity.table(), &entity.indexes()).await
    }

    pub async fn drop(self) -> Result<()> {
        let Prepared { store, entity, .. } = self.into_parts()?;
        warn!("dropping {}", entity.table());
        store.drop_table(entity.table()).await
    }
}

fn decode_row<T: DeserializeOwned>(row: DataRow) -> Result<T> {
    let object: serde_json::Map<String, Value> = row.into_iter().collect();
    Ok(serde_json::from_value(Value::Object(object))?)
}
