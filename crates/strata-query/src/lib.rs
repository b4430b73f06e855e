//! # strata-query
//!
//! Backend-neutral query composition for document, relational and key-value
//! stores.
//!
//! This crate builds filters, sort/paging options, partial updates and
//! federated shard queries without doing any I/O. Backends execute them
//! through the [`Store`] trait:
//! - MongoDB (`strata-query-mongodb`)
//! - PostgreSQL (`strata-query-postgres`)
//! - Redis helpers (`strata-query-redis`)
//!
//! ## Architecture
//!
//! - **operator**: symbolic (`=`, `>=`, `&`, ...) to native operator translation
//! - **filter**: run-grouped AND/OR composition of conditions
//! - **index**: index declarations and canonical index names
//! - **diff**: partial-update diffs, entity schemas, upsert planning
//! - **federation**: `UNION ALL` planning over sharded tables
//! - **sql**: parameterized SQL rendering of composed filters
//! - **orm**: the fluent accumulator that hands everything to a [`Store`]
//! - **registry** / **settings**: client registry and section-based config
//!
//! ## Example
//!
//! ```rust
//! use strata_query::{Expr, FilterBuilder, SqlDialect, render_where};
//! use strata_query::operator::translate;
//! use serde_json::json;
//!
//! # fn example() -> strata_query::Result<()> {
//! let filter = FilterBuilder::new()
//!     .where_(Expr::eq("status", 1))
//!     .and(translate("age", ">=", json!(18))?)
//!     .or(Expr::exists("vip"))
//!     .compose();
//!
//! // {"$and": [{"$and": [{"status": 1}, {"age": {"$gte": 18}}]}, {"$or": [{"vip": {"$exists": true}}]}]}
//! let document = filter.as_ref().map(Expr::to_document);
//!
//! let sql = render_where(filter.as_ref(), SqlDialect::Postgres)?;
//! assert_eq!(sql.params.len(), 2);
//! # let _ = document;
//! # Ok(())
//! # }
//! ```

pub mod diff;
pub mod error;
pub mod expr;
pub mod federation;
pub mod filter;
pub mod index;
pub mod operator;
pub mod orm;
pub mod registry;
pub mod settings;
pub mod sql;
pub mod traits;
pub mod types;

// Re-export commonly used items
pub use diff::{upsert_plan, ArgStmt, EntitySchema, FieldSpec, UpdateDiff, UpsertPlan};
pub use error::{DataError, Result};
pub use expr::{BitCondition, Condition, Expr};
pub use federation::{plan, plan_across, shard_tables, FederatedQuery, ShardArg, ShardGroup};
pub use filter::{Connector, Filter, FilterBuilder};
pub use index::{DocumentIndexModel, IndexColumn, IndexSpec, IndexType, Indexes};
pub use operator::BitOp;
pub use orm::Orm;
pub use registry::{ClientRegistry, ConnectionConfig};
pub use settings::{parse_timeouts, DriverSettings, Timeouts};
pub use sql::{render_tail, render_where, SqlDialect, SqlFragment, SqlWriter};
pub use traits::{Entity, Store};
pub use types::{
    DataRow, FindOptions, InsertOutcome, Paging, SortOrder, SortSpec, UpdateOutcome, WriteScope,
};
