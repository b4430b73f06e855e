//! PostgreSQL implementation of the strata-query `Store` trait
//!
//! Filters are rendered to parameterized SQL with the PostgreSQL dialect.
//! Update documents use the same `$set` / `$inc` / `$unset` /
//! `$setOnInsert` shape as the document stores, so entities move between
//! backends without changing how they are written.

mod value;

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;
use strata_query::{
    render_tail, render_where, ClientRegistry, ConnectionConfig, DataError, DataRow,
    DriverSettings, Expr, FederatedQuery, FindOptions, IndexSpec, IndexType, Indexes,
    InsertOutcome, Result, SqlDialect, SqlWriter, Store, UpdateOutcome, WriteScope,
};
use tokio::sync::RwLock;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, GenericClient, NoTls};
use tracing::{debug, error};

pub use value::{bind, column_value, param_refs, row_to_datarow, PgParam};

pub const BACKEND: &str = "postgres";

const DIALECT: SqlDialect = SqlDialect::Postgres;

/// Map a driver error: `unique_violation` becomes `Conflict`, the rest `Upstream`
#[track_caller]
pub fn map_error(e: tokio_postgres::Error) -> DataError {
    if e.code() == Some(&SqlState::UNIQUE_VIOLATION) {
        let message = e
            .as_db_error()
            .map(|db| db.message().to_string())
            .unwrap_or_else(|| e.to_string());
        return DataError::conflict(message);
    }
    error!("PostgreSQL operation failed: {}", e);
    DataError::upstream(e)
}

fn quote(ident: &str) -> String {
    DIALECT.quote_ident(ident)
}

/// Index name qualified by its table; PostgreSQL index names share the
/// schema namespace
pub fn index_name(table: &str, spec: &IndexSpec) -> String {
    format!("{}_{}", table, spec.name())
}

/// `CREATE INDEX` statement for one declaration.
///
/// Primary keys belong to the table DDL and yield `None`; document-only
/// kinds (`2d`, `2dsphere`) are rejected.
pub fn index_ddl(table: &str, spec: &IndexSpec) -> Result<Option<String>> {
    if spec.columns.is_empty() || spec.index_type == IndexType::Primary {
        return Ok(None);
    }

    let ordered = || {
        spec.columns
            .iter()
            .map(|c| format!("{} {}", quote(&c.field), if c.asc { "ASC" } else { "DESC" }))
            .collect::<Vec<_>>()
            .join(", ")
    };
    let bare = || {
        spec.columns
            .iter()
            .map(|c| quote(&c.field))
            .collect::<Vec<_>>()
            .join(", ")
    };

    let (unique, method, columns) = match spec.index_type {
        IndexType::Unique => (true, "", ordered()),
        IndexType::Index => (false, "", ordered()),
        IndexType::FullText => {
            let language = spec
                .columns
                .iter()
                .find_map(|c| c.language.clone())
                .unwrap_or_else(|| "simple".to_string());
            let document = spec
                .columns
                .iter()
                .map(|c| format!("coalesce({}, '')", quote(&c.field)))
                .collect::<Vec<_>>()
                .join(" || ' ' || ");
            (
                false,
                " USING GIN",
                format!("to_tsvector('{}', {})", language.replace('\'', "''"), document),
            )
        }
        IndexType::Spatial => (false, " USING GIST", bare()),
        IndexType::Hashed => {
            if spec.columns.len() != 1 {
                return Err(DataError::invalid_argument(format!(
                    "hash index {} must cover exactly one column",
                    spec.name()
                )));
            }
            (false, " USING HASH", bare())
        }
        IndexType::Spatial2D | IndexType::Spatial2DSphere => {
            return Err(DataError::invalid_argument(format!(
                "index {} is only supported by document stores",
                spec.name()
            )))
        }
        IndexType::Primary => return Ok(None),
    };

    Ok(Some(format!(
        "CREATE {}INDEX IF NOT EXISTS {} ON {}{} ({})",
        if unique { "UNIQUE " } else { "" },
        quote(&index_name(table, spec)),
        quote(table),
        method,
        columns
    )))
}

/// Column assignments parsed from an update document
#[derive(Debug, Default, PartialEq)]
struct UpdateSpec {
    set: Vec<(String, Value)>,
    inc: Vec<(String, Value)>,
    unset: Vec<String>,
    on_insert: Map<String, Value>,
}

fn operand<'a>(op: &str, value: &'a Value) -> Result<&'a Map<String, Value>> {
    value
        .as_object()
        .ok_or_else(|| DataError::invalid_argument(format!("{} expects an object", op)))
}

impl UpdateSpec {
    /// Operator-less documents are treated as `$set`
    fn parse(update: &Value) -> Result<Self> {
        let doc = update
            .as_object()
            .ok_or_else(|| DataError::invalid_argument("update must be a document"))?;

        let mut spec = UpdateSpec::default();
        if !doc.keys().any(|k| k.starts_with('$')) {
            spec.set = doc.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
            return Ok(spec);
        }

        for (op, value) in doc {
            match op.as_str() {
                "$set" => spec
                    .set
                    .extend(operand(op, value)?.iter().map(|(k, v)| (k.clone(), v.clone()))),
                "$inc" => spec
                    .inc
                    .extend(operand(op, value)?.iter().map(|(k, v)| (k.clone(), v.clone()))),
                "$unset" => spec.unset.extend(operand(op, value)?.keys().cloned()),
                "$setOnInsert" => spec.on_insert.extend(operand(op, value)?.clone()),
                other => {
                    return Err(DataError::operation_not_supported(format!(
                        "update operator {} on PostgreSQL",
                        other
                    )))
                }
            }
        }
        Ok(spec)
    }

    fn has_assignments(&self) -> bool {
        !(self.set.is_empty() && self.inc.is_empty() && self.unset.is_empty())
    }

    fn write_assignments(&self, writer: &mut SqlWriter) {
        let mut first = true;
        let mut sep = |writer: &mut SqlWriter| {
            if !first {
                writer.push_sql(", ");
            }
            first = false;
        };
        for (field, value) in &self.set {
            sep(writer);
            writer.push_sql(&format!("{}=", quote(field)));
            writer.push_param(value.clone());
        }
        for (field, value) in &self.inc {
            sep(writer);
            let column = quote(field);
            writer.push_sql(&format!("{}=COALESCE({}, 0)+", column, column));
            writer.push_param(value.clone());
        }
        for field in &self.unset {
            sep(writer);
            writer.push_sql(&format!("{}=NULL", quote(field)));
        }
    }

    /// The row an upsert inserts: equality fields of the filter, then
    /// `$setOnInsert`, then `$set` and `$inc`
    fn insert_row(&self, filter: Option<&Expr>) -> DataRow {
        let mut row = DataRow::new();
        if let Some(expr) = filter {
            collect_equalities(expr, &mut row);
        }
        row.extend(self.on_insert.iter().map(|(k, v)| (k.clone(), v.clone())));
        row.extend(self.set.iter().cloned());
        row.extend(self.inc.iter().cloned());
        row
    }
}

/// Top-level equality conditions under nested ANDs
fn collect_equalities(expr: &Expr, row: &mut DataRow) {
    match expr {
        Expr::Eq(field, value) => {
            row.insert(field.clone(), value.clone());
        }
        Expr::Cond(c) if c.operator == "$eq" => {
            row.insert(c.field.clone(), c.value.clone());
        }
        Expr::And(items) => items.iter().for_each(|item| collect_equalities(item, row)),
        _ => {}
    }
}

/// Restrict a statement to at most one matching row through `ctid`
fn write_scoped_where(
    writer: &mut SqlWriter,
    table: &str,
    filter: Option<&Expr>,
    scope: WriteScope,
) -> Result<()> {
    match scope {
        WriteScope::Many => {
            if let Some(expr) = filter {
                writer.push_sql(" WHERE ");
                writer.push_expr(expr)?;
            }
        }
        WriteScope::One => {
            writer.push_sql(&format!(" WHERE ctid IN (SELECT ctid FROM {}", quote(table)));
            if let Some(expr) = filter {
                writer.push_sql(" WHERE ");
                writer.push_expr(expr)?;
            }
            writer.push_sql(" LIMIT 1)");
        }
    }
    Ok(())
}

fn insert_statement(table: &str, row: &DataRow) -> (String, Vec<PgParam>) {
    if row.is_empty() {
        return (
            format!("INSERT INTO {} DEFAULT VALUES RETURNING *", quote(table)),
            Vec::new(),
        );
    }
    let mut columns: Vec<&String> = row.keys().collect();
    columns.sort();

    let names = columns.iter().map(|c| quote(c)).collect::<Vec<_>>().join(", ");
    let placeholders = (1..=columns.len())
        .map(|n| DIALECT.placeholder(n))
        .collect::<Vec<_>>()
        .join(", ");
    let params = columns.iter().map(|c| PgParam(row[*c].clone())).collect();
    (
        format!(
            "INSERT INTO {} ({}) VALUES ({}) RETURNING *",
            quote(table),
            names,
            placeholders
        ),
        params,
    )
}

async fn insert_row<C: GenericClient + Sync>(client: &C, table: &str, row: &DataRow) -> Result<DataRow> {
    let (sql, params) = insert_statement(table, row);
    debug!("{}", sql);
    let inserted = client
        .query_one(sql.as_str(), &param_refs(&params))
        .await
        .map_err(|e| map_error(e))?;
    row_to_datarow(&inserted)
}

fn id_of(row: &DataRow) -> Option<Value> {
    row.get("id").filter(|v| !v.is_null()).cloned()
}

/// PostgreSQL store over one client connection
pub struct PostgresStore {
    client: Arc<RwLock<Client>>,
    database_name: String,
}

impl PostgresStore {
    /// Connect with a libpq-style string or `postgres://` URL
    pub async fn new(url: &str) -> Result<Self> {
        let config: tokio_postgres::Config = url.parse().map_err(|e| {
            DataError::ConnectionFailed(format!("Invalid PostgreSQL connection string: {}", e))
        })?;
        Self::with_config(config).await
    }

    /// Connect using a resolved config section
    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        let mut pg = tokio_postgres::Config::new();
        pg.host(config.host.as_deref().unwrap_or("localhost"))
            .port(config.port.unwrap_or(5432))
            .connect_timeout(config.timeouts.connect);
        if let Some(username) = &config.username {
            pg.user(username);
        }
        if let Some(password) = &config.password {
            pg.password(password);
        }
        if let Some(database) = &config.database {
            pg.dbname(database);
        }
        if let Some(name) = config.options.get("application_name") {
            pg.application_name(name);
        }

        debug!("Connecting to PostgreSQL: {}", config.connection_string());
        Self::with_config(pg).await
    }

    async fn with_config(config: tokio_postgres::Config) -> Result<Self> {
        let database_name = config.get_dbname().unwrap_or_default().to_string();

        let (client, connection) = config.connect(NoTls).await.map_err(|e| {
            DataError::ConnectionFailed(format!("PostgreSQL connection failed: {}", e))
        })?;

        // Spawn connection handler
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("PostgreSQL connection error: {}", e);
            }
        });

        debug!(
            "Successfully connected to PostgreSQL database: {}",
            database_name
        );

        Ok(Self {
            client: Arc::new(RwLock::new(client)),
            database_name,
        })
    }

    /// The shared store for a config section, connecting on first use
    pub async fn shared(
        registry: &ClientRegistry<PostgresStore>,
        settings: &DriverSettings,
        section: &str,
    ) -> Result<Arc<PostgresStore>> {
        let key = if section.is_empty() { BACKEND } else { section };
        registry
            .get_or_try_init(key, || async move {
                let config = ConnectionConfig::from_section(settings, BACKEND, section)?;
                PostgresStore::connect(&config).await
            })
            .await
    }

    pub fn database_name(&self) -> &str {
        &self.database_name
    }

    async fn query_rows(&self, sql: &str, params: Vec<PgParam>) -> Result<Vec<DataRow>> {
        debug!("{}", sql);
        let client = self.client.read().await;
        let rows = client
            .query(sql, &param_refs(&params))
            .await
            .map_err(|e| map_error(e))?;
        rows.iter().map(row_to_datarow).collect()
    }

    async fn execute(&self, sql: &str, params: Vec<PgParam>) -> Result<u64> {
        debug!("{}", sql);
        let client = self.client.read().await;
        client
            .execute(sql, &param_refs(&params))
            .await
            .map_err(|e| map_error(e))
    }

    /// Run one or more statements without parameters, e.g. table DDL
    pub async fn batch_execute(&self, sql: &str) -> Result<()> {
        debug!("{}", sql);
        let client = self.client.read().await;
        client.batch_execute(sql).await.map_err(|e| map_error(e))
    }

    /// Run a planned `UNION ALL` query, binding its row bound
    pub async fn query_federated(&self, query: &FederatedQuery) -> Result<Vec<DataRow>> {
        self.query_rows(&query.sql, vec![PgParam(Value::from(query.bound))])
            .await
    }
}

#[async_trait]
impl Store for PostgresStore {
    fn store_type(&self) -> &'static str {
        BACKEND
    }

    async fn find(&self, table: &str, filter: Option<&Expr>, options: &FindOptions) -> Result<Vec<DataRow>> {
        let tail = render_tail(filter, options, DIALECT)?;
        let sql = format!("SELECT * FROM {}{}", quote(table), tail.sql);
        self.query_rows(&sql, bind(tail.params)).await
    }

    async fn count(&self, table: &str, filter: Option<&Expr>) -> Result<u64> {
        let clause = render_where(filter, DIALECT)?;
        let sql = format!("SELECT COUNT(*) FROM {}{}", quote(table), clause.sql);
        debug!("{}", sql);

        let params = bind(clause.params);
        let client = self.client.read().await;
        let row = client
            .query_one(sql.as_str(), &param_refs(&params))
            .await
            .map_err(|e| map_error(e))?;
        let count: i64 = row
            .try_get(0)
            .map_err(|e| DataError::Serialization(e.to_string()))?;
        Ok(count.max(0) as u64)
    }

    async fn distinct(&self, table: &str, field: &str, filter: Option<&Expr>) -> Result<Vec<Value>> {
        let clause = render_where(filter, DIALECT)?;
        let sql = format!(
            "SELECT DISTINCT {} FROM {}{}",
            quote(field),
            quote(table),
            clause.sql
        );
        debug!("{}", sql);

        let params = bind(clause.params);
        let client = self.client.read().await;
        let rows = client
            .query(sql.as_str(), &param_refs(&params))
            .await
            .map_err(|e| map_error(e))?;
        rows.iter().map(|row| column_value(row, 0)).collect()
    }

    async fn insert_one(&self, table: &str, row: DataRow) -> Result<Option<Value>> {
        let client = self.client.read().await;
        let inserted = insert_row(&*client, table, &row).await?;
        Ok(id_of(&inserted))
    }

    async fn insert_many(&self, table: &str, rows: Vec<DataRow>) -> Result<InsertOutcome> {
        let mut client = self.client.write().await;
        let tx = client.transaction().await.map_err(|e| map_error(e))?;

        let mut inserted_ids = Vec::with_capacity(rows.len());
        for row in &rows {
            let inserted = insert_row(&tx, table, row).await?;
            inserted_ids.extend(id_of(&inserted));
        }
        tx.commit().await.map_err(|e| map_error(e))?;

        debug!("inserted {} rows into {}", rows.len(), table);
        Ok(InsertOutcome { inserted_ids })
    }

    async fn update(
        &self,
        table: &str,
        filter: Option<&Expr>,
        update: &Value,
        scope: WriteScope,
        upsert: bool,
    ) -> Result<UpdateOutcome> {
        let spec = UpdateSpec::parse(update)?;

        let mut writer = SqlWriter::new(DIALECT);
        if spec.has_assignments() {
            writer.push_sql(&format!("UPDATE {} SET ", quote(table)));
            spec.write_assignments(&mut writer);
            write_scoped_where(&mut writer, table, filter, scope)?;
        } else {
            writer.push_sql(&format!("SELECT COUNT(*) FROM {}", quote(table)));
            write_scoped_where(&mut writer, table, filter, scope)?;
        }
        let statement = writer.finish();
        let params = bind(statement.params);
        debug!("{}", statement.sql);

        let mut client = self.client.write().await;
        let tx = client.transaction().await.map_err(|e| map_error(e))?;

        let matched = if spec.has_assignments() {
            tx.execute(statement.sql.as_str(), &param_refs(&params))
                .await
                .map_err(|e| map_error(e))?
        } else {
            let row = tx
                .query_one(statement.sql.as_str(), &param_refs(&params))
                .await
                .map_err(|e| map_error(e))?;
            let count: i64 = row
                .try_get(0)
                .map_err(|e| DataError::Serialization(e.to_string()))?;
            count.max(0) as u64
        };

        let mut outcome = UpdateOutcome {
            matched,
            modified: if spec.has_assignments() { matched } else { 0 },
            upserted_id: None,
        };
        if upsert && matched == 0 {
            let inserted = insert_row(&tx, table, &spec.insert_row(filter)).await?;
            outcome.upserted_id = id_of(&inserted);
        }
        tx.commit().await.map_err(|e| map_error(e))?;

        Ok(outcome)
    }

    async fn delete(&self, table: &str, filter: Option<&Expr>, scope: WriteScope) -> Result<u64> {
        let mut writer = SqlWriter::new(DIALECT);
        writer.push_sql(&format!("DELETE FROM {}", quote(table)));
        write_scoped_where(&mut writer, table, filter, scope)?;
        let statement = writer.finish();
        self.execute(&statement.sql, bind(statement.params)).await
    }

    async fn create_indexes(&self, table: &str, indexes: &Indexes) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for spec in indexes.iter() {
            if let Some(ddl) = index_ddl(table, spec)? {
                self.execute(&ddl, Vec::new()).await?;
                names.push(index_name(table, spec));
            }
        }
        Ok(names)
    }

    async fn drop_table(&self, table: &str) -> Result<()> {
        self.execute(&format!("DROP TABLE IF EXISTS {}", quote(table)), Vec::new())
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        debug!("Closing PostgreSQL connection to {}", self.database_name);
        Ok(())
    }
}
