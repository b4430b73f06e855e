//! Parameterized SQL rendering of composed filters.
//!
//! Values never appear in the SQL text; they are collected in order into
//! [`SqlFragment::params`] and referenced by `?` (MySQL) or `$n`
//! (PostgreSQL) placeholders.

use crate::error::{DataError, Result};
use crate::expr::{Condition, Expr};
use crate::types::{FindOptions, SortOrder};
use serde_json::Value;

/// MySQL's documented "no limit" row count, used when only an offset is given
const MYSQL_MAX_ROWS: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlDialect {
    MySql,
    Postgres,
}

impl SqlDialect {
    fn quote_char(&self) -> char {
        match self {
            SqlDialect::MySql => '`',
            SqlDialect::Postgres => '"',
        }
    }

    /// Quote each dot-separated part; `*` is left bare
    pub fn quote_ident(&self, ident: &str) -> String {
        let q = self.quote_char();
        ident
            .split('.')
            .map(|part| {
                if part == "*" {
                    part.to_string()
                } else {
                    let escaped = part.replace(q, &format!("{q}{q}"));
                    format!("{q}{escaped}{q}")
                }
            })
            .collect::<Vec<_>>()
            .join(".")
    }

    /// Placeholder for the `n`-th (1-based) parameter
    pub fn placeholder(&self, n: usize) -> String {
        match self {
            SqlDialect::MySql => "?".to_string(),
            SqlDialect::Postgres => format!("${}", n),
        }
    }

    /// `field IN (1,2,3)`, `field=1` for a single id, and a never-true
    /// predicate for an empty list
    pub fn in_ids(&self, field: &str, ids: &[u64]) -> String {
        match ids {
            [] => "1<>1".to_string(),
            [id] => format!("{}={}", self.quote_ident(field), id),
            _ => format!(
                "{} IN ({})",
                self.quote_ident(field),
                ids.iter().map(u64::to_string).collect::<Vec<_>>().join(",")
            ),
        }
    }
}

/// SQL text plus its bound values
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SqlFragment {
    pub sql: String,
    pub params: Vec<Value>,
}

/// Accumulates SQL text and parameters, numbering placeholders after any
/// parameters already bound.
#[derive(Debug, Clone)]
pub struct SqlWriter {
    dialect: SqlDialect,
    sql: String,
    params: Vec<Value>,
}

impl SqlWriter {
    pub fn new(dialect: SqlDialect) -> Self {
        Self::with_params(dialect, Vec::new())
    }

    /// Continue after `params`, e.g. the values of a `SET` list
    pub fn with_params(dialect: SqlDialect, params: Vec<Value>) -> Self {
        Self {
            dialect,
            sql: String::new(),
            params,
        }
    }

    pub fn dialect(&self) -> SqlDialect {
        self.dialect
    }

    pub fn push_sql(&mut self, sql: &str) {
        self.sql.push_str(sql);
    }

    /// Bind a value and write its placeholder
    pub fn push_param(&mut self, value: Value) {
        self.params.push(value);
        let placeholder = self.dialect.placeholder(self.params.len());
        self.sql.push_str(&placeholder);
    }

    pub fn push_expr(&mut self, expr: &Expr) -> Result<()> {
        match expr {
            Expr::Cond(c) => self.push_condition(c),
            Expr::Eq(field, value) => {
                self.push_comparison(field, "=", value.clone());
                Ok(())
            }
            Expr::Bit(b) => Err(DataError::operation_not_supported(format!(
                "bit operator {} on {} in a SQL filter",
                b.op.native(),
                b.field
            ))),
            Expr::Raw(doc) => {
                let parsed = Expr::from_document(doc)?;
                self.push_expr(&parsed)
            }
            Expr::And(items) => self.push_group(items, " AND ", "1=1"),
            Expr::Or(items) => self.push_group(items, " OR ", "1<>1"),
        }
    }

    fn push_group(&mut self, items: &[Expr], joiner: &str, empty: &str) -> Result<()> {
        match items {
            [] => self.push_sql(empty),
            [only] => self.push_expr(only)?,
            _ => {
                self.push_sql("(");
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        self.push_sql(joiner);
                    }
                    self.push_expr(item)?;
                }
                self.push_sql(")");
            }
        }
        Ok(())
    }

    fn push_comparison(&mut self, field: &str, op: &str, value: Value) {
        let column = self.dialect.quote_ident(field);
        if value.is_null() {
            match op {
                "=" => return self.push_sql(&format!("{} IS NULL", column)),
                "<>" => return self.push_sql(&format!("{} IS NOT NULL", column)),
                _ => {}
            }
        }
        self.push_sql(&format!("{} {} ", column, op));
        self.push_param(value);
    }

    fn push_condition(&mut self, c: &Condition) -> Result<()> {
        let op = match c.operator.as_str() {
            "$eq" => "=",
            "$ne" => "<>",
            "$gt" => ">",
            "$gte" => ">=",
            "$lt" => "<",
            "$lte" => "<=",
            "$in" | "$nin" => return self.push_membership(c),
            "$exists" => {
                let column = self.dialect.quote_ident(&c.field);
                let present = match &c.value {
                    Value::Bool(b) => *b,
                    Value::Null => false,
                    Value::Number(n) => n.as_f64() != Some(0.0),
                    _ => true,
                };
                let predicate = if present { "IS NOT NULL" } else { "IS NULL" };
                self.push_sql(&format!("{} {}", column, predicate));
                return Ok(());
            }
            other => {
                return Err(DataError::operation_not_supported(format!(
                    "operator {} in a SQL filter",
                    other
                )))
            }
        };
        self.push_comparison(&c.field, op, c.value.clone());
        Ok(())
    }

    fn push_membership(&mut self, c: &Condition) -> Result<()> {
        let negate = c.operator == "$nin";
        let values = c.value.as_array().ok_or_else(|| {
            DataError::invalid_argument(format!("{} on {} expects an array", c.operator, c.field))
        })?;
        if values.is_empty() {
            self.push_sql(if negate { "1=1" } else { "1<>1" });
            return Ok(());
        }
        let column = self.dialect.quote_ident(&c.field);
        self.push_sql(&format!("{} {} (", column, if negate { "NOT IN" } else { "IN" }));
        for (i, value) in values.iter().enumerate() {
            if i > 0 {
                self.push_sql(", ");
            }
            self.push_param(value.clone());
        }
        self.push_sql(")");
        Ok(())
    }

    pub fn finish(self) -> SqlFragment {
        SqlFragment {
            sql: self.sql,
            params: self.params,
        }
    }
}

/// ` WHERE ...`, or nothing when there is no filter
pub fn render_where(filter: Option<&Expr>, dialect: SqlDialect) -> Result<SqlFragment> {
    let mut writer = SqlWriter::new(dialect);
    write_where(&mut writer, filter)?;
    Ok(writer.finish())
}

/// ` WHERE ... ORDER BY ... LIMIT ... OFFSET ...`
pub fn render_tail(
    filter: Option<&Expr>,
    options: &FindOptions,
    dialect: SqlDialect,
) -> Result<SqlFragment> {
    let mut writer = SqlWriter::new(dialect);
    write_where(&mut writer, filter)?;

    if !options.sort.is_empty() {
        let order = options
            .sort
            .iter()
            .map(|(field, order)| {
                let direction = match order {
                    SortOrder::Ascending => "ASC",
                    SortOrder::Descending => "DESC",
                };
                format!("{} {}", dialect.quote_ident(field), direction)
            })
            .collect::<Vec<_>>()
            .join(", ");
        writer.push_sql(&format!(" ORDER BY {}", order));
    }

    match (options.limit, options.offset) {
        (Some(limit), 0) => writer.push_sql(&format!(" LIMIT {}", limit)),
        (Some(limit), offset) => writer.push_sql(&format!(" LIMIT {} OFFSET {}", limit, offset)),
        (None, 0) => {}
        (None, offset) => match dialect {
            SqlDialect::MySql => {
                writer.push_sql(&format!(" LIMIT {} OFFSET {}", MYSQL_MAX_ROWS, offset))
            }
            SqlDialect::Postgres => writer.push_sql(&format!(" OFFSET {}", offset)),
        },
    }

    Ok(writer.finish())
}

fn write_where(writer: &mut SqlWriter, filter: Option<&Expr>) -> Result<()> {
    if let Some(expr) = filter {
        writer.push_sql(" WHERE ");
        writer.push_expr(expr)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Paging, SortSpec};
    use serde_json::json;

    #[test]
    fn test_quote_ident() {
        assert_eq!(SqlDialect::MySql.quote_ident("t.name"), "`t`.`name`");
        assert_eq!(SqlDialect::Postgres.quote_ident("t.*"), "\"t\".*");
        assert_eq!(SqlDialect::Postgres.quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_in_ids() {
        let d = SqlDialect::MySql;
        assert_eq!(d.in_ids("id", &[]), "1<>1");
        assert_eq!(d.in_ids("id", &[7]), "`id`=7");
        assert_eq!(d.in_ids("id", &[1, 2, 3]), "`id` IN (1,2,3)");
    }

    #[test]
    fn test_render_nested_expression_postgres() {
        let expr = Expr::And(vec![
            Expr::And(vec![Expr::eq("a", 1), Expr::cond("b", "$gt", 2)]),
            Expr::Or(vec![Expr::eq("c", "x"), Expr::in_values("d", [1, 2])]),
        ]);
        let frag = render_where(Some(&expr), SqlDialect::Postgres).unwrap();
        assert_eq!(
            frag.sql,
            " WHERE ((\"a\" = $1 AND \"b\" > $2) AND (\"c\" = $3 OR \"d\" IN ($4, $5)))"
        );
        assert_eq!(frag.params, vec![json!(1), json!(2), json!("x"), json!(1), json!(2)]);
    }

    #[test]
    fn test_render_null_and_exists() {
        let expr = Expr::And(vec![
            Expr::eq("deleted_at", Value::Null),
            Expr::cond("email", "$ne", Value::Null),
            Expr::exists("name"),
            Expr::not_exists("nick"),
        ]);
        let frag = render_where(Some(&expr), SqlDialect::MySql).unwrap();
        assert_eq!(
            frag.sql,
            " WHERE (`deleted_at` IS NULL AND `email` IS NOT NULL AND `name` IS NOT NULL AND `nick` IS NULL)"
        );
        assert!(frag.params.is_empty());
    }

    #[test]
    fn test_render_empty_membership() {
        let frag = render_where(
            Some(&Expr::Or(vec![
                Expr::in_values("a", Vec::<i64>::new()),
                Expr::nin("b", Vec::<i64>::new()),
            ])),
            SqlDialect::MySql,
        )
        .unwrap();
        assert_eq!(frag.sql, " WHERE (1<>1 OR 1=1)");
    }

    #[test]
    fn test_render_raw_document() {
        let raw = Expr::raw(json!({"status": {"$gte": 1}})).unwrap();
        let frag = render_where(Some(&raw), SqlDialect::Postgres).unwrap();
        assert_eq!(frag.sql, " WHERE \"status\" >= $1");
    }

    #[test]
    fn test_bit_is_not_supported() {
        let expr = Expr::bit("flags", crate::operator::BitOp::And, 1);
        let err = render_where(Some(&expr), SqlDialect::MySql).unwrap_err();
        assert!(matches!(err, DataError::OperationNotSupported(_)));
    }

    #[test]
    fn test_render_tail() {
        let options = FindOptions::new()
            .with_sort(SortSpec::new().desc("created_at").asc("id"))
            .with_paging(Paging::new(20, 10));
        let frag = render_tail(Some(&Expr::eq("uid", 3)), &options, SqlDialect::MySql).unwrap();
        assert_eq!(
            frag.sql,
            " WHERE `uid` = ? ORDER BY `created_at` DESC, `id` ASC LIMIT 10 OFFSET 20"
        );
    }

    #[test]
    fn test_render_tail_offset_without_limit() {
        let options = FindOptions::new().with_paging(Paging::new(5, 0));
        assert_eq!(
            render_tail(None, &options, SqlDialect::MySql).unwrap().sql,
            " LIMIT 18446744073709551615 OFFSET 5"
        );
        assert_eq!(
            render_tail(None, &options, SqlDialect::Postgres).unwrap().sql,
            " OFFSET 5"
        );
    }

    #[test]
    fn test_writer_continues_numbering() {
        let mut writer = SqlWriter::with_params(SqlDialect::Postgres, vec![json!("x")]);
        writer.push_expr(&Expr::eq("id", 1)).unwrap();
        assert_eq!(writer.finish().sql, "\"id\" = $2");
    }
}
