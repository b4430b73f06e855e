//! Federated queries over sharded tables.
//!
//! Given a set of ids and a generator that yields the template arguments
//! for one id (the shard table name, fixed filter values, and exactly one
//! [`ShardArg::Ids`] marker), ids whose arguments render identically are
//! collapsed into one group. Each group becomes one `SELECT` with the
//! group's ids spliced into the marker slot; groups are joined with
//! `UNION ALL` and the whole query is bounded by the total id count.
//!
//! Template arguments are spliced verbatim. They are meant for table names
//! and trusted constants, never for user input.

use crate::error::{DataError, Result};
use crate::sql::SqlDialect;
use std::collections::HashMap;
use std::fmt;
use tracing::debug;

const SIGNATURE_SEPARATOR: char = '\u{1f}';
const IDS_MARKER: &str = "(...)";

/// One template argument
#[derive(Debug, Clone, PartialEq)]
pub enum ShardArg {
    /// The slot that receives the comma-joined id list
    Ids,
    Text(String),
    Int(i64),
    UInt(u64),
    Float(f64),
    Bool(bool),
}

impl fmt::Display for ShardArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardArg::Ids => f.write_str(IDS_MARKER),
            ShardArg::Text(s) => f.write_str(s),
            ShardArg::Int(n) => write!(f, "{}", n),
            ShardArg::UInt(n) => write!(f, "{}", n),
            ShardArg::Float(n) => write!(f, "{}", n),
            ShardArg::Bool(b) => write!(f, "{}", b),
        }
    }
}

impl From<&str> for ShardArg {
    fn from(s: &str) -> Self {
        ShardArg::Text(s.to_string())
    }
}

impl From<String> for ShardArg {
    fn from(s: String) -> Self {
        ShardArg::Text(s)
    }
}

impl From<i64> for ShardArg {
    fn from(n: i64) -> Self {
        ShardArg::Int(n)
    }
}

impl From<i32> for ShardArg {
    fn from(n: i32) -> Self {
        ShardArg::Int(n.into())
    }
}

impl From<u64> for ShardArg {
    fn from(n: u64) -> Self {
        ShardArg::UInt(n)
    }
}

impl From<u32> for ShardArg {
    fn from(n: u32) -> Self {
        ShardArg::UInt(n.into())
    }
}

impl From<f64> for ShardArg {
    fn from(n: f64) -> Self {
        ShardArg::Float(n)
    }
}

impl From<bool> for ShardArg {
    fn from(b: bool) -> Self {
        ShardArg::Bool(b)
    }
}

/// Ids that share one rendered argument tuple
#[derive(Debug, Clone, PartialEq)]
pub struct ShardGroup {
    pub signature: String,
    pub args: Vec<ShardArg>,
    /// Distinct member ids in first-seen order
    pub ids: Vec<u64>,
}

impl ShardGroup {
    /// The template arguments with the marker replaced by the id list
    pub fn rendered_args(&self) -> Vec<String> {
        let ids = join_ids(&self.ids);
        self.args
            .iter()
            .map(|arg| match arg {
                ShardArg::Ids => ids.clone(),
                other => other.to_string(),
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FederatedQuery {
    pub sql: String,
    /// Value for the trailing `LIMIT` placeholder: the number of input ids
    pub bound: u64,
    pub groups: Vec<ShardGroup>,
}

fn join_ids(ids: &[u64]) -> String {
    ids.iter().map(u64::to_string).collect::<Vec<_>>().join(",")
}

fn signature_of(args: &[ShardArg]) -> Result<String> {
    let markers = args.iter().filter(|a| matches!(a, ShardArg::Ids)).count();
    if markers != 1 {
        return Err(DataError::invalid_argument(format!(
            "shard arguments need exactly one id-list marker, found {}",
            markers
        )));
    }
    let mut signature = String::new();
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            signature.push(SIGNATURE_SEPARATOR);
        }
        signature.push_str(&arg.to_string());
    }
    Ok(signature)
}

/// Accumulates groups keyed by signature, keeping first-seen order
#[derive(Debug, Default)]
struct Grouper {
    groups: Vec<ShardGroup>,
    by_signature: HashMap<String, usize>,
}

impl Grouper {
    fn add(&mut self, id: u64, args: Vec<ShardArg>) -> Result<()> {
        let signature = signature_of(&args)?;
        match self.by_signature.get(&signature) {
            Some(&i) => {
                let group = &mut self.groups[i];
                if !group.ids.contains(&id) {
                    group.ids.push(id);
                }
            }
            None => {
                self.by_signature.insert(signature.clone(), self.groups.len());
                self.groups.push(ShardGroup {
                    signature,
                    args,
                    ids: vec![id],
                });
            }
        }
        Ok(())
    }
}

/// Group `ids` by the arguments `args_for` yields for each of them
pub fn group_shards<F>(ids: &[u64], mut args_for: F) -> Result<Vec<ShardGroup>>
where
    F: FnMut(u64) -> Vec<ShardArg>,
{
    let mut grouper = Grouper::default();
    for &id in ids {
        grouper.add(id, args_for(id))?;
    }
    Ok(grouper.groups)
}

/// Group every `(table, id)` pair, for queries that must visit each table
pub fn group_shards_across<F>(ids: &[u64], tables: &[String], mut args_for: F) -> Result<Vec<ShardGroup>>
where
    F: FnMut(&str, u64) -> Vec<ShardArg>,
{
    let mut grouper = Grouper::default();
    for &id in ids {
        for table in tables {
            grouper.add(id, args_for(table, id))?;
        }
    }
    Ok(grouper.groups)
}

/// Substitute positional `{}` placeholders; `{{` and `}}` are literal braces
pub fn format_template(template: &str, args: &[String]) -> Result<String> {
    let mut out = String::with_capacity(template.len() + args.iter().map(String::len).sum::<usize>());
    let mut next = 0;
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '{' if chars.peek() == Some(&'}') => {
                chars.next();
                let arg = args.get(next).ok_or_else(|| {
                    DataError::invalid_argument(format!(
                        "template has more placeholders than the {} arguments given",
                        args.len()
                    ))
                })?;
                out.push_str(arg);
                next += 1;
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' | '}' => {
                return Err(DataError::invalid_argument(format!(
                    "unmatched '{}' in query template",
                    c
                )))
            }
            other => out.push(other),
        }
    }
    if next != args.len() {
        return Err(DataError::invalid_argument(format!(
            "template has {} placeholders but {} arguments were given",
            next,
            args.len()
        )));
    }
    Ok(out)
}

/// `UNION ALL` of `template` formatted once per table
pub fn union_all<F>(template: &str, tables: &[String], mut args_for: F) -> Result<String>
where
    F: FnMut(&str) -> Vec<String>,
{
    let parts = tables
        .iter()
        .map(|table| format_template(template, &args_for(table)))
        .collect::<Result<Vec<_>>>()?;
    Ok(parts.join(" UNION ALL "))
}

/// Distinct shard tables in first-seen order plus the comma-joined id list
pub fn shard_tables<F>(ids: &[u64], mut table_of: F) -> (Vec<String>, String)
where
    F: FnMut(u64) -> String,
{
    let mut tables: Vec<String> = Vec::new();
    for &id in ids {
        let table = table_of(id);
        if !tables.contains(&table) {
            tables.push(table);
        }
    }
    (tables, join_ids(ids))
}

fn assemble(template: &str, ids: &[u64], groups: Vec<ShardGroup>, dialect: SqlDialect) -> Result<FederatedQuery> {
    let parts = groups
        .iter()
        .map(|group| format_template(template, &group.rendered_args()))
        .collect::<Result<Vec<_>>>()?;
    let sql = format!("{} LIMIT {}", parts.join(" UNION ALL "), dialect.placeholder(1));
    debug!(
        "planned federated query over {} ids in {} groups",
        ids.len(),
        groups.len()
    );
    Ok(FederatedQuery {
        sql,
        bound: ids.len() as u64,
        groups,
    })
}

fn require_ids(ids: &[u64]) -> Result<()> {
    if ids.is_empty() {
        return Err(DataError::invalid_argument("federated query needs at least one id"));
    }
    Ok(())
}

/// Plan one `UNION ALL` query covering every id exactly once
pub fn plan<F>(ids: &[u64], template: &str, dialect: SqlDialect, args_for: F) -> Result<FederatedQuery>
where
    F: FnMut(u64) -> Vec<ShardArg>,
{
    require_ids(ids)?;
    let groups = group_shards(ids, args_for)?;
    assemble(template, ids, groups, dialect)
}

/// Like [`plan`], generating arguments for every `(table, id)` pair
pub fn plan_across<F>(
    ids: &[u64],
    tables: &[String],
    template: &str,
    dialect: SqlDialect,
    args_for: F,
) -> Result<FederatedQuery>
where
    F: FnMut(&str, u64) -> Vec<ShardArg>,
{
    require_ids(ids)?;
    if tables.is_empty() {
        return Err(DataError::invalid_argument("federated query needs at least one table"));
    }
    let groups = group_shards_across(ids, tables, args_for)?;
    assemble(template, ids, groups, dialect)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEMPLATE: &str = "SELECT id, name FROM {} WHERE status={} AND id IN ({})";

    fn sharded(id: u64) -> Vec<ShardArg> {
        vec![format!("sku_{}", id % 2).into(), 1.into(), ShardArg::Ids]
    }

    #[test]
    fn test_single_group() {
        let q = plan(&[2, 4, 6], TEMPLATE, SqlDialect::MySql, sharded).unwrap();
        assert_eq!(
            q.sql,
            "SELECT id, name FROM sku_0 WHERE status=1 AND id IN (2,4,6) LIMIT ?"
        );
        assert_eq!(q.bound, 3);
        assert_eq!(q.groups.len(), 1);
    }

    #[test]
    fn test_groups_in_first_seen_order() {
        let q = plan(&[3, 2, 5, 4], TEMPLATE, SqlDialect::Postgres, sharded).unwrap();
        assert_eq!(
            q.sql,
            "SELECT id, name FROM sku_1 WHERE status=1 AND id IN (3,5) \
             UNION ALL SELECT id, name FROM sku_0 WHERE status=1 AND id IN (2,4) LIMIT $1"
        );
        assert_eq!(q.bound, 4);
    }

    #[test]
    fn test_partition_covers_every_id_once() {
        let ids: Vec<u64> = (1..=100).collect();
        let groups = group_shards(&ids, |id| vec![format!("t_{}", id % 7).into(), ShardArg::Ids]).unwrap();
        assert_eq!(groups.len(), 7);
        let total: usize = groups.iter().map(|g| g.ids.len()).sum();
        assert_eq!(total, ids.len());

        let q = plan(&ids, "SELECT * FROM {} WHERE id IN ({})", SqlDialect::MySql, |id| {
            vec![format!("t_{}", id % 7).into(), ShardArg::Ids]
        })
        .unwrap();
        assert_eq!(q.bound, 100);
        assert_eq!(q.sql.matches(" UNION ALL ").count(), 6);
    }

    #[test]
    fn test_marker_is_required_exactly_once() {
        let none = plan(&[1], TEMPLATE, SqlDialect::MySql, |_| vec!["t".into(), 1.into()]);
        assert!(none.unwrap_err().is_invalid_argument());

        let two = plan(&[1], TEMPLATE, SqlDialect::MySql, |_| {
            vec!["t".into(), ShardArg::Ids, ShardArg::Ids]
        });
        assert!(two.unwrap_err().is_invalid_argument());
    }

    #[test]
    fn test_empty_ids_rejected() {
        let err = plan(&[], TEMPLATE, SqlDialect::MySql, sharded).unwrap_err();
        assert!(err.is_invalid_argument());
    }

    #[test]
    fn test_plan_across_tables_dedups_identical_args() {
        let tables = vec!["log_a".to_string(), "log_b".to_string()];
        let q = plan_across(&[7, 8], &tables, "SELECT * FROM {} WHERE uid IN ({})", SqlDialect::MySql, |t, _| {
            vec![t.into(), ShardArg::Ids]
        })
        .unwrap();
        assert_eq!(
            q.sql,
            "SELECT * FROM log_a WHERE uid IN (7,8) UNION ALL SELECT * FROM log_b WHERE uid IN (7,8) LIMIT ?"
        );
        assert_eq!(q.bound, 2);
    }

    #[test]
    fn test_duplicate_input_ids_stay_in_one_group() {
        let groups = group_shards(&[5, 5, 6], |_| vec!["t".into(), ShardArg::Ids]).unwrap();
        assert_eq!(groups[0].ids, vec![5, 6]);
    }

    #[test]
    fn test_format_template() {
        let args = vec!["a".to_string(), "b".to_string()];
        assert_eq!(format_template("{} {{x}} {}", &args).unwrap(), "a {x} b");
        assert!(format_template("{}", &args).unwrap_err().is_invalid_argument());
        assert!(format_template("{} {} {}", &args).unwrap_err().is_invalid_argument());
        assert!(format_template("{ }", &[]).unwrap_err().is_invalid_argument());
    }

    #[test]
    fn test_shard_tables_and_union_all() {
        let (tables, ids) = shard_tables(&[1, 2, 3, 4], |id| format!("u_{}", id % 2));
        assert_eq!(tables, vec!["u_1".to_string(), "u_0".to_string()]);
        assert_eq!(ids, "1,2,3,4");

        let sql = union_all("SELECT * FROM {} WHERE id IN ({})", &tables, |t| {
            vec![t.to_string(), ids.clone()]
        })
        .unwrap();
        assert_eq!(
            sql,
            "SELECT * FROM u_1 WHERE id IN (1,2,3,4) UNION ALL SELECT * FROM u_0 WHERE id IN (1,2,3,4)"
        );
    }
}
