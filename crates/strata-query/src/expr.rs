//! Backend-neutral boolean filter expressions.
//!
//! An [`Expr`] is built once (by the operator translator or the filter
//! builder) and then projected by each backend: [`Expr::to_document`] gives
//! the document-store (MongoDB) filter shape, the SQL renderer in
//! [`crate::sql`] gives a parameterized `WHERE` clause.

use crate::error::{DataError, Result};
use crate::operator::BitOp;
use serde_json::{json, Map, Value};
use std::fmt;

/// A single `{field: {operator: value}}` comparison.
///
/// `operator` is always in native form (`$eq`, `$gt`, `$in`, ...).
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub field: String,
    pub operator: String,
    pub value: Value,
}

/// A bitwise condition: `{"$bit": {field: {and|or|xor: mask}}}`
#[derive(Debug, Clone, PartialEq)]
pub struct BitCondition {
    pub field: String,
    pub op: BitOp,
    pub mask: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// `{field: {operator: value}}`
    Cond(Condition),
    /// `{field: value}`
    Eq(String, Value),
    /// `{"$bit": {field: {op: mask}}}`
    Bit(BitCondition),
    /// Opaque backend document, passed through as-is
    Raw(Map<String, Value>),
    And(Vec<Expr>),
    Or(Vec<Expr>),
}

impl Expr {
    pub fn cond(field: impl Into<String>, operator: impl Into<String>, value: impl Into<Value>) -> Self {
        Expr::Cond(Condition {
            field: field.into(),
            operator: operator.into(),
            value: value.into(),
        })
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Expr::Eq(field.into(), value.into())
    }

    pub fn bit(field: impl Into<String>, op: BitOp, mask: i64) -> Self {
        Expr::Bit(BitCondition {
            field: field.into(),
            op,
            mask,
        })
    }

    pub fn in_values<V: Into<Value>>(field: impl Into<String>, values: impl IntoIterator<Item = V>) -> Self {
        Expr::cond(field, "$in", Value::Array(values.into_iter().map(Into::into).collect()))
    }

    pub fn nin<V: Into<Value>>(field: impl Into<String>, values: impl IntoIterator<Item = V>) -> Self {
        Expr::cond(field, "$nin", Value::Array(values.into_iter().map(Into::into).collect()))
    }

    /// Array field contains every one of `values`
    pub fn all<V: Into<Value>>(field: impl Into<String>, values: impl IntoIterator<Item = V>) -> Self {
        Expr::cond(field, "$all", Value::Array(values.into_iter().map(Into::into).collect()))
    }

    pub fn exists(field: impl Into<String>) -> Self {
        Expr::cond(field, "$exists", true)
    }

    pub fn not_exists(field: impl Into<String>) -> Self {
        Expr::cond(field, "$exists", false)
    }

    /// Array field has exactly `size` elements
    pub fn size(field: impl Into<String>, size: u64) -> Self {
        Expr::cond(field, "$size", size)
    }

    pub fn elem_match(field: impl Into<String>, matcher: Map<String, Value>) -> Self {
        Expr::cond(field, "$elemMatch", Value::Object(matcher))
    }

    /// Every bit in `mask` is set. `mask` is a numeric mask or an array of bit positions.
    pub fn bits_all_set(field: impl Into<String>, mask: impl Into<Value>) -> Self {
        Expr::cond(field, "$bitsAllSet", mask)
    }

    pub fn bits_all_clear(field: impl Into<String>, mask: impl Into<Value>) -> Self {
        Expr::cond(field, "$bitsAllClear", mask)
    }

    pub fn bits_any_set(field: impl Into<String>, mask: impl Into<Value>) -> Self {
        Expr::cond(field, "$bitsAnySet", mask)
    }

    pub fn bits_any_clear(field: impl Into<String>, mask: impl Into<Value>) -> Self {
        Expr::cond(field, "$bitsAnyClear", mask)
    }

    /// `field % divisor == remainder`
    pub fn modulo(field: impl Into<String>, divisor: i64, remainder: i64) -> Self {
        Expr::cond(field, "$mod", json!([divisor, remainder]))
    }

    /// BSON type check; `t` is a type alias (`"string"`) or number
    pub fn type_of(field: impl Into<String>, t: impl Into<Value>) -> Self {
        Expr::cond(field, "$type", t)
    }

    pub fn not_match(field: impl Into<String>, pattern: impl Into<String>) -> Self {
        Expr::cond(field, "$not", json!({"$regex": pattern.into()}))
    }

    /// Wrap an opaque document. Fails unless `value` is a JSON object.
    pub fn raw(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Expr::Raw(map)),
            other => Err(DataError::invalid_argument(format!(
                "raw filter must be an object, got {}",
                other
            ))),
        }
    }

    /// Build a condition from positional arguments.
    ///
    /// * one argument: an opaque filter document
    /// * two arguments: `{field: value}`
    /// * three arguments: `field, operator, value` through the translator
    pub fn from_args(args: &[Value]) -> Result<Self> {
        match args {
            [doc] => Expr::raw(doc.clone()),
            [field, value] => Ok(Expr::eq(field_name(field)?, value.clone())),
            [field, operator, value] => {
                let operator = operator.as_str().ok_or_else(|| {
                    DataError::invalid_argument(format!("operator must be a string, got {}", operator))
                })?;
                crate::operator::translate(field_name(field)?, operator, value.clone())
            }
            _ => Err(DataError::invalid_argument(format!(
                "condition takes 1, 2 or 3 arguments, got {}",
                args.len()
            ))),
        }
    }

    /// Project into the document-store filter shape
    pub fn to_document(&self) -> Value {
        match self {
            Expr::Cond(c) => {
                let mut inner = Map::new();
                inner.insert(c.operator.clone(), c.value.clone());
                let mut outer = Map::new();
                outer.insert(c.field.clone(), Value::Object(inner));
                Value::Object(outer)
            }
            Expr::Eq(field, value) => {
                let mut outer = Map::new();
                outer.insert(field.clone(), value.clone());
                Value::Object(outer)
            }
            Expr::Bit(b) => {
                let mut inner = Map::new();
                inner.insert(b.op.native().to_string(), json!(b.mask));
                let mut fields = Map::new();
                fields.insert(b.field.clone(), Value::Object(inner));
                json!({ "$bit": Value::Object(fields) })
            }
            Expr::Raw(map) => Value::Object(map.clone()),
            Expr::And(items) => json!({ "$and": items.iter().map(Expr::to_document).collect::<Vec<_>>() }),
            Expr::Or(items) => json!({ "$or": items.iter().map(Expr::to_document).collect::<Vec<_>>() }),
        }
    }

    /// Parse a document-store filter back into an expression tree.
    ///
    /// Used by SQL backends to accept raw documents. Top-level keys are
    /// ANDed; `$and`/`$or` recurse; `{field: {$op: v, ...}}` yields one
    /// condition per operator; anything else is equality.
    pub fn from_document(doc: &Map<String, Value>) -> Result<Self> {
        let mut items = Vec::with_capacity(doc.len());
        for (key, value) in doc {
            match key.as_str() {
                "$and" | "$or" => {
                    let parts = value.as_array().ok_or_else(|| {
                        DataError::invalid_argument(format!("{} expects an array", key))
                    })?;
                    let mut children = Vec::with_capacity(parts.len());
                    for part in parts {
                        let map = part.as_object().ok_or_else(|| {
                            DataError::invalid_argument(format!("{} members must be objects", key))
                        })?;
                        children.push(Expr::from_document(map)?);
                    }
                    items.push(if key == "$and" {
                        Expr::And(children)
                    } else {
                        Expr::Or(children)
                    });
                }
                field if field.starts_with('$') => {
                    return Err(DataError::operation_not_supported(format!(
                        "top-level operator {}",
                        field
                    )));
                }
                field => match value {
                    Value::Object(ops) if !ops.is_empty() && ops.keys().all(|k| k.starts_with('$')) => {
                        for (op, operand) in ops {
                            items.push(Expr::cond(field, op.clone(), operand.clone()));
                        }
                    }
                    other => items.push(Expr::eq(field, other.clone())),
                },
            }
        }
        if items.len() == 1 {
            Ok(items.remove(0))
        } else {
            Ok(Expr::And(items))
        }
    }
}

fn field_name(value: &Value) -> Result<String> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| DataError::invalid_argument(format!("field name must be a string, got {}", value)))
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_document())
    }
}
