//! Symbolic operator translation.
//!
//! Maps comparison symbols (`=`, `>`, `>=`, `<`, `<=`, `!=`) and bitwise
//! symbols (`&`, `|`, `^`) onto the native operator tokens used by the
//! expression tree. Native tokens pass through unchanged; unknown operators
//! are kept as opaque `{field: {operator: value}}` conditions.

use crate::error::{DataError, Result};
use crate::expr::Expr;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BitOp {
    And,
    Or,
    Xor,
}

impl BitOp {
    /// Accepts both the symbol and the native name
    pub fn parse(op: &str) -> Option<Self> {
        match op {
            "&" | "and" => Some(BitOp::And),
            "|" | "or" => Some(BitOp::Or),
            "^" | "xor" => Some(BitOp::Xor),
            _ => None,
        }
    }

    pub fn native(&self) -> &'static str {
        match self {
            BitOp::And => "and",
            BitOp::Or => "or",
            BitOp::Xor => "xor",
        }
    }
}

/// Native token for a comparison symbol, if `op` is one.
pub fn compare_operator(op: &str) -> Option<&'static str> {
    match op {
        "=" => Some("$eq"),
        ">" => Some("$gt"),
        ">=" => Some("$gte"),
        "<" => Some("$lt"),
        "<=" => Some("$lte"),
        "!=" => Some("$ne"),
        _ => None,
    }
}

/// Translate `(field, operator, value)` into a condition.
///
/// Bitwise operators require an integer-coercible value.
pub fn translate(field: impl Into<String>, operator: &str, value: Value) -> Result<Expr> {
    let field = field.into();
    if let Some(native) = compare_operator(operator) {
        return Ok(Expr::cond(field, native, value));
    }
    if let Some(bit) = BitOp::parse(operator) {
        let mask = coerce_i64(&value).ok_or_else(|| {
            DataError::invalid_argument(format!(
                "bit operator {} on {} needs an integer, got {}",
                operator, field, value
            ))
        })?;
        return Ok(Expr::bit(field, bit, mask));
    }
    Ok(Expr::cond(field, operator, value))
}

fn coerce_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_u64().and_then(|u| i64::try_from(u).ok()))
            .or_else(|| {
                n.as_f64()
                    .filter(|f| f.fract() == 0.0 && *f >= i64::MIN as f64 && *f <= i64::MAX as f64)
                    .map(|f| f as i64)
            }),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(i64::from(*b)),
        _ => None,
    }
}
