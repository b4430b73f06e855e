//! JSON values in and out of PostgreSQL
//!
//! Parameters are bound by the column type the server infers, so a JSON
//! number can land in an `int4`, `int8` or `float8` slot alike.

use bytes::BytesMut;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value;
use std::error::Error as StdError;
use strata_query::{DataError, DataRow, Result};
use tokio_postgres::types::{to_sql_checked, FromSql, IsNull, ToSql, Type};
use tokio_postgres::Row;

type BoxError = Box<dyn StdError + Sync + Send>;

/// A JSON value bound as a query parameter
#[derive(Debug, Clone, PartialEq)]
pub struct PgParam(pub Value);

fn as_i64(value: &Value) -> std::result::Result<i64, BoxError> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
            .ok_or_else(|| format!("{} is not an integer", n).into()),
        Value::Bool(b) => Ok(*b as i64),
        Value::String(s) => s.trim().parse().map_err(|_| format!("{:?} is not an integer", s).into()),
        other => Err(format!("cannot bind {} as an integer", other).into()),
    }
}

fn as_f64(value: &Value) -> std::result::Result<f64, BoxError> {
    match value {
        Value::Number(n) => n.as_f64().ok_or_else(|| format!("{} is not a float", n).into()),
        Value::String(s) => s.trim().parse().map_err(|_| format!("{:?} is not a float", s).into()),
        other => Err(format!("cannot bind {} as a float", other).into()),
    }
}

fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn as_timestamp(value: &Value) -> std::result::Result<DateTime<Utc>, BoxError> {
    match value {
        Value::String(s) => Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc)),
        Value::Number(_) => DateTime::from_timestamp(as_i64(value)?, 0)
            .ok_or_else(|| format!("timestamp {} out of range", value).into()),
        other => Err(format!("cannot bind {} as a timestamp", other).into()),
    }
}

impl ToSql for PgParam {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> std::result::Result<IsNull, BoxError> {
        let value = &self.0;
        if value.is_null() {
            return Ok(IsNull::Yes);
        }
        match ty.name() {
            "bool" => match value {
                Value::Bool(b) => b.to_sql(ty, out),
                other => (as_i64(other)? != 0).to_sql(ty, out),
            },
            "int2" => i16::try_from(as_i64(value)?)?.to_sql(ty, out),
            "int4" => i32::try_from(as_i64(value)?)?.to_sql(ty, out),
            "int8" => as_i64(value)?.to_sql(ty, out),
            "float4" => (as_f64(value)? as f32).to_sql(ty, out),
            "float8" => as_f64(value)?.to_sql(ty, out),
            "json" | "jsonb" => value.to_sql(ty, out),
            "timestamptz" => as_timestamp(value)?.to_sql(ty, out),
            "timestamp" => as_timestamp(value)?.naive_utc().to_sql(ty, out),
            "uuid" => uuid::Uuid::parse_str(&as_text(value))?.to_sql(ty, out),
            _ => as_text(value).to_sql(ty, out),
        }
    }

    fn accepts(ty: &Type) -> bool {
        matches!(
            ty.name(),
            "bool"
                | "int2"
                | "int4"
                | "int8"
                | "float4"
                | "float8"
                | "json"
                | "jsonb"
                | "timestamptz"
                | "timestamp"
                | "uuid"
                | "text"
                | "varchar"
                | "bpchar"
                | "name"
                | "unknown"
        )
    }

    to_sql_checked!();
}

/// Borrow parameters in the shape `Client::query` expects
pub fn param_refs(params: &[PgParam]) -> Vec<&(dyn ToSql + Sync)> {
    params.iter().map(|p| p as &(dyn ToSql + Sync)).collect()
}

pub fn bind(values: Vec<Value>) -> Vec<PgParam> {
    values.into_iter().map(PgParam).collect()
}

fn get<'a, T: FromSql<'a>>(row: &'a Row, idx: usize) -> Result<Option<T>> {
    row.try_get::<_, Option<T>>(idx).map_err(|e| {
        DataError::Serialization(format!("column {}: {}", row.columns()[idx].name(), e))
    })
}

/// Extract one column as JSON
pub fn column_value(row: &Row, idx: usize) -> Result<Value> {
    let type_name = row.columns()[idx].type_().name();

    let value = match type_name {
        "bool" => get::<bool>(row, idx)?.map(Value::Bool),
        "int2" => get::<i16>(row, idx)?.map(|v| Value::Number(v.into())),
        "int4" => get::<i32>(row, idx)?.map(|v| Value::Number(v.into())),
        "int8" => get::<i64>(row, idx)?.map(|v| Value::Number(v.into())),
        "float4" => get::<f32>(row, idx)?
            .and_then(|v| serde_json::Number::from_f64(v as f64))
            .map(Value::Number),
        "float8" => get::<f64>(row, idx)?
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number),
        "json" | "jsonb" => get::<Value>(row, idx)?,
        "timestamp" => get::<NaiveDateTime>(row, idx)?.map(|v| Value::String(v.to_string())),
        "timestamptz" => get::<DateTime<Utc>>(row, idx)?.map(|v| Value::String(v.to_rfc3339())),
        "date" => get::<NaiveDate>(row, idx)?.map(|v| Value::String(v.to_string())),
        "uuid" => get::<uuid::Uuid>(row, idx)?.map(|v| Value::String(v.to_string())),
        // Anything else is read as text when the driver allows it
        _ => row
            .try_get::<_, Option<String>>(idx)
            .ok()
            .flatten()
            .map(Value::String),
    };

    Ok(value.unwrap_or(Value::Null))
}

/// Convert a PostgreSQL row to a DataRow
pub fn row_to_datarow(row: &Row) -> Result<DataRow> {
    let mut data_row = DataRow::with_capacity(row.len());
    for (idx, column) in row.columns().iter().enumerate() {
        data_row.insert(column.name().to_string(), column_value(row, idx)?);
    }
    Ok(data_row)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn encode(value: Value, ty: &Type) -> std::result::Result<(IsNull, BytesMut), BoxError> {
        let mut out = BytesMut::new();
        let is_null = PgParam(value).to_sql(ty, &mut out)?;
        Ok((is_null, out))
    }

    #[test]
    fn test_null_binds_as_sql_null() {
        let (is_null, out) = encode(Value::Null, &Type::INT4).unwrap();
        assert!(matches!(is_null, IsNull::Yes));
        assert!(out.is_empty());
    }

    #[test]
    fn test_integer_width_follows_column_type() {
        let (_, out) = encode(json!(7), &Type::INT4).unwrap();
        assert_eq!(&out[..], &7i32.to_be_bytes());

        let (_, out) = encode(json!(7), &Type::INT8).unwrap();
        assert_eq!(&out[..], &7i64.to_be_bytes());

        let (_, out) = encode(json!("42"), &Type::INT2).unwrap();
        assert_eq!(&out[..], &42i16.to_be_bytes());
    }

    #[test]
    fn test_out_of_range_integer_is_rejected() {
        assert!(encode(json!(i64::MAX), &Type::INT4).is_err());
        assert!(encode(json!(1.5), &Type::INT8).is_err());
    }

    #[test]
    fn test_text_and_json() {
        let (_, out) = encode(json!("ada"), &Type::TEXT).unwrap();
        assert_eq!(&out[..], b"ada");

        let (_, out) = encode(json!(12), &Type::VARCHAR).unwrap();
        assert_eq!(&out[..], b"12");

        let (_, out) = encode(json!({"a": 1}), &Type::JSONB).unwrap();
        assert_eq!(out[0], 1);
        assert_eq!(&out[1..], br#"{"a":1}"#);
    }

    #[test]
    fn test_bool_from_number() {
        let (_, out) = encode(json!(1), &Type::BOOL).unwrap();
        assert_eq!(&out[..], &[1]);
    }

    #[test]
    fn test_accepts() {
        assert!(PgParam::accepts(&Type::INT8));
        assert!(PgParam::accepts(&Type::TIMESTAMPTZ));
        assert!(!PgParam::accepts(&Type::BYTEA));
    }
}
