//! PostgreSQL type conversion utilities.
//!
//! This module handles conversion between PostgreSQL-specific types (from SQLx)
//! and the generic `Value` type used across all database drivers.
//!
//! User SQL runs over the simple query protocol, so most values arrive in
//! text format. The typed decoders below accept both formats; whatever fails
//! to decode as its reported type is delivered as text.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgArguments, PgColumn, PgRow, PgSslMode, Postgres};
use sqlx::query::Query;
use sqlx::{Column as _, Row as _, TypeInfo, ValueRef};
use uuid::Uuid;

use crate::services::database::traits::{Column, DataType, Row, SslMode, Value};

/// Converter for PostgreSQL values to the unified `Value` type.
pub struct PgValueConverter;

impl PgValueConverter {
    /// Convert a PostgreSQL row to a trait Row.
    pub fn convert_row(pg_row: &PgRow) -> Row {
        let values = pg_row
            .columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| Self::extract_value(pg_row, col, idx))
            .collect();

        Row::new(values)
    }

    /// Build column metadata from a PostgreSQL row.
    pub fn build_columns(pg_row: &PgRow) -> Vec<Column> {
        pg_row
            .columns()
            .iter()
            .map(|col| Column::new(col.name(), col.type_info().name()))
            .collect()
    }

    /// Extract a value from a PostgreSQL row at the given column index.
    fn extract_value(row: &PgRow, column: &PgColumn, index: usize) -> Value {
        let type_name = column.type_info().name();
        let declared = DataType::from_type_name(type_name);

        match row.try_get_raw(index) {
            Ok(raw) if raw.is_null() => return Value::Null(declared),
            Err(_) => return Value::Null(declared),
            _ => {}
        }

        Self::decode_by_type(row, index, type_name, declared)
    }

    /// Decode a value based on its PostgreSQL type name.
    fn decode_by_type(row: &PgRow, index: usize, type_name: &str, declared: DataType) -> Value {
        match type_name {
            "BOOL" => row
                .try_get_unchecked::<bool, _>(index)
                .map(Value::Bool)
                .unwrap_or_else(|_| Self::decode_as_text(row, index, declared)),

            "INT2" => row
                .try_get_unchecked::<i16, _>(index)
                .map(|v| Value::Int64(v.into()))
                .unwrap_or_else(|_| Self::decode_as_text(row, index, declared)),

            "INT4" => row
                .try_get_unchecked::<i32, _>(index)
                .map(|v| Value::Int64(v.into()))
                .unwrap_or_else(|_| Self::decode_as_text(row, index, declared)),

            "INT8" => row
                .try_get_unchecked::<i64, _>(index)
                .map(Value::Int64)
                .unwrap_or_else(|_| Self::decode_as_text(row, index, declared)),

            "OID" => row
                .try_get_unchecked::<sqlx::postgres::types::Oid, _>(index)
                .map(|oid| Value::Int64(oid.0.into()))
                .unwrap_or_else(|_| Self::decode_as_text(row, index, declared)),

            "FLOAT4" => row
                .try_get_unchecked::<f32, _>(index)
                .map(|v| Value::Float64(v.into()))
                .unwrap_or_else(|_| Self::decode_as_text(row, index, declared)),

            "FLOAT8" => row
                .try_get_unchecked::<f64, _>(index)
                .map(Value::Float64)
                .unwrap_or_else(|_| Self::decode_as_text(row, index, declared)),

            // NaN and values wider than a double stay text
            "NUMERIC" => row
                .try_get_unchecked::<Decimal, _>(index)
                .map(|d| Value::from_decimal_text(&d.to_string()))
                .unwrap_or_else(|_| Self::decode_as_text(row, index, declared)),

            "BYTEA" => row
                .try_get_unchecked::<Vec<u8>, _>(index)
                .map(Value::blob)
                .unwrap_or_else(|_| Self::decode_as_text(row, index, declared)),

            "DATE" => row
                .try_get_unchecked::<NaiveDate, _>(index)
                .map(|d| Value::text(d.format("%Y-%m-%d").to_string()))
                .unwrap_or_else(|_| Self::decode_as_text(row, index, declared)),

            "TIME" => row
                .try_get_unchecked::<NaiveTime, _>(index)
                .map(|t| Value::text(t.to_string()))
                .unwrap_or_else(|_| Self::decode_as_text(row, index, declared)),

            "TIMESTAMP" => row
                .try_get_unchecked::<NaiveDateTime, _>(index)
                .map(|ts| Value::text(ts.format("%Y-%m-%d %H:%M:%S%.f").to_string()))
                .unwrap_or_else(|_| Self::decode_as_text(row, index, declared)),

            "TIMESTAMPTZ" => row
                .try_get_unchecked::<DateTime<Utc>, _>(index)
                .map(|ts| Value::text(ts.to_rfc3339()))
                .unwrap_or_else(|_| Self::decode_as_text(row, index, declared)),

            "UUID" => row
                .try_get_unchecked::<Uuid, _>(index)
                .map(|u| Value::text(u.to_string()))
                .unwrap_or_else(|_| Self::decode_as_text(row, index, declared)),

            // TEXT, VARCHAR, JSON, arrays, enums and anything else Postgres renders as text
            _ => Self::decode_as_text(row, index, declared),
        }
    }

    /// Fallback: the textual rendering of the value.
    fn decode_as_text(row: &PgRow, index: usize, declared: DataType) -> Value {
        match row.try_get_unchecked::<String, _>(index) {
            Ok(s) => Value::text(s),
            Err(e) => {
                tracing::debug!(index, error = %e, "undecodable postgres value");
                Value::Null(declared)
            }
        }
    }

    /// Map the generic SSL mode onto SQLx's PostgreSQL one.
    pub fn map_ssl_mode(mode: SslMode) -> PgSslMode {
        match mode {
            SslMode::Disable => PgSslMode::Disable,
            SslMode::Prefer => PgSslMode::Prefer,
            SslMode::Require => PgSslMode::Require,
            SslMode::VerifyCa => PgSslMode::VerifyCa,
            SslMode::VerifyFull => PgSslMode::VerifyFull,
        }
    }
}

/// Bind a value as the next positional parameter.
///
/// Parameters are sent with their Rust type; the statement casts them to the
/// column type where it is known.
pub fn bind_value<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &Value,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        Value::Null(_) | Value::Oversized { .. } => query.bind(None::<String>),
        Value::Bool(b) => query.bind(*b),
        Value::Int64(v) => query.bind(*v),
        Value::Float64(v) => query.bind(*v),
        Value::Text(s) => query.bind(s.clone()),
        Value::Blob(b) => query.bind(b.clone()),
    }
}

/// Placeholder for the `index`-th parameter, cast to `type_name` when known.
pub fn cast_placeholder(index: usize, type_name: Option<&str>) -> String {
    match type_name {
        Some(type_name) => format!("CAST(${index} AS {type_name})"),
        None => format!("${index}"),
    }
}

/// Referential action code from `pg_constraint` as SQL text.
pub fn fk_action(code: &str) -> &'static str {
    match code {
        "r" => "RESTRICT",
        "c" => "CASCADE",
        "n" => "SET NULL",
        "d" => "SET DEFAULT",
        _ => "NO ACTION",
    }
}
