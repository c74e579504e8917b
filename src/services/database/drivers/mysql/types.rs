//! MySQL type conversion utilities.
//!
//! This module handles conversion between MySQL-specific types (from SQLx)
//! and the generic `Value` type used across all database drivers.
//!
//! User SQL goes over the text protocol, so every value arrives as its textual
//! rendering. Temporal values are passed through as that text because MySQL
//! allows zero dates that no calendar type can hold.

use rust_decimal::Decimal;
use sqlx::mysql::{MySql, MySqlArguments, MySqlColumn, MySqlRow, MySqlSslMode};
use sqlx::query::Query;
use sqlx::{Column as _, Row as _, TypeInfo, ValueRef};

use crate::services::database::traits::{Column, DataType, Row, SslMode, Value};

/// Converter for MySQL values to the unified `Value` type.
pub struct MySqlValueConverter;

impl MySqlValueConverter {
    /// Convert a MySQL row to a trait Row.
    pub fn convert_row(mysql_row: &MySqlRow) -> Row {
        let values = mysql_row
            .columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| Self::extract_value(mysql_row, col, idx))
            .collect();

        Row::new(values)
    }

    /// Build column metadata from a MySQL row.
    pub fn build_columns(mysql_row: &MySqlRow) -> Vec<Column> {
        mysql_row
            .columns()
            .iter()
            .map(|col| Column::new(col.name(), col.type_info().name()))
            .collect()
    }

    /// Extract a value from a MySQL row at the given column index.
    fn extract_value(row: &MySqlRow, column: &MySqlColumn, index: usize) -> Value {
        let type_name = column.type_info().name();
        let declared = DataType::from_type_name(type_name);

        match row.try_get_raw(index) {
            Ok(raw) if raw.is_null() => return Value::Null(declared),
            Err(_) => return Value::Null(declared),
            _ => {}
        }

        Self::decode_by_type(row, index, type_name, declared)
    }

    /// Decode a value based on its MySQL type name.
    fn decode_by_type(row: &MySqlRow, index: usize, type_name: &str, declared: DataType) -> Value {
        match type_name {
            // TINYINT(1)
            "BOOLEAN" => row
                .try_get_unchecked::<bool, _>(index)
                .map(Value::Bool)
                .unwrap_or_else(|_| Self::decode_as_text(row, index, declared)),

            "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" | "YEAR" => row
                .try_get_unchecked::<i64, _>(index)
                .map(Value::Int64)
                .unwrap_or_else(|_| Self::integer_from_text(row, index, declared)),

            // Anything above i64::MAX stays text
            _ if type_name.ends_with(" UNSIGNED") => row
                .try_get_unchecked::<u64, _>(index)
                .map(|v| Value::from_integer_text(&v.to_string()))
                .unwrap_or_else(|_| Self::integer_from_text(row, index, declared)),

            "FLOAT" | "DOUBLE" => match row.try_get_unchecked::<String, _>(index) {
                Ok(s) => Value::from_float_text(&s),
                Err(_) => Self::decode_as_text(row, index, declared),
            },

            "DECIMAL" => row
                .try_get_unchecked::<Decimal, _>(index)
                .map(|d| Value::from_decimal_text(&d.to_string()))
                .unwrap_or_else(|_| Self::decode_as_text(row, index, declared)),

            "BINARY" | "VARBINARY" | "TINYBLOB" | "BLOB" | "MEDIUMBLOB" | "LONGBLOB" | "BIT"
            | "GEOMETRY" => row
                .try_get_unchecked::<Vec<u8>, _>(index)
                .map(Value::blob)
                .unwrap_or(Value::Null(declared)),

            // CHAR, VARCHAR, TEXT, JSON, ENUM, SET, DATE, DATETIME, TIMESTAMP, TIME
            _ => Self::decode_as_text(row, index, declared),
        }
    }

    fn integer_from_text(row: &MySqlRow, index: usize, declared: DataType) -> Value {
        match row.try_get_unchecked::<String, _>(index) {
            Ok(s) => Value::from_integer_text(&s),
            Err(_) => Self::decode_as_text(row, index, declared),
        }
    }

    /// Fallback: the textual rendering, or the raw bytes when it is not UTF-8.
    fn decode_as_text(row: &MySqlRow, index: usize, declared: DataType) -> Value {
        if let Ok(s) = row.try_get_unchecked::<String, _>(index) {
            return Value::text(s);
        }
        match row.try_get_unchecked::<Vec<u8>, _>(index) {
            Ok(bytes) => Value::blob(bytes),
            Err(e) => {
                tracing::debug!(index, error = %e, "undecodable mysql value");
                Value::Null(declared)
            }
        }
    }

    /// Map the generic SSL mode onto SQLx's MySQL one.
    pub fn map_ssl_mode(mode: SslMode) -> MySqlSslMode {
        match mode {
            SslMode::Disable => MySqlSslMode::Disabled,
            SslMode::Prefer => MySqlSslMode::Preferred,
            SslMode::Require => MySqlSslMode::Required,
            SslMode::VerifyCa => MySqlSslMode::VerifyCa,
            SslMode::VerifyFull => MySqlSslMode::VerifyIdentity,
        }
    }
}

/// Bind a value as the next positional parameter.
pub fn bind_value<'q>(
    query: Query<'q, MySql, MySqlArguments>,
    value: &Value,
) -> Query<'q, MySql, MySqlArguments> {
    match value {
        Value::Null(_) | Value::Oversized { .. } => query.bind(None::<String>),
        Value::Bool(b) => query.bind(*b),
        Value::Int64(v) => query.bind(*v),
        Value::Float64(v) => query.bind(*v),
        Value::Text(s) => query.bind(s.clone()),
        Value::Blob(b) => query.bind(b.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ssl_mode_mapping() {
        assert!(matches!(
            MySqlValueConverter::map_ssl_mode(SslMode::Disable),
            MySqlSslMode::Disabled
        ));
        assert!(matches!(
            MySqlValueConverter::map_ssl_mode(SslMode::Prefer),
            MySqlSslMode::Preferred
        ));
        assert!(matches!(
            MySqlValueConverter::map_ssl_mode(SslMode::Require),
            MySqlSslMode::Required
        ));
        assert!(matches!(
            MySqlValueConverter::map_ssl_mode(SslMode::VerifyFull),
            MySqlSslMode::VerifyIdentity
        ));
    }
}
