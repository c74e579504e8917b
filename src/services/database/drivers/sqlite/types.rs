//! SQLite type conversion utilities.
//!
//! This module handles conversion between SQLite values (from SQLx)
//! and the generic `Value` type used across all database drivers.
//!
//! SQLite uses dynamic typing: the storage class of each value decides how it
//! is decoded, and the declared column type only refines it:
//! - INTEGER: 64-bit signed integer (BOOLEAN columns become `Bool`)
//! - REAL: 64-bit floating point
//! - TEXT: UTF-8 string (NUMERIC/DECIMAL columns are parsed as numbers)
//! - BLOB: Binary data
//! - NULL: Null value, tagged with the declared type

use sqlx::query::Query;
use sqlx::sqlite::{Sqlite, SqliteArguments, SqliteColumn, SqliteRow};
use sqlx::{Column as _, Row as _, TypeInfo, ValueRef};

use crate::services::database::traits::{Column, DataType, Row, Value};

/// Converter for SQLite values to the unified `Value` type.
pub struct SqliteValueConverter;

impl SqliteValueConverter {
    /// Convert a SQLite row to a trait Row.
    pub fn convert_row(sqlite_row: &SqliteRow) -> Row {
        let values = sqlite_row
            .columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| Self::extract_value(sqlite_row, col, idx))
            .collect();

        Row::new(values)
    }

    /// Build column metadata from a SQLite row.
    pub fn build_columns(sqlite_row: &SqliteRow) -> Vec<Column> {
        sqlite_row
            .columns()
            .iter()
            .map(|col| Column::new(col.name(), col.type_info().name()))
            .collect()
    }

    /// Extract a value from a SQLite row at the given column index.
    fn extract_value(row: &SqliteRow, column: &SqliteColumn, index: usize) -> Value {
        let declared = DataType::from_type_name(column.type_info().name());

        let storage = match row.try_get_raw(index) {
            Ok(raw) if raw.is_null() => return Value::Null(declared),
            Ok(raw) => raw.type_info().name().to_string(),
            Err(_) => return Value::Null(declared),
        };

        Self::decode_by_storage(row, index, &storage, declared)
    }

    /// Decode a value based on its storage class.
    fn decode_by_storage(row: &SqliteRow, index: usize, storage: &str, declared: DataType) -> Value {
        match storage {
            "INTEGER" | "BOOLEAN" => match row.try_get_unchecked::<i64, _>(index) {
                Ok(v) if declared == DataType::Bool => Value::Bool(v != 0),
                Ok(v) => Value::Int64(v),
                Err(_) => Value::Null(declared),
            },

            "REAL" => row
                .try_get_unchecked::<f64, _>(index)
                .map(Value::Float64)
                .unwrap_or(Value::Null(declared)),

            "BLOB" => row
                .try_get_unchecked::<Vec<u8>, _>(index)
                .map(Value::blob)
                .unwrap_or(Value::Null(declared)),

            // TEXT, and anything SQLite reports under another name
            _ => match row.try_get_unchecked::<String, _>(index) {
                Ok(s) if declared == DataType::Float => Value::from_decimal_text(&s),
                Ok(s) => Value::text(s),
                Err(_) => row
                    .try_get_unchecked::<Vec<u8>, _>(index)
                    .map(Value::blob)
                    .unwrap_or(Value::Null(declared)),
            },
        }
    }
}

/// Bind a value as the next positional parameter.
pub fn bind_value<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &Value,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
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
    use sqlx::{ConnectOptions, Connection};
    use sqlx::sqlite::SqliteConnectOptions;
    use std::str::FromStr;

    fn fetch_row(sql: &'static str) -> SqliteRow {
        smol::block_on(async {
            let mut conn = SqliteConnectOptions::from_str(":memory:")
                .unwrap()
                .connect()
                .await
                .unwrap();
            sqlx::query(
                "CREATE TABLE t (i INTEGER, f REAL, s TEXT, b BLOB, flag BOOLEAN, amount NUMERIC, n TEXT)",
            )
            .execute(&mut conn)
            .await
            .unwrap();
            sqlx::query(sql).execute(&mut conn).await.unwrap();
            let row = sqlx::query("SELECT * FROM t").fetch_one(&mut conn).await.unwrap();
            conn.close().await.unwrap();
            row
        })
    }

    #[test]
    fn test_convert_row_by_storage_class() {
        let row = fetch_row(
            "INSERT INTO t VALUES (42, 1.5, 'hi', x'DEADBEEF', 1, 'n/a', NULL)",
        );
        let converted = SqliteValueConverter::convert_row(&row);
        assert_eq!(
            converted.values,
            vec![
                Value::Int64(42),
                Value::Float64(1.5),
                Value::Text("hi".into()),
                Value::Blob(vec![0xde, 0xad, 0xbe, 0xef]),
                Value::Bool(true),
                Value::Text("n/a".into()),
                Value::Null(DataType::Text),
            ]
        );
    }

    #[test]
    fn test_build_columns() {
        let row = fetch_row("INSERT INTO t (i) VALUES (1)");
        let columns = SqliteValueConverter::build_columns(&row);
        assert_eq!(columns.len(), 7);
        assert_eq!(columns[0].name, "i");
        assert_eq!(columns[0].data_type, DataType::Int);
        assert_eq!(columns[3].data_type, DataType::Blob);
    }
}
