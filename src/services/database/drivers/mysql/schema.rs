//! MySQL schema introspection.
//!
//! Everything comes from `information_schema`. Its columns are cast to CHAR
//! or SIGNED because MySQL 8 reports several of them with binary collation.

use sqlx::Row as _;
use sqlx::mysql::MySqlConnection as RawConnection;

use super::connection::MySqlConnection;
use crate::services::database::error::{DbError, DbResult};
use crate::services::database::traits::{Column, ForeignKeyInfo, IndexInfo, TableSchema};

/// `schema.table` into an optional schema (the current database when absent) and a name
fn split_table(table: &str) -> (Option<String>, String) {
    match table.split_once('.') {
        Some((schema, name)) => (Some(schema.to_string()), name.to_string()),
        None => (None, table.to_string()),
    }
}

impl MySqlConnection {
    pub(super) async fn load_tables(&self) -> DbResult<Vec<String>> {
        let mut guard = self.session().await?;
        let conn = guard.as_mut().ok_or(DbError::NotConnected)?;

        let result = sqlx::query_scalar(
            r#"
            SELECT CAST(TABLE_NAME AS CHAR)
            FROM information_schema.TABLES
            WHERE TABLE_SCHEMA = DATABASE()
            ORDER BY TABLE_NAME
            "#,
        )
        .fetch_all(&mut *conn)
        .await
        .map_err(DbError::from);
        self.forget_if_lost(&mut guard, &result);
        result
    }

    pub(super) async fn load_table_schema(&self, table: &str) -> DbResult<TableSchema> {
        let (schema, name) = split_table(table);

        let mut guard = self.session().await?;
        let conn = guard.as_mut().ok_or(DbError::NotConnected)?;
        let result = Self::describe(conn, schema, name, table).await;
        self.forget_if_lost(&mut guard, &result);
        result
    }

    pub(super) async fn load_estimate(&self, table: &str) -> DbResult<i64> {
        let (schema, name) = split_table(table);

        let mut guard = self.session().await?;
        let conn = guard.as_mut().ok_or(DbError::NotConnected)?;
        let result = Self::estimate(conn, schema.as_deref(), &name).await;
        self.forget_if_lost(&mut guard, &result);
        result
    }

    async fn describe(
        conn: &mut RawConnection,
        schema: Option<String>,
        name: String,
        table: &str,
    ) -> DbResult<TableSchema> {
        let mut result = TableSchema::new(name.clone(), schema.clone());
        result.columns = Self::load_columns(conn, schema.as_deref(), &name).await?;
        if result.columns.is_empty() {
            return Err(DbError::QueryFailed(format!("no such table: {table}")));
        }
        result.indexes = Self::load_indexes(conn, schema.as_deref(), &name).await?;
        result.foreign_keys = Self::load_foreign_keys(conn, schema.as_deref(), &name).await?;
        result.row_count = Self::estimate(conn, schema.as_deref(), &name).await?;
        result.link_foreign_keys();
        Ok(result)
    }

    /// `TABLE_ROWS` is an InnoDB estimate and NULL for views.
    async fn estimate(conn: &mut RawConnection, schema: Option<&str>, table: &str) -> DbResult<i64> {
        let estimate: Option<Option<i64>> = sqlx::query_scalar(
            r#"
            SELECT CAST(TABLE_ROWS AS SIGNED)
            FROM information_schema.TABLES
            WHERE TABLE_SCHEMA = COALESCE(?, DATABASE()) AND TABLE_NAME = ?
            "#,
        )
        .bind(schema)
        .bind(table)
        .fetch_optional(&mut *conn)
        .await?;
        Ok(estimate.flatten().unwrap_or(-1))
    }

    async fn load_columns(
        conn: &mut RawConnection,
        schema: Option<&str>,
        table: &str,
    ) -> DbResult<Vec<Column>> {
        let rows = sqlx::query(
            r#"
            SELECT
                CAST(COLUMN_NAME AS CHAR) AS name,
                CAST(COLUMN_TYPE AS CHAR) AS type_name,
                CAST(IS_NULLABLE AS CHAR) AS is_nullable,
                CAST(COLUMN_DEFAULT AS CHAR) AS default_value,
                CAST(COLUMN_KEY AS CHAR) AS column_key,
                CAST(EXTRA AS CHAR) AS extra,
                CAST(CHARACTER_MAXIMUM_LENGTH AS SIGNED) AS max_length
            FROM information_schema.COLUMNS
            WHERE TABLE_SCHEMA = COALESCE(?, DATABASE()) AND TABLE_NAME = ?
            ORDER BY ORDINAL_POSITION
            "#,
        )
        .bind(schema)
        .bind(table)
        .fetch_all(&mut *conn)
        .await?;

        let mut columns = Vec::with_capacity(rows.len());
        for row in rows {
            let name: String = row.try_get("name")?;
            let type_name: String = row.try_get("type_name")?;
            let is_nullable: String = row.try_get("is_nullable")?;
            let column_key: String = row.try_get("column_key")?;
            let extra: String = row.try_get("extra")?;

            columns.push(
                Column::new(name, type_name)
                    .with_nullable(is_nullable == "YES")
                    .with_primary_key(column_key == "PRI")
                    .with_auto_increment(extra.to_ascii_lowercase().contains("auto_increment"))
                    .with_default(row.try_get("default_value")?)
                    .with_max_length(row.try_get("max_length")?),
            );
        }
        Ok(columns)
    }

    async fn load_indexes(
        conn: &mut RawConnection,
        schema: Option<&str>,
        table: &str,
    ) -> DbResult<Vec<IndexInfo>> {
        let rows = sqlx::query(
            r#"
            SELECT
                CAST(INDEX_NAME AS CHAR) AS name,
                CAST(COLUMN_NAME AS CHAR) AS column_name,
                CAST(NON_UNIQUE AS SIGNED) AS non_unique,
                CAST(INDEX_TYPE AS CHAR) AS index_type
            FROM information_schema.STATISTICS
            WHERE TABLE_SCHEMA = COALESCE(?, DATABASE()) AND TABLE_NAME = ?
            ORDER BY INDEX_NAME, SEQ_IN_INDEX
            "#,
        )
        .bind(schema)
        .bind(table)
        .fetch_all(&mut *conn)
        .await?;

        let mut indexes: Vec<IndexInfo> = Vec::new();
        for row in rows {
            let name: String = row.try_get("name")?;
            // NULL for functional key parts
            let column: Option<String> = row.try_get("column_name")?;
            let non_unique: i64 = row.try_get("non_unique")?;
            let index_type: String = row.try_get("index_type")?;

            match indexes.last_mut() {
                Some(index) if index.name == name => index.columns.extend(column),
                _ => {
                    let mut index = IndexInfo::new(name.clone(), column.into_iter().collect(), index_type);
                    if name == "PRIMARY" {
                        index = index.as_primary();
                    } else if non_unique == 0 {
                        index = index.as_unique();
                    }
                    indexes.push(index);
                }
            }
        }
        Ok(indexes)
    }

    async fn load_foreign_keys(
        conn: &mut RawConnection,
        schema: Option<&str>,
        table: &str,
    ) -> DbResult<Vec<ForeignKeyInfo>> {
        let rows = sqlx::query(
            r#"
            SELECT
                CAST(k.CONSTRAINT_NAME AS CHAR) AS name,
                CAST(k.COLUMN_NAME AS CHAR) AS column_name,
                CAST(k.REFERENCED_TABLE_NAME AS CHAR) AS ref_table,
                CAST(k.REFERENCED_COLUMN_NAME AS CHAR) AS ref_column,
                CAST(r.DELETE_RULE AS CHAR) AS on_delete,
                CAST(r.UPDATE_RULE AS CHAR) AS on_update
            FROM information_schema.KEY_COLUMN_USAGE k
            JOIN information_schema.REFERENTIAL_CONSTRAINTS r
                ON r.CONSTRAINT_SCHEMA = k.CONSTRAINT_SCHEMA
                AND r.CONSTRAINT_NAME = k.CONSTRAINT_NAME
                AND r.TABLE_NAME = k.TABLE_NAME
            WHERE k.TABLE_SCHEMA = COALESCE(?, DATABASE())
                AND k.TABLE_NAME = ?
                AND k.REFERENCED_TABLE_NAME IS NOT NULL
            ORDER BY k.CONSTRAINT_NAME, k.ORDINAL_POSITION
            "#,
        )
        .bind(schema)
        .bind(table)
        .fetch_all(&mut *conn)
        .await?;

        let mut foreign_keys: Vec<ForeignKeyInfo> = Vec::new();
        for row in rows {
            let name: String = row.try_get("name")?;
            let column: String = row.try_get("column_name")?;
            let ref_column: String = row.try_get("ref_column")?;

            match foreign_keys.last_mut() {
                Some(fk) if fk.name == name => {
                    fk.columns.push(column);
                    fk.ref_columns.push(ref_column);
                }
                _ => {
                    let ref_table: String = row.try_get("ref_table")?;
                    let on_delete: String = row.try_get("on_delete")?;
                    let on_update: String = row.try_get("on_update")?;
                    foreign_keys.push(
                        ForeignKeyInfo::new(name, ref_table)
                            .with_pair(column, ref_column)
                            .with_actions(on_delete, on_update),
                    );
                }
            }
        }
        Ok(foreign_keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_table() {
        assert_eq!(split_table("users"), (None, "users".to_string()));
        assert_eq!(
            split_table("shop.orders"),
            (Some("shop".to_string()), "orders".to_string())
        );
    }
}
