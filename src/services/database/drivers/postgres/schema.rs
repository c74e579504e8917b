//! PostgreSQL schema introspection.
//!
//! Columns come from `information_schema`; keys, indexes and statistics come
//! from `pg_catalog`, addressed through `to_regclass` so quoting and
//! search-path resolution match what a query against the table would do.

use sqlx::Row as _;
use sqlx::postgres::PgConnection as RawConnection;

use super::connection::PostgresConnection;
use super::types::fk_action;
use crate::services::database::error::{DbError, DbResult};
use crate::services::database::traits::{
    Column, DatabaseConnection, ForeignKeyInfo, IndexInfo, TableSchema,
};

const DEFAULT_SCHEMA: &str = "public";

impl PostgresConnection {
    pub(super) async fn load_tables(&self) -> DbResult<Vec<String>> {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or(DbError::NotConnected)?;

        let rows = sqlx::query(
            r#"
            SELECT table_schema::text AS table_schema, table_name::text AS table_name
            FROM information_schema.tables
            WHERE table_schema NOT IN ('pg_catalog', 'information_schema')
                AND table_type IN ('BASE TABLE', 'VIEW')
            ORDER BY table_schema, table_name
            "#,
        )
        .fetch_all(&mut *conn)
        .await?;

        let mut tables = Vec::with_capacity(rows.len());
        for row in rows {
            let schema: String = row.try_get("table_schema")?;
            let name: String = row.try_get("table_name")?;
            if schema == DEFAULT_SCHEMA {
                tables.push(name);
            } else {
                tables.push(format!("{schema}.{name}"));
            }
        }
        Ok(tables)
    }

    pub(super) async fn load_table_schema(&self, table: &str) -> DbResult<TableSchema> {
        let (schema, name) = match table.split_once('.') {
            Some((schema, name)) => (schema.to_string(), name.to_string()),
            None => (DEFAULT_SCHEMA.to_string(), table.to_string()),
        };
        let regclass = self.dialect().escape(table);

        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or(DbError::NotConnected)?;

        let mut result = TableSchema::new(name.clone(), table.contains('.').then(|| schema.clone()));
        result.columns = Self::load_columns(conn, &schema, &name).await?;
        if result.columns.is_empty() {
            return Err(DbError::QueryFailed(format!("no such table: {table}")));
        }

        let primary = Self::load_primary_key(conn, &regclass).await?;
        for column in &mut result.columns {
            if primary.contains(&column.name) {
                column.primary_key = true;
                column.nullable = false;
            }
        }

        result.indexes = Self::load_indexes(conn, &regclass).await?;
        result.foreign_keys = Self::load_foreign_keys(conn, &regclass).await?;
        result.row_count = Self::estimate(conn, &regclass).await?;
        result.link_foreign_keys();
        Ok(result)
    }

    pub(super) async fn load_estimate(&self, table: &str) -> DbResult<i64> {
        let regclass = self.dialect().escape(table);
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or(DbError::NotConnected)?;
        Self::estimate(conn, &regclass).await
    }

    /// `reltuples` is -1 (or meaningless with no pages) until the table is analyzed.
    async fn estimate(conn: &mut RawConnection, regclass: &str) -> DbResult<i64> {
        let estimate: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT CASE WHEN c.reltuples < 0 OR c.relpages = 0 THEN -1 ELSE c.reltuples::int8 END
            FROM pg_class c
            WHERE c.oid = to_regclass($1)
            "#,
        )
        .bind(regclass)
        .fetch_optional(&mut *conn)
        .await?;
        Ok(estimate.unwrap_or(-1))
    }

    async fn load_columns(conn: &mut RawConnection, schema: &str, table: &str) -> DbResult<Vec<Column>> {
        let rows = sqlx::query(
            r#"
            SELECT
                c.column_name::text AS name,
                c.data_type::text AS type_name,
                c.is_nullable = 'YES' AS nullable,
                c.column_default::text AS default_value,
                c.character_maximum_length::int8 AS max_length,
                COALESCE(c.is_identity = 'YES' OR c.column_default LIKE 'nextval(%', false) AS auto_increment
            FROM information_schema.columns c
            WHERE c.table_schema = $1 AND c.table_name = $2
            ORDER BY c.ordinal_position
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
            columns.push(
                Column::new(name, type_name)
                    .with_nullable(row.try_get("nullable")?)
                    .with_auto_increment(row.try_get("auto_increment")?)
                    .with_default(row.try_get("default_value")?)
                    .with_max_length(row.try_get("max_length")?),
            );
        }
        Ok(columns)
    }

    async fn load_primary_key(conn: &mut RawConnection, regclass: &str) -> DbResult<Vec<String>> {
        let names: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT a.attname::text
            FROM pg_index i
            JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey)
            WHERE i.indrelid = to_regclass($1) AND i.indisprimary
            "#,
        )
        .bind(regclass)
        .fetch_all(&mut *conn)
        .await?;
        Ok(names)
    }

    async fn load_indexes(conn: &mut RawConnection, regclass: &str) -> DbResult<Vec<IndexInfo>> {
        let rows = sqlx::query(
            r#"
            SELECT
                ic.relname::text AS name,
                i.indisunique AS is_unique,
                i.indisprimary AS is_primary,
                am.amname::text AS index_type,
                ARRAY(
                    SELECT a.attname::text
                    FROM unnest(i.indkey) WITH ORDINALITY AS k(attnum, ord)
                    JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = k.attnum
                    ORDER BY k.ord
                ) AS columns
            FROM pg_index i
            JOIN pg_class ic ON ic.oid = i.indexrelid
            JOIN pg_am am ON am.oid = ic.relam
            WHERE i.indrelid = to_regclass($1)
            ORDER BY ic.relname
            "#,
        )
        .bind(regclass)
        .fetch_all(&mut *conn)
        .await?;

        let mut indexes = Vec::with_capacity(rows.len());
        for row in rows {
            let name: String = row.try_get("name")?;
            let columns: Vec<String> = row.try_get("columns")?;
            let index_type: String = row.try_get("index_type")?;

            let mut index = IndexInfo::new(name, columns, index_type);
            if row.try_get::<bool, _>("is_primary")? {
                index = index.as_primary();
            } else if row.try_get::<bool, _>("is_unique")? {
                index = index.as_unique();
            }
            indexes.push(index);
        }
        Ok(indexes)
    }

    async fn load_foreign_keys(
        conn: &mut RawConnection,
        regclass: &str,
    ) -> DbResult<Vec<ForeignKeyInfo>> {
        let rows = sqlx::query(
            r#"
            SELECT
                con.conname::text AS name,
                con.confrelid::regclass::text AS ref_table,
                con.confdeltype::text AS on_delete,
                con.confupdtype::text AS on_update,
                ARRAY(
                    SELECT a.attname::text
                    FROM unnest(con.conkey) WITH ORDINALITY AS k(attnum, ord)
                    JOIN pg_attribute a ON a.attrelid = con.conrelid AND a.attnum = k.attnum
                    ORDER BY k.ord
                ) AS columns,
                ARRAY(
                    SELECT a.attname::text
                    FROM unnest(con.confkey) WITH ORDINALITY AS k(attnum, ord)
                    JOIN pg_attribute a ON a.attrelid = con.confrelid AND a.attnum = k.attnum
                    ORDER BY k.ord
                ) AS ref_columns
            FROM pg_constraint con
            WHERE con.conrelid = to_regclass($1) AND con.contype = 'f'
            ORDER BY con.conname
            "#,
        )
        .bind(regclass)
        .fetch_all(&mut *conn)
        .await?;

        let mut foreign_keys = Vec::with_capacity(rows.len());
        for row in rows {
            let name: String = row.try_get("name")?;
            let ref_table: String = row.try_get("ref_table")?;
            let on_delete: String = row.try_get("on_delete")?;
            let on_update: String = row.try_get("on_update")?;

            let mut fk = ForeignKeyInfo::new(name, ref_table.trim_matches('"'))
                .with_actions(fk_action(&on_delete), fk_action(&on_update));
            fk.columns = row.try_get("columns")?;
            fk.ref_columns = row.try_get("ref_columns")?;
            foreign_keys.push(fk);
        }
        Ok(foreign_keys)
    }
}
