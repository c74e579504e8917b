//! SQLite schema introspection.
//!
//! Metadata comes from `sqlite_master` and the `pragma_*` table-valued
//! functions, which take the table name as a bound parameter.

use sqlx::Row as _;
use sqlx::sqlite::SqliteConnection as RawConnection;

use super::connection::SqliteConnection;
use crate::services::database::error::{DbError, DbResult};
use crate::services::database::traits::{Column, ForeignKeyInfo, IndexInfo, TableSchema};

impl SqliteConnection {
    pub(super) async fn load_tables(&self) -> DbResult<Vec<String>> {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or(DbError::NotConnected)?;

        let rows = sqlx::query(
            r#"
            SELECT name
            FROM sqlite_master
            WHERE type IN ('table', 'view')
                AND name NOT LIKE 'sqlite_%'
            ORDER BY name
            "#,
        )
        .fetch_all(&mut *conn)
        .await?;

        rows.iter()
            .map(|row| row.try_get::<String, _>("name").map_err(DbError::from))
            .collect()
    }

    pub(super) async fn load_table_schema(&self, table: &str) -> DbResult<TableSchema> {
        let (schema, name) = match table.split_once('.') {
            Some((schema, name)) => (schema.to_string(), name.to_string()),
            None => ("main".to_string(), table.to_string()),
        };

        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or(DbError::NotConnected)?;

        let mut result = TableSchema::new(name.clone(), table.contains('.').then(|| schema.clone()));
        result.columns = Self::load_columns(conn, &schema, &name).await?;
        if result.columns.is_empty() {
            return Err(DbError::QueryFailed(format!("no such table: {table}")));
        }
        result.indexes = Self::load_indexes(conn, &schema, &name).await?;
        result.foreign_keys = Self::load_foreign_keys(conn, &schema, &name).await?;
        result.link_foreign_keys();
        Ok(result)
    }

    async fn load_columns(conn: &mut RawConnection, schema: &str, table: &str) -> DbResult<Vec<Column>> {
        let rows = sqlx::query(
            r#"SELECT name, type, "notnull", dflt_value, pk FROM pragma_table_info(?1, ?2) ORDER BY cid"#,
        )
        .bind(table)
        .bind(schema)
        .fetch_all(&mut *conn)
        .await?;

        let pk_count = rows
            .iter()
            .filter(|row| row.try_get::<i64, _>("pk").unwrap_or(0) > 0)
            .count();

        let mut columns = Vec::with_capacity(rows.len());
        for row in &rows {
            let name: String = row.try_get("name")?;
            let declared: String = row.try_get("type")?;
            let notnull: i64 = row.try_get("notnull")?;
            let pk: i64 = row.try_get("pk")?;
            let default_value: Option<String> = row.try_get_unchecked("dflt_value").ok().flatten();

            // A lone INTEGER PRIMARY KEY is an alias for the rowid.
            let rowid_alias = pk > 0 && pk_count == 1 && declared.eq_ignore_ascii_case("INTEGER");

            columns.push(
                Column::new(name, declared)
                    .with_nullable(notnull == 0 && pk == 0)
                    .with_primary_key(pk > 0)
                    .with_auto_increment(rowid_alias)
                    .with_default(default_value),
            );
        }
        Ok(columns)
    }

    async fn load_indexes(conn: &mut RawConnection, schema: &str, table: &str) -> DbResult<Vec<IndexInfo>> {
        let index_rows = sqlx::query(r#"SELECT name, "unique", origin FROM pragma_index_list(?1, ?2)"#)
            .bind(table)
            .bind(schema)
            .fetch_all(&mut *conn)
            .await?;

        let mut indexes = Vec::with_capacity(index_rows.len());
        for index_row in index_rows {
            let index_name: String = index_row.try_get("name")?;
            let unique: i64 = index_row.try_get("unique")?;
            let origin: String = index_row.try_get("origin")?;

            let col_rows = sqlx::query("SELECT name FROM pragma_index_info(?1, ?2) ORDER BY seqno")
                .bind(index_name.as_str())
                .bind(schema)
                .fetch_all(&mut *conn)
                .await?;
            let columns = col_rows
                .iter()
                .filter_map(|row| row.try_get_unchecked::<Option<String>, _>("name").ok().flatten())
                .collect();

            // SQLite uses B-trees for every index
            let mut index = IndexInfo::new(index_name, columns, "btree");
            if origin == "pk" {
                index = index.as_primary();
            } else if unique != 0 {
                index = index.as_unique();
            }
            indexes.push(index);
        }
        Ok(indexes)
    }

    async fn load_foreign_keys(
        conn: &mut RawConnection,
        schema: &str,
        table: &str,
    ) -> DbResult<Vec<ForeignKeyInfo>> {
        let rows = sqlx::query(
            r#"
            SELECT id, "table", "from", "to", on_update, on_delete
            FROM pragma_foreign_key_list(?1, ?2)
            ORDER BY id, seq
            "#,
        )
        .bind(table)
        .bind(schema)
        .fetch_all(&mut *conn)
        .await?;

        let mut foreign_keys: Vec<(i64, ForeignKeyInfo)> = Vec::new();
        for row in rows {
            let id: i64 = row.try_get("id")?;
            let ref_table: String = row.try_get("table")?;
            let from: String = row.try_get("from")?;
            // NULL when the reference targets the parent's primary key implicitly
            let to: Option<String> = row.try_get_unchecked("to").ok().flatten();
            let on_update: String = row.try_get("on_update")?;
            let on_delete: String = row.try_get("on_delete")?;

            match foreign_keys.last_mut() {
                Some((last_id, fk)) if *last_id == id => {
                    fk.columns.push(from);
                    fk.ref_columns.push(to.unwrap_or_default());
                }
                _ => foreign_keys.push((
                    id,
                    ForeignKeyInfo::new(format!("fk_{table}_{id}"), ref_table)
                        .with_pair(from, to.unwrap_or_default())
                        .with_actions(on_delete, on_update),
                )),
            }
        }
        Ok(foreign_keys.into_iter().map(|(_, fk)| fk).collect())
    }
}

#[cfg(test)]
mod tests {
    use crate::services::database::drivers::sqlite::SqliteConnection;
    use crate::services::database::error::DbError;
    use crate::services::database::traits::{ConnectionConfig, DataType, DatabaseConnection};

    fn seeded() -> SqliteConnection {
        let config = ConnectionConfig::parse("sqlite::memory:", None).unwrap();
        let conn = smol::block_on(SqliteConnection::connect(config)).unwrap();
        smol::block_on(async {
            conn.exec(
                "CREATE TABLE teams (id INTEGER PRIMARY KEY, name TEXT NOT NULL UNIQUE);
                 CREATE TABLE users (
                     id INTEGER PRIMARY KEY,
                     team_id INTEGER REFERENCES teams(id) ON DELETE CASCADE,
                     email VARCHAR(120) NOT NULL DEFAULT 'none',
                     score REAL
                 );
                 CREATE INDEX idx_users_email ON users(email);",
            )
            .await
            .unwrap();
        });
        conn
    }

    #[test]
    fn test_list_tables() {
        let conn = seeded();
        let tables = smol::block_on(conn.list_tables()).unwrap();
        assert_eq!(tables, vec!["teams".to_string(), "users".to_string()]);
    }

    #[test]
    fn test_table_schema() {
        let conn = seeded();
        let schema = smol::block_on(conn.get_table_schema("users")).unwrap();

        assert_eq!(schema.name, "users");
        assert_eq!(schema.primary_key_columns(), vec!["id"]);

        let id = schema.column("id").unwrap();
        assert!(id.auto_increment);
        assert!(!id.nullable);
        assert_eq!(id.data_type, DataType::Int);

        let email = schema.column("email").unwrap();
        assert!(!email.nullable);
        assert_eq!(email.default_value.as_deref(), Some("'none'"));
        assert_eq!(email.data_type, DataType::Text);

        let team = schema.column("team_id").unwrap();
        assert_eq!(team.foreign_key.as_deref(), Some("teams.id"));
        assert_eq!(schema.foreign_keys[0].on_delete, "CASCADE");

        assert!(schema.indexes.iter().any(|i| i.name == "idx_users_email" && !i.unique));
    }

    #[test]
    fn test_unique_index_detected() {
        let conn = seeded();
        let schema = smol::block_on(conn.get_table_schema("teams")).unwrap();
        assert!(schema.indexes.iter().any(|i| i.unique && i.columns == vec!["name".to_string()]));
    }

    #[test]
    fn test_missing_table() {
        let conn = seeded();
        let err = smol::block_on(conn.get_table_schema("nope")).unwrap_err();
        assert!(matches!(err, DbError::QueryFailed(_)));
    }
}
