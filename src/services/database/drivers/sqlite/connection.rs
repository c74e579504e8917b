//! SQLite connection implementation.
//!
//! This module implements the `DatabaseConnection` trait for SQLite over a
//! single SQLx session. SQLite has no server to send a cancel request to, so
//! cancellation races the running statement against the armed cancel token.

use async_lock::Mutex;
use async_trait::async_trait;
use futures::TryStreamExt;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection as RawConnection};
use sqlx::{ConnectOptions, Connection};
use std::str::FromStr;

use super::types::{SqliteValueConverter, bind_value};
use crate::services::database::error::{DbError, DbResult};
use crate::services::database::sql::{self, KeyValue, Statement};
use crate::services::database::traits::connection::{interruptible, with_timeout};
use crate::services::database::traits::{
    BoxedConnection, Column, ConnectionConfig, ConnectionParams, ConnectionState,
    ConnectionStatus, DatabaseConnection, DatabaseType, ResultSet, TableSchema, Transactional,
    Value,
};

/// SQLite database connection.
///
/// SQLite supports both file-based and in-memory databases.
pub struct SqliteConnection {
    state: ConnectionState,
    pub(super) conn: Mutex<Option<RawConnection>>,
}

impl std::fmt::Debug for SqliteConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteConnection")
            .field("database", &self.state.config().params.database())
            .field("status", &self.state.status())
            .finish()
    }
}

impl SqliteConnection {
    /// Open a session described by `config`.
    pub async fn connect(config: ConnectionConfig) -> DbResult<Self> {
        let options = Self::build_connect_options(&config)?;
        let conn = with_timeout(config.connect_timeout, async {
            options.connect().await.map_err(DbError::from)
        })
        .await?;

        tracing::info!(database = %config.params.database(), "sqlite session opened");
        Ok(Self {
            state: ConnectionState::new(config),
            conn: Mutex::new(Some(conn)),
        })
    }

    /// Open a session and box it (for factory use).
    pub async fn connect_boxed(config: ConnectionConfig) -> DbResult<BoxedConnection> {
        Ok(Box::new(Self::connect(config).await?))
    }

    /// Build SqliteConnectOptions from the configuration.
    fn build_connect_options(config: &ConnectionConfig) -> DbResult<SqliteConnectOptions> {
        match &config.params {
            ConnectionParams::File { path, read_only } => Ok(SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(!read_only)
                .read_only(*read_only)
                .foreign_keys(true)),
            ConnectionParams::InMemory => Ok(SqliteConnectOptions::from_str(":memory:")?
                .foreign_keys(true)),
            ConnectionParams::Server { .. } => Err(DbError::InvalidParams(
                "SQLite does not support server-based connections".into(),
            )),
        }
    }

    async fn execute_raw(conn: &mut RawConnection, sql: &str) -> DbResult<u64> {
        let done = sqlx::Executor::execute(&mut *conn, sqlx::raw_sql(sql)).await?;
        Ok(done.rows_affected())
    }

    async fn fetch_result(conn: &mut RawConnection, sql: &str, cap: usize) -> DbResult<ResultSet> {
        let mut result = ResultSet::new(Vec::new());
        let mut stream = sqlx::raw_sql(sql).fetch(&mut *conn);
        while let Some(row) = stream.try_next().await? {
            if result.columns.is_empty() {
                result.columns = SqliteValueConverter::build_columns(&row);
            }
            if result.num_rows() < cap {
                result.push_row(SqliteValueConverter::convert_row(&row), cap);
            } else {
                result.total_rows += 1;
            }
        }
        Ok(result)
    }

    async fn execute_statement(&self, statement: Statement) -> DbResult<u64> {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or(DbError::NotConnected)?;

        let mut query = sqlx::query(&statement.sql);
        for value in &statement.params {
            query = bind_value(query, value);
        }
        let done = query.execute(&mut *conn).await?;
        Ok(done.rows_affected())
    }
}

#[async_trait]
impl DatabaseConnection for SqliteConnection {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::SQLite
    }

    fn state(&self) -> &ConnectionState {
        &self.state
    }

    async fn disconnect(&self) -> DbResult<()> {
        let conn = self.conn.lock().await.take();
        self.state.set_status(ConnectionStatus::Closed);
        self.state.transaction().reset();
        if let Some(conn) = conn {
            conn.close().await?;
            tracing::info!("sqlite session closed");
        }
        Ok(())
    }

    async fn ping(&self) -> bool {
        let mut guard = self.conn.lock().await;
        match guard.as_mut() {
            Some(conn) => conn.ping().await.is_ok(),
            None => false,
        }
    }

    async fn list_tables(&self) -> DbResult<Vec<String>> {
        let result = self.load_tables().await;
        self.state.record(result)
    }

    async fn get_table_schema(&self, table: &str) -> DbResult<TableSchema> {
        let result = self.load_table_schema(table).await;
        self.state.record(result)
    }

    async fn query(&self, sql: &str) -> DbResult<ResultSet> {
        let cap = self.state.max_result_rows();
        let result = interruptible(self.state.cancel_token(), async {
            let mut guard = self.conn.lock().await;
            let conn = guard.as_mut().ok_or(DbError::NotConnected)?;
            Self::fetch_result(conn, sql, cap).await
        })
        .await;
        self.state.record(result)
    }

    async fn exec(&self, sql: &str) -> DbResult<u64> {
        let result = interruptible(self.state.cancel_token(), async {
            let mut guard = self.conn.lock().await;
            let conn = guard.as_mut().ok_or(DbError::NotConnected)?;
            Self::execute_raw(conn, sql).await
        })
        .await;
        self.state.record(result)
    }

    async fn update_cell(
        &self,
        table: &str,
        column: &str,
        value: &Value,
        pk: &[KeyValue],
    ) -> DbResult<u64> {
        let dialect = self.dialect();
        let placeholder = move |n: usize, _: &str| dialect.placeholder(n);
        let statement = sql::build_update(dialect, table, column, value, pk, &placeholder);
        let result = match statement {
            Ok(statement) => self.execute_statement(statement).await,
            Err(e) => Err(e),
        };
        self.state.record(result)
    }

    async fn insert_row(&self, table: &str, columns: &[Column], values: &[Value]) -> DbResult<u64> {
        let dialect = self.dialect();
        let placeholder = move |n: usize, _: &str| dialect.placeholder(n);
        let statement = sql::build_insert(dialect, table, columns, values, &placeholder);
        let result = match statement {
            Ok(statement) => self.execute_statement(statement).await,
            Err(e) => Err(e),
        };
        self.state.record(result)
    }

    async fn delete_row(&self, table: &str, pk: &[KeyValue]) -> DbResult<u64> {
        let dialect = self.dialect();
        let placeholder = move |n: usize, _: &str| dialect.placeholder(n);
        let statement = sql::build_delete(dialect, table, pk, &placeholder);
        let result = match statement {
            Ok(statement) => self.execute_statement(statement).await,
            Err(e) => Err(e),
        };
        self.state.record(result)
    }

    fn as_transactional(&self) -> Option<&dyn Transactional> {
        Some(self)
    }
}

impl Transactional for SqliteConnection {}
