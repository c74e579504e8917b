//! MySQL connection implementation.
//!
//! This module implements the `DatabaseConnection` trait for MySQL and MariaDB
//! over a single SQLx session. Both servers speak the same protocol, so one
//! implementation serves both and only the reported flavor differs.
//!
//! A lost session is dropped and, when `auto_reconnect` is set, re-opened on
//! the next operation. The server thread id is re-captured each time so that
//! `KILL QUERY` always targets the live session.

use async_lock::{Mutex, MutexGuard};
use async_trait::async_trait;
use futures::TryStreamExt;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection as RawConnection};
use sqlx::{ConnectOptions, Connection};
use std::sync::atomic::{AtomicU64, Ordering};

use super::types::{MySqlValueConverter, bind_value};
use crate::services::database::error::{DbError, DbResult};
use crate::services::database::sql::{self, KeyValue, Statement};
use crate::services::database::traits::connection::with_timeout;
use crate::services::database::traits::{
    BoxedConnection, CancelHandle, Column, ConnectionConfig, ConnectionParams, ConnectionState,
    ConnectionStatus, DatabaseConnection, DatabaseType, ResultSet, TableSchema, Transactional,
    Value,
};

/// MySQL or MariaDB database connection.
pub struct MySqlConnection {
    state: ConnectionState,
    flavor: DatabaseType,
    options: MySqlConnectOptions,
    thread_id: AtomicU64,
    conn: Mutex<Option<RawConnection>>,
}

impl std::fmt::Debug for MySqlConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MySqlConnection")
            .field("flavor", &self.flavor)
            .field("info", &self.state.config().info())
            .field("thread_id", &self.thread_id.load(Ordering::Relaxed))
            .field("status", &self.state.status())
            .finish()
    }
}

impl MySqlConnection {
    /// Open a session described by `config`.
    pub async fn connect(config: ConnectionConfig) -> DbResult<Self> {
        let options = Self::build_connect_options(&config)?;
        let (conn, thread_id) = Self::open_session(&options, &config).await?;

        tracing::info!(
            flavor = %config.database_type,
            host = ?config.params.hostname(),
            database = %config.params.database(),
            thread_id,
            "mysql session opened"
        );
        Ok(Self {
            flavor: config.database_type,
            state: ConnectionState::new(config),
            options,
            thread_id: AtomicU64::new(thread_id),
            conn: Mutex::new(Some(conn)),
        })
    }

    /// Open a session and box it (for factory use).
    pub async fn connect_boxed(config: ConnectionConfig) -> DbResult<BoxedConnection> {
        Ok(Box::new(Self::connect(config).await?))
    }

    /// Build MySqlConnectOptions from the configuration.
    fn build_connect_options(config: &ConnectionConfig) -> DbResult<MySqlConnectOptions> {
        match &config.params {
            ConnectionParams::Server {
                hostname,
                port,
                username,
                password,
                database,
                ssl_mode,
            } => {
                let mut options = MySqlConnectOptions::new()
                    .host(hostname)
                    .port(*port)
                    .username(username)
                    .database(database)
                    .charset("utf8mb4")
                    .ssl_mode(MySqlValueConverter::map_ssl_mode(*ssl_mode));
                if !password.is_empty() {
                    options = options.password(password.expose());
                }
                Ok(options)
            }
            ConnectionParams::File { .. } | ConnectionParams::InMemory => Err(DbError::InvalidParams(
                format!(
                    "{} does not support file-based or in-memory connections",
                    config.database_type
                ),
            )),
        }
    }

    async fn open_session(
        options: &MySqlConnectOptions,
        config: &ConnectionConfig,
    ) -> DbResult<(RawConnection, u64)> {
        let mut conn = with_timeout(config.connect_timeout, async {
            options.connect().await.map_err(DbError::from)
        })
        .await?;
        let thread_id: u64 = sqlx::query_scalar("SELECT CONNECTION_ID()")
            .fetch_one(&mut conn)
            .await?;
        Ok((conn, thread_id))
    }

    /// Lock the session, re-opening it first if it was lost and reconnecting is allowed.
    pub(super) async fn session(&self) -> DbResult<MutexGuard<'_, Option<RawConnection>>> {
        let mut guard = self.conn.lock().await;
        if guard.is_none()
            && self.state.status() == ConnectionStatus::Connected
            && self.state.config().auto_reconnect
        {
            let (conn, thread_id) = Self::open_session(&self.options, self.state.config()).await?;
            self.thread_id.store(thread_id, Ordering::SeqCst);
            *guard = Some(conn);
            tracing::info!(thread_id, "mysql session re-established");
        }
        Ok(guard)
    }

    /// Drop a session whose transport failed so the next operation can reconnect.
    pub(super) fn forget_if_lost<T>(&self, guard: &mut Option<RawConnection>, result: &DbResult<T>) {
        if let Err(err) = result {
            if err.is_connection_lost() && guard.take().is_some() {
                self.state.transaction().reset();
                tracing::warn!(error = %err, "mysql session lost");
            }
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
                result.columns = MySqlValueConverter::build_columns(&row);
            }
            if result.num_rows() < cap {
                result.push_row(MySqlValueConverter::convert_row(&row), cap);
            } else {
                result.total_rows += 1;
            }
        }
        Ok(result)
    }

    async fn execute_statement(&self, statement: Statement) -> DbResult<u64> {
        let mut guard = self.session().await?;
        let conn = guard.as_mut().ok_or(DbError::NotConnected)?;

        let mut query = sqlx::query(&statement.sql);
        for value in &statement.params {
            query = bind_value(query, value);
        }
        let result = query
            .execute(&mut *conn)
            .await
            .map(|done| done.rows_affected())
            .map_err(DbError::from);
        self.forget_if_lost(&mut guard, &result);
        result
    }

    /// Interrupt the statement running on server thread `thread_id`, from a fresh session.
    async fn kill_query(&self, thread_id: u64) -> DbResult<()> {
        let (mut side, _) = Self::open_session(&self.options, self.state.config()).await?;
        let kill = format!("KILL QUERY {thread_id}");
        sqlx::Executor::execute(&mut side, sqlx::raw_sql(&kill)).await?;
        side.close().await?;
        Ok(())
    }
}

#[async_trait]
impl DatabaseConnection for MySqlConnection {
    fn database_type(&self) -> DatabaseType {
        self.flavor
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
            tracing::info!(flavor = %self.flavor, "mysql session closed");
        }
        Ok(())
    }

    async fn ping(&self) -> bool {
        let Ok(mut guard) = self.session().await else {
            return false;
        };
        let result = match guard.as_mut() {
            Some(conn) => conn.ping().await.map_err(DbError::from),
            None => return false,
        };
        self.forget_if_lost(&mut guard, &result);
        result.is_ok()
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
        let result = async {
            self.state.check_cancelled()?;
            let mut guard = self.session().await?;
            let conn = guard.as_mut().ok_or(DbError::NotConnected)?;
            let result = Self::fetch_result(conn, sql, cap).await;
            self.forget_if_lost(&mut guard, &result);
            result
        }
        .await;
        self.state.record(result)
    }

    async fn exec(&self, sql: &str) -> DbResult<u64> {
        let result = async {
            self.state.check_cancelled()?;
            let mut guard = self.session().await?;
            let conn = guard.as_mut().ok_or(DbError::NotConnected)?;
            let result = Self::execute_raw(conn, sql).await;
            self.forget_if_lost(&mut guard, &result);
            result
        }
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

    async fn estimate_row_count(&self, table: &str) -> DbResult<i64> {
        let result = self.load_estimate(table).await;
        self.state.record(result)
    }

    fn prepare_cancel(&self) -> DbResult<CancelHandle> {
        let thread_id = self.thread_id.load(Ordering::SeqCst);
        Ok(self.state.arm_cancel(Some(thread_id)))
    }

    async fn cancel_query(&self, handle: &CancelHandle) -> DbResult<()> {
        handle.token().cancel();
        let Some(thread_id) = handle.server_session() else {
            return Ok(());
        };
        self.kill_query(thread_id).await?;
        tracing::warn!(thread_id, "mysql query killed");
        Ok(())
    }

    fn as_transactional(&self) -> Option<&dyn Transactional> {
        Some(self)
    }
}

impl Transactional for MySqlConnection {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_connect_options() {
        let config = ConnectionConfig::parse("mariadb://root:pw@db.local/shop", None).unwrap();
        let options = MySqlConnection::build_connect_options(&config).unwrap();
        assert_eq!(options.get_host(), "db.local");
        assert_eq!(options.get_port(), 3306);
        assert_eq!(options.get_username(), "root");
        assert_eq!(options.get_database(), Some("shop"));
        assert_eq!(options.get_charset(), "utf8mb4");
    }

    #[test]
    fn test_file_params_rejected() {
        let config = ConnectionConfig::parse("sqlite::memory:", None).unwrap();
        assert!(matches!(
            MySqlConnection::build_connect_options(&config),
            Err(DbError::InvalidParams(_))
        ));
    }

    #[test]
    fn test_unreachable_server_fails_to_connect() {
        let config =
            ConnectionConfig::parse("mysql://u:p@127.0.0.1:1/db?connect_timeout=2", None).unwrap();
        let err = smol::block_on(MySqlConnection::connect(config)).unwrap_err();
        assert!(matches!(err, DbError::ConnectionFailed(_)), "{err:?}");
    }
}
