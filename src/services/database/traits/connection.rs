//! Core database connection traits.
//!
//! This module defines the `DatabaseConnection` trait that all database drivers must implement,
//! the `Transactional` trait for drivers that support nested transactions, and the
//! cancellation primitives shared between a running query and whoever wants to stop it.

use async_trait::async_trait;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use super::row::{MAX_RESULT_ROWS, ResultSet, Value};
use super::schema::TableSchema;
use super::types::{ConnectionConfig, ConnectionInfo, DatabaseType};
use crate::services::database::error::{DbError, DbResult};
use crate::services::database::sql::{self, Dialect, KeyValue};
use crate::services::database::traits::row::Column;

/// Estimates at or above this many rows are trusted for counting; below it an
/// exact `COUNT(*)` is cheap enough.
pub const EXACT_COUNT_THRESHOLD: i64 = 100_000;

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connected,
    Closed,
}

/// Row count of a table and whether it came from planner statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RowCount {
    pub count: i64,
    pub approximate: bool,
}

/// One-shot cancellation signal.
///
/// Cloned tokens observe the same signal. Cancelling is idempotent.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: async_channel::Sender<()>,
    rx: async_channel::Receiver<()>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = async_channel::bounded(1);
        Self { tx, rx }
    }

    pub fn cancel(&self) {
        self.tx.close();
    }

    pub fn is_cancelled(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        // Nothing is ever sent, so recv only returns once the channel is closed.
        let _ = self.rx.recv().await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything needed to interrupt one in-flight query from another task.
///
/// Prepared before the query starts so that cancelling never has to touch the
/// (busy) session itself.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    token: CancelToken,
    server_session: Option<u64>,
}

impl CancelHandle {
    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    /// Server-side session identifier (backend pid, thread id), if the backend has one
    pub fn server_session(&self) -> Option<u64> {
        self.server_session
    }
}

/// Nesting depth of the open transaction, 0 when none is open
#[derive(Debug, Default)]
pub struct TransactionState {
    depth: AtomicU32,
}

impl TransactionState {
    pub fn depth(&self) -> u32 {
        self.depth.load(Ordering::SeqCst)
    }

    pub fn in_transaction(&self) -> bool {
        self.depth() > 0
    }

    fn enter(&self) -> u32 {
        self.depth.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn leave(&self) -> u32 {
        let prev = self
            .depth
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |d| Some(d.saturating_sub(1)))
            .unwrap_or_else(|d| d);
        prev.saturating_sub(1)
    }

    pub fn reset(&self) {
        self.depth.store(0, Ordering::SeqCst);
    }
}

/// Bookkeeping every driver carries next to its session.
#[derive(Debug)]
pub struct ConnectionState {
    config: ConnectionConfig,
    status: Mutex<ConnectionStatus>,
    last_error: Mutex<Option<String>>,
    transaction: TransactionState,
    cancel_token: Mutex<Option<CancelToken>>,
}

impl ConnectionState {
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            status: Mutex::new(ConnectionStatus::Connected),
            last_error: Mutex::new(None),
            transaction: TransactionState::default(),
            cancel_token: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_status(&self, status: ConnectionStatus) {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = status;
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Remember the message of a failed operation and pass the result through.
    pub fn record<T>(&self, result: DbResult<T>) -> DbResult<T> {
        if let Err(err) = &result {
            *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(err.to_string());
        }
        result
    }

    pub fn transaction(&self) -> &TransactionState {
        &self.transaction
    }

    /// Row cap for this session
    pub fn max_result_rows(&self) -> usize {
        self.config.max_result_rows.unwrap_or(MAX_RESULT_ROWS)
    }

    /// Install a fresh cancel token for the next query, replacing any stale one.
    pub fn arm_cancel(&self, server_session: Option<u64>) -> CancelHandle {
        let token = CancelToken::new();
        *self.cancel_token.lock().unwrap_or_else(PoisonError::into_inner) = Some(token.clone());
        CancelHandle {
            token,
            server_session,
        }
    }

    /// Drop the token armed for the last query
    pub fn disarm_cancel(&self) {
        self.cancel_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Token of the query currently armed for cancellation
    pub fn cancel_token(&self) -> Option<CancelToken> {
        self.cancel_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Fail fast when the armed query was cancelled before it reached the server.
    pub fn check_cancelled(&self) -> DbResult<()> {
        match self.cancel_token() {
            Some(token) if token.is_cancelled() => Err(DbError::QueryCancelled),
            _ => Ok(()),
        }
    }
}

/// Race `fut` against `token`, yielding `QueryCancelled` if the token fires first.
pub async fn interruptible<T, F>(token: Option<CancelToken>, fut: F) -> DbResult<T>
where
    F: Future<Output = DbResult<T>>,
{
    match token {
        Some(token) if token.is_cancelled() => Err(DbError::QueryCancelled),
        Some(token) => {
            smol::future::or(fut, async move {
                token.cancelled().await;
                Err(DbError::QueryCancelled)
            })
            .await
        }
        None => fut.await,
    }
}

/// Bound the time spent establishing a session.
pub async fn with_timeout<T, F>(timeout: Duration, fut: F) -> DbResult<T>
where
    F: Future<Output = DbResult<T>>,
{
    smol::future::or(fut, async move {
        smol::Timer::after(timeout).await;
        Err(DbError::ConnectionFailed(format!(
            "timed out after {}s",
            timeout.as_secs()
        )))
    })
    .await
}

/// Core trait for all database connections.
///
/// One implementation wraps one live session. Implementations serialize access
/// to the session internally, so every method takes `&self` and a connection
/// can be shared across tasks as a [`SharedConnection`].
///
/// # Example
///
/// ```ignore
/// use dbmux::services::database::traits::DatabaseConnection;
///
/// async fn example(conn: &dyn DatabaseConnection) -> DbResult<()> {
///     let result = conn.query("SELECT 1").await?;
///     assert_eq!(result.num_rows(), 1);
///     Ok(())
/// }
/// ```
#[async_trait]
pub trait DatabaseConnection: Send + Sync {
    /// Get the database type for this connection
    fn database_type(&self) -> DatabaseType;

    /// Shared bookkeeping for this session
    fn state(&self) -> &ConnectionState;

    /// SQL conventions of the backend
    fn dialect(&self) -> Dialect {
        self.database_type().dialect()
    }

    /// Display-only connection details
    fn info(&self) -> ConnectionInfo {
        let mut info = self.state().config().info();
        info.driver = self.database_type();
        info
    }

    fn status(&self) -> ConnectionStatus {
        self.state().status()
    }

    /// Message of the most recent failed operation
    fn last_error(&self) -> Option<String> {
        self.state().last_error()
    }

    /// Close the session. Closing an already closed session succeeds.
    async fn disconnect(&self) -> DbResult<()>;

    /// Check that the session is alive
    async fn ping(&self) -> bool;

    /// List tables (and views) visible to the session
    async fn list_tables(&self) -> DbResult<Vec<String>>;

    /// Describe the columns, indexes and foreign keys of a table.
    ///
    /// # Arguments
    ///
    /// * `table` - Table name, optionally qualified as `schema.table`
    async fn get_table_schema(&self, table: &str) -> DbResult<TableSchema>;

    /// Run a statement that returns rows.
    ///
    /// At most [`ConnectionState::max_result_rows`] rows are materialized; further rows
    /// are only counted into `total_rows`.
    async fn query(&self, sql: &str) -> DbResult<ResultSet>;

    /// Run a statement that does not return rows.
    ///
    /// # Returns
    ///
    /// The number of affected rows
    async fn exec(&self, sql: &str) -> DbResult<u64>;

    /// One page of a table.
    ///
    /// # Arguments
    ///
    /// * `table` - Table name
    /// * `offset` - Rows to skip
    /// * `limit` - Maximum rows to return
    /// * `order_by` - Column name, or a verbatim ORDER BY clause
    /// * `desc` - Descending order when `order_by` is a plain column
    ///
    /// # Returns
    ///
    /// The page, with `total_rows` set to the row count of the whole table
    async fn query_page(
        &self,
        table: &str,
        offset: u64,
        limit: u64,
        order_by: Option<&str>,
        desc: bool,
    ) -> DbResult<ResultSet> {
        let sql = sql::build_page_query(self.dialect(), table, offset, limit, order_by, desc);
        let mut result = self.query(&sql).await?;
        if result.columns.is_empty() {
            result.columns = self.get_table_schema(table).await?.columns;
        }
        result.total_rows = self.count_rows(table).await?.count;
        Ok(result)
    }

    /// Set one column of the row identified by `pk`
    async fn update_cell(
        &self,
        table: &str,
        column: &str,
        value: &Value,
        pk: &[KeyValue],
    ) -> DbResult<u64>;

    /// Insert a row; `columns` and `values` are positional
    async fn insert_row(&self, table: &str, columns: &[Column], values: &[Value]) -> DbResult<u64>;

    /// Delete the row identified by `pk`
    async fn delete_row(&self, table: &str, pk: &[KeyValue]) -> DbResult<u64>;

    /// Planner estimate of a table's row count, `-1` when none is available
    async fn estimate_row_count(&self, _table: &str) -> DbResult<i64> {
        Ok(-1)
    }

    /// Row count from statistics when large, otherwise an exact `COUNT(*)`
    async fn count_rows(&self, table: &str) -> DbResult<RowCount> {
        let estimate = self.estimate_row_count(table).await.unwrap_or(-1);
        if estimate >= EXACT_COUNT_THRESHOLD {
            return Ok(RowCount {
                count: estimate,
                approximate: true,
            });
        }

        let result = self
            .query(&sql::build_count_query(self.dialect(), table))
            .await?;
        let count = result
            .scalar()
            .and_then(Value::as_i64)
            .ok_or_else(|| DbError::Internal("COUNT(*) returned no value".into()))?;
        Ok(RowCount {
            count,
            approximate: false,
        })
    }

    /// Arm cancellation for the next query.
    ///
    /// Must not block: it runs while the caller holds the pool lock.
    fn prepare_cancel(&self) -> DbResult<CancelHandle> {
        Ok(self.state().arm_cancel(None))
    }

    /// Interrupt the query armed by `handle`.
    ///
    /// Returns once the request has been delivered, not once the query has stopped.
    async fn cancel_query(&self, handle: &CancelHandle) -> DbResult<()> {
        handle.token().cancel();
        Ok(())
    }

    /// Nested transaction support, when the backend has it
    fn as_transactional(&self) -> Option<&dyn Transactional> {
        None
    }
}

/// Nested transactions: the outermost level is a real transaction, inner
/// levels are savepoints named `sp_<depth>`.
#[async_trait]
pub trait Transactional: DatabaseConnection {
    /// Begin a transaction or a savepoint.
    ///
    /// # Returns
    ///
    /// The new nesting depth
    async fn begin_transaction(&self) -> DbResult<u32> {
        let depth = self.state().transaction().depth();
        self.exec(&sql::begin_statement(depth))
            .await
            .map_err(DbError::into_transaction_error)?;
        Ok(self.state().transaction().enter())
    }

    /// Commit the innermost level.
    ///
    /// # Returns
    ///
    /// The remaining nesting depth
    async fn commit(&self) -> DbResult<u32> {
        let depth = self.state().transaction().depth();
        if depth == 0 {
            return Err(DbError::TransactionFailed("no transaction in progress".into()));
        }
        self.exec(&sql::commit_statement(depth))
            .await
            .map_err(DbError::into_transaction_error)?;
        Ok(self.state().transaction().leave())
    }

    /// Roll back the innermost level.
    ///
    /// # Returns
    ///
    /// The remaining nesting depth
    async fn rollback(&self) -> DbResult<u32> {
        let depth = self.state().transaction().depth();
        if depth == 0 {
            return Err(DbError::TransactionFailed("no transaction in progress".into()));
        }
        self.exec(&sql::rollback_statement(depth))
            .await
            .map_err(DbError::into_transaction_error)?;
        Ok(self.state().transaction().leave())
    }
}

/// A boxed database connection trait object.
pub type BoxedConnection = Box<dyn DatabaseConnection>;

/// A database connection shared between the pool and running queries.
pub type SharedConnection = Arc<dyn DatabaseConnection>;
