//! Asynchronous query engine.
//!
//! A submitted query runs on a detached task; the submitter never waits on it.
//! The worker arms cancellation through the [`ConnectionPool`], runs the driver
//! call, releases the cancel handle whatever happened, and posts the finished
//! [`AsyncQuery`] to the [`AsyncQueue`]. Every submitted query completes
//! exactly once, including when the worker panics.
//!
//! # Example
//!
//! ```ignore
//! let engine = QueryEngine::new(pool);
//! let id = engine.submit(conn_id, QueryInput::Sql { sql: "SELECT 1".into() }, None);
//! let done = engine.queue().wait(Duration::from_secs(5)).await;
//! ```

mod query;
mod queue;

pub use query::{AsyncQuery, QueryId, QueryInput, QueryKind, QueryOutput, QueryStatus};
pub use queue::AsyncQueue;

use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use super::error::{DbError, DbResult};
use super::pool::{ConnId, ConnectionPool};
use super::sql;

/// Runs queries against pooled connections and collects their completions.
#[derive(Debug)]
pub struct QueryEngine {
    pool: Arc<ConnectionPool>,
    queue: Arc<AsyncQueue>,
    next_id: AtomicU64,
}

impl QueryEngine {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self {
            pool,
            queue: Arc::new(AsyncQueue::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn queue(&self) -> &Arc<AsyncQueue> {
        &self.queue
    }

    /// Whether a query submitted on `conn_id` has not completed yet
    pub fn is_busy(&self, conn_id: ConnId) -> bool {
        self.queue.is_running_on(conn_id)
    }

    /// Start `input` on `conn_id` and return immediately.
    ///
    /// The outcome arrives later on [`queue`](Self::queue), carrying `correlation`.
    pub fn submit(
        &self,
        conn_id: ConnId,
        input: QueryInput,
        correlation: Option<serde_json::Value>,
    ) -> QueryId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let query = AsyncQuery::new(id, conn_id, input, correlation);
        self.queue.register_running(&query);
        self.launch(query);
        id
    }

    /// Like [`submit`](Self::submit), but refuses while another query submitted
    /// on `conn_id` has not completed.
    pub fn try_submit(
        &self,
        conn_id: ConnId,
        input: QueryInput,
        correlation: Option<serde_json::Value>,
    ) -> DbResult<QueryId> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let query = AsyncQuery::new(id, conn_id, input, correlation);
        if !self.queue.register_exclusive(&query) {
            return Err(DbError::QueryFailed(format!(
                "a query is already running on connection {conn_id}"
            )));
        }
        self.launch(query);
        Ok(id)
    }

    fn launch(&self, mut query: AsyncQuery) {
        let id = query.id;
        let conn_id = query.conn_id;
        if let Err(e) = query.start() {
            Self::settle(&self.queue, query, Err(e));
            return;
        }

        tracing::debug!(query_id = id, conn_id, kind = ?query.kind(), "query started");
        let pool = Arc::clone(&self.pool);
        let queue = Arc::clone(&self.queue);
        smol::spawn(Self::work(pool, queue, query)).detach();
    }

    /// Ask the query running on `conn_id` to stop.
    ///
    /// Returns `false` when nothing is running there; an unknown connection is
    /// an `InvalidConnection` error.
    pub async fn cancel(&self, conn_id: ConnId) -> DbResult<bool> {
        self.pool.require(conn_id)?;
        // flag first: a worker that has not armed its handle yet sees the flag instead
        let flagged = self.queue.request_cancel(conn_id);
        let delivered = self.pool.cancel(conn_id).await?;
        if flagged || delivered {
            tracing::warn!(conn_id, delivered, "query cancellation requested");
        }
        Ok(flagged || delivered)
    }

    async fn work(pool: Arc<ConnectionPool>, queue: Arc<AsyncQueue>, query: AsyncQuery) {
        let conn_id = query.conn_id;

        let outcome = if query.is_cancel_requested() {
            Err(DbError::QueryCancelled)
        } else {
            match pool.prepare_cancel(conn_id) {
                Err(e) => Err(e),
                Ok(()) => {
                    let outcome = if query.is_cancel_requested() {
                        Err(DbError::QueryCancelled)
                    } else {
                        AssertUnwindSafe(Self::execute(&pool, conn_id, &query.input))
                            .catch_unwind()
                            .await
                            .unwrap_or_else(|panic| {
                                let message = panic_message(panic.as_ref());
                                tracing::warn!(query_id = query.id, conn_id, %message, "query worker panicked");
                                Err(DbError::Internal(format!("query worker panicked: {message}")))
                            })
                    };
                    pool.finish_query(conn_id);
                    outcome
                }
            }
        };

        Self::settle(&queue, query, outcome);
    }

    fn settle(queue: &AsyncQueue, mut query: AsyncQuery, outcome: DbResult<QueryOutput>) {
        if let Err(e) = query.complete(outcome) {
            tracing::error!(query_id = query.id, error = %e, "query completed twice");
        }
        tracing::debug!(query_id = query.id, status = ?query.status(), "query finished");
        queue.complete(query);
    }

    async fn execute(
        pool: &ConnectionPool,
        conn_id: ConnId,
        input: &QueryInput,
    ) -> DbResult<QueryOutput> {
        let conn = pool.require(conn_id)?;
        match input {
            QueryInput::Page {
                table,
                offset,
                limit,
                order_by,
                desc,
            } => conn
                .query_page(table, *offset, *limit, order_by.as_deref(), *desc)
                .await
                .map(QueryOutput::Rows),
            QueryInput::Sql { sql } if sql::is_query_statement(sql) => {
                conn.query(sql).await.map(QueryOutput::Rows)
            }
            QueryInput::Sql { sql } => conn.exec(sql).await.map(QueryOutput::Affected),
            QueryInput::Count { table } => conn.count_rows(table).await.map(QueryOutput::Count),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
