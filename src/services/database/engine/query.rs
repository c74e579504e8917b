//! One asynchronous query and its lifecycle.

use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::services::database::error::{DbError, DbResult};
use crate::services::database::pool::ConnId;
use crate::services::database::traits::{ResultSet, RowCount};

/// Engine-wide query identifier
pub type QueryId = u64;

/// What a query does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryKind {
    /// A page of a table
    Query,
    /// Caller-supplied SQL, routed to `query` or `exec` by its leading keyword
    RawExec,
    /// Row count of a table
    Count,
}

/// Lifecycle: `Pending -> Running -> {Completed, Cancelled, Error}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryStatus {
    Pending,
    Running,
    Completed,
    Cancelled,
    Error,
}

impl QueryStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Error)
    }

    fn can_become(self, next: QueryStatus) -> bool {
        match (self, next) {
            (Self::Pending, Self::Running) => true,
            // a worker that never started still completes exactly once
            (Self::Pending | Self::Running, next) => next.is_terminal(),
            _ => false,
        }
    }
}

/// Parameters of a query, one variant per [`QueryKind`]
#[derive(Debug, Clone, PartialEq)]
pub enum QueryInput {
    Page {
        table: String,
        offset: u64,
        limit: u64,
        order_by: Option<String>,
        desc: bool,
    },
    Sql {
        sql: String,
    },
    Count {
        table: String,
    },
}

impl QueryInput {
    pub fn kind(&self) -> QueryKind {
        match self {
            Self::Page { .. } => QueryKind::Query,
            Self::Sql { .. } => QueryKind::RawExec,
            Self::Count { .. } => QueryKind::Count,
        }
    }
}

/// Successful outcome of a query
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutput {
    Rows(ResultSet),
    Affected(u64),
    Count(RowCount),
}

/// A query handed to the engine, tracked from submission to completion.
#[derive(Debug)]
pub struct AsyncQuery {
    pub id: QueryId,
    pub conn_id: ConnId,
    pub input: QueryInput,
    /// Opaque caller data returned untouched with the completion (e.g. a request id)
    pub correlation: Option<serde_json::Value>,
    status: QueryStatus,
    output: Option<DbResult<QueryOutput>>,
    cancel_requested: Arc<AtomicBool>,
}

impl AsyncQuery {
    pub fn new(
        id: QueryId,
        conn_id: ConnId,
        input: QueryInput,
        correlation: Option<serde_json::Value>,
    ) -> Self {
        Self {
            id,
            conn_id,
            input,
            correlation,
            status: QueryStatus::Pending,
            output: None,
            cancel_requested: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn kind(&self) -> QueryKind {
        self.input.kind()
    }

    pub fn status(&self) -> QueryStatus {
        self.status
    }

    /// Outcome; `None` until completion, and always `None` for a cancelled query.
    pub fn output(&self) -> Option<&DbResult<QueryOutput>> {
        self.output.as_ref()
    }

    /// Move the outcome out, leaving the status untouched.
    pub fn take_output(&mut self) -> Option<DbResult<QueryOutput>> {
        self.output.take()
    }

    /// Flag shared with whoever may cancel this query
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel_requested)
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    pub fn request_cancel(&self) {
        self.cancel_requested.store(true, Ordering::SeqCst);
    }

    pub(crate) fn start(&mut self) -> DbResult<()> {
        self.transition(QueryStatus::Running)
    }

    /// Record the outcome. A cancel request wins over whatever the backend returned,
    /// and the discarded result is dropped here.
    pub(crate) fn complete(&mut self, outcome: DbResult<QueryOutput>) -> DbResult<()> {
        if self.is_cancel_requested() {
            self.transition(QueryStatus::Cancelled)?;
            self.output = None;
            return Ok(());
        }
        let status = match &outcome {
            Ok(_) => QueryStatus::Completed,
            Err(DbError::QueryCancelled) => QueryStatus::Cancelled,
            Err(_) => QueryStatus::Error,
        };
        self.transition(status)?;
        self.output = match status {
            QueryStatus::Cancelled => None,
            _ => Some(outcome),
        };
        Ok(())
    }

    fn transition(&mut self, next: QueryStatus) -> DbResult<()> {
        if !self.status.can_become(next) {
            return Err(DbError::Internal(format!(
                "query {} cannot go from {:?} to {next:?}",
                self.id, self.status
            )));
        }
        self.status = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::database::traits::Column;

    fn page() -> AsyncQuery {
        AsyncQuery::new(
            1,
            1,
            QueryInput::Page {
                table: "users".into(),
                offset: 0,
                limit: 10,
                order_by: None,
                desc: false,
            },
            None,
        )
    }

    #[test]
    fn test_happy_path() {
        let mut q = page();
        assert_eq!(q.kind(), QueryKind::Query);
        assert_eq!(q.status(), QueryStatus::Pending);
        q.start().unwrap();
        assert_eq!(q.status(), QueryStatus::Running);

        let rows = ResultSet::new(vec![Column::new("id", "INTEGER")]);
        q.complete(Ok(QueryOutput::Rows(rows))).unwrap();
        assert_eq!(q.status(), QueryStatus::Completed);
        assert!(matches!(q.output(), Some(Ok(QueryOutput::Rows(_)))));
    }

    #[test]
    fn test_terminal_state_is_final() {
        let mut q = page();
        q.start().unwrap();
        q.complete(Err(DbError::SyntaxError("x".into()))).unwrap();
        assert_eq!(q.status(), QueryStatus::Error);

        assert!(q.complete(Ok(QueryOutput::Affected(1))).is_err());
        assert!(q.start().is_err());
        assert_eq!(q.status(), QueryStatus::Error);
    }

    #[test]
    fn test_cancel_wins_over_success() {
        let mut q = page();
        q.start().unwrap();
        q.request_cancel();
        q.complete(Ok(QueryOutput::Affected(3))).unwrap();
        assert_eq!(q.status(), QueryStatus::Cancelled);
        assert!(q.output().is_none());
    }

    #[test]
    fn test_cancel_wins_over_error() {
        let mut q = page();
        q.start().unwrap();
        q.cancel_flag().store(true, Ordering::SeqCst);
        q.complete(Err(DbError::QueryFailed("boom".into()))).unwrap();
        assert_eq!(q.status(), QueryStatus::Cancelled);
        assert!(q.output().is_none());
    }

    #[test]
    fn test_backend_cancel_maps_to_cancelled() {
        let mut q = AsyncQuery::new(2, 1, QueryInput::Sql { sql: "SELECT 1".into() }, None);
        assert_eq!(q.kind(), QueryKind::RawExec);
        q.start().unwrap();
        q.complete(Err(DbError::QueryCancelled)).unwrap();
        assert_eq!(q.status(), QueryStatus::Cancelled);
        assert!(q.output().is_none());
    }

    #[test]
    fn test_pending_can_fail_directly() {
        let mut q = AsyncQuery::new(3, 1, QueryInput::Count { table: "t".into() }, None);
        q.complete(Err(DbError::Internal("spawn".into()))).unwrap();
        assert_eq!(q.status(), QueryStatus::Error);
    }
}
