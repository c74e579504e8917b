//! Error taxonomy shared by the drivers, the connection pool and the query engine.
//!
//! Every failure carries a stable numeric code (see [`DbError::code`]) so that the
//! JSON-RPC layer can surface it without string matching.

use sqlx::error::ErrorKind;
use thiserror::Error;

use super::pool::ConnId;

/// Errors produced by the database layer.
#[derive(Debug, Clone, Error)]
pub enum DbError {
    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("not connected")]
    NotConnected,

    #[error("invalid connection id: {0}")]
    InvalidConnection(ConnId),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("unsupported driver: {0}")]
    UnsupportedDriver(String),

    #[error("query failed: {0}")]
    QueryFailed(String),

    #[error("syntax error: {0}")]
    SyntaxError(String),

    #[error("query cancelled")]
    QueryCancelled,

    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    #[error("transaction failed: {0}")]
    TransactionFailed(String),

    #[error("deadlock detected: {0}")]
    Deadlock(String),

    #[error("transactions are not supported by this driver")]
    TransactionsUnsupported,

    #[error("too many connections (limit {0})")]
    TooManyConnections(usize),

    #[error("result too large: {0}")]
    ResultTooLarge(String),

    #[error("out of memory")]
    OutOfMemory,

    #[error("internal error: {0}")]
    Internal(String),
}

/// Result alias used throughout the database layer.
pub type DbResult<T> = Result<T, DbError>;

impl DbError {
    /// Stable JSON-RPC error code for this error.
    pub fn code(&self) -> i32 {
        match self {
            // connection family
            DbError::ConnectionFailed(_) => -32000,
            DbError::AuthFailed(_) => -32001,
            DbError::NotConnected => -32002,
            DbError::InvalidConnection(_) => -32003,
            DbError::UnsupportedDriver(_) => -32004,
            // query family
            DbError::QueryFailed(_) => -32010,
            DbError::SyntaxError(_) => -32011,
            DbError::QueryCancelled => -32012,
            // data family
            DbError::ConstraintViolation(_) => -32020,
            DbError::TypeMismatch(_) => -32021,
            // transaction family
            DbError::TransactionFailed(_) => -32030,
            DbError::Deadlock(_) => -32031,
            DbError::TransactionsUnsupported => -32032,
            // resource family
            DbError::TooManyConnections(_) => -32050,
            DbError::ResultTooLarge(_) => -32051,
            DbError::OutOfMemory => -32052,
            // client / internal
            DbError::InvalidParams(_) => -32602,
            DbError::Internal(_) => -32603,
        }
    }

    /// Whether the underlying transport is gone and the session needs a reconnect.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, DbError::ConnectionFailed(_) | DbError::NotConnected)
    }

    /// Re-tag a statement failure that happened while managing a transaction.
    pub fn into_transaction_error(self) -> Self {
        match self {
            DbError::QueryFailed(msg) | DbError::SyntaxError(msg) => {
                DbError::TransactionFailed(msg)
            }
            other => other,
        }
    }
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db_err) => {
                let message = db_err.message().to_string();
                let code = db_err.code().map(|c| c.into_owned()).unwrap_or_default();

                match db_err.kind() {
                    ErrorKind::UniqueViolation
                    | ErrorKind::ForeignKeyViolation
                    | ErrorKind::NotNullViolation
                    | ErrorKind::CheckViolation => {
                        return DbError::ConstraintViolation(message);
                    }
                    _ => {}
                }

                classify_database_code(&code, message)
            }
            sqlx::Error::Io(e) => DbError::ConnectionFailed(e.to_string()),
            sqlx::Error::Tls(e) => DbError::ConnectionFailed(e.to_string()),
            sqlx::Error::PoolTimedOut => DbError::ConnectionFailed("pool timed out".into()),
            sqlx::Error::PoolClosed => DbError::NotConnected,
            sqlx::Error::WorkerCrashed => DbError::ConnectionFailed("driver worker crashed".into()),
            sqlx::Error::Configuration(e) => DbError::InvalidParams(e.to_string()),
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::TypeMismatch(format!("column {index}: {source}"))
            }
            sqlx::Error::Decode(e) => DbError::TypeMismatch(e.to_string()),
            other => DbError::QueryFailed(other.to_string()),
        }
    }
}

/// Map a backend error code to an error kind.
///
/// Postgres and MySQL report a five character SQLSTATE; SQLite reports its
/// numeric (extended) result code.
fn classify_database_code(code: &str, message: String) -> DbError {
    match code {
        // SQLSTATE classes
        "42601" | "42000" => DbError::SyntaxError(message),
        "57014" | "70100" => DbError::QueryCancelled,
        "40P01" | "40001" => DbError::Deadlock(message),
        c if c.len() == 5 && c.starts_with("28") => DbError::AuthFailed(message),
        c if c.len() == 5 && c.starts_with("23") => DbError::ConstraintViolation(message),
        c if c.len() == 5 && c.starts_with("22") => DbError::TypeMismatch(message),
        c if c.len() == 5 && c.starts_with("08") => DbError::ConnectionFailed(message),
        // SQLite primary result codes (extended codes keep the primary in the low byte)
        c => match c.parse::<i32>().map(|n| n & 0xff) {
            Ok(9) => DbError::QueryCancelled,
            Ok(19) => DbError::ConstraintViolation(message),
            Ok(20) => DbError::TypeMismatch(message),
            Ok(23) => DbError::AuthFailed(message),
            Ok(1) if message.contains("syntax error") => DbError::SyntaxError(message),
            _ => DbError::QueryFailed(message),
        },
    }
}
