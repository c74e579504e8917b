//! Database abstraction traits and types.
//!
//! This module provides a unified interface for interacting with different database types.
//! It defines:
//!
//! - **Types** (`types`): Database type enum, connection configuration, SSL modes
//! - **Row/Value** (`row`): Database-agnostic value representation and result sets
//! - **Connection** (`connection`): Core connection trait, cancellation and transactions
//! - **Schema** (`schema`): Table, index and foreign key metadata
//!
//! # Example
//!
//! ```ignore
//! use dbmux::services::database::traits::ConnectionConfig;
//!
//! let config = ConnectionConfig::parse("postgres://user@localhost/mydb", None)?;
//! assert_eq!(config.params.port(), Some(5432));
//! ```

pub mod connection;
pub mod row;
pub mod schema;
pub mod types;

// Re-export commonly used types
pub use connection::{
    BoxedConnection, CancelHandle, CancelToken, ConnectionState, ConnectionStatus,
    DatabaseConnection, RowCount, SharedConnection, Transactional,
};

pub use row::{Column, DataType, ResultSet, Row, Value};

pub use schema::{ForeignKeyInfo, IndexInfo, TableSchema};

pub use types::{
    ConnectionConfig, ConnectionInfo, ConnectionParams, DatabaseType, SensitiveString, SslMode,
};
