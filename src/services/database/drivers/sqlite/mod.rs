//! SQLite database driver implementation.
//!
//! This module provides a SQLite driver that implements the `DatabaseConnection`
//! and `Transactional` traits using SQLx.
//!
//! SQLite is a file-based embedded database that supports:
//! - File-based databases (`sqlite:///abs/path.db`, `sqlite://relative.db`)
//! - In-memory databases (`sqlite::memory:`)
//! - Read-only mode (`?mode=ro`)
//!
//! # Example
//!
//! ```ignore
//! use dbmux::services::database::drivers::sqlite::SqliteConnection;
//! use dbmux::services::database::traits::ConnectionConfig;
//!
//! let config = ConnectionConfig::parse("sqlite:///path/to/database.db", None)?;
//! let conn = SqliteConnection::connect(config).await?;
//! ```

mod connection;
mod schema;
mod types;

pub use connection::SqliteConnection;
