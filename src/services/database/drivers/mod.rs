//! Database driver implementations.
//!
//! This module contains driver implementations for different database types:
//!
//! - **PostgreSQL**: PostgreSQL support via SQLx
//! - **MySQL**: MySQL/MariaDB support via SQLx
//! - **SQLite**: Embedded SQLite support via SQLx
//!
//! Each driver implements the `DatabaseConnection` and `Transactional` traits.

mod factory;

pub mod mysql;
pub mod postgres;
pub mod sqlite;

pub use factory::{ConnectFn, ConnectionFactory};
