//! dbmux: a database-access daemon.
//!
//! Multiplexes SQLite, PostgreSQL and MySQL/MariaDB sessions behind one
//! cancellable, asynchronous query interface, served as JSON-RPC 2.0 over stdio.

pub mod cli;
pub mod config;
pub mod logging;
pub mod rpc;
pub mod services;
