//! Connection factory for creating database connections.
//!
//! Drivers register a constructor under their connection-string scheme once at
//! startup; after that the registry is only read.

use futures::FutureExt;
use futures::future::BoxFuture;
use std::collections::BTreeMap;
use std::sync::OnceLock;

use super::mysql::MySqlConnection;
use super::postgres::PostgresConnection;
use super::sqlite::SqliteConnection;
use crate::services::database::error::{DbError, DbResult};
use crate::services::database::traits::{BoxedConnection, ConnectionConfig};

/// Opens a session for a parsed configuration.
pub type ConnectFn = fn(ConnectionConfig) -> BoxFuture<'static, DbResult<BoxedConnection>>;

/// Registry of drivers keyed by scheme.
///
/// # Example
///
/// ```ignore
/// use dbmux::services::database::drivers::ConnectionFactory;
/// use dbmux::services::database::traits::ConnectionConfig;
///
/// let config = ConnectionConfig::parse("sqlite:///tmp/app.db", None)?;
/// let connection = ConnectionFactory::global().connect(config).await?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct ConnectionFactory {
    drivers: BTreeMap<&'static str, ConnectFn>,
}

impl ConnectionFactory {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every driver compiled into the crate.
    pub fn with_builtin_drivers() -> Self {
        let mut factory = Self::new();
        factory.register("sqlite", |config| SqliteConnection::connect_boxed(config).boxed());
        factory.register("postgres", |config| PostgresConnection::connect_boxed(config).boxed());
        factory.register("mysql", |config| MySqlConnection::connect_boxed(config).boxed());
        factory.register("mariadb", |config| MySqlConnection::connect_boxed(config).boxed());
        factory
    }

    /// The process-wide registry of built-in drivers.
    pub fn global() -> &'static ConnectionFactory {
        static GLOBAL: OnceLock<ConnectionFactory> = OnceLock::new();
        GLOBAL.get_or_init(Self::with_builtin_drivers)
    }

    /// Register (or replace) the constructor for `scheme`.
    pub fn register(&mut self, scheme: &'static str, connect: ConnectFn) {
        self.drivers.insert(scheme, connect);
    }

    /// Check if a scheme has a registered driver.
    pub fn is_supported(&self, scheme: &str) -> bool {
        self.drivers.contains_key(scheme)
    }

    /// Registered schemes, sorted.
    pub fn schemes(&self) -> Vec<&'static str> {
        self.drivers.keys().copied().collect()
    }

    /// Open a session with the driver registered for the configuration's scheme.
    ///
    /// # Errors
    ///
    /// `UnsupportedDriver` when no driver is registered, otherwise whatever the
    /// driver's connect reports.
    pub async fn connect(&self, config: ConnectionConfig) -> DbResult<BoxedConnection> {
        config.validate()?;
        let scheme = config.database_type.scheme();
        let connect = self
            .drivers
            .get(scheme)
            .ok_or_else(|| DbError::UnsupportedDriver(scheme.to_string()))?;
        tracing::debug!(scheme, "opening session");
        connect(config).await
    }
}
