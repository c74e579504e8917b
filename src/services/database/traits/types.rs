//! Database type definitions and connection configuration.
//!
//! This module contains:
//! - `DatabaseType` - Enum of supported database types
//! - `ConnectionConfig` - Parsed connection string plus session options
//! - `ConnectionParams` - Server, file or in-memory location of the database
//! - `SensitiveString` - Credential holder that never prints and is wiped on drop

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::services::database::error::{DbError, DbResult};
use crate::services::database::sql::Dialect;

/// Default timeout for establishing a session.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Supported database types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    PostgreSQL,
    MySQL,
    MariaDB,
    SQLite,
}

impl DatabaseType {
    /// Get the display name for this database type
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::PostgreSQL => "PostgreSQL",
            Self::MySQL => "MySQL",
            Self::MariaDB => "MariaDB",
            Self::SQLite => "SQLite",
        }
    }

    /// Get the default port for server-based databases
    pub fn default_port(&self) -> Option<u16> {
        match self {
            Self::PostgreSQL => Some(5432),
            Self::MySQL | Self::MariaDB => Some(3306),
            Self::SQLite => None,
        }
    }

    /// User assumed when the connection string names none
    pub fn default_user(&self) -> &'static str {
        match self {
            Self::PostgreSQL => "postgres",
            Self::MySQL | Self::MariaDB => "root",
            Self::SQLite => "",
        }
    }

    /// Database assumed when the connection string names none
    pub fn default_database(&self) -> &'static str {
        match self {
            Self::PostgreSQL => "postgres",
            Self::MySQL | Self::MariaDB => "mysql",
            Self::SQLite => "",
        }
    }

    /// Check if this database type is file-based
    pub fn is_file_based(&self) -> bool {
        matches!(self, Self::SQLite)
    }

    /// SQL dialect spoken by this backend
    pub fn dialect(&self) -> Dialect {
        match self {
            Self::PostgreSQL => Dialect::Postgres,
            Self::MySQL | Self::MariaDB => Dialect::MySql,
            Self::SQLite => Dialect::Sqlite,
        }
    }

    /// Parse from a connection-string scheme
    pub fn from_scheme(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "postgresql" | "postgres" => Some(Self::PostgreSQL),
            "mysql" => Some(Self::MySQL),
            "mariadb" => Some(Self::MariaDB),
            "sqlite" | "sqlite3" => Some(Self::SQLite),
            _ => None,
        }
    }

    /// Canonical scheme used in logs and listings
    pub fn scheme(&self) -> &'static str {
        match self {
            Self::PostgreSQL => "postgres",
            Self::MySQL => "mysql",
            Self::MariaDB => "mariadb",
            Self::SQLite => "sqlite",
        }
    }
}

impl fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// SSL mode options (generic across databases)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SslMode {
    /// No SSL connection
    Disable,
    /// Try SSL first, fall back to non-SSL
    #[default]
    Prefer,
    /// Require SSL, don't verify certificates
    Require,
    /// Require SSL and verify server certificate
    VerifyCa,
    /// Require SSL, verify certificate and hostname
    VerifyFull,
}

impl SslMode {
    /// Parse from a connection-string value
    pub fn from_db_str(s: &str) -> DbResult<Self> {
        match s {
            "disable" => Ok(Self::Disable),
            "prefer" => Ok(Self::Prefer),
            "require" => Ok(Self::Require),
            "verify-ca" => Ok(Self::VerifyCa),
            "verify-full" => Ok(Self::VerifyFull),
            other => Err(DbError::InvalidParams(format!("unknown sslmode: {other}"))),
        }
    }

    /// Convert to a connection-string value
    pub fn to_db_str(&self) -> &'static str {
        match self {
            Self::Disable => "disable",
            Self::Prefer => "prefer",
            Self::Require => "require",
            Self::VerifyCa => "verify-ca",
            Self::VerifyFull => "verify-full",
        }
    }
}

/// A secret that is never printed and is overwritten with zeros when dropped.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SensitiveString(String);

impl SensitiveString {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Borrow the secret. Callers must not log the result.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Drop for SensitiveString {
    fn drop(&mut self) {
        // SAFETY: zero bytes are valid UTF-8, so the string stays well formed.
        let bytes = unsafe { self.0.as_mut_vec() };
        for byte in bytes.iter_mut() {
            unsafe { std::ptr::write_volatile(byte, 0) };
        }
        std::sync::atomic::compiler_fence(std::sync::atomic::Ordering::SeqCst);
    }
}

impl fmt::Debug for SensitiveString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

impl fmt::Display for SensitiveString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

impl From<String> for SensitiveString {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl<'de> Deserialize<'de> for SensitiveString {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self)
    }
}

/// Where the database lives
#[derive(Debug, Clone)]
pub enum ConnectionParams {
    /// Server-based databases (PostgreSQL, MySQL, MariaDB)
    Server {
        /// Server hostname or IP address
        hostname: String,
        /// Server port
        port: u16,
        /// Username for authentication
        username: String,
        /// Password for authentication
        password: SensitiveString,
        /// Database to connect to
        database: String,
        /// SSL mode for the connection
        ssl_mode: SslMode,
    },

    /// File-based databases (SQLite)
    File {
        /// Path to the database file
        path: PathBuf,
        /// Open in read-only mode
        read_only: bool,
    },

    /// In-memory databases
    InMemory,
}

impl ConnectionParams {
    /// Get the hostname if this is a server connection
    pub fn hostname(&self) -> Option<&str> {
        match self {
            Self::Server { hostname, .. } => Some(hostname),
            _ => None,
        }
    }

    /// Get the port if this is a server connection
    pub fn port(&self) -> Option<u16> {
        match self {
            Self::Server { port, .. } => Some(*port),
            _ => None,
        }
    }

    /// Get the user if this is a server connection
    pub fn username(&self) -> Option<&str> {
        match self {
            Self::Server { username, .. } => Some(username),
            _ => None,
        }
    }

    /// Database name, file path or `:memory:`
    pub fn database(&self) -> String {
        match self {
            Self::Server { database, .. } => database.clone(),
            Self::File { path, .. } => path.display().to_string(),
            Self::InMemory => ":memory:".to_string(),
        }
    }

    /// Check if this is a read-only connection
    pub fn is_read_only(&self) -> bool {
        match self {
            Self::File { read_only, .. } => *read_only,
            _ => false,
        }
    }
}

/// Parsed connection string plus per-session options
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// The type of database
    pub database_type: DatabaseType,
    /// Location and credentials
    pub params: ConnectionParams,
    /// Upper bound on establishing the session
    pub connect_timeout: Duration,
    /// Re-open the session transparently after a lost transport (MySQL only, on by default)
    pub auto_reconnect: bool,
    /// Per-connection override of the result row cap
    pub max_result_rows: Option<usize>,
    /// Original connection string, retained for reconnection
    connection_string: SensitiveString,
}

impl ConnectionConfig {
    /// Parse a connection string.
    ///
    /// # Arguments
    /// * `connstr` - `scheme://[user[:password]@]host[:port]/database[?options]`,
    ///   `sqlite:///abs/path`, `sqlite://relative.db` or `sqlite::memory:`
    /// * `password` - Optional password that takes precedence over the one in the URI
    ///
    /// # Returns
    /// The parsed configuration, or `InvalidParams` / `UnsupportedDriver`
    pub fn parse(connstr: &str, password: Option<SensitiveString>) -> DbResult<Self> {
        let connstr = connstr.trim();
        let scheme = connstr
            .split_once(':')
            .map(|(scheme, _)| scheme)
            .filter(|scheme| !scheme.is_empty())
            .ok_or_else(|| DbError::InvalidParams("connection string has no scheme".into()))?;

        let database_type = DatabaseType::from_scheme(scheme)
            .ok_or_else(|| DbError::UnsupportedDriver(scheme.to_string()))?;

        let mut config = if database_type.is_file_based() {
            Self::parse_file(database_type, connstr)?
        } else {
            Self::parse_server(database_type, connstr, password)?
        };
        config.connection_string = SensitiveString::new(connstr);
        config.validate()?;
        Ok(config)
    }

    fn parse_file(database_type: DatabaseType, connstr: &str) -> DbResult<Self> {
        let rest = &connstr[connstr.find(':').map(|i| i + 1).unwrap_or(0)..];
        let rest = rest.strip_prefix("//").unwrap_or(rest);
        let (location, query) = match rest.split_once('?') {
            Some((location, query)) => (location, Some(query)),
            None => (rest, None),
        };

        let mut config = Self::new(database_type, ConnectionParams::InMemory);
        let mut read_only = false;
        for (key, value) in url::form_urlencoded::parse(query.unwrap_or("").as_bytes()) {
            match key.as_ref() {
                "mode" => read_only = value == "ro",
                _ => config.apply_option(&key, &value)?,
            }
        }

        config.params = match location {
            "" => return Err(DbError::InvalidParams("missing database file path".into())),
            ":memory:" => ConnectionParams::InMemory,
            path => ConnectionParams::File {
                path: PathBuf::from(percent_decode(path)),
                read_only,
            },
        };
        Ok(config)
    }

    fn parse_server(
        database_type: DatabaseType,
        connstr: &str,
        password: Option<SensitiveString>,
    ) -> DbResult<Self> {
        let url = url::Url::parse(connstr)
            .map_err(|e| DbError::InvalidParams(format!("invalid connection string: {e}")))?;

        let hostname = url
            .host_str()
            .filter(|h| !h.is_empty())
            .unwrap_or("localhost")
            .trim_matches(|c| c == '[' || c == ']')
            .to_string();
        let port = url
            .port()
            .or_else(|| database_type.default_port())
            .unwrap_or_default();
        let username = match url.username() {
            "" => database_type.default_user().to_string(),
            user => percent_decode(user),
        };
        let password = match password {
            Some(password) => password,
            None => SensitiveString::new(url.password().map(percent_decode).unwrap_or_default()),
        };
        let database = match url.path().trim_start_matches('/') {
            "" => database_type.default_database().to_string(),
            db => percent_decode(db),
        };

        let mut config = Self::new(database_type, ConnectionParams::InMemory);
        let mut ssl_mode = SslMode::default();
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "sslmode" | "ssl-mode" => ssl_mode = SslMode::from_db_str(&value.to_ascii_lowercase())?,
                _ => config.apply_option(&key, &value)?,
            }
        }

        config.params = ConnectionParams::Server {
            hostname,
            port,
            username,
            password,
            database,
            ssl_mode,
        };
        Ok(config)
    }

    fn new(database_type: DatabaseType, params: ConnectionParams) -> Self {
        Self {
            database_type,
            params,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            auto_reconnect: matches!(database_type, DatabaseType::MySQL | DatabaseType::MariaDB),
            max_result_rows: None,
            connection_string: SensitiveString::default(),
        }
    }

    fn apply_option(&mut self, key: &str, value: &str) -> DbResult<()> {
        let invalid = || DbError::InvalidParams(format!("invalid value for {key}: {value}"));
        match key {
            "connect_timeout" => {
                let secs: u64 = value.parse().map_err(|_| invalid())?;
                self.connect_timeout = Duration::from_secs(secs.max(1));
            }
            "auto_reconnect" => {
                self.auto_reconnect = match value {
                    "1" | "true" | "yes" | "on" => true,
                    "0" | "false" | "no" | "off" => false,
                    _ => return Err(invalid()),
                };
            }
            "max_rows" => {
                let rows: usize = value.parse().map_err(|_| invalid())?;
                self.max_result_rows = Some(rows.max(1));
            }
            other => tracing::debug!(option = other, "ignoring unknown connection option"),
        }
        Ok(())
    }

    /// Validate that the params match the database type
    pub fn validate(&self) -> DbResult<()> {
        match (&self.database_type, &self.params) {
            (DatabaseType::SQLite, ConnectionParams::Server { .. }) => Err(DbError::InvalidParams(
                format!(
                    "{} requires file or in-memory connection parameters",
                    self.database_type.display_name()
                ),
            )),
            (_, ConnectionParams::File { .. } | ConnectionParams::InMemory)
                if !self.database_type.is_file_based() =>
            {
                Err(DbError::InvalidParams(format!(
                    "{} requires server connection parameters",
                    self.database_type.display_name()
                )))
            }
            _ => Ok(()),
        }
    }

    /// Original connection string. Callers must not log the result.
    pub fn connection_string(&self) -> &SensitiveString {
        &self.connection_string
    }

    /// Display-only description, free of credentials
    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            driver: self.database_type,
            host: self.params.hostname().map(str::to_string),
            port: self.params.port(),
            user: self.params.username().map(str::to_string),
            database: self.params.database(),
        }
    }
}

/// Display-only connection details, free of credentials
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionInfo {
    pub driver: DatabaseType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    pub database: String,
}

/// Decode `%XX` escapes in a URI component. Malformed escapes are kept verbatim.
fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
            if let Some(byte) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
