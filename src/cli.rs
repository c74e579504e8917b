use clap::Parser;

use crate::config::{DEFAULT_PAGE_LIMIT, DEFAULT_PAGE_SIZE};
use crate::services::database::pool::DEFAULT_MAX_CONNECTIONS;
use crate::services::database::traits::row::MAX_RESULT_ROWS;

#[derive(Parser, Debug, Clone)]
#[command(name = "dbmux", version, about = "Database access daemon speaking JSON-RPC 2.0 over stdio")]
pub struct Args {
    /// Logging level (stderr). Also supports RUST_LOG.
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Maximum number of open connections.
    #[arg(long, default_value_t = DEFAULT_MAX_CONNECTIONS)]
    pub max_connections: usize,

    /// Rows kept per result set unless the connection string sets `max_rows`.
    #[arg(long, default_value_t = MAX_RESULT_ROWS)]
    pub max_result_rows: usize,

    /// Server-side cap on the page size of a `query` call.
    #[arg(long, default_value_t = DEFAULT_PAGE_LIMIT)]
    pub page_limit: u64,

    /// Page size of a `query` call that gives no limit.
    #[arg(long, default_value_t = DEFAULT_PAGE_SIZE)]
    pub default_page_size: u64,
}
