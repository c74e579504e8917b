//! Daemon-wide limits.

use crate::cli::Args;
use crate::services::database::pool::DEFAULT_MAX_CONNECTIONS;
use crate::services::database::traits::row::MAX_RESULT_ROWS;

/// Server-side cap on the page size of a `query` call.
pub const DEFAULT_PAGE_LIMIT: u64 = 10_000;

/// Page size of a `query` call that gives no `limit`.
pub const DEFAULT_PAGE_SIZE: u64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DaemonConfig {
    /// Slots in the connection pool
    pub max_connections: usize,
    /// Row cap for sessions that do not set `max_rows` themselves
    pub max_result_rows: usize,
    /// Upper bound applied to every requested page size
    pub page_limit: u64,
    pub default_page_size: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_result_rows: MAX_RESULT_ROWS,
            page_limit: DEFAULT_PAGE_LIMIT,
            default_page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl DaemonConfig {
    /// Page size to use for a request asking for `requested` rows.
    pub fn page_size(&self, requested: Option<u64>) -> u64 {
        requested
            .unwrap_or(self.default_page_size)
            .min(self.page_limit)
    }
}

impl From<&Args> for DaemonConfig {
    fn from(args: &Args) -> Self {
        Self {
            max_connections: args.max_connections.max(1),
            max_result_rows: args.max_result_rows.max(1),
            page_limit: args.page_limit.max(1),
            default_page_size: args.default_page_size.max(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_page_size_is_capped() {
        let config = DaemonConfig::default();
        assert_eq!(config.page_size(None), 500);
        assert_eq!(config.page_size(Some(2)), 2);
        assert_eq!(config.page_size(Some(1_000_000)), 10_000);
    }

    #[test]
    fn test_from_args() {
        let args = Args::parse_from(["dbmux", "--max-connections", "8", "--page-limit", "50"]);
        let config = DaemonConfig::from(&args);
        assert_eq!(config.max_connections, 8);
        assert_eq!(config.page_limit, 50);
        assert_eq!(config.max_result_rows, MAX_RESULT_ROWS);
        assert_eq!(config.page_size(None), 50);
    }
}
