use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;

use dbmux::cli::Args;
use dbmux::config::DaemonConfig;
use dbmux::logging;
use dbmux::rpc::{self, RpcHandler};

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logging::init(&args.log_level);

    let config = DaemonConfig::from(&args);
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        max_connections = config.max_connections,
        page_limit = config.page_limit,
        "dbmux starting"
    );

    let handler = Arc::new(RpcHandler::new(config));
    smol::block_on(rpc::serve_stdio(handler)).context("stdio transport failed")?;

    tracing::info!("dbmux stopped");
    Ok(())
}
