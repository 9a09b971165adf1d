//! Onlyboxes console binary.
//!
//! Usage:
//!     onlyboxes-console --hmac-key <key> --db-url sqlite:onlyboxes.db

use clap::Parser;
use onlyboxes_console::ConsoleArgs;
use onlyboxes_logging::{init_logging, LogConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = ConsoleArgs::parse();
    init_logging(LogConfig {
        verbose: args.verbose,
        log_file: args.log_file.clone(),
    })?;

    tracing::info!("Starting Onlyboxes console");
    tracing::info!("  HTTP: {}", args.http_addr);
    tracing::info!("  gRPC: {}", args.grpc_addr);
    tracing::info!("  Database: {}", args.db_url);

    onlyboxes_console::run(args.into_config()).await
}
