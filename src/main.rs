use std::process::ExitCode;

use clap::Parser;
use dotenv::dotenv;
use portal_indexer::utils::config::IndexerConfig;
use portal_indexer::utils::logging::{init_logging, log_startup};
use portal_indexer::{exit_code, exit_code_for_report, spawn_signal_handler, start_indexer, AppArgs};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> ExitCode {
    // Load environment variables before clap reads its env fallbacks
    dotenv().ok();
    init_logging();

    let args = AppArgs::parse();
    let config = match IndexerConfig::from_args(&args) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Invalid configuration");
            return ExitCode::from(exit_code(e.kind()));
        }
    };
    log_startup(&config);

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    match start_indexer(config, cancel).await {
        Ok(report) => {
            tracing::info!(
                batches = report.batches,
                rows = report.rows,
                retries = report.retries,
                next_block = report.next_block,
                "Indexer finished"
            );
            ExitCode::SUCCESS
        }
        Err(report) => {
            tracing::error!(error = ?report, "Indexer failed");
            ExitCode::from(exit_code_for_report(&report))
        }
    }
}
