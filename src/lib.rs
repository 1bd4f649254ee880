pub mod models;
pub mod repositories;
pub mod services;
pub mod utils;

use std::sync::Arc;

use clap::Parser;
use clickhouse::Row;
use eyre::{Result, WrapErr};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use repositories::checkpoints::{CheckpointStore, ClickhouseCheckpointStore, PgCheckpointStore};
use repositories::sink::ClickhouseSink;
use services::cursor::BlockRangeCursor;
use services::ingestion::{IngestionLoop, IngestionReport};
use services::pipes::{BlocksPipe, InstructionsPipe, Pipe};
use services::portal::HttpPortalClient;
use utils::config::{CheckpointBackend, IndexerConfig, PipeKind, DEFAULT_CLICKHOUSE_URL, DEFAULT_PORTAL_URL};
use utils::error::{ErrorKind, IndexerError};
use utils::retry::RetryPolicy;

#[derive(Parser, Debug, Clone)]
#[clap(author, version, about = "Portal Indexer - Solana block ingestion into ClickHouse")]
pub struct AppArgs {
    /// Portal dataset URL
    #[clap(long, env = "PORTAL_URL", default_value = DEFAULT_PORTAL_URL)]
    pub portal_url: String,

    #[clap(long, env = "CLICKHOUSE_URL", default_value = DEFAULT_CLICKHOUSE_URL)]
    pub clickhouse_url: String,

    #[clap(long, env = "CLICKHOUSE_DATABASE", default_value = "default")]
    pub clickhouse_database: String,

    #[clap(long, env = "CLICKHOUSE_USERNAME", default_value = "default")]
    pub clickhouse_username: String,

    #[clap(long, env = "CLICKHOUSE_PASSWORD", default_value = "", hide_env_values = true)]
    pub clickhouse_password: String,

    /// First block to ingest (required)
    #[clap(long, env = "FROM_BLOCK")]
    pub from_block: Option<u64>,

    /// Last block to ingest, inclusive. Runs forever when absent
    #[clap(long, env = "TO_BLOCK")]
    pub to_block: Option<u64>,

    /// Pipe to run: blocks or instructions
    #[clap(long, env = "PIPE", default_value = "blocks")]
    pub pipe: String,

    /// Checkpoint key, defaults to the pipe name
    #[clap(long, env = "PIPE_ID")]
    pub pipe_id: Option<String>,

    /// Programs indexed by the instructions pipe
    #[clap(long, env = "PROGRAM_IDS", value_delimiter = ',')]
    pub program_ids: Vec<String>,

    /// Maximum blocks per batch
    #[clap(long, env = "BATCH_BLOCKS", default_value = "500")]
    pub batch_blocks: usize,

    #[clap(long, env = "POLL_INTERVAL_MS", default_value = "1000")]
    pub poll_interval_ms: u64,

    #[clap(long, env = "REQUEST_TIMEOUT_SECS", default_value = "60")]
    pub request_timeout_secs: u64,

    /// Attempts per operation, unbounded when absent
    #[clap(long, env = "RETRY_MAX_ATTEMPTS")]
    pub retry_max_attempts: Option<u32>,

    #[clap(long, env = "RETRY_BASE_DELAY_MS", default_value = "500")]
    pub retry_base_delay_ms: u64,

    #[clap(long, env = "RETRY_MAX_DELAY_MS", default_value = "30000")]
    pub retry_max_delay_ms: u64,

    #[clap(long, env = "RETRY_MULTIPLIER", default_value = "2.0")]
    pub retry_multiplier: f64,

    #[clap(long, env = "RETRY_JITTER", default_value = "0.1")]
    pub retry_jitter: f64,

    /// Postgres URL for checkpoints; ClickHouse is used when absent
    #[clap(long, env = "CHECKPOINT_DATABASE_URL", hide_env_values = true)]
    pub checkpoint_database_url: Option<String>,
}

/// Process exit code for a failure of the given kind.
pub fn exit_code(kind: ErrorKind) -> u8 {
    match kind {
        ErrorKind::Config => 2,
        _ => 1,
    }
}

/// Cancels `cancel` on Ctrl+C or SIGTERM.
pub fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            match signal(SignalKind::terminate()) {
                Ok(mut terminate) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {}
                        _ = terminate.recv() => {}
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Cannot listen for SIGTERM, only Ctrl+C will stop the indexer");
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }

        tracing::info!("Shutdown signal received, finishing the current batch...");
        cancel.cancel();
    });
}

/// Connects every collaborator and runs the configured pipe to completion.
pub async fn start_indexer(config: IndexerConfig, cancel: CancellationToken) -> Result<IngestionReport> {
    let clickhouse = repositories::init_clickhouse(&config.clickhouse)
        .await
        .wrap_err("failed to connect to ClickHouse")?;
    let portal = HttpPortalClient::new(config.portal.clone())?;

    let store: Arc<dyn CheckpointStore> = match &config.checkpoint {
        CheckpointBackend::Clickhouse => {
            let store = ClickhouseCheckpointStore::new(clickhouse.clone());
            store.initialize().await.wrap_err("failed to create sync_status table")?;
            Arc::new(store)
        }
        CheckpointBackend::Postgres { url } => {
            let store = PgCheckpointStore::connect(url)
                .await
                .wrap_err("failed to connect to the checkpoint database")?;
            if let Err(e) = store.initialize().await {
                store.close().await;
                return Err(eyre::Report::new(e).wrap_err("failed to create checkpoint table"));
            }
            Arc::new(store)
        }
    };

    match portal.head().await {
        Ok(head) => tracing::info!(head = head.number, hash = %head.hash, "Portal head"),
        Err(e) => tracing::warn!(error = %e, "Could not read portal head"),
    }

    match &config.pipe.kind {
        PipeKind::Blocks => {
            let pipe = BlocksPipe::new(config.pipe.id.clone());
            run_pipe(pipe, &config, portal, clickhouse, store, cancel).await
        }
        PipeKind::Instructions { program_ids } => {
            let pipe = InstructionsPipe::new(config.pipe.id.clone(), program_ids.clone());
            run_pipe(pipe, &config, portal, clickhouse, store, cancel).await
        }
    }
}

async fn run_pipe<P>(
    pipe: P,
    config: &IndexerConfig,
    portal: HttpPortalClient,
    clickhouse: clickhouse::Client,
    store: Arc<dyn CheckpointStore>,
    cancel: CancellationToken,
) -> Result<IngestionReport>
where
    P: Pipe,
    P::Row: Row + Serialize,
{
    let sink = ClickhouseSink::<P::Row>::new(clickhouse, pipe.table());
    if let Err(e) = sink.ensure_table(&pipe.create_table_sql()).await {
        store.close().await;
        return Err(eyre::Report::new(e).wrap_err(format!("failed to create table {}", sink.table())));
    }

    let cursor = BlockRangeCursor::new(pipe.id(), config.pipe.range, store);
    let ingestion = IngestionLoop::new(
        pipe,
        Arc::new(portal),
        Arc::new(sink),
        cursor,
        RetryPolicy::new(config.retry.clone()),
        cancel,
    );

    let report = ingestion.run().await;
    Ok(report.into_result()?)
}

/// Exit code for an error reported by [`start_indexer`].
pub fn exit_code_for_report(report: &eyre::Report) -> u8 {
    report
        .chain()
        .find_map(|cause| cause.downcast_ref::<IndexerError>())
        .map_or(1, |err| exit_code(err.kind()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct TrackedStore {
        closed: AtomicBool,
    }

    #[async_trait]
    impl CheckpointStore for TrackedStore {
        async fn get(&self, _pipe_id: &str) -> utils::error::Result<Option<u64>> {
            Ok(None)
        }

        async fn set(&self, _pipe_id: &str, _block_number: u64) -> utils::error::Result<()> {
            Ok(())
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_store_closed_when_table_setup_fails() {
        let args = AppArgs::try_parse_from(["portal-indexer", "--from-block", "1"]).unwrap();
        let config = IndexerConfig::from_args(&args).unwrap();
        let store = Arc::new(TrackedStore::default());
        // nothing listens on port 1
        let clickhouse = clickhouse::Client::default().with_url("http://127.0.0.1:1");
        let portal = HttpPortalClient::new(config.portal.clone()).unwrap();

        let result = run_pipe(
            BlocksPipe::new("blocks"),
            &config,
            portal,
            clickhouse,
            store.clone(),
            CancellationToken::new(),
        )
        .await;

        let report = result.unwrap_err();
        assert!(report.to_string().contains("solana_blocks"));
        assert!(store.closed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code(ErrorKind::Config), 2);
        assert_eq!(exit_code(ErrorKind::Data), 1);
        assert_eq!(exit_code(ErrorKind::Transient), 1);
    }

    #[test]
    fn test_exit_code_through_wrapped_report() {
        let report = eyre::Report::new(IndexerError::Config("bad".into())).wrap_err("startup");
        assert_eq!(exit_code_for_report(&report), 2);

        let report = eyre::Report::new(IndexerError::Data("rejected".into()));
        assert_eq!(exit_code_for_report(&report), 1);
    }
}
