//! Tracing setup and startup logging.

use std::sync::OnceLock;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::utils::config::{CheckpointBackend, IndexerConfig, PipeKind};

const DEFAULT_FILTER: &str = "info,portal_indexer=info";

static LOGGING_INIT: OnceLock<()> = OnceLock::new();

/// Installs the global subscriber. `RUST_LOG` overrides the default filter.
/// Later calls are no-ops.
pub fn init_logging() {
    LOGGING_INIT.get_or_init(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(true))
            .init();
    });
}

/// Strips credentials from a URL before it is logged.
pub fn redact_url(raw: &str) -> String {
    match reqwest::Url::parse(raw) {
        Ok(mut url) => {
            if url.password().is_some() {
                let _ = url.set_password(Some("[REDACTED]"));
            }
            url.to_string()
        }
        Err(_) => raw.to_string(),
    }
}

pub fn log_startup(config: &IndexerConfig) {
    let program_ids = match &config.pipe.kind {
        PipeKind::Instructions { program_ids } => program_ids.join(","),
        PipeKind::Blocks => String::new(),
    };
    let checkpoint = match &config.checkpoint {
        CheckpointBackend::Clickhouse => "clickhouse".to_string(),
        CheckpointBackend::Postgres { url } => redact_url(url),
    };

    tracing::info!(
        pipe = %config.pipe.id,
        kind = config.pipe.kind.name(),
        program_ids = %program_ids,
        range = %config.pipe.range,
        portal_url = %redact_url(&config.portal.url),
        clickhouse_url = %redact_url(&config.clickhouse.url),
        clickhouse_database = %config.clickhouse.database,
        clickhouse_username = %config.clickhouse.username,
        checkpoint = %checkpoint,
        batch_blocks = config.portal.batch_blocks,
        "Portal indexer startup"
    );
}
