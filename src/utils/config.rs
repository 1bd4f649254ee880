//! Immutable runtime configuration.
//!
//! [`AppArgs`](crate::AppArgs) is parsed once by clap (flags fall back to
//! environment variables) and converted into an [`IndexerConfig`] that is
//! handed to every constructor. Components never read the environment.

use std::time::Duration;

use crate::models::BlockRange;
use crate::utils::error::{IndexerError, Result};
use crate::utils::retry::RetryConfig;
use crate::AppArgs;

pub const DEFAULT_PORTAL_URL: &str = "https://portal.sqd.dev/datasets/solana-mainnet";
pub const DEFAULT_CLICKHOUSE_URL: &str = "http://localhost:8123";

#[derive(Debug, Clone, PartialEq)]
pub struct ClickhouseConfig {
    pub url: String,
    pub database: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PortalConfig {
    pub url: String,
    /// Maximum number of blocks per emitted batch.
    pub batch_blocks: usize,
    /// Wait between polls when the portal has no new data.
    pub poll_interval: Duration,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipeKind {
    Blocks,
    Instructions { program_ids: Vec<String> },
}

impl PipeKind {
    pub fn name(&self) -> &'static str {
        match self {
            PipeKind::Blocks => "blocks",
            PipeKind::Instructions { .. } => "instructions",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipeConfig {
    /// Checkpoint key; defaults to the pipe kind name.
    pub id: String,
    pub kind: PipeKind,
    pub range: BlockRange,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CheckpointBackend {
    /// `sync_status` table in the target ClickHouse database.
    Clickhouse,
    Postgres { url: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexerConfig {
    pub portal: PortalConfig,
    pub clickhouse: ClickhouseConfig,
    pub pipe: PipeConfig,
    pub retry: RetryConfig,
    pub checkpoint: CheckpointBackend,
}

impl IndexerConfig {
    pub fn from_args(args: &AppArgs) -> Result<Self> {
        let from_block = args
            .from_block
            .ok_or_else(|| IndexerError::Config("FROM_BLOCK is not set".to_string()))?;
        let range = BlockRange::new(from_block, args.to_block)?;

        let kind = match args.pipe.as_str() {
            "blocks" => PipeKind::Blocks,
            "instructions" => {
                let program_ids: Vec<String> = args
                    .program_ids
                    .iter()
                    .map(|id| id.trim().to_string())
                    .filter(|id| !id.is_empty())
                    .collect();
                if program_ids.is_empty() {
                    return Err(IndexerError::Config(
                        "the instructions pipe requires PROGRAM_IDS".to_string(),
                    ));
                }
                PipeKind::Instructions { program_ids }
            }
            other => {
                return Err(IndexerError::Config(format!(
                    "unknown pipe '{other}' (expected 'blocks' or 'instructions')"
                )))
            }
        };

        if args.batch_blocks == 0 {
            return Err(IndexerError::Config("BATCH_BLOCKS must be at least 1".to_string()));
        }
        if !(0.0..=1.0).contains(&args.retry_jitter) {
            return Err(IndexerError::Config(format!(
                "RETRY_JITTER must be within [0, 1], got {}",
                args.retry_jitter
            )));
        }
        if !args.retry_multiplier.is_finite() || args.retry_multiplier < 1.0 {
            return Err(IndexerError::Config(format!(
                "RETRY_MULTIPLIER must be a finite number >= 1, got {}",
                args.retry_multiplier
            )));
        }
        if args.retry_max_attempts == Some(0) {
            return Err(IndexerError::Config("RETRY_MAX_ATTEMPTS must be at least 1".to_string()));
        }

        let checkpoint = match &args.checkpoint_database_url {
            Some(url) if !url.is_empty() => CheckpointBackend::Postgres { url: url.clone() },
            _ => CheckpointBackend::Clickhouse,
        };

        Ok(Self {
            portal: PortalConfig {
                url: args.portal_url.trim_end_matches('/').to_string(),
                batch_blocks: args.batch_blocks,
                poll_interval: Duration::from_millis(args.poll_interval_ms),
                request_timeout: Duration::from_secs(args.request_timeout_secs),
            },
            clickhouse: ClickhouseConfig {
                url: args.clickhouse_url.clone(),
                database: args.clickhouse_database.clone(),
                username: args.clickhouse_username.clone(),
                password: args.clickhouse_password.clone(),
            },
            pipe: PipeConfig {
                id: args.pipe_id.clone().unwrap_or_else(|| kind.name().to_string()),
                kind,
                range,
            },
            retry: RetryConfig {
                max_attempts: args.retry_max_attempts,
                base_delay: Duration::from_millis(args.retry_base_delay_ms),
                multiplier: args.retry_multiplier,
                max_delay: Duration::from_millis(args.retry_max_delay_ms),
                jitter: args.retry_jitter,
            },
            checkpoint,
        })
    }
}
