//! Durable per-pipe progress.
//!
//! Every store keeps the **last committed block number** for a pipe id.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use clickhouse::{Client, Row};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use tokio::sync::Mutex;

use crate::utils::error::{IndexerError, Result};

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn get(&self, pipe_id: &str) -> Result<Option<u64>>;
    async fn set(&self, pipe_id: &str, block_number: u64) -> Result<()>;

    /// Releases connections held by the store.
    async fn close(&self) {}
}

// ClickHouse

#[derive(Debug, Row, Serialize, Deserialize)]
struct SyncStatusRow {
    id: String,
    block_number: u64,
}

pub struct ClickhouseCheckpointStore {
    client: Client,
}

impl ClickhouseCheckpointStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Creates the `sync_status` table if it does not exist.
    pub async fn initialize(&self) -> Result<()> {
        // block_number is the replacing version, so a merge keeps the furthest checkpoint
        self.client
            .query(
                r"
                CREATE TABLE IF NOT EXISTS sync_status (
                    id String,
                    block_number UInt64,
                    updated_at DateTime64(3) DEFAULT now64(3)
                )
                ENGINE = ReplacingMergeTree(block_number)
                ORDER BY id
                ",
            )
            .execute()
            .await?;
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for ClickhouseCheckpointStore {
    async fn get(&self, pipe_id: &str) -> Result<Option<u64>> {
        let row = self
            .client
            .query("SELECT ?fields FROM sync_status FINAL WHERE id = ? LIMIT 1")
            .bind(pipe_id)
            .fetch_optional::<SyncStatusRow>()
            .await?;
        Ok(row.map(|r| r.block_number))
    }

    async fn set(&self, pipe_id: &str, block_number: u64) -> Result<()> {
        let mut insert = self.client.insert::<SyncStatusRow>("sync_status")?;
        insert
            .write(&SyncStatusRow {
                id: pipe_id.to_string(),
                block_number,
            })
            .await?;
        insert.end().await?;
        Ok(())
    }
}

// Postgres

pub struct PgCheckpointStore {
    pool: PgPool,
}

impl PgCheckpointStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS indexer_checkpoints (
                pipe_id TEXT PRIMARY KEY,
                block_number BIGINT NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            ",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for PgCheckpointStore {
    async fn get(&self, pipe_id: &str) -> Result<Option<u64>> {
        let value: Option<i64> =
            sqlx::query_scalar("SELECT block_number FROM indexer_checkpoints WHERE pipe_id = $1")
                .bind(pipe_id)
                .fetch_optional(&self.pool)
                .await?;

        value
            .map(|n| {
                u64::try_from(n).map_err(|_| {
                    IndexerError::Data(format!("negative checkpoint {n} stored for pipe {pipe_id}"))
                })
            })
            .transpose()
    }

    async fn set(&self, pipe_id: &str, block_number: u64) -> Result<()> {
        let value = i64::try_from(block_number)
            .map_err(|_| IndexerError::Data(format!("block {block_number} exceeds BIGINT")))?;

        sqlx::query(
            r"
            INSERT INTO indexer_checkpoints (pipe_id, block_number, updated_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (pipe_id)
            DO UPDATE SET block_number = EXCLUDED.block_number, updated_at = EXCLUDED.updated_at
            ",
        )
        .bind(pipe_id)
        .bind(value)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

// In-process

#[derive(Default)]
pub struct MemoryCheckpointStore {
    values: Mutex<HashMap<String, u64>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_checkpoint(pipe_id: &str, block_number: u64) -> Self {
        let mut values = HashMap::new();
        values.insert(pipe_id.to_string(), block_number);
        Self {
            values: Mutex::new(values),
        }
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn get(&self, pipe_id: &str) -> Result<Option<u64>> {
        Ok(self.values.lock().await.get(pipe_id).copied())
    }

    async fn set(&self, pipe_id: &str, block_number: u64) -> Result<()> {
        self.values.lock().await.insert(pipe_id.to_string(), block_number);
        Ok(())
    }
}
