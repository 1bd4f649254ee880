use std::marker::PhantomData;

use async_trait::async_trait;
use clickhouse::{Client, Row};
use serde::Serialize;

use crate::models::Batch;
use crate::utils::error::Result;

/// Destination for decoded batches.
///
/// `write` commits the whole batch or nothing. Implementations never touch
/// the cursor; the ingestion loop advances it after a successful write.
#[async_trait]
pub trait ColumnarSink<R: Send + Sync>: Send + Sync {
    async fn write(&self, batch: &Batch<R>) -> Result<()>;

    async fn close(&self) {}
}

pub struct ClickhouseSink<R> {
    client: Client,
    table: String,
    _row: PhantomData<fn(R)>,
}

impl<R> ClickhouseSink<R> {
    pub fn new(client: Client, table: impl Into<String>) -> Self {
        Self {
            client,
            table: table.into(),
            _row: PhantomData,
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub async fn ensure_table(&self, ddl: &str) -> Result<()> {
        self.client.query(ddl).execute().await?;
        tracing::info!(table = %self.table, "Sink table ready");
        Ok(())
    }
}

#[async_trait]
impl<R> ColumnarSink<R> for ClickhouseSink<R>
where
    R: Row + Serialize + Send + Sync + 'static,
{
    async fn write(&self, batch: &Batch<R>) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        // a single INSERT; dropping it before end() aborts the whole statement
        let mut insert = self.client.insert::<R>(&self.table)?;
        for row in &batch.rows {
            insert.write(row).await?;
        }
        insert.end().await?;

        tracing::debug!(
            table = %self.table,
            range = %batch.range,
            rows = batch.rows.len(),
            "Batch committed"
        );
        Ok(())
    }
}
