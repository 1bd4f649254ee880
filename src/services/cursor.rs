use std::sync::Arc;

use crate::models::BlockRange;
use crate::repositories::checkpoints::CheckpointStore;
use crate::utils::error::{IndexerError, Result};

/// Next block to ingest for one pipe, backed by a checkpoint store.
///
/// The store holds the last committed block; the cursor holds that value + 1.
pub struct BlockRangeCursor {
    pipe_id: String,
    configured: BlockRange,
    store: Arc<dyn CheckpointStore>,
    next_block: u64,
}

impl BlockRangeCursor {
    pub fn new(pipe_id: impl Into<String>, configured: BlockRange, store: Arc<dyn CheckpointStore>) -> Self {
        Self {
            pipe_id: pipe_id.into(),
            next_block: configured.from,
            configured,
            store,
        }
    }

    pub fn configured(&self) -> BlockRange {
        self.configured
    }

    /// Restores the position: the block after the checkpoint, unless the
    /// configured start is further ahead.
    pub async fn load(&mut self) -> Result<u64> {
        let checkpoint = self.store.get(&self.pipe_id).await?;
        let resumed = checkpoint.map(|last| last.saturating_add(1));

        self.next_block = match resumed {
            Some(next) if next >= self.configured.from => {
                tracing::info!(pipe = %self.pipe_id, checkpoint = next - 1, "Resuming from checkpoint");
                next
            }
            Some(next) => {
                tracing::info!(
                    pipe = %self.pipe_id,
                    checkpoint = next - 1,
                    from = self.configured.from,
                    "Configured start is ahead of checkpoint, seeking forward"
                );
                self.configured.from
            }
            None => self.configured.from,
        };
        Ok(self.next_block)
    }

    pub fn current(&self) -> u64 {
        self.next_block
    }

    /// Moves the cursor to `to`. Moving backwards is refused.
    pub fn advance(&mut self, to: u64) -> Result<()> {
        if to < self.next_block {
            return Err(IndexerError::Protocol(format!(
                "cursor for pipe {} cannot move back from {} to {}",
                self.pipe_id, self.next_block, to
            )));
        }
        self.next_block = to;
        Ok(())
    }

    /// Persists `last_committed` as the pipe checkpoint.
    pub async fn save(&self, last_committed: u64) -> Result<()> {
        self.store.set(&self.pipe_id, last_committed).await
    }

    /// Range still to be ingested, `None` once a bounded range is consumed.
    pub fn remaining(&self) -> Option<BlockRange> {
        self.configured.starting_at(self.next_block)
    }

    pub fn is_complete(&self) -> bool {
        self.remaining().is_none()
    }

    pub async fn close(&self) {
        self.store.close().await;
    }
}
