#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use portal_indexer::models::{Batch, BlockBatch, BlockHeader, BlockRange, BlockRow, PortalBlock};
use portal_indexer::repositories::checkpoints::CheckpointStore;
use portal_indexer::repositories::sink::ColumnarSink;
use portal_indexer::services::portal::{BlockStream, PortalStreamClient};
use portal_indexer::utils::error::{IndexerError, Result};
use portal_indexer::utils::retry::RetryConfig;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

pub fn fast_retry(max_attempts: Option<u32>) -> RetryConfig {
    RetryConfig {
        max_attempts,
        base_delay: Duration::from_millis(10),
        multiplier: 2.0,
        max_delay: Duration::from_millis(100),
        jitter: 0.0,
    }
}

pub fn portal_block(number: u64) -> PortalBlock {
    PortalBlock {
        header: BlockHeader {
            number,
            hash: format!("hash-{number}"),
            parent_number: Some(number.saturating_sub(1)),
            parent_hash: Some(format!("hash-{}", number.saturating_sub(1))),
            height: Some(number),
            timestamp: Some(1_700_000_000),
        },
        transactions: vec![],
        instructions: vec![],
    }
}

/// Portal that serves every block of the requested range in fixed-size
/// batches, after first returning the queued failures.
pub struct GeneratedPortal {
    batch_blocks: u64,
    failures: Arc<Mutex<VecDeque<IndexerError>>>,
    pub opened: Mutex<Vec<BlockRange>>,
}

impl GeneratedPortal {
    pub fn new(batch_blocks: u64) -> Self {
        Self {
            batch_blocks,
            failures: Arc::new(Mutex::new(VecDeque::new())),
            opened: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_with(self, failures: Vec<IndexerError>) -> Self {
        self.failures.lock().unwrap().extend(failures);
        self
    }

    pub fn opened(&self) -> Vec<BlockRange> {
        self.opened.lock().unwrap().clone()
    }
}

#[async_trait]
impl PortalStreamClient for GeneratedPortal {
    async fn open(&self, range: BlockRange, _query: Value) -> Result<Box<dyn BlockStream>> {
        self.opened.lock().unwrap().push(range);
        Ok(Box::new(GeneratedStream {
            range,
            next: range.from,
            batch_blocks: self.batch_blocks,
            failures: self.failures.clone(),
        }))
    }
}

struct GeneratedStream {
    range: BlockRange,
    next: u64,
    batch_blocks: u64,
    failures: Arc<Mutex<VecDeque<IndexerError>>>,
}

#[async_trait]
impl BlockStream for GeneratedStream {
    async fn next_batch(&mut self) -> Result<Option<BlockBatch>> {
        if let Some(err) = self.failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        let Some(remaining) = self.range.starting_at(self.next) else {
            return Ok(None);
        };
        let mut to = self.next + self.batch_blocks - 1;
        if let Some(end) = remaining.to {
            to = to.min(end);
        }
        let blocks = (self.next..=to).map(portal_block).collect();
        let range = BlockRange::bounded(self.next, to)?;
        self.next = to + 1;
        Ok(Some(BlockBatch { range, blocks }))
    }
}

/// Portal whose single stream replays a fixed list of batches.
pub struct ScriptedPortal {
    batches: Mutex<Option<Vec<BlockBatch>>>,
}

impl ScriptedPortal {
    pub fn new(batches: Vec<BlockBatch>) -> Self {
        Self {
            batches: Mutex::new(Some(batches)),
        }
    }
}

#[async_trait]
impl PortalStreamClient for ScriptedPortal {
    async fn open(&self, _range: BlockRange, _query: Value) -> Result<Box<dyn BlockStream>> {
        let batches = self.batches.lock().unwrap().take().unwrap_or_default();
        Ok(Box::new(ScriptedStream {
            batches: batches.into(),
        }))
    }
}

struct ScriptedStream {
    batches: VecDeque<BlockBatch>,
}

#[async_trait]
impl BlockStream for ScriptedStream {
    async fn next_batch(&mut self) -> Result<Option<BlockBatch>> {
        Ok(self.batches.pop_front())
    }
}

/// Portal whose streams never produce a batch.
#[derive(Default)]
pub struct StalledPortal;

#[async_trait]
impl PortalStreamClient for StalledPortal {
    async fn open(&self, _range: BlockRange, _query: Value) -> Result<Box<dyn BlockStream>> {
        Ok(Box::new(StalledStream))
    }
}

struct StalledStream;

#[async_trait]
impl BlockStream for StalledStream {
    async fn next_batch(&mut self) -> Result<Option<BlockBatch>> {
        std::future::pending().await
    }
}

/// Sink that keeps committed batches in memory, keyed rows included.
#[derive(Default)]
pub struct MemorySink {
    committed: Mutex<Vec<Batch<BlockRow>>>,
    /// Upserted by block number, like a ReplacingMergeTree after merges.
    rows: Mutex<BTreeMap<u64, BlockRow>>,
    failures: Mutex<VecDeque<IndexerError>>,
    always_fail: Mutex<Option<fn() -> IndexerError>>,
    cancel_after: Mutex<Option<(usize, CancellationToken)>>,
    pub attempts: AtomicU32,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_with(self, failures: Vec<IndexerError>) -> Self {
        self.failures.lock().unwrap().extend(failures);
        self
    }

    pub fn always_failing(self, make: fn() -> IndexerError) -> Self {
        *self.always_fail.lock().unwrap() = Some(make);
        self
    }

    /// Cancels `token` right after the `n`-th successful commit.
    pub fn cancel_after(self, n: usize, token: CancellationToken) -> Self {
        *self.cancel_after.lock().unwrap() = Some((n, token));
        self
    }

    pub fn committed(&self) -> Vec<Batch<BlockRow>> {
        self.committed.lock().unwrap().clone()
    }

    pub fn committed_blocks(&self) -> Vec<u64> {
        self.committed()
            .iter()
            .flat_map(|batch| batch.rows.iter().map(|row| row.number))
            .collect()
    }

    pub fn row_set(&self) -> BTreeMap<u64, BlockRow> {
        self.rows.lock().unwrap().clone()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ColumnarSink<BlockRow> for MemorySink {
    async fn write(&self, batch: &Batch<BlockRow>) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(make) = *self.always_fail.lock().unwrap() {
            return Err(make());
        }
        if let Some(err) = self.failures.lock().unwrap().pop_front() {
            return Err(err);
        }

        let mut rows = self.rows.lock().unwrap();
        for row in &batch.rows {
            rows.insert(row.number, row.clone());
        }
        let mut committed = self.committed.lock().unwrap();
        committed.push(batch.clone());

        if let Some((n, token)) = self.cancel_after.lock().unwrap().as_ref() {
            if committed.len() >= *n {
                token.cancel();
            }
        }
        Ok(())
    }
}

/// Checkpoint store whose writes always fail.
#[derive(Default)]
pub struct BrokenCheckpointStore {
    pub set_calls: AtomicU32,
}

#[async_trait]
impl CheckpointStore for BrokenCheckpointStore {
    async fn get(&self, _pipe_id: &str) -> Result<Option<u64>> {
        Ok(None)
    }

    async fn set(&self, _pipe_id: &str, _block_number: u64) -> Result<()> {
        self.set_calls.fetch_add(1, Ordering::SeqCst);
        Err(IndexerError::Transient("checkpoint database unreachable".into()))
    }
}
