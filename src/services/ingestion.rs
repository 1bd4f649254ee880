//! Sequential fetch → decode → write → advance loop for one pipe.
//!
//! States: `Starting → Streaming → Draining → Stopped`, or `Failed` on a
//! fatal or retry-exhausted error. Cancellation is observed while fetching
//! and while backing off, never during a sink write or a checkpoint save.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::models::BlockRange;
use crate::repositories::sink::ColumnarSink;
use crate::services::cursor::BlockRangeCursor;
use crate::services::pipes::Pipe;
use crate::services::portal::{BlockStream, PortalStreamClient};
use crate::utils::error::{IndexerError, Result};
use crate::utils::retry::{RetryConfig, RetryPolicy};

/// Attempts spent on persisting one checkpoint before moving on.
const CHECKPOINT_SAVE_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Starting,
    Streaming,
    Draining,
    Stopped,
    Failed,
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoopState::Starting => "starting",
            LoopState::Streaming => "streaming",
            LoopState::Draining => "draining",
            LoopState::Stopped => "stopped",
            LoopState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
pub struct IngestionReport {
    pub state: LoopState,
    pub error: Option<IndexerError>,
    pub batches: u64,
    pub rows: u64,
    /// Backoffs taken across fetches, writes and checkpoint saves.
    pub retries: u32,
    /// Committed batches whose checkpoint could not be persisted.
    pub unpersisted_checkpoints: u32,
    /// Cursor position when the loop ended.
    pub next_block: u64,
}

impl IngestionReport {
    fn new() -> Self {
        Self {
            state: LoopState::Starting,
            error: None,
            batches: 0,
            rows: 0,
            retries: 0,
            unpersisted_checkpoints: 0,
            next_block: 0,
        }
    }

    fn count_retry(&mut self) {
        self.retries = self.retries.saturating_add(1);
    }

    pub fn into_result(mut self) -> Result<Self> {
        match self.error.take() {
            Some(err) => Err(err),
            None => Ok(self),
        }
    }
}

pub struct IngestionLoop<P: Pipe> {
    pipe: P,
    portal: Arc<dyn PortalStreamClient>,
    sink: Arc<dyn ColumnarSink<P::Row>>,
    cursor: BlockRangeCursor,
    retry: RetryPolicy,
    checkpoint_retry: RetryPolicy,
    cancel: CancellationToken,
}

impl<P: Pipe> IngestionLoop<P> {
    pub fn new(
        pipe: P,
        portal: Arc<dyn PortalStreamClient>,
        sink: Arc<dyn ColumnarSink<P::Row>>,
        cursor: BlockRangeCursor,
        retry: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        let checkpoint_retry = RetryPolicy::new(RetryConfig {
            max_attempts: Some(
                retry
                    .config()
                    .max_attempts
                    .map_or(CHECKPOINT_SAVE_ATTEMPTS, |n| n.min(CHECKPOINT_SAVE_ATTEMPTS)),
            ),
            ..retry.config().clone()
        });

        Self {
            pipe,
            portal,
            sink,
            cursor,
            retry,
            checkpoint_retry,
            cancel,
        }
    }

    /// Runs until the configured range is consumed, cancellation, or a fatal
    /// error. The portal stream, sink and checkpoint store are closed on every
    /// exit path.
    pub async fn run(mut self) -> IngestionReport {
        let mut report = IngestionReport::new();
        self.log_state(&report);

        let mut stream: Option<Box<dyn BlockStream>> = None;
        let result = self.drive(&mut report, &mut stream).await;

        if let Some(mut stream) = stream {
            stream.close().await;
        }
        self.sink.close().await;
        self.cursor.close().await;

        report.next_block = self.cursor.current();
        match result {
            Ok(()) | Err(IndexerError::Cancelled) => {
                self.set_state(&mut report, LoopState::Stopped);
                tracing::info!(
                    pipe = %self.pipe.id(),
                    batches = report.batches,
                    rows = report.rows,
                    next_block = report.next_block,
                    "Ingestion stopped"
                );
            }
            Err(err) => {
                tracing::error!(
                    pipe = %self.pipe.id(),
                    kind = %err.kind(),
                    error = %err,
                    next_block = report.next_block,
                    "Ingestion failed"
                );
                report.error = Some(err);
                self.set_state(&mut report, LoopState::Failed);
            }
        }
        report
    }

    async fn drive(
        &mut self,
        report: &mut IngestionReport,
        stream_slot: &mut Option<Box<dyn BlockStream>>,
    ) -> Result<()> {
        let configured = self.cursor.configured();
        BlockRange::new(configured.from, configured.to)?;

        let mut load_retry = self.retry.begin();
        let start = loop {
            match self.cursor.load().await {
                Ok(start) => break start,
                Err(err) => {
                    load_retry.backoff(err, &self.cancel).await?;
                    report.count_retry();
                }
            }
        };

        let Some(remaining) = self.cursor.remaining() else {
            tracing::info!(pipe = %self.pipe.id(), next_block = start, "Range already ingested");
            self.set_state(report, LoopState::Draining);
            return Ok(());
        };

        let portal = &self.portal;
        let query = self.pipe.query();
        let stream = self
            .retry
            .execute_observed(
                &self.cancel,
                move || portal.open(remaining, query.clone()),
                |_| report.count_retry(),
            )
            .await?;
        let stream = stream_slot.insert(stream);

        tracing::info!(pipe = %self.pipe.id(), range = %remaining, "Streaming from portal");
        self.set_state(report, LoopState::Streaming);

        loop {
            let fetch_started = Instant::now();

            let mut fetch_retry = self.retry.begin();
            let fetched = loop {
                let attempt = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => None,
                    res = stream.next_batch() => Some(res),
                };
                match attempt {
                    None => {
                        tracing::info!(pipe = %self.pipe.id(), "Cancellation received, draining");
                        self.set_state(report, LoopState::Draining);
                        return Ok(());
                    }
                    Some(Ok(batch)) => break batch,
                    Some(Err(err)) => match fetch_retry.backoff(err, &self.cancel).await {
                        Ok(_) => report.count_retry(),
                        Err(IndexerError::Cancelled) => {
                            self.set_state(report, LoopState::Draining);
                            return Ok(());
                        }
                        Err(err) => return Err(err),
                    },
                }
            };

            let Some(raw) = fetched else {
                if !remaining.is_bounded() {
                    return Err(IndexerError::Protocol(format!(
                        "portal stream over {remaining} ended at block {}",
                        self.cursor.current()
                    )));
                }
                self.set_state(report, LoopState::Draining);
                return Ok(());
            };

            if raw.first_block() != self.cursor.current() {
                return Err(IndexerError::Protocol(format!(
                    "portal batch starts at block {} but the cursor is at {}",
                    raw.first_block(),
                    self.cursor.current()
                )));
            }

            let last = raw.last_block();
            let blocks = raw.blocks.len();
            let batch = self.pipe.decode(raw)?;
            let rows = batch.rows.len();

            // an in-flight write is never interrupted; only its backoff observes cancellation
            let sink = &self.sink;
            let written = self
                .retry
                .execute_observed(&self.cancel, || sink.write(&batch), |_| report.count_retry())
                .await;
            match written {
                Ok(()) => {}
                Err(IndexerError::Cancelled) => {
                    self.set_state(report, LoopState::Draining);
                    return Ok(());
                }
                Err(err) => return Err(err),
            }

            self.cursor.advance(last.saturating_add(1))?;
            report.batches += 1;
            report.rows += rows as u64;

            self.persist(report, last).await;

            tracing::info!(
                pipe = %self.pipe.id(),
                range = %batch.range,
                blocks,
                rows,
                elapsed_ms = fetch_started.elapsed().as_millis() as u64,
                "Batch ingested"
            );

            if self.cursor.is_complete() {
                self.set_state(report, LoopState::Draining);
                return Ok(());
            }
        }
    }

    /// Saves the checkpoint. Runs to completion regardless of cancellation so
    /// that a committed batch is not reprocessed after a restart.
    async fn persist(&self, report: &mut IngestionReport, last_committed: u64) {
        let never = CancellationToken::new();
        let cursor = &self.cursor;
        let saved = self
            .checkpoint_retry
            .execute_observed(&never, || cursor.save(last_committed), |_| report.count_retry())
            .await;

        if let Err(err) = saved {
            report.unpersisted_checkpoints += 1;
            tracing::warn!(
                pipe = %self.pipe.id(),
                block = last_committed,
                error = %err,
                "Checkpoint not persisted; blocks since the previous checkpoint will be re-ingested after a restart"
            );
        }
    }

    fn set_state(&self, report: &mut IngestionReport, state: LoopState) {
        report.state = state;
        self.log_state(report);
    }

    fn log_state(&self, report: &IngestionReport) {
        tracing::debug!(pipe = %self.pipe.id(), state = %report.state, "Ingestion state");
    }
}
