//! Block source backed by an SQD portal.
//!
//! `POST {portal}/stream` answers with one JSON block per line, in ascending
//! block order. A response may end before the requested range is exhausted;
//! the stream then re-requests from the next expected block. `204 No Content`
//! means the portal has nothing past the requested start yet.

use std::mem;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::StatusCode;
use serde_json::{json, Value};

use crate::models::{BlockBatch, BlockRange, PortalBlock, PortalHead};
use crate::utils::config::PortalConfig;
use crate::utils::error::{classify_status, IndexerError, Result};

const FINALIZED_HEAD_HEADER: &str = "x-sqd-finalized-head-number";

/// Lazy sequence of contiguous block batches.
#[async_trait]
pub trait BlockStream: Send {
    /// Next batch, starting exactly one block after the previous batch.
    ///
    /// `None` once a bounded range is exhausted; an open range never ends.
    /// After an error the stream resumes from its next expected block.
    async fn next_batch(&mut self) -> Result<Option<BlockBatch>>;

    async fn close(&mut self) {}
}

#[async_trait]
pub trait PortalStreamClient: Send + Sync {
    /// Opens a stream over `range`. `query` carries the pipe's field
    /// selection and filters.
    async fn open(&self, range: BlockRange, query: Value) -> Result<Box<dyn BlockStream>>;
}

#[derive(Clone)]
pub struct HttpPortalClient {
    http: reqwest::Client,
    config: PortalConfig,
}

impl HttpPortalClient {
    pub fn new(config: PortalConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.request_timeout)
            .build()
            .map_err(|e| IndexerError::Config(format!("cannot build portal HTTP client: {e}")))?;
        Ok(Self { http, config })
    }

    pub async fn head(&self) -> Result<PortalHead> {
        let response = self
            .http
            .get(format!("{}/head", self.config.url))
            .timeout(self.config.request_timeout)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), &text));
        }
        let body = response.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }
}

#[async_trait]
impl PortalStreamClient for HttpPortalClient {
    async fn open(&self, range: BlockRange, query: Value) -> Result<Box<dyn BlockStream>> {
        Ok(Box::new(HttpBlockStream {
            http: self.http.clone(),
            stream_url: format!("{}/stream", self.config.url),
            query,
            range,
            next_block: range.from,
            batch_blocks: self.config.batch_blocks.max(1),
            poll_interval: self.config.poll_interval,
            read_timeout: self.config.request_timeout,
            body: None,
            pending: Vec::new(),
        }))
    }
}

/// Incremental newline-delimited reader over a response body.
struct BodyReader {
    chunks: BoxStream<'static, reqwest::Result<Vec<u8>>>,
    buf: Vec<u8>,
    lines_read: usize,
}

impl BodyReader {
    fn new(response: reqwest::Response) -> Self {
        Self {
            chunks: response.bytes_stream().map(|chunk| chunk.map(|b| b.to_vec())).boxed(),
            buf: Vec::new(),
            lines_read: 0,
        }
    }

    async fn next_line(&mut self, read_timeout: Duration) -> Result<Option<Vec<u8>>> {
        loop {
            if let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = self.buf.drain(..=pos).collect();
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                self.lines_read += 1;
                return Ok(Some(line));
            }

            match tokio::time::timeout(read_timeout, self.chunks.next()).await {
                Err(_) => {
                    return Err(IndexerError::Transient(format!(
                        "portal stream stalled for {}s",
                        read_timeout.as_secs()
                    )))
                }
                Ok(Some(Ok(chunk))) => self.buf.extend_from_slice(&chunk),
                Ok(Some(Err(e))) => return Err(e.into()),
                Ok(None) => {
                    if self.buf.iter().all(u8::is_ascii_whitespace) {
                        return Ok(None);
                    }
                    self.lines_read += 1;
                    return Ok(Some(mem::take(&mut self.buf)));
                }
            }
        }
    }
}

struct HttpBlockStream {
    http: reqwest::Client,
    stream_url: String,
    query: Value,
    range: BlockRange,
    /// First block of the batch being assembled.
    next_block: u64,
    batch_blocks: usize,
    poll_interval: Duration,
    read_timeout: Duration,
    body: Option<BodyReader>,
    /// Blocks read for the current batch; kept on the stream so that a
    /// dropped `next_batch` future loses nothing.
    pending: Vec<PortalBlock>,
}

impl HttpBlockStream {
    fn request_body(&self, from: u64) -> Value {
        let mut body = match &self.query {
            Value::Object(map) => map.clone(),
            _ => serde_json::Map::new(),
        };
        body.entry("type").or_insert_with(|| json!("solana"));
        body.insert("fromBlock".to_string(), json!(from));
        if let Some(to) = self.range.to {
            body.insert("toBlock".to_string(), json!(to));
        }
        Value::Object(body)
    }

    /// Sends a stream request; `None` when the portal has no data yet.
    ///
    /// Takes owned parts so the returned future does not borrow the stream.
    async fn request(
        http: reqwest::Client,
        url: String,
        body: Value,
        from: u64,
        timeout: Duration,
    ) -> Result<Option<BodyReader>> {
        let response = tokio::time::timeout(timeout, http.post(&url).json(&body).send())
            .await
            .map_err(|_| {
                IndexerError::Transient(format!(
                    "portal did not answer within {}s",
                    timeout.as_secs()
                ))
            })??;

        let status = response.status();
        if status == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), &text));
        }

        if let Some(head) = response.headers().get(FINALIZED_HEAD_HEADER) {
            tracing::debug!(from, finalized_head = ?head, "Portal stream opened");
        }
        Ok(Some(BodyReader::new(response)))
    }

    fn expected_next(&self) -> u64 {
        self.pending
            .last()
            .map_or(self.next_block, |block| block.number().saturating_add(1))
    }

    fn accept(&mut self, block: PortalBlock) -> Result<()> {
        let number = block.number();
        let expected = self.expected_next();
        if number < expected {
            return Err(IndexerError::Protocol(format!(
                "portal returned block {number} out of order, expected {expected} or later"
            )));
        }
        if !self.range.contains(number) {
            return Err(IndexerError::Protocol(format!(
                "portal returned block {number} outside of requested range {}",
                self.range
            )));
        }
        self.pending.push(block);
        Ok(())
    }

    /// Emits the pending blocks as a batch ending at `to`.
    fn cut(&mut self, to: u64) -> BlockBatch {
        let range = BlockRange {
            from: self.next_block,
            to: Some(to),
        };
        self.next_block = to.saturating_add(1);
        BlockBatch {
            range,
            blocks: mem::take(&mut self.pending),
        }
    }

    fn reset(&mut self) {
        self.body = None;
        self.pending.clear();
    }

    async fn read_batch(&mut self) -> Result<Option<BlockBatch>> {
        loop {
            let Some(remaining) = self.range.starting_at(self.next_block) else {
                self.body = None;
                return Ok(None);
            };

            if self.body.is_none() {
                let from = self.expected_next();
                let request = Self::request(
                    self.http.clone(),
                    self.stream_url.clone(),
                    self.request_body(from),
                    from,
                    self.read_timeout,
                );
                match request.await? {
                    Some(body) => self.body = Some(body),
                    None => {
                        tracing::debug!(from, "Portal has no new blocks yet");
                        tokio::time::sleep(self.poll_interval).await;
                        continue;
                    }
                }
            }
            let read_timeout = self.read_timeout;
            let Some(body) = self.body.as_mut() else {
                continue;
            };

            match body.next_line(read_timeout).await? {
                Some(line) => {
                    let block: PortalBlock = serde_json::from_slice(&line)?;
                    self.accept(block)?;
                    if self.pending.len() >= self.batch_blocks {
                        let last = self.expected_next() - 1;
                        return Ok(Some(self.cut(last)));
                    }
                }
                None => {
                    let had_data = body.lines_read > 0;
                    self.body = None;

                    if !self.pending.is_empty() {
                        let last = self.expected_next() - 1;
                        return Ok(Some(self.cut(last)));
                    }
                    if had_data {
                        // response ended on a batch boundary, continue with a new request
                        continue;
                    }
                    match remaining.to {
                        // nothing left in the range: close it with an empty batch
                        Some(to) => return Ok(Some(self.cut(to))),
                        None => {
                            tokio::time::sleep(self.poll_interval).await;
                        }
                    }
                }
            }
        }
    }
}

#[async_trait]
impl BlockStream for HttpBlockStream {
    async fn next_batch(&mut self) -> Result<Option<BlockBatch>> {
        let result = self.read_batch().await;
        if result.is_err() {
            self.reset();
        }
        result
    }

    async fn close(&mut self) {
        self.reset();
    }
}
